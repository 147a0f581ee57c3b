#![expect(clippy::print_stdout, reason = "CLI output goes to stdout")]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use huddle_client_core::{ClientConfig, CredentialPair, MemoryCredentialStore};
use huddle_socket::ConnectionState;
use huddle_sync::{
    ClientContext, HttpQueryFetcher, MembershipChange, QueryFetcher, QueryKey, SyncError,
};
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Inspect and drive Huddle entities over HTTP and the realtime socket")]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// Access token installed before the first request.
    #[arg(long, env = "HUDDLE_ACCESS_TOKEN", global = true, hide_env_values = true)]
    access_token: Option<String>,
    /// Refresh token persisted in the in-memory credential store.
    #[arg(long, env = "HUDDLE_REFRESH_TOKEN", global = true, hide_env_values = true)]
    refresh_token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow an entity's realtime topic and print every cache change.
    Watch(EntityArgs),
    /// Join an entity with an optimistic cache patch.
    Join(EntityArgs),
    /// Leave an entity with an optimistic cache patch.
    Leave(EntityArgs),
    /// Publish one JSON payload to a socket topic.
    Publish(PublishArgs),
}

#[derive(Args)]
struct EntityArgs {
    entity_id: String,
}

#[derive(Args)]
struct PublishArgs {
    topic: String,
    /// JSON payload; plain text is sent as a JSON string.
    payload: String,
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let context = build_context(&cli.session).await?;
    let result = match cli.command {
        Commands::Watch(args) => run_watch(&context, args).await,
        Commands::Join(args) => run_membership(&context, args, MembershipChange::Join).await,
        Commands::Leave(args) => run_membership(&context, args, MembershipChange::Leave).await,
        Commands::Publish(args) => run_publish(&context, args).await,
    };
    context.shutdown();
    result
}

async fn build_context(session: &SessionArgs) -> Result<ClientContext> {
    let config = ClientConfig::from_env().context("invalid HUDDLE_* configuration")?;
    info!(
        "api {} socket {}",
        config.api_base_url,
        config.resolved_socket_url().unwrap_or_default()
    );
    let store = match session.refresh_token.as_deref() {
        Some(refresh_token) => MemoryCredentialStore::with_refresh_token(refresh_token),
        None => MemoryCredentialStore::new(),
    };
    let context = ClientContext::new(config, Arc::new(store))?;
    if let Some(access_token) = session.access_token.as_deref() {
        context
            .sign_in(CredentialPair::new(
                access_token,
                session.refresh_token.clone(),
            ))
            .await?;
    }
    Ok(context)
}

/// Seed the cache with the entity's detail and participants.
async fn load_entity(context: &ClientContext, entity_id: &str) -> Result<()> {
    let fetcher = HttpQueryFetcher::new(context.pipeline().clone());
    for key in [
        QueryKey::entity_detail(entity_id),
        QueryKey::participants(entity_id),
    ] {
        match fetcher.fetch(&key, 1).await {
            Ok(Some(value)) => context.cache().insert(key, value),
            Ok(None) => {}
            Err(SyncError::Api(error)) if key.scope() == "participants" => {
                warn!("participants unavailable: {}", error);
            }
            Err(error) => return Err(error).with_context(|| format!("failed to load {key}")),
        }
    }
    Ok(())
}

fn entity_summary(context: &ClientContext, entity_id: &str) -> Value {
    let participants = context.cache().read(|cache| {
        cache
            .participants(entity_id)
            .map(|participants| participants.len())
    });
    match context.cache().entity(entity_id) {
        Some(entity) => json!({
            "id": entity.id,
            "participantCount": entity.participant_count,
            "capacity": entity.capacity,
            "isJoined": entity.is_joined,
            "participantsCached": participants,
        }),
        None => json!({ "id": entity_id, "cached": false }),
    }
}

async fn run_watch(context: &ClientContext, args: EntityArgs) -> Result<()> {
    load_entity(context, &args.entity_id).await?;
    println!("{}", entity_summary(context, &args.entity_id));

    let _state = context.socket().subscribe_connection_state(|state| {
        info!("socket {}", state.as_str());
    });
    let mut changes = context.cache().subscribe();
    context.bridge().watch_entity(&args.entity_id);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("stopping watch");
                return Ok(());
            }
            change = changes.recv() => match change {
                Ok(key) => println!("{} {}", key, entity_summary(context, &args.entity_id)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("skipped {} cache change notifications", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn run_membership(
    context: &ClientContext,
    args: EntityArgs,
    change: MembershipChange,
) -> Result<()> {
    load_entity(context, &args.entity_id).await?;
    println!("before {}", entity_summary(context, &args.entity_id));

    let outcome = match context
        .reconciler()
        .mutate(&args.entity_id, change, None)
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => {
            println!("rolled back {}", entity_summary(context, &args.entity_id));
            bail!("{} failed: {error}", change.as_str());
        }
    };
    println!("optimistic {}", entity_summary(context, &args.entity_id));
    outcome.invalidation.settled().await;
    println!("confirmed {}", entity_summary(context, &args.entity_id));
    Ok(())
}

async fn run_publish(context: &ClientContext, args: PublishArgs) -> Result<()> {
    let payload = serde_json::from_str::<Value>(&args.payload)
        .unwrap_or_else(|_| Value::String(args.payload.clone()));
    let socket = context.socket();
    socket.publish(&args.topic, payload)?;
    socket.connect();

    let wait = Duration::from_secs(args.wait_secs.max(1));
    let mut states = socket.state_watch();
    tokio::time::timeout(
        wait,
        states.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .context("timed out waiting for the socket to connect")?
    .context("socket state channel closed")?;

    tokio::time::timeout(wait, socket.flush())
        .await
        .context("timed out flushing the publish")?
        .context("socket closed before the frame was written")?;
    println!("published to {}", args.topic);
    Ok(())
}
