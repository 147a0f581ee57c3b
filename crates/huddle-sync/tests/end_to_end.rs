mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeBackend, entity, occurrences};
use huddle_client_core::{ClientConfig, HttpResponse, MemoryCredentialStore, Method};
use huddle_socket::{ConnectionState, MemoryConnector, SocketClient, SocketConfig, parse_frame};
use huddle_sync::{CachedValue, ClientContext, ContextParts, EntityPage, QueryKey};
use serde_json::json;
use tokio::time::Instant;

async fn wait_for_state(socket: &SocketClient, expected: ConnectionState) {
    socket
        .state_watch()
        .wait_for(|state| *state == expected)
        .await
        .expect("state channel open");
}

fn backend() -> FakeBackend {
    let confirmed = json!({ "id": "ent_1", "participantCount": 4, "capacity": 10, "isJoined": true });
    FakeBackend::new(Box::new(move |request| {
        let path = request.url.strip_prefix("https://api.huddle.test")?;
        if request.method == Method::POST && path == "/entities/ent_1/join" {
            Some(HttpResponse::json(204, &json!({})))
        } else if request.method == Method::GET && path == "/entities/ent_1" {
            Some(HttpResponse::json(200, &confirmed))
        } else if request.method == Method::GET && path == "/entities" {
            Some(HttpResponse::json(200, &json!({ "items": [confirmed.clone()] })))
        } else {
            None
        }
    }))
}

#[tokio::test(start_paused = true)]
async fn reconnect_flushes_queued_chat_then_join_confirms_without_rollback() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let backend = Arc::new(backend());
    let config = ClientConfig::new("https://api.huddle.test").expect("base url");
    let context = ClientContext::with_parts(
        config,
        ContextParts {
            store: Arc::new(MemoryCredentialStore::new()),
            transport: backend.clone(),
            connector: Arc::new(connector.clone()),
            socket: SocketConfig::new("ws://socket.huddle.test/ws").expect("socket url"),
            fetcher: None,
            membership: None,
        },
    );
    context.cache().insert(
        QueryKey::all_entities(),
        CachedValue::List(vec![EntityPage::new(vec![entity(3, false)], None)]),
    );
    context.cache().insert(
        QueryKey::entity_detail("ent_1"),
        CachedValue::Detail(entity(3, false)),
    );

    assert!(context.bridge().watch_entity("ent_1"));
    assert!(!context.bridge().watch_entity("ent_1"));
    let server = acceptor.accept().await.expect("first connection");
    wait_for_state(context.socket(), ConnectionState::Connected).await;

    server.disconnect();
    wait_for_state(context.socket(), ConnectionState::Disconnected).await;
    let disconnected_at = Instant::now();

    let chat = context.chat("ent_1");
    let first_id = chat.send_message("anyone up for chess?").expect("queued");
    chat.send_message("bringing boards").expect("queued");
    assert_eq!(context.socket().pending_frames(), 2);

    let mut server = acceptor.accept().await.expect("reconnection");
    let reconnect_gap = connector.attempts()[1] - disconnected_at;
    assert!(reconnect_gap >= Duration::from_secs(1));
    assert!(reconnect_gap < Duration::from_millis(1_005));

    let mut bodies = Vec::new();
    for _ in 0..2 {
        let frame = parse_frame(&server.recv().await.expect("chat frame")).expect("frame");
        assert_eq!(frame.topic, "entity:ent_1:chat");
        bodies.push(frame.payload["body"].clone());
    }
    assert_eq!(bodies, vec![json!("anyone up for chess?"), json!("bringing boards")]);
    assert_eq!(context.socket().pending_frames(), 0);
    assert!(!first_id.is_empty());

    let outcome = context.reconciler().join("ent_1").await.expect("join confirmed");
    assert_eq!(occurrences(context.cache()), vec![(4, true); 2]);
    outcome.invalidation.settled().await;
    assert_eq!(occurrences(context.cache()), vec![(4, true); 2]);
    assert!(
        backend
            .requests()
            .contains(&("POST".to_string(), "https://api.huddle.test/entities/ent_1/join".to_string()))
    );

    let mut changes = context.cache().subscribe();
    assert!(server.send_frame(
        "entity:ent_1",
        &json!({ "type": "capacity_changed", "participantCount": 6, "capacity": 12 }),
    ));
    let changed = changes.recv().await.expect("cache change");
    assert!(matches!(
        changed,
        QueryKey::EntityList { .. } | QueryKey::EntityDetail { .. }
    ));
    let detail = context.cache().entity("ent_1").expect("cached entity");
    assert_eq!(detail.participant_count, 6);
    assert_eq!(detail.capacity, Some(12));

    context.shutdown();
    wait_for_state(context.socket(), ConnectionState::Disconnected).await;
    assert!(context.bridge().watched().is_empty());
}
