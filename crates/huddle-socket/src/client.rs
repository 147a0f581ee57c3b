//! Shared socket connection with topic pub/sub.
//!
//! A [`SocketClient`] owns at most one transport connection. A background
//! task drives `Disconnected -> Connecting -> Connected -> Disconnected`
//! and keeps reconnecting with [`ReconnectBackoff`] until [`SocketClient::close`]
//! is called. Publishes made while not connected wait in a FIFO that is
//! flushed in order on the next successful connect.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::ReconnectBackoff;
use crate::error::{Result, SocketError};
use crate::frame::{encode_frame, parse_frame};
use crate::registry::{self, ListenerId, TopicListener, TopicRegistry};
use crate::transport::{SocketConnector, SocketStream, TungsteniteConnector};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Socket client configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub url: Url,
    pub backoff: ReconnectBackoff,
    pub connect_timeout: Duration,
}

impl SocketConfig {
    pub fn new(url: &str) -> Result<Self> {
        let parsed_url = Url::parse(url.trim())?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(SocketError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }
        Ok(Self {
            url: parsed_url,
            backoff: ReconnectBackoff::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    config: SocketConfig,
    connector: Arc<dyn SocketConnector>,
    shared: Mutex<SharedState>,
    state_tx: watch::Sender<ConnectionState>,
    /// Frames written to a transport over the client's lifetime.
    written: watch::Sender<u64>,
    shutdown: CancellationToken,
}

struct SharedState {
    state: ConnectionState,
    topics: TopicRegistry,
    state_listeners: BTreeMap<u64, StateListener>,
    next_state_listener: u64,
    queue: VecDeque<String>,
    /// Frames accepted by `publish` over the client's lifetime.
    published: u64,
    writer: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    closed: bool,
    notifications: VecDeque<Notification>,
    notifying: bool,
}

/// State delivery queued under the shared lock, so deliveries follow the
/// order in which registrations and transitions took the lock.
struct Notification {
    listeners: Vec<StateListener>,
    state: ConnectionState,
}

impl SharedState {
    /// Queue a delivery. Returns true if the caller must drain the queue.
    fn enqueue(&mut self, listeners: Vec<StateListener>, state: ConnectionState) -> bool {
        self.notifications.push_back(Notification { listeners, state });
        !std::mem::replace(&mut self.notifying, true)
    }
}

/// Handle for one topic listener.
pub struct TopicSubscription {
    inner: Weak<SocketInner>,
    topic: String,
    id: ListenerId,
}

/// Handle for one connection-state listener.
pub struct StateSubscription {
    inner: Weak<SocketInner>,
    id: u64,
}

impl SocketClient {
    /// Client backed by the WebSocket transport.
    pub fn new(config: SocketConfig) -> Self {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(config: SocketConfig, connector: Arc<dyn SocketConnector>) -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (written, _written_rx) = watch::channel(0);
        Self {
            inner: Arc::new(SocketInner {
                config,
                connector,
                shared: Mutex::new(SharedState {
                    state: ConnectionState::Disconnected,
                    topics: TopicRegistry::new(),
                    state_listeners: BTreeMap::new(),
                    next_state_listener: 0,
                    queue: VecDeque::new(),
                    published: 0,
                    writer: None,
                    task: None,
                    closed: false,
                    notifications: VecDeque::new(),
                    notifying: false,
                }),
                state_tx,
                written,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        self.inner.config.url.as_str()
    }

    /// Register a listener for `topic` and make sure the connection is up.
    pub fn subscribe<F>(&self, topic: &str, listener: F) -> TopicSubscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let listener: TopicListener = Arc::new(listener);
        let id = self.inner.lock().topics.add(topic, listener);
        debug!("subscribed listener {} to {}", id.get(), topic);
        self.connect();
        TopicSubscription {
            inner: Arc::downgrade(&self.inner),
            topic: topic.to_string(),
            id,
        }
    }

    /// Send a frame now if connected, otherwise queue it for the next connect.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let text = encode_frame(topic, &payload)?;
        let mut shared = self.inner.lock();
        if shared.closed {
            return Err(SocketError::Closed);
        }
        shared.published = shared.published.saturating_add(1);
        let outcome = match (shared.state, shared.writer.as_ref()) {
            (ConnectionState::Connected, Some(writer)) => writer.send(text).map_err(|error| error.0),
            _ => Err(text),
        };
        if let Err(text) = outcome {
            shared.queue.push_back(text);
            debug!("queued frame for {} ({} pending)", topic, shared.queue.len());
        }
        Ok(())
    }

    /// Register a state listener. It is invoked with the current state, then
    /// on every transition. The first call happens before this returns
    /// unless another thread is delivering states, in which case that thread
    /// delivers it in order.
    pub fn subscribe_connection_state<F>(&self, listener: F) -> StateSubscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let listener: StateListener = Arc::new(listener);
        let (id, drain) = {
            let mut shared = self.inner.lock();
            shared.next_state_listener = shared.next_state_listener.saturating_add(1);
            let id = shared.next_state_listener;
            shared.state_listeners.insert(id, Arc::clone(&listener));
            let current = shared.state;
            (id, shared.enqueue(vec![listener], current))
        };
        if drain {
            self.inner.drain_notifications();
        }
        StateSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until every frame published before this call has been written
    /// to a transport. Fails with [`SocketError::Closed`] if the client is
    /// closed first.
    pub async fn flush(&self) -> Result<()> {
        let target = {
            let shared = self.inner.lock();
            if shared.closed {
                return Err(SocketError::Closed);
            }
            shared.published
        };
        let mut written = self.inner.written.subscribe();
        tokio::select! {
            biased;
            result = written.wait_for(|count| *count >= target) => {
                result.map(|_| ()).map_err(|_| SocketError::Closed)
            }
            () = self.inner.shutdown.cancelled() => Err(SocketError::Closed),
        }
    }

    /// Number of frames waiting for a connection.
    pub fn pending_frames(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Start the connection task. No-op while a task is running or after
    /// [`SocketClient::close`]. Requires a tokio runtime.
    pub fn connect(&self) {
        let mut shared = self.inner.lock();
        if shared.closed {
            debug!("connect ignored: client closed");
            return;
        }
        if shared.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("socket connect requested outside a tokio runtime");
            return;
        };
        let inner = Arc::clone(&self.inner);
        shared.task = Some(handle.spawn(inner.run()));
    }

    /// Stop reconnecting and tear down the transport. Terminal.
    pub fn close(&self) {
        let task = {
            let mut shared = self.inner.lock();
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.writer = None;
            let dropped = shared.queue.len();
            shared.queue.clear();
            if dropped > 0 {
                warn!("socket closed with {} unsent frames", dropped);
            }
            shared.task.take()
        };
        self.inner.shutdown.cancel();
        if task.is_none() {
            self.inner.transition(ConnectionState::Disconnected);
        }
        info!("socket client closed: {}", self.url());
    }
}

impl TopicSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove this listener. Returns false if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let removed = inner.lock().topics.remove(&self.topic, self.id);
        if removed {
            debug!("unsubscribed listener {} from {}", self.id.get(), self.topic);
        }
        removed
    }
}

impl StateSubscription {
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        inner.lock().state_listeners.remove(&self.id).is_some()
    }
}

impl SocketInner {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ConnectionState) {
        let drain = {
            let mut shared = self.lock();
            if shared.state == next {
                return;
            }
            shared.state = next;
            self.state_tx.send_replace(next);
            let listeners = shared.state_listeners.values().cloned().collect();
            shared.enqueue(listeners, next)
        };
        debug!("socket state -> {}", next.as_str());
        if drain {
            self.drain_notifications();
        }
    }

    /// Deliver queued states in order until the queue is empty. Listeners
    /// run outside the lock; states queued meanwhile, including from inside
    /// a listener, are delivered by this loop.
    fn drain_notifications(&self) {
        loop {
            let next = {
                let mut shared = self.lock();
                let next = shared.notifications.pop_front();
                if next.is_none() {
                    shared.notifying = false;
                }
                next
            };
            let Some(notification) = next else {
                return;
            };
            for listener in &notification.listeners {
                notify_state_listener(listener, notification.state);
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.transition(ConnectionState::Connecting);

            let connected = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = timeout(
                    self.config.connect_timeout,
                    self.connector.connect(&self.config.url),
                ) => result,
            };

            match connected {
                Ok(Ok(stream)) => {
                    attempt = 0;
                    let Some(outbound) = self.on_connected() else {
                        break;
                    };
                    info!("socket connected: {}", self.config.url);
                    self.drive(stream, outbound).await;
                }
                Ok(Err(error)) => {
                    warn!("socket connect to {} failed: {}", self.config.url, error);
                }
                Err(_) => {
                    warn!(
                        "socket connect to {} timed out after {:?}",
                        self.config.url, self.config.connect_timeout
                    );
                }
            }

            self.transition(ConnectionState::Disconnected);
            if self.shutdown.is_cancelled() {
                break;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.backoff.jittered(attempt);
            debug!("socket reconnect attempt {} in {:?}", attempt, delay);
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = sleep(delay) => {}
            }
        }
        self.transition(ConnectionState::Disconnected);
        debug!("socket connection task finished");
    }

    /// Install a fresh writer, flush the queue into it in order and mark
    /// the client connected. Returns `None` if the client was closed.
    fn on_connected(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        let (writer, outbound) = mpsc::unbounded_channel();
        let drain = {
            let mut shared = self.lock();
            if shared.closed {
                return None;
            }
            let flushed = shared.queue.len();
            for text in shared.queue.drain(..) {
                if writer.send(text).is_err() {
                    break;
                }
            }
            if flushed > 0 {
                debug!("flushing {} queued frames", flushed);
            }
            shared.writer = Some(writer);
            shared.state = ConnectionState::Connected;
            self.state_tx.send_replace(ConnectionState::Connected);
            let listeners = shared.state_listeners.values().cloned().collect();
            shared.enqueue(listeners, ConnectionState::Connected)
        };
        if drain {
            self.drain_notifications();
        }
        Some(outbound)
    }

    async fn drive(&self, stream: SocketStream, mut outbound: mpsc::UnboundedReceiver<String>) {
        let SocketStream {
            mut sink,
            mut source,
        } = stream;
        let mut unsent = None;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    if let Err(error) = sink.close().await {
                        debug!("socket close failed: {}", error);
                    }
                    break;
                }
                frame = outbound.recv() => {
                    let Some(text) = frame else {
                        break;
                    };
                    if let Err(error) = sink.send(text.clone()).await {
                        warn!("socket write failed: {}", error);
                        unsent = Some(text);
                        break;
                    }
                    self.written.send_modify(|count| *count = count.saturating_add(1));
                }
                incoming = source.next() => match incoming {
                    Some(Ok(text)) => self.dispatch_text(&text),
                    Some(Err(error)) => {
                        info!("socket connection lost: {}", error);
                        break;
                    }
                    None => {
                        info!("socket connection closed by peer");
                        break;
                    }
                },
            }
        }

        self.on_disconnected(unsent, outbound);
    }

    /// Return frames that were accepted but never written to the head of
    /// the queue, ahead of anything published since.
    fn on_disconnected(&self, unsent: Option<String>, mut outbound: mpsc::UnboundedReceiver<String>) {
        let mut shared = self.lock();
        shared.writer = None;
        let mut requeue = unsent.into_iter().collect::<Vec<_>>();
        while let Ok(text) = outbound.try_recv() {
            requeue.push(text);
        }
        if shared.closed {
            return;
        }
        if !requeue.is_empty() {
            debug!("requeued {} unwritten frames", requeue.len());
        }
        for text in requeue.into_iter().rev() {
            shared.queue.push_front(text);
        }
    }

    fn dispatch_text(&self, text: &str) {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(error) => {
                debug!("dropping malformed socket frame: {}", error);
                return;
            }
        };
        let listeners = self.lock().topics.listeners(&frame.topic);
        if listeners.is_empty() {
            debug!("no listeners for topic {}", frame.topic);
            return;
        }
        registry::dispatch(&listeners, &frame.topic, &frame.payload);
    }
}

fn notify_state_listener(listener: &StateListener, state: ConnectionState) {
    if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
        warn!("connection state listener panicked");
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_websocket_scheme() {
        let config = SocketConfig::new("wss://api.huddle.test/ws").expect("valid url");
        assert_eq!(config.url.as_str(), "wss://api.huddle.test/ws");
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);

        assert!(matches!(
            SocketConfig::new("https://api.huddle.test/ws"),
            Err(SocketError::InvalidUrl(_))
        ));
        assert!(matches!(
            SocketConfig::new("not a url"),
            Err(SocketError::UrlParse(_))
        ));
    }

    #[test]
    fn publish_without_runtime_queues_in_order() {
        let client = SocketClient::new(SocketConfig::new("ws://127.0.0.1:9/ws").expect("url"));
        client.publish("a", Value::from(1)).expect("queued");
        client.publish("b", Value::from(2)).expect("queued");
        assert_eq!(client.pending_frames(), 2);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.close();
        assert!(client.is_closed());
        assert_eq!(client.pending_frames(), 0);
        assert!(matches!(
            client.publish("a", Value::Null),
            Err(SocketError::Closed)
        ));
    }
}
