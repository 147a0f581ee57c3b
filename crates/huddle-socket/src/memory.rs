//! In-process socket transport. Each successful `connect` hands a
//! [`MemoryServerConnection`] to the paired [`MemoryAcceptor`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use crate::error::{Result, SocketError};
use crate::frame::encode_frame;
use crate::transport::{SocketConnector, SocketStream};

#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Mutex<ConnectorState>>,
    accepted: mpsc::UnboundedSender<MemoryServerConnection>,
}

struct ConnectorState {
    refuse_remaining: usize,
    attempts: Vec<Instant>,
}

pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<MemoryServerConnection>,
}

/// Server half of an in-memory connection. Dropping it disconnects the client.
pub struct MemoryServerConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Result<String>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (accepted, incoming) = mpsc::unbounded();
        (
            Self {
                inner: Arc::new(Mutex::new(ConnectorState {
                    refuse_remaining: 0,
                    attempts: Vec::new(),
                })),
                accepted,
            },
            MemoryAcceptor { incoming },
        )
    }

    /// Fail the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.state().refuse_remaining = count;
    }

    /// Instants at which connection attempts were made, refused ones included.
    pub fn attempts(&self) -> Vec<Instant> {
        self.state().attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.state().attempts.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<SocketStream> {
        {
            let mut state = self.state();
            state.attempts.push(Instant::now());
            if state.refuse_remaining > 0 {
                state.refuse_remaining -= 1;
                return Err(SocketError::Connection(format!(
                    "connection to {url} refused"
                )));
            }
        }

        let (client_tx, server_rx) = mpsc::unbounded::<String>();
        let (server_tx, client_rx) = mpsc::unbounded::<Result<String>>();
        self.accepted
            .unbounded_send(MemoryServerConnection {
                inbound: server_rx,
                outbound: server_tx,
            })
            .map_err(|_| SocketError::Connection("acceptor dropped".to_string()))?;

        Ok(SocketStream {
            sink: Box::pin(client_tx.sink_map_err(|_| SocketError::Closed)),
            source: client_rx.boxed(),
        })
    }
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<MemoryServerConnection> {
        self.incoming.next().await
    }
}

impl MemoryServerConnection {
    /// Next text frame written by the client.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.next().await
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound.unbounded_send(Ok(text.into())).is_ok()
    }

    pub fn send_frame(&self, topic: &str, payload: &Value) -> bool {
        match encode_frame(topic, payload) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    pub fn disconnect(self) {
        drop(self);
    }
}
