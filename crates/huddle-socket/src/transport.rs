//! Socket transport capability.
//!
//! The client never talks to a WebSocket library directly: it asks a
//! [`SocketConnector`] for a text sink and a text stream. Production uses
//! [`TungsteniteConnector`]; tests inject [`crate::memory::MemoryConnector`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::error::{Result, SocketError};

pub type SocketSink = Pin<Box<dyn Sink<String, Error = SocketError> + Send>>;
pub type SocketSource = BoxStream<'static, Result<String>>;

/// One established transport connection. The source ends (or yields an
/// error) when the peer goes away.
pub struct SocketStream {
    pub sink: SocketSink,
    pub source: SocketSource,
}

#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<SocketStream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<SocketStream> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| SocketError::WebSocket(error.to_string()))?;
        let (writer, reader) = stream.split();

        let sink = writer
            .sink_map_err(|error| SocketError::WebSocket(error.to_string()))
            .with(|text: String| future::ready(Ok::<_, SocketError>(Message::Text(text))));

        let source = reader
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Close(_)) => Some(Err(SocketError::Closed)),
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping ({} bytes)", payload.len());
                        None
                    }
                    Ok(_) => None,
                    Err(error) => Some(Err(SocketError::WebSocket(error.to_string()))),
                })
            })
            .boxed();

        Ok(SocketStream {
            sink: Box::pin(sink),
            source,
        })
    }
}
