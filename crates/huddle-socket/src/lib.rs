//! Huddle socket client: one shared connection, topic multiplexing,
//! reconnect backoff and an outbound queue for frames published while
//! disconnected.

pub mod backoff;
pub mod client;
pub mod error;
pub mod frame;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod registry;
pub mod topics;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use client::{
    ConnectionState, DEFAULT_CONNECT_TIMEOUT, SocketClient, SocketConfig, StateSubscription,
    TopicSubscription,
};
pub use error::{Result, SocketError};
pub use frame::{Frame, encode_frame, parse_frame};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryAcceptor, MemoryConnector, MemoryServerConnection};
pub use registry::ListenerId;
pub use topics::{
    ChatChannel, ChatMessage, TypingIndicator, chat_topic, entity_topic, parse_entity_topic,
    typing_topic,
};
pub use transport::{SocketConnector, SocketStream, TungsteniteConnector};
