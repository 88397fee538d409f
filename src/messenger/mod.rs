//! Named, bidirectional byte channels between the controller and the host.

mod endpoint;
pub mod frame;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

pub use endpoint::Endpoint;

#[cfg(test)]
use mockall::automock;

pub type Responder<T> = oneshot::Sender<T>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("No handler registered on the channel")]
    NoHandler,

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Handler stopped before replying")]
    Aborted,
}

/// Receives the messages of one channel and produces exactly one reply per
/// message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, message: Vec<u8>) -> Vec<u8>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BinaryMessenger: Send + Sync + 'static {
    /// Sends `message` on `channel` and waits for the single reply.
    async fn send(
        &self, channel: &str, message: Vec<u8>,
    ) -> Result<Vec<u8>, DeliveryError>;

    /// Installs the handler for incoming messages on `channel`, `None`
    /// removes it.
    fn set_message_handler(
        &self, channel: &str, handler: Option<Arc<dyn MessageHandler>>,
    );
}
