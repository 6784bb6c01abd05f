use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::message::Message;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source disconnected: {0}")]
    Disconnected(String),
    #[error("failed to read from source: {0}")]
    ReadError(String),
}

/// Where messages come from. `Ok(None)` signals the end of the stream.
///
/// Messages carry their own acknowledgement callbacks (see
/// [`Message::with_acknowledger`]), so a source does not need to track what it
/// handed out.
#[async_trait]
pub trait Source: Send + Sync {
    async fn receive(&self) -> Result<Option<Message>, SourceError>;
}

/// A source fed through a bounded tokio channel. The stream ends once every
/// sender is dropped and the channel is drained.
pub struct ChannelSource {
    receiver: Mutex<mpsc::Receiver<Message>>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Message>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            sender,
            Self {
                receiver: Mutex::new(receiver),
            },
        )
    }
}

#[async_trait]
impl Source for ChannelSource {
    async fn receive(&self) -> Result<Option<Message>, SourceError> {
        Ok(self.receiver.lock().await.recv().await)
    }
}
