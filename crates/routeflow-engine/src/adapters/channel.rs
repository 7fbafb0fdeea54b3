//! In-process push source.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{Message, Source};
use crate::error::SourceError;

/// Receives messages pushed through the sender returned by
/// `AdapterRegistry::register_channel`.
///
/// The receiver is shared so a restarted route keeps draining the same
/// channel. Exhausted once every sender is dropped.
pub struct ChannelSource {
    receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl ChannelSource {
    pub fn new(receiver: Arc<Mutex<mpsc::Receiver<Message>>>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl Source for ChannelSource {
    async fn next(&mut self) -> Result<Option<Message>, SourceError> {
        Ok(self.receiver.lock().await.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = ChannelSource::new(Arc::new(Mutex::new(rx)));

        tx.send(Message::new(serde_json::json!({"value": 1}))).await.unwrap();
        drop(tx);

        let msg = source.next().await.unwrap().unwrap();
        assert_eq!(msg.payload["value"], 1);
        assert!(source.next().await.unwrap().is_none());
    }
}
