//! Capture-side collaborators that produce intents.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::holder::IntentsHolder;
use crate::types::Intent;

pub mod json_lines;
pub use json_lines::JsonLinesSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read observation stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("observation record is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed observation record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("intent channel closed")]
    ChannelClosed,
}

#[async_trait]
pub trait TrafficSource {
    /// Start producing intents.
    /// Every observation should be sent to the provided channel.
    async fn capture(&self, intent_tx: mpsc::Sender<Intent>) -> Result<(), SourceError>;
}

/// Feeds every received intent into the holder until all senders are gone.
pub async fn ingest(holder: Arc<IntentsHolder>, mut intent_rx: mpsc::Receiver<Intent>) {
    while let Some(intent) = intent_rx.recv().await {
        holder.add_intent(intent);
    }
    info!("Intent channel closed, ingest stopped");
}
