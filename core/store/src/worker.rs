use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use user_memory_schemas::InboundMessage;

use crate::extractor::MessageIngestor;

/// Background worker that ingests messages off the request path
pub struct IngestionWorker {
    ingestor: Arc<MessageIngestor>,
    receiver: mpsc::UnboundedReceiver<InboundMessage>,
}

impl IngestionWorker {
    pub fn new(
        ingestor: Arc<MessageIngestor>,
        receiver: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Self {
        Self { ingestor, receiver }
    }

    /// Process messages until every sender is dropped. A failed message is
    /// logged and skipped.
    pub async fn run(mut self) {
        info!("Ingestion worker started");

        while let Some(message) = self.receiver.recv().await {
            let ingestor = self.ingestor.clone();
            let user_id = message.user_id.clone();
            let conversation_id = message.conversation_id.clone();

            match tokio::task::spawn_blocking(move || ingestor.ingest(&message)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(
                        user_id = %user_id,
                        conversation_id = %conversation_id,
                        "Failed to ingest message: {}",
                        e
                    );
                }
                Err(e) => {
                    error!(conversation_id = %conversation_id, "Ingestion task panicked: {}", e);
                }
            }
        }

        warn!("Ingestion worker stopped - channel closed");
    }
}
