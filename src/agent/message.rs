//! Processing of messages submitted to an agent.

use super::protocol::Message;
use crate::error::Result;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives messages from `submit_message` commands.
pub trait MessageProcessor: Send + Sync {
    fn submit(&self, message: Message) -> Result<()>;
}

/// Logs every message and counts them.
#[derive(Debug, Default)]
pub struct LoggingMessageProcessor {
    processed: AtomicUsize,
}

impl LoggingMessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }
}

impl MessageProcessor for LoggingMessageProcessor {
    fn submit(&self, message: Message) -> Result<()> {
        let n = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            address = %message.address,
            kind = %message.kind,
            payload = %message.payload,
            processed = n,
            "Message received"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logging_processor_counts() {
        let processor = LoggingMessageProcessor::new();
        for _ in 0..3 {
            processor
                .submit(Message {
                    address: "member-1".into(),
                    kind: "kill".into(),
                    payload: json!({"delay_ms": 10}),
                })
                .unwrap();
        }
        assert_eq!(processor.processed(), 3);
    }
}
