//! Notification sink capabilities.
//!
//! Two capability seams: a live sink can create a message and patch it as
//! the batch progresses (`MessageCreator`), a legacy sink can only fire
//! one-shot notifications (`OneshotNotifier`). The pipeline consumes only
//! these two traits; all formatting is the sink's business.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{error, info};

/// Opaque handle to a live message.
pub type MessageId = String;

/// Structured payload attached to a notification. The sink decides how
/// (and whether) to render it.
pub type Embed = HashMap<String, String>;

/// Live-message capability: create once, then edit in place.
#[async_trait]
pub trait MessageCreator: Send + Sync {
    async fn create(&self, content: &str, embed: &Embed) -> Option<MessageId>;

    async fn patch(&self, id: &MessageId, content: &str, embed: &Embed);
}

/// One-shot capability. Every sink has at least this.
#[async_trait]
pub trait OneshotNotifier: Send + Sync {
    async fn send(&self, content: &str);
}

/// Tracing-backed sink for deployments without an external notifier.
/// Implements both capabilities; a patch just logs the new content.
pub struct LogNotifier;

#[async_trait]
impl MessageCreator for LogNotifier {
    async fn create(&self, content: &str, _embed: &Embed) -> Option<MessageId> {
        info!(notification = content, "notify");
        Some(uuid::Uuid::new_v4().to_string())
    }

    async fn patch(&self, id: &MessageId, content: &str, _embed: &Embed) {
        info!(notification = content, message_id = %id, "notify (update)");
    }
}

#[async_trait]
impl OneshotNotifier for LogNotifier {
    async fn send(&self, content: &str) {
        error!(notification = content, "notify");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Capturing sink used by pipeline tests.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OneshotNotifier for RecordingNotifier {
        async fn send(&self, content: &str) {
            self.sent.lock().push(content.to_string());
        }
    }

    #[tokio::test]
    async fn test_log_notifier_creates_ids() {
        let sink = LogNotifier;
        let id = sink.create("hello", &Embed::new()).await;
        assert!(id.is_some());
        sink.patch(&id.unwrap(), "updated", &Embed::new()).await;
    }

    #[tokio::test]
    async fn test_recording_notifier_captures() {
        let sink = RecordingNotifier::default();
        sink.send("boom").await;
        assert_eq!(sink.sent.lock().as_slice(), ["boom".to_string()]);
    }
}
