//! Outbound operator notifications.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `text` to the operator. Delivery is best effort.
    async fn notify(&self, text: &str);
}

/// Forwards notifications to a channel (the CLI prints them).
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, text: &str) {
        if self.tx.send(text.to_string()).is_err() {
            warn!("notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_notifier_forwards_text() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify("task deploy-site failed").await;
        assert_eq!(rx.recv().await.as_deref(), Some("task deploy-site failed"));
    }
}
