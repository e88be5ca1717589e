/// Transient notifications pushed on the notification topic
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    items: Vec<Notification>,
    timers: HashMap<u64, JoinHandle<()>>,
    next_id: u64,
}

/// Holds visible notifications; each one dismisses itself after `ttl`.
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl NotificationCenter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ttl,
        }
    }

    /// Show `text` and schedule its dismissal. Must be called inside a tokio runtime.
    pub fn push(&self, text: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.items.push(Notification {
            id,
            text: text.into(),
            received_at: Utc::now(),
        });

        let center = self.clone();
        let ttl = self.ttl;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            center.expire(id);
        });
        inner.timers.insert(id, timer);
        debug!("Notification {} shown", id);
        id
    }

    /// Remove a notification before its timer fires
    pub fn dismiss(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(timer) = inner.timers.remove(&id) {
            timer.abort();
        }
        let before = inner.items.len();
        inner.items.retain(|n| n.id != id);
        inner.items.len() != before
    }

    fn expire(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.timers.remove(&id);
        inner.items.retain(|n| n.id != id);
    }

    /// Currently visible notifications, oldest first
    pub fn active(&self) -> Vec<Notification> {
        self.inner.lock().items.clone()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        inner.items.clear();
    }
}

/// Notification bodies are free text, sometimes sent JSON-quoted
pub fn notification_text(body: &str) -> String {
    match serde_json::from_str::<String>(body) {
        Ok(text) => text,
        Err(_) => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_notifications_expire_after_ttl() {
        let center = NotificationCenter::new(Duration::from_secs(5));
        center.push("Your listing was sold");
        tokio::time::sleep(Duration::from_secs(2)).await;
        center.push("New offer");
        assert_eq!(center.active().len(), 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let left = center.active();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].text, "New offer");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(center.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_and_clear() {
        let center = NotificationCenter::new(Duration::from_secs(5));
        let a = center.push("a");
        center.push("b");
        assert!(center.dismiss(a));
        assert!(!center.dismiss(a));
        center.clear();
        assert!(center.active().is_empty());
    }

    #[test]
    fn test_notification_text_unquotes_json() {
        assert_eq!(notification_text("\"hello\""), "hello");
        assert_eq!(notification_text("plain text"), "plain text");
    }
}
