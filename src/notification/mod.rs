//! In-memory notification log with live subscribers.
//!
//! The log is bounded by count (enforced on every publish) and by age
//! (enforced by [`NotificationHub::prune_expired`], which the process runs on
//! a periodic task). Subscribers are invoked synchronously on publish; a
//! failing or panicking subscriber is logged and skipped.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::db::{CheckResult, CheckStatus};

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub read: bool,
}

pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;
type Callback = Arc<dyn Fn(&Notification) -> Result<(), SubscriberError> + Send + Sync>;

/// Handle returned by [`NotificationHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct Inner {
    log: VecDeque<Notification>,
    last_id: u64,
}

pub struct NotificationHub {
    inner: Mutex<Inner>,
    subscribers: Mutex<Vec<(SubscriberId, Callback)>>,
    next_subscriber: AtomicU64,
    capacity: usize,
    max_age: ChronoDuration,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, ChronoDuration::days(DEFAULT_MAX_AGE_DAYS))
    }
}

impl NotificationHub {
    pub fn new(capacity: usize, max_age: ChronoDuration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                log: VecDeque::with_capacity(capacity.max(1)),
                last_id: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            capacity: capacity.max(1),
            max_age,
        }
    }

    /// Register a callback for every future notification.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&Notification) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Store a notification, trim to capacity, and deliver it to subscribers.
    pub fn publish(&self, kind: NotificationKind, title: &str, message: &str, data: Value) -> Notification {
        let notification = {
            let mut inner = self.inner.lock();
            let now = Utc::now();
            // Time-derived, forced strictly increasing.
            let id = (now.timestamp_micros().max(0) as u64).max(inner.last_id + 1);
            inner.last_id = id;

            let notification = Notification {
                id,
                kind,
                title: title.to_string(),
                message: message.to_string(),
                timestamp: now,
                data: if data.is_null() { json!({}) } else { data },
                read: false,
            };
            inner.log.push_back(notification.clone());
            while inner.log.len() > self.capacity {
                inner.log.pop_front();
            }
            notification
        };

        tracing::info!("Notification created: {:?} - {}", notification.kind, notification.title);
        self.notify_subscribers(&notification);
        notification
    }

    fn notify_subscribers(&self, notification: &Notification) {
        // Callbacks run outside the lock so they may publish or subscribe themselves.
        let subscribers: Vec<(SubscriberId, Callback)> = self.subscribers.lock().clone();

        for (id, callback) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Notification subscriber {:?} failed: {}", id, e),
                Err(_) => tracing::error!("Notification subscriber {:?} panicked", id),
            }
        }
    }

    /// Most recent notifications first.
    pub fn get_recent(&self, limit: usize) -> Vec<Notification> {
        let inner = self.inner.lock();
        inner.log.iter().rev().take(limit).cloned().collect()
    }

    /// Mark a notification read. Returns false for unknown ids.
    pub fn mark_read(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        // Ids are increasing along the log.
        match inner.log.binary_search_by_key(&id, |n| n.id) {
            Ok(idx) => {
                inner.log[idx].read = true;
                true
            }
            Err(_) => false,
        }
    }

    pub fn unread_count(&self) -> usize {
        self.inner.lock().log.iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().log.len()
    }

    pub fn clear_all(&self) {
        self.inner.lock().log.clear();
        tracing::info!("All notifications cleared");
    }

    /// Drop notifications older than the configured maximum age.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(Utc::now())
    }

    pub fn prune_expired_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.max_age;
        let mut inner = self.inner.lock();
        let before = inner.log.len();
        inner.log.retain(|n| n.timestamp > cutoff);
        let removed = before - inner.log.len();
        if removed > 0 {
            tracing::info!("Pruned {} expired notifications", removed);
        }
        removed
    }

    // --- Event helpers ---

    /// Publish the notification for a dataset changing between up and down.
    pub fn dataset_transition(&self, previous: CheckStatus, current: &CheckResult) -> Notification {
        let data = json!({
            "dataset_id": current.dataset_id,
            "dataset_name": current.name,
            "previous_status": previous,
            "new_status": current.status,
            "error": current.error,
        });

        match current.status {
            CheckStatus::Down => self.publish(
                NotificationKind::Error,
                &format!("Dataset {} is down", current.name),
                &format!(
                    "Check of {} failed: {}",
                    current.name,
                    current.error.as_deref().unwrap_or("unknown error")
                ),
                data,
            ),
            CheckStatus::Up => self.publish(
                NotificationKind::Success,
                &format!("Dataset {} recovered", current.name),
                &format!("{} is available again", current.name),
                data,
            ),
        }
    }

    /// Publish a system event.
    pub fn system(&self, kind: NotificationKind, title: &str, message: &str) -> Notification {
        self.publish(kind, title, message, json!({ "source": "system" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Dataset;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_capacity_keeps_most_recent() {
        let hub = NotificationHub::new(10, ChronoDuration::days(7));
        for i in 0..15 {
            hub.publish(NotificationKind::Info, &format!("n{}", i), "", Value::Null);
        }

        assert_eq!(hub.len(), 10);
        let recent = hub.get_recent(100);
        assert_eq!(recent.len(), 10);
        let titles: Vec<_> = recent.iter().map(|n| n.title.clone()).collect();
        let expected: Vec<_> = (5..15).rev().map(|i| format!("n{}", i)).collect();
        assert_eq!(titles, expected);
        assert!(recent.windows(2).all(|w| w[0].id > w[1].id));
    }

    #[test]
    fn test_mark_read_and_unread_count() {
        let hub = NotificationHub::default();
        let a = hub.publish(NotificationKind::Info, "a", "", Value::Null);
        hub.publish(NotificationKind::Warning, "b", "", json!({"k": 1}));

        assert_eq!(hub.unread_count(), 2);
        assert!(hub.mark_read(a.id));
        assert!(!hub.mark_read(a.id + 1_000_000_000));
        assert_eq!(hub.unread_count(), 1);
        assert!(hub.get_recent(10)[1].read);

        hub.clear_all();
        assert_eq!(hub.len(), 0);
        assert_eq!(hub.unread_count(), 0);
    }

    #[test]
    fn test_prune_expired_by_age() {
        let hub = NotificationHub::new(100, ChronoDuration::days(7));
        hub.publish(NotificationKind::Info, "old", "", Value::Null);

        assert_eq!(hub.prune_expired_at(Utc::now()), 0);
        assert_eq!(hub.prune_expired_at(Utc::now() + ChronoDuration::days(8)), 1);
        assert_eq!(hub.len(), 0);
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let hub = NotificationHub::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        hub.subscribe(|_| Err("transport closed".into()));
        hub.subscribe(|_| panic!("subscriber bug"));
        let counter = delivered.clone();
        hub.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hub.publish(NotificationKind::Info, "one", "", Value::Null);
        hub.publish(NotificationKind::Info, "two", "", Value::Null);

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = NotificationHub::default();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let id = hub.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hub.publish(NotificationKind::Info, "one", "", Value::Null);
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.publish(NotificationKind::Info, "two", "", Value::Null);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transition_notification_payload() {
        let hub = NotificationHub::default();
        let ds = Dataset::new("ine-census", "Census", "demography", "https://example.org");
        let down = CheckResult::down(&ds, None, Some(10.0), "Timeout", Utc::now());

        let n = hub.dataset_transition(CheckStatus::Up, &down);
        assert_eq!(n.kind, NotificationKind::Error);
        assert_eq!(n.data["dataset_id"], "ine-census");
        assert_eq!(n.data["previous_status"], "up");
        assert_eq!(n.data["new_status"], "down");
        assert_eq!(n.data["error"], "Timeout");

        let up = CheckResult::up(&ds, 200, 5.0, Utc::now());
        assert_eq!(hub.dataset_transition(CheckStatus::Down, &up).kind, NotificationKind::Success);
    }
}
