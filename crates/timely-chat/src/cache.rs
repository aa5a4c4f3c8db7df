//! Time-boxed read-through copy of upcoming deadlines for the chat path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use timely_core::{Category, Clock, Deadline};
use timely_storage::{DeadlineStore, StoreError};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DeadlineSnapshot {
    pub deadlines: Vec<Deadline>,
    pub captured_at: DateTime<Utc>,
}

impl DeadlineSnapshot {
    /// Deadlines still ahead of `now`, in due order.
    pub fn upcoming(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Deadline> {
        self.deadlines.iter().filter(move |d| d.due_at >= now)
    }

    pub fn urgent(&self, now: DateTime<Utc>, window: Duration) -> Vec<&Deadline> {
        self.deadlines
            .iter()
            .filter(|d| d.is_due_within(now, window))
            .collect()
    }

    pub fn by_category(&self, category: Category, now: DateTime<Utc>) -> Vec<&Deadline> {
        self.upcoming(now).filter(|d| d.category == category).collect()
    }
}

/// Holds at most one snapshot; it is refilled from the store once its age
/// reaches the TTL. Fills are serialized so concurrent readers share a reload.
pub struct SnapshotCache {
    store: DeadlineStore,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slot: Mutex<Option<Arc<DeadlineSnapshot>>>,
    loads: AtomicU64,
}

impl SnapshotCache {
    pub fn new(store: DeadlineStore, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            clock,
            ttl,
            slot: Mutex::new(None),
            loads: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self) -> Result<Arc<DeadlineSnapshot>, StoreError> {
        let mut slot = self.slot.lock().await;
        let now = self.clock.now();
        if let Some(snapshot) = slot.as_ref() {
            if now - snapshot.captured_at < self.ttl {
                return Ok(Arc::clone(snapshot));
            }
        }

        let deadlines = self.store.list_upcoming(now).await?;
        debug!(count = deadlines.len(), "refilled deadline snapshot");
        let snapshot = Arc::new(DeadlineSnapshot {
            deadlines,
            captured_at: now,
        });
        *slot = Some(Arc::clone(&snapshot));
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(snapshot)
    }

    /// Age of the current snapshot, `None` before the first fill.
    pub async fn age(&self) -> Option<Duration> {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .map(|snapshot| self.clock.now() - snapshot.captured_at)
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}
