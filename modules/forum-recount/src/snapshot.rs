use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::AggregateEntry;
use crate::resolve::partition;

/// Immutable result of one recount run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub total_entries: usize,
    pub total_count: u64,
    /// Entries with a valid positive id, descending by count.
    pub resolved: Vec<AggregateEntry>,
    /// Everything else, same order.
    pub unresolved: Vec<AggregateEntry>,
    pub meta: SnapshotMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub forums: Vec<u64>,
    pub topics: usize,
    pub include_first_post: bool,
    /// False when the run deadline cut resolution short.
    pub complete: bool,
    pub requested_by: Option<u64>,
    /// Host group and board the run was triggered from.
    #[serde(default)]
    pub group_id: Option<u64>,
    #[serde(default)]
    pub board_id: Option<u64>,
}

impl Snapshot {
    /// Distinct authors counted.
    pub fn total_users(&self) -> usize {
        self.total_entries
    }

    /// Posts counted across all authors.
    pub fn total_posts(&self) -> u64 {
        self.total_count
    }

    /// All entries in count order, resolved first.
    pub fn entries(&self) -> impl Iterator<Item = &AggregateEntry> {
        self.resolved.iter().chain(self.unresolved.iter())
    }
}

/// Pure: no I/O, no shared state.
pub fn build_snapshot(entries: Vec<AggregateEntry>, meta: SnapshotMeta) -> Snapshot {
    let total_entries = entries.len();
    let total_count = entries.iter().map(|e| e.count).sum();
    let (resolved, unresolved) = partition(entries);
    Snapshot {
        total_entries,
        total_count,
        resolved,
        unresolved,
        meta,
    }
}

/// Process-wide home of the latest snapshot. Publishing is an explicit step
/// separate from building.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSlot {
    inner: Arc<RwLock<Option<Arc<Snapshot>>>>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever was published before.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
