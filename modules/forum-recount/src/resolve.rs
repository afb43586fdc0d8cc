//! Username -> user id resolution, one lookup at a time.
//!
//! Lookups are strictly sequential with a fixed pause between them; the
//! forum API has an informal rate contract. A failed or empty lookup
//! leaves the entry unresolved and the run carries on.

use std::time::Duration;

use async_trait::async_trait;
use forum_api::{positive_id, CancelFlag, ForumClient, RecordExt};
use serde_json::Value;

use crate::aggregate::AggregateEntry;
use crate::error::{RecountError, Result};
use crate::run_log::{EventKind, RunLog};

#[async_trait]
pub trait IdLookup: Send + Sync {
    /// Raw id value for `entry`, or `None` when nothing matched.
    async fn lookup(&self, entry: &AggregateEntry) -> forum_api::Result<Option<Value>>;
}

#[async_trait]
impl IdLookup for ForumClient {
    async fn lookup(&self, entry: &AggregateEntry) -> forum_api::Result<Option<Value>> {
        let row = self.find_user(&entry.display_name).await?;
        Ok(row.and_then(|row| row.field("user_id").cloned()))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveStats {
    pub already_known: usize,
    pub looked_up: usize,
    pub resolved: usize,
    pub missed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    pub delay_between_requests: Duration,
}

impl Resolver {
    pub fn new(delay_between_requests: Duration) -> Self {
        Self {
            delay_between_requests,
        }
    }

    /// Resolve ids in place, in slice order. Only cancellation aborts.
    pub async fn resolve_ids(
        &self,
        entries: &mut [AggregateEntry],
        lookup: &dyn IdLookup,
        cancel: &CancelFlag,
        log: &mut RunLog,
    ) -> Result<ResolveStats> {
        let mut stats = ResolveStats::default();

        for entry in entries.iter_mut() {
            if entry.is_resolved() {
                stats.already_known += 1;
                continue;
            }
            entry.id = None;

            if stats.looked_up > 0 {
                cancel
                    .sleep(self.delay_between_requests)
                    .await
                    .map_err(|_| RecountError::Cancelled)?;
            }
            stats.looked_up += 1;

            let outcome = match cancel.guard(lookup.lookup(entry)).await {
                Ok(Some(raw)) => match positive_id(&raw) {
                    Some(id) => Ok(id),
                    None => Err(format!("lookup returned unusable id {raw}")),
                },
                Ok(None) => Err("no matching user".to_string()),
                Err(err) if err.is_cancelled() => return Err(RecountError::Cancelled),
                Err(err) => Err(err.to_string()),
            };

            match outcome {
                Ok(id) => {
                    entry.id = Some(id);
                    stats.resolved += 1;
                    log.record(EventKind::UserResolved {
                        username: entry.display_name.clone(),
                        user_id: id,
                    });
                }
                Err(reason) => {
                    stats.missed += 1;
                    log.record(EventKind::ResolutionMiss {
                        username: entry.display_name.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(stats)
    }
}

/// Split into (resolved, unresolved), each keeping the input order.
pub fn partition(entries: Vec<AggregateEntry>) -> (Vec<AggregateEntry>, Vec<AggregateEntry>) {
    entries.into_iter().partition(AggregateEntry::is_resolved)
}
