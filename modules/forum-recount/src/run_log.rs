//! Recount run log: ordered timeline of what a run did.
//!
//! The log is the only channel a run uses to talk to its caller besides
//! its return value. Each event is kept, forwarded to the caller's
//! [`LogSink`] as it happens, and mirrored to tracing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Caller-supplied callback receiving every event as it is recorded.
pub type LogSink = Arc<dyn Fn(&RunEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

pub struct RunLog {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    events: Vec<RunEvent>,
    seq: u32,
    sink: Option<LogSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub seq: u32,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        forums: Vec<u64>,
        include_first_post: bool,
        requested_by: Option<u64>,
    },
    TopicsFetched {
        topics: usize,
    },
    PostsFetched {
        batch: usize,
        topics: usize,
        posts: usize,
    },
    PostsAggregated {
        counted: u64,
        excluded: u64,
        anonymous: u64,
        users: usize,
    },
    UserResolved {
        username: String,
        user_id: u64,
    },
    ResolutionMiss {
        username: String,
        reason: String,
    },
    SnapshotBuilt {
        total_users: usize,
        total_posts: u64,
        resolved: usize,
        unresolved: usize,
        complete: bool,
    },
    NoData {
        reason: String,
    },
    DeadlineExceeded {
        stage: String,
    },
    RunCancelled,
    RunFailed {
        error: String,
    },
}

impl EventKind {
    /// One human-readable line for UI rendering.
    pub fn message(&self) -> String {
        match self {
            EventKind::RunStarted { forums, .. } => {
                format!("Recount started for forums {forums:?}")
            }
            EventKind::TopicsFetched { topics } => format!("Found {topics} topics"),
            EventKind::PostsFetched {
                batch,
                topics,
                posts,
            } => format!("Batch {batch}: {posts} posts from {topics} topics"),
            EventKind::PostsAggregated {
                counted,
                excluded,
                anonymous,
                users,
            } => format!(
                "Counted {counted} posts by {users} users ({excluded} opening posts excluded, {anonymous} without author)"
            ),
            EventKind::UserResolved { username, user_id } => {
                format!("{username} -> user #{user_id}")
            }
            EventKind::ResolutionMiss { username, reason } => {
                format!("Could not resolve {username}: {reason}")
            }
            EventKind::SnapshotBuilt {
                total_users,
                total_posts,
                unresolved,
                complete,
                ..
            } => {
                let partial = if *complete { "" } else { " (partial)" };
                format!(
                    "Snapshot ready{partial}: {total_posts} posts, {total_users} users, {unresolved} unresolved"
                )
            }
            EventKind::NoData { reason } => format!("Nothing to report: {reason}"),
            EventKind::DeadlineExceeded { stage } => format!("Run deadline hit during {stage}"),
            EventKind::RunCancelled => "Run stopped".to_string(),
            EventKind::RunFailed { error } => format!("Run failed: {error}"),
        }
    }

    fn is_problem(&self) -> bool {
        matches!(
            self,
            EventKind::ResolutionMiss { .. }
                | EventKind::DeadlineExceeded { .. }
                | EventKind::RunFailed { .. }
        )
    }
}

impl RunLog {
    pub fn new(sink: Option<LogSink>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            events: Vec::new(),
            seq: 0,
            sink,
        }
    }

    pub fn record(&mut self, kind: EventKind) {
        if kind.is_problem() {
            tracing::warn!(run_id = %self.run_id, seq = self.seq, "{}", kind.message());
        } else {
            tracing::info!(run_id = %self.run_id, seq = self.seq, "{}", kind.message());
        }

        let event = RunEvent {
            seq: self.seq,
            ts: Utc::now(),
            kind,
        };
        self.seq += 1;

        if let Some(sink) = &self.sink {
            sink(&event);
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn kinds(&self) -> impl Iterator<Item = &EventKind> {
        self.events.iter().map(|e| &e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sink_sees_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: LogSink = Arc::new(move |event: &RunEvent| {
            sink_seen.lock().unwrap().push(event.seq);
        });

        let mut log = RunLog::new(Some(sink));
        log.record(EventKind::TopicsFetched { topics: 2 });
        log.record(EventKind::RunCancelled);

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
        assert_eq!(log.events().len(), 2);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let mut log = RunLog::new(None);
        log.record(EventKind::NoData {
            reason: "no topics".into(),
        });
        let json = serde_json::to_value(&log.events()[0]).unwrap();
        assert_eq!(json["type"], "no_data");
        assert_eq!(json["reason"], "no topics");
        assert_eq!(json["seq"], 0);
    }
}
