//! RecountPipeline: per-user post counts over a set of forums.
//!
//! topics (paginated) -> posts per topic batch (paginated) -> two-pass
//! aggregation by username -> sequential id resolution -> snapshot.
//! Every request is issued strictly one after another.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use forum_api::{
    ApiQuery, ForumClient, Paginator, RawRecord, RecordExt, METHOD_POST_GET, METHOD_TOPIC_GET,
};
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use crate::aggregate::{aggregate, Aggregate, AggregateEntry, FirstPostIndex, Sighting};
use crate::config::{HostContext, RecountConfig};
use crate::error::{RecountError, Result};
use crate::resolve::{IdLookup, Resolver};
use crate::run_log::{EventKind, RunLog};
use crate::snapshot::{build_snapshot, Snapshot, SnapshotMeta};

const TOPIC_FIELDS: &[&str] = &["id", "subject", "forum_id", "num_replies"];
const POST_FIELDS: &[&str] = &["id", "topic_id", "username", "user_id", "posted"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Starting,
    Topics,
    Posts,
    Aggregate,
    Resolve,
    Snapshot,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Starting => "start",
            Stage::Topics => "topic fetch",
            Stage::Posts => "post fetch",
            Stage::Aggregate => "aggregation",
            Stage::Resolve => "user resolution",
            Stage::Snapshot => "snapshot",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// State a run leaves behind even when it is cut short.
pub struct RunProgress {
    pub log: RunLog,
    pub stage: Stage,
    pub topics: usize,
    /// Sorted entries, present from the end of aggregation until the
    /// snapshot is built.
    pub entries: Option<Vec<AggregateEntry>>,
}

impl RunProgress {
    pub fn new(log: RunLog) -> Self {
        Self {
            log,
            stage: Stage::Starting,
            topics: 0,
            entries: None,
        }
    }
}

#[derive(Clone, TypedBuilder)]
pub struct RecountPipeline {
    client: ForumClient,
    config: Arc<RecountConfig>,
    #[builder(default)]
    host: HostContext,
    /// Defaults to `users.get` through `client`.
    #[builder(default, setter(strip_option))]
    lookup: Option<Arc<dyn IdLookup>>,
}

impl RecountPipeline {
    fn paginator(&self) -> Paginator {
        Paginator::new(
            self.config.page_size,
            self.config.delay_between_requests,
            self.config.max_pages,
        )
    }

    pub fn topics_query(&self) -> ApiQuery {
        ApiQuery::new(METHOD_TOPIC_GET)
            .filter_ids("forum_id", &self.config.forums)
            .fields(TOPIC_FIELDS)
    }

    pub fn posts_query(&self, topic_ids: &[u64]) -> ApiQuery {
        ApiQuery::new(METHOD_POST_GET)
            .filter_ids("topic_id", topic_ids)
            .fields(POST_FIELDS)
    }

    fn post_link(&self, post_id: u64) -> String {
        format!(
            "{}/viewtopic.php?pid={post_id}#p{post_id}",
            self.config.forum_base
        )
    }

    /// Keyed by lower-cased, trimmed username. Rows without an author are
    /// not keyed.
    fn post_sighting(&self, record: &RawRecord) -> Option<Sighting> {
        let name = record.str_field("username")?.trim();
        if name.is_empty() {
            return None;
        }
        Some(Sighting {
            key: name.to_lowercase(),
            display_name: name.to_string(),
            id: record.positive_id("user_id"),
            link: record.u64_field("id").map(|id| self.post_link(id)),
        })
    }

    /// Two-pass aggregation: first-post ids are computed over the whole
    /// set before any row is filtered.
    pub fn aggregate_posts(&self, posts: &[RawRecord]) -> Aggregate {
        let first_posts = FirstPostIndex::build(posts, "topic_id", "id");
        let include_first = self.config.include_first_post;
        aggregate(
            posts,
            |record| self.post_sighting(record),
            |record| include_first || !first_posts.is_first(record),
        )
    }

    fn meta(&self, progress: &RunProgress, complete: bool) -> SnapshotMeta {
        SnapshotMeta {
            run_id: progress.log.run_id,
            generated_at: Utc::now(),
            forums: self.config.forums.clone(),
            topics: progress.topics,
            include_first_post: self.config.include_first_post,
            complete,
            requested_by: self.host.user_id,
            group_id: self.host.group_id,
            board_id: self.host.board_id,
        }
    }

    /// Run once. `Ok(None)` means there was nothing to count.
    pub async fn run(&self, progress: &mut RunProgress) -> Result<Option<Snapshot>> {
        let cancel = self.client.cancel_flag().clone();
        let paginator = self.paginator();

        progress.log.record(EventKind::RunStarted {
            forums: self.config.forums.clone(),
            include_first_post: self.config.include_first_post,
            requested_by: self.host.user_id,
        });

        progress.stage = Stage::Topics;
        let topics = paginator
            .fetch_all_pages(&self.client, &self.topics_query())
            .await?;
        let mut seen = HashSet::new();
        let topic_ids: Vec<u64> = topics
            .iter()
            .filter_map(|t| t.positive_id("id"))
            .filter(|id| seen.insert(*id))
            .collect();
        progress.topics = topic_ids.len();
        progress.log.record(EventKind::TopicsFetched {
            topics: topic_ids.len(),
        });

        if topic_ids.is_empty() {
            progress.log.record(EventKind::NoData {
                reason: "no topics in the selected forums".to_string(),
            });
            progress.stage = Stage::Done;
            return Ok(None);
        }

        progress.stage = Stage::Posts;
        let mut posts = Vec::new();
        // limit/skip pages shift when posts land mid-walk, so the same id
        // can come back twice
        let mut seen_posts = HashSet::new();
        for (batch, chunk) in topic_ids.chunks(self.config.topic_batch_size).enumerate() {
            cancel.sleep(self.config.delay_between_requests).await?;
            let rows = paginator
                .fetch_all_pages(&self.client, &self.posts_query(chunk))
                .await?;
            let fetched = rows.len();
            let before = posts.len();
            posts.extend(
                rows.into_iter()
                    .filter(|post| post.u64_field("id").map_or(true, |id| seen_posts.insert(id))),
            );
            let kept = posts.len() - before;
            if kept < fetched {
                debug!(batch = batch + 1, duplicates = fetched - kept, "Dropped repeated post rows");
            }
            progress.log.record(EventKind::PostsFetched {
                batch: batch + 1,
                topics: chunk.len(),
                posts: kept,
            });
        }

        progress.stage = Stage::Aggregate;
        let aggregate = self.aggregate_posts(&posts);
        progress.log.record(EventKind::PostsAggregated {
            counted: aggregate.total_count(),
            excluded: aggregate.filtered,
            anonymous: aggregate.unkeyed,
            users: aggregate.len(),
        });

        if aggregate.is_empty() {
            progress.log.record(EventKind::NoData {
                reason: "no countable posts".to_string(),
            });
            progress.stage = Stage::Done;
            return Ok(None);
        }

        progress.stage = Stage::Resolve;
        progress.entries = Some(aggregate.into_sorted());
        let lookup: &dyn IdLookup = match &self.lookup {
            Some(lookup) => lookup.as_ref(),
            None => &self.client,
        };
        if let Some(entries) = progress.entries.as_mut() {
            if entries.iter().any(|e| !e.is_resolved()) {
                cancel.sleep(self.config.delay_between_requests).await?;
            }
            let stats = Resolver::new(self.config.delay_between_requests)
                .resolve_ids(entries, lookup, &cancel, &mut progress.log)
                .await?;
            info!(
                looked_up = stats.looked_up,
                resolved = stats.resolved,
                missed = stats.missed,
                already_known = stats.already_known,
                "Resolution finished"
            );
        }

        progress.stage = Stage::Snapshot;
        let snapshot = self.finish(progress, true);
        progress.stage = Stage::Done;
        Ok(Some(snapshot))
    }

    /// Run under the configured deadline, if any. When the deadline hits
    /// after aggregation, the partial snapshot is returned with
    /// `meta.complete = false`; earlier than that the run fails.
    pub async fn run_with_deadline(&self, progress: &mut RunProgress) -> Result<Option<Snapshot>> {
        let Some(deadline) = self.config.run_deadline else {
            return self.run(progress).await;
        };

        let outcome = tokio::time::timeout(deadline, self.run(progress)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                let stage = progress.stage.to_string();
                progress.log.record(EventKind::DeadlineExceeded {
                    stage: stage.clone(),
                });
                if progress.entries.is_some() {
                    Ok(Some(self.finish(progress, false)))
                } else {
                    Err(RecountError::DeadlineExceeded { deadline, stage })
                }
            }
        }
    }

    fn finish(&self, progress: &mut RunProgress, complete: bool) -> Snapshot {
        let entries = progress.entries.take().unwrap_or_default();
        let snapshot = build_snapshot(entries, self.meta(progress, complete));
        progress.log.record(EventKind::SnapshotBuilt {
            total_users: snapshot.total_users(),
            total_posts: snapshot.total_posts(),
            resolved: snapshot.resolved.len(),
            unresolved: snapshot.unresolved.len(),
            complete,
        });
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockForum;
    use forum_api::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn pipeline(forum: Arc<MockForum>, config: RecountConfig) -> RecountPipeline {
        let client = ForumClient::new(&config.api_base, forum)
            .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(10)));
        RecountPipeline::builder()
            .client(client)
            .config(Arc::new(config))
            .build()
    }

    fn config() -> RecountConfig {
        RecountConfig {
            api_base: "https://forum.example/api.php".into(),
            forum_base: "https://forum.example".into(),
            forums: vec![10],
            ..RecountConfig::default()
        }
    }

    #[test]
    fn posts_query_lists_topics_and_fields() {
        let p = pipeline(MockForum::new(), config());
        let url = p.posts_query(&[100, 101]).url("https://forum.example/api.php");
        assert!(url.contains("method=post.get"));
        assert!(url.contains("topic_id=100%2C101"));
        assert!(url.contains("fields=id%2Ctopic_id%2Cusername%2Cuser_id%2Cposted"));
    }

    #[test]
    fn include_first_post_counts_openers() {
        let posts: Vec<RawRecord> = [(1, 7, "a"), (2, 7, "b")]
            .iter()
            .map(|(id, topic, name)| {
                json!({"id": id, "topic_id": topic, "username": name})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect();

        let excluded = pipeline(MockForum::new(), config()).aggregate_posts(&posts);
        assert_eq!(excluded.total_count(), 1);

        let included = pipeline(
            MockForum::new(),
            RecountConfig {
                include_first_post: true,
                ..config()
            },
        )
        .aggregate_posts(&posts);
        assert_eq!(included.total_count(), 2);
        assert_eq!(
            included.get("a").unwrap().sample_links,
            vec!["https://forum.example/viewtopic.php?pid=1#p1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_forum_yields_none() {
        let forum = MockForum::new();
        let mut progress = RunProgress::new(RunLog::new(None));
        let result = pipeline(forum, config()).run(&mut progress).await.unwrap();
        assert!(result.is_none());
        assert!(progress
            .log
            .kinds()
            .any(|k| matches!(k, EventKind::NoData { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_post_rows_count_once() {
        let forum = MockForum::new();
        forum.add_topic(1, 10);
        forum.add_post(1, 1, "opener");
        forum.add_post(2, 1, "alice");
        // served again on a later page after the listing shifted
        forum.add_post(2, 1, "alice");
        forum.add_post(3, 1, "bob");

        let mut progress = RunProgress::new(RunLog::new(None));
        let snapshot = pipeline(
            forum.clone(),
            RecountConfig {
                page_size: 2,
                ..config()
            },
        )
        .run(&mut progress)
        .await
        .unwrap()
        .unwrap();

        assert_eq!(snapshot.total_posts(), 2);
        let alice = snapshot.entries().find(|e| e.key == "alice").unwrap();
        assert_eq!(alice.count, 1);
        assert_eq!(
            alice.sample_links,
            vec!["https://forum.example/viewtopic.php?pid=2#p2"]
        );
        assert!(progress
            .log
            .kinds()
            .any(|k| matches!(k, EventKind::PostsFetched { posts: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn topic_ids_are_batched() {
        let forum = MockForum::new();
        for topic in 1..=5 {
            forum.add_topic(topic, 10);
            forum.add_post(topic * 10, topic, "opener");
            forum.add_post(topic * 10 + 1, topic, "Replier");
        }
        forum.add_user("replier", 77);

        let mut progress = RunProgress::new(RunLog::new(None));
        let snapshot = pipeline(
            forum.clone(),
            RecountConfig {
                topic_batch_size: 2,
                ..config()
            },
        )
        .run(&mut progress)
        .await
        .unwrap()
        .unwrap();

        assert_eq!(forum.requests_for("post.get").len(), 3);
        assert_eq!(snapshot.total_posts(), 5);
        assert_eq!(snapshot.resolved[0].id, Some(77));
    }
}
