//! End-to-end runs against the in-memory forum.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use forum_api::{ForumClient, ForumError, RetryPolicy};
use forum_recount::testing::MockForum;
use forum_recount::{
    BackendConfig, EventKind, HostContext, LogSink, RecountConfig, RecountError, RecountPipeline,
    RecountService, RunEvent, RunLog, RunProgress,
};

fn config(forums: Vec<u64>) -> RecountConfig {
    RecountConfig {
        api_base: "https://forum.example/api.php".into(),
        forum_base: "https://forum.example".into(),
        forums,
        ..RecountConfig::default()
    }
}

fn pipeline(forum: Arc<MockForum>, config: RecountConfig) -> RecountPipeline {
    let client = ForumClient::new(&config.api_base, forum).with_retry_policy(config.retry);
    RecountPipeline::builder()
        .client(client)
        .config(Arc::new(config))
        .host(HostContext {
            user_id: Some(2),
            group_id: Some(1),
            board_id: Some(5),
        })
        .build()
}

/// Two forums, one topic each, three posts per topic.
fn two_topic_forum() -> Arc<MockForum> {
    let forum = MockForum::new();
    forum.add_topic(100, 10);
    forum.add_topic(101, 13);
    forum.add_post(1, 100, "alice");
    forum.add_post(2, 100, "Bob");
    forum.add_post(3, 100, "Alice");
    forum.add_post(4, 101, "carol");
    forum.add_post(5, 101, "alice");
    forum.add_post(6, 101, "bob");
    forum.add_user("alice", 11);
    forum.add_user("bob", 12);
    forum
}

#[tokio::test(start_paused = true)]
async fn opening_posts_are_excluded_across_forums() {
    let forum = two_topic_forum();
    let mut progress = RunProgress::new(RunLog::new(None));

    let snapshot = pipeline(forum.clone(), config(vec![10, 13]))
        .run(&mut progress)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(snapshot.total_posts(), 4);
    assert_eq!(snapshot.total_users(), 2);
    assert!(snapshot.unresolved.is_empty());
    assert!(snapshot.meta.complete);
    assert_eq!(snapshot.meta.topics, 2);
    assert_eq!(snapshot.meta.requested_by, Some(2));
    assert_eq!(snapshot.meta.group_id, Some(1));
    assert_eq!(snapshot.meta.board_id, Some(5));

    let alice = snapshot.entries().find(|e| e.key == "alice").unwrap();
    assert_eq!(alice.count, 2);
    assert_eq!(alice.id, Some(11));
    assert_eq!(
        alice.sample_links,
        vec![
            "https://forum.example/viewtopic.php?pid=3#p3",
            "https://forum.example/viewtopic.php?pid=5#p5",
        ]
    );
    let bob = snapshot.entries().find(|e| e.key == "bob").unwrap();
    assert_eq!(bob.count, 2);
    assert_eq!(bob.id, Some(12));
    assert!(snapshot.entries().all(|e| e.key != "carol"));

    let topic_requests = forum.requests_for("topic.get");
    assert_eq!(topic_requests.len(), 1);
    assert!(topic_requests[0].url.contains("forum_id=10%2C13"));
}

#[tokio::test(start_paused = true)]
async fn including_opening_posts_counts_everything() {
    let forum = two_topic_forum();
    let mut progress = RunProgress::new(RunLog::new(None));

    let snapshot = pipeline(
        forum,
        RecountConfig {
            include_first_post: true,
            ..config(vec![10, 13])
        },
    )
    .run(&mut progress)
    .await
    .unwrap()
    .unwrap();

    assert_eq!(snapshot.total_posts(), 6);
    assert_eq!(snapshot.total_users(), 3);
    // carol never shows up in users.get
    assert_eq!(snapshot.unresolved.len(), 1);
    assert_eq!(snapshot.unresolved[0].display_name, "carol");
    assert_eq!(snapshot.entries().next().unwrap().key, "alice");
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_linear_backoff() {
    let forum = two_topic_forum();
    forum.fail_next("topic.get", 2);
    let mut progress = RunProgress::new(RunLog::new(None));

    let snapshot = pipeline(
        forum.clone(),
        RecountConfig {
            retry: RetryPolicy::new(2, Duration::from_millis(800)),
            ..config(vec![10, 13])
        },
    )
    .run(&mut progress)
    .await
    .unwrap()
    .unwrap();
    assert_eq!(snapshot.total_posts(), 4);

    let attempts = forum.requests_for("topic.get");
    assert_eq!(attempts.len(), 3);
    assert!(attempts[1].at - attempts[0].at >= Duration::from_millis(800));
    assert!(attempts[2].at - attempts[1].at >= Duration::from_millis(1600));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_run() {
    let forum = two_topic_forum();
    forum.fail_next("topic.get", 3);
    let mut progress = RunProgress::new(RunLog::new(None));

    let err = pipeline(
        forum.clone(),
        RecountConfig {
            retry: RetryPolicy::new(2, Duration::from_millis(800)),
            ..config(vec![10, 13])
        },
    )
    .run(&mut progress)
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        RecountError::Forum(ForumError::RequestFailed { attempts: 3, .. })
    ));
    assert!(forum.requests_for("post.get").is_empty());
}

#[tokio::test(start_paused = true)]
async fn deadline_after_aggregation_returns_partial_snapshot() {
    let forum = MockForum::new();
    forum.add_topic(1, 10);
    forum.add_post(1, 1, "opener");
    for (n, name) in ["u1", "u2", "u3", "u4", "u5"].iter().enumerate() {
        forum.add_post(n as u64 + 2, 1, name);
        forum.add_user(name, n as u64 + 1);
    }
    let mut progress = RunProgress::new(RunLog::new(None));

    // posts at 200ms, lookups at 400ms and 600ms, deadline mid-pause
    let snapshot = pipeline(
        forum.clone(),
        RecountConfig {
            run_deadline: Some(Duration::from_millis(700)),
            ..config(vec![10])
        },
    )
    .run_with_deadline(&mut progress)
    .await
    .unwrap()
    .unwrap();

    assert!(!snapshot.meta.complete);
    assert_eq!(snapshot.total_posts(), 5);
    assert_eq!(snapshot.resolved.len(), 2);
    assert_eq!(snapshot.unresolved.len(), 3);
    assert_eq!(forum.requests_for("users.get").len(), 2);
    assert!(progress
        .log
        .kinds()
        .any(|k| matches!(k, EventKind::DeadlineExceeded { stage } if stage == "user resolution")));
}

#[tokio::test(start_paused = true)]
async fn deadline_before_aggregation_is_an_error() {
    let forum = two_topic_forum();
    let mut progress = RunProgress::new(RunLog::new(None));

    let err = pipeline(
        forum,
        RecountConfig {
            run_deadline: Some(Duration::from_millis(100)),
            ..config(vec![10, 13])
        },
    )
    .run_with_deadline(&mut progress)
    .await
    .unwrap_err();

    assert!(matches!(err, RecountError::DeadlineExceeded { ref stage, .. } if stage == "post fetch"));
}

#[tokio::test(start_paused = true)]
async fn service_runs_publishes_and_sends() {
    let forum = two_topic_forum();
    let service = RecountService::new(
        RecountConfig {
            backend: Some(BackendConfig {
                endpoint: "https://backend.example/exec".into(),
                method: BackendConfig::DEFAULT_METHOD.into(),
                subscription: "sub-1".into(),
                table_key: "posts".into(),
                admin_token: None,
            }),
            ..config(vec![10, 13])
        },
        forum.clone(),
        HostContext::default(),
    )
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let sink: LogSink = Arc::new(move |event: &RunEvent| {
        sink_seen.lock().unwrap().push(event.kind.clone());
    });

    let snapshot = service.run(Some(sink)).await.unwrap().unwrap();
    assert_eq!(service.latest().as_deref(), Some(&snapshot));

    let kinds = seen.lock().unwrap().clone();
    assert!(matches!(kinds.first(), Some(EventKind::RunStarted { .. })));
    assert!(matches!(
        kinds.last(),
        Some(EventKind::SnapshotBuilt {
            total_posts: 4,
            complete: true,
            ..
        })
    ));

    service.send(&snapshot).await.unwrap();
    let posted = forum.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].url, "https://backend.example/exec?method=savePostStats");
    assert_eq!(posted[0].body["totalPosts"], 4);
    assert_eq!(posted[0].body["subscription"], "sub-1");
    assert!(posted[0].headers.is_empty());
}
