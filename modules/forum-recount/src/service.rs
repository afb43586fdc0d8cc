//! RecountService: what a UI drives (run, stop, send, latest).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use forum_api::{CancelFlag, ForumClient, HttpTransport};
use tracing::{info, warn};

use crate::config::{HostContext, RecountConfig};
use crate::error::{RecountError, Result};
use crate::recount::{RecountPipeline, RunProgress};
use crate::reporter::{Ack, BackendReporter};
use crate::resolve::IdLookup;
use crate::run_log::{EventKind, LogSink, RunLog};
use crate::snapshot::{Snapshot, SnapshotSlot};

pub struct RecountService {
    config: Arc<RecountConfig>,
    transport: Arc<dyn HttpTransport>,
    host: HostContext,
    lookup: Option<Arc<dyn IdLookup>>,
    slot: SnapshotSlot,
    running: Arc<AtomicBool>,
    cancel: Mutex<CancelFlag>,
}

/// Clears the running flag however the run ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RecountService {
    /// Validates `config` once, up front.
    pub fn new(
        config: RecountConfig,
        transport: Arc<dyn HttpTransport>,
        host: HostContext,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            transport,
            host,
            lookup: None,
            slot: SnapshotSlot::new(),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(CancelFlag::new()),
        })
    }

    /// Resolve ids through something other than `users.get`.
    pub fn with_lookup(mut self, lookup: Arc<dyn IdLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn config(&self) -> &RecountConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the recount once. Fails with `AlreadyRunning`, touching nothing,
    /// while another run is active. Any error is written to the log sink
    /// before it is returned.
    pub async fn run(&self, sink: Option<LogSink>) -> Result<Option<Snapshot>> {
        // Claim the run and install its flag under one lock so a concurrent
        // stop() sees either no run or this run's flag.
        let cancel = {
            let mut current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                warn!("Recount already in progress, ignoring trigger");
                return Err(RecountError::AlreadyRunning);
            }
            *current = CancelFlag::new();
            current.clone()
        };
        let _guard = RunningGuard(self.running.clone());

        let client = ForumClient::new(&self.config.api_base, self.transport.clone())
            .with_retry_policy(self.config.retry)
            .with_cancel(cancel);
        let pipeline = match &self.lookup {
            Some(lookup) => RecountPipeline::builder()
                .client(client)
                .config(self.config.clone())
                .host(self.host)
                .lookup(lookup.clone())
                .build(),
            None => RecountPipeline::builder()
                .client(client)
                .config(self.config.clone())
                .host(self.host)
                .build(),
        };

        let mut progress = RunProgress::new(RunLog::new(sink));
        let run_id = progress.log.run_id;
        info!(%run_id, forums = ?self.config.forums, "Recount run starting");

        match pipeline.run_with_deadline(&mut progress).await {
            Ok(Some(snapshot)) => {
                self.slot.publish(snapshot.clone());
                Ok(Some(snapshot))
            }
            Ok(None) => Ok(None),
            Err(RecountError::Cancelled) => {
                progress.log.record(EventKind::RunCancelled);
                Err(RecountError::Cancelled)
            }
            Err(err) => {
                progress.log.record(EventKind::RunFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Abort the active run, including any in-flight request.
    pub fn stop(&self) {
        if self.is_running() {
            info!("Stopping recount run");
        }
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Most recent snapshot produced by this service.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.slot.latest()
    }

    /// POST `snapshot` to the configured backend.
    pub async fn send(&self, snapshot: &Snapshot) -> Result<Ack> {
        let backend = self.config.backend.as_ref().ok_or_else(|| {
            RecountError::Configuration("no backend endpoint configured".to_string())
        })?;
        BackendReporter::new(self.transport.clone())
            .send_snapshot(snapshot, backend)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockForum;
    use async_trait::async_trait;
    use forum_api::HttpResponse;
    use serde_json::Value;
    use std::time::Duration;

    fn config() -> RecountConfig {
        RecountConfig {
            api_base: "https://forum.example/api.php".into(),
            forum_base: "https://forum.example".into(),
            forums: vec![10],
            ..RecountConfig::default()
        }
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let result = RecountService::new(
            RecountConfig::default(),
            MockForum::new(),
            HostContext::default(),
        );
        assert!(matches!(result, Err(RecountError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_while_running_is_refused() {
        let forum = MockForum::new();
        for id in 0..30 {
            forum.add_topic(id + 1, 10);
        }
        let service = Arc::new(
            RecountService::new(
                RecountConfig {
                    page_size: 5,
                    ..config()
                },
                forum,
                HostContext::default(),
            )
            .unwrap(),
        );

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.run(None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.is_running());

        let second = service.run(None).await;
        assert!(matches!(second, Err(RecountError::AlreadyRunning)));

        service.stop();
        let first = first.await.unwrap();
        assert!(matches!(first, Err(RecountError::Cancelled)));
        assert!(!service.is_running());
    }

    /// Accepts requests and never answers them.
    struct Unresponsive {
        started: tokio::sync::Notify,
    }

    #[async_trait]
    impl HttpTransport for Unresponsive {
        async fn get(&self, _url: &str) -> forum_api::Result<HttpResponse> {
            self.started.notify_one();
            std::future::pending().await
        }

        async fn post_json(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _body: &Value,
        ) -> forum_api::Result<HttpResponse> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stop_aborts_request_in_flight() {
        let transport = Arc::new(Unresponsive {
            started: tokio::sync::Notify::new(),
        });
        let service = Arc::new(
            RecountService::new(config(), transport.clone(), HostContext::default()).unwrap(),
        );

        let run = {
            let service = service.clone();
            tokio::spawn(async move { service.run(None).await })
        };
        transport.started.notified().await;
        assert!(service.is_running());

        service.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not stop")
            .unwrap();
        assert!(matches!(result, Err(RecountError::Cancelled)));
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn stop_before_run_does_not_leak_into_it() {
        let forum = MockForum::new();
        let service = RecountService::new(config(), forum, HostContext::default()).unwrap();
        service.stop();
        let result = service.run(None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn send_without_backend_is_configuration_error() {
        let forum = MockForum::new();
        let service = RecountService::new(config(), forum.clone(), HostContext::default()).unwrap();
        let snapshot = crate::snapshot::build_snapshot(
            vec![],
            crate::snapshot::SnapshotMeta {
                run_id: uuid::Uuid::nil(),
                generated_at: chrono::Utc::now(),
                forums: vec![10],
                topics: 0,
                include_first_post: false,
                complete: true,
                requested_by: None,
                group_id: None,
                board_id: None,
            },
        );
        let err = service.send(&snapshot).await.unwrap_err();
        assert!(matches!(err, RecountError::Configuration(_)));
        assert!(forum.posted().is_empty());
    }
}
