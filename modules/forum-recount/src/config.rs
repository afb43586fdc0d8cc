use std::time::Duration;

use forum_api::RetryPolicy;

use crate::error::{RecountError, Result};

/// Recount configuration. Loaded from environment variables once and
/// validated before the first run; every field has a documented default
/// except `api_base`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecountConfig {
    /// Forum JSON API entrypoint, e.g. `https://forum.example/api.php`. `FORUM_API_BASE`.
    pub api_base: String,
    /// Base for post links. `FORUM_BASE_URL`, default: directory of `api_base`.
    pub forum_base: String,
    /// Forums whose topics are recounted. `FORUM_IDS` (comma-separated).
    pub forums: Vec<u64>,
    /// Count each topic's opening post too. `FORUM_INCLUDE_FIRST_POST`, default false.
    pub include_first_post: bool,
    /// `limit` for every paginated call. `FORUM_PAGE_SIZE`, default 100.
    pub page_size: u32,
    /// Topic ids per `post.get` query. `FORUM_TOPIC_BATCH_SIZE`, default 50.
    pub topic_batch_size: usize,
    /// Pause between consecutive API requests. `FORUM_DELAY_MS`, default 200.
    pub delay_between_requests: Duration,
    /// `FORUM_RETRY_ATTEMPTS` (default 2), `FORUM_RETRY_BASE_DELAY_MS` (default 800).
    pub retry: RetryPolicy,
    /// Per-request timeout. `FORUM_REQUEST_TIMEOUT_MS`, default 15000.
    pub request_timeout: Duration,
    /// Pagination safety valve. `FORUM_MAX_PAGES`, default 200.
    pub max_pages: u32,
    /// Whole-run deadline. `FORUM_RUN_DEADLINE_SECS`, default none.
    pub run_deadline: Option<Duration>,
    pub backend: Option<BackendConfig>,
}

impl Default for RecountConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            forum_base: String::new(),
            forums: Vec::new(),
            include_first_post: false,
            page_size: 100,
            topic_batch_size: 50,
            delay_between_requests: Duration::from_millis(200),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(15),
            max_pages: 200,
            run_deadline: None,
            backend: None,
        }
    }
}

/// Where finished snapshots are POSTed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// `BACKEND_ENDPOINT`
    pub endpoint: String,
    /// `BACKEND_METHOD`, default `savePostStats`.
    pub method: String,
    /// `BACKEND_SUBSCRIPTION`
    pub subscription: String,
    /// `BACKEND_TABLE_KEY`
    pub table_key: String,
    /// Sent as `X-KS-Admin-Token`. `BACKEND_ADMIN_TOKEN`.
    pub admin_token: Option<String>,
}

impl BackendConfig {
    pub const DEFAULT_METHOD: &'static str = "savePostStats";

    /// Pre-flight check: an endpoint and at least one routing key.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(RecountError::Configuration(
                "backend endpoint is empty".to_string(),
            ));
        }
        if self.subscription.trim().is_empty() && self.table_key.trim().is_empty() {
            return Err(RecountError::Configuration(
                "backend needs a subscription or table key".to_string(),
            ));
        }
        if self.method.trim().is_empty() {
            return Err(RecountError::Configuration(
                "backend method is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity of whoever triggered the run, as supplied by the host
/// environment. Read-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostContext {
    /// `HOST_USER_ID`
    pub user_id: Option<u64>,
    /// `HOST_GROUP_ID`
    pub group_id: Option<u64>,
    /// `HOST_BOARD_ID`
    pub board_id: Option<u64>,
}

impl HostContext {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            user_id: parse_opt(&get, "HOST_USER_ID")?,
            group_id: parse_opt(&get, "HOST_GROUP_ID")?,
            board_id: parse_opt(&get, "HOST_BOARD_ID")?,
        })
    }
}

impl RecountConfig {
    /// Load from the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys take their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let api_base = get("FORUM_API_BASE").unwrap_or_default().trim().to_string();
        let forum_base = match get("FORUM_BASE_URL").filter(|v| !v.trim().is_empty()) {
            Some(base) => base.trim().trim_end_matches('/').to_string(),
            None => derive_forum_base(&api_base),
        };

        let forums = match get("FORUM_IDS") {
            Some(raw) => parse_id_list(&raw)?,
            None => Vec::new(),
        };

        let retry = RetryPolicy::new(
            parse_or(&get, "FORUM_RETRY_ATTEMPTS", defaults.retry.attempts)?,
            Duration::from_millis(parse_or(
                &get,
                "FORUM_RETRY_BASE_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
        );

        let backend = match get("BACKEND_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            Some(endpoint) => Some(BackendConfig {
                endpoint: endpoint.trim().to_string(),
                method: get("BACKEND_METHOD")
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| BackendConfig::DEFAULT_METHOD.to_string()),
                subscription: get("BACKEND_SUBSCRIPTION").unwrap_or_default(),
                table_key: get("BACKEND_TABLE_KEY").unwrap_or_default(),
                admin_token: get("BACKEND_ADMIN_TOKEN").filter(|v| !v.is_empty()),
            }),
            None => None,
        };

        Ok(Self {
            api_base,
            forum_base,
            forums,
            include_first_post: parse_or(
                &get,
                "FORUM_INCLUDE_FIRST_POST",
                defaults.include_first_post,
            )?,
            page_size: parse_or(&get, "FORUM_PAGE_SIZE", defaults.page_size)?,
            topic_batch_size: parse_or(&get, "FORUM_TOPIC_BATCH_SIZE", defaults.topic_batch_size)?,
            delay_between_requests: Duration::from_millis(parse_or(
                &get,
                "FORUM_DELAY_MS",
                defaults.delay_between_requests.as_millis() as u64,
            )?),
            retry,
            request_timeout: Duration::from_millis(parse_or(
                &get,
                "FORUM_REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?),
            max_pages: parse_or(&get, "FORUM_MAX_PAGES", defaults.max_pages)?,
            run_deadline: parse_opt::<u64>(&get, "FORUM_RUN_DEADLINE_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            backend,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_base.starts_with("http://") || self.api_base.starts_with("https://")) {
            return Err(RecountError::Configuration(format!(
                "FORUM_API_BASE must be an http(s) URL, got {:?}",
                self.api_base
            )));
        }
        if self.forums.is_empty() {
            return Err(RecountError::Configuration(
                "at least one forum id is required".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(RecountError::Configuration(
                "page size must be positive".to_string(),
            ));
        }
        if self.topic_batch_size == 0 {
            return Err(RecountError::Configuration(
                "topic batch size must be positive".to_string(),
            ));
        }
        if self.max_pages == 0 {
            return Err(RecountError::Configuration(
                "max pages must be positive".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(RecountError::Configuration(
                "request timeout must be positive".to_string(),
            ));
        }
        if let Some(backend) = &self.backend {
            backend.validate()?;
        }
        Ok(())
    }

    pub fn log_redacted(&self) {
        fn preview(val: &str) -> String {
            let n = val.len().min(5);
            match val.get(..n) {
                Some(head) => format!("{head}...({} chars)", val.len()),
                None => format!("({} chars)", val.len()),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  FORUM_API_BASE: {}", self.api_base);
        tracing::info!("  FORUM_BASE_URL: {}", self.forum_base);
        tracing::info!("  FORUM_IDS: {:?}", self.forums);
        tracing::info!("  FORUM_INCLUDE_FIRST_POST: {}", self.include_first_post);
        tracing::info!(
            "  paging: size={} max_pages={} delay={}ms",
            self.page_size,
            self.max_pages,
            self.delay_between_requests.as_millis()
        );
        tracing::info!(
            "  retry: attempts={} base_delay={}ms",
            self.retry.attempts,
            self.retry.base_delay.as_millis()
        );
        match &self.backend {
            Some(backend) => {
                tracing::info!("  BACKEND_ENDPOINT: {}", backend.endpoint);
                tracing::info!(
                    "  BACKEND_ADMIN_TOKEN: {}",
                    backend
                        .admin_token
                        .as_deref()
                        .map(preview)
                        .unwrap_or_else(|| "<not set>".to_string())
                );
            }
            None => tracing::info!("  BACKEND_ENDPOINT: <not set>"),
        }
    }
}

/// `https://forum.example/api.php` -> `https://forum.example`.
fn derive_forum_base(api_base: &str) -> String {
    url::Url::parse(api_base)
        .and_then(|url| url.join("."))
        .map(|url| url.as_str().trim_end_matches('/').to_string())
        .unwrap_or_default()
}

pub fn parse_id_list(raw: &str) -> Result<Vec<u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| RecountError::Configuration(format!("invalid forum id {s:?}")))
        })
        .collect()
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn parse_opt<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| RecountError::Configuration(format!("{key} has invalid value {raw:?}"))),
        None => Ok(None),
    }
}
