pub mod cancel;
pub mod envelope;
pub mod error;
pub mod paginate;
pub mod retry;
pub mod transport;
pub mod types;

pub use cancel::CancelFlag;
pub use envelope::parse_envelope;
pub use error::{ForumError, Result};
pub use paginate::Paginator;
pub use retry::{with_retry, RetryPolicy};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};
pub use types::{
    positive_id, ApiQuery, PageRequest, PageResult, RawRecord, RecordExt, METHOD_POST_GET,
    METHOD_TOPIC_GET, METHOD_USERS_GET,
};

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

/// Forum JSON API client. Every call goes through the retry policy and
/// observes the cancel flag.
#[derive(Clone)]
pub struct ForumClient {
    transport: Arc<dyn HttpTransport>,
    api_base: String,
    retry: RetryPolicy,
    cancel: CancelFlag,
}

impl ForumClient {
    pub fn new(api_base: &str, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            api_base: api_base.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// GET `url`, unwrap the envelope, retry per policy.
    /// `label` only appears in diagnostics.
    pub async fn fetch_with_retry(&self, url: &str, label: &str) -> Result<Value> {
        with_retry(&self.retry, label, &self.cancel, |_| self.fetch_once(url)).await
    }

    async fn fetch_once(&self, url: &str) -> Result<Value> {
        let resp = self.transport.get(url).await?;
        parse_envelope(resp.status, &resp.body)
    }

    /// Fetch one page. A response that is not a row collection counts as
    /// malformed and is retried like any other failure.
    pub async fn fetch_page(&self, request: &PageRequest) -> Result<PageResult> {
        let url = request.url(&self.api_base);
        let label = request.label();
        let url = url.as_str();
        let rows = with_retry(&self.retry, &label, &self.cancel, |_| async move {
            let value = self.fetch_once(url).await?;
            rows_from_response(value)
        })
        .await?;

        debug!(label = %label, rows = rows.len(), "Fetched page");
        Ok(PageResult::new(rows, request.limit))
    }

    /// Look up a user row by name via `users.get`. An exact
    /// case-insensitive match wins over the first row returned.
    pub async fn find_user(&self, username: &str) -> Result<Option<RawRecord>> {
        let url = ApiQuery::new(METHOD_USERS_GET)
            .filter("username", username)
            .fields(&["user_id", "username"])
            .url(&self.api_base);
        let value = self
            .fetch_with_retry(&url, &format!("users.get username={username}"))
            .await?;
        // users.get answers a unique name with the bare row
        let rows = match value {
            Value::Object(row) if !row.values().all(Value::is_object) => vec![row],
            other => rows_from_response(other)?,
        };

        let wanted = username.to_lowercase();
        let exact = rows.iter().position(|row| {
            row.str_field("username")
                .is_some_and(|name| name.to_lowercase() == wanted)
        });
        Ok(match exact {
            Some(index) => rows.into_iter().nth(index),
            None => rows.into_iter().next(),
        })
    }
}

/// Accepts an array of objects or an id-keyed object of objects, in
/// arrival order. `null` reads as no rows; anything else is malformed.
pub fn rows_from_response(value: Value) -> Result<Vec<RawRecord>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(ForumError::MalformedResponse(format!(
                    "expected object row, got {other}"
                ))),
            })
            .collect(),
        Value::Object(map) if map.values().all(Value::is_object) => Ok(map
            .into_iter()
            .filter_map(|(_, v)| match v {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect()),
        other => Err(ForumError::MalformedResponse(format!(
            "expected rows, got {other}"
        ))),
    }
}
