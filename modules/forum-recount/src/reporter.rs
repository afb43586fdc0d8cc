use std::sync::Arc;

use forum_api::{CancelFlag, HttpTransport};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::aggregate::AggregateEntry;
use crate::config::BackendConfig;
use crate::error::{RecountError, Result};
use crate::snapshot::Snapshot;

/// Header carrying the optional admin token.
pub const ADMIN_TOKEN_HEADER: &str = "X-KS-Admin-Token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackendReply {
    ok: Option<bool>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

impl BackendReply {
    fn server_message(&self) -> Option<String> {
        match &self.error {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Object(obj)) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
        .or_else(|| self.message.clone().filter(|m| !m.is_empty()))
    }
}

/// POSTs finished snapshots to the backend. Single attempt; a failed send
/// leaves the snapshot intact for another try.
pub struct BackendReporter {
    transport: Arc<dyn HttpTransport>,
    cancel: CancelFlag,
}

impl BackendReporter {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn send_snapshot(&self, snapshot: &Snapshot, backend: &BackendConfig) -> Result<Ack> {
        backend.validate()?;

        let url = endpoint_url(backend);
        let body = build_payload(snapshot, backend);
        let mut headers = Vec::new();
        if let Some(token) = backend.admin_token.as_deref().filter(|t| !t.is_empty()) {
            headers.push((ADMIN_TOKEN_HEADER.to_string(), token.to_string()));
        }

        info!(
            endpoint = %backend.endpoint,
            method = %backend.method,
            users = snapshot.total_users(),
            "Sending snapshot to backend"
        );

        let resp = self
            .cancel
            .guard(self.transport.post_json(&url, &headers, &body))
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    RecountError::Cancelled
                } else {
                    RecountError::Backend(e.to_string())
                }
            })?;

        let reply: Option<BackendReply> = serde_json::from_str(&resp.body).ok();

        if !(200..300).contains(&resp.status) {
            let message = reply
                .as_ref()
                .and_then(BackendReply::server_message)
                .unwrap_or_else(|| format!("backend returned HTTP {}", resp.status));
            warn!(status = resp.status, %message, "Backend rejected request");
            return Err(RecountError::Backend(message));
        }

        let Some(reply) = reply else {
            return Err(RecountError::Backend(
                "malformed backend response".to_string(),
            ));
        };

        match reply.ok {
            Some(true) => {
                let message = reply.message.clone();
                info!(?message, "Backend accepted snapshot");
                Ok(Ack { message })
            }
            Some(false) => Err(RecountError::Backend(
                reply
                    .server_message()
                    .unwrap_or_else(|| "backend rejected the snapshot".to_string()),
            )),
            None => Err(RecountError::Backend(
                "malformed backend response: missing ok flag".to_string(),
            )),
        }
    }
}

fn endpoint_url(backend: &BackendConfig) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("method", &backend.method)
        .finish();
    let separator = if backend.endpoint.contains('?') { '&' } else { '?' };
    format!("{}{separator}{query}", backend.endpoint.trim())
}

fn entry_json(entry: &AggregateEntry) -> Value {
    json!({
        "user_id": entry.id,
        "username": entry.display_name,
        "posts": entry.count,
        "links": entry.sample_links,
    })
}

/// `{ subscription, tableKey, ...payload }`.
pub fn build_payload(snapshot: &Snapshot, backend: &BackendConfig) -> Value {
    json!({
        "subscription": backend.subscription,
        "tableKey": backend.table_key,
        "totalUsers": snapshot.total_users(),
        "totalPosts": snapshot.total_posts(),
        "users": snapshot.resolved.iter().map(entry_json).collect::<Vec<_>>(),
        "unresolved": snapshot.unresolved.iter().map(entry_json).collect::<Vec<_>>(),
        "meta": snapshot.meta,
    })
}
