//! Test doubles for the recount pipeline.
//!
//! MockForum is an in-memory forum API behind the HttpTransport seam: it
//! answers topic.get / post.get / users.get from seeded rows, honours
//! limit/skip, can be told to fail, and records every request with its
//! (tokio) timestamp. POSTs are recorded and answered with a canned reply,
//! so the same mock stands in for the backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forum_api::{ForumError, HttpResponse, HttpTransport, RawRecord};
use serde_json::{json, Value};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

#[derive(Default)]
struct State {
    topics: Vec<RawRecord>,
    posts: Vec<RawRecord>,
    users: Vec<RawRecord>,
    failures: HashMap<String, u32>,
    requests: Vec<RecordedRequest>,
    posted: Vec<RecordedPost>,
    backend_reply: Option<HttpResponse>,
}

#[derive(Default)]
pub struct MockForum {
    state: Mutex<State>,
}

fn row(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        _ => RawRecord::new(),
    }
}

fn id_list(raw: Option<&String>) -> Vec<u64> {
    raw.map(|csv| csv.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default()
}

fn field_u64(record: &RawRecord, name: &str) -> Option<u64> {
    record.get(name).and_then(Value::as_u64)
}

impl MockForum {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_topic(&self, id: u64, forum_id: u64) {
        self.state.lock().unwrap().topics.push(row(json!({
            "id": id,
            "forum_id": forum_id,
            "subject": format!("Topic {id}"),
        })));
    }

    pub fn add_post(&self, id: u64, topic_id: u64, username: &str) {
        self.state.lock().unwrap().posts.push(row(json!({
            "id": id,
            "topic_id": topic_id,
            "username": username,
        })));
    }

    pub fn add_post_row(&self, post: Value) {
        self.state.lock().unwrap().posts.push(row(post));
    }

    pub fn add_user(&self, username: &str, user_id: u64) {
        self.add_user_raw(username, json!(user_id));
    }

    /// Seed a user whose `user_id` is an arbitrary JSON value.
    pub fn add_user_raw(&self, username: &str, user_id: Value) {
        self.state
            .lock()
            .unwrap()
            .users
            .push(row(json!({ "username": username, "user_id": user_id })));
    }

    /// Answer the next `times` requests for `method` with HTTP 503.
    pub fn fail_next(&self, method: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(method.to_string(), times);
    }

    pub fn reply_to_posts_with(&self, reply: HttpResponse) {
        self.state.lock().unwrap().backend_reply = Some(reply);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    pub fn posted(&self) -> Vec<RecordedPost> {
        self.state.lock().unwrap().posted.clone()
    }

    fn page(rows: Vec<RawRecord>, params: &HashMap<String, String>) -> Vec<RawRecord> {
        let skip = params
            .get("skip")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0usize);
        let limit = params
            .get("limit")
            .and_then(|s| s.parse().ok())
            .unwrap_or(usize::MAX);
        rows.into_iter().skip(skip).take(limit).collect()
    }
}

#[async_trait]
impl HttpTransport for MockForum {
    async fn get(&self, url: &str) -> forum_api::Result<HttpResponse> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ForumError::Network(format!("MockForum: bad url {url}: {e}")))?;
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        let method = params.get("method").cloned().unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        state.requests.push(RecordedRequest {
            method: method.clone(),
            url: url.to_string(),
            at: Instant::now(),
        });

        if let Some(remaining) = state.failures.get_mut(&method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(HttpResponse {
                    status: 503,
                    body: "Service Unavailable".to_string(),
                });
            }
        }

        let rows: Vec<RawRecord> = match method.as_str() {
            "topic.get" => {
                let forums = id_list(params.get("forum_id"));
                let matching = state
                    .topics
                    .iter()
                    .filter(|t| field_u64(t, "forum_id").is_some_and(|f| forums.contains(&f)))
                    .cloned()
                    .collect();
                Self::page(matching, &params)
            }
            "post.get" => {
                let topics = id_list(params.get("topic_id"));
                let matching = state
                    .posts
                    .iter()
                    .filter(|p| field_u64(p, "topic_id").is_some_and(|t| topics.contains(&t)))
                    .cloned()
                    .collect();
                Self::page(matching, &params)
            }
            "users.get" => {
                let wanted = params
                    .get("username")
                    .map(|u| u.to_lowercase())
                    .unwrap_or_default();
                state
                    .users
                    .iter()
                    .filter(|u| {
                        u.get("username")
                            .and_then(Value::as_str)
                            .is_some_and(|name| name.to_lowercase() == wanted)
                    })
                    .cloned()
                    .collect()
            }
            other => {
                let body = json!({ "error": { "code": 404, "message": format!("unknown method {other}") } });
                return Ok(HttpResponse::ok(body.to_string()));
            }
        };

        Ok(HttpResponse::ok(json!({ "response": rows }).to_string()))
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
    ) -> forum_api::Result<HttpResponse> {
        let mut state = self.state.lock().unwrap();
        state.posted.push(RecordedPost {
            url: url.to_string(),
            headers: headers.to_vec(),
            body: body.clone(),
        });
        Ok(state
            .backend_reply
            .clone()
            .unwrap_or_else(|| HttpResponse::ok(r#"{"ok":true}"#)))
    }
}
