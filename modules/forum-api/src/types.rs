use serde_json::{Map, Value};

/// One row as returned by the API. Fields consumed are declared per use site.
pub type RawRecord = Map<String, Value>;

/// Forum API methods consumed by this crate.
pub const METHOD_TOPIC_GET: &str = "topic.get";
pub const METHOD_POST_GET: &str = "post.get";
pub const METHOD_USERS_GET: &str = "users.get";

/// Method, filters and field list of a call. Rendered with paging
/// parameters by [`PageRequest::url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiQuery {
    pub method: String,
    pub filters: Vec<(String, String)>,
    pub fields: Vec<String>,
}

impl ApiQuery {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            filters: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn filter(mut self, name: &str, value: impl Into<String>) -> Self {
        self.filters.push((name.to_string(), value.into()));
        self
    }

    /// Filter on a comma-separated list of ids.
    pub fn filter_ids(self, name: &str, ids: &[u64]) -> Self {
        let csv = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.filter(name, csv)
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Render `{api_base}?method=..&{filters}&fields=..` plus extra pairs.
    pub fn url_with(&self, api_base: &str, extra: &[(&str, String)]) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("method", &self.method);
        for (name, value) in &self.filters {
            query.append_pair(name, value);
        }
        if !self.fields.is_empty() {
            query.append_pair("fields", &self.fields.join(","));
        }
        for (name, value) in extra {
            query.append_pair(name, value);
        }

        let separator = if api_base.contains('?') { '&' } else { '?' };
        format!("{api_base}{separator}{}", query.finish())
    }

    pub fn url(&self, api_base: &str) -> String {
        self.url_with(api_base, &[])
    }
}

/// A single page of a limit/skip query. Immutable per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub query: ApiQuery,
    pub limit: u32,
    pub skip: u64,
}

impl PageRequest {
    pub fn url(&self, api_base: &str) -> String {
        self.query.url_with(
            api_base,
            &[("limit", self.limit.to_string()), ("skip", self.skip.to_string())],
        )
    }

    pub fn label(&self) -> String {
        format!("{} skip={}", self.query.method, self.skip)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub rows: Vec<RawRecord>,
    pub is_last_page: bool,
}

impl PageResult {
    pub fn new(rows: Vec<RawRecord>, limit: u32) -> Self {
        let is_last_page = rows.is_empty() || rows.len() < limit as usize;
        Self { rows, is_last_page }
    }
}

/// Typed accessors over loosely-typed API rows. Numeric fields arrive
/// either as JSON numbers or as numeric strings.
pub trait RecordExt {
    fn field(&self, name: &str) -> Option<&Value>;

    fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    fn u64_field(&self, name: &str) -> Option<u64> {
        self.field(name).and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// A strictly positive, finite, integral id, or `None`.
    fn positive_id(&self, name: &str) -> Option<u64> {
        self.field(name).and_then(positive_id)
    }
}

impl RecordExt for RawRecord {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Interpret a JSON value as a canonical external id.
///
/// Zero, negatives, non-finite and fractional numbers are rejected.
pub fn positive_id(value: &Value) -> Option<u64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !number.is_finite() || number <= 0.0 || number.fract() != 0.0 || number > u64::MAX as f64 {
        return None;
    }
    Some(number as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_url_renders_all_parts_in_order() {
        let request = PageRequest {
            query: ApiQuery::new(METHOD_TOPIC_GET)
                .filter_ids("forum_id", &[10, 13])
                .fields(&["id", "subject"]),
            limit: 100,
            skip: 200,
        };
        assert_eq!(
            request.url("https://forum.example/api.php"),
            "https://forum.example/api.php?method=topic.get&forum_id=10%2C13&fields=id%2Csubject&limit=100&skip=200"
        );
    }

    #[test]
    fn url_appends_to_existing_query() {
        let url = ApiQuery::new(METHOD_USERS_GET)
            .filter("username", "Анна & Co")
            .url("https://forum.example/api.php?board=7");
        assert!(url.starts_with("https://forum.example/api.php?board=7&method=users.get&username="));
        assert!(!url.contains(' '));
    }

    #[test]
    fn short_or_empty_page_is_last() {
        let row = json!({"id": 1}).as_object().cloned().unwrap();
        assert!(PageResult::new(vec![], 10).is_last_page);
        assert!(PageResult::new(vec![row.clone()], 10).is_last_page);
        assert!(!PageResult::new(vec![row], 1).is_last_page);
    }

    #[test]
    fn positive_id_rejects_non_ids() {
        assert_eq!(positive_id(&json!(42)), Some(42));
        assert_eq!(positive_id(&json!("17")), Some(17));
        assert_eq!(positive_id(&json!(0)), None);
        assert_eq!(positive_id(&json!(-3)), None);
        assert_eq!(positive_id(&json!(2.5)), None);
        assert_eq!(positive_id(&json!("NaN")), None);
        assert_eq!(positive_id(&json!(null)), None);
    }

    #[test]
    fn record_accessors_accept_numeric_strings() {
        let record = json!({"id": "12", "username": "Mira"})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(record.u64_field("id"), Some(12));
        assert_eq!(record.str_field("username"), Some("Mira"));
        assert_eq!(record.u64_field("missing"), None);
    }
}
