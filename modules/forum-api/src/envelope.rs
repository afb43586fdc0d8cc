//! The `{ response }` / `{ error }` wrapper every forum API call returns.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ForumError, Result};

/// Server-reported failure inside an `error` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiFailure {
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<ApiFailure> for ForumError {
    fn from(failure: ApiFailure) -> Self {
        let code = match failure.code {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => "unknown".to_string(),
            Some(other) => other.to_string(),
        };
        ForumError::Api {
            code,
            message: failure
                .message
                .unwrap_or_else(|| "no message from server".to_string()),
        }
    }
}

/// Validate an HTTP response and unwrap its envelope.
///
/// Exactly one of `response` or `error` must be present.
pub fn parse_envelope(status: u16, body: &str) -> Result<Value> {
    if !(200..300).contains(&status) {
        return Err(ForumError::Http {
            status,
            message: truncate(body, 200).to_string(),
        });
    }

    let value: Value = serde_json::from_str(body)?;
    let Value::Object(mut map) = value else {
        return Err(ForumError::MalformedResponse(
            "envelope is not a JSON object".to_string(),
        ));
    };

    match (map.remove("response"), map.remove("error")) {
        (Some(response), None) => Ok(response),
        (None, Some(error)) => {
            let failure: ApiFailure = serde_json::from_value(error)
                .map_err(|e| ForumError::MalformedResponse(format!("bad error object: {e}")))?;
            Err(failure.into())
        }
        (Some(_), Some(_)) => Err(ForumError::MalformedResponse(
            "envelope carries both response and error".to_string(),
        )),
        (None, None) => Err(ForumError::MalformedResponse(
            "envelope carries neither response nor error".to_string(),
        )),
    }
}

fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}
