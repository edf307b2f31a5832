//! Backend transport abstraction and response classification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tandem_core::{ErrorClass, RemoteId};
use tandem_store::{Method, OutboxItem};
use thiserror::Error;

pub const AUTHORIZATION: &str = "Authorization";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CORRELATION_ID: &str = "X-Correlation-ID";
/// Set by the backend when it answers from its idempotency cache.
pub const IDEMPOTENT_REPLAY: &str = "Idempotent-Replayed";

/// A request as it goes on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Render an outbox item with the session's bearer token.
    pub fn from_item(item: &OutboxItem, token: &str) -> Self {
        let mut headers = item.headers.clone();
        headers.insert(AUTHORIZATION.to_string(), format!("Bearer {}", token));
        headers.insert(CORRELATION_ID.to_string(), item.correlation_id.to_string());
        if item.body.is_some() {
            headers.insert(CONTENT_TYPE.to_string(), "application/json".to_string());
        }
        Self {
            method: item.method,
            url: item.url_template.clone(),
            headers,
            body: item.body.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_ID)
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.header(AUTHORIZATION)?.strip_prefix("Bearer ")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The server-assigned id in the body (`id`, string or number).
    pub fn remote_id(&self) -> Option<RemoteId> {
        match self.body.as_ref()?.get("id")? {
            Value::String(id) if !id.is_empty() => Some(RemoteId::new(id.clone())),
            Value::Number(id) => Some(RemoteId::new(id.to_string())),
            _ => None,
        }
    }
}

fn find_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Failure to get any response at all.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("network unreachable")]
    Offline,
}

/// Abstract backend the dispatcher talks to.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// How a dispatch attempt ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Acknowledged {
        remote: Option<RemoteId>,
        duplicate: bool,
    },
    Failed {
        class: ErrorClass,
        reason: String,
    },
}

/// Map a response (or transport failure) onto what happens to the item.
pub fn classify(method: Method, result: &Result<HttpResponse, TransportError>) -> Outcome {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            return Outcome::Failed {
                class: ErrorClass::TransientNetwork,
                reason: e.to_string(),
            }
        }
    };

    if response.is_success() {
        return Outcome::Acknowledged {
            remote: response.remote_id(),
            duplicate: response.header(IDEMPOTENT_REPLAY).is_some(),
        };
    }

    match response.status {
        // Already processed; the body names the existing resource.
        409 if response.remote_id().is_some() || response.header(IDEMPOTENT_REPLAY).is_some() => {
            Outcome::Acknowledged {
                remote: response.remote_id(),
                duplicate: true,
            }
        }
        // Deleting something that is already gone is done.
        404 if method == Method::Delete => Outcome::Acknowledged {
            remote: None,
            duplicate: true,
        },
        status => Outcome::Failed {
            class: ErrorClass::from_status(status).unwrap_or(ErrorClass::ValidationPermanent),
            reason: response_reason(response),
        },
    }
}

fn response_reason(response: &HttpResponse) -> String {
    let detail = response
        .body
        .as_ref()
        .and_then(|body| body.get("error"))
        .and_then(Value::as_str);
    match detail {
        Some(detail) => format!("HTTP {}: {}", response.status, detail),
        None => format!("HTTP {}", response.status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_extracts_remote_id() {
        let ok = Ok(HttpResponse::new(201).with_body(json!({"id": "srv-1"})));
        assert_eq!(
            classify(Method::Post, &ok),
            Outcome::Acknowledged {
                remote: Some(RemoteId::new("srv-1")),
                duplicate: false
            }
        );

        let numeric = HttpResponse::new(200).with_body(json!({"id": 42}));
        assert_eq!(numeric.remote_id(), Some(RemoteId::new("42")));
    }

    #[test]
    fn test_conflict_with_existing_resource_is_duplicate() {
        let conflict = Ok(HttpResponse::new(409).with_body(json!({"id": "srv-9"})));
        assert_eq!(
            classify(Method::Post, &conflict),
            Outcome::Acknowledged {
                remote: Some(RemoteId::new("srv-9")),
                duplicate: true
            }
        );

        let bare = Ok(HttpResponse::new(409));
        assert!(matches!(
            classify(Method::Post, &bare),
            Outcome::Failed {
                class: ErrorClass::ValidationPermanent,
                ..
            }
        ));
    }

    #[test]
    fn test_not_found_only_tolerated_for_delete() {
        let gone = Ok(HttpResponse::new(404));
        assert!(matches!(
            classify(Method::Delete, &gone),
            Outcome::Acknowledged { .. }
        ));
        assert!(matches!(
            classify(Method::Patch, &gone),
            Outcome::Failed {
                class: ErrorClass::ValidationPermanent,
                ..
            }
        ));
    }

    #[test]
    fn test_failure_classes() {
        let timeout = Err(TransportError::Timeout);
        let server = Ok(HttpResponse::new(503));
        let throttled = Ok(HttpResponse::new(429));
        let auth = Ok(HttpResponse::new(401));
        let invalid = Ok(HttpResponse::new(422).with_body(json!({"error": "reps must be positive"})));

        let class_of = |result: &Result<HttpResponse, TransportError>| match classify(Method::Post, result) {
            Outcome::Failed { class, .. } => Some(class),
            _ => None,
        };
        assert_eq!(class_of(&timeout), Some(ErrorClass::TransientNetwork));
        assert_eq!(class_of(&server), Some(ErrorClass::ServerTransient));
        assert_eq!(class_of(&throttled), Some(ErrorClass::ServerTransient));
        assert_eq!(class_of(&auth), Some(ErrorClass::AuthExpired));
        assert_eq!(class_of(&invalid), Some(ErrorClass::ValidationPermanent));

        match classify(Method::Post, &invalid) {
            Outcome::Failed { reason, .. } => assert_eq!(reason, "HTTP 422: reps must be positive"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_headers() {
        let mut outbox = tandem_store::Outbox::new(0);
        let id = outbox
            .enqueue(
                tandem_store::OutboundRequest::new(Method::Post, "/schedules")
                    .with_body(json!({"name": "Legs"})),
                1,
            )
            .item_id();
        let item = outbox.get(&id).unwrap();

        let request = HttpRequest::from_item(item, "t0k");
        assert_eq!(request.bearer_token(), Some("t0k"));
        assert_eq!(request.correlation_id(), Some(item.correlation_id.as_str()));
        assert_eq!(request.header("content-type"), Some("application/json"));
    }
}
