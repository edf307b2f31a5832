//! In-memory backend for tests, demos and the stress harness.
//!
//! Honours the backend contract the engine relies on:
//! - `POST {collection}` creates a record and answers `201 {"id": ...}`
//! - `PATCH`/`PUT`/`DELETE {collection}/{id}` answer 404 for unknown ids
//! - every odd path segment and every `*_id` body field must name an existing
//!   record, otherwise the server fails with 500 (as the real one did when a
//!   child arrived before its parent)
//! - responses are cached per `X-Correlation-ID` and replayed on redelivery

use crate::transport::{Backend, HttpRequest, HttpResponse, TransportError, IDEMPOTENT_REPLAY};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tandem_store::Method;

/// A failure to inject into the next request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this status without processing.
    Status(u16),
    /// Time out without processing.
    Timeout,
    /// Process the request, then time out before answering.
    ProcessedThenTimeout,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerRecord {
    pub id: String,
    pub collection: String,
    pub body: Value,
    pub deleted: bool,
}

#[derive(Debug, Default)]
struct ServerState {
    records: BTreeMap<String, ServerRecord>,
    next_id: u64,
    replies: HashMap<String, HttpResponse>,
    faults: VecDeque<Fault>,
    offline: bool,
    accepted_token: Option<String>,
    requests: Vec<HttpRequest>,
    latency: Duration,
}

impl ServerState {
    fn is_live(&self, id: &str) -> bool {
        self.records.get(id).map_or(false, |record| !record.deleted)
    }

    /// First id among the odd path segments before `upto` that does not exist.
    fn unknown_path_id<'a>(&self, segments: &[&'a str], upto: usize) -> Option<&'a str> {
        (1..upto)
            .step_by(2)
            .map(|i| segments[i])
            .find(|id| !self.is_live(id))
    }

    fn unknown_body_ref(&self, body: Option<&Value>) -> Option<String> {
        let fields = body?.as_object()?;
        fields.iter().find_map(|(key, value)| {
            if !key.ends_with("_id") || key == "client_id" {
                return None;
            }
            match value.as_str() {
                Some(id) if !self.is_live(id) => Some(id.to_string()),
                _ => None,
            }
        })
    }

    fn respond(&mut self, request: &HttpRequest) -> HttpResponse {
        if let Some(previous) = request.correlation_id().and_then(|cid| self.replies.get(cid)) {
            return previous.clone().with_header(IDEMPOTENT_REPLAY, "true");
        }

        let response = self.process(request);
        if let Some(cid) = request.correlation_id() {
            // 5xx means nothing happened; a redelivery must be processed again.
            if response.status < 500 {
                self.replies.insert(cid.to_string(), response.clone());
            }
        }
        response
    }

    fn process(&mut self, request: &HttpRequest) -> HttpResponse {
        let segments: Vec<&str> = request.url.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return not_found("no such resource");
        }

        match request.method {
            Method::Post => self.create(request, &segments),
            Method::Patch | Method::Put => self.modify(request, &segments),
            Method::Delete => self.delete(&segments),
        }
    }

    fn create(&mut self, request: &HttpRequest, segments: &[&str]) -> HttpResponse {
        if let Some(parent) = self.unknown_path_id(segments, segments.len()) {
            return server_error(format!("parent {} does not exist", parent));
        }
        if let Some(parent) = self.unknown_body_ref(request.body.as_ref()) {
            return server_error(format!("referenced record {} does not exist", parent));
        }

        let mut body = match &request.body {
            Some(Value::Object(fields)) => fields.clone(),
            Some(_) => return bad_request("body must be an object"),
            None => Map::new(),
        };

        if let Some(client_id) = body.get("client_id").and_then(Value::as_str) {
            let existing = self.records.values().find(|record| {
                !record.deleted && record.body.get("client_id").and_then(Value::as_str) == Some(client_id)
            });
            if let Some(existing) = existing {
                return HttpResponse::new(409).with_body(existing.body.clone());
            }
        }

        self.next_id += 1;
        let id = format!("srv-{}", self.next_id);
        body.insert("id".to_string(), Value::String(id.clone()));
        let record = ServerRecord {
            id: id.clone(),
            collection: format!("/{}", segments.join("/")),
            body: Value::Object(body),
            deleted: false,
        };
        let response = HttpResponse::new(201).with_body(record.body.clone());
        self.records.insert(id, record);
        response
    }

    fn modify(&mut self, request: &HttpRequest, segments: &[&str]) -> HttpResponse {
        let last = segments.len() - 1;
        if last == 0 {
            return not_found("missing record id");
        }
        if let Some(parent) = self.unknown_path_id(segments, last) {
            return server_error(format!("parent {} does not exist", parent));
        }
        if let Some(parent) = self.unknown_body_ref(request.body.as_ref()) {
            return server_error(format!("referenced record {} does not exist", parent));
        }
        let patch = match &request.body {
            Some(Value::Object(fields)) => fields.clone(),
            _ => return bad_request("body must be an object"),
        };

        let id = segments[last];
        let Some(record) = self.records.get_mut(id).filter(|record| !record.deleted) else {
            return not_found(format!("record {} does not exist", id));
        };

        if request.method == Method::Put {
            let mut replaced = patch.clone();
            replaced.insert("id".to_string(), Value::String(id.to_string()));
            record.body = Value::Object(replaced);
        } else if let Value::Object(fields) = &mut record.body {
            for (key, value) in &patch {
                fields.insert(key.clone(), value.clone());
            }
        }
        if patch.get("deleted") == Some(&Value::Bool(true)) {
            record.deleted = true;
        }
        HttpResponse::new(200).with_body(record.body.clone())
    }

    fn delete(&mut self, segments: &[&str]) -> HttpResponse {
        let id = segments[segments.len() - 1];
        if segments.len() < 2 || !self.is_live(id) {
            return not_found(format!("record {} does not exist", id));
        }
        self.records.remove(id);
        HttpResponse::new(204)
    }
}

fn not_found(message: impl Into<String>) -> HttpResponse {
    HttpResponse::new(404).with_body(json!({ "error": message.into() }))
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::new(400).with_body(json!({ "error": message.into() }))
}

fn server_error(message: impl Into<String>) -> HttpResponse {
    HttpResponse::new(500).with_body(json!({ "error": message.into() }))
}

/// Simulated REST backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<ServerState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn is_offline(&self) -> bool {
        self.state.lock().offline
    }

    /// Only accept this bearer token from now on; anything else gets 401.
    pub fn require_token(&self, token: impl Into<String>) {
        self.state.lock().accepted_token = Some(token.into());
    }

    pub fn accept_any_token(&self) {
        self.state.lock().accepted_token = None;
    }

    /// Queue a failure for the next request that reaches the server.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Every request received, including the ones refused while offline.
    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    pub fn record(&self, id: &str) -> Option<ServerRecord> {
        self.state.lock().records.get(id).cloned()
    }

    pub fn records_in(&self, collection: &str) -> Vec<ServerRecord> {
        self.state
            .lock()
            .records
            .values()
            .filter(|record| record.collection == collection)
            .cloned()
            .collect()
    }

    /// Records that exist and are not soft-deleted.
    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|record| !record.deleted)
            .count()
    }

    fn handle(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        if state.offline {
            return Err(TransportError::Offline);
        }

        let authorized = match (&state.accepted_token, request.bearer_token()) {
            (_, None) => false,
            (Some(required), Some(token)) => required == token,
            (None, Some(_)) => true,
        };
        if !authorized {
            return Ok(HttpResponse::new(401).with_body(json!({ "error": "invalid token" })));
        }

        let fault = state.faults.pop_front();
        match fault {
            Some(Fault::Status(status)) => return Ok(HttpResponse::new(status)),
            Some(Fault::Timeout) => return Err(TransportError::Timeout),
            _ => {}
        }

        let response = state.respond(&request);
        tracing::trace!(
            method = %request.method,
            url = %request.url,
            status = response.status,
            "memory backend"
        );
        if fault == Some(Fault::ProcessedThenTimeout) {
            return Err(TransportError::Timeout);
        }
        Ok(response)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.handle(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AUTHORIZATION, CORRELATION_ID};

    fn request(method: Method, url: &str, body: Option<Value>, correlation: &str) -> HttpRequest {
        HttpRequest {
            method,
            url: url.to_string(),
            headers: BTreeMap::from([
                (AUTHORIZATION.to_string(), "Bearer t".to_string()),
                (CORRELATION_ID.to_string(), correlation.to_string()),
            ]),
            body,
        }
    }

    fn send(backend: &MemoryBackend, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        tokio_test::block_on(backend.execute(request))
    }

    #[test]
    fn test_create_then_child_under_known_parent() {
        let backend = MemoryBackend::new();
        let schedule = send(&backend, request(Method::Post, "/schedules", Some(json!({"name": "A"})), "c1")).unwrap();
        assert_eq!(schedule.status, 201);
        let id = schedule.remote_id().unwrap();

        let url = format!("/schedules/{}/exercises", id);
        let exercise = send(&backend, request(Method::Post, &url, Some(json!({"schedule_id": id.as_str()})), "c2")).unwrap();
        assert_eq!(exercise.status, 201);
        assert_eq!(backend.records_in(&url).len(), 1);
    }

    #[test]
    fn test_unknown_parent_is_server_error() {
        let backend = MemoryBackend::new();
        let response = send(
            &backend,
            request(Method::Post, "/sets", Some(json!({"exercise_id": "{{local:01ARZ3NDEKTSV4RRFFQ69G5FAV}}"})), "c1"),
        )
        .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(backend.live_count(), 0);
    }

    #[test]
    fn test_replay_by_correlation_id() {
        let backend = MemoryBackend::new();
        backend.inject(Fault::ProcessedThenTimeout);

        let first = send(&backend, request(Method::Post, "/schedules", Some(json!({})), "c1"));
        assert_eq!(first, Err(TransportError::Timeout));

        let second = send(&backend, request(Method::Post, "/schedules", Some(json!({})), "c1")).unwrap();
        assert_eq!(second.status, 201);
        assert_eq!(second.header(IDEMPOTENT_REPLAY), Some("true"));
        assert_eq!(backend.live_count(), 1);
    }

    #[test]
    fn test_same_client_id_conflicts() {
        let backend = MemoryBackend::new();
        let body = json!({"client_id": "local-1"});
        let first = send(&backend, request(Method::Post, "/schedules", Some(body.clone()), "c1")).unwrap();
        let second = send(&backend, request(Method::Post, "/schedules", Some(body), "c2")).unwrap();

        assert_eq!(second.status, 409);
        assert_eq!(second.remote_id(), first.remote_id());
    }

    #[test]
    fn test_patch_and_delete_unknown_ids() {
        let backend = MemoryBackend::new();
        let patch = send(&backend, request(Method::Patch, "/sets/srv-9", Some(json!({"reps": 1})), "c1")).unwrap();
        assert_eq!(patch.status, 404);
        let delete = send(&backend, request(Method::Delete, "/sets/srv-9", None, "c2")).unwrap();
        assert_eq!(delete.status, 404);
    }

    #[test]
    fn test_soft_delete_marks_record() {
        let backend = MemoryBackend::new();
        let created = send(&backend, request(Method::Post, "/schedules", Some(json!({})), "c1")).unwrap();
        let id = created.remote_id().unwrap();

        let url = format!("/schedules/{}", id);
        let patched = send(&backend, request(Method::Patch, &url, Some(json!({"deleted": true})), "c2")).unwrap();
        assert_eq!(patched.status, 200);
        assert!(backend.record(id.as_str()).unwrap().deleted);
        assert_eq!(backend.live_count(), 0);
    }

    #[test]
    fn test_offline_and_token_checks() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert_eq!(
            send(&backend, request(Method::Post, "/schedules", None, "c1")),
            Err(TransportError::Offline)
        );

        backend.set_offline(false);
        backend.require_token("fresh");
        let denied = send(&backend, request(Method::Post, "/schedules", None, "c2")).unwrap();
        assert_eq!(denied.status, 401);
        assert_eq!(backend.request_count(), 2);
    }
}
