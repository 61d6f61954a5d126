//! Job descriptors and the request-driving loop.
//!
//! A [`JobContainer`] is the serialisable description that travels over
//! the control channel; the [`Job`] it builds is the execution unit that
//! drives one URL at maximum sustainable rate inside a worker. The loop
//! is cooperative: it keeps issuing requests while the job's status is
//! `Started` and observes a stop on its next iteration.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

use crate::analyse::{Analysable, CoreStatus, Lifecycle, Manager, Visit};
use crate::errors::EngineError;
use crate::net::{HttpMethod, Protocol};
use crate::session::SessionManager;
use crate::worker::Worker;

/// Response hook invoked with the status code and body of each reply.
/// Process-local: it does not travel over the control channel.
pub type JobCallback = Arc<dyn Fn(u16, &str) + Send + Sync>;

/// A job list owned by one worker.
pub type JobManager = Manager<Job>;

// ── Payload ───────────────────────────────────────────────────────────────────

/// Request payload attached to a job descriptor.
///
/// [`PayloadCursor`] normalises every variant to an infinite sequence:
/// `Cycle` restarts from the beginning on exhaustion, every other variant
/// repeats its value, and `Empty` stands in for an empty JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
    Cycle(Vec<Value>),
}

/// Infinite iterator over a payload.
pub struct PayloadCursor {
    payload: Payload,
    pos: usize,
}

impl PayloadCursor {
    pub fn new(payload: Payload) -> Self {
        PayloadCursor { payload, pos: 0 }
    }

    /// Next JSON value; never exhausts.
    pub fn next_value(&mut self) -> Value {
        match &self.payload {
            Payload::Empty => Value::Object(serde_json::Map::new()),
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Bytes(bytes) => {
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
            }
            Payload::Json(value) => value.clone(),
            Payload::Cycle(values) if values.is_empty() => {
                Value::Object(serde_json::Map::new())
            }
            Payload::Cycle(values) => {
                let value = values[self.pos % values.len()].clone();
                self.pos += 1;
                value
            }
        }
    }

    /// Next websocket text frame body.
    pub fn next_text(&mut self) -> String {
        match &self.payload {
            Payload::Text(text) => text.clone(),
            Payload::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Payload::Empty | Payload::Json(_) | Payload::Cycle(_) => {
                match self.next_value() {
                    Value::String(text) => text,
                    other => other.to_string(),
                }
            }
        }
    }

    /// Next websocket binary frame body.
    pub fn next_bytes(&mut self) -> Vec<u8> {
        match &self.payload {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Text(text) => text.clone().into_bytes(),
            Payload::Empty | Payload::Json(_) | Payload::Cycle(_) => {
                self.next_text().into_bytes()
            }
        }
    }

    /// Query pairs for an HTTP GET; empty unless the value is an object.
    pub fn next_query(&mut self) -> Vec<(String, String)> {
        match self.next_value() {
            Value::Object(map) => map
                .into_iter()
                .map(|(key, value)| (key, stringify(value)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

// ── JobContainer ──────────────────────────────────────────────────────────────

/// Descriptor variant; selects the request method or frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    HttpGet,
    HttpPost,
    WebsocketText,
    WebsocketBinary,
}

/// Serialisable job description.
///
/// Containers are what the master ships to slaves and what a manager
/// fans out to workers; the job itself is built after the descriptor
/// lands in the worker that runs it.
#[derive(Clone, Serialize, Deserialize)]
pub struct JobContainer {
    kind: JobKind,
    url: String,
    #[serde(default)]
    data: Payload,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    cookies: HashMap<String, String>,
    #[serde(default = "default_reuse")]
    reuse_job: bool,
    #[serde(skip)]
    callback: Option<JobCallback>,
}

fn default_reuse() -> bool {
    true
}

impl JobContainer {
    fn new(kind: JobKind, url: &str) -> Self {
        JobContainer {
            kind,
            url: url.to_string(),
            data: Payload::Empty,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            reuse_job: true,
            callback: None,
        }
    }

    pub fn http_get(url: &str) -> Self {
        Self::new(JobKind::HttpGet, url)
    }

    pub fn http_post(url: &str) -> Self {
        Self::new(JobKind::HttpPost, url)
    }

    pub fn websocket_text(url: &str) -> Self {
        Self::new(JobKind::WebsocketText, url)
    }

    pub fn websocket_binary(url: &str) -> Self {
        Self::new(JobKind::WebsocketBinary, url)
    }

    /// Splits a query-string URL into the right container for `method`.
    ///
    /// POST moves the query arguments into a JSON payload sent against
    /// the bare URL; anything else keeps the URL untouched.
    pub fn from_url(url: &str, method: HttpMethod) -> Result<Self, EngineError> {
        match method {
            HttpMethod::Post => {
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    EngineError::Transport(format!("invalid url '{}': {}", url, e))
                })?;
                let params: serde_json::Map<String, Value> = parsed
                    .query_pairs()
                    .map(|(key, value)| {
                        (key.into_owned(), Value::String(value.into_owned()))
                    })
                    .collect();
                let mut base = parsed.clone();
                base.set_query(None);
                Ok(Self::http_post(base.as_str()).with_data(Payload::Json(Value::Object(params))))
            }
            _ => Ok(Self::http_get(url)),
        }
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_cookies(mut self, cookies: HashMap<String, String>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// When false, the manager builds one job per worker from this
    /// descriptor so every worker drives the URL in parallel.
    pub fn with_reuse_job(mut self, reuse_job: bool) -> Self {
        self.reuse_job = reuse_job;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn reuse_job(&self) -> bool {
        self.reuse_job
    }

    /// Builds the executable job for this description.
    pub fn job(&self) -> Job {
        Job {
            lifecycle: Lifecycle::new("Job"),
            kind: self.kind,
            url: self.url.clone(),
            protocol: Protocol::from_url(&self.url),
            headers: self.headers.clone(),
            cookies: self.cookies.clone(),
            payload: self.data.clone(),
            callback: self.callback.clone(),
            sessions: SessionManager::new(),
        }
    }
}

impl fmt::Debug for JobContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContainer")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("data", &self.data)
            .field("reuse_job", &self.reuse_job)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// ── Job ───────────────────────────────────────────────────────────────────────

/// The request-driving execution unit for one URL.
pub struct Job {
    lifecycle: Lifecycle,
    kind: JobKind,
    url: String,
    protocol: Protocol,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
    payload: Payload,
    callback: Option<JobCallback>,
    sessions: SessionManager,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub(crate) fn sessions_mut(&mut self) -> &mut SessionManager {
        &mut self.sessions
    }

    fn method(&self) -> HttpMethod {
        match self.kind {
            JobKind::HttpPost => HttpMethod::Post,
            _ => HttpMethod::Get,
        }
    }
}

impl Analysable for Job {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn visit_children(&mut self, visit: Visit) -> Result<(), EngineError> {
        visit(&mut self.sessions)
    }

    /// Starting a job also starts its session clock.
    fn start(&mut self) -> Result<(), EngineError> {
        self.lifecycle_mut().start()?;
        Analysable::start(&mut self.sessions)
    }
}

// ── Request loop ──────────────────────────────────────────────────────────────

/// Everything the loop needs, detached from the job's mutable state so
/// no borrow is ever held across an await point.
struct RequestPlan {
    url: String,
    protocol: Protocol,
    kind: JobKind,
    method: HttpMethod,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
    payload: Payload,
    callback: Option<JobCallback>,
}

/// Drives one job's request loop until its status leaves `Started`.
///
/// The worker cell is the single shared handle inside a worker thread.
/// Transport errors are absorbed into 400/500 sessions; the loop only
/// exits when the stop orchestrator transitions the job's status.
pub(crate) async fn drive(worker: Rc<RefCell<Worker>>, index: usize) {
    let plan = {
        let mut cell = worker.borrow_mut();
        let job = cell.job_mut(index);
        if let Err(e) = Analysable::start(job) {
            error!(error = %e, "job failed to start");
            return;
        }
        RequestPlan {
            url: job.url.clone(),
            protocol: job.protocol,
            kind: job.kind,
            method: job.method(),
            headers: job.headers.clone(),
            cookies: job.cookies.clone(),
            payload: job.payload.clone(),
            callback: job.callback.clone(),
        }
    };
    if plan.protocol.is_websocket() {
        drive_websocket(worker, index, plan).await;
    } else {
        drive_http(worker, index, plan).await;
    }
}

fn job_started(worker: &Rc<RefCell<Worker>>, index: usize) -> bool {
    worker.borrow().job(index).status() == CoreStatus::Started
}

fn open_session(worker: &Rc<RefCell<Worker>>, index: usize, protocol: Protocol, url: &str) -> bool {
    let mut cell = worker.borrow_mut();
    match cell.job_mut(index).sessions_mut().open(protocol, url) {
        Ok(()) => true,
        Err(e) => {
            error!(url = %url, error = %e, "session open failed");
            false
        }
    }
}

fn close_session(worker: &Rc<RefCell<Worker>>, index: usize, status_code: u16) {
    worker
        .borrow_mut()
        .job_mut(index)
        .sessions_mut()
        .close(status_code);
}

/// Default headers for an HTTP job client; cookies collapse into a
/// single `Cookie` header. Unrepresentable entries are skipped.
fn request_headers(headers: &HashMap<String, String>, cookies: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    if !cookies.is_empty() {
        let cookie = cookies
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("; ");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            map.insert(COOKIE, value);
        }
    }
    map
}

async fn drive_http(worker: Rc<RefCell<Worker>>, index: usize, plan: RequestPlan) {
    let client = match reqwest::Client::builder()
        .default_headers(request_headers(&plan.headers, &plan.cookies))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(url = %plan.url, error = %e, "http client build failed");
            if open_session(&worker, index, plan.protocol, &plan.url) {
                close_session(&worker, index, 400);
            }
            return;
        }
    };
    let mut cursor = PayloadCursor::new(plan.payload);

    while job_started(&worker, index) {
        if !open_session(&worker, index, plan.protocol, &plan.url) {
            break;
        }
        let sent = match plan.method {
            HttpMethod::Post => client.post(&plan.url).json(&cursor.next_value()).send().await,
            HttpMethod::Get => {
                let query = cursor.next_query();
                let request = if query.is_empty() {
                    client.get(&plan.url)
                } else {
                    client.get(&plan.url).query(&query)
                };
                request.send().await
            }
            other => {
                // only GET and POST are driven; anything else degrades to GET
                error!(method = other.phrase(), "unsupported method, falling back to GET");
                client.get(&plan.url).send().await
            }
        };
        let (status_code, content) = match sent {
            Ok(response) => {
                let status_code = response.status().as_u16();
                match response.text().await {
                    Ok(body) => (status_code, Some(body)),
                    Err(e) => {
                        debug!(url = %plan.url, error = %e, "body read failed");
                        (400, None)
                    }
                }
            }
            Err(e) => {
                debug!(url = %plan.url, error = %e, "request failed");
                (400, None)
            }
        };
        if let (Some(callback), Some(body)) = (&plan.callback, &content) {
            callback(status_code, body);
        }
        close_session(&worker, index, status_code);
    }
}

async fn drive_websocket(worker: Rc<RefCell<Worker>>, index: usize, plan: RequestPlan) {
    // one connect per job; a failed connect parks the job until stop
    let (mut socket, _) = match connect_async(plan.url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            error!(url = %plan.url, error = %e, "websocket connect failed");
            if open_session(&worker, index, plan.protocol, &plan.url) {
                close_session(&worker, index, 400);
            }
            return;
        }
    };
    let mut cursor = PayloadCursor::new(plan.payload);

    while job_started(&worker, index) {
        if !open_session(&worker, index, plan.protocol, &plan.url) {
            break;
        }
        let frame = match plan.kind {
            JobKind::WebsocketBinary => Message::Binary(cursor.next_bytes()),
            _ => Message::Text(cursor.next_text()),
        };
        let (status_code, content) = match socket.send(frame).await {
            Err(e) => {
                debug!(url = %plan.url, error = %e, "websocket send failed");
                (400, None)
            }
            Ok(()) => loop {
                match socket.next().await {
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Text(text))) => break (200, Some(text)),
                    Some(Ok(_)) => break (500, None),
                    Some(Err(e)) => {
                        debug!(url = %plan.url, error = %e, "websocket receive failed");
                        break (400, None);
                    }
                    None => break (400, None),
                }
            },
        };
        if let (Some(callback), Some(body)) = (&plan.callback, &content) {
            callback(status_code, body);
        }
        close_session(&worker, index, status_code);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_repeats_a_plain_value() {
        let mut cursor = PayloadCursor::new(Payload::Json(json!({"a": 1})));
        assert_eq!(cursor.next_value(), json!({"a": 1}));
        assert_eq!(cursor.next_value(), json!({"a": 1}));
    }

    #[test]
    fn cursor_cycles_a_list() {
        let mut cursor = PayloadCursor::new(Payload::Cycle(vec![json!(1), json!(2)]));
        assert_eq!(cursor.next_value(), json!(1));
        assert_eq!(cursor.next_value(), json!(2));
        assert_eq!(cursor.next_value(), json!(1));
    }

    #[test]
    fn empty_payload_is_an_empty_object() {
        let mut cursor = PayloadCursor::new(Payload::Empty);
        assert_eq!(cursor.next_value(), json!({}));
        assert!(cursor.next_query().is_empty());
    }

    #[test]
    fn query_pairs_come_from_object_entries() {
        let mut cursor = PayloadCursor::new(Payload::Json(json!({"name": "x", "count": 3})));
        let mut query = cursor.next_query();
        query.sort();
        assert_eq!(
            query,
            vec![
                ("count".to_string(), "3".to_string()),
                ("name".to_string(), "x".to_string())
            ]
        );
    }

    #[test]
    fn text_and_bytes_cursors() {
        let mut text = PayloadCursor::new(Payload::Text("ping".into()));
        assert_eq!(text.next_text(), "ping");
        assert_eq!(text.next_bytes(), b"ping".to_vec());

        let mut bytes = PayloadCursor::new(Payload::Bytes(vec![1, 2, 3]));
        assert_eq!(bytes.next_bytes(), vec![1, 2, 3]);
    }

    #[test]
    fn container_defaults_to_reusing_its_job() {
        let container = JobContainer::http_get("http://localhost/");
        assert!(container.reuse_job());
        assert!(!container.with_reuse_job(false).reuse_job());
    }

    #[test]
    fn container_round_trips_without_its_callback() {
        let container = JobContainer::http_post("http://localhost/api")
            .with_data(Payload::Json(json!({"k": "v"})))
            .with_callback(|_, _| {});
        let encoded = serde_json::to_string(&container).unwrap();
        let decoded: JobContainer = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.kind(), JobKind::HttpPost);
        assert_eq!(decoded.url(), "http://localhost/api");
        assert!(decoded.callback.is_none());
    }

    #[test]
    fn from_url_splits_query_for_post() {
        let container =
            JobContainer::from_url("http://localhost/api?a=1&b=two", HttpMethod::Post).unwrap();
        assert_eq!(container.kind(), JobKind::HttpPost);
        assert_eq!(container.url(), "http://localhost/api");
        assert_eq!(
            container.data,
            Payload::Json(json!({"a": "1", "b": "two"}))
        );
    }

    #[test]
    fn from_url_keeps_query_for_get() {
        let container =
            JobContainer::from_url("http://localhost/api?a=1", HttpMethod::Get).unwrap();
        assert_eq!(container.kind(), JobKind::HttpGet);
        assert_eq!(container.url(), "http://localhost/api?a=1");
        assert_eq!(container.data, Payload::Empty);
    }

    #[test]
    fn job_derives_protocol_and_method() {
        let job = JobContainer::http_post("https://localhost/api").job();
        assert_eq!(job.protocol(), Protocol::Https);
        assert_eq!(job.method(), HttpMethod::Post);

        let job = JobContainer::websocket_text("ws://localhost/echo").job();
        assert_eq!(job.protocol(), Protocol::Ws);
    }

    #[test]
    fn each_build_is_a_fresh_job() {
        let container = JobContainer::http_get("http://localhost/");
        let first = container.job();
        let second = container.job();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn fresh_job_accessors_are_guarded() {
        let job = JobContainer::http_get("http://localhost/").job();
        assert!(matches!(
            job.total_request(),
            Err(EngineError::WrongStatus(_))
        ));
    }
}
