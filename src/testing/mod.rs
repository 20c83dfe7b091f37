//! In-memory doubles for the pipeline's seams.
//!
//! These are used by this crate's own tests and are available to downstream
//! crates through the `testing` feature: a scriptable [`MockHandle`] in
//! place of a real HTTP client, an [`InMemoryTraceWriter`] in place of an
//! [`AgentWriter`], and capturing implementations of the logger and sampler
//! sinks.
//!
//! [`AgentWriter`]: crate::AgentWriter

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::log::{LogLevel, Logger};
use crate::sampler::SamplerFeedback;
use crate::span::Trace;
use crate::span_buffer::TraceWriter;
use crate::transport::{HandleOption, HttpHandle, TransportError};

mod decode;
pub use decode::{decode_traces, DecodeError};

struct MockHandleInner {
    url: Option<String>,
    unix_socket_path: Option<String>,
    timeout_ms: Option<u64>,
    post_field_size: Option<usize>,
    post_fields: Vec<u8>,
    headers: HashMap<String, String>,
    configure_error: Option<TransportError>,
    perform_results: Vec<Result<(), TransportError>>,
    perform_call_count: usize,
    response: String,
    response_status: u16,
    posted_bodies: Vec<Vec<u8>>,
    destructed: bool,
}

impl Default for MockHandleInner {
    fn default() -> Self {
        MockHandleInner {
            url: None,
            unix_socket_path: None,
            timeout_ms: None,
            post_field_size: None,
            post_fields: Vec::new(),
            headers: HashMap::new(),
            configure_error: None,
            perform_results: Vec::new(),
            perform_call_count: 0,
            response: String::new(),
            response_status: 200,
            posted_bodies: Vec::new(),
            destructed: false,
        }
    }
}

/// Test-side view of a [`MockHandle`], valid after the handle itself has
/// been moved into a writer.
#[derive(Clone, Default)]
pub struct MockHandleState(Arc<Mutex<MockHandleInner>>);

impl MockHandleState {
    /// The configured target URL, if any.
    pub fn url(&self) -> Option<String> {
        self.0.lock().unwrap().url.clone()
    }

    /// The configured Unix socket path, if any.
    pub fn unix_socket_path(&self) -> Option<String> {
        self.0.lock().unwrap().unix_socket_path.clone()
    }

    /// The configured request timeout in milliseconds, if any.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.0.lock().unwrap().timeout_ms
    }

    /// The declared size of the most recently set request body.
    pub fn post_field_size(&self) -> Option<usize> {
        self.0.lock().unwrap().post_field_size
    }

    /// The current header set, as replaced by the last `set_headers` call.
    pub fn headers(&self) -> HashMap<String, String> {
        self.0.lock().unwrap().headers.clone()
    }

    /// Bodies of every POST whose `perform` succeeded, oldest first.
    pub fn post_bodies(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().posted_bodies.clone()
    }

    /// Every trace successfully POSTed so far, decoded from msgpack.
    pub fn traces(&self) -> Vec<Trace> {
        self.post_bodies()
            .iter()
            .flat_map(|body| decode_traces(body).expect("posted body is valid msgpack"))
            .collect()
    }

    /// Number of `perform` calls so far, including failed ones.
    pub fn perform_call_count(&self) -> usize {
        self.0.lock().unwrap().perform_call_count
    }

    /// True once the handle itself has been dropped.
    pub fn is_destructed(&self) -> bool {
        self.0.lock().unwrap().destructed
    }

    /// Body returned for subsequent successful performs.
    pub fn set_response(&self, response: &str) {
        self.0.lock().unwrap().response = response.to_string();
    }

    /// Status returned for subsequent performs. 0 means "no status".
    pub fn set_response_status(&self, status: u16) {
        self.0.lock().unwrap().response_status = status;
    }

    /// Script the outcomes of `perform`, cycled when there are more calls
    /// than entries. An empty script means every call succeeds.
    pub fn set_perform_results(&self, results: Vec<Result<(), TransportError>>) {
        self.0.lock().unwrap().perform_results = results;
    }

    /// Make every subsequent `set_option` and `set_headers` call fail.
    pub fn fail_set_option(&self, error: TransportError) {
        self.0.lock().unwrap().configure_error = Some(error);
    }

    /// Undo [`fail_set_option`](MockHandleState::fail_set_option).
    pub fn clear_set_option_failure(&self) {
        self.0.lock().unwrap().configure_error = None;
    }
}

/// Scriptable in-memory [`HttpHandle`].
///
/// Records everything the writer configures, and "performs" requests against
/// a scripted response. Keep a [`MockHandleState`] (from
/// [`state`](MockHandle::state)) before handing the handle to a writer.
#[derive(Default)]
pub struct MockHandle {
    state: MockHandleState,
}

impl MockHandle {
    pub fn new() -> Self {
        MockHandle::default()
    }

    pub fn state(&self) -> MockHandleState {
        self.state.clone()
    }
}

impl HttpHandle for MockHandle {
    fn set_option(&mut self, option: HandleOption) -> Result<(), TransportError> {
        let mut inner = self.state.0.lock().unwrap();
        if let Some(error) = inner.configure_error.clone() {
            return Err(error);
        }
        match option {
            HandleOption::Url(url) => inner.url = Some(url),
            HandleOption::UnixSocketPath(path) => inner.unix_socket_path = Some(path),
            HandleOption::TimeoutMs(ms) => inner.timeout_ms = Some(ms),
            HandleOption::PostFieldSize(size) => inner.post_field_size = Some(size),
            HandleOption::PostFields(body) => inner.post_fields = body,
        }
        Ok(())
    }

    fn set_headers(&mut self, headers: HashMap<String, String>) -> Result<(), TransportError> {
        let mut inner = self.state.0.lock().unwrap();
        if let Some(error) = inner.configure_error.clone() {
            return Err(error);
        }
        inner.headers = headers;
        Ok(())
    }

    fn perform(&mut self) -> Result<(), TransportError> {
        let mut inner = self.state.0.lock().unwrap();
        let call = inner.perform_call_count;
        inner.perform_call_count += 1;
        let result = if inner.perform_results.is_empty() {
            Ok(())
        } else {
            inner.perform_results[call % inner.perform_results.len()].clone()
        };
        if result.is_ok() {
            let body = inner.post_fields.clone();
            inner.posted_bodies.push(body);
        }
        result
    }

    fn response_status(&self) -> u16 {
        self.state.0.lock().unwrap().response_status
    }

    fn response_body(&self) -> Vec<u8> {
        self.state.0.lock().unwrap().response.clone().into_bytes()
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.state.0.lock().unwrap().destructed = true;
    }
}

/// A [`TraceWriter`] that stores everything it is given.
#[derive(Clone, Default)]
pub struct InMemoryTraceWriter {
    traces: Arc<Mutex<Vec<Trace>>>,
    flushes: Arc<Mutex<Vec<Duration>>>,
}

impl InMemoryTraceWriter {
    pub fn traces(&self) -> Vec<Trace> {
        self.traces.lock().unwrap().clone()
    }

    pub fn flush_calls(&self) -> Vec<Duration> {
        self.flushes.lock().unwrap().clone()
    }
}

impl TraceWriter for InMemoryTraceWriter {
    fn write_trace(&self, trace: Trace) {
        self.traces.lock().unwrap().push(trace);
    }

    fn flush(&self, timeout: Duration) {
        self.flushes.lock().unwrap().push(timeout);
    }
}

/// One record captured by [`InMemoryLogger`].
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

/// A [`Logger`] that appends records to memory.
#[derive(Clone, Default)]
pub struct InMemoryLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl InMemoryLogger {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn last_message(&self) -> Option<String> {
        self.records
            .lock()
            .unwrap()
            .last()
            .map(|record| record.message.clone())
    }
}

impl Logger for InMemoryLogger {
    fn log(&self, level: LogLevel, message: String) {
        self.records.lock().unwrap().push(LogRecord { level, message });
    }
}

/// A [`SamplerFeedback`] that remembers the most recent rates payload.
#[derive(Clone, Default)]
pub struct MockSamplerFeedback {
    rates: Arc<Mutex<Option<String>>>,
}

impl MockSamplerFeedback {
    /// The last applied `rate_by_service` JSON, or `None` when no rates have
    /// arrived.
    pub fn applied(&self) -> Option<String> {
        self.rates.lock().unwrap().clone()
    }
}

impl SamplerFeedback for MockSamplerFeedback {
    fn apply_rates(&self, rates: &str) {
        *self.rates.lock().unwrap() = Some(rates.to_string());
    }
}

/// A [`Clock`] that only moves when told to.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
