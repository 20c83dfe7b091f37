use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::WriterConfig;
use crate::encode;
use crate::error::Error;
use crate::log::{LogLevel, Logger, TracingLogger};
use crate::sampler::{NoopSamplerFeedback, SamplerFeedback};
use crate::span::Trace;
use crate::span_buffer::TraceWriter;
use crate::transport::{HandleOption, HttpHandle, TransportError};

/// Version of this tracer, reported to the agent with every request.
pub const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");

const TRACES_PATH: &str = "/v0.4/traces";
const HTTP_TIMEOUT_MS: u64 = 2_000;
const META_LANG: &str = "rust";
const META_LANG_VERSION: &str = env!("CARGO_PKG_RUST_VERSION");

/// Background-drained outbox that ships completed traces to the agent.
///
/// Traces written with [`write_trace`] land in a bounded in-memory queue; a
/// dedicated worker thread drains the queue every `flush_interval` (or on an
/// explicit [`flush`]), serializes the batch as msgpack and POSTs it to the
/// agent, retrying per the configured schedule. Sampling rates returned by
/// the agent are forwarded to the writer's [`SamplerFeedback`].
///
/// Delivery is best-effort: when the queue is full new traces are dropped,
/// and a batch whose retries are exhausted is dropped. [`stop`] (also run on
/// drop) shuts the worker down; a stopped writer ignores further writes and
/// flushes.
///
/// [`write_trace`]: AgentWriter::write_trace
/// [`flush`]: AgentWriter::flush
/// [`stop`]: AgentWriter::stop
pub struct AgentWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    max_queued_traces: usize,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for AgentWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentWriter")
            .field("max_queued_traces", &self.max_queued_traces)
            .finish()
    }
}

/// Builder for [`AgentWriter`]; see [`AgentWriter::builder`].
pub struct AgentWriterBuilder {
    handle: Box<dyn HttpHandle>,
    config: WriterConfig,
    sampler: Arc<dyn SamplerFeedback>,
    logger: Arc<dyn Logger>,
    clock: Arc<dyn Clock>,
}

impl AgentWriterBuilder {
    /// Use the given configuration instead of [`WriterConfig::default`].
    pub fn with_config(mut self, config: WriterConfig) -> Self {
        self.config = config;
        self
    }

    /// Sink for the agent's per-service sampling rates. Defaults to a no-op.
    pub fn with_sampler(mut self, sampler: Arc<dyn SamplerFeedback>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Diagnostic sink. Defaults to [`TracingLogger`].
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Time source for periodic flushes and deadlines. Defaults to
    /// [`SystemClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configure the handle, spawn the worker thread and return the writer.
    ///
    /// Fails when the agent URL has an unsupported scheme or the handle
    /// rejects its configuration; no worker is spawned in that case.
    pub fn build(self) -> Result<AgentWriter, Error> {
        let AgentWriterBuilder {
            mut handle,
            config,
            sampler,
            logger,
            clock,
        } = self;

        let target = AgentTarget::resolve(&config)?;
        handle.set_option(HandleOption::Url(target.url))?;
        if let Some(path) = target.unix_socket_path {
            handle.set_option(HandleOption::UnixSocketPath(path))?;
        }
        handle.set_option(HandleOption::TimeoutMs(HTTP_TIMEOUT_MS))?;

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                submitted: 0,
                processed: 0,
                dropped: 0,
                flush_requested: false,
                stopped: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        });

        let flush_interval = config.flush_interval;
        let worker = Worker {
            handle,
            shared: Arc::clone(&shared),
            flush_interval,
            retry_schedule: config.retry_schedule,
            sampler,
            logger: Arc::clone(&logger),
            clock: Arc::clone(&clock),
        };
        let join = thread::Builder::new()
            .name("dd-trace-client.AgentWriter".to_string())
            .spawn(move || worker.run())
            .map_err(Error::WorkerSpawn)?;
        logger.log(
            LogLevel::Debug,
            format!(
                "Trace writer worker thread started: flushing every {:?}, \
                 at most {} queued traces",
                flush_interval, config.max_queued_traces
            ),
        );

        Ok(AgentWriter {
            shared,
            worker: Mutex::new(Some(join)),
            max_queued_traces: config.max_queued_traces,
            clock,
            logger,
        })
    }
}

impl AgentWriter {
    /// Start building a writer around `handle`. The handle is moved into the
    /// worker thread at [`build`] and not accessible afterwards.
    ///
    /// [`build`]: AgentWriterBuilder::build
    pub fn builder(handle: impl HttpHandle + 'static) -> AgentWriterBuilder {
        AgentWriterBuilder {
            handle: Box::new(handle),
            config: WriterConfig::default(),
            sampler: Arc::new(NoopSamplerFeedback),
            logger: Arc::new(TracingLogger),
            clock: Arc::new(SystemClock),
        }
    }

    /// Shorthand for [`builder`](AgentWriter::builder) with an explicit
    /// configuration and defaults for everything else.
    pub fn new(handle: impl HttpHandle + 'static, config: WriterConfig) -> Result<Self, Error> {
        AgentWriter::builder(handle).with_config(config).build()
    }

    /// Enqueue a trace for transmission. Never blocks on I/O. When the queue
    /// already holds `max_queued_traces` traces, the new trace is dropped.
    pub fn write_trace(&self, trace: Trace) {
        let first_drop = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.stopped {
                return;
            }
            if inner.queue.len() >= self.max_queued_traces {
                inner.dropped += 1;
                inner.dropped == 1
            } else {
                inner.queue.push(trace);
                inner.submitted += 1;
                self.shared.work.notify_all();
                return;
            }
        };
        if first_drop {
            self.logger.log(
                LogLevel::Debug,
                format!(
                    "Trace queue is full (max_queued_traces = {}); dropping traces until the \
                     writer catches up",
                    self.max_queued_traces
                ),
            );
        }
    }

    /// Block until every trace enqueued before this call has been sent or
    /// dropped, or until `timeout` elapses. Returns on timeout without an
    /// error; retry backoffs inside the worker do not extend the wait.
    pub fn flush(&self, timeout: Duration) {
        let deadline = deadline_after(self.clock.now(), timeout);
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.stopped {
            return;
        }
        let target = inner.submitted;
        inner.flush_requested = true;
        self.shared.work.notify_all();
        while inner.processed < target && !inner.stopped {
            let remaining = deadline.saturating_duration_since(self.clock.now());
            if remaining.is_zero() {
                return;
            }
            let (guard, _) = self.shared.done.wait_timeout(inner, remaining).unwrap();
            inner = guard;
        }
    }

    /// Shut down the worker. Any in-flight batch is finished first; traces
    /// still queued are dropped. The HTTP handle is destroyed before `stop`
    /// returns. Idempotent; also invoked by `Drop`.
    pub fn stop(&self) {
        let dropped = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.stopped = true;
            self.shared.work.notify_all();
            self.shared.done.notify_all();
            inner.dropped
        };
        if dropped > 0 {
            self.logger.log(
                LogLevel::Warn,
                format!(
                    "{dropped} traces were dropped over the lifetime of this writer because \
                     the trace queue was full"
                ),
            );
        }
        let join = self.worker.lock().unwrap().take();
        if let Some(join) = join {
            if join.join().is_err() {
                self.logger
                    .log(LogLevel::Error, "Writer worker thread panicked".to_string());
            }
        }
    }
}

impl TraceWriter for AgentWriter {
    fn write_trace(&self, trace: Trace) {
        AgentWriter::write_trace(self, trace);
    }

    fn flush(&self, timeout: Duration) {
        AgentWriter::flush(self, timeout);
    }
}

impl Drop for AgentWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Inner {
    queue: Vec<Trace>,
    /// Traces accepted into the queue over the writer's lifetime.
    submitted: u64,
    /// Traces the worker has finished handling, sent or dropped.
    processed: u64,
    /// Traces rejected because the queue was full.
    dropped: u64,
    flush_requested: bool,
    stopped: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Wakes the worker: flush requested or stop. Also pulsed on enqueue,
    /// which lets the worker re-check its interval deadline.
    work: Condvar,
    /// Wakes flush callers when `processed` advances.
    done: Condvar,
}

/// The agent URL and, for `unix://` or bare-path overrides, the socket path.
struct AgentTarget {
    url: String,
    unix_socket_path: Option<String>,
}

impl AgentTarget {
    fn resolve(config: &WriterConfig) -> Result<Self, Error> {
        let host_url = format!("http://{}:{}{}", config.host, config.port, TRACES_PATH);
        let target = if config.url.is_empty() {
            AgentTarget {
                url: host_url,
                unix_socket_path: None,
            }
        } else if config.url.starts_with("http://") || config.url.starts_with("https://") {
            AgentTarget {
                url: format!("{}{}", config.url, TRACES_PATH),
                unix_socket_path: None,
            }
        } else if let Some(path) = config.url.strip_prefix("unix://") {
            AgentTarget {
                url: host_url,
                unix_socket_path: Some(path.to_string()),
            }
        } else if config.url.starts_with('/') {
            AgentTarget {
                url: host_url,
                unix_socket_path: Some(config.url.clone()),
            }
        } else {
            return Err(Error::UnsupportedScheme(config.url.clone()));
        };
        target.url.parse::<http::Uri>()?;
        Ok(target)
    }
}

fn request_headers(trace_count: usize) -> HashMap<String, String> {
    HashMap::from([
        ("Content-Type".to_string(), "application/msgpack".to_string()),
        ("Datadog-Meta-Lang".to_string(), META_LANG.to_string()),
        (
            "Datadog-Meta-Tracer-Version".to_string(),
            TRACER_VERSION.to_string(),
        ),
        (
            "Datadog-Meta-Lang-Version".to_string(),
            META_LANG_VERSION.to_string(),
        ),
        ("X-Datadog-Trace-Count".to_string(), trace_count.to_string()),
    ])
}

enum Attempt {
    /// The batch reached the agent; the response (possibly useless) was
    /// handled.
    Delivered,
    /// The POST itself failed.
    TransportFailed(TransportError),
    /// The agent answered with a missing or non-200 status; already logged.
    BadStatus,
}

struct Worker {
    handle: Box<dyn HttpHandle>,
    shared: Arc<Shared>,
    flush_interval: Duration,
    retry_schedule: Vec<Duration>,
    sampler: Arc<dyn SamplerFeedback>,
    logger: Arc<dyn Logger>,
    clock: Arc<dyn Clock>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let (batch, stopping) = self.next_batch();
            if stopping {
                break;
            }
            let count = batch.len() as u64;
            if !batch.is_empty() {
                self.send_batch(batch);
            }
            let mut inner = self.shared.inner.lock().unwrap();
            inner.processed += count;
            self.shared.done.notify_all();
            if inner.stopped {
                break;
            }
        }
        self.logger.log(
            LogLevel::Debug,
            "Trace writer worker thread exiting".to_string(),
        );
        // Dropping self here destroys the handle on the worker thread,
        // which `stop` observes by joining.
    }

    /// Wait until the flush interval elapses or a flush or stop is
    /// requested, then take the whole queue. Enqueues alone do not cut the
    /// interval short, so a batch accumulates between wakeups. When a stop
    /// is pending, nothing is taken: only a batch already in flight gets
    /// finished.
    fn next_batch(&self) -> (Vec<Trace>, bool) {
        let mut inner = self.shared.inner.lock().unwrap();
        let deadline = deadline_after(self.clock.now(), self.flush_interval);
        loop {
            if inner.stopped {
                return (Vec::new(), true);
            }
            if inner.flush_requested {
                break;
            }
            let remaining = deadline.saturating_duration_since(self.clock.now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _) = self.shared.work.wait_timeout(inner, remaining).unwrap();
            inner = guard;
        }
        inner.flush_requested = false;
        (std::mem::take(&mut inner.queue), false)
    }

    fn send_batch(&mut self, batch: Vec<Trace>) {
        let body = match encode::encode(&batch) {
            Ok(body) => body,
            Err(err) => {
                self.logger.log(
                    LogLevel::Error,
                    format!("Error encoding trace batch for the agent: {err}"),
                );
                return;
            }
        };

        if let Err(err) = self.handle.set_option(HandleOption::PostFieldSize(body.len())) {
            self.logger.log(
                LogLevel::Error,
                format!("Error setting agent request size: {err}"),
            );
            return;
        }
        if let Err(err) = self.handle.set_option(HandleOption::PostFields(body)) {
            self.logger.log(
                LogLevel::Error,
                format!("Error setting agent request body: {err}"),
            );
            return;
        }
        if let Err(err) = self.handle.set_headers(request_headers(batch.len())) {
            self.logger.log(
                LogLevel::Error,
                format!("Error setting agent request headers: {err}"),
            );
            return;
        }

        let attempts = self.retry_schedule.len() + 1;
        for attempt in 0..attempts {
            let last = attempt + 1 == attempts;
            match self.post_once() {
                Attempt::Delivered => return,
                Attempt::TransportFailed(err) => {
                    if last {
                        self.logger.log(
                            LogLevel::Error,
                            format!("Error sending traces to agent: {}\n{}", err, err.detail),
                        );
                    }
                }
                Attempt::BadStatus => {}
            }
            if !last && !self.backoff(self.retry_schedule[attempt]) {
                return;
            }
        }
        // Retries exhausted; the batch is dropped.
    }

    fn post_once(&mut self) -> Attempt {
        if let Err(err) = self.handle.perform() {
            return Attempt::TransportFailed(err);
        }

        let status = self.handle.response_status();
        if status == 0 {
            self.logger.log(
                LogLevel::Error,
                "Traces were sent to the agent, but it gave a response without an HTTP status"
                    .to_string(),
            );
            return Attempt::BadStatus;
        }
        if status != 200 {
            self.logger.log(
                LogLevel::Error,
                format!("Received response from agent with HTTP status {status} instead of 200"),
            );
            return Attempt::BadStatus;
        }

        let body = self.handle.response_body();
        if body.is_empty() {
            self.logger.log(
                LogLevel::Error,
                "Traces were sent to the agent, but it gave a response without a body".to_string(),
            );
            return Attempt::Delivered;
        }
        self.handle_response_body(&body);
        Attempt::Delivered
    }

    fn handle_response_body(&self, body: &[u8]) {
        let text = String::from_utf8_lossy(body);
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(response) => {
                if let Some(rates) = response.get("rate_by_service") {
                    match serde_json::to_string(rates) {
                        Ok(rates) => self.sampler.apply_rates(&rates),
                        Err(err) => self.logger.log(
                            LogLevel::Error,
                            format!("Unable to re-serialize sampling rates from agent: {err}"),
                        ),
                    }
                }
            }
            Err(err) => {
                let excerpt = excerpt_around(&text, parse_error_offset(&text, &err));
                self.logger.log(
                    LogLevel::Error,
                    format!(
                        "Unable to parse response from agent.\nError was: {err}\nError near: {excerpt}"
                    ),
                );
            }
        }
    }

    /// Sleep for `period`, waking early when a stop is requested. Returns
    /// false on stop.
    fn backoff(&self, period: Duration) -> bool {
        let deadline = deadline_after(self.clock.now(), period);
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if inner.stopped {
                return false;
            }
            let remaining = deadline.saturating_duration_since(self.clock.now());
            if remaining.is_zero() {
                return true;
            }
            let (guard, _) = self.shared.work.wait_timeout(inner, remaining).unwrap();
            inner = guard;
        }
    }
}

/// `start + timeout`, saturating instead of panicking on absurd timeouts.
fn deadline_after(start: std::time::Instant, timeout: Duration) -> std::time::Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + Duration::from_secs(86_400 * 365))
}

/// Byte offset of a `serde_json` parse error within `body`.
fn parse_error_offset(body: &str, err: &serde_json::Error) -> usize {
    let line_start: usize = body
        .split_inclusive('\n')
        .take(err.line().saturating_sub(1))
        .map(str::len)
        .sum();
    line_start + err.column().saturating_sub(1)
}

/// Up to 50 characters of `body` around `offset`, with `...` on either end
/// where the excerpt cuts the body short.
fn excerpt_around(body: &str, offset: usize) -> String {
    let mut start = offset.saturating_sub(25).min(body.len());
    while !body.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (start + 50).min(body.len());
    while !body.is_char_boundary(end) {
        end += 1;
    }
    let prefix = if start > 0 { "..." } else { "" };
    let suffix = if end < body.len() { "..." } else { "" };
    format!("{prefix}{}{suffix}", &body[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanData;
    use crate::testing::{InMemoryLogger, MockHandle, MockSamplerFeedback};
    use crate::transport::TransportError;
    use std::time::Instant;

    // Long enough that traces are only ever sent when a test flushes.
    const ONLY_SEND_WHEN_FLUSHED: Duration = Duration::from_secs(3_600);

    fn test_config() -> WriterConfig {
        WriterConfig::default()
            .with_host("hostname")
            .with_port(6319)
            .with_url("")
            .with_flush_interval(ONLY_SEND_WHEN_FLUSHED)
            .with_max_queued_traces(25)
            .with_retry_schedule(Vec::new())
    }

    fn test_span(trace_id: u64, span_id: u64) -> SpanData {
        SpanData {
            trace_id,
            span_id,
            parent_id: 0,
            service: "service".to_string(),
            name: "service.name".to_string(),
            resource: "resource".to_string(),
            span_type: "web".to_string(),
            start: 69,
            duration: 420,
            error: 0,
            ..Default::default()
        }
    }

    struct TestWriter {
        writer: AgentWriter,
        handle: crate::testing::MockHandleState,
        sampler: MockSamplerFeedback,
        logger: InMemoryLogger,
    }

    fn make_writer(config: WriterConfig) -> TestWriter {
        let handle = MockHandle::new();
        let state = handle.state();
        let sampler = MockSamplerFeedback::default();
        let logger = InMemoryLogger::default();
        let writer = AgentWriter::builder(handle)
            .with_config(config)
            .with_sampler(Arc::new(sampler.clone()))
            .with_logger(Arc::new(logger.clone()))
            .build()
            .unwrap();
        TestWriter {
            writer,
            handle: state,
            sampler,
            logger,
        }
    }

    #[test]
    fn initializes_handle_correctly() {
        struct Case {
            host: &'static str,
            port: u16,
            url: &'static str,
            expected_url: &'static str,
            expected_socket: Option<&'static str>,
        }
        let cases = [
            Case {
                host: "hostname",
                port: 1234,
                url: "",
                expected_url: "http://hostname:1234/v0.4/traces",
                expected_socket: None,
            },
            Case {
                host: "hostname",
                port: 1234,
                url: "http://override:5678",
                expected_url: "http://override:5678/v0.4/traces",
                expected_socket: None,
            },
            Case {
                host: "localhost",
                port: 8126,
                url: "https://localhost:8126",
                expected_url: "https://localhost:8126/v0.4/traces",
                expected_socket: None,
            },
            Case {
                host: "localhost",
                port: 8126,
                url: "unix:///path/to/trace-agent.socket",
                expected_url: "http://localhost:8126/v0.4/traces",
                expected_socket: Some("/path/to/trace-agent.socket"),
            },
            Case {
                host: "localhost",
                port: 8126,
                url: "/path/to/trace-agent.socket",
                expected_url: "http://localhost:8126/v0.4/traces",
                expected_socket: Some("/path/to/trace-agent.socket"),
            },
        ];

        for case in cases {
            let handle = MockHandle::new();
            let state = handle.state();
            let writer = AgentWriter::builder(handle)
                .with_config(
                    WriterConfig::default()
                        .with_host(case.host)
                        .with_port(case.port)
                        .with_url(case.url),
                )
                .build()
                .unwrap();
            assert_eq!(state.url().as_deref(), Some(case.expected_url));
            assert_eq!(
                state.unix_socket_path().as_deref(),
                case.expected_socket,
                "url override {:?}",
                case.url
            );
            assert_eq!(state.timeout_ms(), Some(2_000));
            writer.stop();
        }
    }

    #[test]
    fn rejects_unsupported_url_schemes() {
        let result = AgentWriter::builder(MockHandle::new()).with_config(
            WriterConfig::default()
                .with_host("localhost")
                .with_port(1234)
                .with_url("gopher://hostname:1234/v0.4/traces"),
        )
        .build();
        assert!(matches!(result, Err(Error::UnsupportedScheme(_))));
    }

    #[test]
    fn bad_handle_causes_construction_to_fail() {
        let handle = MockHandle::new();
        handle
            .state()
            .fail_set_option(TransportError::new("Timeout was reached"));
        let result = AgentWriter::builder(handle)
            .with_config(test_config())
            .build();
        assert!(matches!(result, Err(Error::HandleConfiguration(_))));
    }

    #[test]
    fn traces_can_be_sent() {
        let t = make_writer(test_config());
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));

        let traces = t.handle.traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].len(), 1);
        let span = &traces[0][0];
        assert_eq!(span.name, "service.name");
        assert_eq!(span.service, "service");
        assert_eq!(span.resource, "resource");
        assert_eq!(span.span_type, "web");
        assert_eq!(span.span_id, 1);
        assert_eq!(span.trace_id, 1);
        assert_eq!(span.parent_id, 0);
        assert_eq!(span.error, 0);
        assert_eq!(span.start, 69);
        assert_eq!(span.duration, 420);

        // General connection config: one POST whose declared size matches
        // the body actually set.
        assert_eq!(t.handle.url().as_deref(), Some("http://hostname:6319/v0.4/traces"));
        assert_eq!(t.handle.timeout_ms(), Some(2_000));
        let bodies = t.handle.post_bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(t.handle.post_field_size(), Some(bodies[0].len()));

        assert_eq!(
            t.handle.headers(),
            HashMap::from([
                ("Content-Type".to_string(), "application/msgpack".to_string()),
                ("Datadog-Meta-Lang".to_string(), "rust".to_string()),
                (
                    "Datadog-Meta-Tracer-Version".to_string(),
                    env!("CARGO_PKG_VERSION").to_string()
                ),
                (
                    "Datadog-Meta-Lang-Version".to_string(),
                    env!("CARGO_PKG_RUST_VERSION").to_string()
                ),
                ("X-Datadog-Trace-Count".to_string(), "1".to_string()),
            ])
        );
    }

    #[test]
    fn responses_are_sent_to_sampler() {
        let t = make_writer(test_config());
        t.handle
            .set_response(r#"{"rate_by_service": {"service:nginx,env:": 0.5}}"#);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));

        assert_eq!(
            t.sampler.applied().as_deref(),
            Some(r#"{"service:nginx,env:":0.5}"#)
        );
    }

    #[test]
    fn extra_response_fields_are_ignored() {
        let t = make_writer(test_config());
        t.handle.set_response(
            r#"{"rate_by_service": {"service:nginx,env:": 0.5}, "unrelated": [1, 2, 3]}"#,
        );
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));

        assert_eq!(
            t.sampler.applied().as_deref(),
            Some(r#"{"service:nginx,env:":0.5}"#)
        );
    }

    #[test]
    fn handles_unparseable_responses() {
        // Error at the start of a short body: no truncation at all.
        let t = make_writer(test_config());
        t.handle.set_response("// Error at start, short body");
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));

        let message = t.logger.last_message().unwrap();
        assert!(message.starts_with("Unable to parse response from agent.\nError was: "));
        assert!(message.contains("\nError near: // Error at start, short body"));
        assert!(!message.contains("..."));
        assert_eq!(t.sampler.applied(), None);

        // Error near the start of a long body: truncated on the right only.
        let t = make_writer(test_config());
        let body = "{\"lol\" // Error near start, error message should have truncated \
                    body. 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9";
        t.handle.set_response(body);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));

        let message = t.logger.last_message().unwrap();
        let excerpt = message.split("\nError near: ").nth(1).unwrap();
        assert!(excerpt.ends_with("..."));
        assert!(!excerpt.starts_with("..."));
        assert!(body.starts_with(excerpt.strip_suffix("...").unwrap()));
        assert_eq!(excerpt.strip_suffix("...").unwrap().chars().count(), 50);

        // Error near the end of a long body: truncated on the left only.
        let t = make_writer(test_config());
        let body = "{\"Error near the end, should be truncated. 0 1 2 3 4 5 6 7 8 9 \", oh noes";
        t.handle.set_response(body);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));

        let message = t.logger.last_message().unwrap();
        let excerpt = message.split("\nError near: ").nth(1).unwrap();
        assert!(excerpt.starts_with("..."));
        assert!(!excerpt.ends_with("..."));
        assert!(body.ends_with(excerpt.strip_prefix("...").unwrap()));
        assert_eq!(t.sampler.applied(), None);

        // Error in the middle of a long body: truncated from both ends.
        let t = make_writer(test_config());
        let body = "{\"Error in the middle, truncated from both ends\" lol \
                    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9";
        t.handle.set_response(body);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));

        let message = t.logger.last_message().unwrap();
        let excerpt = message.split("\nError near: ").nth(1).unwrap();
        assert!(excerpt.starts_with("..."));
        assert!(excerpt.ends_with("..."));
        let middle = excerpt
            .strip_prefix("...")
            .unwrap()
            .strip_suffix("...")
            .unwrap();
        assert_eq!(middle.chars().count(), 50);
        assert!(body.contains(middle));
    }

    #[test]
    fn handles_error_responses() {
        // HTTP status zero indicates "no status".
        let t = make_writer(test_config());
        t.handle.set_response_status(0);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));
        assert!(t
            .logger
            .last_message()
            .unwrap()
            .contains("response without an HTTP status"));

        // HTTP status 200 with an empty body means the agent wanted to shed
        // load but is not configured to return 429.
        let t = make_writer(test_config());
        t.handle.set_response_status(200);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));
        assert!(t
            .logger
            .last_message()
            .unwrap()
            .contains("response without a body"));

        // Any other status is unexpected and shows up in the diagnostic.
        for status in [100u16, 199, 201, 404, 429, 500, 599] {
            let t = make_writer(test_config());
            t.handle.set_response_status(status);
            t.writer.write_trace(vec![test_span(1, 1)]);
            t.writer.flush(Duration::from_secs(10));
            assert!(
                t.logger
                    .last_message()
                    .unwrap()
                    .contains(&format!(" {status} ")),
                "status {status}"
            );
        }
    }

    #[test]
    fn queue_does_not_grow_indefinitely() {
        let t = make_writer(test_config());
        for i in 0..30u64 {
            // Only 25 actually get written.
            t.writer.write_trace(vec![test_span(1, i)]);
        }
        t.writer.flush(Duration::from_secs(10));
        assert_eq!(t.handle.traces().len(), 25);
    }

    #[test]
    fn handle_failure_during_request_preparation() {
        let t = make_writer(test_config());
        t.handle
            .fail_set_option(TransportError::new("Timeout was reached"));
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10)); // Does not panic. That's the test!
        assert_eq!(
            t.logger.last_message().unwrap(),
            "Error setting agent request size: Timeout was reached"
        );
        // All spans dropped.
        t.handle.clear_set_option_failure();
        assert_eq!(t.handle.traces().len(), 0);
    }

    #[test]
    fn handle_failure_during_perform() {
        let t = make_writer(test_config());
        t.handle.set_perform_results(vec![Err(
            TransportError::new("Timeout was reached").with_detail("error from libcurl")
        )]);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));
        assert_eq!(
            t.logger.last_message().unwrap(),
            "Error sending traces to agent: Timeout was reached\nerror from libcurl"
        );
    }

    #[test]
    fn responses_are_not_sent_to_sampler_when_the_connection_fails() {
        let t = make_writer(test_config());
        t.handle
            .set_response(r#"{"rate_by_service": {"service:nginx,env:": 0.5}}"#);
        t.handle
            .set_perform_results(vec![Err(TransportError::new("Timeout was reached"))]);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));
        assert_eq!(t.sampler.applied(), None);
    }

    #[test]
    fn stopped_writer_does_nothing_when_written_to() {
        let t = make_writer(test_config());
        t.writer.stop(); // Normally called by Drop.
        // The worker thread is the unique owner of the handle and has
        // dropped it.
        assert!(t.handle.is_destructed());
        // These neither crash nor do anything.
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));
        assert_eq!(t.handle.traces().len(), 0);
        // stop is idempotent.
        t.writer.stop();
    }

    #[test]
    fn worker_lifecycle_is_logged() {
        let t = make_writer(test_config());
        assert!(t.logger.records().iter().any(|record| {
            record.level == LogLevel::Debug && record.message.contains("worker thread started")
        }));

        // stop joins the worker, so its exit record is visible afterwards.
        t.writer.stop();
        assert!(t.logger.records().iter().any(|record| {
            record.level == LogLevel::Debug && record.message.contains("worker thread exiting")
        }));
    }

    #[test]
    fn multiple_threads_can_send_spans() {
        let t = make_writer(test_config());
        let writer = Arc::new(t.writer);
        let senders: Vec<_> = (1..=4u64)
            .map(|trace_id| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    writer.write_trace(
                        (1..=5u64).map(|span_id| test_span(trace_id, span_id)).collect(),
                    );
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }
        writer.flush(Duration::from_secs(10));

        let traces = t.handle.traces();
        assert_eq!(traces.len(), 4);
        let mut seen_ids: HashMap<u64, std::collections::HashSet<u64>> = HashMap::new();
        for trace in &traces {
            assert_eq!(trace.len(), 5);
            for span in trace {
                seen_ids.entry(span.trace_id).or_default().insert(span.span_id);
                assert_eq!(span.name, "service.name");
                assert_eq!(span.service, "service");
                assert_eq!(span.start, 69);
                assert_eq!(span.duration, 420);
            }
        }
        let all: std::collections::HashSet<u64> = (1..=5).collect();
        assert_eq!(seen_ids.len(), 4);
        for trace_id in 1..=4u64 {
            assert_eq!(seen_ids[&trace_id], all);
        }
    }

    #[test]
    fn writes_happen_periodically() {
        let t = make_writer(test_config().with_flush_interval(Duration::from_millis(50)));
        for i in 1..=7u64 {
            t.writer.write_trace(vec![test_span(i, 1)]);
            std::thread::sleep(Duration::from_millis(20));
        }
        // All 7 traces arrive without an explicit flush.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut trace_ids = std::collections::HashSet::new();
        while trace_ids.len() < 7 {
            assert!(Instant::now() < deadline, "periodic flush never delivered");
            for trace in t.handle.traces() {
                assert_eq!(trace.len(), 1);
                trace_ids.insert(trace[0].trace_id);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(trace_ids, (1..=7u64).collect());
    }

    #[test]
    fn periodic_flush_follows_the_injected_clock() {
        let handle = MockHandle::new();
        let state = handle.state();
        let clock = Arc::new(crate::testing::ManualClock::new());
        let writer = AgentWriter::builder(handle)
            .with_config(test_config())
            .with_clock(clock.clone())
            .build()
            .unwrap();

        // Each write wakes the worker, which re-checks its deadline against
        // the manual clock; advancing past the flush interval turns the
        // wake into a periodic flush without any real time passing.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            clock.advance(2 * ONLY_SEND_WHEN_FLUSHED);
            writer.write_trace(vec![test_span(1, 1)]);
            if !state.traces().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "clock-driven flush never fired");
            std::thread::sleep(Duration::from_millis(10));
        }
        writer.stop();
    }

    #[test]
    fn failed_sends_are_retried() {
        let t = make_writer(test_config().with_retry_schedule(vec![
            Duration::from_millis(50),
            Duration::from_millis(99),
        ]));
        t.handle.set_perform_results(vec![
            Err(TransportError::new("Timeout was reached")),
            Ok(()),
        ]);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));
        assert_eq!(t.handle.perform_call_count(), 2);
    }

    #[test]
    fn retries_are_eventually_given_up() {
        let t = make_writer(test_config().with_retry_schedule(vec![
            Duration::from_millis(50),
            Duration::from_millis(99),
        ]));
        t.handle.set_perform_results(vec![Err(
            TransportError::new("Timeout was reached").with_detail("error from libcurl")
        )]);
        t.writer.write_trace(vec![test_span(1, 1)]);
        t.writer.flush(Duration::from_secs(10));
        // Once originally, and two retries.
        assert_eq!(t.handle.perform_call_count(), 3);
        assert!(t
            .logger
            .last_message()
            .unwrap()
            .contains("error from libcurl"));
        assert_eq!(t.sampler.applied(), None);
    }

    #[test]
    fn flush_honors_its_timeout() {
        // The worker will sleep 60 seconds before retrying; flush must not
        // wait for it.
        let t = make_writer(test_config().with_retry_schedule(vec![Duration::from_secs(60)]));
        t.handle
            .set_perform_results(vec![Err(TransportError::new("Timeout was reached"))]);
        t.writer.write_trace(vec![test_span(1, 1)]);

        let start = Instant::now();
        t.writer.flush(Duration::from_millis(250));
        let waited = Instant::now() - start;
        assert!(waited < Duration::from_secs(30), "flush waited {waited:?}");
    }

    #[test]
    fn repeated_requests_replace_headers() {
        // Headers must be replaced, not appended, across successive
        // requests; extraneous headers would otherwise accumulate.
        let t = make_writer(test_config());
        for _ in 0..5 {
            t.writer.write_trace(vec![test_span(1, 1)]);
            t.writer.write_trace(vec![test_span(2, 1)]);
            t.writer.write_trace(vec![test_span(3, 1)]);
            t.writer.flush(Duration::from_secs(10));
            let headers = t.handle.headers();
            assert_eq!(headers.len(), 5);
            assert_eq!(headers["X-Datadog-Trace-Count"], "3");
        }
    }

    #[test]
    fn flush_with_nothing_queued_returns_immediately() {
        let t = make_writer(test_config());
        t.writer.flush(Duration::from_secs(10));
        assert_eq!(t.handle.perform_call_count(), 0);
    }

    #[test]
    fn span_buffer_feeds_the_writer() {
        use crate::span::SpanContext;
        use crate::span_buffer::SpanBuffer;

        let t = make_writer(test_config());
        let writer = Arc::new(t.writer);
        let buffer = SpanBuffer::new(writer, Arc::new(InMemoryLogger::default()));

        buffer.register_span(&SpanContext {
            trace_id: 9,
            span_id: 1,
            ..Default::default()
        });
        buffer.register_span(&SpanContext {
            trace_id: 9,
            span_id: 2,
            ..Default::default()
        });
        buffer.finish_span(test_span(9, 2));
        buffer.finish_span(test_span(9, 1));
        buffer.flush(Duration::from_secs(10));

        let traces = t.handle.traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].len(), 2);
        assert_eq!(traces[0][0].span_id, 2);
        assert_eq!(traces[0][1].span_id, 1);
    }
}
