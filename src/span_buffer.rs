use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::log::{LogLevel, Logger};
use crate::span::{SpanContext, SpanData, Trace};

/// Metric key under which a trace's sampling priority is stamped into each
/// of its spans at dispatch.
const SAMPLING_PRIORITY_METRIC: &str = "_sampling_priority_v1";

/// Destination for completed traces.
///
/// [`AgentWriter`] is the production implementation; the `testing` module
/// provides an in-memory one.
///
/// [`AgentWriter`]: crate::AgentWriter
pub trait TraceWriter: Send + Sync {
    /// Take ownership of a completed trace for transmission. Never blocks on
    /// I/O; the trace may be silently dropped under backpressure.
    fn write_trace(&self, trace: Trace);

    /// Block until previously written traces have been sent or dropped, or
    /// until `timeout` elapses.
    fn flush(&self, timeout: Duration);
}

/// A trace with at least one registered, unfinished span.
struct PendingTrace {
    open_count: usize,
    finished: Vec<SpanData>,
    sampling_priority: Option<i32>,
}

/// Assembly area for in-flight traces.
///
/// Spans announce themselves with [`register_span`] when they start and hand
/// over their payload with [`finish_span`] when they end. The buffer tracks
/// how many spans of each trace are still open; when the last one finishes,
/// the whole trace is forwarded to the [`TraceWriter`] in a single hand-off.
///
/// Once dispatched, a trace id is forgotten: a later `register_span` with
/// the same id starts a fresh trace. Finishing a span that was never
/// registered discards that span with a logged diagnostic, without affecting
/// the rest of its trace.
///
/// All operations are safe to call from any thread.
///
/// [`register_span`]: SpanBuffer::register_span
/// [`finish_span`]: SpanBuffer::finish_span
pub struct SpanBuffer {
    writer: Arc<dyn TraceWriter>,
    logger: Arc<dyn Logger>,
    traces: Mutex<HashMap<u64, PendingTrace>>,
}

enum Finish {
    Orphan,
    StillOpen,
    Complete(Trace),
}

impl SpanBuffer {
    pub fn new(writer: Arc<dyn TraceWriter>, logger: Arc<dyn Logger>) -> Self {
        SpanBuffer {
            writer,
            logger,
            traces: Mutex::new(HashMap::new()),
        }
    }

    /// Announce a span belonging to `ctx.trace_id` that will eventually be
    /// finished. Every `register_span` must be paired with exactly one
    /// `finish_span` for the trace to complete.
    pub fn register_span(&self, ctx: &SpanContext) {
        let mut traces = self.traces.lock().unwrap();
        traces
            .entry(ctx.trace_id)
            .or_insert_with(|| PendingTrace {
                open_count: 0,
                finished: Vec::new(),
                sampling_priority: None,
            })
            .open_count += 1;
    }

    /// Record a finished span. If it was the last open span of its trace,
    /// the trace is handed to the writer.
    pub fn finish_span(&self, span: SpanData) {
        let trace_id = span.trace_id;
        let finish = {
            let mut traces = self.traces.lock().unwrap();
            match traces.entry(trace_id) {
                Entry::Vacant(_) => Finish::Orphan,
                Entry::Occupied(mut entry) => {
                    let pending = entry.get_mut();
                    pending.finished.push(span);
                    pending.open_count -= 1;
                    if pending.open_count == 0 {
                        Finish::Complete(finalize(entry.remove()))
                    } else {
                        Finish::StillOpen
                    }
                }
            }
        };
        // The registry lock is released before dispatch; write_trace must
        // not depend on it.
        match finish {
            Finish::Orphan => self.logger.log(
                LogLevel::Error,
                format!(
                    "A span was finished for trace {trace_id} without having been registered; \
                     the span has been discarded"
                ),
            ),
            Finish::StillOpen => {}
            Finish::Complete(trace) => self.writer.write_trace(trace),
        }
    }

    /// Record the sampling priority decided for a pending trace. The
    /// priority is stamped into every span of the trace at dispatch. Unknown
    /// trace ids are ignored.
    pub fn set_sampling_priority(&self, trace_id: u64, priority: i32) {
        let mut traces = self.traces.lock().unwrap();
        if let Some(pending) = traces.get_mut(&trace_id) {
            pending.sampling_priority = Some(priority);
        }
    }

    /// Ask the writer to drain; used on shutdown.
    pub fn flush(&self, timeout: Duration) {
        self.writer.flush(timeout);
    }
}

fn finalize(pending: PendingTrace) -> Trace {
    let mut finished = pending.finished;
    if let Some(priority) = pending.sampling_priority {
        for span in &mut finished {
            span.metrics
                .insert(SAMPLING_PRIORITY_METRIC.to_string(), priority as f64);
        }
    }
    finished
}
