use std::collections::HashMap;

/// Identity of a span that has been started but not yet finished.
///
/// A context is all the [`SpanBuffer`] needs to know about a span up front:
/// which trace it belongs to and which span it is. The `origin` and `baggage`
/// fields travel with the context during propagation but are not interpreted
/// by the buffering layer.
///
/// [`SpanBuffer`]: crate::SpanBuffer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: u64,
    pub span_id: u64,
    pub origin: String,
    pub baggage: HashMap<String, String>,
}

/// The serialized form of a finished span, as produced by the tracer
/// front-end.
///
/// `start` and `duration` are nanoseconds; `start` is relative to the Unix
/// epoch. `error` is nonzero when the span carries an error. String tags live
/// in `meta`, numeric tags in `metrics`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanData {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    pub service: String,
    pub name: String,
    pub resource: String,
    pub span_type: String,
    pub start: i64,
    pub duration: i64,
    pub error: i32,
    pub meta: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
}

/// All finished spans of one trace, in finish order.
pub type Trace = Vec<SpanData>;
