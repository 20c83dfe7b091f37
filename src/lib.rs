//! Data-plane core of a Datadog tracing client.
//!
//! This crate implements the pipeline between an instrumented application
//! and the local Datadog trace agent: finished spans are assembled into
//! traces by a [`SpanBuffer`], complete traces are queued on an
//! [`AgentWriter`], and a background worker ships them to the agent over
//! HTTP in msgpack batches, feeding the agent's per-service sampling rates
//! back through a [`SamplerFeedback`] sink.
//!
//! Delivery is best-effort by design: the queue is bounded, overflow and
//! exhausted retries drop traces, and nothing in the pipeline blocks the
//! instrumented application on network I/O.
//!
//! # Getting Started
//!
//! ```no_run
//! # #[cfg(feature = "reqwest-blocking-client")]
//! # {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use dd_trace_client::{
//!     AgentWriter, ReqwestHandle, SpanBuffer, SpanContext, SpanData, WriterConfig,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = ReqwestHandle::new()?;
//! let writer = AgentWriter::builder(handle)
//!     .with_config(WriterConfig::default().with_host("localhost").with_port(8126))
//!     .build()?;
//! let buffer = SpanBuffer::new(Arc::new(writer), Arc::new(dd_trace_client::TracingLogger));
//!
//! // The tracer front-end registers spans as they start and finishes them
//! // as they end; the pipeline does the rest.
//! let context = SpanContext { trace_id: 1, span_id: 1, ..Default::default() };
//! buffer.register_span(&context);
//! buffer.finish_span(SpanData {
//!     trace_id: 1,
//!     span_id: 1,
//!     service: "example".to_string(),
//!     name: "example.request".to_string(),
//!     resource: "GET /".to_string(),
//!     ..Default::default()
//! });
//!
//! // Drain the queue before shutting down.
//! buffer.flush(Duration::from_secs(2));
//! # Ok(())
//! # }
//! # }
//! ```
//!
//! # Crate Feature Flags
//!
//! * `reqwest-blocking-client` (default): [`ReqwestHandle`], an
//!   [`HttpHandle`] binding over `reqwest`'s blocking client.
//! * `testing`: in-memory doubles for the handle, logger, sampler and
//!   writer seams.

#![warn(
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod clock;
mod config;
mod encode;
mod error;
mod log;
mod sampler;
mod span;
mod span_buffer;
mod transport;
mod writer;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use config::WriterConfig;
pub use error::Error;
pub use log::{LogLevel, Logger, TracingLogger};
pub use sampler::{NoopSamplerFeedback, SamplerFeedback};
pub use span::{SpanContext, SpanData, Trace};
pub use span_buffer::{SpanBuffer, TraceWriter};
pub use transport::{HandleOption, HttpHandle, TransportError};
#[cfg(feature = "reqwest-blocking-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest-blocking-client")))]
pub use transport::ReqwestHandle;
pub use writer::{AgentWriter, AgentWriterBuilder, TRACER_VERSION};
