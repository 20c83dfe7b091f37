use crate::span::Trace;

// Trace API v0.4 payload: an array of traces, where each trace is an array
// of spans and each span is a map with exactly 12 entries, keyed by field
// name:
//
//   type      (str)
//   service   (str)
//   resource  (str)
//   name      (str)
//   trace_id  (uint64)
//   span_id   (uint64)
//   parent_id (uint64)
//   start     (int64, ns since the Unix epoch)
//   duration  (int64, ns)
//   error     (int32)
//   meta      (map[str]str)
//   metrics   (map[str]float64)
//
// The agent tolerates missing entries but the reference tracers always send
// all twelve, so this encoder does too.

const SPAN_NUM_ELEMENTS: u32 = 12;

/// Wrap type for msgpack encoding failures.
#[derive(Debug, thiserror::Error)]
#[error("message pack error")]
pub(crate) struct EncodeError;

impl From<rmp::encode::ValueWriteError> for EncodeError {
    fn from(_: rmp::encode::ValueWriteError) -> Self {
        EncodeError
    }
}

/// Encode a batch of traces as a Trace API v0.4 request body.
pub(crate) fn encode(traces: &[Trace]) -> Result<Vec<u8>, EncodeError> {
    let mut encoded = Vec::new();
    rmp::encode::write_array_len(&mut encoded, traces.len() as u32)?;

    for trace in traces {
        rmp::encode::write_array_len(&mut encoded, trace.len() as u32)?;

        for span in trace {
            rmp::encode::write_map_len(&mut encoded, SPAN_NUM_ELEMENTS)?;

            rmp::encode::write_str(&mut encoded, "type")?;
            rmp::encode::write_str(&mut encoded, &span.span_type)?;

            rmp::encode::write_str(&mut encoded, "service")?;
            rmp::encode::write_str(&mut encoded, &span.service)?;

            rmp::encode::write_str(&mut encoded, "resource")?;
            rmp::encode::write_str(&mut encoded, &span.resource)?;

            rmp::encode::write_str(&mut encoded, "name")?;
            rmp::encode::write_str(&mut encoded, &span.name)?;

            rmp::encode::write_str(&mut encoded, "trace_id")?;
            rmp::encode::write_u64(&mut encoded, span.trace_id)?;

            rmp::encode::write_str(&mut encoded, "span_id")?;
            rmp::encode::write_u64(&mut encoded, span.span_id)?;

            rmp::encode::write_str(&mut encoded, "parent_id")?;
            rmp::encode::write_u64(&mut encoded, span.parent_id)?;

            rmp::encode::write_str(&mut encoded, "start")?;
            rmp::encode::write_i64(&mut encoded, span.start)?;

            rmp::encode::write_str(&mut encoded, "duration")?;
            rmp::encode::write_i64(&mut encoded, span.duration)?;

            rmp::encode::write_str(&mut encoded, "error")?;
            rmp::encode::write_i32(&mut encoded, span.error)?;

            rmp::encode::write_str(&mut encoded, "meta")?;
            rmp::encode::write_map_len(&mut encoded, span.meta.len() as u32)?;
            for (key, value) in &span.meta {
                rmp::encode::write_str(&mut encoded, key)?;
                rmp::encode::write_str(&mut encoded, value)?;
            }

            rmp::encode::write_str(&mut encoded, "metrics")?;
            rmp::encode::write_map_len(&mut encoded, span.metrics.len() as u32)?;
            for (key, value) in &span.metrics {
                rmp::encode::write_str(&mut encoded, key)?;
                rmp::encode::write_f64(&mut encoded, *value)?;
            }
        }
    }

    Ok(encoded)
}
