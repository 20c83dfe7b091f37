//! Decoder for the v0.4 trace payload, used to assert on what a writer
//! actually put on the wire.

use std::fmt;
use std::io::{Cursor, Read};

use crate::span::{SpanData, Trace};

/// A POSTed body that is not a well-formed v0.4 trace payload.
#[derive(Debug, thiserror::Error)]
#[error("malformed trace payload: {0}")]
pub struct DecodeError(String);

fn bad(err: impl fmt::Debug) -> DecodeError {
    DecodeError(format!("{err:?}"))
}

/// Decode a request body as written by the agent writer.
pub fn decode_traces(body: &[u8]) -> Result<Vec<Trace>, DecodeError> {
    let mut rd = Cursor::new(body);
    let trace_count = rmp::decode::read_array_len(&mut rd).map_err(bad)?;
    let mut traces = Vec::with_capacity(trace_count as usize);
    for _ in 0..trace_count {
        let span_count = rmp::decode::read_array_len(&mut rd).map_err(bad)?;
        let mut trace = Vec::with_capacity(span_count as usize);
        for _ in 0..span_count {
            trace.push(decode_span(&mut rd)?);
        }
        traces.push(trace);
    }
    Ok(traces)
}

fn decode_span(rd: &mut Cursor<&[u8]>) -> Result<SpanData, DecodeError> {
    let entries = rmp::decode::read_map_len(rd).map_err(bad)?;
    let mut span = SpanData::default();
    for _ in 0..entries {
        let key = read_string(rd)?;
        match key.as_str() {
            "type" => span.span_type = read_string(rd)?,
            "service" => span.service = read_string(rd)?,
            "resource" => span.resource = read_string(rd)?,
            "name" => span.name = read_string(rd)?,
            "trace_id" => span.trace_id = rmp::decode::read_int(rd).map_err(bad)?,
            "span_id" => span.span_id = rmp::decode::read_int(rd).map_err(bad)?,
            "parent_id" => span.parent_id = rmp::decode::read_int(rd).map_err(bad)?,
            "start" => span.start = rmp::decode::read_int(rd).map_err(bad)?,
            "duration" => span.duration = rmp::decode::read_int(rd).map_err(bad)?,
            "error" => span.error = rmp::decode::read_int(rd).map_err(bad)?,
            "meta" => {
                let len = rmp::decode::read_map_len(rd).map_err(bad)?;
                for _ in 0..len {
                    let key = read_string(rd)?;
                    let value = read_string(rd)?;
                    span.meta.insert(key, value);
                }
            }
            "metrics" => {
                let len = rmp::decode::read_map_len(rd).map_err(bad)?;
                for _ in 0..len {
                    let key = read_string(rd)?;
                    let value = rmp::decode::read_f64(rd).map_err(bad)?;
                    span.metrics.insert(key, value);
                }
            }
            other => return Err(DecodeError(format!("unexpected span field {other:?}"))),
        }
    }
    Ok(span)
}

fn read_string(rd: &mut Cursor<&[u8]>) -> Result<String, DecodeError> {
    let len = rmp::decode::read_str_len(rd).map_err(bad)? as usize;
    let mut buf = vec![0u8; len];
    rd.read_exact(&mut buf).map_err(bad)?;
    String::from_utf8(buf).map_err(bad)
}
