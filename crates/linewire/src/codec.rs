//! Line framing for worker communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization: exactly one
//! JSON value per line, newline-terminated, UTF-8. Works over any
//! AsyncRead/AsyncWrite (pipes, sockets, etc). Serialization escapes embedded
//! newlines inside string payloads, so a logical message never spans lines.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::protocol::Request;

/// Codec that frames messages as lines and serializes with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization. Decoding is strict: a
/// line that does not parse as `T` is an `InvalidData` error. The worker's
/// read path frames with bare `LinesCodec` and goes through
/// [`decode_request`] instead, so one bad line costs one error reply, not the
/// stream.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(lines_err_to_io)? {
            Some(line) => {
                let item = serde_json::from_str(&line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        self.inner.encode(json, dst).map_err(lines_err_to_io)
    }
}

pub(crate) fn lines_err_to_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line too long")
        }
        LinesCodecError::Io(e) => e,
    }
}

/// A line that could not be decoded into a [`Request`].
///
/// Carries the correlation id when one could be recovered, so the error reply
/// can still be matched by the parent.
#[derive(Debug, thiserror::Error)]
#[error("malformed message: {reason}")]
pub struct MalformedMessage {
    pub id: Option<String>,
    pub reason: String,
}

impl MalformedMessage {
    fn new(id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

/// Parse one line into a [`Request`].
///
/// Fails when the line is not valid JSON, is not an object, lacks a string
/// `method`, or lacks a non-empty string `id`. The recovered id (when the
/// line carried one) rides along in the error for correlation.
pub fn decode_request(line: &str) -> Result<Request, MalformedMessage> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| MalformedMessage::new(None, format!("invalid JSON: {e}")))?;

    let Value::Object(fields) = value else {
        return Err(MalformedMessage::new(None, "message must be a JSON object"));
    };

    let id = fields
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned);

    let Some(method) = fields.get("method").and_then(Value::as_str) else {
        return Err(MalformedMessage::new(
            id,
            "message must have a string `method` field",
        ));
    };

    let Some(id) = id else {
        return Err(MalformedMessage::new(
            None,
            "message must have a non-empty string `id` field",
        ));
    };

    let params = fields.get("params").cloned().unwrap_or(Value::Null);

    Ok(Request {
        id,
        method: method.to_string(),
        params,
    })
}
