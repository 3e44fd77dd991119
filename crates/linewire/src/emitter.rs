//! Reply emission: envelope queueing and the output writer task.
//!
//! All outgoing envelopes funnel through one unbounded channel into a single
//! writer task that owns the output stream. One owner means one line is
//! always written fully before the next begins, and queue order is emission
//! order, so a handler's progress updates land ahead of its terminal reply.

use std::io;

use chrono::{DateTime, Utc};
use futures::SinkExt;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::codec::lines_err_to_io;
use crate::protocol::{Envelope, ErrorBody, ErrorCode, LogRecord, topic};

/// Handle for queueing envelopes onto the output stream.
///
/// Clones share one writer task. Sending fails with `BrokenPipe` once the
/// writer has gone away.
#[derive(Clone)]
pub(crate) struct ReplyEmitter {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ReplyEmitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, envelope: Envelope) -> io::Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "output channel closed"))
    }

    pub(crate) fn response(&self, id: String, data: Value) -> io::Result<()> {
        self.emit(Envelope::response(id, data))
    }

    pub(crate) fn event(&self, method: &str, data: Value) -> io::Result<()> {
        self.emit(Envelope::event(method, data))
    }

    /// Terminal error reply with a reserved code. Protocol layer only.
    pub(crate) fn protocol_error(
        &self,
        id: Option<String>,
        code: ErrorCode,
        data: Value,
    ) -> io::Result<()> {
        self.emit(Envelope::error(id, ErrorBody::reserved(code, data)))
    }
}

/// Per-request emit capability handed to handlers.
///
/// Everything sent here is a notification for this request; the terminal
/// reply is produced by the dispatcher from the handler's return value.
#[derive(Clone)]
pub struct RequestContext {
    id: String,
    params: Value,
    emitter: ReplyEmitter,
}

impl RequestContext {
    pub(crate) fn new(id: String, params: Value, emitter: ReplyEmitter) -> Self {
        Self {
            id,
            params,
            emitter,
        }
    }

    /// Correlation id of the request being handled.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Send an in-flight progress update for this request.
    pub fn progress(&self, data: Value) -> io::Result<()> {
        self.emitter.emit(Envelope::progress(self.id.clone(), data))
    }

    /// Like [`progress`](Self::progress), recording when the payload was
    /// constructed; transmission time is stamped separately at write time.
    pub fn progress_at(&self, data: Value, created_at: DateTime<Utc>) -> io::Result<()> {
        self.emitter
            .emit(Envelope::progress(self.id.clone(), data).with_created_at(created_at))
    }

    /// Send an unsolicited event; `method` acts as a topic name.
    pub fn event(&self, method: impl Into<String>, data: Value) -> io::Result<()> {
        self.emitter.emit(Envelope::event(method, data))
    }

    /// Send a [`LogRecord`] as a `log` event.
    pub fn log(&self, record: LogRecord) -> io::Result<()> {
        let data = serde_json::to_value(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.emitter.event(topic::LOG, data)
    }
}

/// Drain the envelope channel into the output stream.
///
/// Stamps `seq` and (when unset) `timestamp` on each envelope, then writes it
/// as one line. An envelope that fails to serialize degrades to a protocol
/// error reply carrying the same correlation id; only stream I/O failure ends
/// the task. Returns once the queue is flushed and either every sender is
/// dropped or `done` is cancelled — the latter covers long-lived senders such
/// as an installed log layer that would otherwise hold the channel open.
pub(crate) async fn run_writer<W>(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    output: W,
    done: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(output, LinesCodec::new());
    let mut seq: u64 = 0;

    loop {
        let envelope = tokio::select! {
            biased;

            maybe = rx.recv() => match maybe {
                Some(envelope) => envelope,
                None => return Ok(()),
            },

            () = done.cancelled() => {
                rx.close();
                break;
            }
        };
        seq += 1;
        write_envelope(&mut framed, envelope, seq).await?;
    }

    // Queue contents from before the close signal still go out.
    while let Some(envelope) = rx.recv().await {
        seq += 1;
        write_envelope(&mut framed, envelope, seq).await?;
    }

    Ok(())
}

async fn write_envelope<W>(
    framed: &mut FramedWrite<W, LinesCodec>,
    mut envelope: Envelope,
    seq: u64,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    envelope.stamp(seq, Utc::now());

    let line = match serde_json::to_string(&envelope) {
        Ok(line) => line,
        Err(err) => {
            tracing::warn!(error = %err, id = ?envelope.id(), "reply failed to encode, degrading to protocol error");
            let mut fallback = Envelope::error(
                envelope.id().map(str::to_owned),
                ErrorBody::reserved(ErrorCode::EncodingFailed, Value::Null),
            );
            fallback.stamp(seq, Utc::now());
            match serde_json::to_string(&fallback) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!(error = %err, "error reply failed to encode, dropping");
                    return Ok(());
                }
            }
        }
    };

    framed.send(line).await.map_err(lines_err_to_io)
}
