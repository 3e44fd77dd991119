//! Worker event loop: read, dispatch, drain.
//!
//! The loop is the single reader of the input stream. Each line becomes its
//! own dispatch task, so requests overlap freely; all replies funnel through
//! the writer task in `emitter`. On end-of-stream (or shutdown) the loop
//! drains in-flight handlers for a bounded grace period, emits a final
//! shutdown event, and flushes the output before returning.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::lines_err_to_io;
use crate::dispatch::Dispatcher;
use crate::emitter::{ReplyEmitter, run_writer};
use crate::log_layer::IpcLogLayer;
use crate::protocol::{Envelope, topic};
use crate::registry::HandlerRegistry;

/// Worker loop policy knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait for in-flight handlers once the input stream ends.
    /// Requests still running when it expires are abandoned without a
    /// terminal reply.
    pub drain_grace: Duration,

    /// Ship failure diagnostics to the parent in `error.data`. Off by
    /// default: the parent sees reserved codes and messages only.
    pub expose_error_detail: bool,

    /// Cancelling this token stops the loop as if the input stream had
    /// ended. Clone it into a handler to let the parent request shutdown
    /// as a method call.
    pub shutdown: CancellationToken,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(5),
            expose_error_detail: false,
            shutdown: CancellationToken::new(),
        }
    }
}

/// A worker instance: one registry, one input stream, one output stream.
///
/// Registries are per-worker rather than process-global, so independent
/// workers can run in one process (or one test).
pub struct Worker {
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    tx: tokio::sync::mpsc::UnboundedSender<Envelope>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
}

impl Worker {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(registry, WorkerConfig::default())
    }

    pub fn with_config(registry: HandlerRegistry, config: WorkerConfig) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            registry: Arc::new(registry),
            config,
            tx,
            rx,
        }
    }

    /// Tracing layer that forwards this worker's log events to the parent.
    ///
    /// Envelopes queued before [`run`](Self::run) starts are flushed once it
    /// does, so the layer can be installed ahead of the loop.
    pub fn log_layer(&self) -> IpcLogLayer {
        IpcLogLayer::new(ReplyEmitter::new(self.tx.clone()))
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.config.shutdown.clone()
    }

    /// Run over stdin/stdout, the standard transport for a spawned worker.
    pub async fn run_stdio(self) -> io::Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run the read-dispatch-write cycle until end-of-stream or shutdown.
    ///
    /// Returns `Err` only for stream-level I/O failure; everything else is
    /// reported to the parent through the reply stream.
    pub async fn run<R, W>(self, input: R, output: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            registry,
            config,
            tx,
            rx,
        } = self;

        let session = Uuid::new_v4();
        let writer_done = CancellationToken::new();
        let mut writer = tokio::spawn(run_writer(rx, output, writer_done.clone()));

        let emitter = ReplyEmitter::new(tx);
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            emitter.clone(),
            config.expose_error_detail,
        ));

        let _ = emitter.event(topic::READY, json!({ "session": session }));
        tracing::info!(%session, "worker ready");

        let mut reader = FramedRead::new(input, LinesCodec::new());
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let shutdown = config.shutdown.clone();

        let reason = loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break "shutdown requested",

                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "dispatch task failed");
                    }
                }

                line = reader.next() => match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let dispatcher = Arc::clone(&dispatcher);
                        in_flight.spawn(async move { dispatcher.dispatch_line(line).await });
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "input stream failed");
                        return Err(lines_err_to_io(e));
                    }
                    None => break "end of input",
                },

                joined = &mut writer => {
                    tracing::error!("output stream failed, exiting");
                    return Err(writer_failure(joined));
                }
            }
        };

        tracing::info!(reason, in_flight = in_flight.len(), "input finished, draining");
        let drained = timeout(config.drain_grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                abandoned = in_flight.len(),
                grace = ?config.drain_grace,
                "drain grace expired, abandoning in-flight requests"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        let _ = emitter.event(topic::SHUTDOWN, json!({ "session": session, "reason": reason }));
        tracing::info!(%session, reason, "worker exiting");

        // Release our senders and signal the writer so it stops even when a
        // long-lived clone (an installed log layer) keeps the channel open.
        drop(dispatcher);
        drop(emitter);
        writer_done.cancel();

        match writer.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

fn writer_failure(joined: Result<io::Result<()>, JoinError>) -> io::Error {
    match joined {
        Ok(Ok(())) => io::Error::new(io::ErrorKind::BrokenPipe, "writer exited early"),
        Ok(Err(e)) => e,
        Err(e) => io::Error::new(io::ErrorKind::Other, e),
    }
}
