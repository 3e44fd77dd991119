//! Tracing layer that ships worker log events to the parent.
//!
//! Forwards structured tracing events over the protocol as `log` events,
//! preserving target and level. Severity filtering is the subscriber's job
//! (compose with an `EnvFilter`); this layer only translates and sends.

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::emitter::ReplyEmitter;
use crate::protocol::{LogLevel, LogRecord, topic};

/// Targets that are never shipped: encoding a log envelope must not trigger
/// another log that creates another envelope, and so on.
const QUIET_TARGETS: [&str; 2] = ["linewire::emitter", "linewire::codec"];

/// Forwards tracing events as `log` event envelopes.
///
/// Obtain one from [`Worker::log_layer`](crate::Worker::log_layer) and
/// compose it into the application's subscriber; the library never installs
/// a global subscriber itself.
pub struct IpcLogLayer {
    emitter: ReplyEmitter,
}

impl IpcLogLayer {
    pub(crate) fn new(emitter: ReplyEmitter) -> Self {
        Self { emitter }
    }

    fn level(level: &Level) -> LogLevel {
        match *level {
            Level::TRACE | Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }
}

impl<S> Layer<S> for IpcLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if QUIET_TARGETS.iter().any(|quiet| target.starts_with(quiet)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord::new(Self::level(metadata.level()), visitor.message)
            .with_target(target.to_string());
        if let Ok(data) = serde_json::to_value(&record) {
            let _ = self.emitter.event(topic::LOG, data);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tracing_subscriber::layer::SubscriberExt;

    fn layer_with_channel() -> (IpcLogLayer, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (IpcLogLayer::new(ReplyEmitter::new(tx)), rx)
    }

    #[test]
    fn ships_events_as_log_envelopes() {
        let (layer, mut rx) = layer_with_channel();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "app::pipeline", "stage fetch finished");
        });

        match rx.try_recv().unwrap() {
            Envelope::Event { method, data, .. } => {
                assert_eq!(method, topic::LOG);
                assert_eq!(data["level"], json!("info"));
                assert_eq!(data["message"], json!("stage fetch finished"));
                assert_eq!(data["target"], json!("app::pipeline"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn skips_output_path_targets() {
        let (layer, mut rx) = layer_with_channel();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "linewire::emitter", "never shipped");
            tracing::warn!(target: "linewire::codec", "never shipped");
            tracing::warn!(target: "app", "shipped");
        });

        let env = rx.try_recv().unwrap();
        match env {
            Envelope::Event { data, .. } => assert_eq!(data["message"], json!("shipped")),
            other => panic!("expected event, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn maps_trace_and_debug_to_debug() {
        assert_eq!(IpcLogLayer::level(&Level::TRACE), LogLevel::Debug);
        assert_eq!(IpcLogLayer::level(&Level::DEBUG), LogLevel::Debug);
        assert_eq!(IpcLogLayer::level(&Level::WARN), LogLevel::Warn);
    }
}
