//! Demo worker: example handlers over stdio.
//!
//! Drive it from a shell:
//!
//! ```text
//! printf '{"id":"1","method":"echo","params":{"x":1}}\n' | cargo run --bin echo_worker
//! ```
//!
//! Logs go to stderr and (via the IPC log layer) to the parent as `log`
//! events; stdout carries protocol envelopes only.

use std::time::Duration;

use serde_json::{Value, json};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use linewire::{HandlerRegistry, ProgressUpdate, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut registry = HandlerRegistry::new();

    registry.register_fn("ping", |_ctx| async { Ok(json!("pong")) });

    registry.register_fn("echo", |ctx| async move { Ok(ctx.params().clone()) });

    registry.register_fn("count", |ctx| async move {
        let total = ctx.params().get("total").and_then(Value::as_u64).unwrap_or(3);
        for current in 1..=total {
            let update = ProgressUpdate::new(
                current as f64 / total as f64,
                current as f64,
                total as f64,
                "items",
            )
            .with_stage("count");
            ctx.progress(serde_json::to_value(update)?)?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(json!({ "counted": total }))
    });

    let config = WorkerConfig::default();
    let shutdown = config.shutdown.clone();
    registry.register_fn("shutdown", move |_ctx| {
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancel();
            Ok(json!({ "stopping": true }))
        }
    });

    let worker = Worker::with_config(registry, config);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(worker.log_layer())
        .init();

    // Ctrl-C drains like a normal shutdown instead of killing the process.
    let interrupt = worker.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    worker.run_stdio().await?;
    Ok(())
}
