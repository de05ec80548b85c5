use anyhow::Context as _;
use tokio::signal;
use tracing::{info, warn};
use weir::{
    control::server::ControlServer,
    metrics::{registry, server::start_metrics_server},
    runtime::{context::Context, shutdown},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = Context::new().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(ctx.conf.log_level)
        .init();

    registry::init_registry().context("failed to initialize metrics registry")?;

    info!(
        event.name = "weir.starting",
        adapters = ctx.conf.adapters.len(),
        ring.capacity = ctx.conf.ring_capacity,
        "weir starting"
    );

    // Attach and start every configured adapter. A failure on one adapter
    // does not keep the others from coming up.
    for adapter in &ctx.conf.adapters {
        match ctx.pipeline.attach(adapter) {
            Ok(id) => {
                if let Err(e) = ctx.pipeline.restart(id) {
                    warn!(
                        event.name = "weir.restart_failed",
                        adapter = adapter.as_str(),
                        error.message = %e,
                        "instance attached but not started"
                    );
                }
            }
            Err(e) => {
                warn!(
                    event.name = "weir.attach_failed",
                    adapter = adapter.as_str(),
                    error.message = %e,
                    "failed to attach adapter"
                );
            }
        }
    }

    let mut tasks = Vec::new();

    if ctx.conf.metrics.enabled {
        let options = ctx.conf.metrics.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = start_metrics_server(options).await {
                warn!(
                    event.name = "weir.metrics_server_failed",
                    error.message = %e,
                    "metrics server exited"
                );
            }
        }));
    }

    let control_server = ControlServer::bind(&ctx.conf.control_socket, ctx.control.clone())
        .context("failed to bind control entry point")?;
    tasks.push(tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            warn!(
                event.name = "weir.control_server_failed",
                error.message = %e,
                "control server exited"
            );
        }
    }));

    wait_for_signal().await;
    info!(event.name = "weir.stopping", "shutdown signal received");

    // Cancel any suspended control read first so the manager is not left
    // hanging on a ring that will never fill again.
    ctx.control.shutdown();
    shutdown::drain_and_detach(&ctx.pipeline, ctx.conf.shutdown_timeout).await;

    for task in tasks {
        task.abort();
    }

    info!(event.name = "weir.stopped", "weir stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(
                    event.name = "weir.sigterm_unavailable",
                    error.message = %e,
                    "SIGTERM handler unavailable; relying on ctrl-c only"
                );
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
