use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tracing::{info, warn};

use crate::config::Settings;
use crate::connid::ConnIdGenerator;
use crate::pipeline::{self, shutdown_channel, spawn_shutdown_listener};
use crate::sink::{Destination, EventSink};

pub async fn run(settings: Settings) -> Result<()> {
    let Settings {
        rules,
        output,
        flush_interval,
    } = settings;

    let destination = Destination::open(output.as_deref())?;

    let mut listeners = Vec::with_capacity(rules.len());
    for rule in rules {
        let listener = pipeline::tcp::bind(&rule).await?;
        listeners.push((Arc::new(rule), listener));
    }

    let sink = EventSink::spawn(destination, flush_interval);
    let ids = Arc::new(ConnIdGenerator::new());
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let signal_handle = spawn_shutdown_listener(shutdown_tx);

    let tasks: Vec<_> = listeners
        .into_iter()
        .map(|(rule, listener)| {
            pipeline::tcp::spawn(
                listener,
                rule,
                sink.clone(),
                ids.clone(),
                shutdown_rx.clone(),
            )
        })
        .collect();

    for result in join_all(tasks).await {
        if let Err(err) = result {
            warn!(error = %err, "listener task ended abnormally");
        }
    }

    signal_handle.abort();
    let _ = signal_handle.await;

    sink.close()
        .await
        .context("failed to flush trace events during shutdown")?;
    info!("shutdown complete");
    Ok(())
}
