//! Stream command - subscribe and print events until Ctrl+C

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use datasift_client::{DataSiftClient, StreamSet};
use tokio::sync::broadcast::error::RecvError;

use crate::output::OutputContext;

/// Subscribe to `hashes` and print events until interrupted
pub async fn stream(client: &DataSiftClient, hashes: &[String], ctx: &OutputContext) -> Result<()> {
    let mut events = client.events();

    ctx.info(&format!(
        "Subscribing to {} stream(s) as {}...",
        hashes.len(),
        client.username()
    ));
    let streams: StreamSet = hashes.iter().cloned().collect();
    let outcomes = client.subscribe(streams).await?;
    ctx.print_outcomes(&outcomes);

    if !outcomes.iter().any(|o| o.is_ok()) {
        client.shutdown().await?;
        bail!("No stream could be subscribed");
    }

    ctx.info("Press Ctrl+C to stop");

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => ctx.print_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        ctx.warn(&format!("Output fell behind, skipped {skipped} events"));
                    }
                    Err(RecvError::Closed) => {
                        ctx.info("Stream ended");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                // Check running flag periodically
            }
        }
    }

    ctx.info("\nShutting down...");
    client.shutdown().await?;
    ctx.success("Disconnected");

    Ok(())
}
