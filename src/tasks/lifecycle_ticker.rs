use crate::engine::Engine;
use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Periodically nudges every loaded poll to re-derive its status, so viewers
/// see PENDING -> ACTIVE -> COMPLETED without having to ask.
///
/// Status correctness never depends on this loop; it only drives push updates.
pub async fn run_lifecycle_ticker(engine: Arc<Engine>, every: Duration) {
    info!("Starting lifecycle ticker, every {:?}", every);
    let mut interval = interval(every);

    loop {
        interval.tick().await; // Wait for the next interval tick
        let reached = engine.tick();
        debug!("Lifecycle tick at {} reached {} poll(s)", Utc::now().to_rfc3339(), reached);
    }
}
