use crate::engine::Engine;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Periodically replays the ledger of every loaded poll and compares it with
/// the cached tally. A mismatch is repaired by the poll's actor before it
/// serves anything else; here it is only reported.
pub async fn run_auditor(engine: Arc<Engine>, every: Duration) {
    info!("Starting tally auditor, every {:?}", every);
    let mut interval = interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; actors rebuild on start anyway.
    interval.tick().await;

    loop {
        interval.tick().await;
        let reports = engine.audit_loaded().await;
        let mut repaired = 0;

        for (poll_id, report) in &reports {
            match report {
                Ok(report) if !report.consistent => {
                    repaired += 1;
                    warn!("Audit repaired tally of poll {} ({} ballots)", poll_id, report.ballots);
                }
                Ok(_) => {}
                Err(e) => error!("Audit of poll {} failed: {}", poll_id, e),
            }
        }

        info!("Audited {} poll(s), {} repaired", reports.len(), repaired);
    }
}
