//! Post-restart replay of unprocessed inputs.
//!
//! `play` answers as soon as the input is durably logged; output
//! production happens afterwards. A crash or sink failure in that window
//! leaves an input with no corresponding output. Replay closes exactly
//! that gap: scan the inputs logged within the configured window, skip
//! those whose projected outputs exist, and re-drive output production for
//! the rest. Re-driving is idempotent — already-logged outputs conflict
//! and are tolerated — so replaying twice cannot double-produce.
//!
//! Cluster election is the deployment's concern: run replay only on the
//! process elected to do so, before serving traffic.

use std::time::Duration;

use tracing::{info, warn};

use tally_store::{AllDocs, RangeOptions};
use tally_types::{turi, TimeProvider};

use crate::mapper::projected_output_ids;
use crate::{DataflowError, Service};

/// Outcome counts of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Inputs found in the replay window.
    pub scanned: usize,
    /// Inputs whose outputs already existed.
    pub skipped: usize,
    /// Inputs whose outputs were regenerated.
    pub replayed: usize,
    /// Inputs whose regeneration failed; the next replay retries them.
    pub failed: usize,
}

/// Replay the service's inputs logged within `window`.
pub async fn replay(
    service: &dyn Service,
    window: Duration,
    clock: &dyn TimeProvider,
) -> Result<ReplayStats, DataflowError> {
    let mut stats = ReplayStats::default();
    if window.is_zero() {
        return Ok(stats);
    }

    let now = clock.now();
    let from = (now - window.as_millis() as i64).max(0);
    let rows = service
        .input_db()
        .all_docs(AllDocs::Range(RangeOptions::new(
            turi(&from.to_string()),
            format!("{}/ZZZ", turi(&now.to_string())),
        )))
        .await?;

    for row in rows {
        let Some(input) = row.doc else { continue };
        stats.scanned += 1;

        let body = match input.undbify() {
            serde_json::Value::Object(m) => m,
            _ => continue,
        };
        let Some(itime) = input.time().map(str::to_owned) else {
            continue;
        };

        let oids = projected_output_ids(service.config(), &body, &itime);
        let mut missing = false;
        for oid in &oids {
            if service.output_db().get(oid).await?.is_none() {
                missing = true;
                break;
            }
        }
        if !missing {
            stats.skipped += 1;
            continue;
        }

        match service.replay_input(input.clone()).await {
            Ok(()) => stats.replayed += 1,
            Err(err) => {
                warn!(input = %input.id, %err, "replay failed");
                stats.failed += 1;
            }
        }
    }

    info!(
        scanned = stats.scanned,
        skipped = stats.skipped,
        replayed = stats.replayed,
        failed = stats.failed,
        "replay pass complete"
    );
    Ok(stats)
}
