use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::config;
use crate::generation::store::GenerationStore;

use super::ledger::QuotaLedger;

const RESET_CONCURRENCY: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub reset: usize,
    /// Listed as due but rolled by a reservation (or deleted) before the reset ran.
    pub reset_skipped: usize,
    pub reset_failed: usize,
    pub pruned: u64,
}

/// key: quota-reset-scheduler -> monthly rollover and record retention
pub fn spawn(ledger: QuotaLedger, records: Arc<dyn GenerationStore>) {
    let interval = TokioDuration::from_secs(*config::QUOTA_RESET_SCAN_INTERVAL_SECS);
    let retention_days = *config::GENERATION_RETENTION_DAYS;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = process_tick(&ledger, records.as_ref(), now, retention_days).await {
                warn!(?err, "quota reset tick failed");
            }
        }
    });
}

/// key: quota-reset-scheduler -> tick handler
///
/// Lazy resets inside the reservation already keep counters correct; this pass makes the
/// stored values match for subscribers who have not generated since their reset date.
pub async fn process_tick(
    ledger: &QuotaLedger,
    records: &dyn GenerationStore,
    now: DateTime<Utc>,
    retention_days: i64,
) -> Result<TickSummary> {
    let due = ledger.due_for_reset(now).await?;
    let mut summary = TickSummary::default();

    let outcomes: Vec<_> = stream::iter(due)
        .map(|subscriber_id| async move {
            let outcome = ledger.reset_monthly(subscriber_id, now).await;
            (subscriber_id, outcome)
        })
        .buffer_unordered(RESET_CONCURRENCY)
        .collect()
        .await;

    for (subscriber_id, outcome) in outcomes {
        match outcome {
            Ok(Some(counter)) => {
                summary.reset += 1;
                debug!(
                    %subscriber_id,
                    next_reset = %counter.quota_reset_date,
                    "monthly quota reset"
                );
            }
            Ok(None) => {
                summary.reset_skipped += 1;
                debug!(%subscriber_id, "subscriber no longer due for reset");
            }
            Err(err) => {
                summary.reset_failed += 1;
                warn!(?err, %subscriber_id, "failed to reset monthly quota");
            }
        }
    }

    if retention_days > 0 {
        let cutoff = now - Duration::days(retention_days);
        summary.pruned = records.prune_terminal_before(cutoff).await?;
    }

    if summary.reset > 0 || summary.reset_failed > 0 || summary.pruned > 0 {
        info!(
            reset = summary.reset,
            reset_skipped = summary.reset_skipped,
            reset_failed = summary.reset_failed,
            pruned = summary.pruned,
            "quota scheduler tick finished"
        );
    }

    Ok(summary)
}
