use std::{sync::Arc, time::Duration};

use chrono::Utc;
use metrics::{counter, histogram};
use shared::{
    config::server::ReconciliationConfig,
    models::{ReadReceipt, ReconciliationSummary},
};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::{CacheError, SeenByTracker},
    store::{ReceiptStore, StoreError},
};

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum KeyOutcome {
    Drained { inserted: u64, deleted: bool },
    Discarded,
}

/// Periodically moves seen-by sets into durable read receipts.
#[derive(Clone)]
pub struct ReconciliationWorker {
    seen: SeenByTracker,
    receipts: Arc<dyn ReceiptStore>,
    config: ReconciliationConfig,
}

impl std::fmt::Debug for ReconciliationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReconciliationWorker {
    pub fn new(
        seen: SeenByTracker,
        receipts: Arc<dyn ReceiptStore>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            seen,
            receipts,
            config,
        }
    }

    /// Runs one full pass over every seen-by key.
    ///
    /// Failures on an individual key are counted in `key_errors` and leave that key untouched
    /// for the next pass. Cancellation is honored between keys.
    ///
    /// # Errors
    /// Returns [`ReconciliationError::Cache`] when the key scan itself fails.
    #[instrument(name = "reconciliation.run_once", skip_all, err)]
    pub async fn run_once(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<ReconciliationSummary, ReconciliationError> {
        let started = Instant::now();
        let mut summary = ReconciliationSummary::default();
        let mut cursor = 0;

        'scan: loop {
            let (next, keys) = self
                .seen
                .scan_keys(cursor, self.config.scan_batch.max(1))
                .await?;

            for key in keys {
                if shutdown.is_cancelled() {
                    info!("reconciliation pass cancelled");
                    break 'scan;
                }
                summary.keys_scanned += 1;
                match self.reconcile_key(&key).await {
                    Ok(KeyOutcome::Drained { inserted, deleted }) => {
                        summary.receipts_inserted += inserted;
                        if deleted {
                            summary.keys_deleted += 1;
                        }
                    }
                    Ok(KeyOutcome::Discarded) => summary.keys_deleted += 1,
                    Err(err) => {
                        summary.key_errors += 1;
                        counter!("classchat_reconciliation_key_errors_total").increment(1);
                        warn!(%key, error = %err, "failed to reconcile seen-by key");
                    }
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        counter!("classchat_reconciliation_receipts_total").increment(summary.receipts_inserted);
        histogram!("classchat_reconciliation_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(
            keys_scanned = summary.keys_scanned,
            receipts_inserted = summary.receipts_inserted,
            keys_deleted = summary.keys_deleted,
            key_errors = summary.key_errors,
            "reconciliation pass finished"
        );
        Ok(summary)
    }

    async fn reconcile_key(&self, key: &str) -> Result<KeyOutcome, ReconciliationError> {
        let members = self.seen.members(key).await?;
        if members.is_empty() {
            self.seen.delete_key(key).await?;
            return Ok(KeyOutcome::Discarded);
        }

        let Some(parsed) = self.seen.parse_key(key) else {
            warn!(%key, "unparseable seen-by key; discarding");
            self.seen.delete_key(key).await?;
            return Ok(KeyOutcome::Discarded);
        };

        let existing = self.receipts.existing(parsed.message_id, &members).await?;
        let read_at = Utc::now();
        let staged: Vec<ReadReceipt> = members
            .iter()
            .filter(|user| !existing.contains(user))
            .map(|&user_id| ReadReceipt {
                message_id: parsed.message_id,
                user_id,
                target_id: parsed.target_id,
                group_type: parsed.group_type,
                read_at,
            })
            .collect();

        let inserted = if staged.is_empty() {
            0
        } else {
            self.receipts.insert_batch(&staged).await?
        };

        self.seen.remove_members(key, &members).await?;
        let deleted = if self.seen.remaining(key).await? == 0 {
            self.seen.delete_key(key).await?;
            true
        } else {
            false
        };
        debug!(%key, staged = staged.len(), inserted, deleted, "seen-by key reconciled");

        Ok(KeyOutcome::Drained { inserted, deleted })
    }

    /// Runs passes on the configured interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "reconciliation worker started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once(&shutdown).await {
                        counter!("classchat_reconciliation_failures_total").increment(1);
                        warn!(error = %err, "reconciliation pass failed");
                    }
                }
            }
        }
        info!("reconciliation worker stopped");
    }
}
