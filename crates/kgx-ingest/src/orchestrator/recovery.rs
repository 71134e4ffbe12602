//! Reconciliation of records left `InProgress` by an interrupted process

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::Orchestrator;

impl Orchestrator {
    /// Fail every `InProgress` record older than the configured grace period
    ///
    /// Does nothing unless a grace period is configured. Returns the number of
    /// stage records that were changed.
    pub async fn reconcile_interrupted(&mut self, now: DateTime<Utc>) -> usize {
        let Some(grace) = self.settings.in_progress_grace else {
            return 0;
        };

        let mut reconciled = 0;
        for source_id in &self.active {
            let Some(metadata) = self.metadata.get_mut(source_id) else {
                continue;
            };

            let stages = metadata.fail_interrupted(now, grace);
            if stages.is_empty() {
                continue;
            }

            for stage in &stages {
                warn!(source_id = %source_id, %stage, "Marked interrupted stage as failed");
            }
            reconciled += stages.len();

            if let Err(e) = self.store.save(metadata).await {
                warn!(source_id = %source_id, error = %e, "Could not persist reconciled metadata");
            }
        }

        if reconciled > 0 {
            info!(reconciled, "Reconciled interrupted stages");
        }
        reconciled
    }
}
