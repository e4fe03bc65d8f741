//! Delivery passes over pending reports

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info};

use super::Dispatcher;
use crate::{
    error::DispatchError,
    report::{AttemptOutcome, DeliveryContext, DeliveryReport},
};

/// Totals over one [`Dispatcher::process_pending`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub attempted: usize,
    pub finished: usize,
    pub delivered: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Reports whose bookkeeping hit a store error
    pub errors: usize,
}

impl PassSummary {
    fn record(&mut self, result: &Result<AttemptOutcome, DispatchError>) {
        self.attempted += 1;
        match result {
            Ok(outcome) => {
                self.delivered += outcome.delivered;
                self.failed += outcome.failed.len();
                self.deferred += outcome.deferred;
                if outcome.finished {
                    self.finished += 1;
                }
            }
            Err(_) => self.errors += 1,
        }
    }
}

impl Dispatcher {
    /// Attempt delivery on every pending report.
    ///
    /// At most `max_concurrent_reports` reports are in flight at once. A
    /// failure on one report is logged and never aborts the others.
    pub async fn process_pending(self: &Arc<Self>) -> PassSummary {
        let reports = self.pending_reports();
        let mut summary = PassSummary::default();

        if reports.is_empty() {
            return summary;
        }

        info!(
            pending_count = reports.len(),
            max_concurrent = self.config.max_concurrent_reports,
            "Processing pending reports with parallel workers"
        );

        let mut join_set: JoinSet<Result<AttemptOutcome, DispatchError>> = JoinSet::new();
        let mut pending_iter = reports.into_iter();

        // Spawn initial batch of tasks (up to max_concurrent_reports)
        for report in pending_iter.by_ref().take(self.config.max_concurrent_reports) {
            let dispatcher = Arc::clone(self);
            join_set.spawn(async move { dispatcher.process_report(report).await });
        }

        // As tasks complete, spawn new ones for remaining reports
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => summary.record(&result),
                Err(e) => {
                    error!("Delivery task failed: {e}");
                    summary.attempted += 1;
                    summary.errors += 1;
                }
            }

            if let Some(report) = pending_iter.next() {
                let dispatcher = Arc::clone(self);
                join_set.spawn(async move { dispatcher.process_report(report).await });
            }
        }

        summary
    }

    /// One delivery pass over a single report, followed by its bookkeeping.
    async fn process_report(&self, report: Arc<DeliveryReport>) -> Result<AttemptOutcome, DispatchError> {
        let context = DeliveryContext {
            transport: self.transport.as_ref(),
            blacklist: &self.blacklist,
            message_id_suffix: &self.config.message_id_suffix,
        };

        let outcome = report.attempt_delivery(&context).await;
        let message_id = report.message_id();

        // Stays queued until its final snapshot is stored
        if let Err(e) = self.persist(&report, &outcome).await {
            error!(message_id = %message_id, error = %e, "Failed to persist delivery progress");
            return Err(e);
        }

        if outcome.finished {
            self.pending.remove(&message_id);
        }

        if outcome.finished
            && let Some(sender) = self.sender(report.sender())
            && let Err(e) = self.apply_retention(&sender).await
        {
            error!(sender = %sender.id, error = %e, "Failed to apply retention policy");
            return Err(e);
        }

        Ok(outcome)
    }

    async fn persist(&self, report: &DeliveryReport, outcome: &AttemptOutcome) -> Result<(), DispatchError> {
        self.save_blacklist(outcome.failed.clone()).await?;
        self.store.save_report(&report.snapshot().await).await?;
        Ok(())
    }
}
