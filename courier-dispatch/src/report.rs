//! Delivery report: the aggregate state machine over a message's handlers
//!
//! A report is `Pending` while it holds active handlers and `Finished` once
//! the last one completes. Every mutation happens under the report's own
//! lock, so concurrent delivery passes on the same report are serialized
//! while different reports proceed independently.

use chrono::{DateTime, Utc};
use courier_common::internal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{
    blacklist::{Blacklist, BlacklistEntry},
    handler::DispatchHandler,
    transport::{Origin, Transport},
    types::{MessageId, SenderId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportState {
    Pending,
    Finished,
}

/// Serializable view of a report, as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSnapshot {
    pub message_id: MessageId,
    pub sender: SenderId,
    pub origin: Origin,
    pub total: usize,
    pub delivered: usize,
    pub failed: usize,
    pub invalid: usize,
    pub finished_at: Option<DateTime<Utc>>,
    /// Handlers that still have pending addresses
    pub handlers: Vec<DispatchHandler>,
}

impl ReportSnapshot {
    #[must_use]
    pub const fn state(&self) -> ReportState {
        if self.finished_at.is_some() {
            ReportState::Finished
        } else {
            ReportState::Pending
        }
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Addresses without a terminal outcome
    #[must_use]
    pub fn pending(&self) -> usize {
        self.handlers.iter().map(DispatchHandler::pending_count).sum()
    }
}

/// Collaborators of a delivery pass
#[derive(Debug, Clone, Copy)]
pub struct DeliveryContext<'a> {
    pub transport: &'a dyn Transport,
    pub blacklist: &'a Blacklist,
    pub message_id_suffix: &'a str,
}

/// What a single [`DeliveryReport::attempt_delivery`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub delivered: usize,
    pub deferred: usize,
    /// Blacklist entries appended for permanent failures during this pass
    pub failed: Vec<BlacklistEntry>,
    pub handlers_completed: usize,
    pub finished: bool,
}

#[derive(Debug)]
struct Progress {
    handlers: Vec<DispatchHandler>,
    delivered: usize,
    failed: usize,
    finished_at: Option<DateTime<Utc>>,
}

impl Progress {
    fn finish_if_done(&mut self, message_id: MessageId, total: usize, invalid: usize) -> bool {
        if self.finished_at.is_some() {
            return true;
        }
        if !self.handlers.is_empty() {
            return false;
        }

        let finished_at = Utc::now();
        self.finished_at = Some(finished_at);

        let accounted = self.delivered + self.failed + invalid;
        if accounted != total {
            error!(
                message_id = %message_id,
                total,
                delivered = self.delivered,
                failed = self.failed,
                invalid,
                "Delivery report counters do not add up"
            );
        }

        info!(
            message_id = %message_id,
            total,
            delivered = self.delivered,
            failed = self.failed,
            invalid,
            %finished_at,
            "Delivery report finished"
        );

        true
    }
}

#[derive(Debug)]
pub struct DeliveryReport {
    message_id: MessageId,
    sender: SenderId,
    origin: Origin,
    total: usize,
    invalid: usize,
    progress: Mutex<Progress>,
}

impl DeliveryReport {
    /// Create a report over freshly resolved handlers.
    ///
    /// `total` is the number of valid addresses plus `invalid`. A report
    /// without handlers is finished immediately.
    #[must_use]
    pub fn new(
        message_id: MessageId,
        sender: SenderId,
        origin: Origin,
        handlers: Vec<DispatchHandler>,
        invalid: usize,
    ) -> Self {
        let handlers: Vec<_> = handlers.into_iter().filter(|h| !h.is_empty()).collect();
        let valid: usize = handlers.iter().map(DispatchHandler::len).sum();

        let total = valid + invalid;

        let mut progress = Progress {
            handlers,
            delivered: 0,
            failed: 0,
            finished_at: None,
        };
        progress.finish_if_done(message_id, total, invalid);

        internal!(
            message_id = %message_id,
            total,
            invalid,
            handlers = progress.handlers.len(),
            "Created delivery report"
        );

        Self {
            message_id,
            sender,
            origin,
            total,
            invalid,
            progress: Mutex::new(progress),
        }
    }

    /// Rebuild a report from its persisted snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: ReportSnapshot) -> Self {
        Self {
            message_id: snapshot.message_id,
            sender: snapshot.sender,
            origin: snapshot.origin,
            total: snapshot.total,
            invalid: snapshot.invalid,
            progress: Mutex::new(Progress {
                handlers: snapshot.handlers,
                delivered: snapshot.delivered,
                failed: snapshot.failed,
                finished_at: snapshot.finished_at,
            }),
        }
    }

    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.message_id
    }

    #[must_use]
    pub const fn sender(&self) -> SenderId {
        self.sender
    }

    #[must_use]
    pub const fn origin(&self) -> &Origin {
        &self.origin
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub const fn invalid(&self) -> usize {
        self.invalid
    }

    pub async fn is_finished(&self) -> bool {
        self.progress.lock().await.finished_at.is_some()
    }

    pub async fn state(&self) -> ReportState {
        if self.is_finished().await {
            ReportState::Finished
        } else {
            ReportState::Pending
        }
    }

    pub async fn snapshot(&self) -> ReportSnapshot {
        let progress = self.progress.lock().await;
        ReportSnapshot {
            message_id: self.message_id,
            sender: self.sender,
            origin: self.origin.clone(),
            total: self.total,
            delivered: progress.delivered,
            failed: progress.failed,
            invalid: self.invalid,
            finished_at: progress.finished_at,
            handlers: progress.handlers.clone(),
        }
    }

    /// Run one delivery pass over every active handler.
    ///
    /// Completed handlers are removed; the report finalizes when none remain.
    /// Calling this on a finished report does nothing.
    pub async fn attempt_delivery(&self, context: &DeliveryContext<'_>) -> AttemptOutcome {
        let mut guard = self.progress.lock().await;
        let progress = &mut *guard;
        let mut outcome = AttemptOutcome::default();

        if progress.finished_at.is_some() {
            outcome.finished = true;
            return outcome;
        }

        for handler in &mut progress.handlers {
            let pass = handler
                .deliver(self.message_id, &self.origin, context)
                .await;

            progress.delivered += pass.delivered;
            progress.failed += pass.failed.len();
            outcome.delivered += pass.delivered;
            outcome.deferred += pass.deferred;
            outcome
                .failed
                .extend(pass.failed.iter().map(|address| context.blacklist.add_failed(address)));

            if handler.is_complete() {
                debug!(
                    message_id = %self.message_id,
                    class = %handler.class(),
                    locale = %handler.locale(),
                    delivered = handler.delivered_count(),
                    failed = handler.failed_count(),
                    "Handler complete"
                );
            }
        }

        let before = progress.handlers.len();
        progress.handlers.retain(|handler| !handler.is_complete());
        outcome.handlers_completed = before - progress.handlers.len();
        outcome.finished = progress.finish_if_done(self.message_id, self.total, self.invalid);

        outcome
    }

    /// Finalize the report if it has no active handlers.
    ///
    /// Returns whether the report is finished. Finalizing twice leaves the
    /// first completion time in place.
    pub async fn finalize(&self) -> bool {
        self.progress
            .lock()
            .await
            .finish_if_done(self.message_id, self.total, self.invalid)
    }
}
