//! Dispatch orchestration

mod process;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_common::{Signal, internal};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use self::process::PassSummary;
use crate::{
    blacklist::{Blacklist, BlacklistEntry},
    config::DispatchConfig,
    error::{DispatchError, StoreError},
    groups::GroupResolver,
    message::{Message, Sender},
    report::DeliveryReport,
    resolver::{RecipientResolver, ResolverOptions},
    store::DispatchStore,
    transport::Transport,
    types::{MessageId, SenderId},
};

/// How long shutdown waits for an in-flight delivery pass
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the collaborators and drives pending reports to completion.
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatchConfig,
    resolver: RecipientResolver,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DispatchStore>,
    blacklist: Arc<Blacklist>,
    senders: DashMap<SenderId, Sender>,
    pending: DashMap<MessageId, Arc<DeliveryReport>>,
    /// Blacklist entries recorded in memory whose store append failed
    unsaved_blacklist: Mutex<Vec<BlacklistEntry>>,
}

impl Dispatcher {
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(
        config: DispatchConfig,
        groups: Arc<dyn GroupResolver>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DispatchStore>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let blacklist = Arc::new(Blacklist::new());
        let resolver = RecipientResolver::new(groups, Arc::clone(&blacklist), ResolverOptions::from(&config));

        Ok(Self {
            config,
            resolver,
            transport,
            store,
            blacklist,
            senders: DashMap::new(),
            pending: DashMap::new(),
            unsaved_blacklist: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub const fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<dyn DispatchStore> {
        &self.store
    }

    pub fn register_sender(&self, sender: Sender) {
        internal!(sender = %sender.id, name = %sender.name, policy = %sender.retention, "Registered sender");
        self.senders.insert(sender.id, sender);
    }

    #[must_use]
    pub fn sender(&self, id: SenderId) -> Option<Sender> {
        self.senders.get(&id).map(|entry| entry.value().clone())
    }

    /// Reports that still have pending addresses
    #[must_use]
    pub fn pending_reports(&self) -> Vec<Arc<DeliveryReport>> {
        let mut reports: Vec<_> = self.pending.iter().map(|entry| Arc::clone(entry.value())).collect();
        reports.sort_by_key(|report| report.message_id());
        reports
    }

    #[must_use]
    pub fn pending_report(&self, id: MessageId) -> Option<Arc<DeliveryReport>> {
        self.pending.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve a message, persist it with its new report and queue the
    /// report for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender is unknown, resolution fails, or the
    /// store rejects the message. Nothing is queued in that case.
    pub async fn dispatch(&self, message: Message) -> Result<Arc<DeliveryReport>, DispatchError> {
        let sender = self
            .sender(message.sender)
            .ok_or(DispatchError::UnknownSender(message.sender))?;

        let mut resolution = self.resolver.resolve(&message, &sender).await?;
        let blacklisted = std::mem::take(&mut resolution.blacklisted);

        self.store.insert_message(&message).await?;
        self.save_blacklist(blacklisted).await?;

        let report = Arc::new(resolution.into_report(&message, &sender));
        self.store.save_report(&report.snapshot().await).await?;

        info!(
            message_id = %message.id,
            sender = %sender.id,
            total = report.total(),
            invalid = report.invalid(),
            "Dispatched message"
        );

        if report.is_finished().await {
            self.apply_retention(&sender).await?;
        } else {
            self.pending.insert(message.id, Arc::clone(&report));
        }

        Ok(report)
    }

    /// Apply a sender's retention policy to its finished messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender is unknown or the store fails.
    pub async fn prune_sender(&self, sender: SenderId) -> Result<Vec<MessageId>, DispatchError> {
        let sender = self.sender(sender).ok_or(DispatchError::UnknownSender(sender))?;
        self.apply_retention(&sender).await
    }

    async fn apply_retention(&self, sender: &Sender) -> Result<Vec<MessageId>, DispatchError> {
        Ok(sender
            .retention
            .prune(self.store.as_ref(), sender.id, Utc::now())
            .await?)
    }

    /// Drop blacklist entries older than `cutoff`, in memory and in the store.
    ///
    /// Returns the number removed from memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot prune its log.
    pub async fn prune_blacklist(&self, cutoff: DateTime<Utc>) -> Result<usize, DispatchError> {
        let removed = self.blacklist.prune_before(cutoff);
        self.unsaved_blacklist.lock().retain(|entry| entry.timestamp >= cutoff);

        let stored = self.store.prune_blacklist(cutoff).await?;
        if removed > 0 || stored > 0 {
            info!(removed, stored, %cutoff, "Pruned blacklist");
        }
        Ok(removed)
    }

    /// Blacklist entries still waiting to reach the store
    #[must_use]
    pub fn unsaved_blacklist(&self) -> usize {
        self.unsaved_blacklist.lock().len()
    }

    /// Append `entries`, plus anything left over from an earlier failed
    /// write, to the store's blacklist log. On failure the whole batch stays
    /// buffered for the next write.
    async fn save_blacklist(&self, entries: Vec<BlacklistEntry>) -> Result<(), StoreError> {
        let batch = {
            let mut unsaved = self.unsaved_blacklist.lock();
            unsaved.extend(entries);
            std::mem::take(&mut *unsaved)
        };

        if batch.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.store.append_blacklist(&batch).await {
            warn!(entries = batch.len(), error = %e, "Blacklist entries kept for a later write");
            let mut unsaved = self.unsaved_blacklist.lock();
            let newer = std::mem::replace(&mut *unsaved, batch);
            unsaved.extend(newer);
            return Err(e);
        }

        Ok(())
    }

    /// Reload the blacklist and unfinished reports from the store.
    ///
    /// Returns the number of reports queued again.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn restore(&self) -> Result<usize, DispatchError> {
        let entries = self.store.load_blacklist().await?;
        let blacklisted = entries.len();
        self.blacklist.restore(entries);

        let mut restored = 0;
        for snapshot in self.store.pending_reports().await? {
            let id = snapshot.message_id;
            if self.pending.contains_key(&id) {
                continue;
            }
            self.pending.insert(id, Arc::new(DeliveryReport::from_snapshot(snapshot)));
            restored += 1;
        }

        info!(blacklisted, restored, "Restored dispatch state");
        Ok(restored)
    }

    /// Run delivery passes until a shutdown signal arrives.
    ///
    /// Each tick of `process_interval_secs` runs [`Self::process_pending`]
    /// and, when configured, prunes the blacklist. A tick is skipped while
    /// the previous pass is still running. On shutdown the in-flight pass is
    /// given a bounded amount of time to finish; reports it leaves pending
    /// stay persisted and are picked up again by [`Self::restore`].
    ///
    /// # Errors
    ///
    /// Returns an error if the initial restore fails.
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DispatchError> {
        internal!("Dispatcher starting");
        self.restore().await?;

        let mut process_timer = tokio::time::interval(self.config.process_interval());
        // Skip the first tick to avoid immediate execution
        process_timer.tick().await;

        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = process_timer.tick() => {
                    if in_flight.as_ref().is_some_and(|pass| !pass.is_finished()) {
                        debug!("Previous delivery pass still running, skipping tick");
                        continue;
                    }

                    let dispatcher = Arc::clone(&self);
                    in_flight = Some(tokio::spawn(async move {
                        dispatcher.run_pass().await;
                    }));
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatcher received shutdown signal");
                        }
                        Err(e) => {
                            error!("Dispatcher shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        if let Some(pass) = in_flight {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, pass).await {
                Ok(Ok(())) => internal!("In-flight delivery pass completed"),
                Ok(Err(e)) => error!("Delivery pass task failed: {e}"),
                Err(_) => warn!(
                    pending = self.pending.len(),
                    "Shutdown timeout exceeded, pending reports will be retried on restart"
                ),
            }
        }

        internal!("Dispatcher shutdown complete");
        Ok(())
    }

    async fn run_pass(self: &Arc<Self>) {
        let summary = self.process_pending().await;
        if summary.attempted > 0 {
            debug!(
                attempted = summary.attempted,
                finished = summary.finished,
                delivered = summary.delivered,
                failed = summary.failed,
                "Processed pending reports"
            );
        }

        if let Some(retention) = self.config.blacklist_retention()
            && let Err(e) = self.prune_blacklist(Utc::now() - retention).await
        {
            error!("Error pruning blacklist: {e}");
        }
    }
}
