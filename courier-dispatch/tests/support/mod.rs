//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_dispatch::{
    BlacklistEntry, DispatchConfig, DispatchStore, Dispatcher, Envelope, GroupExpression,
    GroupResolver, Locale, MemoryStore, Member, Message, MessageId, MessageRecord, RecipientClass,
    ReportSnapshot, ResolutionError, SendError, SenderId, StaticDirectory, StoreError, Transport,
};
use parking_lot::Mutex;

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub recipient: String,
    pub class: RecipientClass,
    pub locale: Locale,
    pub subject: String,
    pub message_id_header: String,
}

/// Transport that records every call and fails configured addresses.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    permanent: Mutex<HashSet<String>>,
    /// Address to the number of temporary failures still to return
    temporary: Mutex<HashMap<String, usize>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_permanently(&self, address: &str) {
        self.permanent.lock().insert(address.to_string());
    }

    pub fn fail_temporarily(&self, address: &str, times: usize) {
        self.temporary.lock().insert(address.to_string(), times);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Successful deliveries to `address`
    pub fn delivered_to(&self, address: &str) -> usize {
        self.sent.lock().iter().filter(|s| s.recipient == address).count()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, envelope: &Envelope<'_>) -> Result<(), SendError> {
        if self.permanent.lock().contains(envelope.recipient) {
            return Err(SendError::Permanent("550 mailbox unavailable".to_string()));
        }

        if let Some(remaining) = self.temporary.lock().get_mut(envelope.recipient)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(SendError::Temporary("421 try again later".to_string()));
        }

        self.sent.lock().push(Sent {
            recipient: envelope.recipient.to_string(),
            class: envelope.class,
            locale: envelope.locale.clone(),
            subject: envelope.content.subject.clone(),
            message_id_header: envelope.message_id_header(),
        });
        Ok(())
    }
}

/// A dispatcher wired to in-memory collaborators
pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub directory: Arc<StaticDirectory>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new(directory: StaticDirectory) -> Self {
        Self::with_config(directory, DispatchConfig::default())
    }

    pub fn with_config(directory: StaticDirectory, config: DispatchConfig) -> Self {
        let directory = Arc::new(directory);
        let transport = RecordingTransport::new();
        let store = Arc::new(MemoryStore::new());

        let dispatcher = Dispatcher::new(
            config,
            Arc::clone(&directory) as Arc<dyn GroupResolver>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&store) as Arc<dyn DispatchStore>,
        )
        .unwrap();

        Self {
            dispatcher: Arc::new(dispatcher),
            directory,
            transport,
            store,
        }
    }
}

/// Store whose writes fail while `fail_writes` is set
#[derive(Debug, Default)]
pub struct UnreliableStore {
    pub inner: MemoryStore,
    failing: AtomicBool,
}

impl UnreliableStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DispatchStore for UnreliableStore {
    async fn append_blacklist(&self, entries: &[BlacklistEntry]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.append_blacklist(entries).await
    }

    async fn load_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
        self.inner.load_blacklist().await
    }

    async fn prune_blacklist(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.prune_blacklist(cutoff).await
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.check()?;
        self.inner.insert_message(message).await
    }

    async fn get_message(&self, id: MessageId) -> Result<Message, StoreError> {
        self.inner.get_message(id).await
    }

    async fn save_report(&self, report: &ReportSnapshot) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_report(report).await
    }

    async fn get_report(&self, id: MessageId) -> Result<ReportSnapshot, StoreError> {
        self.inner.get_report(id).await
    }

    async fn pending_reports(&self) -> Result<Vec<ReportSnapshot>, StoreError> {
        self.inner.pending_reports().await
    }

    async fn list_messages(&self, sender: SenderId) -> Result<Vec<MessageRecord>, StoreError> {
        self.inner.list_messages(sender).await
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete_message(id).await
    }
}

/// Directory whose expansions never complete
#[derive(Debug)]
pub struct StalledDirectory;

#[async_trait]
impl GroupResolver for StalledDirectory {
    async fn expand(&self, _group: &GroupExpression) -> Result<Vec<Member>, ResolutionError> {
        std::future::pending().await
    }

    fn is_opted_in(&self, _member: &Member) -> bool {
        true
    }
}

/// A dispatcher over arbitrary collaborators
pub fn dispatcher(
    config: DispatchConfig,
    groups: Arc<dyn GroupResolver>,
    transport: &Arc<RecordingTransport>,
    store: Arc<dyn DispatchStore>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(config, groups, Arc::clone(transport) as Arc<dyn Transport>, store).unwrap())
}
