use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{DispatchStore, MessageRecord};
use crate::{
    blacklist::BlacklistEntry,
    error::StoreError,
    message::Message,
    report::ReportSnapshot,
    types::{MessageId, SenderId},
};

/// In-memory store.
///
/// Intended for tests and transient deployments; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<MessageId, Message>>,
    reports: RwLock<HashMap<MessageId, ReportSnapshot>>,
    blacklist: RwLock<Vec<BlacklistEntry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    #[must_use]
    pub fn blacklist_len(&self) -> usize {
        self.blacklist.read().len()
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn append_blacklist(&self, entries: &[BlacklistEntry]) -> Result<(), StoreError> {
        self.blacklist.write().extend_from_slice(entries);
        Ok(())
    }

    async fn load_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
        Ok(self.blacklist.read().clone())
    }

    async fn prune_blacklist(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut blacklist = self.blacklist.write();
        let before = blacklist.len();
        blacklist.retain(|entry| entry.timestamp >= cutoff);
        Ok(before - blacklist.len())
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut messages = self.messages.write();
        if messages.contains_key(&message.id) {
            return Err(StoreError::AlreadyExists(message.id));
        }

        messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Message, StoreError> {
        self.messages
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::MessageNotFound(id))
    }

    async fn save_report(&self, report: &ReportSnapshot) -> Result<(), StoreError> {
        if !self.messages.read().contains_key(&report.message_id) {
            return Err(StoreError::MessageNotFound(report.message_id));
        }

        self.reports.write().insert(report.message_id, report.clone());
        Ok(())
    }

    async fn get_report(&self, id: MessageId) -> Result<ReportSnapshot, StoreError> {
        self.reports
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::MessageNotFound(id))
    }

    async fn pending_reports(&self) -> Result<Vec<ReportSnapshot>, StoreError> {
        let mut pending: Vec<_> = self
            .reports
            .read()
            .values()
            .filter(|report| !report.is_finished())
            .cloned()
            .collect();

        pending.sort_by_key(|report| report.message_id);
        Ok(pending)
    }

    async fn list_messages(&self, sender: SenderId) -> Result<Vec<MessageRecord>, StoreError> {
        let messages = self.messages.read();
        let reports = self.reports.read();

        let mut records: Vec<_> = messages
            .values()
            .filter(|message| message.sender == sender)
            .map(|message| MessageRecord {
                id: message.id,
                sender: message.sender,
                created_at: message.created_at,
                finished_at: reports.get(&message.id).and_then(|report| report.finished_at),
            })
            .collect();

        // ULIDs are lexicographically sortable by creation time
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
        self.messages
            .write()
            .remove(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        self.reports.write().remove(&id);
        Ok(())
    }
}
