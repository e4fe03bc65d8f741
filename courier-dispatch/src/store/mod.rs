//! Persistence seam for messages, delivery reports and the blacklist log

mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::memory::MemoryStore;
use crate::{
    blacklist::BlacklistEntry,
    error::StoreError,
    message::Message,
    report::ReportSnapshot,
    types::{MessageId, SenderId},
};

/// What retention needs to know about a stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender: SenderId,
    pub created_at: DateTime<Utc>,
    /// When the message's delivery report finished, if it has
    pub finished_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[async_trait]
pub trait DispatchStore: Send + Sync + Debug {
    /// Durably append blacklist entries
    async fn append_blacklist(&self, entries: &[BlacklistEntry]) -> Result<(), StoreError>;

    async fn load_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError>;

    /// Delete entries older than `cutoff` in place, leaving concurrent
    /// appends untouched. Returns how many were deleted.
    async fn prune_blacklist(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if a message with the same id is stored.
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn get_message(&self, id: MessageId) -> Result<Message, StoreError>;

    /// Create or update the report of a stored message
    async fn save_report(&self, report: &ReportSnapshot) -> Result<(), StoreError>;

    async fn get_report(&self, id: MessageId) -> Result<ReportSnapshot, StoreError>;

    /// Reports that have not finished yet
    async fn pending_reports(&self) -> Result<Vec<ReportSnapshot>, StoreError>;

    async fn list_messages(&self, sender: SenderId) -> Result<Vec<MessageRecord>, StoreError>;

    /// Delete a message together with its report
    async fn delete_message(&self, id: MessageId) -> Result<(), StoreError>;
}
