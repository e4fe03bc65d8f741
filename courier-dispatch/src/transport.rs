//! Transport seam: the component that actually puts bytes on the wire

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::SendError,
    types::{Content, Locale, MessageId, RecipientClass},
};

/// Who a message is from, as presented to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub reply_to: Vec<String>,
}

/// One addressed payload.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub message_id: MessageId,
    pub origin: &'a Origin,
    pub recipient: &'a str,
    pub class: RecipientClass,
    pub locale: &'a Locale,
    pub content: &'a Content,
    /// Right-hand side of the generated `Message-ID`
    pub message_id_suffix: &'a str,
}

impl Envelope<'_> {
    /// `Message-ID` header value, shared by every recipient of one class
    #[must_use]
    pub fn message_id_header(&self) -> String {
        format!("<{}.{}@{}>", self.message_id, self.class, self.message_id_suffix)
    }
}

#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Transmit one addressed payload.
    ///
    /// # Errors
    ///
    /// [`SendError::Permanent`] marks the address as failed for good;
    /// [`SendError::Temporary`] leaves it pending for the next pass.
    async fn send(&self, envelope: &Envelope<'_>) -> Result<(), SendError>;
}
