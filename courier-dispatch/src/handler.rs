//! The unit of delivery work: one address set sharing a class and locale

use std::sync::Arc;

use courier_common::outgoing;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    report::DeliveryContext,
    transport::{Envelope, Origin},
    types::{Content, Locale, MessageId, RecipientClass},
};

/// Per-address delivery status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientStatus {
    Pending,
    Delivered,
    Failed(String),
}

impl RecipientStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub status: RecipientStatus,
    /// Number of transport calls made for this address
    pub attempts: u32,
}

/// Counts produced by one delivery pass over a handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerPass {
    pub delivered: usize,
    /// Addresses that failed permanently during this pass
    pub failed: Vec<String>,
    /// Addresses left pending after a temporary failure
    pub deferred: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchHandler {
    class: RecipientClass,
    locale: Locale,
    content: Arc<Content>,
    recipients: Vec<Recipient>,
}

impl DispatchHandler {
    pub fn new<I>(class: RecipientClass, locale: Locale, content: Arc<Content>, addresses: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let recipients = addresses
            .into_iter()
            .map(|address| Recipient {
                address,
                status: RecipientStatus::Pending,
                attempts: 0,
            })
            .collect();

        Self {
            class,
            locale,
            content,
            recipients,
        }
    }

    #[must_use]
    pub const fn class(&self) -> RecipientClass {
        self.class
    }

    #[must_use]
    pub const fn locale(&self) -> &Locale {
        &self.locale
    }

    #[must_use]
    pub fn content(&self) -> &Content {
        &self.content
    }

    #[must_use]
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.recipients.iter().map(|r| r.address.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.count(|status| matches!(status, RecipientStatus::Pending))
    }

    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.count(|status| matches!(status, RecipientStatus::Delivered))
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.count(|status| matches!(status, RecipientStatus::Failed(_)))
    }

    /// Every address has a terminal outcome
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.recipients.iter().all(|r| r.status.is_terminal())
    }

    fn count(&self, predicate: impl Fn(&RecipientStatus) -> bool) -> usize {
        self.recipients.iter().filter(|r| predicate(&r.status)).count()
    }

    /// Call the transport once for every pending address.
    pub(crate) async fn deliver(
        &mut self,
        message_id: MessageId,
        origin: &Origin,
        context: &DeliveryContext<'_>,
    ) -> HandlerPass {
        let mut pass = HandlerPass::default();

        for recipient in self
            .recipients
            .iter_mut()
            .filter(|r| !r.status.is_terminal())
        {
            let envelope = Envelope {
                message_id,
                origin,
                recipient: &recipient.address,
                class: self.class,
                locale: &self.locale,
                content: &self.content,
                message_id_suffix: context.message_id_suffix,
            };

            outgoing!(
                message_id = %message_id,
                recipient = %recipient.address,
                class = %self.class,
                locale = %self.locale,
                "Sending"
            );

            let result = context.transport.send(&envelope).await;
            recipient.attempts += 1;

            match result {
                Ok(()) => {
                    recipient.status = RecipientStatus::Delivered;
                    pass.delivered += 1;
                }
                Err(e) if e.is_permanent() => {
                    recipient.status = RecipientStatus::Failed(e.reason().to_string());
                    pass.failed.push(recipient.address.clone());
                }
                Err(e) => {
                    debug!(
                        message_id = %message_id,
                        recipient = %recipient.address,
                        attempts = recipient.attempts,
                        error = %e,
                        "Delivery deferred"
                    );
                    pass.deferred += 1;
                }
            }
        }

        pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(addresses: &[&str]) -> DispatchHandler {
        DispatchHandler::new(
            RecipientClass::Bcc,
            Locale::new("en"),
            Arc::new(Content::new("s", "b")),
            addresses.iter().map(ToString::to_string),
        )
    }

    #[test]
    fn test_new_handler_is_pending() {
        let handler = handler(&["a@x.com", "b@x.com"]);
        assert_eq!(handler.len(), 2);
        assert_eq!(handler.pending_count(), 2);
        assert!(!handler.is_complete());
        assert_eq!(handler.addresses().collect::<Vec<_>>(), vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn test_empty_handler_is_complete() {
        assert!(handler(&[]).is_complete());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RecipientStatus::Pending.is_terminal());
        assert!(RecipientStatus::Delivered.is_terminal());
        assert!(RecipientStatus::Failed("550".to_string()).is_terminal());
    }
}
