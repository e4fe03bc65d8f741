//! Messages and senders as seen by the dispatch engine

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use courier_common::address;
use serde::{Deserialize, Serialize};

use crate::{
    retention::RetentionPolicy,
    types::{Content, GroupExpression, Locale, Member, MessageId, SenderId},
};

/// A configured sender.
#[derive(Debug, Clone)]
pub struct Sender {
    pub id: SenderId,
    pub name: String,
    pub address: String,
    pub reply_to: Vec<String>,
    /// Members must be on `opted_in` to receive anything from this sender
    pub opt_in_required: bool,
    /// Member ids that explicitly opted in to this sender
    pub opted_in: HashSet<String>,
    /// Treat every recipient as Bcc
    pub recipients_as_bccs: bool,
    pub retention: Arc<RetentionPolicy>,
}

impl Sender {
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: SenderId::generate(),
            name: name.into(),
            address: address.into(),
            reply_to: Vec::new(),
            opt_in_required: false,
            opted_in: HashSet::new(),
            recipients_as_bccs: false,
            retention: RetentionPolicy::keep_all(),
        }
    }

    #[must_use]
    pub fn requiring_opt_in(mut self) -> Self {
        self.opt_in_required = true;
        self
    }

    #[must_use]
    pub fn with_opted_in<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opted_in.extend(members.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn bcc_only(mut self) -> Self {
        self.recipients_as_bccs = true;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, policy: Arc<RetentionPolicy>) -> Self {
        self.retention = policy;
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to.push(reply_to.into());
        self
    }

    /// Whether `member` may receive mail from this sender
    #[must_use]
    pub fn allows(&self, member: &Member) -> bool {
        !self.opt_in_required || self.opted_in.contains(&member.id)
    }
}

/// An outbound message. Immutable once handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: SenderId,
    pub created_at: DateTime<Utc>,
    pub to_groups: BTreeSet<GroupExpression>,
    pub cc_groups: BTreeSet<GroupExpression>,
    pub bcc_groups: BTreeSet<GroupExpression>,
    pub single_tos: BTreeSet<String>,
    pub single_bccs: BTreeSet<String>,
    pub reply_to: BTreeSet<String>,
    pub preferred_locale: Locale,
    pub content: BTreeMap<Locale, Content>,
}

impl Message {
    #[must_use]
    pub fn builder(sender: &Sender) -> MessageBuilder {
        MessageBuilder::new(sender)
    }

    /// Locales with content for this message
    pub fn content_locales(&self) -> impl Iterator<Item = &Locale> {
        self.content.keys()
    }

    #[must_use]
    pub fn has_content_for(&self, locale: &Locale) -> bool {
        self.content.contains_key(locale)
    }

    /// Content for `locale`, falling back to the preferred locale and then to
    /// whatever locale exists.
    #[must_use]
    pub fn content_for(&self, locale: &Locale) -> Option<&Content> {
        self.content
            .get(locale)
            .or_else(|| self.content.get(&self.preferred_locale))
            .or_else(|| self.content.values().next())
    }
}

/// Builder for [`Message`].
///
/// Explicit addresses that are not valid e-mail addresses are dropped here.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    sender: SenderId,
    sender_reply_to: Vec<String>,
    created_at: Option<DateTime<Utc>>,
    to_groups: BTreeSet<GroupExpression>,
    cc_groups: BTreeSet<GroupExpression>,
    bcc_groups: BTreeSet<GroupExpression>,
    single_tos: BTreeSet<String>,
    single_bccs: BTreeSet<String>,
    reply_to: BTreeSet<String>,
    preferred_locale: Locale,
    content: BTreeMap<Locale, Content>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new(sender: &Sender) -> Self {
        Self {
            sender: sender.id,
            sender_reply_to: sender.reply_to.clone(),
            created_at: None,
            to_groups: BTreeSet::new(),
            cc_groups: BTreeSet::new(),
            bcc_groups: BTreeSet::new(),
            single_tos: BTreeSet::new(),
            single_bccs: BTreeSet::new(),
            reply_to: BTreeSet::new(),
            preferred_locale: Locale::new("en"),
            content: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn to<I: IntoIterator<Item = GroupExpression>>(mut self, groups: I) -> Self {
        self.to_groups.extend(groups);
        self
    }

    #[must_use]
    pub fn cc<I: IntoIterator<Item = GroupExpression>>(mut self, groups: I) -> Self {
        self.cc_groups.extend(groups);
        self
    }

    #[must_use]
    pub fn bcc<I: IntoIterator<Item = GroupExpression>>(mut self, groups: I) -> Self {
        self.bcc_groups.extend(groups);
        self
    }

    #[must_use]
    pub fn single_to<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.single_tos.extend(valid_only(addresses));
        self
    }

    #[must_use]
    pub fn single_bcc<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.single_bccs.extend(valid_only(addresses));
        self
    }

    #[must_use]
    pub fn reply_to<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reply_to.extend(valid_only(addresses));
        self
    }

    #[must_use]
    pub fn reply_to_sender(self) -> Self {
        let reply_to = self.sender_reply_to.clone();
        self.reply_to(reply_to)
    }

    #[must_use]
    pub fn preferred_locale(mut self, locale: impl Into<Locale>) -> Self {
        self.preferred_locale = locale.into();
        self
    }

    /// Set the content for a locale. Empty subjects and bodies remove it.
    #[must_use]
    pub fn content(mut self, locale: impl Into<Locale>, content: Content) -> Self {
        let locale = locale.into();
        if content.subject.is_empty() && content.text_body.is_empty() && content.html_body.is_none() {
            self.content.remove(&locale);
        } else {
            self.content.insert(locale, content);
        }
        self
    }

    /// Override the creation timestamp, e.g. when restoring stored messages
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    #[must_use]
    pub fn build(self) -> Message {
        Message {
            id: MessageId::generate(),
            sender: self.sender,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            to_groups: self.to_groups,
            cc_groups: self.cc_groups,
            bcc_groups: self.bcc_groups,
            single_tos: self.single_tos,
            single_bccs: self.single_bccs,
            reply_to: self.reply_to,
            preferred_locale: self.preferred_locale,
            content: self.content,
        }
    }
}

fn valid_only<I, S>(addresses: I) -> impl Iterator<Item = String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    addresses
        .into_iter()
        .map(Into::into)
        .map(|address| address.trim().to_string())
        .filter(|address| address::is_valid(address))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_drops_invalid_explicit_addresses() {
        let sender = Sender::new("Ops", "ops@example.com").with_reply_to("help@example.com");
        let message = Message::builder(&sender)
            .single_to(["a@example.com", "not an address"])
            .single_bcc(["b@example.com", "@broken"])
            .reply_to_sender()
            .build();

        assert_eq!(message.single_tos, BTreeSet::from(["a@example.com".to_string()]));
        assert_eq!(message.single_bccs, BTreeSet::from(["b@example.com".to_string()]));
        assert_eq!(message.reply_to, BTreeSet::from(["help@example.com".to_string()]));
        assert_eq!(message.sender, sender.id);
    }

    #[test]
    fn test_content_locales_and_fallback() {
        let sender = Sender::new("Ops", "ops@example.com");
        let message = Message::builder(&sender)
            .preferred_locale("pt-PT")
            .content("pt-PT", Content::new("Olá", "corpo"))
            .content("en-GB", Content::new("Hello", "body"))
            .content("fr-FR", Content::default())
            .build();

        let locales: Vec<_> = message.content_locales().map(Locale::as_str).collect();
        assert_eq!(locales, vec!["en-GB", "pt-PT"]);
        assert!(!message.has_content_for(&Locale::new("fr-FR")));

        let fallback = message.content_for(&Locale::new("de-DE"));
        assert_eq!(fallback.map(|c| c.subject.as_str()), Some("Olá"));
    }

    #[test]
    fn test_sender_opt_in() {
        let member = Member::new("u1", "u1@example.com");
        let open = Sender::new("Open", "open@example.com");
        assert!(open.allows(&member));

        let closed = Sender::new("Closed", "closed@example.com").requiring_opt_in();
        assert!(!closed.allows(&member));

        let closed = closed.with_opted_in(["u1"]);
        assert!(closed.allows(&member));
    }
}
