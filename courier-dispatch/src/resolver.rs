//! Turns a message into deduplicated, locale-partitioned dispatch handlers
//!
//! Resolution runs in five steps:
//! 1. Expand every group, keeping members that are opted in and allowed by
//!    the sender
//! 2. Merge everything into Bcc (bcc-only senders) or make the classes
//!    disjoint with priority To > Cc > Bcc > explicit addresses
//! 3. Validate addresses, recording invalid ones in the blacklist
//! 4. Partition each class by locale
//! 5. Split each (class, locale) bucket into handlers of bounded size

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use courier_common::{Mailbox, internal, is_valid};
use tracing::debug;

use crate::{
    blacklist::{Blacklist, BlacklistEntry},
    config::DispatchConfig,
    error::ResolutionError,
    groups::GroupResolver,
    handler::DispatchHandler,
    message::{Message, Sender},
    report::DeliveryReport,
    transport::Origin,
    types::{Content, GroupExpression, Locale, RecipientClass},
};

/// Address to its preferred locale, if the member has one
type Recipients = BTreeMap<String, Option<Locale>>;

/// Locale to addresses, for one recipient class
pub type LocaleBuckets = BTreeMap<Locale, BTreeSet<String>>;

/// Bare `local@domain` form of an address, so bracketed or padded spellings
/// of one mailbox compare equal. Unparsable input is returned as given and
/// later rejected by validation.
fn canonical(address: &str) -> String {
    address
        .parse::<Mailbox>()
        .map_or_else(|_| address.to_string(), |mailbox| mailbox.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    pub max_recipients: usize,
    pub recipients_as_bccs: bool,
    pub resolve_timeout: Duration,
    pub failure_threshold: Option<usize>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for ResolverOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_recipients: config.max_recipients,
            recipients_as_bccs: config.recipients_as_bccs,
            resolve_timeout: config.resolve_timeout(),
            failure_threshold: config.failure_threshold,
        }
    }
}

/// Result of resolving one message
#[derive(Debug)]
pub struct Resolution {
    pub recipients: BTreeMap<RecipientClass, LocaleBuckets>,
    pub handlers: Vec<DispatchHandler>,
    pub valid: usize,
    /// Addresses that failed validation, in resolution order
    pub invalid: Vec<String>,
    /// Blacklist entries appended for the invalid addresses
    pub blacklisted: Vec<BlacklistEntry>,
}

impl Resolution {
    /// Addresses resolved for `class`, across all locales
    #[must_use]
    pub fn addresses(&self, class: RecipientClass) -> BTreeSet<&str> {
        self.recipients
            .get(&class)
            .into_iter()
            .flat_map(BTreeMap::values)
            .flatten()
            .map(String::as_str)
            .collect()
    }

    #[must_use]
    pub fn into_report(self, message: &Message, sender: &Sender) -> DeliveryReport {
        let origin = Origin {
            name: sender.name.clone(),
            address: sender.address.clone(),
            reply_to: message.reply_to.iter().cloned().collect(),
        };

        DeliveryReport::new(message.id, sender.id, origin, self.handlers, self.invalid.len())
    }
}

#[derive(Debug, Clone)]
pub struct RecipientResolver {
    groups: Arc<dyn GroupResolver>,
    blacklist: Arc<Blacklist>,
    options: ResolverOptions,
}

impl RecipientResolver {
    #[must_use]
    pub fn new(groups: Arc<dyn GroupResolver>, blacklist: Arc<Blacklist>, options: ResolverOptions) -> Self {
        Self {
            groups,
            blacklist,
            options,
        }
    }

    #[must_use]
    pub const fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Resolve `message`, sent by `sender`, into handlers.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionError`] if any group fails to expand or times
    /// out. Nothing is blacklisted in that case.
    pub async fn resolve(&self, message: &Message, sender: &Sender) -> Result<Resolution, ResolutionError> {
        let mut to = self.expand_all(&message.to_groups, sender).await?;
        let mut cc = self.expand_all(&message.cc_groups, sender).await?;
        let mut bcc = self.expand_all(&message.bcc_groups, sender).await?;
        let mut single_tos: BTreeSet<_> = message.single_tos.iter().map(|a| canonical(a)).collect();
        let mut single_bccs: BTreeSet<_> = message.single_bccs.iter().map(|a| canonical(a)).collect();

        if sender.recipients_as_bccs || self.options.recipients_as_bccs {
            for (address, locale) in to.into_iter().chain(std::mem::take(&mut cc)) {
                bcc.entry(address).or_insert(locale);
            }
            to = Recipients::new();

            // Explicit addresses join the Bcc set; one already resolved from
            // a group keeps its member locale
            for address in std::mem::take(&mut single_tos).into_iter().chain(std::mem::take(&mut single_bccs)) {
                bcc.entry(address).or_insert(None);
            }
        } else {
            cc.retain(|address, _| !to.contains_key(address));
            bcc.retain(|address, _| !to.contains_key(address) && !cc.contains_key(address));

            let grouped = |address: &String| {
                to.contains_key(address) || cc.contains_key(address) || bcc.contains_key(address)
            };
            single_tos.retain(|address| !grouped(address));
            single_bccs.retain(|address| !grouped(address) && !single_tos.contains(address));

            for address in std::mem::take(&mut single_tos) {
                to.insert(address, None);
            }
            for address in std::mem::take(&mut single_bccs) {
                bcc.insert(address, None);
            }
        }

        let suppressed = self
            .options
            .failure_threshold
            .map(|threshold| self.blacklist.suppressed(threshold))
            .unwrap_or_default();

        let mut invalid = Vec::new();
        let mut blacklisted = Vec::new();
        let mut recipients = BTreeMap::new();

        for (class, members) in RecipientClass::ALL.into_iter().zip([to, cc, bcc]) {
            let mut buckets = LocaleBuckets::new();

            for (address, preferred) in members {
                if suppressed.contains(&address) {
                    debug!(message_id = %message.id, address = %address, "Skipping suppressed address");
                    continue;
                }

                if !is_valid(&address) {
                    blacklisted.push(self.blacklist.add_invalid(&address));
                    invalid.push(address);
                    continue;
                }

                let locale = preferred
                    .filter(|locale| message.has_content_for(locale))
                    .unwrap_or_else(|| message.preferred_locale.clone());
                buckets.entry(locale).or_default().insert(address);
            }

            if !buckets.is_empty() {
                recipients.insert(class, buckets);
            }
        }

        let handlers = self.build_handlers(message, &recipients);
        let valid: usize = handlers.iter().map(DispatchHandler::len).sum();

        internal!(
            level = DEBUG,
            message_id = %message.id,
            valid,
            invalid = invalid.len(),
            handlers = handlers.len(),
            "Resolved recipients"
        );

        Ok(Resolution {
            recipients,
            handlers,
            valid,
            invalid,
            blacklisted,
        })
    }

    async fn expand_all(
        &self,
        groups: &BTreeSet<GroupExpression>,
        sender: &Sender,
    ) -> Result<Recipients, ResolutionError> {
        let mut recipients = Recipients::new();

        for group in groups {
            let members = tokio::time::timeout(self.options.resolve_timeout, self.groups.expand(group))
                .await
                .map_err(|_| ResolutionError::Timeout {
                    group: group.clone(),
                    secs: self.options.resolve_timeout.as_secs(),
                })??;

            for member in members {
                if member.email.is_empty() || !self.groups.is_opted_in(&member) || !sender.allows(&member) {
                    continue;
                }
                recipients
                    .entry(canonical(&member.email))
                    .or_insert(member.preferred_locale);
            }
        }

        Ok(recipients)
    }

    fn build_handlers(
        &self,
        message: &Message,
        recipients: &BTreeMap<RecipientClass, LocaleBuckets>,
    ) -> Vec<DispatchHandler> {
        let mut content_cache: BTreeMap<&Locale, Arc<Content>> = BTreeMap::new();
        let mut handlers = Vec::new();

        for (class, buckets) in recipients {
            for (locale, addresses) in buckets {
                let content = content_cache
                    .entry(locale)
                    .or_insert_with(|| Arc::new(message.content_for(locale).cloned().unwrap_or_default()))
                    .clone();

                let addresses: Vec<_> = addresses.iter().cloned().collect();
                for chunk in addresses.chunks(self.options.max_recipients.max(1)) {
                    handlers.push(DispatchHandler::new(
                        *class,
                        locale.clone(),
                        Arc::clone(&content),
                        chunk.iter().cloned(),
                    ));
                }
            }
        }

        handlers
    }
}
