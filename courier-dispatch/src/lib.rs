//! Outbound e-mail dispatch engine
//!
//! This crate provides functionality to:
//! - Resolve a message's recipient groups into deduplicated, per-locale
//!   batches of addresses
//! - Track delivery of those batches in a per-message report
//! - Record invalid and failing addresses in an append-only blacklist
//! - Prune finished messages according to each sender's retention policy

mod blacklist;
mod config;
mod dispatcher;
mod error;
mod groups;
mod handler;
mod message;
mod report;
mod resolver;
pub mod retention;
pub mod store;
mod transport;
mod types;

pub use blacklist::{Blacklist, BlacklistEntry, BlacklistStatus};
pub use config::{CONFIG_VAR, DispatchConfig, SmtpConfig};
pub use dispatcher::{Dispatcher, PassSummary};
pub use error::{ConfigError, DispatchError, PolicyError, ResolutionError, SendError, StoreError};
pub use groups::{GroupResolver, StaticDirectory};
pub use handler::{DispatchHandler, HandlerPass, Recipient, RecipientStatus};
pub use message::{Message, MessageBuilder, Sender};
pub use report::{AttemptOutcome, DeliveryContext, DeliveryReport, ReportSnapshot, ReportState};
pub use resolver::{LocaleBuckets, RecipientResolver, Resolution, ResolverOptions};
pub use retention::{Period, RetentionPolicy};
pub use store::{DispatchStore, MemoryStore, MessageRecord};
pub use transport::{Envelope, Origin, Transport};
pub use types::{Content, GroupExpression, Locale, Member, MessageId, RecipientClass, SenderId};
