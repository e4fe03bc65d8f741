//! Pieces shared across the courier workspace: address validation, logging
//! bootstrap and the shutdown signal.

pub mod address;
pub mod logging;

pub use address::{AddressError, Mailbox, is_valid};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
