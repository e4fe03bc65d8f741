//! Group expansion seam
//!
//! Group expressions are opaque to the engine. A [`GroupResolver`] turns one
//! into its current members and answers the deployment-wide opt-out question.

use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    error::ResolutionError,
    types::{GroupExpression, Member},
};

#[async_trait]
pub trait GroupResolver: Send + Sync + Debug {
    /// Expand a group into its current members.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionError`] if the group cannot be expanded; the
    /// message is then not dispatched.
    async fn expand(&self, group: &GroupExpression) -> Result<Vec<Member>, ResolutionError>;

    /// Whether the member has not opted out of messaging altogether.
    fn is_opted_in(&self, member: &Member) -> bool;
}

/// In-memory directory of named groups.
///
/// Expressions are looked up by their exact text.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    groups: RwLock<HashMap<GroupExpression, Vec<Member>>>,
    opted_out: RwLock<HashSet<String>>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or replace) a group
    pub fn define(&self, group: GroupExpression, members: Vec<Member>) {
        self.groups.write().insert(group, members);
    }

    #[must_use]
    pub fn with_group(self, group: &str, members: Vec<Member>) -> Self {
        self.define(GroupExpression::new(group), members);
        self
    }

    pub fn opt_out(&self, member_id: &str) {
        self.opted_out.write().insert(member_id.to_string());
    }

    pub fn opt_in(&self, member_id: &str) {
        self.opted_out.write().remove(member_id);
    }
}

#[async_trait]
impl GroupResolver for StaticDirectory {
    async fn expand(&self, group: &GroupExpression) -> Result<Vec<Member>, ResolutionError> {
        self.groups
            .read()
            .get(group)
            .cloned()
            .ok_or_else(|| ResolutionError::UnknownGroup(group.clone()))
    }

    fn is_opted_in(&self, member: &Member) -> bool {
        !self.opted_out.read().contains(&member.id)
    }
}
