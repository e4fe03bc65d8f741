//! Per-sender retention of finished messages
//!
//! A policy is an optional keep-count plus an optional keep-period. Both
//! absent keeps everything; a count of zero keeps nothing. Policies are
//! interned by their serialized form, so two equal policies are the same
//! `Arc`.

mod period;

use std::{
    cmp::Reverse,
    collections::HashSet,
    fmt,
    sync::{Arc, LazyLock},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

pub use self::period::Period;
use crate::{
    error::{PolicyError, StoreError},
    store::{DispatchStore, MessageRecord},
    types::{MessageId, SenderId},
};

const ALL_PREFIX: char = 'A';
const NONE_PREFIX: char = 'N';
const COUNT_PREFIX: char = 'Q';
const PERIOD_PREFIX: char = 'P';

static POLICIES: LazyLock<DashMap<String, Arc<RetentionPolicy>>> = LazyLock::new(DashMap::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetentionPolicy {
    count: Option<usize>,
    period: Option<Period>,
}

impl RetentionPolicy {
    /// Keep at most `count` messages, only those created within `period`.
    #[must_use]
    pub fn keep(count: Option<usize>, period: Option<Period>) -> Arc<Self> {
        let policy = if count == Some(0) {
            Self {
                count,
                period: None,
            }
        } else {
            Self { count, period }
        };

        POLICIES
            .entry(policy.serialize())
            .or_insert_with(|| Arc::new(policy))
            .clone()
    }

    #[must_use]
    pub fn keep_all() -> Arc<Self> {
        Self::keep(None, None)
    }

    #[must_use]
    pub fn keep_none() -> Arc<Self> {
        Self::keep(Some(0), None)
    }

    #[must_use]
    pub fn keep_last(count: usize) -> Arc<Self> {
        Self::keep(Some(count), None)
    }

    #[must_use]
    pub fn keep_within(period: Period) -> Arc<Self> {
        Self::keep(None, Some(period))
    }

    /// Parse a serialized policy such as `"A"`, `"N"`, `"Q5"` or `"P1M, Q5"`.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] for empty tokens, unknown prefixes, bad
    /// counts and bad periods.
    pub fn parse(serialized: &str) -> Result<Arc<Self>, PolicyError> {
        let mut count = None;
        let mut period = None;

        for token in serialized.split(',').map(str::trim) {
            let Some(prefix) = token.chars().next() else {
                return Err(PolicyError::EmptyToken);
            };

            match prefix {
                ALL_PREFIX => return Ok(Self::keep_all()),
                NONE_PREFIX => return Ok(Self::keep_none()),
                COUNT_PREFIX => {
                    let value = &token[COUNT_PREFIX.len_utf8()..];
                    count = Some(
                        value
                            .parse::<usize>()
                            .map_err(|_| PolicyError::InvalidCount(value.to_string()))?,
                    );
                }
                PERIOD_PREFIX => period = Some(token.parse::<Period>()?),
                _ => return Err(PolicyError::UnknownToken(token.to_string())),
            }
        }

        Ok(Self::keep(count, period))
    }

    #[must_use]
    pub fn serialize(&self) -> String {
        if self.is_keep_all() {
            return ALL_PREFIX.to_string();
        }
        if self.is_keep_none() {
            return NONE_PREFIX.to_string();
        }

        let mut parts = Vec::with_capacity(2);
        if let Some(period) = self.period {
            parts.push(period.to_string());
        }
        if let Some(count) = self.count {
            parts.push(format!("{COUNT_PREFIX}{count}"));
        }
        parts.join(",")
    }

    #[must_use]
    pub const fn count(&self) -> Option<usize> {
        self.count
    }

    #[must_use]
    pub const fn period(&self) -> Option<Period> {
        self.period
    }

    #[must_use]
    pub const fn is_keep_all(&self) -> bool {
        self.count.is_none() && self.period.is_none()
    }

    #[must_use]
    pub const fn is_keep_none(&self) -> bool {
        matches!(self.count, Some(0))
    }

    /// Which of `messages` this policy would delete at `now`.
    ///
    /// Only finished messages are candidates; unfinished ones are never
    /// selected.
    #[must_use]
    pub fn select_for_deletion(&self, messages: &[MessageRecord], now: DateTime<Utc>) -> Vec<MessageId> {
        if self.is_keep_all() {
            return Vec::new();
        }

        let mut finished: Vec<&MessageRecord> = messages.iter().filter(|m| m.is_finished()).collect();
        if self.is_keep_none() {
            return finished.into_iter().map(|m| m.id).collect();
        }

        finished.sort_by_key(|m| Reverse((m.created_at, m.id)));

        let cutoff = self.period.map(|period| period.before(now));
        let keep: HashSet<MessageId> = finished
            .iter()
            .filter(|m| cutoff.is_none_or(|cutoff| m.created_at > cutoff))
            .take(self.count.unwrap_or(usize::MAX))
            .map(|m| m.id)
            .collect();

        finished
            .into_iter()
            .filter(|m| !keep.contains(&m.id))
            .map(|m| m.id)
            .collect()
    }

    /// Delete the sender's finished messages that fall outside this policy.
    ///
    /// # Errors
    ///
    /// Returns the first store failure; messages deleted before it stay
    /// deleted.
    pub async fn prune(
        &self,
        store: &dyn DispatchStore,
        sender: SenderId,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, StoreError> {
        if self.is_keep_all() {
            return Ok(Vec::new());
        }

        let messages = store.list_messages(sender).await?;
        let doomed = self.select_for_deletion(&messages, now);

        for id in &doomed {
            store.delete_message(*id).await?;
            debug!(message_id = %id, sender = %sender, "Deleted message by retention policy");
        }

        if !doomed.is_empty() {
            info!(sender = %sender, deleted = doomed.len(), policy = %self, "Pruned messages");
        }

        Ok(doomed)
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_keep_all() {
            return f.write_str("keep all");
        }
        if self.is_keep_none() {
            return f.write_str("keep none");
        }

        f.write_str("keep")?;
        if let Some(count) = self.count {
            write!(f, " last {count}")?;
        }
        if let Some(period) = self.period {
            write!(f, " within {period}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;

    fn finished_on(day: u32, sender: SenderId) -> MessageRecord {
        let created_at = Utc.with_ymd_and_hms(2024, 1, day, 9, 0, 0).unwrap();
        MessageRecord {
            id: MessageId::generate(),
            sender,
            created_at,
            finished_at: Some(created_at + Duration::minutes(5)),
        }
    }

    #[test]
    fn test_canonical_singletons() {
        assert!(Arc::ptr_eq(&RetentionPolicy::keep_all(), &RetentionPolicy::keep_all()));
        assert!(Arc::ptr_eq(&RetentionPolicy::keep_none(), &RetentionPolicy::keep(Some(0), None)));
        assert!(Arc::ptr_eq(
            &RetentionPolicy::keep_none(),
            &RetentionPolicy::keep(Some(0), Some(Period::days(3)))
        ));
        assert!(RetentionPolicy::keep_all().is_keep_all());
        assert!(RetentionPolicy::keep_none().is_keep_none());
    }

    #[test]
    fn test_equal_policies_are_interned() {
        let a = RetentionPolicy::keep(Some(7), Some(Period::months(2)));
        let b = RetentionPolicy::parse("P2M , Q7").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.serialize(), "P2M,Q7");
    }

    #[test]
    fn test_parse_and_serialize() {
        for (input, serialized) in [
            ("A", "A"),
            ("N", "N"),
            ("Q0", "N"),
            ("Q3", "Q3"),
            ("P1W", "P1W"),
            ("Q3,P1Y", "P1Y,Q3"),
            ("P1D,A", "A"),
        ] {
            assert_eq!(RetentionPolicy::parse(input).unwrap().serialize(), serialized, "{input}");
        }
    }

    #[test]
    fn test_parse_errors_fail_fast() {
        assert_eq!(RetentionPolicy::parse(""), Err(PolicyError::EmptyToken));
        assert_eq!(RetentionPolicy::parse("Q3,,P1D"), Err(PolicyError::EmptyToken));
        assert_eq!(RetentionPolicy::parse("X3"), Err(PolicyError::UnknownToken("X3".to_string())));
        assert_eq!(RetentionPolicy::parse("Q-1"), Err(PolicyError::InvalidCount("-1".to_string())));
        assert_eq!(RetentionPolicy::parse("Qx"), Err(PolicyError::InvalidCount("x".to_string())));
        assert!(matches!(RetentionPolicy::parse("P1Q"), Err(PolicyError::InvalidPeriod(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(RetentionPolicy::keep_all().to_string(), "keep all");
        assert_eq!(RetentionPolicy::keep_none().to_string(), "keep none");
        assert_eq!(RetentionPolicy::keep_last(4).to_string(), "keep last 4");
        assert_eq!(RetentionPolicy::keep_within(Period::days(10)).to_string(), "keep within P10D");
        assert_eq!(
            RetentionPolicy::keep(Some(4), Some(Period::days(10))).to_string(),
            "keep last 4 within P10D"
        );
    }

    #[test]
    fn test_keep_last_two_of_five() {
        let sender = SenderId::generate();
        let messages: Vec<_> = (1..=5).map(|day| finished_on(day, sender)).collect();
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        let mut doomed = RetentionPolicy::keep_last(2).select_for_deletion(&messages, now);
        doomed.sort();

        let mut expected: Vec<_> = messages[..3].iter().map(|m| m.id).collect();
        expected.sort();
        assert_eq!(doomed, expected);
    }

    #[test]
    fn test_period_and_count_combined() {
        let sender = SenderId::generate();
        let messages: Vec<_> = (1..=5).map(|day| finished_on(day, sender)).collect();
        let now = Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap();

        // Within three days keeps days 3, 4 and 5; the count trims it to 4 and 5
        let policy = RetentionPolicy::keep(Some(2), Some(Period::days(3)));
        let doomed: HashSet<_> = policy.select_for_deletion(&messages, now).into_iter().collect();
        assert_eq!(doomed, messages[..3].iter().map(|m| m.id).collect::<HashSet<_>>());

        let policy = RetentionPolicy::keep_within(Period::days(3));
        let doomed: HashSet<_> = policy.select_for_deletion(&messages, now).into_iter().collect();
        assert_eq!(doomed, messages[..2].iter().map(|m| m.id).collect::<HashSet<_>>());
    }

    #[test]
    fn test_unfinished_messages_are_never_selected() {
        let sender = SenderId::generate();
        let mut messages: Vec<_> = (1..=3).map(|day| finished_on(day, sender)).collect();
        messages[0].finished_at = None;

        let doomed = RetentionPolicy::keep_none().select_for_deletion(&messages, Utc::now());
        assert_eq!(doomed.len(), 2);
        assert!(!doomed.contains(&messages[0].id));

        assert!(
            RetentionPolicy::keep_all()
                .select_for_deletion(&messages, Utc::now())
                .is_empty()
        );
    }
}
