//! Identifiers and small value types shared across the engine

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            /// Generate a new unique identifier
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new())
            }

            /// Wrap an existing ULID
            #[must_use]
            pub const fn new(id: ulid::Ulid) -> Self {
                Self(id)
            }

            #[must_use]
            pub const fn ulid(&self) -> ulid::Ulid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// Store-assigned identifier of a message (and of its delivery report)
    ///
    /// ULIDs sort lexicographically by creation time.
    MessageId
);

ulid_id!(
    /// Identifier of a sender
    SenderId
);

/// A language tag such as `en-GB`.
///
/// The language subtag is lower-cased and the region upper-cased on
/// construction, so `EN_gb` and `en-GB` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Locale(String);

impl Locale {
    #[must_use]
    pub fn new(tag: &str) -> Self {
        let normalized = tag
            .trim()
            .split(['-', '_'])
            .filter(|part| !part.is_empty())
            .enumerate()
            .map(|(i, part)| {
                if i == 0 {
                    part.to_ascii_lowercase()
                } else if part.len() == 2 {
                    part.to_ascii_uppercase()
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("-");

        Self(normalized)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locale {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Locale {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<Locale> for String {
    fn from(value: Locale) -> Self {
        value.0
    }
}

/// An opaque group expression, only meaningful to the group resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupExpression(String);

impl GroupExpression {
    #[must_use]
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved group member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub preferred_locale: Option<Locale>,
}

impl Member {
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            preferred_locale: None,
        }
    }

    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<Locale>) -> Self {
        self.preferred_locale = Some(locale.into());
        self
    }
}

/// Visibility class of a recipient.
///
/// Ordering is the de-duplication priority: an address in a lower class is
/// dropped when a higher class already holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecipientClass {
    To,
    Cc,
    Bcc,
}

impl RecipientClass {
    pub const ALL: [Self; 3] = [Self::To, Self::Cc, Self::Bcc];
}

impl fmt::Display for RecipientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
        })
    }
}

/// Rendered content for one locale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub subject: String,
    pub text_body: String,
    #[serde(default)]
    pub html_body: Option<String>,
}

impl Content {
    #[must_use]
    pub fn new(subject: impl Into<String>, text_body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            text_body: text_body.into(),
            html_body: None,
        }
    }

    #[must_use]
    pub fn with_html(mut self, html_body: impl Into<String>) -> Self {
        self.html_body = Some(html_body.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locale_normalization() {
        assert_eq!(Locale::new("EN_gb"), Locale::new("en-GB"));
        assert_eq!(Locale::new("pt").as_str(), "pt");
        assert_eq!(Locale::new(" pt-pt ").to_string(), "pt-PT");
        assert_eq!(Locale::new("zh-Hant-TW").as_str(), "zh-Hant-TW");
    }

    #[test]
    fn test_class_priority_order() {
        assert!(RecipientClass::To < RecipientClass::Cc);
        assert!(RecipientClass::Cc < RecipientClass::Bcc);
    }

    #[test]
    fn test_message_ids_are_time_ordered() {
        let first = MessageId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = MessageId::generate();
        assert!(first < second);
    }
}
