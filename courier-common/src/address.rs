//! RFC 5322 style e-mail address validation
//!
//! Every address that enters the dispatch engine passes through [`is_valid`]
//! before it may be placed in a handler. Validation is purely syntactic: no
//! DNS lookups, no mailbox probing.
//!
//! # Accepted grammar
//!
//! ```text
//! address        = addr-spec / "<" addr-spec ">"
//! addr-spec      = local-part "@" domain
//! local-part     = dot-atom / quoted-string
//! dot-atom       = atom *("." atom)
//! atom           = 1*atext
//! domain         = sub-domain *("." sub-domain) / domain-literal
//! sub-domain     = Let-dig [Ldh-str]
//! domain-literal = "[" ( IPv4 / "IPv6:" IPv6 / tag ":" value ) "]"
//! ```
//!
//! # Size Constraints
//!
//! - Maximum address length: 254 octets
//! - Maximum local-part: 64 octets
//! - Maximum domain: 253 octets, 63 per label

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_ADDRESS_LEN: usize = 254;
const MAX_LOCAL_PART_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Result type for address parsing
pub type Result<T> = std::result::Result<T, AddressError>;

/// Reasons an address failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("Address exceeds {MAX_ADDRESS_LEN} octets")]
    TooLong,

    #[error("Local-part exceeds {MAX_LOCAL_PART_LEN} octets")]
    LocalPartTooLong,

    #[error("Domain exceeds {MAX_DOMAIN_LEN} octets")]
    DomainTooLong,

    #[error("Unbalanced angle brackets")]
    UnbalancedBrackets,

    #[error("Missing '@' separator")]
    MissingAtSign,

    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid domain literal: {0}")]
    InvalidDomainLiteral(String),

    #[error("Unclosed quoted string in local-part")]
    UnclosedQuotedString,

    #[error("Invalid quoted string: {0}")]
    InvalidQuotedString(String),
}

/// A syntactically valid mailbox (local-part@domain)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mailbox {
    /// The local part (before @)
    pub local_part: String,
    /// The domain or domain literal (after @)
    pub domain: String,
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl FromStr for Mailbox {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

/// Returns `true` if `address` is a syntactically valid e-mail address.
#[must_use]
pub fn is_valid(address: &str) -> bool {
    parse(address).is_ok()
}

/// Parse an address, either bare (`user@example.com`) or angle-bracketed
/// (`<user@example.com>`).
///
/// # Errors
///
/// Returns an [`AddressError`] describing the first syntax violation found.
pub fn parse(input: &str) -> Result<Mailbox> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    let inner = match (trimmed.starts_with('<'), trimmed.ends_with('>')) {
        (true, true) if trimmed.len() >= 2 => &trimmed[1..trimmed.len() - 1],
        (false, false) => trimmed,
        _ => return Err(AddressError::UnbalancedBrackets),
    };

    if inner.is_empty() {
        return Err(AddressError::Empty);
    }

    if inner.len() > MAX_ADDRESS_LEN {
        return Err(AddressError::TooLong);
    }

    let at_pos = find_unquoted_at(inner)?;
    let local_part = &inner[..at_pos];
    let domain = &inner[at_pos + 1..];

    if local_part.len() > MAX_LOCAL_PART_LEN {
        return Err(AddressError::LocalPartTooLong);
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(AddressError::DomainTooLong);
    }

    parse_local_part(local_part)?;
    parse_domain_or_literal(domain)?;

    Ok(Mailbox {
        local_part: local_part.to_string(),
        domain: domain.to_string(),
    })
}

/// Position of the last '@' that is not inside a quoted string or domain literal
fn find_unquoted_at(input: &str) -> Result<usize> {
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut escaped = false;
    let mut at = None;

    for (i, ch) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_quotes => escaped = true,
            '"' if !in_brackets => in_quotes = !in_quotes,
            '[' if !in_quotes => in_brackets = true,
            ']' if !in_quotes => in_brackets = false,
            '@' if !in_quotes && !in_brackets => at = Some(i),
            _ => {}
        }
    }

    at.ok_or(AddressError::MissingAtSign)
}

fn parse_local_part(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidLocalPart("empty local-part".to_string()));
    }

    if input.starts_with('"') {
        parse_quoted_string(input)
    } else {
        parse_dot_atom(input)
    }
}

fn parse_dot_atom(input: &str) -> Result<()> {
    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidLocalPart(
            "cannot start or end with '.'".to_string(),
        ));
    }

    if input.contains("..") {
        return Err(AddressError::InvalidLocalPart(
            "cannot contain consecutive dots".to_string(),
        ));
    }

    if let Some(ch) = input.chars().find(|&ch| ch != '.' && !is_atext(ch)) {
        return Err(AddressError::InvalidLocalPart(format!(
            "invalid character '{ch}'"
        )));
    }

    Ok(())
}

fn parse_quoted_string(input: &str) -> Result<()> {
    if input.len() < 2 || !input.ends_with('"') {
        return Err(AddressError::UnclosedQuotedString);
    }

    let mut chars = input[1..input.len() - 1].chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next) if next.is_ascii_graphic() || next == ' ' => {}
                Some(next) => {
                    return Err(AddressError::InvalidQuotedString(format!(
                        "invalid quoted-pair: \\{next}"
                    )));
                }
                None => return Err(AddressError::UnclosedQuotedString),
            }
        } else if !is_qtext(ch) {
            return Err(AddressError::InvalidQuotedString(format!(
                "invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

fn parse_domain_or_literal(input: &str) -> Result<()> {
    if input.starts_with('[') {
        parse_domain_literal(input)
    } else {
        parse_domain(input)
    }
}

fn parse_domain(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidDomain("empty domain".to_string()));
    }

    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidDomain(
            "cannot start or end with '.'".to_string(),
        ));
    }

    input.split('.').try_for_each(parse_label)
}

fn parse_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(AddressError::InvalidDomain("empty label".to_string()));
    }

    if label.len() > MAX_LABEL_LEN {
        return Err(AddressError::InvalidDomain(format!(
            "label exceeds {MAX_LABEL_LEN} octets"
        )));
    }

    let bytes = label.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return Err(AddressError::InvalidDomain(format!(
            "label '{label}' must start and end with a letter or digit"
        )));
    }

    if let Some(ch) = label
        .chars()
        .find(|&ch| !ch.is_ascii_alphanumeric() && ch != '-')
    {
        return Err(AddressError::InvalidDomain(format!(
            "invalid character '{ch}' in label"
        )));
    }

    Ok(())
}

fn parse_domain_literal(input: &str) -> Result<()> {
    let Some(content) = input.strip_prefix('[').and_then(|s| s.strip_suffix(']')) else {
        return Err(AddressError::InvalidDomainLiteral(
            "must be enclosed in brackets".to_string(),
        ));
    };

    if content.parse::<Ipv4Addr>().is_ok() {
        return Ok(());
    }

    if let Some(v6) = content.strip_prefix("IPv6:") {
        return v6
            .parse::<Ipv6Addr>()
            .map(|_| ())
            .map_err(|_| AddressError::InvalidDomainLiteral(content.to_string()));
    }

    match content.split_once(':') {
        Some((tag, value))
            if !tag.is_empty()
                && !value.is_empty()
                && value.chars().all(|c| c.is_ascii_graphic() && c != '[' && c != ']') =>
        {
            Ok(())
        }
        _ => Err(AddressError::InvalidDomainLiteral(content.to_string())),
    }
}

/// atext = ALPHA / DIGIT / "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" /
///         "-" / "/" / "=" / "?" / "^" / "_" / "`" / "{" / "|" / "}" / "~"
#[inline]
const fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

/// Printable ASCII except backslash and double quote
#[inline]
const fn is_qtext(ch: char) -> bool {
    matches!(ch as u32, 32..=33 | 35..=91 | 93..=126)
}
