//! Email-specific types: the parsed inbound message, its body parts, and the
//! raw header mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An email address with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EmailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Display name if present, otherwise the bare address.
    pub fn display(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.address)
    }
}

/// One header line as received: original casing, unfolded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

/// Raw header mapping.
///
/// Lookups are case-insensitive; entries keep their original casing and
/// order, and duplicates are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHeaders {
    entries: Vec<HeaderEntry>,
}

impl RawHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(HeaderEntry {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First value for a header name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
    }

    /// All values for a header name, in received order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
    }

    /// The header name exactly as it appeared on the wire.
    pub fn original_name(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a body part was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Inline,
    Attachment,
}

/// Decoded part payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }
}

/// A leaf MIME part with transfer encoding removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPart {
    /// Lowercased `type/subtype`, e.g. `text/plain`.
    pub content_type: String,
    /// Declared charset, if any.
    pub charset: Option<String>,
    /// Declared `Content-Transfer-Encoding`, lowercased.
    pub transfer_encoding: Option<String>,
    pub disposition: Disposition,
    pub filename: Option<String>,
    pub payload: Payload,
}

impl BodyPart {
    pub fn is_plain_text(&self) -> bool {
        self.content_type == "text/plain" && self.disposition == Disposition::Inline
    }

    pub fn is_html(&self) -> bool {
        self.content_type == "text/html" && self.disposition == Disposition::Inline
    }
}

/// Where the extracted prompt text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    Plain,
    Html,
    Empty,
}

/// A parsed inbound email. Immutable after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// `From` mailbox, if one could be parsed.
    pub sender: Option<EmailAddress>,
    /// `Reply-To` mailbox, if present.
    pub reply_to: Option<EmailAddress>,
    /// `To` then `Cc` addresses, in header order.
    pub recipients: Vec<String>,
    /// Decoded subject line.
    pub subject: Option<String>,
    /// `Message-ID` with angle brackets.
    pub message_id: Option<String>,
    /// `In-Reply-To` ids with angle brackets.
    pub in_reply_to: Vec<String>,
    /// `References` chain with angle brackets, oldest first.
    pub references: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    /// Leaf body parts in MIME order.
    pub parts: Vec<BodyPart>,
    pub headers: RawHeaders,
    /// Plain text used for prompting. Empty when nothing readable exists.
    pub text: String,
    pub text_source: TextSource,
}

impl InboundMessage {
    pub fn sender_address(&self) -> Option<&str> {
        self.sender
            .as_ref()
            .map(|s| s.address.as_str())
            .filter(|a| is_plausible_address(a))
    }

    pub fn subject_or_default(&self) -> &str {
        self.subject
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("(no subject)")
    }

    pub fn attachments(&self) -> impl Iterator<Item = &BodyPart> {
        self.parts
            .iter()
            .filter(|p| p.disposition == Disposition::Attachment)
    }
}

/// Minimal `local@domain` shape check.
pub fn is_plausible_address(addr: &str) -> bool {
    let addr = addr.trim();
    match addr.rsplit_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !addr.chars().any(|c| c.is_whitespace() || c == '<' || c == '>')
        }
        None => false,
    }
}

/// Extract email addresses from an optional mail_parser Address field.
///
/// Returns an empty vec if the address is None.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<EmailAddress> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs.iter().filter_map(convert_addr).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(convert_addr))
            .collect(),
    }
}

fn convert_addr(addr: &mail_parser::Addr<'_>) -> Option<EmailAddress> {
    addr.address.as_ref().map(|s| EmailAddress {
        address: s.to_string(),
        name: addr.name.as_ref().map(|n| n.to_string()),
    })
}
