//! Reply composition: threading headers, subject, quoting, and MIME
//! rendering through `lettre`.

use std::str::FromStr;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::{Address, Message};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::assistants::Resolution;
use crate::email::html::escape_html;
use crate::email::types::{EmailAddress, InboundMessage, is_plausible_address};
use crate::error::{ComposeError, ConfigError};

/// Whether replies include the original message as a quote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotePolicy {
    #[default]
    NoQuote,
    QuoteOriginal,
}

impl FromStr for QuotePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "no_quote" | "none" => Ok(Self::NoQuote),
            "quote_original" | "quote" => Ok(Self::QuoteOriginal),
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_ASSIST_QUOTE_POLICY".into(),
                message: format!("unknown quote policy '{other}'"),
            }),
        }
    }
}

/// Everything needed to render a reply. Consumed once by the composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDraft {
    pub text: String,
    pub from: EmailAddress,
    pub to: EmailAddress,
    pub subject: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Attribution line plus `> `-prefixed original, when quoting.
    pub quote: Option<String>,
    pub html: bool,
}

/// A fully composed reply, the only thing handed to a transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub from: EmailAddress,
    pub to: EmailAddress,
    pub subject: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub date: DateTime<Utc>,
    /// Value of the `Auto-Submitted` header.
    pub auto_submitted: String,
    message: Message,
}

impl OutboundMessage {
    /// The `lettre` message, for transports.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// RFC 5322 bytes.
    pub fn formatted(&self) -> Vec<u8> {
        self.message.formatted()
    }
}

/// `Auto-Submitted` header (RFC 3834).
#[derive(Debug, Clone, PartialEq, Eq)]
struct AutoSubmitted(String);

impl Header for AutoSubmitted {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Auto-Submitted")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.trim().to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Builds replies for resolved assistants.
#[derive(Debug, Clone, Default)]
pub struct ReplyComposer {
    default_quote_policy: QuotePolicy,
}

impl ReplyComposer {
    pub fn new(default_quote_policy: QuotePolicy) -> Self {
        Self {
            default_quote_policy,
        }
    }

    /// Compose a reply dated now.
    pub fn compose(
        &self,
        original: &InboundMessage,
        resolution: &Resolution<'_>,
        reply_text: &str,
    ) -> Result<OutboundMessage, ComposeError> {
        self.compose_at(original, resolution, reply_text, Utc::now())
    }

    pub fn compose_at(
        &self,
        original: &InboundMessage,
        resolution: &Resolution<'_>,
        reply_text: &str,
        now: DateTime<Utc>,
    ) -> Result<OutboundMessage, ComposeError> {
        let draft = self.draft(original, resolution, reply_text)?;
        render(draft, now)
    }

    /// Work out addressing, subject, threading and quoting.
    pub fn draft(
        &self,
        original: &InboundMessage,
        resolution: &Resolution<'_>,
        reply_text: &str,
    ) -> Result<ReplyDraft, ComposeError> {
        let assistant = resolution.assistant;

        let to = original
            .reply_to
            .as_ref()
            .filter(|a| is_plausible_address(&a.address))
            .or(original
                .sender
                .as_ref()
                .filter(|a| is_plausible_address(&a.address)))
            .cloned()
            .ok_or(ComposeError::MissingSender)?;

        let from_address = assistant
            .sender
            .as_deref()
            .or(resolution.matched_recipient)
            .or(original.recipients.first().map(String::as_str))
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(ComposeError::MissingFrom)?;
        let from = EmailAddress {
            address: from_address.to_string(),
            name: assistant.display_name.clone(),
        };

        let policy = assistant.quote_policy.unwrap_or(self.default_quote_policy);
        let quote = match policy {
            QuotePolicy::QuoteOriginal => Some(quote_original(original)),
            QuotePolicy::NoQuote => None,
        };

        // Mail without References still names its parent in In-Reply-To.
        let parents = if original.references.is_empty() {
            &original.in_reply_to
        } else {
            &original.references
        };

        Ok(ReplyDraft {
            text: reply_text.trim_end().to_string(),
            from,
            to,
            subject: reply_subject(original.subject.as_deref()),
            in_reply_to: original.message_id.clone(),
            references: reference_chain(parents, original.message_id.as_deref()),
            quote,
            html: assistant.html_reply,
        })
    }
}

/// Render a draft into an [`OutboundMessage`].
pub fn render(draft: ReplyDraft, now: DateTime<Utc>) -> Result<OutboundMessage, ComposeError> {
    let from_mailbox = mailbox("From", &draft.from)?;
    let to_mailbox = mailbox("To", &draft.to)?;

    let message_id = format!(
        "<{}@{}>",
        Uuid::new_v4(),
        domain_of(&draft.from.address).unwrap_or("localhost")
    );

    let body_text = match &draft.quote {
        Some(quote) => format!("{}\n\n{quote}", draft.text),
        None => draft.text.clone(),
    };
    let body_html = draft
        .html
        .then(|| html_body(&draft.text, draft.from.name.as_deref()));

    let mut builder = Message::builder()
        .from(from_mailbox)
        .to(to_mailbox)
        .subject(draft.subject.clone())
        .message_id(Some(message_id.clone()))
        .date(SystemTime::from(now))
        .header(AutoSubmitted("auto-replied".to_string()));

    if let Some(id) = &draft.in_reply_to {
        builder = builder.in_reply_to(id.clone());
    }
    // One header, space separated: repeated calls would overwrite.
    if !draft.references.is_empty() {
        builder = builder.references(draft.references.join(" "));
    }

    let message = match &body_html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            body_text.clone(),
            html.clone(),
        )),
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(body_text.clone()),
    }
    .map_err(|e| ComposeError::Build(e.to_string()))?;

    debug!(
        to = %draft.to.address,
        from = %draft.from.address,
        message_id = %message_id,
        html = body_html.is_some(),
        "Composed reply"
    );

    Ok(OutboundMessage {
        from: draft.from,
        to: draft.to,
        subject: draft.subject,
        message_id,
        in_reply_to: draft.in_reply_to,
        references: draft.references,
        body_text,
        body_html,
        date: now,
        auto_submitted: "auto-replied".to_string(),
        message,
    })
}

fn mailbox(field: &'static str, addr: &EmailAddress) -> Result<Mailbox, ComposeError> {
    let email = addr
        .address
        .trim()
        .parse::<Address>()
        .map_err(|e| ComposeError::InvalidAddress {
            field,
            address: addr.address.clone(),
            reason: e.to_string(),
        })?;
    let name = addr.name.clone().filter(|n| !n.trim().is_empty());
    Ok(Mailbox::new(name, email))
}

fn domain_of(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, d)| d.trim())
        .filter(|d| !d.is_empty())
}

/// `Re: <subject>` unless already a reply.
pub fn reply_subject(subject: Option<&str>) -> String {
    let subject = subject.map(str::trim).filter(|s| !s.is_empty());
    match subject {
        Some(s) if s.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) => s.to_string(),
        Some(s) => format!("Re: {s}"),
        None => "Re: (no subject)".to_string(),
    }
}

/// Original references with the original id appended, without duplicates.
pub fn reference_chain(references: &[String], message_id: Option<&str>) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(references.len() + 1);
    for id in references.iter().map(String::as_str).chain(message_id) {
        if !chain.iter().any(|existing| existing == id) {
            chain.push(id.to_string());
        }
    }
    chain
}

/// Quote the original message body for inclusion in a reply.
pub fn quote_original(original: &InboundMessage) -> String {
    let sender = original
        .sender
        .as_ref()
        .map(|s| match s.name.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(name) => format!("{} <{}>", name.trim(), s.address),
            None => s.address.clone(),
        })
        .unwrap_or_else(|| "the sender".to_string());
    let date = original
        .date
        .map(|d| d.to_rfc2822())
        .unwrap_or_else(|| "an unknown date".to_string());

    let quoted = if original.text.is_empty() {
        ">".to_string()
    } else {
        original
            .text
            .lines()
            .map(|line| {
                if line.is_empty() {
                    ">".to_string()
                } else {
                    format!("> {line}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!("On {date}, {sender} wrote:\n{quoted}")
}

/// Escaped paragraphs, line breaks preserved, optional signature.
fn html_body(text: &str, signature: Option<&str>) -> String {
    let mut html = String::from("<!DOCTYPE html>\n<html><body>\n");
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let escaped: Vec<String> = paragraph.lines().map(escape_html).collect();
        html.push_str("<p>");
        html.push_str(&escaped.join("<br>\n"));
        html.push_str("</p>\n");
    }
    if let Some(sig) = signature.map(str::trim).filter(|s| !s.is_empty()) {
        html.push_str("<p style=\"color:#666\">-- <br>\n");
        html.push_str(&escape_html(sig));
        html.push_str("</p>\n");
    }
    html.push_str("</body></html>\n");
    html
}
