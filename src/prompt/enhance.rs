//! Prompt enhancement directives.
//!
//! Each directive is a pure transform that appends one line to the
//! instruction section. Nothing is ever removed or rewritten, so the persona
//! text always survives intact.

use std::mem::discriminant;

use serde::{Deserialize, Serialize};

use crate::email::types::InboundMessage;

/// A configured enhancement directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Enhancement {
    /// Cap the reply length.
    MaxWords { limit: u32 },
    Tone { tone: String },
    /// Reply language, e.g. "French".
    Language { language: String },
    /// Forbid markdown and HTML in the reply.
    PlainText,
    SignAs { signature: String },
    /// Tell the model when the message was sent (from its `Date` header).
    ReceivedTime,
    /// Static background text.
    Context { text: String },
}

impl Enhancement {
    /// Directive line for this enhancement, or `None` when it has nothing
    /// to add for this message.
    pub fn directive(&self, message: &InboundMessage) -> Option<String> {
        match self {
            Self::MaxWords { limit } => {
                Some(format!("Keep the reply under {limit} words."))
            }
            Self::Tone { tone } => non_empty(tone).map(|t| format!("Use a {t} tone.")),
            Self::Language { language } => {
                non_empty(language).map(|l| format!("Write the reply in {l}."))
            }
            Self::PlainText => {
                Some("Reply in plain text only, without markdown or HTML.".to_string())
            }
            Self::SignAs { signature } => {
                non_empty(signature).map(|s| format!("Sign the reply as \"{s}\"."))
            }
            Self::ReceivedTime => message.date.map(|d| {
                format!(
                    "The email was sent on {}.",
                    d.format("%A, %d %B %Y at %H:%M UTC")
                )
            }),
            Self::Context { text } => non_empty(text).map(|t| format!("Context: {t}")),
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

/// Apply directives in declared order, each kind at most once.
///
/// Returns the directive lines that were appended.
pub fn apply(enhancements: &[Enhancement], message: &InboundMessage) -> Vec<String> {
    let mut applied = Vec::new();
    let mut lines = Vec::new();
    for enhancement in enhancements {
        let kind = discriminant(enhancement);
        if applied.contains(&kind) {
            continue;
        }
        applied.push(kind);
        if let Some(line) = enhancement.directive(message) {
            lines.push(line);
        }
    }
    lines
}
