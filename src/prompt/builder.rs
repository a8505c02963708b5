//! Prompt assembly and size limiting.

use tracing::{debug, warn};

use crate::assistants::AssistantConfig;
use crate::email::types::InboundMessage;
use crate::error::PromptError;
use crate::llm::provider::Capabilities;
use crate::prompt::enhance;

/// Marker appended to truncated message text.
pub const TRUNCATION_MARKER: &str = "[message truncated]";

/// Default number of leading message characters that truncation keeps.
pub const DEFAULT_MIN_PRESERVED_CHARS: usize = 200;

/// The prompt sent to the AI backend. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedPrompt {
    /// Persona followed by directive lines.
    pub instructions: String,
    /// Reminder, subject and sender lines followed by the message text.
    pub message_section: String,
    /// Full text handed to the backend.
    pub rendered: String,
    pub truncated: bool,
}

impl EnhancedPrompt {
    pub fn char_len(&self) -> usize {
        self.rendered.chars().count()
    }
}

/// Builds prompts for a resolved assistant.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    min_preserved_chars: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PRESERVED_CHARS)
    }
}

impl PromptBuilder {
    pub fn new(min_preserved_chars: usize) -> Self {
        Self {
            min_preserved_chars,
        }
    }

    /// Render the prompt, truncating the message text if it exceeds
    /// `capabilities.max_input_chars`.
    pub fn build(
        &self,
        assistant: &AssistantConfig,
        message: &InboundMessage,
        capabilities: Capabilities,
    ) -> Result<EnhancedPrompt, PromptError> {
        let instructions = instructions(assistant, message);
        let header = message_header(message);
        let limit = capabilities.max_input_chars;

        let full = render(&instructions, &header, &message.text);
        let full_len = full.chars().count();
        if full_len <= limit {
            return Ok(EnhancedPrompt {
                message_section: join_section(&header, &message.text),
                instructions,
                rendered: full,
                truncated: false,
            });
        }

        let text_len = message.text.chars().count();
        let marker_len = TRUNCATION_MARKER.chars().count() + 1;
        // Everything except the message text, plus the marker line.
        let fixed = full_len - text_len + marker_len;
        let floor = self.min_preserved_chars.min(text_len);
        let keep = limit.saturating_sub(fixed).max(floor).min(text_len);

        let text = truncate_text(&message.text, keep);
        let rendered = render(&instructions, &header, &text);
        let size = rendered.chars().count();
        if size > limit {
            warn!(
                assistant = %assistant.name,
                size,
                limit,
                "Prompt exceeds backend limit even after truncation"
            );
            return Err(PromptError::PromptTooLarge { size, limit });
        }

        debug!(
            assistant = %assistant.name,
            original_chars = text_len,
            kept_chars = keep,
            limit,
            "Truncated message text to fit prompt limit"
        );

        Ok(EnhancedPrompt {
            message_section: join_section(&header, &text),
            instructions,
            rendered,
            truncated: true,
        })
    }
}

fn instructions(assistant: &AssistantConfig, message: &InboundMessage) -> String {
    let mut out = assistant.persona.clone();
    for line in enhance::apply(&assistant.enhancements, message) {
        out.push('\n');
        out.push_str(&line);
    }
    out
}

fn message_header(message: &InboundMessage) -> String {
    let sender = message.sender_address().unwrap_or("unknown sender");
    let from = match message.sender.as_ref().and_then(|s| s.name.as_deref()) {
        Some(name) if !name.trim().is_empty() => format!("{} <{sender}>", name.trim()),
        _ => sender.to_string(),
    };
    format!(
        "Reminder: you are replying to the sender ({sender}) of this email.\n\
         Subject: {}\n\
         From: {from}",
        message.subject_or_default()
    )
}

fn join_section(header: &str, text: &str) -> String {
    if text.is_empty() {
        header.to_string()
    } else {
        format!("{header}\n\n{text}")
    }
}

fn render(instructions: &str, header: &str, text: &str) -> String {
    format!("{instructions}\n\n{}", join_section(header, text))
}

/// Keep the first `keep` chars and append the marker on its own line.
fn truncate_text(text: &str, keep: usize) -> String {
    let cut = text
        .char_indices()
        .nth(keep)
        .map_or(text.len(), |(idx, _)| idx);
    format!("{}\n{TRUNCATION_MARKER}", &text[..cut])
}
