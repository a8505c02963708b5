//! Sender rules: skip automated mail before any AI call.
//!
//! Runs after parsing to short-circuit messages that must never be answered:
//! - noreply/no-reply senders
//! - mailer-daemon, postmaster and other daemon senders
//! - mail that is itself an auto-reply (`Auto-Submitted`, `Precedence`)
//! - the assistants' own addresses (reply loops)

use regex::Regex;
use tracing::debug;

use crate::assistants::AssistantRegistry;
use crate::email::types::InboundMessage;

/// Which field a rule matches against.
#[derive(Debug, Clone)]
pub enum RuleField {
    Sender,
    Subject,
    /// A header value, looked up case-insensitively.
    Header(String),
}

/// A single skip rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct SkipRule {
    /// Human-readable pattern description.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    /// Why this rule triggers.
    pub reason: String,
}

/// Why a message was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipReason {
    pub rule: String,
    pub reason: String,
}

/// Pre-AI sender rules.
#[derive(Debug, Clone)]
pub struct SenderRules {
    skip_rules: Vec<SkipRule>,
    /// Senders that bypass the skip rules (but never the own-address check).
    allow_patterns: Vec<Regex>,
}

const DEFAULT_RULES: &[(&str, &str, &str)] = &[
    ("noreply@*", r"(?i)^no[\-_.]?reply@", "noreply sender"),
    (
        "*daemon@*",
        r"(?i)^([a-z0-9._\-]*daemon|postmaster)@",
        "automated mail system",
    ),
    ("bounces@*", r"(?i)^bounces?[+\-@]", "bounce address"),
];

impl SenderRules {
    /// Rules engine with the default skip patterns.
    pub fn default_rules() -> Result<Self, regex::Error> {
        let mut rules = Self::empty();
        for (pattern, regex, reason) in DEFAULT_RULES {
            rules.skip_rules.push(SkipRule {
                pattern: (*pattern).to_string(),
                regex: Regex::new(regex)?,
                field: RuleField::Sender,
                reason: (*reason).to_string(),
            });
        }
        // RFC 3834: anything other than "no" marks automatic mail.
        rules.add_skip_rule(
            r"(?i)^\s*(auto-generated|auto-replied|auto-notified)",
            RuleField::Header("Auto-Submitted".into()),
            "auto-submitted message",
        )?;
        rules.add_skip_rule(
            r"(?i)^\s*(bulk|junk|list)\s*$",
            RuleField::Header("Precedence".into()),
            "bulk precedence",
        )?;
        Ok(rules)
    }

    /// Create an empty rules engine (for testing).
    pub fn empty() -> Self {
        Self {
            skip_rules: Vec::new(),
            allow_patterns: Vec::new(),
        }
    }

    /// Add a sender pattern that bypasses skip rules.
    pub fn add_allow(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.allow_patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Add a custom skip rule.
    pub fn add_skip_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.skip_rules.push(SkipRule {
            pattern: pattern.into(),
            regex: Regex::new(pattern)?,
            field,
            reason: reason.into(),
        });
        Ok(())
    }

    /// Evaluate a message.
    ///
    /// Returns `Some(SkipReason)` when the message must not be answered.
    pub fn evaluate(
        &self,
        message: &InboundMessage,
        registry: &AssistantRegistry,
    ) -> Option<SkipReason> {
        let sender = message
            .sender
            .as_ref()
            .map(|s| s.address.trim())
            .unwrap_or_default();

        if !sender.is_empty() && registry.is_own_address(sender) {
            debug!(sender = %sender, "Sender is one of our own addresses");
            return Some(SkipReason {
                rule: "own address".into(),
                reason: "message sent by an assistant address".into(),
            });
        }

        if self.allow_patterns.iter().any(|r| r.is_match(sender)) {
            debug!(sender = %sender, "Sender matches allow pattern, bypassing rules");
            return None;
        }

        for rule in &self.skip_rules {
            let value = match &rule.field {
                RuleField::Sender => Some(sender),
                RuleField::Subject => message.subject.as_deref(),
                RuleField::Header(name) => message.headers.get(name),
            };
            let Some(value) = value else {
                continue;
            };

            if rule.regex.is_match(value) {
                debug!(
                    sender = %sender,
                    rule = %rule.pattern,
                    reason = %rule.reason,
                    "Message matched skip rule"
                );
                return Some(SkipReason {
                    rule: rule.pattern.clone(),
                    reason: rule.reason.clone(),
                });
            }
        }

        None
    }
}
