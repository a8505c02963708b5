//! Assistant registry: which persona answers which recipient.
//!
//! The registry is an ordered, immutable list built once at startup.
//! Resolution is a pure function of the registry and the message.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::email::compose::QuotePolicy;
use crate::email::transport::AssistantSmtp;
use crate::email::types::InboundMessage;
use crate::error::{ConfigError, RegistryError};
use crate::prompt::enhance::Enhancement;

/// How an assistant claims inbound mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// Exact, case-insensitive recipient addresses.
    Addresses(Vec<String>),
    /// Answers anything nobody else claims.
    CatchAll,
}

/// One configured assistant persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    pub name: String,
    #[serde(rename = "match")]
    pub match_rule: MatchRule,
    /// Persona instructions placed at the top of every prompt.
    #[serde(alias = "prompt")]
    pub persona: String,
    #[serde(default)]
    pub enhancements: Vec<Enhancement>,
    /// Address replies are sent from. Defaults to the matched recipient.
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Also render an HTML alternative part.
    #[serde(default)]
    pub html_reply: bool,
    #[serde(default)]
    pub quote_policy: Option<QuotePolicy>,
    /// Own SMTP relay; replies go through the global transport otherwise.
    #[serde(default, skip_serializing)]
    pub smtp: Option<AssistantSmtp>,
}

impl AssistantConfig {
    pub fn is_catch_all(&self) -> bool {
        self.match_rule == MatchRule::CatchAll
    }

    /// Whether this assistant claims `address`.
    pub fn claims(&self, address: &str) -> bool {
        match &self.match_rule {
            MatchRule::Addresses(list) => list
                .iter()
                .any(|a| a.trim().eq_ignore_ascii_case(address.trim())),
            MatchRule::CatchAll => false,
        }
    }
}

/// A resolved assistant together with the recipient it matched on.
#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    pub assistant: &'a AssistantConfig,
    /// `None` when the catch-all answered.
    pub matched_recipient: Option<&'a str>,
}

/// Ordered, read-only assistant registry.
#[derive(Debug, Clone)]
pub struct AssistantRegistry {
    assistants: Vec<AssistantConfig>,
    default_assistant: Option<String>,
}

impl AssistantRegistry {
    /// Build and validate a registry.
    ///
    /// Names must be non-empty and unique, at least one assistant must exist,
    /// and `default_assistant` (if set) must name a registered assistant.
    pub fn new(
        assistants: Vec<AssistantConfig>,
        default_assistant: Option<String>,
    ) -> Result<Self, ConfigError> {
        if assistants.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "assistants".into(),
                message: "at least one assistant must be configured".into(),
            });
        }

        let mut seen: Vec<&str> = Vec::with_capacity(assistants.len());
        for assistant in &assistants {
            let name = assistant.name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "assistants".into(),
                    message: "assistant name must not be empty".into(),
                });
            }
            if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                return Err(ConfigError::InvalidValue {
                    key: "assistants".into(),
                    message: format!("duplicate assistant name '{name}'"),
                });
            }
            if assistant.persona.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("assistants.{name}.persona"),
                    message: "persona must not be empty".into(),
                });
            }
            seen.push(name);
        }

        if let Some(default) = default_assistant.as_deref()
            && !assistants.iter().any(|a| a.name == default)
        {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_ASSIST_DEFAULT_ASSISTANT".into(),
                message: format!("no assistant named '{default}'"),
            });
        }

        Ok(Self {
            assistants,
            default_assistant,
        })
    }

    pub fn assistants(&self) -> &[AssistantConfig] {
        &self.assistants
    }

    pub fn get(&self, name: &str) -> Option<&AssistantConfig> {
        self.assistants.iter().find(|a| a.name == name)
    }

    /// Pick the assistant for a message.
    ///
    /// Recipients are tried in header order; for each, the registry is scanned
    /// in order, so the first-registered assistant wins a collision.
    pub fn resolve<'a>(
        &'a self,
        message: &'a InboundMessage,
    ) -> Result<Resolution<'a>, RegistryError> {
        for recipient in &message.recipients {
            if let Some(assistant) = self.assistants.iter().find(|a| a.claims(recipient)) {
                debug!(
                    assistant = %assistant.name,
                    recipient = %recipient,
                    "Resolved assistant by recipient"
                );
                return Ok(Resolution {
                    assistant,
                    matched_recipient: Some(recipient.as_str()),
                });
            }
        }

        if let Some(assistant) = self.fallback() {
            debug!(assistant = %assistant.name, "Resolved catch-all assistant");
            return Ok(Resolution {
                assistant,
                matched_recipient: None,
            });
        }

        Err(RegistryError::NoAssistantMatched {
            recipients: message.recipients.join(", "),
        })
    }

    fn fallback(&self) -> Option<&AssistantConfig> {
        self.default_assistant
            .as_deref()
            .and_then(|name| self.get(name))
            .or_else(|| self.assistants.iter().find(|a| a.is_catch_all()))
    }

    /// Whether `address` is one the assistants send from or listen on.
    pub fn is_own_address(&self, address: &str) -> bool {
        let address = address.trim();
        self.assistants.iter().any(|a| {
            a.claims(address)
                || a.sender
                    .as_deref()
                    .is_some_and(|s| s.trim().eq_ignore_ascii_case(address))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::types::{RawHeaders, TextSource};

    fn assistant(name: &str, rule: MatchRule) -> AssistantConfig {
        AssistantConfig {
            name: name.into(),
            match_rule: rule,
            persona: format!("You are {name}."),
            enhancements: vec![],
            sender: None,
            display_name: None,
            html_reply: false,
            quote_policy: None,
            smtp: None,
        }
    }

    fn addresses(list: &[&str]) -> MatchRule {
        MatchRule::Addresses(list.iter().map(|s| s.to_string()).collect())
    }

    fn message_to(recipients: &[&str]) -> InboundMessage {
        InboundMessage {
            sender: None,
            reply_to: None,
            recipients: recipients.iter().map(|s| s.to_string()).collect(),
            subject: None,
            message_id: None,
            in_reply_to: vec![],
            references: vec![],
            date: None,
            parts: vec![],
            headers: RawHeaders::new(),
            text: String::new(),
            text_source: TextSource::Empty,
        }
    }

    #[test]
    fn resolves_by_exact_recipient_case_insensitive() {
        let registry = AssistantRegistry::new(
            vec![
                assistant("support", addresses(&["support@y.com"])),
                assistant("sales", addresses(&["sales@y.com"])),
            ],
            None,
        )
        .unwrap();

        let msg = message_to(&["Sales@Y.com"]);
        let res = registry.resolve(&msg).unwrap();
        assert_eq!(res.assistant.name, "sales");
        assert_eq!(res.matched_recipient, Some("Sales@Y.com"));
    }

    #[test]
    fn first_registered_wins_on_collision() {
        let registry = AssistantRegistry::new(
            vec![
                assistant("first", addresses(&["bot@y.com"])),
                assistant("second", addresses(&["bot@y.com"])),
            ],
            None,
        )
        .unwrap();

        let msg = message_to(&["bot@y.com"]);
        for _ in 0..3 {
            assert_eq!(registry.resolve(&msg).unwrap().assistant.name, "first");
        }
    }

    #[test]
    fn earlier_recipient_wins_over_registry_order() {
        let registry = AssistantRegistry::new(
            vec![
                assistant("a", addresses(&["a@y.com"])),
                assistant("b", addresses(&["b@y.com"])),
            ],
            None,
        )
        .unwrap();

        let msg = message_to(&["b@y.com", "a@y.com"]);
        assert_eq!(registry.resolve(&msg).unwrap().assistant.name, "b");
    }

    #[test]
    fn catch_all_used_when_nothing_matches() {
        let registry = AssistantRegistry::new(
            vec![
                assistant("support", addresses(&["support@y.com"])),
                assistant("general", MatchRule::CatchAll),
            ],
            None,
        )
        .unwrap();

        let msg = message_to(&["random@y.com"]);
        let res = registry.resolve(&msg).unwrap();
        assert_eq!(res.assistant.name, "general");
        assert!(res.matched_recipient.is_none());
    }

    #[test]
    fn default_assistant_overrides_catch_all_order() {
        let registry = AssistantRegistry::new(
            vec![
                assistant("general", MatchRule::CatchAll),
                assistant("support", addresses(&["support@y.com"])),
            ],
            Some("support".into()),
        )
        .unwrap();

        let msg = message_to(&["random@y.com"]);
        let res = registry.resolve(&msg).unwrap();
        assert_eq!(res.assistant.name, "support");
    }

    #[test]
    fn no_match_without_catch_all() {
        let registry = AssistantRegistry::new(
            vec![assistant("support", addresses(&["support@y.com"]))],
            None,
        )
        .unwrap();

        let err = registry.resolve(&message_to(&["other@y.com"])).unwrap_err();
        assert!(matches!(err, RegistryError::NoAssistantMatched { .. }));
        assert!(err.to_string().contains("other@y.com"));
    }

    #[test]
    fn rejects_invalid_registries() {
        assert!(AssistantRegistry::new(vec![], None).is_err());

        let dupes = vec![
            assistant("bot", MatchRule::CatchAll),
            assistant("Bot", addresses(&["x@y.com"])),
        ];
        assert!(AssistantRegistry::new(dupes, None).is_err());

        let unknown_default = vec![assistant("bot", MatchRule::CatchAll)];
        assert!(AssistantRegistry::new(unknown_default, Some("ghost".into())).is_err());
    }

    #[test]
    fn own_addresses_include_sender_override() {
        let mut bot = assistant("bot", addresses(&["bot@y.com"]));
        bot.sender = Some("replies@y.com".into());
        let registry = AssistantRegistry::new(vec![bot], None).unwrap();

        assert!(registry.is_own_address("BOT@y.com"));
        assert!(registry.is_own_address("replies@y.com"));
        assert!(!registry.is_own_address("alice@x.com"));
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"[
            {
                "name": "support",
                "match": {"addresses": ["support@y.com"]},
                "prompt": "You are a helpful support agent.",
                "enhancements": [{"type": "tone", "tone": "friendly"}],
                "html_reply": true
            },
            {
                "name": "general",
                "match": "catch_all",
                "persona": "You answer everything.",
                "quote_policy": "quote_original",
                "smtp": {"host": "smtp.general.example", "port": 465, "username": "general", "password": "s3cret"}
            }
        ]"#;
        let assistants: Vec<AssistantConfig> = serde_json::from_str(json).unwrap();
        assert_eq!(assistants[0].persona, "You are a helpful support agent.");
        assert!(assistants[0].html_reply);
        assert_eq!(assistants[0].enhancements.len(), 1);
        assert!(assistants[1].is_catch_all());
        assert_eq!(assistants[1].quote_policy, Some(QuotePolicy::QuoteOriginal));
        assert!(assistants[0].smtp.is_none());
        let smtp = assistants[1].smtp.as_ref().unwrap().to_config();
        assert_eq!(smtp.host, "smtp.general.example");
        assert_eq!(smtp.username, "general");
        assert!(!format!("{:?}", assistants[1]).contains("s3cret"));
    }
}
