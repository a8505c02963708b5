//! Configuration: environment variables plus the assistants file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::assistants::{AssistantConfig, AssistantRegistry};
use crate::email::compose::QuotePolicy;
use crate::email::parser::ParserOptions;
use crate::email::transport::TransportConfig;
use crate::error::ConfigError;
use crate::llm::LlmConfig;
use crate::pipeline::rules::{RuleField, SenderRules};
use crate::prompt::builder::DEFAULT_MIN_PRESERVED_CHARS;

/// Environment lookup. `std::env::var` in production, a map in tests.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// A trimmed, non-empty variable.
pub fn env_var(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, falling back to `default` when unset.
pub fn env_parse<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(lookup, key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

/// `1/true/yes/on` or `0/false/no/off`.
pub fn env_flag(lookup: Lookup<'_>, key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = env_var(lookup, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' is not a boolean"),
        }),
    }
}

/// Comma-separated list, empty entries dropped.
fn env_list(lookup: Lookup<'_>, key: &str) -> Vec<String> {
    env_var(lookup, key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Everything one invocation reads from its environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub assistants_path: PathBuf,
    /// Overrides `default_assistant` from the assistants file.
    pub default_assistant: Option<String>,
    pub quote_policy: QuotePolicy,
    pub min_preserved_chars: usize,
    /// Fail with `UnsupportedEncoding` instead of the windows-1252 fallback.
    pub strict_charset: bool,
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,
    /// Daily-rotated log file directory.
    pub log_dir: Option<PathBuf>,
    /// Sender regexes that bypass the automated-sender rules.
    pub allow_senders: Vec<String>,
    /// Extra sender regexes that are never answered.
    pub ignore_senders: Vec<String>,
    pub llm: LlmConfig,
    pub transport: TransportConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let quote_policy = match env_var(lookup, "MAIL_ASSIST_QUOTE_POLICY") {
            Some(raw) => raw.parse()?,
            None => QuotePolicy::default(),
        };
        let webhook_timeout_secs: u64 =
            env_parse(lookup, "MAIL_ASSIST_WEBHOOK_TIMEOUT_SECS", 5)?;

        Ok(Self {
            assistants_path: env_var(lookup, "MAIL_ASSIST_ASSISTANTS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./assistants.json")),
            default_assistant: env_var(lookup, "MAIL_ASSIST_DEFAULT_ASSISTANT"),
            quote_policy,
            min_preserved_chars: env_parse(
                lookup,
                "MAIL_ASSIST_MIN_PRESERVED_CHARS",
                DEFAULT_MIN_PRESERVED_CHARS,
            )?,
            strict_charset: env_flag(lookup, "MAIL_ASSIST_STRICT_CHARSET", false)?,
            webhook_url: env_var(lookup, "MAIL_ASSIST_WEBHOOK_URL"),
            webhook_timeout: Duration::from_secs(webhook_timeout_secs),
            log_dir: env_var(lookup, "MAIL_ASSIST_LOG_DIR").map(PathBuf::from),
            allow_senders: env_list(lookup, "MAIL_ASSIST_ALLOW_SENDERS"),
            ignore_senders: env_list(lookup, "MAIL_ASSIST_IGNORE_SENDERS"),
            llm: LlmConfig::from_lookup(lookup)?,
            transport: TransportConfig::from_lookup(lookup)?,
        })
    }

    pub fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            permissive_charset_fallback: !self.strict_charset,
        }
    }

    /// Default automated-sender rules plus the configured allow and ignore
    /// patterns.
    pub fn sender_rules(&self) -> Result<SenderRules, ConfigError> {
        let invalid = |key: &str, e: regex::Error| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        };

        let mut rules = SenderRules::default_rules().map_err(|e| invalid("sender rules", e))?;
        for pattern in &self.allow_senders {
            rules
                .add_allow(pattern)
                .map_err(|e| invalid("MAIL_ASSIST_ALLOW_SENDERS", e))?;
        }
        for pattern in &self.ignore_senders {
            rules
                .add_skip_rule(pattern, RuleField::Sender, "ignored sender")
                .map_err(|e| invalid("MAIL_ASSIST_IGNORE_SENDERS", e))?;
        }
        Ok(rules)
    }

    /// Load and validate the assistants file.
    pub fn load_registry(&self) -> Result<AssistantRegistry, ConfigError> {
        let file = load_assistants(&self.assistants_path)?;
        let default_assistant = self.default_assistant.clone().or(file.default_assistant);
        let registry = AssistantRegistry::new(file.assistants, default_assistant)?;
        info!(
            path = %self.assistants_path.display(),
            count = registry.assistants().len(),
            "Assistants loaded"
        );
        Ok(registry)
    }
}

/// Parsed assistants file.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantsFile {
    #[serde(default)]
    pub default_assistant: Option<String>,
    pub assistants: Vec<AssistantConfig>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AssistantsDocument {
    Wrapped(AssistantsFile),
    List(Vec<AssistantConfig>),
}

/// Read an assistants file: either `{"default_assistant": .., "assistants": [..]}`
/// or a bare array. Order is preserved.
pub fn load_assistants(path: &Path) -> Result<AssistantsFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::ParseError(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_assistants(&raw)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
}

pub fn parse_assistants(raw: &str) -> Result<AssistantsFile, serde_json::Error> {
    Ok(match serde_json::from_str(raw)? {
        AssistantsDocument::Wrapped(file) => file,
        AssistantsDocument::List(assistants) => AssistantsFile {
            default_assistant: None,
            assistants,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use crate::assistants::MatchRule;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let mut vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.entry("ANTHROPIC_API_KEY".into())
            .or_insert_with(|| "sk-test".into());
        Settings::from_lookup(&|k: &str| vars.get(k).cloned())
    }

    const ASSISTANTS: &str = r#"{
        "default_assistant": "general",
        "assistants": [
            {
                "name": "support",
                "match": {"addresses": ["support@y.com"]},
                "persona": "You are the support desk.",
                "enhancements": [{"type": "max_words", "limit": 150}],
                "quote_policy": "quote_original"
            },
            {
                "name": "general",
                "match": "catch_all",
                "prompt": "You answer general questions."
            }
        ]
    }"#;

    // ── Env helper tests ────────────────────────────────────────────

    #[test]
    fn env_helpers_trim_and_parse() {
        let vars: HashMap<&str, &str> =
            HashMap::from([("A", "  42 "), ("B", "   "), ("C", "abc"), ("D", "yes")]);
        let lookup = |k: &str| vars.get(k).map(|v| v.to_string());

        assert_eq!(env_var(&lookup, "A").as_deref(), Some("42"));
        assert_eq!(env_var(&lookup, "B"), None);
        assert_eq!(env_parse(&lookup, "A", 0u32).unwrap(), 42);
        assert_eq!(env_parse(&lookup, "MISSING", 7u32).unwrap(), 7);
        assert!(matches!(
            env_parse(&lookup, "C", 0u32),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(env_flag(&lookup, "D", false).unwrap());
        assert!(env_flag(&lookup, "C", false).is_err());
    }

    // ── Settings tests ──────────────────────────────────────────────

    #[test]
    fn defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.assistants_path, PathBuf::from("./assistants.json"));
        assert_eq!(s.quote_policy, QuotePolicy::NoQuote);
        assert_eq!(s.min_preserved_chars, DEFAULT_MIN_PRESERVED_CHARS);
        assert!(s.parser_options().permissive_charset_fallback);
        assert!(s.webhook_url.is_none());
        assert!(matches!(s.transport, TransportConfig::Stdout));
    }

    #[test]
    fn overrides() {
        let s = settings(&[
            ("MAIL_ASSIST_QUOTE_POLICY", "quote-original"),
            ("MAIL_ASSIST_STRICT_CHARSET", "true"),
            ("MAIL_ASSIST_ALLOW_SENDERS", "^noreply@vip\\.com$, "),
            ("MAIL_ASSIST_WEBHOOK_URL", "https://hooks.example.com/x"),
        ])
        .unwrap();
        assert_eq!(s.quote_policy, QuotePolicy::QuoteOriginal);
        assert!(!s.parser_options().permissive_charset_fallback);
        assert_eq!(s.allow_senders, vec!["^noreply@vip\\.com$"]);
        assert!(s.webhook_url.is_some());
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(settings(&[("MAIL_ASSIST_QUOTE_POLICY", "sometimes")]).is_err());
        assert!(settings(&[("MAIL_ASSIST_MIN_PRESERVED_CHARS", "-3")]).is_err());
    }

    #[test]
    fn bad_sender_pattern_is_config_error() {
        let s = settings(&[("MAIL_ASSIST_IGNORE_SENDERS", "([")]).unwrap();
        assert!(matches!(
            s.sender_rules(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    // ── Assistants file tests ───────────────────────────────────────

    #[test]
    fn parses_wrapped_file_in_order() {
        let file = parse_assistants(ASSISTANTS).unwrap();
        assert_eq!(file.default_assistant.as_deref(), Some("general"));
        let names: Vec<_> = file.assistants.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["support", "general"]);
        assert_eq!(file.assistants[1].match_rule, MatchRule::CatchAll);
        assert_eq!(file.assistants[1].persona, "You answer general questions.");
        assert_eq!(
            file.assistants[0].quote_policy,
            Some(QuotePolicy::QuoteOriginal)
        );
    }

    #[test]
    fn parses_bare_list() {
        let file = parse_assistants(
            r#"[{"name": "a", "match": {"addresses": ["a@y.com"]}, "persona": "A."}]"#,
        )
        .unwrap();
        assert!(file.default_assistant.is_none());
        assert_eq!(file.assistants.len(), 1);
    }

    #[test]
    fn loads_registry_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(ASSISTANTS.as_bytes()).unwrap();

        let s = settings(&[("MAIL_ASSIST_ASSISTANTS", tmp.path().to_str().unwrap())]).unwrap();
        let registry = s.load_registry().unwrap();
        assert_eq!(registry.assistants().len(), 2);
        assert!(registry.get("support").is_some());
    }

    #[test]
    fn duplicate_names_fail_validation() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(
            br#"[
                {"name": "a", "match": "catch_all", "persona": "A."},
                {"name": "A", "match": "catch_all", "persona": "B."}
            ]"#,
        )
        .unwrap();

        let s = settings(&[("MAIL_ASSIST_ASSISTANTS", tmp.path().to_str().unwrap())]).unwrap();
        assert!(s.load_registry().is_err());
    }

    #[test]
    fn missing_file_is_parse_error() {
        let s = settings(&[("MAIL_ASSIST_ASSISTANTS", "/nonexistent/assistants.json")]).unwrap();
        assert!(matches!(
            s.load_registry(),
            Err(ConfigError::ParseError(_))
        ));
    }
}
