//! Outbound mail transports.
//!
//! SMTP and sendmail sends are blocking in `lettre`, so they run on
//! `spawn_blocking`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SendmailTransport, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::{Lookup, env_parse, env_var};
use crate::email::compose::OutboundMessage;
use crate::error::{ConfigError, TransportError};

/// Hands a composed reply to the outside world.
#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Builds the relay for an assistant that brings its own SMTP settings.
pub trait RelayFactory: Send + Sync {
    fn relay(&self, config: &SmtpConfig) -> Result<Arc<dyn MailTransport>, TransportError>;
}

// ── Configuration ───────────────────────────────────────────────────

const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 30;

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// TLS from the first byte (SMTPS).
    #[serde(alias = "tls", alias = "ssl")]
    Implicit,
    StartTls,
    /// Plain text, for a local relay only.
    #[serde(alias = "plain")]
    None,
}

impl SmtpSecurity {
    /// Port 465 means implicit TLS; anything else negotiates STARTTLS.
    pub fn for_port(port: u16) -> Self {
        if port == 465 {
            Self::Implicit
        } else {
            Self::StartTls
        }
    }
}

impl FromStr for SmtpSecurity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tls" | "implicit" | "ssl" => Ok(Self::Implicit),
            "starttls" => Ok(Self::StartTls),
            "none" | "plain" => Ok(Self::None),
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_ASSIST_SMTP_SECURITY".into(),
                message: format!("unknown security mode '{other}'"),
            }),
        }
    }
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub username: String,
    pub password: SecretString,
    pub timeout: Duration,
}

/// Per-assistant SMTP relay from the assistants file. Replies written by
/// that assistant go through this relay instead of the global transport.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantSmtp {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Defaults to implicit TLS on 465 and STARTTLS elsewhere.
    #[serde(default)]
    pub security: Option<SmtpSecurity>,
    #[serde(default)]
    pub username: String,
    #[serde(default, deserialize_with = "secret_string")]
    pub password: SecretString,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl AssistantSmtp {
    /// Credentials are never inherited from the global relay.
    pub fn to_config(&self) -> SmtpConfig {
        let port = self.port.unwrap_or(DEFAULT_SMTP_PORT);
        SmtpConfig {
            host: self.host.clone(),
            port,
            security: self.security.unwrap_or_else(|| SmtpSecurity::for_port(port)),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_SMTP_TIMEOUT_SECS)),
        }
    }
}

fn secret_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

/// Which transport delivers replies.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Smtp(SmtpConfig),
    /// Local MTA via `sendmail`; `None` uses the default binary.
    Sendmail(Option<String>),
    /// Dry run: write the message to stdout.
    Stdout,
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smtp(c) => write!(f, "smtp://{}:{}", c.host, c.port),
            Self::Sendmail(_) => f.write_str("sendmail"),
            Self::Stdout => f.write_str("stdout"),
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    /// `MAIL_ASSIST_TRANSPORT` selects `smtp`, `sendmail`, or `stdout`
    /// (default `stdout`).
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let kind = env_var(lookup, "MAIL_ASSIST_TRANSPORT")
            .unwrap_or_else(|| "stdout".to_string())
            .to_ascii_lowercase();

        match kind.as_str() {
            "stdout" | "dry-run" => Ok(Self::Stdout),
            "sendmail" => Ok(Self::Sendmail(env_var(lookup, "MAIL_ASSIST_SENDMAIL_COMMAND"))),
            "smtp" => {
                let host = env_var(lookup, "MAIL_ASSIST_SMTP_HOST")
                    .ok_or_else(|| ConfigError::MissingEnvVar("MAIL_ASSIST_SMTP_HOST".into()))?;
                let port: u16 = env_parse(lookup, "MAIL_ASSIST_SMTP_PORT", DEFAULT_SMTP_PORT)?;
                let security = match env_var(lookup, "MAIL_ASSIST_SMTP_SECURITY") {
                    Some(s) => s.parse()?,
                    None => SmtpSecurity::for_port(port),
                };
                let timeout_secs: u64 = env_parse(
                    lookup,
                    "MAIL_ASSIST_SMTP_TIMEOUT_SECS",
                    DEFAULT_SMTP_TIMEOUT_SECS,
                )?;
                Ok(Self::Smtp(SmtpConfig {
                    host,
                    port,
                    security,
                    username: env_var(lookup, "MAIL_ASSIST_SMTP_USERNAME").unwrap_or_default(),
                    password: SecretString::from(
                        env_var(lookup, "MAIL_ASSIST_SMTP_PASSWORD").unwrap_or_default(),
                    ),
                    timeout: Duration::from_secs(timeout_secs),
                }))
            }
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_ASSIST_TRANSPORT".into(),
                message: format!("unknown transport '{other}' (expected smtp, sendmail or stdout)"),
            }),
        }
    }
}

/// Build the configured transport.
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn MailTransport>, TransportError> {
    let transport: Arc<dyn MailTransport> = match config {
        TransportConfig::Smtp(smtp) => Arc::new(SmtpRelay::new(smtp)?),
        TransportConfig::Sendmail(command) => Arc::new(Sendmail::new(command.clone())),
        TransportConfig::Stdout => Arc::new(Stdout),
    };
    info!(transport = %config, "Mail transport ready");
    Ok(transport)
}

// ── SMTP ────────────────────────────────────────────────────────────

/// SMTP relay via `lettre`.
pub struct SmtpRelay {
    transport: SmtpTransport,
}

impl SmtpRelay {
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let relay_error = |e: lettre::transport::smtp::Error| TransportError::SendFailed {
            name: "smtp".into(),
            reason: format!("SMTP relay error: {e}"),
        };

        let builder = match config.security {
            SmtpSecurity::Implicit => SmtpTransport::relay(&config.host).map_err(relay_error)?,
            SmtpSecurity::StartTls => {
                SmtpTransport::starttls_relay(&config.host).map_err(relay_error)?
            }
            SmtpSecurity::None => SmtpTransport::builder_dangerous(&config.host),
        };

        let mut builder = builder.port(config.port).timeout(Some(config.timeout));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

/// Real SMTP relays for assistants with their own settings.
pub struct SmtpRelays;

impl RelayFactory for SmtpRelays {
    fn relay(&self, config: &SmtpConfig) -> Result<Arc<dyn MailTransport>, TransportError> {
        info!(host = %config.host, port = config.port, "Assistant SMTP relay ready");
        Ok(Arc::new(SmtpRelay::new(config)?))
    }
}

#[async_trait]
impl MailTransport for SmtpRelay {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let email = message.message().clone();
        let to = message.to.address.clone();

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| TransportError::SendFailed {
                name: "smtp".into(),
                reason: format!("send task failed: {e}"),
            })?
            .map_err(|e| TransportError::SendFailed {
                name: "smtp".into(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        info!(to = %to, "Reply sent via SMTP");
        Ok(())
    }
}

// ── Sendmail ────────────────────────────────────────────────────────

/// Local MTA via the `sendmail` command.
pub struct Sendmail {
    transport: SendmailTransport,
}

impl Sendmail {
    pub fn new(command: Option<String>) -> Self {
        let transport = match command {
            Some(cmd) => SendmailTransport::new_with_command(cmd),
            None => SendmailTransport::new(),
        };
        Self { transport }
    }
}

#[async_trait]
impl MailTransport for Sendmail {
    fn name(&self) -> &str {
        "sendmail"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let email = message.message().clone();
        let to = message.to.address.clone();

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| TransportError::SendFailed {
                name: "sendmail".into(),
                reason: format!("send task failed: {e}"),
            })?
            .map_err(|e| TransportError::SendFailed {
                name: "sendmail".into(),
                reason: e.to_string(),
            })?;

        info!(to = %to, "Reply handed to sendmail");
        Ok(())
    }
}

// ── Stdout ──────────────────────────────────────────────────────────

/// Dry run: prints the formatted message instead of sending it.
pub struct Stdout;

/// In a dry run assistant relays print too.
impl RelayFactory for Stdout {
    fn relay(&self, _config: &SmtpConfig) -> Result<Arc<dyn MailTransport>, TransportError> {
        Ok(Arc::new(Stdout))
    }
}

#[async_trait]
impl MailTransport for Stdout {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut out = tokio::io::stdout();
        out.write_all(&message.formatted()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        info!(to = %message.to.address, "Reply written to stdout (dry run)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<TransportConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TransportConfig::from_lookup(&|k: &str| vars.get(k).cloned())
    }

    #[test]
    fn defaults_to_stdout() {
        assert!(matches!(config(&[]).unwrap(), TransportConfig::Stdout));
    }

    #[test]
    fn smtp_security_follows_port() {
        let TransportConfig::Smtp(smtp) = config(&[
            ("MAIL_ASSIST_TRANSPORT", "smtp"),
            ("MAIL_ASSIST_SMTP_HOST", "smtp.example.com"),
            ("MAIL_ASSIST_SMTP_PORT", "465"),
        ])
        .unwrap() else {
            panic!("expected smtp config");
        };
        assert_eq!(smtp.security, SmtpSecurity::Implicit);

        let TransportConfig::Smtp(smtp) = config(&[
            ("MAIL_ASSIST_TRANSPORT", "smtp"),
            ("MAIL_ASSIST_SMTP_HOST", "smtp.example.com"),
        ])
        .unwrap() else {
            panic!("expected smtp config");
        };
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.security, SmtpSecurity::StartTls);
    }

    #[test]
    fn explicit_security_override() {
        let TransportConfig::Smtp(smtp) = config(&[
            ("MAIL_ASSIST_TRANSPORT", "smtp"),
            ("MAIL_ASSIST_SMTP_HOST", "localhost"),
            ("MAIL_ASSIST_SMTP_PORT", "25"),
            ("MAIL_ASSIST_SMTP_SECURITY", "none"),
        ])
        .unwrap() else {
            panic!("expected smtp config");
        };
        assert_eq!(smtp.security, SmtpSecurity::None);
    }

    #[test]
    fn smtp_requires_host() {
        let err = config(&[("MAIL_ASSIST_TRANSPORT", "smtp")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn unknown_transport_rejected() {
        assert!(config(&[("MAIL_ASSIST_TRANSPORT", "pigeon")]).is_err());
    }

    #[test]
    fn assistant_smtp_defaults_and_secret() {
        let relay: AssistantSmtp = serde_json::from_str(
            r#"{"host": "smtp.sales.example", "username": "sales", "password": "hunter2"}"#,
        )
        .unwrap();
        let smtp = relay.to_config();
        assert_eq!(smtp.host, "smtp.sales.example");
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.security, SmtpSecurity::StartTls);
        assert_eq!(smtp.timeout, Duration::from_secs(30));
        assert_eq!(smtp.password.expose_secret(), "hunter2");
        assert!(!format!("{relay:?}").contains("hunter2"));

        let relay: AssistantSmtp =
            serde_json::from_str(r#"{"host": "mx.example", "port": 465}"#).unwrap();
        assert_eq!(relay.to_config().security, SmtpSecurity::Implicit);

        let relay: AssistantSmtp =
            serde_json::from_str(r#"{"host": "localhost", "port": 25, "security": "plain"}"#)
                .unwrap();
        assert_eq!(relay.to_config().security, SmtpSecurity::None);
    }

    #[test]
    fn creates_each_transport() {
        let smtp = SmtpConfig {
            host: "localhost".into(),
            port: 2525,
            security: SmtpSecurity::None,
            username: String::new(),
            password: SecretString::from(""),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            create_transport(&TransportConfig::Smtp(smtp)).unwrap().name(),
            "smtp"
        );
        assert_eq!(
            create_transport(&TransportConfig::Sendmail(None)).unwrap().name(),
            "sendmail"
        );
        assert_eq!(
            create_transport(&TransportConfig::Stdout).unwrap().name(),
            "stdout"
        );
    }
}
