//! Run events: one structured record per invocation.
//!
//! Sinks never fail the run. A sink that cannot deliver logs a warning and
//! moves on.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::pipeline::state::Stage;

/// Longest redacted excerpt carried by an event.
pub const EXCERPT_MAX_CHARS: usize = 120;

/// Longest reply excerpt shown in webhook embeds.
const REPLY_EXCERPT_MAX_CHARS: usize = 250;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Replied,
    Skipped,
    Failed,
}

/// The structured record emitted once per run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    /// Stage that failed, for failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant: Option<String>,
    /// Redacted sender address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Redacted excerpt of the inbound text.
    pub excerpt: String,
    /// Redacted excerpt of the generated reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub prompt_truncated: bool,
    pub elapsed_ms: u64,
}

impl PipelineEvent {
    pub fn new(run_id: Uuid, outcome: Outcome) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            outcome,
            stage: None,
            error_kind: None,
            error: None,
            assistant: None,
            sender: None,
            subject: None,
            excerpt: String::new(),
            reply_excerpt: None,
            skip_reason: None,
            prompt_truncated: false,
            elapsed_ms: 0,
        }
    }
}

/// Receives the per-run event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &PipelineEvent);
}

// ── Redaction ───────────────────────────────────────────────────────

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9._%+\-]+)@([A-Za-z0-9.\-]+\.[A-Za-z]{2,})")
        .expect("email address pattern is valid")
});

/// Mask the local part of every email address in `text`.
pub fn redact_addresses(text: &str) -> String {
    EMAIL_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let local = &caps[1];
            let first: String = local.chars().take(1).collect();
            format!("{first}***@{}", &caps[2])
        })
        .into_owned()
}

/// Redact addresses, collapse whitespace, and cap at `max_chars`.
pub fn redacted_excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let redacted = redact_addresses(&collapsed);
    if redacted.chars().count() <= max_chars {
        return redacted;
    }
    let mut out: String = redacted.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

// ── Sinks ───────────────────────────────────────────────────────────

/// Emits the event as a structured `tracing` record.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn record(&self, event: &PipelineEvent) {
        let error_kind = event.error_kind.map(|k| k.as_str()).unwrap_or("-");
        let stage = event.stage.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
        match event.outcome {
            Outcome::Failed => warn!(
                run_id = %event.run_id,
                outcome = "failed",
                stage = %stage,
                error_kind,
                error = event.error.as_deref().unwrap_or("-"),
                assistant = event.assistant.as_deref().unwrap_or("-"),
                sender = event.sender.as_deref().unwrap_or("-"),
                excerpt = %event.excerpt,
                elapsed_ms = event.elapsed_ms,
                "Pipeline run failed"
            ),
            Outcome::Skipped => info!(
                run_id = %event.run_id,
                outcome = "skipped",
                reason = event.skip_reason.as_deref().unwrap_or("-"),
                sender = event.sender.as_deref().unwrap_or("-"),
                elapsed_ms = event.elapsed_ms,
                "Pipeline run skipped"
            ),
            Outcome::Replied => info!(
                run_id = %event.run_id,
                outcome = "replied",
                assistant = event.assistant.as_deref().unwrap_or("-"),
                sender = event.sender.as_deref().unwrap_or("-"),
                prompt_truncated = event.prompt_truncated,
                elapsed_ms = event.elapsed_ms,
                "Pipeline run replied"
            ),
        }
    }
}

/// Posts a Discord-style embed to a webhook URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }

    /// Discord webhook payload for an event.
    pub fn payload(event: &PipelineEvent) -> serde_json::Value {
        let assistant = event.assistant.as_deref().unwrap_or("unassigned");
        let subject = event.subject.as_deref().unwrap_or("No subject");
        let sender = event.sender.as_deref().unwrap_or("unknown sender");

        let (title, description, color, detail) = match event.outcome {
            Outcome::Replied => (
                format!("New response from {assistant}"),
                format!("{assistant} replied to an email from **{sender}**"),
                0x2196F3,
                (
                    "Response",
                    event
                        .reply_excerpt
                        .clone()
                        .unwrap_or_else(|| "No response".into()),
                ),
            ),
            Outcome::Skipped => (
                "Email skipped".to_string(),
                format!("Automated email from **{sender}** was not answered"),
                0x9E9E9E,
                (
                    "Reason",
                    event.skip_reason.clone().unwrap_or_else(|| "-".into()),
                ),
            ),
            Outcome::Failed => (
                format!(
                    "Run failed: {}",
                    event.error_kind.map(|k| k.as_str()).unwrap_or("unknown")
                ),
                format!(
                    "Failed while {} an email from **{sender}**",
                    event.stage.map(|s| s.to_string()).unwrap_or_else(|| "processing".into())
                ),
                0xF44336,
                ("Error", event.error.clone().unwrap_or_else(|| "-".into())),
            ),
        };

        json!({
            "content": format!(
                "📧 **Email {}** | {}",
                match event.outcome {
                    Outcome::Replied => "answered",
                    Outcome::Skipped => "skipped",
                    Outcome::Failed => "failed",
                },
                event.timestamp.format("%d/%m/%Y %H:%M:%S")
            ),
            "embeds": [{
                "title": title,
                "description": description,
                "color": color,
                "fields": [
                    {"name": "Subject", "value": subject, "inline": true},
                    {"name": "Assistant", "value": assistant, "inline": true},
                    {"name": detail.0, "value": detail.1},
                ],
                "timestamp": event.timestamp.to_rfc3339(),
            }],
        })
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn record(&self, event: &PipelineEvent) {
        let payload = Self::payload(event);
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(run_id = %event.run_id, "Event posted to webhook");
            }
            Ok(resp) => {
                let status = resp.status();
                warn!(run_id = %event.run_id, %status, "Webhook rejected event");
            }
            Err(e) => {
                warn!(run_id = %event.run_id, error = %e, "Failed to post event to webhook");
            }
        }
    }
}

/// Forwards each event to every inner sink, in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn record(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            sink.record(event).await;
        }
    }
}

/// Clamp a reply for the webhook embed.
pub(crate) fn reply_excerpt(reply: &str) -> String {
    redacted_excerpt(reply, REPLY_EXCERPT_MAX_CHARS)
}
