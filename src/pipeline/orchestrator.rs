//! The per-message pipeline.
//!
//! Parse → resolve → prompt → complete → compose and hand off. Each run walks
//! a [`RunContext`] forward, emits exactly one [`PipelineEvent`], and never
//! sends anything when a stage fails.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assistants::{AssistantConfig, AssistantRegistry};
use crate::email::compose::{OutboundMessage, ReplyComposer};
use crate::email::parser::{ParserOptions, parse_with};
use crate::email::transport::{MailTransport, RelayFactory, SmtpRelays};
use crate::error::{Error, ErrorKind, TransportError};
use crate::llm::AiClient;
use crate::pipeline::events::{
    EXCERPT_MAX_CHARS, EventSink, Outcome, PipelineEvent, redact_addresses, redacted_excerpt,
    reply_excerpt,
};
use crate::pipeline::rules::{SenderRules, SkipReason};
use crate::pipeline::state::{RunContext, RunState, Stage};
use crate::prompt::PromptBuilder;

/// How a successful run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// A reply was composed and accepted by the transport.
    Replied(Box<OutboundMessage>),
    /// The message came from an automated sender.
    Skipped(SkipReason),
}

/// A run that stopped at `stage`.
#[derive(Debug, thiserror::Error)]
#[error("Pipeline run {run_id} failed while {stage}: {error}")]
pub struct PipelineFailure {
    pub run_id: Uuid,
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl PipelineFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Everything one invocation needs, built once and read-only afterwards.
pub struct Pipeline {
    registry: Arc<AssistantRegistry>,
    rules: SenderRules,
    prompts: PromptBuilder,
    ai: AiClient,
    composer: ReplyComposer,
    transport: Arc<dyn MailTransport>,
    relays: Arc<dyn RelayFactory>,
    sink: Arc<dyn EventSink>,
    parser_options: ParserOptions,
}

impl Pipeline {
    /// A pipeline with no sender rules, default prompt and compose settings.
    pub fn new(
        registry: Arc<AssistantRegistry>,
        ai: AiClient,
        transport: Arc<dyn MailTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            rules: SenderRules::empty(),
            prompts: PromptBuilder::default(),
            ai,
            composer: ReplyComposer::default(),
            transport,
            relays: Arc::new(SmtpRelays),
            sink,
            parser_options: ParserOptions::default(),
        }
    }

    pub fn with_rules(mut self, rules: SenderRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_composer(mut self, composer: ReplyComposer) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_parser_options(mut self, options: ParserOptions) -> Self {
        self.parser_options = options;
        self
    }

    /// How relays are built for assistants with their own SMTP settings.
    pub fn with_relays(mut self, relays: Arc<dyn RelayFactory>) -> Self {
        self.relays = relays;
        self
    }

    /// Process one raw message end to end.
    pub async fn run(&self, raw: &[u8]) -> Result<PipelineOutcome, PipelineFailure> {
        let mut ctx = RunContext::new();
        let mut event = PipelineEvent::new(ctx.run_id, Outcome::Failed);

        info!(
            run_id = %ctx.run_id,
            bytes = raw.len(),
            transport = self.transport.name(),
            provider = self.ai.provider_name(),
            "Processing inbound message"
        );

        let result = self.drive(raw, &mut ctx, &mut event).await;

        match &result {
            Ok(PipelineOutcome::Replied(outbound)) => {
                event.outcome = Outcome::Replied;
                info!(
                    run_id = %ctx.run_id,
                    message_id = %outbound.message_id,
                    "Reply delivered"
                );
            }
            Ok(PipelineOutcome::Skipped(reason)) => {
                event.outcome = Outcome::Skipped;
                event.skip_reason = Some(reason.reason.clone());
                info!(
                    run_id = %ctx.run_id,
                    rule = %reason.rule,
                    reason = %reason.reason,
                    "Automated sender, not replying"
                );
            }
            Err(failure) => {
                event.outcome = Outcome::Failed;
                event.stage = Some(failure.stage);
                event.error_kind = Some(failure.kind());
                event.error = Some(redact_addresses(&failure.error.to_string()));
                error!(
                    run_id = %ctx.run_id,
                    stage = %failure.stage,
                    error_kind = %failure.kind(),
                    error = %failure.error,
                    "Pipeline stage failed, no reply sent"
                );
            }
        }

        event.elapsed_ms = u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.sink.record(&event).await;
        result
    }

    async fn drive(
        &self,
        raw: &[u8],
        ctx: &mut RunContext,
        event: &mut PipelineEvent,
    ) -> Result<PipelineOutcome, PipelineFailure> {
        // Parsing. Until the body is known the excerpt covers the raw input.
        event.excerpt = redacted_excerpt(&String::from_utf8_lossy(raw), EXCERPT_MAX_CHARS);
        let message = parse_with(raw, self.parser_options).map_err(|e| fail(ctx, e.into()))?;
        event.sender = message.sender_address().map(redact_addresses);
        event.subject = message
            .subject
            .as_deref()
            .map(|s| redacted_excerpt(s, EXCERPT_MAX_CHARS));
        event.excerpt = redacted_excerpt(&message.text, EXCERPT_MAX_CHARS);
        debug!(
            run_id = %ctx.run_id,
            recipients = message.recipients.len(),
            parts = message.parts.len(),
            text_source = ?message.text_source,
            "Message parsed"
        );

        // Resolving
        advance(ctx, RunState::Resolving);
        if let Some(reason) = self.rules.evaluate(&message, &self.registry) {
            advance(ctx, RunState::Skipped);
            return Ok(PipelineOutcome::Skipped(reason));
        }
        let resolution = self
            .registry
            .resolve(&message)
            .map_err(|e| fail(ctx, e.into()))?;
        event.assistant = Some(resolution.assistant.name.clone());

        // Prompting
        advance(ctx, RunState::Prompting);
        let prompt = self
            .prompts
            .build(resolution.assistant, &message, self.ai.capabilities())
            .map_err(|e| fail(ctx, e.into()))?;
        event.prompt_truncated = prompt.truncated;

        // Completing
        advance(ctx, RunState::Completing);
        let reply = self
            .ai
            .complete(&prompt.rendered)
            .await
            .map_err(|e| fail(ctx, e.into()))?;
        event.reply_excerpt = Some(reply_excerpt(&reply));

        // Composing, then handoff
        advance(ctx, RunState::Composing);
        let outbound = self
            .composer
            .compose(&message, &resolution, &reply)
            .map_err(|e| fail(ctx, e.into()))?;
        let transport = self
            .transport_for(resolution.assistant)
            .map_err(|e| fail(ctx, e.into()))?;
        transport
            .send(&outbound)
            .await
            .map_err(|e| fail(ctx, e.into()))?;

        advance(ctx, RunState::Done);
        Ok(PipelineOutcome::Replied(Box::new(outbound)))
    }

    fn transport_for(
        &self,
        assistant: &AssistantConfig,
    ) -> Result<Arc<dyn MailTransport>, TransportError> {
        match &assistant.smtp {
            Some(smtp) => {
                debug!(
                    assistant = %assistant.name,
                    host = %smtp.host,
                    "Using the assistant's own SMTP relay"
                );
                self.relays.relay(&smtp.to_config())
            }
            None => Ok(self.transport.clone()),
        }
    }
}

fn advance(ctx: &mut RunContext, next: RunState) {
    let from = ctx.state;
    match ctx.transition_to(next) {
        Ok(()) => debug!(run_id = %ctx.run_id, %from, to = %next, "Stage transition"),
        Err(e) => warn!(run_id = %ctx.run_id, error = %e, "Rejected stage transition"),
    }
}

fn fail(ctx: &mut RunContext, error: Error) -> PipelineFailure {
    let stage = ctx.state.stage().unwrap_or(Stage::Parsing);
    if let Err(e) = ctx.fail(error.kind()) {
        warn!(run_id = %ctx.run_id, error = %e, "Rejected failure transition");
    }
    PipelineFailure {
        run_id: ctx.run_id,
        stage,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::assistants::{AssistantConfig, MatchRule};
    use crate::email::transport::{AssistantSmtp, SmtpConfig};
    use crate::error::{LlmError, TransportError};
    use crate::llm::{Capabilities, CompletionBackend};

    struct FixedBackend {
        reply: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionBackend for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<String>>,
        reject: bool,
    }

    #[async_trait]
    impl MailTransport for Outbox {
        fn name(&self) -> &str {
            "outbox"
        }

        async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
            if self.reject {
                return Err(TransportError::SendFailed {
                    name: "outbox".into(),
                    reason: "relay refused".into(),
                });
            }
            self.sent.lock().unwrap().push(message.subject.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<PipelineEvent>>);

    #[async_trait]
    impl EventSink for Events {
        async fn record(&self, event: &PipelineEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn registry() -> Arc<AssistantRegistry> {
        Arc::new(
            AssistantRegistry::new(
                vec![AssistantConfig {
                    name: "helpdesk".into(),
                    match_rule: MatchRule::Addresses(vec!["help@y.com".into()]),
                    persona: "You are the helpdesk.".into(),
                    enhancements: vec![],
                    sender: None,
                    display_name: Some("Helpdesk".into()),
                    html_reply: false,
                    quote_policy: None,
                    smtp: None,
                }],
                None,
            )
            .unwrap(),
        )
    }

    struct Harness {
        pipeline: Pipeline,
        backend: Arc<FixedBackend>,
        outbox: Arc<Outbox>,
        events: Arc<Events>,
    }

    fn harness(reply: &str, outbox: Outbox) -> Harness {
        let backend = Arc::new(FixedBackend {
            reply: reply.into(),
            calls: AtomicU32::new(0),
        });
        let outbox = Arc::new(outbox);
        let events = Arc::new(Events::default());
        let ai = AiClient::new(backend.clone(), Duration::from_secs(5))
            .with_retry_delay(Duration::ZERO);
        let pipeline = Pipeline::new(registry(), ai, outbox.clone(), events.clone())
            .with_rules(SenderRules::default_rules().unwrap());
        Harness {
            pipeline,
            backend,
            outbox,
            events,
        }
    }

    fn raw(from: &str, to: &str) -> Vec<u8> {
        format!(
            "From: {from}\r\nTo: {to}\r\nSubject: Printer\r\nMessage-ID: <p1@x.com>\r\n\r\nThe printer is jammed again.\r\n"
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn replied_run_records_one_event() {
        let h = harness("Try turning it off and on.", Outbox::default());
        let outcome = h.pipeline.run(&raw("bob@x.com", "help@y.com")).await.unwrap();

        let PipelineOutcome::Replied(outbound) = outcome else {
            panic!("expected a reply");
        };
        assert_eq!(outbound.subject, "Re: Printer");
        assert_eq!(h.outbox.sent.lock().unwrap().as_slice(), &["Re: Printer"]);

        let events = h.events.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.outcome, Outcome::Replied);
        assert_eq!(event.assistant.as_deref(), Some("helpdesk"));
        assert_eq!(event.sender.as_deref(), Some("b***@x.com"));
        assert_eq!(event.excerpt, "The printer is jammed again.");
        assert!(event.stage.is_none());
    }

    #[tokio::test]
    async fn transport_failure_fails_composing() {
        let h = harness(
            "On it.",
            Outbox {
                reject: true,
                ..Default::default()
            },
        );
        let failure = h
            .pipeline
            .run(&raw("bob@x.com", "help@y.com"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Composing);
        assert_eq!(failure.kind(), ErrorKind::TransportError);

        let events = h.events.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, Some(Stage::Composing));
        assert_eq!(events[0].error_kind, Some(ErrorKind::TransportError));
    }

    #[tokio::test]
    async fn unparseable_input_fails_parsing() {
        let h = harness("unused", Outbox::default());
        let failure = h.pipeline.run(b"").await.unwrap_err();

        assert_eq!(failure.stage, Stage::Parsing);
        assert_eq!(failure.kind(), ErrorKind::MalformedMessage);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.events.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_input_still_carries_redacted_excerpt() {
        let h = harness("unused", Outbox::default());
        let failure = h
            .pipeline
            .run(b"garbage with no headers from bob@x.com\nand a second line\n")
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Parsing);

        let events = h.events.0.lock().unwrap();
        let excerpt = &events[0].excerpt;
        assert!(!excerpt.is_empty());
        assert!(excerpt.starts_with("garbage with no headers"));
        assert!(excerpt.contains("b***@x.com"));
        assert!(!excerpt.contains("bob@"));
    }

    #[derive(Default)]
    struct Relays {
        hosts: Mutex<Vec<String>>,
        outbox: Arc<Outbox>,
    }

    impl RelayFactory for Relays {
        fn relay(&self, config: &SmtpConfig) -> Result<Arc<dyn MailTransport>, TransportError> {
            self.hosts.lock().unwrap().push(config.host.clone());
            Ok(self.outbox.clone())
        }
    }

    #[tokio::test]
    async fn assistant_relay_replaces_global_transport() {
        let smtp: AssistantSmtp = serde_json::from_str(
            r#"{"host": "smtp.sales.example", "username": "sales", "password": "pw"}"#,
        )
        .unwrap();
        let mut sales = registry().assistants()[0].clone();
        sales.name = "sales".into();
        sales.match_rule = MatchRule::Addresses(vec!["sales@y.com".into()]);
        sales.smtp = Some(smtp);
        let mut assistants = registry().assistants().to_vec();
        assistants.push(sales);
        let registry = Arc::new(AssistantRegistry::new(assistants, None).unwrap());

        let h = harness("Thanks for reaching out.", Outbox::default());
        let relays = Arc::new(Relays::default());
        let ai = AiClient::new(h.backend.clone(), Duration::from_secs(5));
        let pipeline = Pipeline::new(registry, ai, h.outbox.clone(), h.events.clone())
            .with_relays(relays.clone());

        pipeline.run(&raw("bob@x.com", "sales@y.com")).await.unwrap();
        assert_eq!(relays.hosts.lock().unwrap().as_slice(), &["smtp.sales.example"]);
        assert_eq!(relays.outbox.sent.lock().unwrap().as_slice(), &["Re: Printer"]);
        assert!(h.outbox.sent.lock().unwrap().is_empty());

        pipeline.run(&raw("bob@x.com", "help@y.com")).await.unwrap();
        assert_eq!(relays.hosts.lock().unwrap().len(), 1);
        assert_eq!(h.outbox.sent.lock().unwrap().as_slice(), &["Re: Printer"]);
    }

    #[tokio::test]
    async fn own_address_is_skipped() {
        let h = harness("unused", Outbox::default());
        let outcome = h.pipeline.run(&raw("help@y.com", "help@y.com")).await.unwrap();

        assert!(matches!(outcome, PipelineOutcome::Skipped(_)));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        assert!(h.outbox.sent.lock().unwrap().is_empty());

        let events = h.events.0.lock().unwrap();
        assert_eq!(events[0].outcome, Outcome::Skipped);
        assert!(events[0].skip_reason.is_some());
    }

    #[tokio::test]
    async fn failure_error_text_is_redacted() {
        let h = harness("unused", Outbox::default());
        let failure = h
            .pipeline
            .run(&raw("bob@x.com", "stranger@z.com"))
            .await
            .unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::NoAssistantMatched);

        let events = h.events.0.lock().unwrap();
        let text = events[0].error.as_deref().unwrap();
        assert!(text.contains("s***@z.com"));
        assert!(!text.contains("stranger"));
    }
}
