//! Message processing pipeline.
//!
//! Every inbound message flows through:
//! 1. `parse_with()`: raw bytes into an `InboundMessage`
//! 2. `SenderRules::evaluate()`: automated senders stop here, no AI call
//! 3. `AssistantRegistry::resolve()`: pick the persona
//! 4. `PromptBuilder::build()` then `AiClient::complete()`
//! 5. `ReplyComposer::compose()` then `MailTransport::send()`
//!
//! A failure at any step ends the run without sending anything.

pub mod events;
pub mod orchestrator;
pub mod rules;
pub mod state;

pub use events::{EventSink, FanoutSink, Outcome, PipelineEvent, TracingSink, WebhookSink};
pub use orchestrator::{Pipeline, PipelineFailure, PipelineOutcome};
pub use rules::{SenderRules, SkipReason};
pub use state::{RunContext, RunState, Stage};
