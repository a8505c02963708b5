//! Prompt construction: persona, enhancement directives, and the message.

pub mod builder;
pub mod enhance;

pub use builder::{EnhancedPrompt, PromptBuilder};
pub use enhance::Enhancement;
