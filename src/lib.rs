//! Mail Assist: answers one inbound email per invocation with an AI
//! assistant persona and a properly threaded reply.

pub mod assistants;
pub mod config;
pub mod email;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompt;
