//! Question handling and the HTTP transport in front of it.
//!
//! [`orchestrator::Orchestrator`] runs one question through session lookup,
//! repository protection, the analysis agent and synthesis. [`server`]
//! exposes it over HTTP, with [`inbound`] turning raw chat events into
//! questions.

pub mod inbound;
pub mod orchestrator;
pub mod server;
pub mod sweeper;

#[cfg(test)]
mod test_support;

pub use orchestrator::{Orchestrator, OrchestratorConfig, QuestionEvent, QuestionResponse};
pub use server::{start, ServerConfig, ServerHandle};
