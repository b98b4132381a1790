//! crates/concierge_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the
//! core to be independent of specific external implementations like LLM APIs.

use async_trait::async_trait;

use crate::domain::PropertyContext;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// The opaque answer generator backing the visitor chat.
///
/// Failures are the caller's problem: the chat orchestration converts them
/// into a user-safe fallback answer and flags the exchange as errored.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Answers a visitor question grounded in the property's listing content.
    async fn generate_answer(
        &self,
        context: &PropertyContext,
        question: &str,
    ) -> PortResult<String>;
}
