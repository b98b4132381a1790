//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use concierge_core::chat_logger::ConversationLogger;
use concierge_core::faq_usage::FaqUsageCounter;
use concierge_core::ports::AnswerGenerator;
use concierge_core::reviews::ReviewEvent;
use concierge_core::store::DocumentStore;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The shared application state, created once at startup and passed to all
/// handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub config: Arc<Config>,
    pub answer_adapter: Arc<dyn AnswerGenerator>,
    pub logger: ConversationLogger,
    pub faq_usage: FaqUsageCounter,
    /// Review CRUD publishes change events here; the aggregation consumer
    /// drains them in the background.
    pub review_events: mpsc::Sender<ReviewEvent>,
}
