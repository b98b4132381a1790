//! Integration tests for the chat orchestration: FAQ matching, fallback
//! answers, and the detached audit writes, all against the embedded store.

use api_lib::config::Config;
use api_lib::web::{chat_task, state::AppState};
use async_trait::async_trait;
use concierge_core::{
    chat_logger::{ConversationLogger, CounterStrategy},
    domain::{paths, PropertyContext},
    faq_usage::FaqUsageCounter,
    ports::{AnswerGenerator, PortError, PortResult},
    reviews::{self, ReviewAggregator},
    store::{memory::MemoryStore, DocumentStore, FieldUpdate},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Level;

struct StaticAnswer(&'static str);

#[async_trait]
impl AnswerGenerator for StaticAnswer {
    async fn generate_answer(
        &self,
        _context: &PropertyContext,
        _question: &str,
    ) -> PortResult<String> {
        Ok(self.0.to_string())
    }
}

struct FailingAnswer;

#[async_trait]
impl AnswerGenerator for FailingAnswer {
    async fn generate_answer(
        &self,
        _context: &PropertyContext,
        _question: &str,
    ) -> PortResult<String> {
        Err(PortError::Unexpected("model unavailable".to_string()))
    }
}

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        database_url: "postgres://unused".to_string(),
        log_level: Level::WARN,
        openai_api_key: None,
        chat_model: "test-model".to_string(),
        counter_strategy: CounterStrategy::AtomicIncrement,
    }
}

fn app_state(store: &MemoryStore, generator: Arc<dyn AnswerGenerator>) -> Arc<AppState> {
    let store: Arc<dyn DocumentStore> = Arc::new(store.clone());
    let (review_events, review_events_rx) = mpsc::channel(8);
    tokio::spawn(reviews::run_consumer(
        ReviewAggregator::new(store.clone()),
        review_events_rx,
    ));
    Arc::new(AppState {
        logger: ConversationLogger::new(store.clone(), CounterStrategy::AtomicIncrement),
        faq_usage: FaqUsageCounter::new(store.clone()),
        store,
        config: Arc::new(test_config()),
        answer_adapter: generator,
        review_events,
    })
}

async fn seed_property(store: &MemoryStore, property_id: &str) {
    store
        .apply(
            &paths::property(property_id),
            vec![
                FieldUpdate::set("ownerId", json!("owner-1")),
                FieldUpdate::set("name", json!("Seaside Villa")),
                FieldUpdate::set("description", json!("A villa by the sea.")),
                FieldUpdate::set("messageCount", json!(0)),
            ],
        )
        .await
        .unwrap();
}

/// The audit writes are fire-and-forget; poll until they land.
async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool>>>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the polling budget");
}

async fn message_count(store: &MemoryStore, property_id: &str) -> i64 {
    store
        .get(&paths::property(property_id))
        .await
        .unwrap()
        .and_then(|d| d.get("messageCount").and_then(Value::as_i64))
        .unwrap_or(0)
}

#[tokio::test]
async fn generated_answer_is_returned_and_exchange_logged() {
    let store = MemoryStore::new();
    seed_property(&store, "p1").await;
    let state = app_state(&store, Arc::new(StaticAnswer("The beach is a 5 minute walk.")));

    let answer = chat_task::answer_visitor_question(
        state,
        "p1".to_string(),
        "visitor-1".to_string(),
        "How far is the beach?".to_string(),
    )
    .await
    .unwrap();
    assert_eq!(answer, "The beach is a 5 minute walk.");

    let poll_store = store.clone();
    wait_until(move || {
        let store = poll_store.clone();
        Box::pin(async move { message_count(&store, "p1").await == 1 })
    })
    .await;

    let log = store
        .get(&paths::chat_log("p1", "visitor-1"))
        .await
        .unwrap()
        .expect("chat log written");
    let messages = log.get("messages").and_then(Value::as_array).unwrap().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[0].get("content"),
        Some(&json!("How far is the beach?"))
    );
    assert_eq!(
        messages[1].get("content"),
        Some(&json!("The beach is a 5 minute walk."))
    );

    let client = store
        .get(&paths::client("visitor-1"))
        .await
        .unwrap()
        .expect("client record provisioned");
    assert_eq!(client.get("ownerId"), Some(&json!("owner-1")));
}

#[tokio::test]
async fn generator_failure_degrades_to_fallback_without_counting() {
    let store = MemoryStore::new();
    seed_property(&store, "p1").await;
    let state = app_state(&store, Arc::new(FailingAnswer));

    let answer = chat_task::answer_visitor_question(
        state,
        "p1".to_string(),
        "visitor-1".to_string(),
        "How far is the beach?".to_string(),
    )
    .await
    .unwrap();
    assert!(answer.contains("reach out to your host"));

    // The errored exchange is still logged, but never consumes quota.
    let poll_store = store.clone();
    wait_until(move || {
        let store = poll_store.clone();
        Box::pin(async move {
            store
                .get(&paths::chat_log("p1", "visitor-1"))
                .await
                .unwrap()
                .is_some()
        })
    })
    .await;
    assert_eq!(message_count(&store, "p1").await, 0);
}

#[tokio::test]
async fn faq_match_answers_directly_and_bumps_usage() {
    let store = MemoryStore::new();
    seed_property(&store, "p1").await;
    store
        .apply(
            &paths::faq("p1", "faq-wifi"),
            vec![
                FieldUpdate::set("question", json!("What is the wifi password?")),
                FieldUpdate::set("answer", json!("It's taped inside the pantry door.")),
            ],
        )
        .await
        .unwrap();
    // The generator must not be consulted on an FAQ hit.
    let state = app_state(&store, Arc::new(FailingAnswer));

    let answer = chat_task::answer_visitor_question(
        state.clone(),
        "p1".to_string(),
        "visitor-1".to_string(),
        "what's the wifi password?".to_string(),
    )
    .await
    .unwrap();
    assert_eq!(answer, "It's taped inside the pantry door.");

    let usage = state.faq_usage.clone();
    wait_until(move || {
        let usage = usage.clone();
        Box::pin(async move {
            usage
                .usage_counts("p1")
                .await
                .unwrap()
                .get("faq-wifi")
                .copied()
                == Some(1)
        })
    })
    .await;
}

#[tokio::test]
async fn chat_against_missing_property_is_not_found() {
    let store = MemoryStore::new();
    let state = app_state(&store, Arc::new(StaticAnswer("unused")));

    let err = chat_task::answer_visitor_question(
        state,
        "ghost".to_string(),
        "visitor-1".to_string(),
        "Hello?".to_string(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PortError::NotFound(_)));
}
