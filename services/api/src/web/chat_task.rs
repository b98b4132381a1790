//! services/api/src/web/chat_task.rs
//!
//! This module contains the asynchronous "worker" function responsible for
//! handling a single visitor question: FAQ matching, answer generation with
//! a user-safe fallback, and the fire-and-forget audit writes.

use crate::web::state::AppState;
use concierge_core::{
    domain::{paths, Faq, Property, PropertyContext},
    ports::PortError,
    store::{decode, DocumentStore},
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What the visitor gets back when generation fails outright. The exchange
/// is still logged, flagged as an error so it never consumes quota.
const FALLBACK_ANSWER: &str = "I'm sorry, I'm having trouble answering right now. \
    Please try again in a moment, or reach out to your host directly.";

/// A matched FAQ must share at least this many meaningful words with the
/// visitor's question, and at least half of its own.
const MIN_OVERLAP: usize = 2;

/// Handles one visitor question end to end and returns the answer.
///
/// The conversation log, the message counter, and the FAQ usage counter are
/// all updated by detached background tasks: the visitor's answer is never
/// blocked on audit or analytics writes, and failures there are logged and
/// swallowed.
pub async fn answer_visitor_question(
    app_state: Arc<AppState>,
    property_id: String,
    visitor_id: String,
    question: String,
) -> Result<String, PortError> {
    let property_path = paths::property(&property_id);
    let property_doc = app_state
        .store
        .get(&property_path)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?
        .ok_or_else(|| PortError::NotFound(format!("Property {property_id} not found")))?;
    let property: Property =
        decode(&property_path, property_doc).map_err(|e| PortError::Unexpected(e.to_string()))?;

    let faqs = load_faqs(&app_state, &property_id).await;

    let (answer, is_error) = match best_faq_match(&question, &faqs) {
        Some((faq_id, faq)) => {
            info!(%property_id, %faq_id, "answering from FAQ match");
            spawn_faq_usage_bump(app_state.clone(), property_id.clone(), faq_id);
            (faq.answer, false)
        }
        None => {
            let context = PropertyContext {
                name: property.name.clone(),
                description: property.description.clone(),
                amenities: property.amenities.clone(),
                rules: property.rules.clone(),
                faqs: faqs
                    .iter()
                    .map(|(_, f)| (f.question.clone(), f.answer.clone()))
                    .collect(),
            };
            match app_state
                .answer_adapter
                .generate_answer(&context, &question)
                .await
            {
                Ok(answer) => (answer, false),
                Err(e) => {
                    warn!(%property_id, "answer generation failed, serving fallback: {e}");
                    (FALLBACK_ANSWER.to_string(), true)
                }
            }
        }
    };

    // Fire-and-forget: the visitor already has their answer.
    let logger = app_state.logger.clone();
    let (log_property, log_visitor, log_question, log_answer) = (
        property_id.clone(),
        visitor_id,
        question,
        answer.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = logger
            .log_exchange(&log_property, &log_visitor, &log_question, &log_answer, is_error)
            .await
        {
            error!(
                property_id = %log_property,
                "failed to record chat exchange: {e}"
            );
        }
    });

    Ok(answer)
}

async fn load_faqs(app_state: &AppState, property_id: &str) -> Vec<(String, Faq)> {
    match app_state
        .store
        .list(&paths::faqs_collection(property_id))
        .await
    {
        Ok(entries) => entries
            .into_iter()
            .filter_map(|(path, data)| {
                let faq: Faq = decode(&path, data).ok()?;
                Some((path.doc_id().to_string(), faq))
            })
            .collect(),
        Err(e) => {
            warn!(%property_id, "failed to load FAQs, continuing without: {e}");
            Vec::new()
        }
    }
}

fn spawn_faq_usage_bump(app_state: Arc<AppState>, property_id: String, faq_id: String) {
    tokio::spawn(async move {
        if let Err(e) = app_state
            .faq_usage
            .increment_usage(&property_id, &faq_id)
            .await
        {
            error!(%property_id, %faq_id, "failed to bump FAQ usage count: {e}");
        }
    });
}

fn meaningful_words(text: &str) -> HashSet<String> {
    const STOPWORDS: &[&str] = &[
        "a", "an", "and", "are", "can", "do", "does", "for", "how", "i", "in", "is", "it", "of",
        "on", "or", "the", "there", "to", "we", "what", "when", "where", "you",
    ];
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Picks the FAQ whose question shares the most meaningful words with the
/// visitor's, if the overlap is strong enough to trust.
fn best_faq_match(question: &str, faqs: &[(String, Faq)]) -> Option<(String, Faq)> {
    let question_words = meaningful_words(question);
    if question_words.is_empty() {
        return None;
    }

    let mut best: Option<(usize, &(String, Faq))> = None;
    for entry in faqs {
        let faq_words = meaningful_words(&entry.1.question);
        if faq_words.is_empty() {
            continue;
        }
        let overlap = faq_words.intersection(&question_words).count();
        if overlap < MIN_OVERLAP || overlap * 2 < faq_words.len() {
            continue;
        }
        if best.map(|(score, _)| overlap > score).unwrap_or(true) {
            best = Some((overlap, entry));
        }
    }
    best.map(|(_, entry)| entry.clone())
}
