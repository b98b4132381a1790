//! crates/concierge_core/src/faq_usage.rs
//!
//! FAQ usage analytics: a per-property map from FAQ id to the number of
//! times the matcher picked it as the best answer to a visitor question.
//! The map lives in its own single-document collection
//! (`properties/{id}/faqUsage/counts`), separate from the FAQ entities, so
//! enumerating FAQs never has to filter out a reserved side-channel id.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::paths;
use crate::store::{DocumentStore, FieldUpdate, StoreResult};

const COUNT_SUFFIX: &str = "_count";

/// Best-effort usage bookkeeping for FAQ matches.
#[derive(Clone)]
pub struct FaqUsageCounter {
    store: Arc<dyn DocumentStore>,
}

impl FaqUsageCounter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        FaqUsageCounter { store }
    }

    /// Bumps the usage count for one FAQ by a field-level atomic
    /// increment, so concurrent callers never lose updates. Creates the
    /// usage document on first use.
    pub async fn increment_usage(&self, property_id: &str, faq_id: &str) -> StoreResult<()> {
        self.store
            .apply(
                &paths::faq_usage(property_id),
                vec![FieldUpdate::increment(format!("{faq_id}{COUNT_SUFFIX}"), 1)],
            )
            .await
    }

    /// Reads the usage map back as faqId -> count.
    pub async fn usage_counts(&self, property_id: &str) -> StoreResult<HashMap<String, i64>> {
        let doc = self
            .store
            .get(&paths::faq_usage(property_id))
            .await?
            .unwrap_or_default();

        Ok(doc
            .into_iter()
            .filter_map(|(field, value)| {
                let faq_id = field.strip_suffix(COUNT_SUFFIX)?;
                Some((faq_id.to_string(), value.as_i64()?))
            })
            .collect())
    }
}
