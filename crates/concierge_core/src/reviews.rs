//! crates/concierge_core/src/reviews.rs
//!
//! Review aggregation: whenever a review is created, deleted, or has its
//! status changed, the parent property's `reviewCount`, `ratingSum` and
//! `averageRating` are recomputed from the full set of published reviews.
//! Recomputation is a pure function of that set, so replays and duplicate
//! events can never drift the aggregates.
//!
//! The trigger is an explicit event subscription: review CRUD publishes a
//! [`ReviewEvent`] on an in-process channel and [`run_consumer`] drains it,
//! logging and swallowing failures (no automatic retry).

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::domain::{paths, ReviewStatus};
use crate::store::{
    DocumentStore, FieldFilter, FieldUpdate, StoreResult, StoreTransaction, TransactionOp,
};

/// A change to a review document, keyed by the owning property.
#[derive(Debug, Clone)]
pub enum ReviewEvent {
    Created {
        property_id: String,
    },
    Updated {
        property_id: String,
        status_before: ReviewStatus,
        status_after: ReviewStatus,
    },
    Deleted {
        property_id: String,
    },
}

impl ReviewEvent {
    pub fn property_id(&self) -> &str {
        match self {
            ReviewEvent::Created { property_id }
            | ReviewEvent::Deleted { property_id }
            | ReviewEvent::Updated { property_id, .. } => property_id,
        }
    }

    /// Whether this event can change the published-review set. An edit
    /// that leaves the status untouched is skipped purely as an
    /// optimization; recomputation itself is idempotent.
    pub fn requires_recompute(&self) -> bool {
        match self {
            ReviewEvent::Created { .. } | ReviewEvent::Deleted { .. } => true,
            ReviewEvent::Updated {
                status_before,
                status_after,
                ..
            } => status_before != status_after,
        }
    }
}

/// Recomputes a property's review aggregates from the store.
#[derive(Clone)]
pub struct ReviewAggregator {
    store: Arc<dyn DocumentStore>,
}

impl ReviewAggregator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        ReviewAggregator { store }
    }

    /// Reacts to one review event, recomputing when the event calls for it.
    pub async fn handle(&self, event: &ReviewEvent) -> StoreResult<()> {
        if !event.requires_recompute() {
            debug!(
                property_id = event.property_id(),
                "review edit left status unchanged, skipping recompute"
            );
            return Ok(());
        }
        self.recompute(event.property_id()).await
    }

    /// Atomically recomputes `reviewCount`, `ratingSum` and `averageRating`
    /// from the property's published reviews. A missing property aborts
    /// with no writes.
    pub async fn recompute(&self, property_id: &str) -> StoreResult<()> {
        self.store
            .run_transaction(&RecomputeAggregatesOp { property_id })
            .await
    }
}

struct RecomputeAggregatesOp<'a> {
    property_id: &'a str,
}

#[async_trait::async_trait]
impl TransactionOp for RecomputeAggregatesOp<'_> {
    async fn run(&self, tx: &mut dyn StoreTransaction) -> StoreResult<()> {
        let property_path = paths::property(self.property_id);

        let property = tx.get(&property_path).await?;
        if property.is_none() {
            debug!(
                property_id = self.property_id,
                "skipping review aggregation: property does not exist"
            );
            return Ok(());
        }

        // The query runs inside the transaction so the written aggregates
        // are consistent with the review set they were computed from.
        let published = tx
            .query(
                &paths::reviews_collection(self.property_id),
                &FieldFilter::equals("status", json!("published")),
            )
            .await?;

        let review_count = published.len() as i64;
        let rating_sum: f64 = published
            .iter()
            .map(|review| review.get("rating").and_then(Value::as_f64).unwrap_or(0.0))
            .sum();
        let average_rating = if review_count > 0 {
            rating_sum / review_count as f64
        } else {
            0.0
        };

        tx.update(
            &property_path,
            vec![
                FieldUpdate::set("reviewCount", json!(review_count)),
                FieldUpdate::set("ratingSum", json!(rating_sum)),
                FieldUpdate::set("averageRating", json!(average_rating)),
            ],
        )?;
        Ok(())
    }
}

/// Drains review events until every sender is dropped. Failures are
/// reported to the log and dropped; retrying is an external policy
/// decision, not this consumer's.
pub async fn run_consumer(aggregator: ReviewAggregator, mut events: mpsc::Receiver<ReviewEvent>) {
    while let Some(event) = events.recv().await {
        if let Err(e) = aggregator.handle(&event).await {
            error!(
                property_id = event.property_id(),
                "review aggregation failed: {e}"
            );
        }
    }
    debug!("review event channel closed, consumer exiting");
}
