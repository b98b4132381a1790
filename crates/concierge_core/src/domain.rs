//! crates/concierge_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs mirror the schemaless documents in the store; serde renames
//! keep the on-disk field names in camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a rental listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyStatus {
    Draft,
    Published,
}

impl Default for PropertyStatus {
    fn default() -> Self {
        PropertyStatus::Draft
    }
}

/// A rental listing managed by an owner.
///
/// `message_count`, `review_count`, `rating_sum` and `average_rating` are
/// derived fields: only the conversation logger and the review aggregator
/// write them. Everything else is owner-supplied listing content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(default)]
    pub owner_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub rules: String,
    #[serde(default)]
    pub status: PropertyStatus,
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub message_quota_reset_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub review_count: i64,
    #[serde(default)]
    pub rating_sum: f64,
    #[serde(default)]
    pub average_rating: f64,
}

/// A visitor record, created lazily on a visitor's first message to any
/// property owned by the same owner. Never mutated afterwards by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub owner_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One chat turn. Immutable once written; `created_at` is stamped by the
/// server, never taken from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// The append-only conversation record for one (property, visitor) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLog {
    pub client_id: String,
    pub property_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Published,
    Pending,
    Archived,
    Reported,
}

/// A visitor review of a property. Only `published` reviews count toward
/// the property's derived rating aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    #[serde(default)]
    pub owner_id: Option<String>,
    pub reviewer_name: String,
    pub rating: f64,
    pub status: ReviewStatus,
    #[serde(default)]
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// An owner-curated question/answer pair shown to visitors and offered to
/// the chat assistant as a cheap first-line match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Faq {
    pub question: String,
    pub answer: String,
}

/// An owner's subscription tier, which fixes the monthly message quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Premium,
}

impl SubscriptionTier {
    /// The monthly message cap for this tier, or `None` when unbounded.
    pub fn monthly_quota(&self) -> Option<u64> {
        match self {
            SubscriptionTier::Free => Some(50),
            SubscriptionTier::Pro => Some(500),
            SubscriptionTier::Premium => None,
        }
    }
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        SubscriptionTier::Free
    }
}

/// Minimal owner record; carries the subscription tier the quota
/// computation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    #[serde(default)]
    pub tier: SubscriptionTier,
}

/// The quota snapshot consumed by UI/gating logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub used: u64,
    /// `None` means the tier is unbounded.
    pub quota: Option<u64>,
    pub percentage: f32,
    pub reset_date: Option<DateTime<Utc>>,
}

/// The listing content handed to the answer generator as grounding context.
#[derive(Debug, Clone)]
pub struct PropertyContext {
    pub name: String,
    pub description: String,
    pub amenities: Vec<String>,
    pub rules: String,
    /// (question, answer) pairs from the property's FAQ collection.
    pub faqs: Vec<(String, String)>,
}

/// Document path helpers for the collection layout:
/// `properties/{id}`, `properties/{id}/chatLogs/{visitorId}`,
/// `properties/{id}/reviews/{reviewId}`, `properties/{id}/faqs/{faqId}`,
/// `properties/{id}/faqUsage/counts`, `clients/{visitorId}`,
/// `owners/{ownerId}`.
pub mod paths {
    use crate::store::DocPath;

    pub const PROPERTIES: &str = "properties";
    pub const CLIENTS: &str = "clients";
    pub const OWNERS: &str = "owners";

    pub fn property(property_id: &str) -> DocPath {
        DocPath::new(format!("{PROPERTIES}/{property_id}"))
    }

    pub fn client(visitor_id: &str) -> DocPath {
        DocPath::new(format!("{CLIENTS}/{visitor_id}"))
    }

    pub fn owner(owner_id: &str) -> DocPath {
        DocPath::new(format!("{OWNERS}/{owner_id}"))
    }

    pub fn chat_log(property_id: &str, visitor_id: &str) -> DocPath {
        DocPath::new(format!("{PROPERTIES}/{property_id}/chatLogs/{visitor_id}"))
    }

    pub fn chat_logs_collection(property_id: &str) -> String {
        format!("{PROPERTIES}/{property_id}/chatLogs")
    }

    pub fn review(property_id: &str, review_id: &str) -> DocPath {
        DocPath::new(format!("{PROPERTIES}/{property_id}/reviews/{review_id}"))
    }

    pub fn reviews_collection(property_id: &str) -> String {
        format!("{PROPERTIES}/{property_id}/reviews")
    }

    pub fn faq(property_id: &str, faq_id: &str) -> DocPath {
        DocPath::new(format!("{PROPERTIES}/{property_id}/faqs/{faq_id}"))
    }

    pub fn faqs_collection(property_id: &str) -> String {
        format!("{PROPERTIES}/{property_id}/faqs")
    }

    /// The single-document collection holding the FAQ usage map. Kept apart
    /// from `faqs/` so FAQ enumeration never has to filter a reserved id.
    pub fn faq_usage(property_id: &str) -> DocPath {
        DocPath::new(format!("{PROPERTIES}/{property_id}/faqUsage/counts"))
    }
}
