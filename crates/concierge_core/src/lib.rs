pub mod chat_logger;
pub mod domain;
pub mod faq_usage;
pub mod ports;
pub mod quota;
pub mod reviews;
pub mod store;

pub use chat_logger::{ConversationLogger, CounterStrategy};
pub use domain::{
    ChatLog, Client, Faq, Message, MessageRole, Owner, Property, PropertyContext, PropertyStatus,
    QuotaUsage, Review, ReviewStatus, SubscriptionTier,
};
pub use faq_usage::FaqUsageCounter;
pub use ports::{AnswerGenerator, PortError, PortResult};
pub use reviews::{ReviewAggregator, ReviewEvent};
pub use store::{DocumentStore, StoreError, StoreResult};
