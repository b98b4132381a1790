pub mod chat_task;
pub mod quota_task;
pub mod rest;
pub mod state;

// Re-export the handlers the binary wires into the router.
pub use rest::{
    chat_handler, create_faq_handler, create_owner_handler, create_property_handler,
    create_review_handler, delete_review_handler, get_faq_usage_handler, get_property_handler,
    get_quota_handler, get_transcript_handler, list_faqs_handler, list_reviews_handler,
    update_review_status_handler,
};
