pub mod concierge_llm;
pub mod pg_store;

pub use concierge_llm::OpenAiConciergeAdapter;
pub use pg_store::PgDocumentStore;
