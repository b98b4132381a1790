//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{OpenAiConciergeAdapter, PgDocumentStore},
    config::Config,
    error::ApiError,
    web::{
        chat_handler, create_faq_handler, create_owner_handler, create_property_handler,
        create_review_handler, delete_review_handler, get_faq_usage_handler, get_property_handler,
        get_quota_handler, get_transcript_handler, list_faqs_handler, list_reviews_handler,
        quota_task, rest::ApiDoc, state::AppState, update_review_status_handler,
    },
};
use async_openai::{config::OpenAIConfig, Client};
use axum::{
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{get, post},
    Router,
};
use concierge_core::{
    chat_logger::ConversationLogger,
    faq_usage::FaqUsageCounter,
    reviews::{self, ReviewAggregator},
    store::DocumentStore,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let pg_store = PgDocumentStore::new(db_pool);
    info!("Running database migrations...");
    pg_store.run_migrations().await?;
    info!("Database migrations complete.");
    let store: Arc<dyn DocumentStore> = Arc::new(pg_store);

    // --- 3. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    let openai_client = Client::with_config(openai_config);
    let answer_adapter = Arc::new(OpenAiConciergeAdapter::new(
        openai_client,
        config.chat_model.clone(),
    ));

    // --- 4. Start the Background Consumers ---
    let (review_events, review_events_rx) = mpsc::channel(64);
    tokio::spawn(reviews::run_consumer(
        ReviewAggregator::new(store.clone()),
        review_events_rx,
    ));
    tokio::spawn(quota_task::run_monthly_reset(store.clone()));

    // --- 5. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        logger: ConversationLogger::new(store.clone(), config.counter_strategy),
        faq_usage: FaqUsageCounter::new(store.clone()),
        store,
        config: config.clone(),
        answer_adapter,
        review_events,
    });

    let cors = CorsLayer::new()
        .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    // --- 6. Create the Web Router ---
    let api_router = Router::new()
        .route("/owners", post(create_owner_handler))
        .route("/properties", post(create_property_handler))
        .route("/properties/{property_id}", get(get_property_handler))
        .route("/properties/{property_id}/chat", post(chat_handler))
        .route(
            "/properties/{property_id}/chat/{visitor_id}",
            get(get_transcript_handler),
        )
        .route(
            "/properties/{property_id}/reviews",
            post(create_review_handler).get(list_reviews_handler),
        )
        .route(
            "/properties/{property_id}/reviews/{review_id}",
            axum::routing::patch(update_review_status_handler).delete(delete_review_handler),
        )
        .route("/properties/{property_id}/quota", get(get_quota_handler))
        .route(
            "/properties/{property_id}/faqs",
            post(create_faq_handler).get(list_faqs_handler),
        )
        .route(
            "/properties/{property_id}/faqs/usage",
            get(get_faq_usage_handler),
        )
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
