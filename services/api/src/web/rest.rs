//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::{chat_task, state::AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use concierge_core::{
    domain::{paths, ChatLog, Faq, Owner, Property, PropertyStatus, Review, ReviewStatus},
    ports::PortError,
    quota,
    reviews::ReviewEvent,
    store::{decode, encode, DocumentStore, FieldUpdate, JsonMap, StoreError},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_owner_handler,
        create_property_handler,
        get_property_handler,
        chat_handler,
        get_transcript_handler,
        create_review_handler,
        list_reviews_handler,
        update_review_status_handler,
        delete_review_handler,
        get_quota_handler,
        create_faq_handler,
        list_faqs_handler,
        get_faq_usage_handler,
    ),
    components(schemas(
        CreateOwnerRequest,
        CreatePropertyRequest,
        CreatePropertyResponse,
        PropertyResponse,
        ChatRequest,
        ChatResponse,
        TranscriptResponse,
        MessageResponse,
        CreateReviewRequest,
        CreateReviewResponse,
        ReviewResponse,
        UpdateReviewStatusRequest,
        QuotaResponse,
        CreateFaqRequest,
        CreateFaqResponse,
        FaqResponse,
    )),
    tags(
        (name = "Concierge API", description = "API endpoints for the vacation-rental digital concierge.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateOwnerRequest {
    owner_id: String,
    /// One of `free`, `pro`, `premium`. Defaults to `free`.
    tier: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct CreatePropertyRequest {
    owner_id: String,
    name: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    amenities: Vec<String>,
    #[serde(default)]
    rules: String,
}

#[derive(Serialize, ToSchema)]
pub struct CreatePropertyResponse {
    property_id: String,
}

#[derive(Serialize, ToSchema)]
pub struct PropertyResponse {
    id: String,
    owner_id: Option<String>,
    name: String,
    address: String,
    description: String,
    amenities: Vec<String>,
    rules: String,
    status: String,
    message_count: i64,
    review_count: i64,
    average_rating: f64,
}

#[derive(Deserialize, ToSchema)]
pub struct ChatRequest {
    visitor_id: String,
    question: String,
}

#[derive(Serialize, ToSchema)]
pub struct ChatResponse {
    answer: String,
}

#[derive(Serialize, ToSchema)]
pub struct MessageResponse {
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct TranscriptResponse {
    property_id: String,
    visitor_id: String,
    messages: Vec<MessageResponse>,
    last_updated_at: DateTime<Utc>,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateReviewRequest {
    reviewer_name: String,
    /// 1-5; fractional values are allowed when the rating is an average of
    /// sub-category scores.
    rating: f64,
    #[serde(default)]
    comment: String,
    /// One of `published`, `pending`, `archived`, `reported`. Defaults to
    /// `pending`.
    status: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct CreateReviewResponse {
    review_id: String,
}

#[derive(Serialize, ToSchema)]
pub struct ReviewResponse {
    id: String,
    reviewer_name: String,
    rating: f64,
    status: String,
    comment: String,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateReviewStatusRequest {
    /// One of `published`, `pending`, `archived`, `reported`.
    status: String,
}

#[derive(Serialize, ToSchema)]
pub struct QuotaResponse {
    used: u64,
    /// Absent when the owner's tier is unbounded.
    quota: Option<u64>,
    percentage: f32,
    reset_date: Option<DateTime<Utc>>,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateFaqRequest {
    question: String,
    answer: String,
}

#[derive(Serialize, ToSchema)]
pub struct CreateFaqResponse {
    faq_id: String,
}

#[derive(Serialize, ToSchema)]
pub struct FaqResponse {
    id: String,
    question: String,
    answer: String,
}

//=========================================================================================
// Shared Helpers
//=========================================================================================

type HandlerError = (StatusCode, String);

fn store_err(e: StoreError) -> HandlerError {
    match e {
        StoreError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
        other => {
            error!("store operation failed: {other}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    }
}

fn port_err(e: PortError) -> HandlerError {
    match e {
        PortError::NotFound(what) => (StatusCode::NOT_FOUND, what),
        PortError::Unexpected(reason) => {
            error!("request failed: {reason}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    }
}

/// Turns a whole document payload into per-field `Set` writes so it can be
/// created through the store's merge-write path.
fn doc_writes(map: JsonMap) -> Vec<FieldUpdate> {
    map.into_iter()
        .map(|(field, value)| FieldUpdate::Set(field, value))
        .collect()
}

fn parse_review_status(raw: &str) -> Option<ReviewStatus> {
    match raw {
        "published" => Some(ReviewStatus::Published),
        "pending" => Some(ReviewStatus::Pending),
        "archived" => Some(ReviewStatus::Archived),
        "reported" => Some(ReviewStatus::Reported),
        _ => None,
    }
}

fn review_status_str(status: ReviewStatus) -> &'static str {
    match status {
        ReviewStatus::Published => "published",
        ReviewStatus::Pending => "pending",
        ReviewStatus::Archived => "archived",
        ReviewStatus::Reported => "reported",
    }
}

async fn publish_review_event(app_state: &AppState, event: ReviewEvent) {
    if app_state.review_events.send(event).await.is_err() {
        // The consumer only exits at shutdown; aggregates catch up on the
        // next event after a restart because recomputation is total.
        error!("review event channel closed, aggregation event dropped");
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Register an owner account with a subscription tier.
#[utoipa::path(
    post,
    path = "/owners",
    request_body = CreateOwnerRequest,
    responses(
        (status = 201, description = "Owner created"),
        (status = 400, description = "Invalid tier")
    )
)]
pub async fn create_owner_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateOwnerRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let tier = match payload.tier.as_deref() {
        None | Some("free") => concierge_core::domain::SubscriptionTier::Free,
        Some("pro") => concierge_core::domain::SubscriptionTier::Pro,
        Some("premium") => concierge_core::domain::SubscriptionTier::Premium,
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("'{other}' is not a subscription tier"),
            ))
        }
    };

    let doc = encode(&Owner { tier }).map_err(store_err)?;
    app_state
        .store
        .apply(&paths::owner(&payload.owner_id), doc_writes(doc))
        .await
        .map_err(store_err)?;
    Ok(StatusCode::CREATED)
}

/// Create a property listing.
#[utoipa::path(
    post,
    path = "/properties",
    request_body = CreatePropertyRequest,
    responses(
        (status = 201, description = "Property created", body = CreatePropertyResponse)
    )
)]
pub async fn create_property_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreatePropertyRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let property = Property {
        owner_id: Some(payload.owner_id),
        name: payload.name,
        address: payload.address,
        description: payload.description,
        amenities: payload.amenities,
        rules: payload.rules,
        status: PropertyStatus::Draft,
        message_count: 0,
        message_quota_reset_date: None,
        review_count: 0,
        rating_sum: 0.0,
        average_rating: 0.0,
    };

    let property_id = Uuid::new_v4().to_string();
    let doc = encode(&property).map_err(store_err)?;
    app_state
        .store
        .apply(&paths::property(&property_id), doc_writes(doc))
        .await
        .map_err(store_err)?;

    Ok((
        StatusCode::CREATED,
        Json(CreatePropertyResponse { property_id }),
    ))
}

/// Fetch a property listing with its derived counters.
#[utoipa::path(
    get,
    path = "/properties/{property_id}",
    responses(
        (status = 200, description = "The property", body = PropertyResponse),
        (status = 404, description = "No such property")
    ),
    params(("property_id" = String, Path, description = "The property id"))
)]
pub async fn get_property_handler(
    State(app_state): State<Arc<AppState>>,
    Path(property_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let path = paths::property(&property_id);
    let doc = app_state
        .store
        .get(&path)
        .await
        .map_err(store_err)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Property {property_id} not found"),
            )
        })?;
    let property: Property = decode(&path, doc).map_err(store_err)?;

    Ok(Json(PropertyResponse {
        id: property_id,
        owner_id: property.owner_id,
        name: property.name,
        address: property.address,
        description: property.description,
        amenities: property.amenities,
        rules: property.rules,
        status: match property.status {
            PropertyStatus::Draft => "draft".to_string(),
            PropertyStatus::Published => "published".to_string(),
        },
        message_count: property.message_count,
        review_count: property.review_count,
        average_rating: property.average_rating,
    }))
}

/// Ask the property's concierge a question.
///
/// The answer is returned immediately; conversation logging and usage
/// counting happen in the background and never delay or fail the response.
#[utoipa::path(
    post,
    path = "/properties/{property_id}/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "The concierge's answer", body = ChatResponse),
        (status = 404, description = "No such property")
    ),
    params(("property_id" = String, Path, description = "The property id"))
)]
pub async fn chat_handler(
    State(app_state): State<Arc<AppState>>,
    Path(property_id): Path<String>,
    Json(payload): Json<ChatRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let answer = chat_task::answer_visitor_question(
        app_state.clone(),
        property_id,
        payload.visitor_id,
        payload.question,
    )
    .await
    .map_err(port_err)?;

    Ok(Json(ChatResponse { answer }))
}

/// Fetch the conversation transcript for one visitor.
#[utoipa::path(
    get,
    path = "/properties/{property_id}/chat/{visitor_id}",
    responses(
        (status = 200, description = "The transcript", body = TranscriptResponse),
        (status = 404, description = "No conversation yet")
    ),
    params(
        ("property_id" = String, Path, description = "The property id"),
        ("visitor_id" = String, Path, description = "The visitor id")
    )
)]
pub async fn get_transcript_handler(
    State(app_state): State<Arc<AppState>>,
    Path((property_id, visitor_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    let path = paths::chat_log(&property_id, &visitor_id);
    let doc = app_state
        .store
        .get(&path)
        .await
        .map_err(store_err)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                "No conversation recorded for this visitor".to_string(),
            )
        })?;
    let log: ChatLog = decode(&path, doc).map_err(store_err)?;

    Ok(Json(TranscriptResponse {
        property_id: log.property_id,
        visitor_id: log.client_id,
        messages: log
            .messages
            .into_iter()
            .map(|m| MessageResponse {
                role: match m.role {
                    concierge_core::domain::MessageRole::User => "user".to_string(),
                    concierge_core::domain::MessageRole::Assistant => "assistant".to_string(),
                },
                content: m.content,
                created_at: m.created_at,
            })
            .collect(),
        last_updated_at: log.last_updated_at,
    }))
}

/// Leave a review on a property.
#[utoipa::path(
    post,
    path = "/properties/{property_id}/reviews",
    request_body = CreateReviewRequest,
    responses(
        (status = 201, description = "Review created", body = CreateReviewResponse),
        (status = 400, description = "Invalid status or rating"),
        (status = 404, description = "No such property")
    ),
    params(("property_id" = String, Path, description = "The property id"))
)]
pub async fn create_review_handler(
    State(app_state): State<Arc<AppState>>,
    Path(property_id): Path<String>,
    Json(payload): Json<CreateReviewRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    if !(1.0..=5.0).contains(&payload.rating) {
        return Err((
            StatusCode::BAD_REQUEST,
            "rating must be between 1 and 5".to_string(),
        ));
    }
    let status = match payload.status.as_deref() {
        None => ReviewStatus::Pending,
        Some(raw) => parse_review_status(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("'{raw}' is not a review status"),
            )
        })?,
    };

    let property_path = paths::property(&property_id);
    let property_doc = app_state
        .store
        .get(&property_path)
        .await
        .map_err(store_err)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Property {property_id} not found"),
            )
        })?;
    let property: Property = decode(&property_path, property_doc).map_err(store_err)?;

    let review = Review {
        owner_id: property.owner_id,
        reviewer_name: payload.reviewer_name,
        rating: payload.rating,
        status,
        comment: payload.comment,
        created_at: Utc::now(),
    };
    let review_id = Uuid::new_v4().to_string();
    let doc = encode(&review).map_err(store_err)?;
    app_state
        .store
        .apply(&paths::review(&property_id, &review_id), doc_writes(doc))
        .await
        .map_err(store_err)?;

    publish_review_event(&app_state, ReviewEvent::Created { property_id }).await;

    Ok((StatusCode::CREATED, Json(CreateReviewResponse { review_id })))
}

/// List a property's reviews.
#[utoipa::path(
    get,
    path = "/properties/{property_id}/reviews",
    responses(
        (status = 200, description = "All reviews for the property", body = [ReviewResponse])
    ),
    params(("property_id" = String, Path, description = "The property id"))
)]
pub async fn list_reviews_handler(
    State(app_state): State<Arc<AppState>>,
    Path(property_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let entries = app_state
        .store
        .list(&paths::reviews_collection(&property_id))
        .await
        .map_err(store_err)?;

    let reviews: Vec<ReviewResponse> = entries
        .into_iter()
        .filter_map(|(path, data)| {
            let review: Review = decode(&path, data).ok()?;
            Some(ReviewResponse {
                id: path.doc_id().to_string(),
                reviewer_name: review.reviewer_name,
                rating: review.rating,
                status: review_status_str(review.status).to_string(),
                comment: review.comment,
                created_at: review.created_at,
            })
        })
        .collect();

    Ok(Json(reviews))
}

/// Change a review's status (moderation).
#[utoipa::path(
    patch,
    path = "/properties/{property_id}/reviews/{review_id}",
    request_body = UpdateReviewStatusRequest,
    responses(
        (status = 204, description = "Status updated"),
        (status = 400, description = "Invalid status"),
        (status = 404, description = "No such review")
    ),
    params(
        ("property_id" = String, Path, description = "The property id"),
        ("review_id" = String, Path, description = "The review id")
    )
)]
pub async fn update_review_status_handler(
    State(app_state): State<Arc<AppState>>,
    Path((property_id, review_id)): Path<(String, String)>,
    Json(payload): Json<UpdateReviewStatusRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let status_after = parse_review_status(&payload.status).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("'{}' is not a review status", payload.status),
        )
    })?;

    let path = paths::review(&property_id, &review_id);
    let doc = app_state
        .store
        .get(&path)
        .await
        .map_err(store_err)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Review {review_id} not found"),
            )
        })?;
    let review: Review = decode(&path, doc).map_err(store_err)?;
    let status_before = review.status;

    app_state
        .store
        .apply(
            &path,
            vec![FieldUpdate::set(
                "status",
                serde_json::json!(review_status_str(status_after)),
            )],
        )
        .await
        .map_err(store_err)?;

    publish_review_event(
        &app_state,
        ReviewEvent::Updated {
            property_id,
            status_before,
            status_after,
        },
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// Delete a review.
#[utoipa::path(
    delete,
    path = "/properties/{property_id}/reviews/{review_id}",
    responses(
        (status = 204, description = "Review deleted")
    ),
    params(
        ("property_id" = String, Path, description = "The property id"),
        ("review_id" = String, Path, description = "The review id")
    )
)]
pub async fn delete_review_handler(
    State(app_state): State<Arc<AppState>>,
    Path((property_id, review_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    app_state
        .store
        .delete(&paths::review(&property_id, &review_id))
        .await
        .map_err(store_err)?;

    publish_review_event(&app_state, ReviewEvent::Deleted { property_id }).await;

    Ok(StatusCode::NO_CONTENT)
}

/// Read a property's monthly message quota usage.
#[utoipa::path(
    get,
    path = "/properties/{property_id}/quota",
    responses(
        (status = 200, description = "Quota usage", body = QuotaResponse),
        (status = 404, description = "No such property")
    ),
    params(("property_id" = String, Path, description = "The property id"))
)]
pub async fn get_quota_handler(
    State(app_state): State<Arc<AppState>>,
    Path(property_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let path = paths::property(&property_id);
    let doc = app_state
        .store
        .get(&path)
        .await
        .map_err(store_err)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Property {property_id} not found"),
            )
        })?;
    let property: Property = decode(&path, doc).map_err(store_err)?;

    // Owners created before tiers existed read as free.
    let tier = match &property.owner_id {
        Some(owner_id) => {
            let owner_path = paths::owner(owner_id);
            match app_state.store.get(&owner_path).await.map_err(store_err)? {
                Some(owner_doc) => {
                    let owner: Owner = decode(&owner_path, owner_doc).map_err(store_err)?;
                    owner.tier
                }
                None => Default::default(),
            }
        }
        None => Default::default(),
    };

    let snapshot = quota::usage(tier, &property);
    Ok(Json(QuotaResponse {
        used: snapshot.used,
        quota: snapshot.quota,
        percentage: snapshot.percentage,
        reset_date: snapshot.reset_date,
    }))
}

/// Add an FAQ entry to a property.
#[utoipa::path(
    post,
    path = "/properties/{property_id}/faqs",
    request_body = CreateFaqRequest,
    responses(
        (status = 201, description = "FAQ created", body = CreateFaqResponse)
    ),
    params(("property_id" = String, Path, description = "The property id"))
)]
pub async fn create_faq_handler(
    State(app_state): State<Arc<AppState>>,
    Path(property_id): Path<String>,
    Json(payload): Json<CreateFaqRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let faq = Faq {
        question: payload.question,
        answer: payload.answer,
    };
    let faq_id = Uuid::new_v4().to_string();
    let doc = encode(&faq).map_err(store_err)?;
    app_state
        .store
        .apply(&paths::faq(&property_id, &faq_id), doc_writes(doc))
        .await
        .map_err(store_err)?;

    Ok((StatusCode::CREATED, Json(CreateFaqResponse { faq_id })))
}

/// List a property's FAQ entries.
#[utoipa::path(
    get,
    path = "/properties/{property_id}/faqs",
    responses(
        (status = 200, description = "All FAQ entries", body = [FaqResponse])
    ),
    params(("property_id" = String, Path, description = "The property id"))
)]
pub async fn list_faqs_handler(
    State(app_state): State<Arc<AppState>>,
    Path(property_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let entries = app_state
        .store
        .list(&paths::faqs_collection(&property_id))
        .await
        .map_err(store_err)?;

    let faqs: Vec<FaqResponse> = entries
        .into_iter()
        .filter_map(|(path, data)| {
            let faq: Faq = decode(&path, data).ok()?;
            Some(FaqResponse {
                id: path.doc_id().to_string(),
                question: faq.question,
                answer: faq.answer,
            })
        })
        .collect();

    Ok(Json(faqs))
}

/// Read how often each FAQ was served as a best match.
#[utoipa::path(
    get,
    path = "/properties/{property_id}/faqs/usage",
    responses(
        (status = 200, description = "faqId -> usage count")
    ),
    params(("property_id" = String, Path, description = "The property id"))
)]
pub async fn get_faq_usage_handler(
    State(app_state): State<Arc<AppState>>,
    Path(property_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let counts: HashMap<String, i64> = app_state
        .faq_usage
        .usage_counts(&property_id)
        .await
        .map_err(store_err)?;
    Ok(Json(counts))
}
