mod config;
mod messenger;
mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Json, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use teleassist_agents::SupportAgent;
use teleassist_core::{
    default_catalog, load_catalog_file, Channel, IntentCatalogEntry, Language, MessageInput,
    SupportError,
};
use teleassist_observability::{AppMetrics, MetricsSnapshot};
use teleassist_storage::{seed_catalog_if_empty, Store};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub use crate::config::ApiConfig;
pub use crate::messenger::MessengerConfig;
use crate::messenger::{
    verify_signature, verify_subscription, InboundText, MessengerClient, SeenMids, VerifyQuery,
    WebhookPayload,
};
use crate::rate_limit::SlidingWindowLimiter;

const MAX_MESSAGE_CHARS: usize = 2_000;
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

#[derive(Clone)]
#[allow(private_interfaces)]
pub struct ApiState {
    pub agent: Arc<SupportAgent<Store>>,
    pub metrics: Arc<AppMetrics>,
    pub api_key: String,
    pub limiter: SlidingWindowLimiter,
    pub messenger: MessengerConfig,
    pub messenger_client: Option<MessengerClient>,
    pub seen_mids: SeenMids,
    pub allowed_origins: Arc<Vec<String>>,
    pub store_backend: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp_utc: String,
    store: &'static str,
    metrics: MetricsSnapshot,
    capabilities: HealthCapabilities,
}

#[derive(Debug, Serialize)]
struct HealthCapabilities {
    messenger_signature_check: bool,
    messenger_outbound: bool,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    conversation_id: Option<String>,
    text: String,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    text: String,
    language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CreateConversationRequest {
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SetActiveRequest {
    active: bool,
}

pub async fn build_app(config: ApiConfig) -> Result<Router> {
    let metrics = AppMetrics::shared();

    let store = Store::from_optional_url(config.database_url.as_deref()).await?;
    let catalog = match config.catalog_path.as_ref() {
        Some(path) => load_catalog_file(path)?,
        None => default_catalog(),
    };
    seed_catalog_if_empty(&store, &catalog)
        .await
        .context("failed to seed intent catalog")?;
    let store_backend = store.backend();

    let agent = Arc::new(SupportAgent::new(Arc::new(store), metrics.clone()));

    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(6))
        .timeout(Duration::from_secs(20))
        .build()
        .context("failed to build HTTP client")?;
    let messenger_client = MessengerClient::from_config(http_client, &config.messenger);
    if config.messenger.app_secret.is_none() {
        warn!("MESSENGER_APP_SECRET not set; webhook signatures will not be verified");
    }
    if messenger_client.is_none() {
        info!("MESSENGER_PAGE_ACCESS_TOKEN not set; messenger replies are stored but not sent");
    }

    let state = ApiState {
        agent,
        metrics,
        api_key: config.api_key,
        limiter: SlidingWindowLimiter::new(config.rate_limit_window, config.rate_limit_max),
        messenger: config.messenger,
        messenger_client,
        seen_mids: SeenMids::default(),
        allowed_origins: Arc::new(config.allowed_origins),
        store_backend,
    };

    Ok(build_router(state))
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat", post(chat))
        .route("/v1/classify", post(classify_preview))
        .route(
            "/v1/conversations",
            get(conversations_list).post(conversation_create),
        )
        .route("/v1/conversations/:conversation_id", get(conversation_get))
        .route(
            "/v1/conversations/:conversation_id/close",
            post(conversation_close),
        )
        .route("/v1/catalog", get(catalog_list).post(catalog_upsert))
        .route("/v1/catalog/:intent/active", post(catalog_set_active))
        .route(
            "/webhook/messenger",
            get(messenger_verify).post(messenger_receive),
        )
        .layer(build_cors_layer(&state.allowed_origins))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        timestamp_utc: chrono::Utc::now().to_rfc3339(),
        store: state.store_backend,
        metrics: state.metrics.snapshot(),
        capabilities: HealthCapabilities {
            messenger_signature_check: state.messenger.app_secret.is_some(),
            messenger_outbound: state.messenger_client.is_some(),
        },
    })
}

async fn chat(State(state): State<ApiState>, Json(request): Json<ChatRequest>) -> Response {
    if let Err(response) = check_text(&request.text) {
        return response;
    }
    let language = match parse_language(request.language.as_deref()) {
        Ok(language) => language,
        Err(response) => return response,
    };

    let input = MessageInput {
        conversation_id: request.conversation_id,
        channel: Channel::Web,
        external_user_id: None,
        text: request.text,
        language,
    };

    match state.agent.handle_message(input).await {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => error_response(err),
    }
}

async fn classify_preview(
    State(state): State<ApiState>,
    Json(request): Json<ClassifyRequest>,
) -> Response {
    if request.text.chars().count() > MAX_MESSAGE_CHARS {
        return bad_request("text_too_long", "text exceeds the maximum message length");
    }
    let language = match parse_language(request.language.as_deref()) {
        Ok(language) => language,
        Err(response) => return response,
    };

    match state.agent.classify_text(&request.text, language).await {
        Ok(preview) => Json(preview).into_response(),
        Err(err) => error_response(err),
    }
}

async fn conversations_list(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    match state.agent.list_conversations(limit).await {
        Ok(conversations) => Json(serde_json::json!({ "conversations": conversations })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn conversation_create(
    State(state): State<ApiState>,
    request: Option<Json<CreateConversationRequest>>,
) -> Response {
    let request = request.map(|Json(value)| value).unwrap_or_default();
    let language = match parse_language(request.language.as_deref()) {
        Ok(language) => language.unwrap_or(Language::Fr),
        Err(response) => return response,
    };

    match state
        .agent
        .start_conversation(Channel::Web, None, language)
        .await
    {
        Ok(conversation) => (StatusCode::CREATED, Json(conversation)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn conversation_get(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.agent.conversation(&conversation_id).await {
        Ok(transcript) => Json(transcript).into_response(),
        Err(err) => error_response(err),
    }
}

async fn conversation_close(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.agent.close_conversation(&conversation_id).await {
        Ok(conversation) => Json(conversation).into_response(),
        Err(err) => error_response(err),
    }
}

async fn catalog_list(State(state): State<ApiState>) -> Response {
    match state.agent.catalog().await {
        Ok(entries) => Json(serde_json::json!({ "entries": entries })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn catalog_upsert(
    State(state): State<ApiState>,
    Json(entry): Json<IntentCatalogEntry>,
) -> Response {
    match state.agent.upsert_catalog_entry(entry).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => error_response(err),
    }
}

async fn catalog_set_active(
    State(state): State<ApiState>,
    Path(intent): Path<String>,
    Json(request): Json<SetActiveRequest>,
) -> Response {
    match state
        .agent
        .set_catalog_entry_active(&intent, request.active)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "intent": intent, "active": request.active }))
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn messenger_verify(
    State(state): State<ApiState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    match verify_subscription(&query, &state.messenger.verify_token) {
        Some(challenge) => {
            info!("messenger webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        None => StatusCode::FORBIDDEN.into_response(),
    }
}

async fn messenger_receive(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.metrics.inc_webhook_event();

    if let Some(secret) = state.messenger.app_secret.as_deref() {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(signature, &body, secret) {
            warn!("rejected messenger webhook with invalid signature");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    if payload.object != "page" {
        return StatusCode::NOT_FOUND.into_response();
    }

    for inbound in payload.inbound_texts() {
        dispatch_messenger_text(&state, inbound).await;
    }

    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

async fn dispatch_messenger_text(state: &ApiState, inbound: InboundText) {
    if let Some(mid) = inbound.mid.as_deref() {
        if !state.seen_mids.first_delivery(mid) {
            debug!(mid, "skipping redelivered messenger message");
            return;
        }
    }

    let sender_id = inbound.sender_id.clone();
    let input = MessageInput {
        conversation_id: None,
        channel: Channel::Messenger,
        external_user_id: Some(inbound.sender_id),
        text: inbound.text,
        language: None,
    };

    let reply = match state.agent.handle_message(input).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(
                sender_id = %sender_id,
                mid = ?inbound.mid,
                error = %format!("{err:#}"),
                "messenger message failed"
            );
            return;
        }
    };

    let Some(bot_message) = reply.bot_message else {
        return;
    };
    let Some(client) = state.messenger_client.clone() else {
        debug!(sender_id = %sender_id, "messenger reply not sent; no page access token");
        return;
    };

    // The webhook ack does not wait on the Send API.
    let metrics = state.metrics.clone();
    let conversation_id = reply.conversation_id;
    tokio::spawn(async move {
        if let Err(err) = client.send_text(&sender_id, &bot_message.text).await {
            metrics.inc_outbound_failure();
            warn!(
                sender_id = %sender_id,
                conversation_id = %conversation_id,
                error = %format!("{err:#}"),
                "messenger reply delivery failed"
            );
        }
    });
}

fn check_text(text: &str) -> Result<(), Response> {
    if text.trim().is_empty() {
        return Err(bad_request("empty_text", "text must not be empty"));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(bad_request(
            "text_too_long",
            "text exceeds the maximum message length",
        ));
    }
    Ok(())
}

fn parse_language(value: Option<&str>) -> Result<Option<Language>, Response> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(raw) => Language::from_optional_str(Some(raw))
            .map(Some)
            .ok_or_else(|| bad_request("unsupported_language", "language must be `ar` or `fr`")),
    }
}

fn bad_request(code: &str, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": code, "message": message })),
    )
        .into_response()
}

fn error_response(err: anyhow::Error) -> Response {
    let (status, code) = match err.downcast_ref::<SupportError>() {
        Some(SupportError::ConversationNotFound(_)) => {
            (StatusCode::NOT_FOUND, "conversation_not_found")
        }
        Some(SupportError::IntentNotFound(_)) => (StatusCode::NOT_FOUND, "intent_not_found"),
        Some(SupportError::ConversationClosed(_)) => (StatusCode::CONFLICT, "conversation_closed"),
        Some(SupportError::InvalidCatalog(_)) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_catalog")
        }
        None => {
            error!(error = %format!("{err:#}"), "request failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal_error",
                    "message": "unexpected server error"
                })),
            )
                .into_response();
        }
    };

    (
        status,
        Json(serde_json::json!({ "error": code, "message": err.to_string() })),
    )
        .into_response()
}

fn is_public_endpoint(path: &str) -> bool {
    matches!(path, "/health" | "/webhook/messenger")
}

fn request_origin_is_allowed(state: &ApiState, headers: &HeaderMap) -> bool {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim()
        .trim_end_matches('/');

    !origin.is_empty() && state.allowed_origins.iter().any(|value| value == origin)
}

async fn api_key_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || is_public_endpoint(request.uri().path()) {
        return next.run(request).await;
    }

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    // The chat widget is served from an allowed origin and carries no key.
    if header_key == state.api_key || request_origin_is_allowed(&state, request.headers()) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "unauthorized",
            "message": "missing or invalid x-api-key, and request origin is not allowed"
        })),
    )
        .into_response()
}

async fn rate_limit_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || is_public_endpoint(request.uri().path()) {
        return next.run(request).await;
    }

    let ip = request_ip(&request);
    if !state.limiter.allow(&ip) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "rate_limited",
                "message": "rate limit exceeded for this IP"
            })),
        )
            .into_response();
    }

    next.run(request).await
}

fn request_ip(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

fn build_cors_layer(allowed_origins: &Arc<Vec<String>>) -> CorsLayer {
    let origins = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
        ])
}

async fn security_headers_middleware(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'; base-uri 'none'"),
    );

    response
}
