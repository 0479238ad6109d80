use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{HeaderValue, Method, StatusCode},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use quickchat_shared::{ChatMessage, MessageBody, UserId};
use quickchat_store::UnseenCounts;

use crate::auth::{AuthUser, SessionAuthenticator};
use crate::config::ServerConfig;
use crate::connection::ws_handler;
use crate::delivery::DeliveryRouter;
use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::store::MessageStore;

#[derive(Clone)]
pub struct AppState {
    pub store: MessageStore,
    pub registry: PresenceRegistry,
    pub delivery: DeliveryRouter,
    pub authenticator: Arc<SessionAuthenticator>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the components together. The registry starts empty.
    pub fn new(config: ServerConfig, store: MessageStore) -> Self {
        let registry = PresenceRegistry::new();
        let delivery = DeliveryRouter::new(store.clone(), registry.clone(), config.push_timeout);
        Self {
            authenticator: Arc::new(SessionAuthenticator::new(&config.jwt_secret)),
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            store,
            registry,
            delivery,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let origin = match state.config.cors_origin.as_deref() {
        Some(origin) => match HeaderValue::from_str(origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                warn!(origin, "Invalid CORS_ORIGIN, allowing any origin");
                AllowOrigin::any()
            }
        },
        None => AllowOrigin::any(),
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    // The static `unseen` and `online` segments take precedence over
    // `{peer}`, so those two names cannot be used as a history peer id.
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/api/messages/unseen", get(unseen_counts))
        .route("/api/messages/online", get(online_users))
        .route("/api/messages/{peer}", get(get_history))
        .route("/api/messages/send/{peer}", post(send_message))
        .route("/api/messages/mark/{peer}", get(mark_seen).put(mark_seen))
        .route("/api/messages/markseen/{peer}", post(mark_seen))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkSeenResponse {
    success: bool,
    updated: usize,
    message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnseenResponse {
    success: bool,
    unseen_messages: UnseenCounts,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OnlineResponse {
    online_users: Vec<UserId>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Conversation between the caller and `peer`, oldest first.
async fn get_history(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(peer): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ServerError> {
    let peer = UserId::new(peer);
    let messages = state.store.history(&me, &peer).await?;
    Ok(Json(messages))
}

async fn send_message(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(peer): Path<String>,
    body: Result<Json<MessageBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatMessage>), ServerError> {
    let Json(body) = body?;
    let peer = UserId::new(peer);
    let stored = state.delivery.deliver(&me, &peer, body).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Mark everything `peer` sent to the caller as seen.
async fn mark_seen(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(peer): Path<String>,
) -> Result<Json<MarkSeenResponse>, ServerError> {
    let peer = UserId::new(peer);
    let updated = state.store.mark_seen(&peer, &me).await?;
    if updated > 0 {
        info!(reader = %me.short(), from = %peer.short(), updated, "Messages marked as seen");
    }
    Ok(Json(MarkSeenResponse {
        success: true,
        updated,
        message: "Messages marked as seen",
    }))
}

async fn unseen_counts(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<UnseenResponse>, ServerError> {
    let unseen_messages = state.store.unseen_counts(&me).await?;
    Ok(Json(UnseenResponse {
        success: true,
        unseen_messages,
    }))
}

async fn online_users(
    AuthUser(_me): AuthUser,
    State(state): State<AppState>,
) -> Json<OnlineResponse> {
    let online_users = state.registry.broadcaster().latest().to_vec();
    Json(OnlineResponse { online_users })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
