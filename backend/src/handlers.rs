use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;

use crate::auth;
use crate::config::AppConfig;
use crate::error::BargainResult;
use crate::models::{
    Actor, Bargain, BargainId, BargainedPrice, CheckoutRequest, LoginRequest, OpenBargainRequest,
    Party, PostMessageRequest, RevisionQuery,
};
use crate::service::BargainService;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub service: BargainService,
}

impl AppState {
    pub fn new(config: AppConfig, service: BargainService) -> Self {
        Self { config, service }
    }
}

/// Resolves the bearer token into the acting party for downstream handlers.
async fn authenticate(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Result<axum::response::Response, (StatusCode, String)> {
    let auth_header = headers.get("Authorization").ok_or((
        StatusCode::UNAUTHORIZED,
        "Missing Authorization header".to_string(),
    ))?;
    let token = auth_header
        .to_str()
        .ok()
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "Invalid Authorization header format".to_string(),
        ))?;
    let actor = auth::validate_token(token, &state.config.jwt_secret).map_err(|_| {
        (
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token".to_string(),
        )
    })?;
    log::debug!("Authenticated {} {}", actor.party, actor.user_id);
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let actor = Actor {
        user_id: req.user_id,
        party: req.role,
    };
    let token = auth::create_token(&actor, &state.config.jwt_secret).map_err(|e| {
        log::error!("Failed to issue token: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Could not issue token".to_string())
    })?;
    Ok(Json(json!({"token": token})))
}

async fn open_bargain(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<OpenBargainRequest>,
) -> BargainResult<impl IntoResponse> {
    let opened = state.service.open(&actor, req).await?;
    let status = if opened.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({"bargain": opened.bargain, "created": opened.created})),
    ))
}

async fn list_bargains(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> BargainResult<Json<Vec<Bargain>>> {
    Ok(Json(state.service.list_for(&actor).await?))
}

async fn get_bargain(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<BargainId>,
) -> BargainResult<Json<Bargain>> {
    Ok(Json(state.service.get(&actor, id).await?))
}

async fn delete_bargain(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<BargainId>,
) -> BargainResult<Json<serde_json::Value>> {
    let removed = state.service.delete(&actor, id).await?;
    Ok(Json(json!({"status": "Bargain deleted", "id": removed.id})))
}

async fn post_message(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<BargainId>,
    Query(rev): Query<RevisionQuery>,
    Json(req): Json<PostMessageRequest>,
) -> BargainResult<Json<Bargain>> {
    let bargain = state
        .service
        .post_message(id, actor, req.text, rev.expected_revision)
        .await?;
    Ok(Json(bargain))
}

async fn accept_offer(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<BargainId>,
    Query(rev): Query<RevisionQuery>,
) -> BargainResult<Json<Bargain>> {
    let bargain = state
        .service
        .accept_last_offer(id, actor, rev.expected_revision)
        .await?;
    Ok(Json(bargain))
}

async fn reject_offer(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<BargainId>,
    Query(rev): Query<RevisionQuery>,
) -> BargainResult<Json<Bargain>> {
    let bargain = state
        .service
        .reject_last_offer(id, actor, rev.expected_revision)
        .await?;
    Ok(Json(bargain))
}

async fn deal_done(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<BargainId>,
    Query(rev): Query<RevisionQuery>,
) -> BargainResult<Json<Bargain>> {
    let bargain = state
        .service
        .confirm_deal_done(id, actor, rev.expected_revision)
        .await?;
    Ok(Json(bargain))
}

async fn attention(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> BargainResult<Json<serde_json::Value>> {
    let count = state.service.attention_count(&actor).await?;
    Ok(Json(json!({"count": count})))
}

async fn bargained_prices(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<Vec<BargainedPrice>>, (StatusCode, String)> {
    if actor.party != Party::Vendor {
        return Err((StatusCode::FORBIDDEN, "Only vendors have cart prices".to_string()));
    }
    Ok(Json(state.service.prices().for_vendor(actor.user_id).await))
}

async fn checkout(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CheckoutRequest>,
) -> BargainResult<Json<serde_json::Value>> {
    let completed = state.service.checkout(&actor, &req.product_ids).await?;
    let ids: Vec<BargainId> = completed.iter().map(|b| b.id).collect();
    Ok(Json(json!({"status": "Checkout recorded", "completed": ids})))
}

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/bargains", post(open_bargain).get(list_bargains))
        .route("/bargains/:id", get(get_bargain).delete(delete_bargain))
        .route("/bargains/:id/messages", post(post_message))
        .route("/bargains/:id/accept", post(accept_offer))
        .route("/bargains/:id/reject", post(reject_offer))
        .route("/bargains/:id/deal-done", post(deal_done))
        .route("/attention", get(attention))
        .route("/prices", get(bargained_prices))
        .route("/checkout", post(checkout))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/", get(|| async { "Hello, Mitra bargaining!" }))
        .route("/login", post(login))
        .merge(protected_routes)
        .with_state(state)
}
