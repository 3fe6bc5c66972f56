use crate::auth::{self, IdentityApi, TokenSigner};
use crate::blobs::BlobStore;
use crate::classify::ClassifierApi;
use crate::error::ApiError;
use crate::geofence::{self, GeofenceError, VerificationGate};
use crate::ledger::{self, Submission};
use crate::limiter::{self, RateLimiter};
use crate::models::{Challenge, ChallengeStatus, GeoPoint};
use crate::store::Store;
use crate::{achievements, blobs, classify, store};
use anyhow::Result;
use axum::{
    extract::{Multipart, Path, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use axum_extra::TypedHeader;
use chrono::Utc;
use headers::{authorization::Bearer, Authorization};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{env, net::SocketAddr, sync::Arc};
use tracing::{debug, info, warn};

const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_PORT: u16 = 8080;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub classifier: Arc<dyn ClassifierApi>,
    pub blobs: Arc<dyn BlobStore>,
    pub identity: Arc<dyn IdentityApi>,
    pub gate: Arc<dyn VerificationGate>,
    pub tokens: TokenSigner,
    pub limiter: Arc<RateLimiter>,
}

pub async fn run_server() -> Result<()> {
    let state = AppState {
        store: Arc::new(store::MemoryStore::new()),
        classifier: Arc::new(classify::HttpClassifier::from_env()?),
        blobs: Arc::new(blobs::DiskBlobStore::from_env()),
        identity: Arc::new(auth::HttpIdentity::from_env()?),
        gate: Arc::new(geofence::EnvGate),
        tokens: TokenSigner::from_env()?,
        limiter: Arc::new(RateLimiter::new()),
    };
    state.limiter.clone().spawn_sweeper();

    let app = build_router(state);

    let port = env::var("CLEANSWEEP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/auth/login", post(login))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            limiter::strict_limit,
        ));

    Router::new()
        .merge(auth_routes)
        .route("/cleanups/upload", post(upload_cleanup))
        .route("/cleanups/manual", post(manual_cleanup))
        .route("/challenges/:id/join", post(join_challenge))
        .route("/challenges/:id/leave", post(leave_challenge))
        .route("/achievements", get(list_achievements))
        .route("/achievements/leaderboard", get(get_leaderboard))
        .route("/achievements/milestones", get(get_milestones))
        .route("/achievements/stats", get(get_stats))
        .layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            limiter::general_limit,
        ))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = state
        .identity
        .authenticate(&body.email, &body.password)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".into()))?;
    info!("Issued token for user {}", user_id);
    Ok(Json(json!({
        "success": true,
        "token": state.tokens.sign(&user_id),
    })))
}

/// Resolve the challenge and apply the geofence gate. Runs before any
/// mutation so a rejection leaves no partial state.
async fn gated_challenge(
    state: &AppState,
    user_id: &str,
    challenge_id: &str,
    location: Option<GeoPoint>,
) -> Result<Challenge, ApiError> {
    let challenge = state
        .store
        .challenge(challenge_id)
        .await?
        .ok_or(ApiError::NotFound("Challenge"))?;
    if challenge.status_at(Utc::now()) != ChallengeStatus::Active {
        return Err(ApiError::BadRequest("Challenge is not active".into()));
    }
    geofence_gate(state, user_id, &challenge, location).await?;
    Ok(challenge)
}

async fn geofence_gate(
    state: &AppState,
    user_id: &str,
    challenge: &Challenge,
    location: Option<GeoPoint>,
) -> Result<(), ApiError> {
    if state.gate.bypass(user_id) {
        debug!("Geofence bypassed for user {}", user_id);
        return Ok(());
    }
    if location.is_none() {
        return Err(ApiError::LocationRequired);
    }
    let max_distance_km = state.gate.max_distance_km();
    let check = geofence::validate(location, challenge.location.as_ref(), max_distance_km)
        .map_err(|e| match e {
            GeofenceError::UserLocationInvalid => {
                ApiError::LocationInvalid("Invalid location coordinates".into())
            }
            GeofenceError::ChallengeLocationInvalid => {
                ApiError::LocationInvalid("Challenge has no registered location".into())
            }
        })?;
    if !check.valid {
        return Err(ApiError::LocationTooFar {
            distance_km: check.distance_km,
            max_distance_km,
        });
    }
    debug!("{}", check.message);
    Ok(())
}

fn parse_location(latitude: Option<f64>, longitude: Option<f64>) -> Option<GeoPoint> {
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualCleanupRequest {
    challenge_id: String,
    label: String,
    item_count: u64,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

async fn manual_cleanup(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Json(body): Json<ManualCleanupRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = auth::bearer_user(&state.tokens, bearer.as_ref())?;
    if body.item_count == 0 {
        return Err(ApiError::BadRequest("itemCount must be at least 1".into()));
    }
    let location = parse_location(body.latitude, body.longitude);
    gated_challenge(&state, &user_id, &body.challenge_id, location).await?;

    let record = ledger::record(
        state.store.as_ref(),
        Submission {
            user_id,
            challenge_id: body.challenge_id,
            item_count: body.item_count,
            label: body.label,
            confidence: 1.0,
            image_id: None,
        },
    )
    .await?;
    Ok(Json(json!({
        "success": true,
        "label": record.label,
        "confidence": record.confidence,
        "itemCount": record.item_count,
        "contributionId": record.id,
    })))
}

struct UploadFields {
    image: Vec<u8>,
    challenge_id: Option<String>,
    item_count: u64,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadFields, ApiError> {
    let mut fields = UploadFields {
        image: Vec::new(),
        challenge_id: None,
        item_count: 1,
        latitude: None,
        longitude: None,
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Unreadable image field: {}", e)))?;
                if bytes.len() > MAX_IMAGE_BYTES {
                    return Err(ApiError::BadRequest("Image too large".into()));
                }
                fields.image = bytes.to_vec();
            }
            "challengeId" => {
                fields.challenge_id = Some(text_field(field).await?);
            }
            "itemCount" => {
                fields.item_count = text_field(field)
                    .await?
                    .parse()
                    .map_err(|_| ApiError::BadRequest("Invalid itemCount".into()))?;
            }
            "latitude" => {
                fields.latitude = Some(parse_coord(field).await?);
            }
            "longitude" => {
                fields.longitude = Some(parse_coord(field).await?);
            }
            other => debug!("Ignoring unknown multipart field {:?}", other),
        }
    }
    Ok(fields)
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Unreadable form field: {}", e)))
}

async fn parse_coord(field: axum::extract::multipart::Field<'_>) -> Result<f64, ApiError> {
    text_field(field)
        .await?
        .trim()
        .parse()
        .map_err(|_| ApiError::LocationInvalid("Invalid location coordinates".into()))
}

async fn upload_cleanup(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let user_id = auth::bearer_user(&state.tokens, bearer.as_ref())?;
    let fields = read_upload(multipart).await?;
    if fields.image.is_empty() {
        return Err(ApiError::BadRequest("Image is required".into()));
    }
    let challenge_id = fields
        .challenge_id
        .ok_or_else(|| ApiError::BadRequest("challengeId is required".into()))?;
    if fields.item_count == 0 {
        return Err(ApiError::BadRequest("itemCount must be at least 1".into()));
    }
    let location = parse_location(fields.latitude, fields.longitude);
    gated_challenge(&state, &user_id, &challenge_id, location).await?;

    // Classification must complete before any counter moves; a timeout or
    // model failure rejects the whole submission so the client can fall
    // back to manual entry.
    let classification = match state.classifier.classify(&fields.image).await {
        Ok(c) => c,
        Err(e) => {
            warn!("Classification failed: {:?}", e);
            return Err(ApiError::ClassificationUnavailable);
        }
    };
    let image_id = state.blobs.store(&fields.image).await?;

    let record = ledger::record(
        state.store.as_ref(),
        Submission {
            user_id,
            challenge_id,
            item_count: fields.item_count,
            label: classification.label,
            confidence: classification.confidence,
            image_id: Some(image_id),
        },
    )
    .await?;
    Ok(Json(json!({
        "success": true,
        "label": record.label,
        "confidence": record.confidence,
        "itemCount": record.item_count,
        "imageId": record.image_id,
        "contributionId": record.id,
    })))
}

#[derive(Deserialize, Default)]
struct MembershipRequest {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

async fn join_challenge(
    State(state): State<AppState>,
    Path(challenge_id): Path<String>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    body: Option<Json<MembershipRequest>>,
) -> Result<Json<Value>, ApiError> {
    let user_id = auth::bearer_user(&state.tokens, bearer.as_ref())?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let location = parse_location(body.latitude, body.longitude);
    gated_challenge(&state, &user_id, &challenge_id, location).await?;
    ledger::join(state.store.as_ref(), &user_id, &challenge_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Joined challenge",
    })))
}

async fn leave_challenge(
    State(state): State<AppState>,
    Path(challenge_id): Path<String>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    body: Option<Json<MembershipRequest>>,
) -> Result<Json<Value>, ApiError> {
    let user_id = auth::bearer_user(&state.tokens, bearer.as_ref())?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let location = parse_location(body.latitude, body.longitude);
    // Leave is gated like join, but an ended challenge can still be left.
    let challenge = state
        .store
        .challenge(&challenge_id)
        .await?
        .ok_or(ApiError::NotFound("Challenge"))?;
    geofence_gate(&state, &user_id, &challenge, location).await?;
    ledger::leave(state.store.as_ref(), &user_id, &challenge_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Left challenge",
    })))
}

async fn list_achievements(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<Value>, ApiError> {
    let user_id = auth::bearer_user(&state.tokens, bearer.as_ref())?;
    let achievements = achievements::evaluate(state.store.as_ref(), &user_id).await?;
    Ok(Json(json!({
        "success": true,
        "achievements": achievements,
    })))
}

async fn get_leaderboard(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<Value>, ApiError> {
    auth::bearer_user(&state.tokens, bearer.as_ref())?;
    let board = achievements::leaderboard(state.store.as_ref(), None).await?;
    Ok(Json(json!({
        "success": true,
        "leaderboard": board,
    })))
}

async fn get_milestones(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<Value>, ApiError> {
    let user_id = auth::bearer_user(&state.tokens, bearer.as_ref())?;
    let progress = achievements::milestones(state.store.as_ref(), &user_id).await?;
    Ok(Json(json!({
        "success": true,
        "milestones": progress,
    })))
}

async fn get_stats(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<Value>, ApiError> {
    let user_id = auth::bearer_user(&state.tokens, bearer.as_ref())?;
    let stats = achievements::stats(state.store.as_ref(), &user_id).await?;
    Ok(Json(json!({
        "success": true,
        "stats": stats,
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
