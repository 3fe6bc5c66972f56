use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors that cross the HTTP boundary. Every variant maps to the
/// `{success, message, error?}` payload shape; machine codes are attached
/// where a client is expected to branch on them.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Too many requests, try again in {}", retry_display(*retry_after_secs))]
    Throttled { retry_after_secs: u64 },

    #[error("{0}")]
    Unauthorized(String),

    #[error("Location is required for this challenge")]
    LocationRequired,

    #[error("{0}")]
    LocationInvalid(String),

    #[error("You are {distance_km} km away, allowed radius is {max_distance_km} km")]
    LocationTooFar { distance_km: f64, max_distance_km: f64 },

    #[error("Waste classification is temporarily unavailable, please use manual entry")]
    ClassificationUnavailable,

    #[error("Already joined this challenge")]
    AlreadyJoined,

    #[error("You have not joined this challenge")]
    NotJoined,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

fn retry_display(secs: u64) -> String {
    if secs >= 60 {
        format!("{} minute(s)", secs.div_ceil(60))
    } else {
        format!("{} second(s)", secs.max(1))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::LocationRequired
            | ApiError::LocationInvalid(_)
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::LocationTooFar { .. } => StatusCode::FORBIDDEN,
            ApiError::ClassificationUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::AlreadyJoined | ApiError::NotJoined => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ApiError::LocationRequired => Some("LOCATION_REQUIRED"),
            ApiError::LocationTooFar { .. } => Some("LOCATION_TOO_FAR"),
            ApiError::ClassificationUnavailable => Some("AI_UNAVAILABLE"),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref e) = self {
            error!("Internal error: {:?}", e);
        }

        let message = self.to_string();
        let mut body = json!({
            "success": false,
            "message": message,
        });
        if let Some(code) = self.code() {
            body["error"] = json!(code);
        }
        if let ApiError::LocationTooFar { distance_km, max_distance_km } = self {
            body["distance"] = json!(distance_km);
            body["maxDistance"] = json!(max_distance_km);
        }
        (self.status(), Json(body)).into_response()
    }
}
