//! Error types.
//!
//! `AppError` is what the service layer returns; it maps onto HTTP statuses
//! for the actix handlers. Delivery and inference failures keep their own
//! enums so callers can tell "email broke" apart from "model unavailable".

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The alert was persisted but the notification did not go out.
    #[error("delivery of alert {alert_id} failed: {source}")]
    Delivery {
        alert_id: Uuid,
        #[source]
        source: DeliveryError,
    },

    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Inference(_) => StatusCode::BAD_GATEWAY,
            AppError::Delivery { .. } => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "ok": false,
            "error": self.to_string(),
        }))
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("ALERT_EMAIL_TO not configured")]
    NoRecipients,

    #[error("invalid address '{0}'")]
    Address(String),

    #[error("could not build message: {0}")]
    Message(String),

    #[error("smtp transport: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("ml service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("ml service returned HTTP {0}")]
    Status(u16),

    #[error("malformed ml response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}
