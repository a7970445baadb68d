use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::normalizer::ExtractionError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{collaborator} failed: {message}")]
    Upstream {
        collaborator: &'static str,
        message: String,
    },

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn upstream(collaborator: &'static str, message: impl std::fmt::Display) -> Self {
        AppError::Upstream {
            collaborator,
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Validation(message) => {
                tracing::warn!(%message, "rejected request");
            }
            AppError::Upstream {
                collaborator,
                message,
            } => {
                tracing::error!(collaborator, %message, "collaborator call failed");
            }
            AppError::Extraction(err) => {
                tracing::error!(
                    error = %err,
                    raw = err.raw(),
                    extracted = err.extracted().unwrap_or(""),
                    "model output could not be normalized"
                );
            }
            AppError::Config(message) => {
                tracing::error!(%message, "configuration error");
            }
        }

        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
