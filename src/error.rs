//! Error types shared by the HTTP actions.
//!
//! Every failure that leaves the server goes through [`ApiError`], which renders the
//! `{status: "error", message, details?}` envelope. Server-side failures keep their
//! source chain for the log and only expose a generic message to the client.

use std::collections::BTreeMap;

use axum::{
    Json,
    http::{HeaderMap, StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::intake::IntakeError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: String,
        details: BTreeMap<String, String>,
    },

    #[error("{0}")]
    Auth(String),

    #[error("Too many upload attempts. Please try again later.")]
    RateLimited,

    #[error(transparent)]
    Upload(#[from] IntakeError),

    #[error("{0}")]
    NotFound(String),

    #[error("Server error: {public}")]
    Server {
        public: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn server(public: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ApiError::Server {
            public: public.into(),
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upload(e) => e.status(),
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Server { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            ApiError::Server { public, source } => {
                tracing::error!("{}: {:#}", public, source);
            }
            ApiError::Upload(e @ IntakeError::Storage { source, .. }) => {
                tracing::error!("{}: {}", e, source);
            }
            other => {
                tracing::debug!("Request rejected ({}): {}", status, other);
            }
        }

        let mut body = json!({
            "status": "error",
            "message": self.to_string(),
        });
        if let ApiError::Validation { details, .. } = &self {
            if !details.is_empty() {
                body["details"] = json!(details);
            }
        }

        (status, Json(body)).into_response()
    }
}

/// Whether a request expects JSON rather than an HTML page.
pub fn wants_json(uri: &Uri, headers: &HeaderMap) -> bool {
    let has_action = uri
        .query()
        .map(|q| q.split('&').any(|pair| pair.split('=').next() == Some("action")))
        .unwrap_or(false);

    let accepts_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false);

    has_action || accepts_json
}

/// Last-resort 500 response for faults that escaped every handler.
pub fn fault_response(json_context: bool) -> Response {
    if json_context {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "message": "A server error occurred. Please try again later.",
            })),
        )
            .into_response()
    } else {
        error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Oops! Something went wrong on our end.",
            "We are sorry for the inconvenience. Please try again later.",
        )
    }
}

pub fn error_page(status: StatusCode, heading: &str, text: &str) -> Response {
    (status, Html(format!("<h1>{heading}</h1><p>{text}</p>"))).into_response()
}
