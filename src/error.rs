use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use warp::http::StatusCode;

/// Failure reported by a generative model provider.
///
/// Serializable so the explanation route can attach it as a diagnostic
/// `details` payload.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerateError {
    #[error("[{model}] request failed: {message}")]
    Transport { model: String, message: String },

    #[error("[{model}] returned {status}: {body}")]
    Status { model: String, status: u16, body: String },

    #[error("[{model}] {message}")]
    Provider { model: String, message: String },

    #[error("[{model}] stream interrupted: {message}")]
    Stream { model: String, message: String },

    #[error("[{model}] malformed response: {message}")]
    Malformed { model: String, message: String },
}

impl GenerateError {
    pub fn model(&self) -> &str {
        match self {
            Self::Transport { model, .. }
            | Self::Status { model, .. }
            | Self::Provider { model, .. }
            | Self::Stream { model, .. }
            | Self::Malformed { model, .. } => model,
        }
    }

    pub fn details(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache did not answer within {0:?}")]
    Timeout(Duration),

    #[error("cache lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum ExplainError {
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("bibtex is required")]
    MissingBibtex,

    #[error("GEMINI_API_KEY is not set")]
    MissingCredential,

    #[error("No model candidates configured")]
    NoCandidates,

    #[error("{0}")]
    Generation(#[from] GenerateError),
}

impl ExplainError {
    pub fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            details: match self {
                Self::Generation(e) => Some(e.details()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    /// The backend answered with a non-success status. Its body is dropped.
    #[error("backend responded with status {0}")]
    Backend(u16),

    #[error("backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl SearchError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Backend(code) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let error = match self {
            Self::Backend(_) => "Backend error",
            _ => "Internal Server Error",
        };
        ErrorBody {
            error: error.to_string(),
            details: None,
        }
    }
}

/// JSON error payload shared by every API route.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
