//! Response bodies of the REST endpoints.

use serde::Serialize;

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn not_found(message: &str) -> Self {
        Self {
            error: "not_found".to_string(),
            message: message.to_string(),
        }
    }

    pub fn internal(message: &str) -> Self {
        Self {
            error: "internal".to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// A session with live subscribers on this relay.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub online: usize,
}
