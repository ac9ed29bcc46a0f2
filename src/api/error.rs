use thiserror::Error;

use crate::cache::QueryError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            // The cut must land on a char boundary; back up until it does.
            let mut cut = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..cut],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            409 => ApiError::Conflict(truncated),
            422 => ApiError::Validation(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}

/// Collapses transport errors into the engine taxonomy. Rate limiting and
/// 5xx responses count as transient alongside connection-level failures.
impl From<ApiError> for QueryError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unauthorized | ApiError::AccessDenied(_) => QueryError::Unauthorized,
            ApiError::NotFound(body) => QueryError::NotFound(body),
            ApiError::Conflict(body) => QueryError::Conflict(body),
            ApiError::Validation(body) => QueryError::Validation(body),
            ApiError::RateLimited => QueryError::Transient("rate limited".into()),
            ApiError::ServerError(body) => QueryError::Transient(body),
            ApiError::NetworkError(error) => QueryError::Transient(error.to_string()),
            ApiError::InvalidResponse(body) => QueryError::Data(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_maps_mutation_failures() {
        let conflict = ApiError::from_status(reqwest::StatusCode::CONFLICT, "edited elsewhere");
        assert!(matches!(conflict, ApiError::Conflict(_)));
        let validation =
            ApiError::from_status(reqwest::StatusCode::UNPROCESSABLE_ENTITY, "plate required");
        assert!(matches!(validation, ApiError::Validation(_)));
    }

    #[test]
    fn test_truncates_long_bodies() {
        let body = "x".repeat(2000);
        let error = ApiError::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, &body);
        let message = error.to_string();
        assert!(message.len() < body.len());
        assert!(message.contains("truncated"));
    }

    #[test]
    fn test_truncates_multibyte_bodies_on_char_boundary() {
        // 200 three-byte chars: 600 bytes, and byte 500 falls mid-char.
        let body = "€".repeat(200);
        let error = ApiError::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, &body);
        let message = error.to_string();
        assert!(message.contains("truncated, 600 total bytes"));
        assert!(message.len() < body.len());
    }

    #[test]
    fn test_engine_taxonomy_retry_classes() {
        let unavailable = ApiError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(QueryError::from(unavailable).is_transient());
        assert!(QueryError::from(ApiError::RateLimited).is_transient());

        let expired = ApiError::from_status(reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(QueryError::from(expired).is_unauthorized());
        assert!(!QueryError::from(ApiError::NotFound("order 9".into())).is_transient());
    }
}
