//! Standardized mapping of registry HTTP failures onto store errors

use crate::error::StoreError;
use reqwest::StatusCode;

/// Standard error handler for HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Handle registry-related HTTP errors
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
    ) -> StoreError {
        let error_text = error_text.trim();
        match status.as_u16() {
            401 => StoreError::Auth(format!(
                "Unauthorized to perform {} operation: {}",
                operation, error_text
            )),
            403 => StoreError::Auth(format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, error_text
            )),
            404 => StoreError::NotFound(format!("{}: {}", operation, error_text)),
            429 => StoreError::Registry(format!(
                "Rate limited during {}: {}",
                operation, error_text
            )),
            500 => StoreError::Registry(format!(
                "Registry server error during {}: {}",
                operation, error_text
            )),
            502 | 503 => StoreError::Registry(format!(
                "Registry unavailable for {}: {}",
                operation, error_text
            )),
            _ => StoreError::Registry(format!(
                "{} failed (status {}): {}",
                operation, status, error_text
            )),
        }
    }

    /// Handle authentication-related HTTP errors
    pub fn handle_auth_error(status: StatusCode, error_text: &str) -> StoreError {
        let error_msg = match status.as_u16() {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!("Authentication failed (status {}): {}", status, error_text),
        };

        StoreError::Auth(error_msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_keeps_registry_detail() {
        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::NOT_FOUND,
            "{\"errors\":[{\"code\":\"MANIFEST_UNKNOWN\"}]}\n",
            "manifest fetch",
        );
        assert!(err.is_not_found());
        assert!(err.to_string().contains("MANIFEST_UNKNOWN"));
    }

    #[test]
    fn permission_failures_are_auth_errors() {
        let err = HttpErrorHandler::handle_registry_error(StatusCode::FORBIDDEN, "", "blob fetch");
        assert!(matches!(err, StoreError::Auth(_)));

        let err = HttpErrorHandler::handle_auth_error(StatusCode::UNAUTHORIZED, "nope");
        assert_eq!(
            err.to_string(),
            "Authentication error: Invalid credentials provided"
        );
    }

    #[test]
    fn unexpected_status_is_a_registry_error() {
        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::IM_A_TEAPOT,
            "short and stout",
            "manifest fetch",
        );
        let msg = err.to_string();
        assert!(matches!(err, StoreError::Registry(_)));
        assert!(msg.contains("418"));
        assert!(msg.contains("short and stout"));
    }
}
