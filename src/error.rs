use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Convenience constructors
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found", resource.into()),
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExternalServiceError, message)
    }

    pub fn rate_limit(retry_after_secs: u64) -> Self {
        Self::new(
            ErrorCode::RateLimitExceeded,
            "Too many requests. Please try again later.",
        )
        .with_details(serde_json::json!({ "retry_after_secs": retry_after_secs }))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

// ============================================================================
// Error Codes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Client errors (4xx)
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    ValidationError,
    RateLimitExceeded,

    // Server errors (5xx)
    Internal,
    DatabaseError,
    ExternalServiceError,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::ValidationError => 422,
            Self::RateLimitExceeded => 429,
            Self::Internal => 500,
            Self::DatabaseError => 500,
            Self::ExternalServiceError => 502,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.http_status() < 500
    }

    pub fn is_server_error(&self) -> bool {
        self.http_status() >= 500
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal => "INTERNAL_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, AppError>;

// ============================================================================
// Error Response for HTTP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: AppError,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: AppError) -> Self {
        Self {
            error,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ============================================================================
// Validation Error Details
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: "INVALID".to_string(),
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            message: format!("{} is required", field),
            field,
            code: "REQUIRED".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: vec![] }
    }

    pub fn add(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Summary line listing every failing field, e.g. "slug, name are required".
    fn summary(&self) -> String {
        match self.errors.as_slice() {
            [single] => single.message.clone(),
            many => {
                let fields: Vec<&str> = many.iter().map(|e| e.field.as_str()).collect();
                format!("Invalid fields: {}", fields.join(", "))
            }
        }
    }

    pub fn into_app_error(self) -> AppError {
        let message = self.summary();
        let details = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        AppError::new(ErrorCode::ValidationError, message).with_details(details)
    }

    /// `Ok(())` when nothing was collected, otherwise the combined error.
    pub fn finish(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.into_app_error())
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(error: ValidationError) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add(error);
        errors.into_app_error()
    }
}

impl Default for ValidationErrors {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Error Conversion Implementations
// ============================================================================

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("Resource"),
            sqlx::Error::Database(e) => {
                if e.is_unique_violation() {
                    Self::conflict("Resource already exists")
                } else {
                    Self::new(ErrorCode::DatabaseError, format!("Database error: {}", e))
                }
            }
            _ => Self::new(ErrorCode::DatabaseError, format!("Database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("JSON error: {}", err))
    }
}

impl From<crate::llm::LlmError> for AppError {
    fn from(err: crate::llm::LlmError) -> Self {
        Self::upstream(err.to_string())
    }
}

// ============================================================================
// Backend-specific HTTP Response Conversion
// ============================================================================

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;

        log_error(&self);

        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let retry_after = self
            .details
            .as_ref()
            .filter(|_| self.code == ErrorCode::RateLimitExceeded)
            .and_then(|d| d.get("retry_after_secs"))
            .and_then(|v| v.as_u64());

        let mut response = (status, Json(ErrorResponse::new(self))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, secs.into());
        }
        response
    }
}

// ============================================================================
// Error Context Extension
// ============================================================================

pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<AppError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let mut err = e.into();
            err.message = format!("{}: {}", context.into(), err.message);
            err
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn log_error(error: &AppError) {
    if error.code.is_server_error() {
        log::error!("{}", error);
    } else {
        log::warn!("{}", error);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AppError::not_found("Bot");
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("Bot"));
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::RateLimitExceeded.http_status(), 429);
        assert_eq!(ErrorCode::ExternalServiceError.http_status(), 502);
    }

    #[test]
    fn test_error_classification() {
        assert!(ErrorCode::BadRequest.is_client_error());
        assert!(ErrorCode::DatabaseError.is_server_error());
    }

    #[test]
    fn test_validation_errors_single_message() {
        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::required("slug"));
        let app_error = errors.into_app_error();
        assert_eq!(app_error.code, ErrorCode::ValidationError);
        assert_eq!(app_error.message, "slug is required");
    }

    #[test]
    fn test_validation_errors_lists_all_fields() {
        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::required("slug"));
        errors.add(ValidationError::required("name"));
        let app_error = errors.finish().unwrap_err();
        assert!(app_error.message.contains("slug"));
        assert!(app_error.message.contains("name"));
        assert!(app_error.details.is_some());
    }

    #[test]
    fn test_empty_validation_finishes_ok() {
        assert!(ValidationErrors::new().finish().is_ok());
    }

    #[test]
    fn test_context_prefixes_message() {
        let res: std::result::Result<(), AppError> = Err(AppError::internal("boom"));
        let err = res.context("Loading bot").unwrap_err();
        assert_eq!(err.message, "Loading bot: boom");
    }

    #[test]
    fn test_json_serialization() {
        let err = AppError::bad_request("Invalid data");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("BadRequest"));
        assert!(json.contains("Invalid data"));
    }
}
