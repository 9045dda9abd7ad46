//! Error handling for the notification service
//!
//! Every fallible operation in the service returns [`NotifyError`]. HTTP
//! handlers rely on its [`IntoResponse`] impl, so API consumers always see
//! `{success:false, error, code, details?}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::channels::ProviderError;
use crate::store::StoreError;

/// Result type alias for notification service operations
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Main error type for the notification service
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Malformed or missing request fields
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Caller is not a member of the target organization
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A step is mid-send; cancellation has to wait for it
    #[error("Workflow {workflow_id} has a step in flight")]
    WorkflowBusy { workflow_id: String },

    #[error("Missing template variable: {name}")]
    MissingVariable { name: String },

    #[error("Template not found: {key} ({language})")]
    TemplateNotFound { key: String, language: String },

    #[error("Template error: {message}")]
    Template { message: String },

    #[error("Invalid phone number: {phone}")]
    InvalidPhoneNumber { phone: String },

    #[error("Recipient has opted out of SMS: {phone}")]
    OptedOut { phone: String },

    #[error("Message too long: {segments} segments exceeds limit of {limit}")]
    MessageTooLong { segments: usize, limit: usize },

    /// SMS vendor failure; `transient` marks transport-level problems
    #[error("SMS provider error: {message}")]
    Provider { message: String, transient: bool },

    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Invalid webhook signature: {message}")]
    Signature { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NotifyError {
    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotifyError::Validation { .. } => StatusCode::BAD_REQUEST,
            NotifyError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            NotifyError::Forbidden { .. } => StatusCode::FORBIDDEN,
            NotifyError::NotFound { .. } => StatusCode::NOT_FOUND,
            NotifyError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            NotifyError::WorkflowBusy { .. } => StatusCode::CONFLICT,
            NotifyError::MissingVariable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotifyError::TemplateNotFound { .. } => StatusCode::NOT_FOUND,
            NotifyError::Template { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotifyError::InvalidPhoneNumber { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotifyError::OptedOut { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotifyError::MessageTooLong { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotifyError::Provider { .. } => StatusCode::BAD_GATEWAY,
            NotifyError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            NotifyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            NotifyError::Signature { .. } => StatusCode::UNAUTHORIZED,
            NotifyError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotifyError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotifyError::Serialization { .. } => StatusCode::BAD_REQUEST,
            NotifyError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            NotifyError::Validation { .. } => "VALIDATION_ERROR",
            NotifyError::Unauthorized { .. } => "UNAUTHORIZED",
            NotifyError::Forbidden { .. } => "FORBIDDEN",
            NotifyError::NotFound { .. } => "NOT_FOUND",
            NotifyError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            NotifyError::WorkflowBusy { .. } => "WORKFLOW_BUSY",
            NotifyError::MissingVariable { .. } => "MISSING_VARIABLE",
            NotifyError::TemplateNotFound { .. } => "TEMPLATE_NOT_FOUND",
            NotifyError::Template { .. } => "TEMPLATE_ERROR",
            NotifyError::InvalidPhoneNumber { .. } => "INVALID_PHONE_NUMBER",
            NotifyError::OptedOut { .. } => "OPTED_OUT",
            NotifyError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            NotifyError::Provider { .. } => "PROVIDER_ERROR",
            NotifyError::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            NotifyError::Timeout { .. } => "TIMEOUT",
            NotifyError::Signature { .. } => "INVALID_SIGNATURE",
            NotifyError::Database { .. } => "DATABASE_ERROR",
            NotifyError::Config { .. } => "CONFIG_ERROR",
            NotifyError::Serialization { .. } => "SERIALIZATION_ERROR",
            NotifyError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Check if repeating the operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            NotifyError::Provider { transient, .. } => *transient,
            NotifyError::RateLimit { .. } => true,
            NotifyError::Timeout { .. } => true,
            NotifyError::Database { .. } => true,
            _ => false,
        }
    }
}

impl IntoResponse for NotifyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let mut body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.error_code(),
        });

        if cfg!(debug_assertions) {
            body["details"] = json!(format!("{:?}", self));
        }

        (status, Json(body)).into_response()
    }
}

// Conversion implementations for external error types

impl From<StoreError> for NotifyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity } => NotifyError::NotFound { resource: entity },
            StoreError::Conflict { message } => NotifyError::Validation {
                field: "conflict".to_string(),
                message,
            },
            StoreError::Backend { message } => NotifyError::Database { message },
        }
    }
}

impl From<ProviderError> for NotifyError {
    fn from(err: ProviderError) -> Self {
        NotifyError::Provider {
            transient: err.is_transport(),
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for NotifyError {
    fn from(err: sqlx::Error) -> Self {
        NotifyError::Database {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NotifyError::Timeout {
                operation: "HTTP request".to_string(),
            }
        } else {
            NotifyError::Provider {
                transient: err.is_connect() || err.is_request(),
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(err: serde_json::Error) -> Self {
        NotifyError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<handlebars::RenderError> for NotifyError {
    fn from(err: handlebars::RenderError) -> Self {
        NotifyError::Template {
            message: err.to_string(),
        }
    }
}

impl From<handlebars::TemplateError> for NotifyError {
    fn from(err: handlebars::TemplateError) -> Self {
        NotifyError::Template {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for NotifyError {
    fn from(err: config::ConfigError) -> Self {
        NotifyError::Config {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for NotifyError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        NotifyError::Timeout {
            operation: err.to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for NotifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        NotifyError::Unauthorized {
            message: err.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for NotifyError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field_errors = err.field_errors();
        let field = if field_errors.len() == 1 {
            field_errors
                .keys()
                .next()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "multiple".to_string())
        } else {
            "multiple".to_string()
        };

        let message = field_errors
            .iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "Invalid value".to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        NotifyError::Validation { field, message }
    }
}

// Utility functions for creating specific error types

impl NotifyError {
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn missing_variable<S: Into<String>>(name: S) -> Self {
        Self::MissingVariable { name: name.into() }
    }

    pub fn template<S: Into<String>>(message: S) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    pub fn invalid_phone<S: Into<String>>(phone: S) -> Self {
        Self::InvalidPhoneNumber {
            phone: phone.into(),
        }
    }

    pub fn provider<S: Into<String>>(message: S, transient: bool) -> Self {
        Self::Provider {
            message: message.into(),
            transient,
        }
    }

    pub fn rate_limit<S: Into<String>>(message: S) -> Self {
        Self::RateLimit {
            message: message.into(),
        }
    }

    pub fn signature<S: Into<String>>(message: S) -> Self {
        Self::Signature {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            NotifyError::validation("field", "msg").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NotifyError::invalid_transition("completed", "cancelled").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            NotifyError::missing_variable("customer_name").status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            NotifyError::forbidden("not a member").status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            NotifyError::invalid_phone("123").error_code(),
            "INVALID_PHONE_NUMBER"
        );
        assert_eq!(
            NotifyError::invalid_transition("a", "b").error_code(),
            "INVALID_STATE_TRANSITION"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(NotifyError::provider("503", true).is_retryable());
        assert!(!NotifyError::provider("21211 invalid number", false).is_retryable());
        assert!(!NotifyError::invalid_phone("abc").is_retryable());
        assert!(!NotifyError::OptedOut {
            phone: "+15551234567".to_string()
        }
        .is_retryable());
        assert!(NotifyError::Timeout {
            operation: "send".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: NotifyError = StoreError::NotFound {
            entity: "workflow".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = NotifyError::missing_variable("business_name").into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["code"], json!("MISSING_VARIABLE"));
        assert_eq!(
            value["error"],
            json!("Missing template variable: business_name")
        );
        assert_eq!(value.get("details").is_some(), cfg!(debug_assertions));
    }
}
