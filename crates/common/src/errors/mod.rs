//! Error types for Nizam services
//!
//! Each core component has its own error enum:
//! - [`ProvisionError`] for the tenant provisioning workflow
//! - [`RouterError`] for tenant connection resolution
//! - [`AllocError`] for SKU allocation
//! - [`MigrationError`] for schema application
//!
//! [`AppError`] aggregates them for the API layer with error codes,
//! HTTP status mapping, and client-safe messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    InvalidName,
    InvalidPrefix,

    // Resource errors (4xxx)
    TenantNotFound,

    // Conflict errors (5xxx)
    DuplicateTenant,
    DuplicateAccount,
    AllocationExhausted,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,
    MigrationError,

    // Provisioning & routing errors (8xxx)
    ProvisioningFailed,
    CompensationFailed,
    ConnectionTimeout,

    // Internal errors (9xxx)
    InternalError,

    // Service unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::InvalidName => 1001,
            ErrorCode::InvalidPrefix => 1002,

            // Resources (4xxx)
            ErrorCode::TenantNotFound => 4001,

            // Conflicts (5xxx)
            ErrorCode::DuplicateTenant => 5001,
            ErrorCode::DuplicateAccount => 5002,
            ErrorCode::AllocationExhausted => 5003,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,
            ErrorCode::MigrationError => 7003,

            // Provisioning & routing (8xxx)
            ErrorCode::ProvisioningFailed => 8001,
            ErrorCode::CompensationFailed => 8002,
            ErrorCode::ConnectionTimeout => 8003,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,

            ErrorCode::ServiceUnavailable => 9999,
        }
    }
}

/// Tenant provisioning failures
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Invalid company name: {reason}")]
    InvalidName { reason: String },

    #[error("Tenant already exists: {slug}")]
    DuplicateTenant { slug: String },

    #[error("Account already exists: {email}")]
    DuplicateAccount { email: String },

    /// A step failed and every completed step was rolled back
    #[error("Provisioning failed at {step}: {cause}")]
    ProvisioningFailed { step: &'static str, cause: String },

    /// A step failed and at least one rollback action failed as well.
    /// Leftover state needs manual cleanup.
    #[error("Compensation failed after {step} error ({cause}): {}", .failures.join("; "))]
    CompensationFailed {
        step: &'static str,
        cause: String,
        failures: Vec<String>,
    },
}

/// Tenant connection resolution failures.
///
/// Cloneable so one failed initialization can be handed to every caller
/// waiting on it.
#[derive(Error, Debug, Clone)]
pub enum RouterError {
    #[error("Tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: Uuid },

    #[error("Timed out after {timeout_ms}ms opening connection for tenant {tenant_id}")]
    Timeout { tenant_id: Uuid, timeout_ms: u64 },

    #[error("Failed to initialize connection for tenant {tenant_id}: {message}")]
    InitFailed { tenant_id: Uuid, message: String },

    #[error("Registry lookup failed: {message}")]
    Registry { message: String },

    #[error("Connection router is shut down")]
    ShutDown,
}

/// SKU allocation failures
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("Invalid SKU prefix: {reason}")]
    InvalidPrefix { reason: String },

    #[error("Could not allocate a unique code for {prefix} after {attempts} attempts")]
    AllocationExhausted { prefix: String, attempts: u32 },

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

/// Schema application failures
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A migration step was rolled back; `last_applied` is the version the
    /// database is left at.
    #[error("Migration {version} ({name}) failed: {cause}")]
    StepFailed {
        version: i64,
        name: &'static str,
        last_applied: Option<i64>,
        #[source]
        cause: DbErr,
    },

    #[error("Database is at version {found}, which this migration set does not know (latest {latest})")]
    UnknownVersion { found: i64, latest: i64 },

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl MigrationError {
    /// Version the database was left at, when known
    pub fn last_applied(&self) -> Option<i64> {
        match self {
            MigrationError::StepFailed { last_applied, .. } => *last_applied,
            MigrationError::UnknownVersion { found, .. } => Some(*found),
            MigrationError::Database(_) => None,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Provision(err) => match err {
                ProvisionError::InvalidName { .. } => ErrorCode::InvalidName,
                ProvisionError::DuplicateTenant { .. } => ErrorCode::DuplicateTenant,
                ProvisionError::DuplicateAccount { .. } => ErrorCode::DuplicateAccount,
                ProvisionError::ProvisioningFailed { .. } => ErrorCode::ProvisioningFailed,
                ProvisionError::CompensationFailed { .. } => ErrorCode::CompensationFailed,
            },
            AppError::Router(err) => match err {
                RouterError::TenantNotFound { .. } => ErrorCode::TenantNotFound,
                RouterError::Timeout { .. } => ErrorCode::ConnectionTimeout,
                RouterError::InitFailed { .. } => ErrorCode::ConnectionError,
                RouterError::Registry { .. } => ErrorCode::DatabaseError,
                RouterError::ShutDown => ErrorCode::ServiceUnavailable,
            },
            AppError::Alloc(err) => match err {
                AllocError::InvalidPrefix { .. } => ErrorCode::InvalidPrefix,
                AllocError::AllocationExhausted { .. } => ErrorCode::AllocationExhausted,
                AllocError::Database(_) => ErrorCode::DatabaseError,
            },
            AppError::Migration(_) => ErrorCode::MigrationError,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self.code() {
            // 400 Bad Request
            ErrorCode::InvalidName |
            ErrorCode::InvalidPrefix => StatusCode::BAD_REQUEST,

            // 404 Not Found
            ErrorCode::TenantNotFound => StatusCode::NOT_FOUND,

            // 409 Conflict
            ErrorCode::DuplicateTenant |
            ErrorCode::DuplicateAccount |
            ErrorCode::AllocationExhausted => StatusCode::CONFLICT,

            // 504 Gateway Timeout
            ErrorCode::ConnectionTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 503 Service Unavailable
            ErrorCode::ConnectionError |
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            ErrorCode::DatabaseError |
            ErrorCode::MigrationError |
            ErrorCode::ProvisioningFailed |
            ErrorCode::CompensationFailed |
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to API clients.
    ///
    /// Server-side failures never expose database names or driver messages.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Provision(ProvisionError::InvalidName { reason }) => {
                format!("Invalid company name: {}", reason)
            }
            AppError::Provision(ProvisionError::DuplicateTenant { .. }) => {
                "A company with this name is already registered".to_string()
            }
            AppError::Provision(ProvisionError::DuplicateAccount { .. }) => {
                "An account with this email already exists".to_string()
            }
            AppError::Provision(_) => "Tenant provisioning failed".to_string(),
            AppError::Router(RouterError::TenantNotFound { .. }) => "Tenant not found".to_string(),
            AppError::Router(RouterError::Timeout { .. }) => {
                "Tenant database did not respond in time".to_string()
            }
            AppError::Router(_) => "Tenant database unavailable".to_string(),
            AppError::Alloc(AllocError::InvalidPrefix { reason }) => {
                format!("Invalid SKU prefix: {}", reason)
            }
            AppError::Alloc(AllocError::AllocationExhausted { .. }) => {
                "Could not allocate a unique SKU, please retry".to_string()
            }
            _ => "Internal server error".to_string(),
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let detail = self.to_string();

        // Log based on severity
        if code == ErrorCode::CompensationFailed {
            tracing::error!(
                error = %detail,
                code = ?code,
                status = status.as_u16(),
                manual_intervention_required = true,
                "Provisioning rollback incomplete"
            );
        } else if self.is_server_error() {
            tracing::error!(
                error = %detail,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %detail,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message: self.client_message(),
                request_id: None, // Should be filled by middleware
            },
        };

        (status, Json(body)).into_response()
    }
}
