use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error payload returned to HTTP callers.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Unprocessable Entity")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Insufficient stock for batch {batch_id}: requested {requested}, available {available}")]
    InsufficientStock {
        batch_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Invalid barcode {barcode}: {reason}")]
    InvalidBarcode { barcode: String, reason: String },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Order {0} must be fulfilled before completion")]
    FulfillmentRequired(Uuid),

    #[error("Selling price {offered} is below the minimum of {minimum}")]
    PriceBelowMinimum {
        offered: rust_decimal::Decimal,
        minimum: rust_decimal::Decimal,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<sea_orm::TransactionError<ServiceError>> for ServiceError {
    fn from(err: sea_orm::TransactionError<ServiceError>) -> Self {
        match err {
            sea_orm::TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
            sea_orm::TransactionError::Transaction(service_err) => service_err,
        }
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidStateTransition(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientStock { .. }
            | Self::InvalidBarcode { .. }
            | Self::FulfillmentRequired(_)
            | Self::PriceBelowMinimum { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::DatabaseError(_)
            | Self::EventError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message: self.response_message(),
            timestamp: Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stock_errors_map_to_unprocessable_entity() {
        let err = ServiceError::InsufficientStock {
            batch_id: Uuid::new_v4(),
            requested: 5,
            available: 2,
        };
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("requested 5"));
        assert!(err.to_string().contains("available 2"));
    }

    #[test]
    fn price_floor_error_carries_both_amounts() {
        let err = ServiceError::PriceBelowMinimum {
            offered: dec!(99),
            minimum: dec!(100),
        };
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("99"));
        assert!(err.to_string().contains("100"));
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let err = ServiceError::InternalError("connection pool exhausted".into());
        assert_eq!(err.response_message(), "Internal server error");
    }

    #[test]
    fn error_payload_serializes_all_fields() {
        let body = ErrorResponse {
            error: "Conflict".into(),
            message: "Order already completed".into(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "Conflict");
        assert_eq!(json["message"], "Order already completed");
        assert!(json["timestamp"].is_string());
    }
}
