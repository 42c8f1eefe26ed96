use crate::error::BillingError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Error envelope returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub retryable: bool,
}

impl BillingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BillingError::InvalidAmount { .. } | BillingError::ValidationError { .. } => {
                StatusCode::BAD_REQUEST
            }
            BillingError::FamilyNotFound { .. }
            | BillingError::EnrolmentNotFound { .. }
            | BillingError::InvoiceNotFound { .. }
            | BillingError::PaymentNotFound { .. }
            | BillingError::PlanNotFound { .. }
            | BillingError::ProductNotFound { .. } => StatusCode::NOT_FOUND,
            BillingError::AlreadyUndone { .. } | BillingError::InvalidInvoiceState { .. } => {
                StatusCode::CONFLICT
            }
            BillingError::AllocationMismatch { .. }
            | BillingError::AllocationExceedsBalance { .. }
            | BillingError::AmountMismatch { .. }
            | BillingError::NonIntegerQuantity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BillingError::PersistenceFailed { .. } | BillingError::ConfigurationError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            BillingError::FamilyBusy { .. } | BillingError::DatabaseError { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.error_code(), "Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code: self.error_code().to_string(),
                message: self.to_string(),
                timestamp: chrono::Utc::now(),
                retryable: self.is_retryable(),
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;
    use crate::domain::types::InvoiceId;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            BillingError::invalid_amount("zero").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BillingError::PaymentNotFound {
                id: "p".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BillingError::AlreadyUndone {
                id: "p".to_string()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            BillingError::AllocationExceedsBalance {
                invoice_id: InvoiceId::new(),
                requested: Money::from_cents(2),
                balance: Money::from_cents(1),
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            BillingError::persistence("commit", "disk full").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            BillingError::FamilyBusy {
                family_id: "f".to_string(),
                seconds: 10
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let response = BillingError::AlreadyUndone {
            id: "p-1".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error.code, "BILLING_ALREADY_UNDONE");
        assert!(body.error.message.contains("p-1"));
        assert!(!body.error.retryable);
    }
}
