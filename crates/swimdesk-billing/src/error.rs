use crate::domain::money::Money;
use crate::domain::types::InvoiceId;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid amount: {message}")]
    InvalidAmount { message: String },

    #[error("Allocations total {allocated} but the payment amount is {amount}")]
    AllocationMismatch { allocated: Money, amount: Money },

    #[error("Allocation of {requested} exceeds the balance of invoice {invoice_id} ({balance})")]
    AllocationExceedsBalance {
        invoice_id: InvoiceId,
        requested: Money,
        balance: Money,
    },

    #[error("Payment amount {amount} does not equal {quantity} x {unit_price}")]
    AmountMismatch {
        amount: Money,
        unit_price: Money,
        quantity: u32,
    },

    #[error("Amount {amount} is not a whole number of {unit_price} units")]
    NonIntegerQuantity { amount: Money, unit_price: Money },

    #[error("Payment {id} has already been undone")]
    AlreadyUndone { id: String },

    #[error("Failed to persist {operation}: {source}")]
    PersistenceFailed {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Validation error for field {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("Family not found: {id}")]
    FamilyNotFound { id: String },

    #[error("Enrolment not found: {id}")]
    EnrolmentNotFound { id: String },

    #[error("Invoice not found: {id}")]
    InvoiceNotFound { id: String },

    #[error("Payment not found: {id}")]
    PaymentNotFound { id: String },

    #[error("Enrolment plan not found: {id}")]
    PlanNotFound { id: String },

    #[error("Product not found: {id}")]
    ProductNotFound { id: String },

    #[error("Invoice {id} cannot be changed: {message}")]
    InvalidInvoiceState { id: String, message: String },

    #[error("Family {family_id} is busy with another payment, gave up after {seconds}s")]
    FamilyBusy { family_id: String, seconds: u64 },

    #[error("Database error during {operation}: {source}")]
    DatabaseError {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },
}

pub type Result<T> = std::result::Result<T, BillingError>;

impl BillingError {
    pub fn invalid_amount(message: impl Into<String>) -> Self {
        BillingError::InvalidAmount {
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        BillingError::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn database(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BillingError::DatabaseError {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn persistence(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BillingError::PersistenceFailed {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// Stable machine-readable code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            BillingError::InvalidAmount { .. } => "BILLING_INVALID_AMOUNT",
            BillingError::AllocationMismatch { .. } => "BILLING_ALLOCATION_MISMATCH",
            BillingError::AllocationExceedsBalance { .. } => "BILLING_ALLOCATION_EXCEEDS_BALANCE",
            BillingError::AmountMismatch { .. } => "BILLING_AMOUNT_MISMATCH",
            BillingError::NonIntegerQuantity { .. } => "BILLING_NON_INTEGER_QUANTITY",
            BillingError::AlreadyUndone { .. } => "BILLING_ALREADY_UNDONE",
            BillingError::PersistenceFailed { .. } => "BILLING_PERSISTENCE_FAILED",
            BillingError::ValidationError { .. } => "BILLING_VALIDATION_ERROR",
            BillingError::FamilyNotFound { .. } => "BILLING_FAMILY_NOT_FOUND",
            BillingError::EnrolmentNotFound { .. } => "BILLING_ENROLMENT_NOT_FOUND",
            BillingError::InvoiceNotFound { .. } => "BILLING_INVOICE_NOT_FOUND",
            BillingError::PaymentNotFound { .. } => "BILLING_PAYMENT_NOT_FOUND",
            BillingError::PlanNotFound { .. } => "BILLING_PLAN_NOT_FOUND",
            BillingError::ProductNotFound { .. } => "BILLING_PRODUCT_NOT_FOUND",
            BillingError::InvalidInvoiceState { .. } => "BILLING_INVALID_INVOICE_STATE",
            BillingError::FamilyBusy { .. } => "BILLING_FAMILY_BUSY",
            BillingError::DatabaseError { .. } => "BILLING_DATABASE_ERROR",
            BillingError::ConfigurationError { .. } => "BILLING_CONFIG_ERROR",
        }
    }

    /// Whether the caller may retry the same request (with the same idempotency key)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::PersistenceFailed { .. }
                | BillingError::FamilyBusy { .. }
                | BillingError::DatabaseError { .. }
        )
    }

    /// Whether the request itself was at fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidAmount { .. }
                | BillingError::AllocationMismatch { .. }
                | BillingError::AllocationExceedsBalance { .. }
                | BillingError::AmountMismatch { .. }
                | BillingError::NonIntegerQuantity { .. }
                | BillingError::AlreadyUndone { .. }
                | BillingError::ValidationError { .. }
                | BillingError::FamilyNotFound { .. }
                | BillingError::EnrolmentNotFound { .. }
                | BillingError::InvoiceNotFound { .. }
                | BillingError::PaymentNotFound { .. }
                | BillingError::PlanNotFound { .. }
                | BillingError::ProductNotFound { .. }
                | BillingError::InvalidInvoiceState { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BillingError::invalid_amount("zero").error_code(),
            "BILLING_INVALID_AMOUNT"
        );
        assert_eq!(
            BillingError::AlreadyUndone {
                id: "p1".to_string()
            }
            .error_code(),
            "BILLING_ALREADY_UNDONE"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(BillingError::persistence("commit_payment", "connection reset").is_retryable());
        assert!(!BillingError::AllocationMismatch {
            allocated: Money::from_cents(100),
            amount: Money::from_cents(200),
        }
        .is_retryable());
    }

    #[test]
    fn test_exceeds_balance_names_invoice() {
        let invoice_id = InvoiceId::new();
        let err = BillingError::AllocationExceedsBalance {
            invoice_id,
            requested: Money::from_cents(2500),
            balance: Money::from_cents(2000),
        };
        let message = err.to_string();
        assert!(message.contains(&invoice_id.to_string()));
        assert!(message.contains("25.00"));
        assert!(err.is_client_error());
    }
}
