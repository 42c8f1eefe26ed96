use crate::error::BillingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Billing unit that owns students, invoices and payments
    FamilyId
);
uuid_id!(StudentId);
uuid_id!(EnrolmentId);
uuid_id!(
    /// Enrolment plan (price tier) in the class catalog
    PlanId
);
uuid_id!(InvoiceId);
uuid_id!(PaymentId);
uuid_id!(AllocationId);
uuid_id!(ProductId);

fn unknown_variant(field: &str, value: &str) -> BillingError {
    BillingError::validation(field, format!("unknown value '{}'", value))
}

/// How an enrolment is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingType {
    /// Blocks of class credits, consumed per attended class
    PerClass,
    /// Whole weeks of coverage, tracked by a paid-through date
    PerWeek,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::PerClass => "PER_CLASS",
            BillingType::PerWeek => "PER_WEEK",
        }
    }
}

impl fmt::Display for BillingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PER_CLASS" => Ok(BillingType::PerClass),
            "PER_WEEK" => Ok(BillingType::PerWeek),
            other => Err(unknown_variant("billing_type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Open,
    PartiallyPaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    /// Still accepting allocations
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Open | InvoiceStatus::PartiallyPaid | InvoiceStatus::Overdue
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "OPEN",
            InvoiceStatus::PartiallyPaid => "PARTIALLY_PAID",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Overdue => "OVERDUE",
            InvoiceStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(InvoiceStatus::Open),
            "PARTIALLY_PAID" => Ok(InvoiceStatus::PartiallyPaid),
            "PAID" => Ok(InvoiceStatus::Paid),
            "OVERDUE" => Ok(InvoiceStatus::Overdue),
            "CANCELLED" => Ok(InvoiceStatus::Cancelled),
            other => Err(unknown_variant("status", other)),
        }
    }
}

/// Why an invoice was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceKind {
    /// Blocks or billing periods of an enrolment
    Enrolment,
    /// Synthetic invoice recording a direct pay-ahead purchase
    PayAhead,
    /// Products sold over the counter
    CounterSale,
    Manual,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Enrolment => "ENROLMENT",
            InvoiceKind::PayAhead => "PAY_AHEAD",
            InvoiceKind::CounterSale => "COUNTER_SALE",
            InvoiceKind::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for InvoiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENROLMENT" => Ok(InvoiceKind::Enrolment),
            "PAY_AHEAD" => Ok(InvoiceKind::PayAhead),
            "COUNTER_SALE" => Ok(InvoiceKind::CounterSale),
            "MANUAL" => Ok(InvoiceKind::Manual),
            other => Err(unknown_variant("kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrolmentStatus {
    Active,
    Paused,
    Ended,
}

impl EnrolmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrolmentStatus::Active => "ACTIVE",
            EnrolmentStatus::Paused => "PAUSED",
            EnrolmentStatus::Ended => "ENDED",
        }
    }
}

impl fmt::Display for EnrolmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrolmentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(EnrolmentStatus::Active),
            "PAUSED" => Ok(EnrolmentStatus::Paused),
            "ENDED" => Ok(EnrolmentStatus::Ended),
            other => Err(unknown_variant("status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[default]
    Cash,
    Card,
    BankTransfer,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "CASH",
            PaymentMethod::Card => "CARD",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
            PaymentMethod::Other => "OTHER",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CASH" => Ok(PaymentMethod::Cash),
            "CARD" => Ok(PaymentMethod::Card),
            "BANK_TRANSFER" => Ok(PaymentMethod::BankTransfer),
            "OTHER" => Ok(PaymentMethod::Other),
            other => Err(unknown_variant("method", other)),
        }
    }
}

/// Stages a payment or undo passes through inside the coordinator.
///
/// Everything before `Persisting` happens in memory; `Persisting` is one atomic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Validating,
    Allocating,
    Projecting,
    Persisting,
    Committed,
    Failed,
}

impl TransactionState {
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        matches!(
            (self, next),
            (TransactionState::Validating, TransactionState::Allocating)
                | (TransactionState::Allocating, TransactionState::Projecting)
                | (TransactionState::Projecting, TransactionState::Persisting)
                | (TransactionState::Persisting, TransactionState::Committed)
                | (TransactionState::Validating, TransactionState::Failed)
                | (TransactionState::Allocating, TransactionState::Failed)
                | (TransactionState::Projecting, TransactionState::Failed)
                | (TransactionState::Persisting, TransactionState::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Validating => write!(f, "validating"),
            TransactionState::Allocating => write!(f, "allocating"),
            TransactionState::Projecting => write!(f, "projecting"),
            TransactionState::Persisting => write!(f, "persisting"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::Failed => write!(f, "failed"),
        }
    }
}
