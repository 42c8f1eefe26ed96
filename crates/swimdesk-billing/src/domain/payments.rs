use crate::domain::entitlements::{EntitlementChange, EntitlementDelta};
use crate::domain::money::Money;
use crate::domain::types::{
    AllocationId, EnrolmentId, FamilyId, InvoiceId, PaymentId, PaymentMethod,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied details that do not affect allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    pub method: PaymentMethod,
    pub note: Option<String>,
    /// When the money was received; defaults to the commit time
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    /// Absent only for walk-in counter sales
    pub family_id: Option<FamilyId>,
    pub amount: Money,
    pub method: PaymentMethod,
    pub note: Option<String>,
    pub paid_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub unallocated: Money,
    pub undone: bool,
    pub undone_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        family_id: Option<FamilyId>,
        amount: Money,
        metadata: &PaymentMetadata,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            family_id,
            amount,
            method: metadata.method,
            note: metadata.note.clone(),
            paid_at: metadata.paid_at.unwrap_or(now),
            idempotency_key,
            unallocated: Money::ZERO,
            undone: false,
            undone_at: None,
            created_at: now,
        }
    }

    pub fn with_id(mut self, id: PaymentId) -> Self {
        self.id = id;
        self
    }

    pub fn mark_undone(&mut self, now: DateTime<Utc>) {
        self.undone = true;
        self.undone_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(
        payment_id: PaymentId,
        invoice_id: InvoiceId,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AllocationId::new(),
            payment_id,
            invoice_id,
            amount,
            created_at: now,
        }
    }
}

/// A payment with everything undo needs to reverse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment: Payment,
    pub allocations: Vec<Allocation>,
    pub deltas: Vec<EntitlementDelta>,
}

/// Entitlement after a payment, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementOutcome {
    pub enrolment_id: EnrolmentId,
    pub credits_remaining: Option<u32>,
    pub paid_through_date: Option<NaiveDate>,
    pub requested_units: u32,
    pub applied_units: u32,
}

impl From<&EntitlementDelta> for EntitlementOutcome {
    fn from(delta: &EntitlementDelta) -> Self {
        let (credits_remaining, paid_through_date) = match delta.change {
            EntitlementChange::Credits { new, .. } => (Some(new), None),
            EntitlementChange::PaidThrough { new, .. } => (None, new),
        };
        Self {
            enrolment_id: delta.enrolment_id,
            credits_remaining,
            paid_through_date,
            requested_units: delta.requested_units,
            applied_units: delta.applied_units,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment_id: PaymentId,
    pub unallocated: Money,
    /// True when an earlier payment with the same idempotency key was returned
    pub duplicate: bool,
    pub allocations: Vec<Allocation>,
    pub entitlements: Vec<EntitlementOutcome>,
}

impl PaymentReceipt {
    pub fn from_record(record: &PaymentRecord, duplicate: bool) -> Self {
        Self {
            payment_id: record.payment.id,
            unallocated: record.payment.unallocated,
            duplicate,
            allocations: record.allocations.clone(),
            entitlements: record.deltas.iter().map(EntitlementOutcome::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoReceipt {
    pub payment_id: PaymentId,
    pub reversed_allocations: usize,
    pub restored_enrolments: Vec<EnrolmentId>,
    pub cancelled_invoices: Vec<InvoiceId>,
}
