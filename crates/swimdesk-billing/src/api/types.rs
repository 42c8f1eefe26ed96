//! JSON request and response bodies. Money travels as integer cents.

use crate::domain::allocation::{
    AllocationRequest, EnrolmentPurchase, PaymentTarget, PlannedAllocation,
};
use crate::domain::coordinator::{PayAheadRequest, PaymentPreview, PaymentRequest};
use crate::domain::enrolments::Enrolment;
use crate::domain::families::Student;
use crate::domain::invoices::{Invoice, InvoiceLineItem};
use crate::domain::invoicing::{CounterSaleItem, CounterSaleReceipt, CounterSaleRequest};
use crate::domain::money::Money;
use crate::domain::payments::{
    EntitlementOutcome, Payment, PaymentMetadata, PaymentReceipt, UndoReceipt,
};
use crate::domain::summary::BillingSummary;
use crate::domain::types::{
    BillingType, EnrolmentId, EnrolmentStatus, FamilyId, InvoiceId, InvoiceKind, InvoiceStatus,
    PaymentId, PaymentMethod, PlanId, ProductId, StudentId,
};
use crate::error::{BillingError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationModeDto {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationLineDto {
    pub invoice_id: InvoiceId,
    pub amount_cents: Money,
}

/// Body of `POST /families/{familyId}/payments` and its preview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub amount_cents: Option<Money>,
    /// Display string such as `"30.00"`, used when `amountCents` is absent
    pub amount: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub method: Option<PaymentMethod>,
    pub note: Option<String>,
    pub allocations: Option<Vec<AllocationLineDto>>,
    pub allocation_mode: Option<AllocationModeDto>,
    pub enrolment_id: Option<EnrolmentId>,
    pub plan_id: Option<PlanId>,
    pub quantity: Option<u32>,
    pub idempotency_key: Option<String>,
}

impl CreatePaymentRequest {
    pub fn amount(&self) -> Result<Money> {
        match (self.amount_cents, self.amount.as_deref()) {
            (Some(_), Some(_)) => Err(BillingError::validation(
                "amount",
                "give either amountCents or amount, not both",
            )),
            (Some(cents), None) => Ok(cents),
            (None, Some(display)) => Money::from_display_string(display),
            (None, None) => Err(BillingError::validation(
                "amountCents",
                "payment amount is required",
            )),
        }
    }

    /// Resolve the tagged payment target from the flat request fields.
    pub fn target(&self) -> Result<PaymentTarget> {
        if let Some(enrolment_id) = self.enrolment_id {
            if self.allocations.is_some() || self.allocation_mode.is_some() {
                return Err(BillingError::validation(
                    "enrolmentId",
                    "an enrolment purchase cannot also carry invoice allocations",
                ));
            }
            return Ok(PaymentTarget::EnrolmentPurchase(EnrolmentPurchase {
                enrolment_id,
                plan_id: self.plan_id,
                quantity: self.quantity.unwrap_or(1),
            }));
        }

        if self.plan_id.is_some() || self.quantity.is_some() {
            return Err(BillingError::validation(
                "enrolmentId",
                "planId and quantity apply only to enrolment purchases",
            ));
        }

        match (self.allocation_mode.unwrap_or(AllocationModeDto::Auto), &self.allocations) {
            (AllocationModeDto::Auto, None) => Ok(PaymentTarget::auto()),
            (AllocationModeDto::Auto, Some(_)) => Err(BillingError::validation(
                "allocations",
                "allocations require allocationMode MANUAL",
            )),
            (AllocationModeDto::Manual, None) => Err(BillingError::validation(
                "allocations",
                "MANUAL allocation requires allocations",
            )),
            (AllocationModeDto::Manual, Some(lines)) => Ok(PaymentTarget::manual(
                lines
                    .iter()
                    .map(|line| AllocationRequest {
                        invoice_id: line.invoice_id,
                        amount: line.amount_cents,
                    })
                    .collect(),
            )),
        }
    }

    pub fn into_request(self, family_id: FamilyId) -> Result<PaymentRequest> {
        let amount = self.amount()?;
        let target = self.target()?;
        let idempotency_key = idempotency_key(self.idempotency_key)?;
        Ok(PaymentRequest {
            family_id,
            amount,
            target,
            idempotency_key,
            metadata: PaymentMetadata {
                method: self.method.unwrap_or_default(),
                note: self.note,
                paid_at: self.paid_at,
            },
        })
    }
}

/// HTTP payment requests must carry a non-blank key.
fn idempotency_key(key: Option<String>) -> Result<Option<String>> {
    match key {
        None => Err(BillingError::validation(
            "idempotencyKey",
            "idempotency key is required",
        )),
        Some(key) if key.trim().is_empty() => Err(BillingError::validation(
            "idempotencyKey",
            "idempotency key must not be blank",
        )),
        key => Ok(key),
    }
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayAheadItemDto {
    pub enrolment_id: EnrolmentId,
    pub plan_id: Option<PlanId>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayAheadRequestDto {
    pub items: Vec<PayAheadItemDto>,
    pub method: Option<PaymentMethod>,
    pub note: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl PayAheadRequestDto {
    pub fn into_request(self, family_id: FamilyId) -> Result<PayAheadRequest> {
        Ok(PayAheadRequest {
            family_id,
            items: self
                .items
                .iter()
                .map(|item| EnrolmentPurchase {
                    enrolment_id: item.enrolment_id,
                    plan_id: item.plan_id,
                    quantity: item.quantity,
                })
                .collect(),
            idempotency_key: idempotency_key(self.idempotency_key)?,
            metadata: PaymentMetadata {
                method: self.method.unwrap_or_default(),
                note: self.note,
                paid_at: self.paid_at,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterItemDto {
    pub product_id: ProductId,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCounterInvoiceRequest {
    pub family_id: Option<FamilyId>,
    pub items: Vec<CounterItemDto>,
    #[serde(default)]
    pub pay_now: bool,
    pub payment_method: Option<PaymentMethod>,
    pub note: Option<String>,
}

impl From<CreateCounterInvoiceRequest> for CounterSaleRequest {
    fn from(request: CreateCounterInvoiceRequest) -> Self {
        CounterSaleRequest {
            family_id: request.family_id,
            items: request
                .items
                .iter()
                .map(|item| CounterSaleItem {
                    product_id: item.product_id,
                    quantity: item.quantity,
                })
                .collect(),
            pay_now: request.pay_now,
            metadata: PaymentMetadata {
                method: request.payment_method.unwrap_or_default(),
                note: request.note,
                paid_at: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueInvoiceRequest {
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationDto {
    pub invoice_id: InvoiceId,
    pub amount_cents: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementDto {
    pub enrolment_id: EnrolmentId,
    pub credits_remaining: Option<u32>,
    pub paid_through_date: Option<NaiveDate>,
    pub requested_units: u32,
    pub applied_units: u32,
}

impl From<&EntitlementOutcome> for EntitlementDto {
    fn from(outcome: &EntitlementOutcome) -> Self {
        Self {
            enrolment_id: outcome.enrolment_id,
            credits_remaining: outcome.credits_remaining,
            paid_through_date: outcome.paid_through_date,
            requested_units: outcome.requested_units,
            applied_units: outcome.applied_units,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub payment_id: PaymentId,
    pub unallocated_cents: Money,
    pub duplicate: bool,
    pub allocations: Vec<AllocationDto>,
    pub entitlements: Vec<EntitlementDto>,
}

impl From<PaymentReceipt> for PaymentResponse {
    fn from(receipt: PaymentReceipt) -> Self {
        Self {
            payment_id: receipt.payment_id,
            unallocated_cents: receipt.unallocated,
            duplicate: receipt.duplicate,
            allocations: receipt
                .allocations
                .iter()
                .map(|allocation| AllocationDto {
                    invoice_id: allocation.invoice_id,
                    amount_cents: allocation.amount,
                })
                .collect(),
            entitlements: receipt.entitlements.iter().map(EntitlementDto::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPreviewResponse {
    pub amount_cents: Money,
    pub allocations: Vec<AllocationDto>,
    pub unallocated_cents: Money,
    pub entitlements: Vec<EntitlementDto>,
}

impl From<PaymentPreview> for PaymentPreviewResponse {
    fn from(preview: PaymentPreview) -> Self {
        Self {
            amount_cents: preview.amount,
            allocations: preview
                .lines
                .iter()
                .map(|line: &PlannedAllocation| AllocationDto {
                    invoice_id: line.invoice_id,
                    amount_cents: line.amount,
                })
                .collect(),
            unallocated_cents: preview.unallocated,
            entitlements: preview.entitlements.iter().map(EntitlementDto::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoPaymentResponse {
    pub payment_id: PaymentId,
    pub reversed_allocations: usize,
    pub restored_enrolments: Vec<EnrolmentId>,
    pub cancelled_invoices: Vec<InvoiceId>,
}

impl From<UndoReceipt> for UndoPaymentResponse {
    fn from(receipt: UndoReceipt) -> Self {
        Self {
            payment_id: receipt.payment_id,
            reversed_allocations: receipt.reversed_allocations,
            restored_enrolments: receipt.restored_enrolments,
            cancelled_invoices: receipt.cancelled_invoices,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterInvoiceResponse {
    pub invoice_id: InvoiceId,
    pub payment_id: Option<PaymentId>,
}

impl From<CounterSaleReceipt> for CounterInvoiceResponse {
    fn from(receipt: CounterSaleReceipt) -> Self {
        Self {
            invoice_id: receipt.invoice_id,
            payment_id: receipt.payment_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemDto {
    pub product_id: Option<ProductId>,
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: Money,
    pub total_cents: Money,
}

impl From<&InvoiceLineItem> for LineItemDto {
    fn from(item: &InvoiceLineItem) -> Self {
        Self {
            product_id: item.product_id,
            description: item.description.clone(),
            quantity: item.quantity,
            unit_price_cents: item.unit_price,
            total_cents: item.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDto {
    pub invoice_id: InvoiceId,
    pub family_id: Option<FamilyId>,
    pub enrolment_id: Option<EnrolmentId>,
    pub kind: InvoiceKind,
    pub amount_cents: Money,
    pub amount_paid_cents: Money,
    pub balance_cents: Money,
    pub status: InvoiceStatus,
    pub due_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
    pub coverage_start: Option<NaiveDate>,
    pub coverage_end: Option<NaiveDate>,
    pub description: Option<String>,
    pub line_items: Vec<LineItemDto>,
    pub created_by_payment_id: Option<PaymentId>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl From<&Invoice> for InvoiceDto {
    fn from(invoice: &Invoice) -> Self {
        Self {
            invoice_id: invoice.id,
            family_id: invoice.family_id,
            enrolment_id: invoice.enrolment_id,
            kind: invoice.kind,
            amount_cents: invoice.amount,
            amount_paid_cents: invoice.amount_paid,
            balance_cents: invoice.balance(),
            status: invoice.status,
            due_at: invoice.due_at,
            issued_at: invoice.issued_at,
            coverage_start: invoice.coverage_start,
            coverage_end: invoice.coverage_end,
            description: invoice.description.clone(),
            line_items: invoice.line_items.iter().map(LineItemDto::from).collect(),
            created_by_payment_id: invoice.created_by_payment,
            cancelled_at: invoice.cancelled_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolmentDto {
    pub enrolment_id: EnrolmentId,
    pub student_id: StudentId,
    pub billing_type: BillingType,
    pub plan_id: Option<PlanId>,
    pub plan_price_cents: Money,
    pub credits_remaining: Option<u32>,
    pub paid_through_date: Option<NaiveDate>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status: EnrolmentStatus,
}

impl From<&Enrolment> for EnrolmentDto {
    fn from(enrolment: &Enrolment) -> Self {
        let per_class = enrolment.billing_type == BillingType::PerClass;
        Self {
            enrolment_id: enrolment.id,
            student_id: enrolment.student_id,
            billing_type: enrolment.billing_type,
            plan_id: enrolment.plan_id,
            plan_price_cents: enrolment.plan_price,
            credits_remaining: per_class.then_some(enrolment.credits_remaining),
            paid_through_date: if per_class {
                None
            } else {
                enrolment.paid_through_date
            },
            start_date: enrolment.start_date,
            end_date: enrolment.end_date,
            status: enrolment.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDto {
    pub payment_id: PaymentId,
    pub amount_cents: Money,
    pub method: PaymentMethod,
    pub note: Option<String>,
    pub paid_at: DateTime<Utc>,
    pub unallocated_cents: Money,
    pub undone: bool,
    pub undone_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Payment> for PaymentDto {
    fn from(payment: &Payment) -> Self {
        Self {
            payment_id: payment.id,
            amount_cents: payment.amount,
            method: payment.method,
            note: payment.note.clone(),
            paid_at: payment.paid_at,
            unallocated_cents: payment.unallocated,
            undone: payment.undone,
            undone_at: payment.undone_at,
            created_at: payment.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDto {
    pub student_id: StudentId,
    pub first_name: String,
    pub last_name: String,
}

impl From<&Student> for StudentDto {
    fn from(student: &Student) -> Self {
        Self {
            student_id: student.id,
            first_name: student.first_name.clone(),
            last_name: student.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSummaryResponse {
    pub family_id: FamilyId,
    pub family_name: String,
    pub outstanding_cents: Money,
    /// `outstandingCents` formatted for display, e.g. `"42.50"`
    pub outstanding: String,
    pub credits_total: u64,
    pub paid_through_latest: Option<NaiveDate>,
    pub next_due_invoice: Option<InvoiceDto>,
    pub open_invoices: Vec<InvoiceDto>,
    pub enrolments: Vec<EnrolmentDto>,
    pub payments: Vec<PaymentDto>,
    pub students: Vec<StudentDto>,
    pub generated_at: DateTime<Utc>,
}

impl From<BillingSummary> for BillingSummaryResponse {
    fn from(summary: BillingSummary) -> Self {
        Self {
            family_id: summary.family.id,
            family_name: summary.family.name,
            outstanding_cents: summary.outstanding,
            outstanding: summary.outstanding.to_display_string(),
            credits_total: summary.credits_total,
            paid_through_latest: summary.paid_through_latest,
            next_due_invoice: summary.next_due_invoice.as_ref().map(InvoiceDto::from),
            open_invoices: summary.open_invoices.iter().map(InvoiceDto::from).collect(),
            enrolments: summary.enrolments.iter().map(EnrolmentDto::from).collect(),
            payments: summary.payments.iter().map(PaymentDto::from).collect(),
            students: summary.students.iter().map(StudentDto::from).collect(),
            generated_at: summary.generated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}
