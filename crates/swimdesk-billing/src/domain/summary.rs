use crate::domain::enrolments::Enrolment;
use crate::domain::families::{Family, Student};
use crate::domain::invoices::{Invoice, InvoiceLedger};
use crate::domain::money::Money;
use crate::domain::payments::Payment;
use crate::domain::types::{BillingType, FamilyId};
use crate::error::{BillingError, Result};
use crate::storage::BillingRepository;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingSummary {
    pub family: Family,
    pub outstanding: Money,
    pub credits_total: u64,
    pub paid_through_latest: Option<NaiveDate>,
    pub next_due_invoice: Option<Invoice>,
    pub open_invoices: Vec<Invoice>,
    pub enrolments: Vec<Enrolment>,
    /// Newest first, undone payments included
    pub payments: Vec<Payment>,
    pub students: Vec<Student>,
    pub generated_at: DateTime<Utc>,
}

/// Read-only billing view of a family, rebuilt from current rows on every call.
pub struct BillingSummaryBuilder {
    repository: Arc<dyn BillingRepository + Send + Sync>,
}

impl BillingSummaryBuilder {
    pub fn new(repository: Arc<dyn BillingRepository + Send + Sync>) -> Self {
        Self { repository }
    }

    pub async fn build(&self, family_id: &FamilyId, now: DateTime<Utc>) -> Result<BillingSummary> {
        let family = self
            .repository
            .get_family(family_id)
            .await?
            .ok_or_else(|| BillingError::FamilyNotFound {
                id: family_id.to_string(),
            })?;

        let students = self.repository.list_students(family_id).await?;
        let enrolments = self.repository.list_enrolments(family_id).await?;
        let invoices = self.repository.list_invoices(family_id).await?;
        let payments = self.repository.list_payments(family_id).await?;

        assemble(family, students, enrolments, invoices, payments, now)
    }
}

pub fn assemble(
    family: Family,
    students: Vec<Student>,
    enrolments: Vec<Enrolment>,
    invoices: Vec<Invoice>,
    mut payments: Vec<Payment>,
    now: DateTime<Utc>,
) -> Result<BillingSummary> {
    let ledger = InvoiceLedger::new(family.id, invoices, now);
    let open_invoices: Vec<Invoice> = ledger.open_invoices().into_iter().cloned().collect();
    let outstanding = ledger.outstanding()?;

    let next_due_invoice = open_invoices
        .iter()
        .min_by_key(|invoice| {
            (
                invoice.due_at.is_none(),
                invoice.due_at,
                invoice.issued_at,
                invoice.id,
            )
        })
        .cloned();

    let credits_total = enrolments
        .iter()
        .filter(|enrolment| enrolment.billing_type == BillingType::PerClass)
        .map(|enrolment| u64::from(enrolment.credits_remaining))
        .sum();
    let paid_through_latest = enrolments
        .iter()
        .filter(|enrolment| enrolment.billing_type == BillingType::PerWeek)
        .filter_map(|enrolment| enrolment.paid_through_date)
        .max();

    payments.sort_by_key(|payment| (Reverse(payment.paid_at), Reverse(payment.created_at)));

    Ok(BillingSummary {
        family,
        outstanding,
        credits_total,
        paid_through_latest,
        next_due_invoice,
        open_invoices,
        enrolments,
        payments,
        students,
        generated_at: now,
    })
}
