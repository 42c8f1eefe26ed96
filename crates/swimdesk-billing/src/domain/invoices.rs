use crate::domain::money::Money;
use crate::domain::types::{
    EnrolmentId, FamilyId, InvoiceId, InvoiceKind, InvoiceStatus, PaymentId, ProductId,
};
use crate::error::{BillingError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub product_id: Option<ProductId>,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub total: Money,
}

impl InvoiceLineItem {
    pub fn new(
        product_id: Option<ProductId>,
        description: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Result<Self> {
        Ok(Self {
            product_id,
            description: description.into(),
            quantity,
            unit_price,
            total: unit_price.multiply(quantity)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    /// Absent only for walk-in counter sales
    pub family_id: Option<FamilyId>,
    pub enrolment_id: Option<EnrolmentId>,
    pub kind: InvoiceKind,
    pub amount: Money,
    pub amount_paid: Money,
    pub status: InvoiceStatus,
    pub due_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
    pub coverage_start: Option<NaiveDate>,
    pub coverage_end: Option<NaiveDate>,
    pub description: Option<String>,
    pub line_items: Vec<InvoiceLineItem>,
    /// Set on synthetic pay-ahead invoices
    pub created_by_payment: Option<PaymentId>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn new(
        family_id: Option<FamilyId>,
        kind: InvoiceKind,
        amount: Money,
        issued_at: DateTime<Utc>,
    ) -> Result<Self> {
        if !amount.is_positive() {
            return Err(BillingError::invalid_amount(format!(
                "invoice amount must be positive, got {}",
                amount
            )));
        }

        Ok(Self {
            id: InvoiceId::new(),
            family_id,
            enrolment_id: None,
            kind,
            amount,
            amount_paid: Money::ZERO,
            status: InvoiceStatus::Open,
            due_at: None,
            issued_at,
            coverage_start: None,
            coverage_end: None,
            description: None,
            line_items: Vec::new(),
            created_by_payment: None,
            cancelled_at: None,
        })
    }

    pub fn for_enrolment(mut self, enrolment_id: EnrolmentId) -> Self {
        self.enrolment_id = Some(enrolment_id);
        self
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn with_coverage(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.coverage_start = Some(start);
        self.coverage_end = Some(end);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_line_items(mut self, line_items: Vec<InvoiceLineItem>) -> Self {
        self.line_items = line_items;
        self
    }

    pub fn created_by(mut self, payment_id: PaymentId) -> Self {
        self.created_by_payment = Some(payment_id);
        self
    }

    pub fn balance(&self) -> Money {
        self.amount.saturating_sub(self.amount_paid)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == InvoiceStatus::Cancelled
    }

    /// Accepts allocations: open status and something left to pay.
    pub fn is_payable(&self) -> bool {
        self.status.is_open() && self.balance().is_positive()
    }

    /// Recompute `status` for `now`. Cancellation is sticky.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        if self.is_cancelled() {
            return;
        }
        self.status = derive_status(self.amount, self.amount_paid, self.due_at, now);
    }

    /// Cancel an invoice nobody has paid towards.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_cancelled() {
            return Err(BillingError::InvalidInvoiceState {
                id: self.id.to_string(),
                message: "invoice is already cancelled".to_string(),
            });
        }
        if !self.amount_paid.is_zero() {
            return Err(BillingError::InvalidInvoiceState {
                id: self.id.to_string(),
                message: format!("{} has already been paid towards it", self.amount_paid),
            });
        }
        self.status = InvoiceStatus::Cancelled;
        self.cancelled_at = Some(now);
        Ok(())
    }

    /// Oldest-first ordering: due date (or issue date when undated), issue date, id.
    pub fn ordering_key(&self) -> (DateTime<Utc>, DateTime<Utc>, InvoiceId) {
        (self.due_at.unwrap_or(self.issued_at), self.issued_at, self.id)
    }
}

/// Status as a pure function of amounts, due date and `now`.
pub fn derive_status(
    amount: Money,
    amount_paid: Money,
    due_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> InvoiceStatus {
    if amount_paid >= amount {
        InvoiceStatus::Paid
    } else if due_at.map(|due| due < now).unwrap_or(false) {
        InvoiceStatus::Overdue
    } else if amount_paid.is_positive() {
        InvoiceStatus::PartiallyPaid
    } else {
        InvoiceStatus::Open
    }
}

/// A family's invoices as seen at one instant.
#[derive(Debug, Clone)]
pub struct InvoiceLedger {
    family_id: FamilyId,
    invoices: Vec<Invoice>,
    now: DateTime<Utc>,
}

impl InvoiceLedger {
    pub fn new(family_id: FamilyId, invoices: Vec<Invoice>, now: DateTime<Utc>) -> Self {
        let invoices = invoices
            .into_iter()
            .map(|mut invoice| {
                invoice.refresh_status(now);
                invoice
            })
            .collect();
        Self {
            family_id,
            invoices,
            now,
        }
    }

    pub fn family_id(&self) -> FamilyId {
        self.family_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn invoices(&self) -> &[Invoice] {
        &self.invoices
    }

    pub fn get(&self, invoice_id: &InvoiceId) -> Option<&Invoice> {
        self.invoices.iter().find(|invoice| &invoice.id == invoice_id)
    }

    /// Payable invoices, oldest first.
    pub fn open_invoices(&self) -> Vec<&Invoice> {
        let mut open: Vec<&Invoice> = self
            .invoices
            .iter()
            .filter(|invoice| invoice.is_payable())
            .collect();
        open.sort_by_key(|invoice| invoice.ordering_key());
        open
    }

    pub fn outstanding(&self) -> Result<Money> {
        Money::sum(self.open_invoices().into_iter().map(Invoice::balance))
    }

    pub fn balance_of(invoice: &Invoice) -> Money {
        invoice.balance()
    }

    /// Apply up to `amount`, returning what was applied and the updated invoice.
    pub fn apply_amount(invoice: &Invoice, amount: Money, now: DateTime<Utc>) -> (Money, Invoice) {
        let mut updated = invoice.clone();
        if !amount.is_positive() || !invoice.status.is_open() {
            return (Money::ZERO, updated);
        }
        let applied = amount.min(invoice.balance());
        updated.amount_paid = Money::from_cents(invoice.amount_paid.cents() + applied.cents());
        updated.refresh_status(now);
        (applied, updated)
    }

    /// Inverse of [`InvoiceLedger::apply_amount`]; paid amount floors at zero.
    pub fn reverse_amount(invoice: &Invoice, amount: Money, now: DateTime<Utc>) -> Invoice {
        let mut updated = invoice.clone();
        if amount.is_positive() {
            updated.amount_paid = invoice.amount_paid.saturating_sub(amount);
        }
        updated.refresh_status(now);
        updated
    }
}
