use crate::domain::coordinator::PaymentOperations;
use crate::domain::entitlements::{EntitlementProjector, ProjectionContext};
use crate::domain::invoices::{Invoice, InvoiceLineItem};
use crate::domain::money::Money;
use crate::domain::payments::PaymentMetadata;
use crate::domain::types::{
    BillingType, EnrolmentId, FamilyId, InvoiceId, InvoiceKind, PaymentId, ProductId,
};
use crate::error::{BillingError, Result};
use crate::storage::{BillingRepository, ChangeSet};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSaleItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSaleRequest {
    /// `None` for a walk-in customer
    pub family_id: Option<FamilyId>,
    pub items: Vec<CounterSaleItem>,
    pub pay_now: bool,
    pub metadata: PaymentMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSaleReceipt {
    pub invoice_id: InvoiceId,
    pub payment_id: Option<PaymentId>,
}

/// Issues and cancels invoices outside the payment path.
pub struct InvoiceManager {
    repository: Arc<dyn BillingRepository + Send + Sync>,
    payments: Arc<dyn PaymentOperations>,
    default_due_days: u32,
}

impl InvoiceManager {
    pub fn new(
        repository: Arc<dyn BillingRepository + Send + Sync>,
        payments: Arc<dyn PaymentOperations>,
        default_due_days: u32,
    ) -> Self {
        Self {
            repository,
            payments,
            default_due_days,
        }
    }

    fn default_due_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(i64::from(self.default_due_days))
    }

    /// Bill `quantity` blocks or periods of an enrolment at its plan price.
    ///
    /// PER_WEEK invoices carry the coverage they would buy, placed after any coverage
    /// already paid or invoiced. The enrolment itself is left untouched until the
    /// invoice is paid.
    pub async fn issue_enrolment_invoice(
        &self,
        enrolment_id: &EnrolmentId,
        quantity: u32,
        due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Invoice> {
        if quantity == 0 {
            return Err(BillingError::validation(
                "quantity",
                "quantity must be at least 1",
            ));
        }

        let family_id = self
            .repository
            .get_enrolment(enrolment_id)
            .await?
            .ok_or_else(|| BillingError::EnrolmentNotFound {
                id: enrolment_id.to_string(),
            })?
            .family_id;

        let mut session = self.repository.begin_family(&family_id).await?;
        let enrolment = session
            .enrolments()
            .await?
            .into_iter()
            .find(|enrolment| &enrolment.id == enrolment_id)
            .ok_or_else(|| BillingError::EnrolmentNotFound {
                id: enrolment_id.to_string(),
            })?;
        let terms = enrolment.unit_terms()?;
        let amount = terms.unit_price.multiply(quantity)?;

        let mut invoice = Invoice::new(Some(family_id), InvoiceKind::Enrolment, amount, now)?
            .for_enrolment(enrolment.id)
            .with_due_at(due_at.unwrap_or_else(|| self.default_due_at(now)));

        match terms.billing_type {
            BillingType::PerClass => {
                invoice = invoice.with_description(format!(
                    "{} x {} class block",
                    quantity, terms.block_class_count
                ));
            }
            BillingType::PerWeek => {
                let latest_coverage_end = session
                    .invoices()
                    .await?
                    .iter()
                    .filter(|existing| existing.enrolment_id == Some(enrolment.id))
                    .filter(|existing| !existing.is_cancelled())
                    .filter_map(|existing| existing.coverage_end)
                    .max();
                let context = ProjectionContext {
                    today: now.date_naive(),
                    latest_coverage_end,
                };
                let window =
                    EntitlementProjector::coverage_window(&enrolment, &terms, quantity, &context)?
                        .ok_or_else(|| {
                            BillingError::validation(
                                "quantity",
                                format!(
                                    "enrolment {} has no billable weeks left before its end date",
                                    enrolment.id
                                ),
                            )
                        })?;
                invoice = invoice
                    .with_coverage(window.start, window.end)
                    .with_description(format!(
                        "{} x {} week period ({} to {})",
                        window.applied_units, terms.duration_weeks, window.start, window.end
                    ));
            }
        }

        session
            .commit(ChangeSet {
                new_invoices: vec![invoice.clone()],
                ..ChangeSet::default()
            })
            .await?;

        info!(
            family_id = %family_id,
            enrolment_id = %enrolment_id,
            invoice_id = %invoice.id,
            amount = %invoice.amount,
            "Enrolment invoice issued"
        );
        Ok(invoice)
    }

    pub async fn create_counter_invoice(
        &self,
        request: CounterSaleRequest,
        now: DateTime<Utc>,
    ) -> Result<CounterSaleReceipt> {
        if request.items.is_empty() {
            return Err(BillingError::validation(
                "items",
                "a counter sale needs at least one item",
            ));
        }
        if request.family_id.is_none() && !request.pay_now {
            return Err(BillingError::validation(
                "pay_now",
                "walk-in sales must be paid at the counter",
            ));
        }
        if let Some(family_id) = &request.family_id {
            if self.repository.get_family(family_id).await?.is_none() {
                return Err(BillingError::FamilyNotFound {
                    id: family_id.to_string(),
                });
            }
        }

        let mut line_items = Vec::with_capacity(request.items.len());
        for item in &request.items {
            if item.quantity == 0 {
                return Err(BillingError::validation(
                    "quantity",
                    format!("quantity for product {} must be at least 1", item.product_id),
                ));
            }
            let product = self
                .repository
                .get_product(&item.product_id)
                .await?
                .ok_or_else(|| BillingError::ProductNotFound {
                    id: item.product_id.to_string(),
                })?;
            if !product.active {
                return Err(BillingError::validation(
                    "product_id",
                    format!("product {} is no longer sold", product.id),
                ));
            }
            line_items.push(InvoiceLineItem::new(
                Some(product.id),
                product.name.clone(),
                item.quantity,
                product.price,
            )?);
        }
        let amount = Money::sum(line_items.iter().map(|line| line.total))?;

        let mut invoice = Invoice::new(request.family_id, InvoiceKind::CounterSale, amount, now)?
            .with_line_items(line_items)
            .with_due_at(self.default_due_at(now));
        if let Some(note) = &request.metadata.note {
            invoice = invoice.with_description(note.clone());
        }
        let invoice_id = invoice.id;

        if request.pay_now {
            let receipt = self
                .payments
                .settle_new_invoice(invoice, request.metadata, now)
                .await?;
            return Ok(CounterSaleReceipt {
                invoice_id,
                payment_id: Some(receipt.payment_id),
            });
        }

        // Unpaid sales only exist for families, checked above.
        let family_id = request.family_id.ok_or_else(|| {
            BillingError::validation("family_id", "unpaid counter sales need a family")
        })?;
        let session = self.repository.begin_family(&family_id).await?;
        session
            .commit(ChangeSet {
                new_invoices: vec![invoice],
                ..ChangeSet::default()
            })
            .await?;

        info!(
            family_id = %family_id,
            invoice_id = %invoice_id,
            amount = %amount,
            "Counter sale invoiced"
        );
        Ok(CounterSaleReceipt {
            invoice_id,
            payment_id: None,
        })
    }

    /// Cancel an invoice nothing has been paid towards.
    pub async fn cancel_invoice(
        &self,
        invoice_id: &InvoiceId,
        now: DateTime<Utc>,
    ) -> Result<Invoice> {
        let invoice = self
            .repository
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound {
                id: invoice_id.to_string(),
            })?;

        let cancelled = match invoice.family_id {
            Some(family_id) => {
                let mut session = self.repository.begin_family(&family_id).await?;
                let mut current = session
                    .invoices()
                    .await?
                    .into_iter()
                    .find(|candidate| &candidate.id == invoice_id)
                    .ok_or_else(|| BillingError::InvoiceNotFound {
                        id: invoice_id.to_string(),
                    })?;
                current.cancel(now)?;
                session
                    .commit(ChangeSet {
                        invoice_updates: vec![current.clone()],
                        ..ChangeSet::default()
                    })
                    .await?;
                current
            }
            None => {
                let mut current = invoice;
                current.cancel(now)?;
                self.repository
                    .commit_detached(ChangeSet {
                        invoice_updates: vec![current.clone()],
                        ..ChangeSet::default()
                    })
                    .await?;
                current
            }
        };

        info!(invoice_id = %invoice_id, "Invoice cancelled");
        Ok(cancelled)
    }
}
