use super::rows::*;
use crate::domain::enrolments::{Enrolment, EnrolmentPlan};
use crate::domain::invoices::Invoice;
use crate::domain::payments::{Payment, PaymentRecord};
use crate::domain::types::{FamilyId, PaymentId, PlanId};
use crate::error::{BillingError, Result};
use crate::storage::{ChangeSet, FamilySession};
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use tracing::debug;

/// Family unit of work over one PostgreSQL transaction.
///
/// The family's advisory lock is scoped to `tx`, so commit or rollback releases it.
pub(super) struct PgFamilySession {
    family_id: FamilyId,
    tx: Transaction<'static, Postgres>,
}

impl PgFamilySession {
    pub(super) fn new(family_id: FamilyId, tx: Transaction<'static, Postgres>) -> Self {
        Self { family_id, tx }
    }

    async fn load_record(&mut self, payment: Payment) -> Result<PaymentRecord> {
        let allocations = sqlx::query(&format!(
            "SELECT {} FROM billing.allocations WHERE payment_id = $1 ORDER BY created_at, allocation_id",
            ALLOCATION_COLUMNS
        ))
        .bind(payment.id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("load_allocations", e))?
        .iter()
        .map(allocation_from_row)
        .collect::<Result<Vec<_>>>()?;

        let deltas = sqlx::query(
            "SELECT enrolment_id, change, requested_units, applied_units \
             FROM billing.entitlement_deltas WHERE payment_id = $1 ORDER BY delta_id",
        )
        .bind(payment.id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("load_entitlement_deltas", e))?
        .iter()
        .map(delta_from_row)
        .collect::<Result<Vec<_>>>()?;

        Ok(PaymentRecord {
            payment,
            allocations,
            deltas,
        })
    }
}

#[async_trait]
impl FamilySession for PgFamilySession {
    fn family_id(&self) -> FamilyId {
        self.family_id
    }

    async fn invoices(&mut self) -> Result<Vec<Invoice>> {
        sqlx::query(&format!(
            "SELECT {} FROM billing.invoices WHERE family_id = $1 ORDER BY issued_at, invoice_id",
            INVOICE_COLUMNS
        ))
        .bind(self.family_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("session_invoices", e))?
        .iter()
        .map(invoice_from_row)
        .collect()
    }

    async fn enrolments(&mut self) -> Result<Vec<Enrolment>> {
        sqlx::query(&format!(
            "SELECT {} FROM billing.enrolments WHERE family_id = $1 ORDER BY start_date, enrolment_id",
            ENROLMENT_COLUMNS
        ))
        .bind(self.family_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("session_enrolments", e))?
        .iter()
        .map(enrolment_from_row)
        .collect()
    }

    async fn plan(&mut self, plan_id: &PlanId) -> Result<Option<EnrolmentPlan>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.enrolment_plans WHERE plan_id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("session_plan", e))?;
        row.as_ref().map(plan_from_row).transpose()
    }

    async fn find_payment_by_key(&mut self, key: &str) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.payments WHERE family_id = $1 AND idempotency_key = $2",
            PAYMENT_COLUMNS
        ))
        .bind(self.family_id.as_uuid())
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("find_payment_by_key", e))?;

        match row {
            Some(row) => {
                let payment = payment_from_row(&row)?;
                Ok(Some(self.load_record(payment).await?))
            }
            None => Ok(None),
        }
    }

    async fn payment_record(&mut self, payment_id: &PaymentId) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.payments WHERE payment_id = $1 AND family_id = $2",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id.as_uuid())
        .bind(self.family_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("payment_record", e))?;

        match row {
            Some(row) => {
                let payment = payment_from_row(&row)?;
                Ok(Some(self.load_record(payment).await?))
            }
            None => Ok(None),
        }
    }

    async fn commit(self: Box<Self>, changes: ChangeSet) -> Result<()> {
        let PgFamilySession { family_id, mut tx } = *self;
        write_changes(&mut tx, &changes).await?;
        tx.commit()
            .await
            .map_err(|e| BillingError::persistence("commit_family", e))?;
        debug!(family_id = %family_id, "Family session committed");
        Ok(())
    }
}

/// Write a change set inside `tx`, parents before children.
pub(super) async fn write_changes(
    tx: &mut Transaction<'_, Postgres>,
    changes: &ChangeSet,
) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    if let Some(payment) = &changes.new_payment {
        insert_payment(tx, payment).await?;
    } else if !changes.new_deltas.is_empty() {
        return Err(BillingError::persistence(
            "write_changes",
            "entitlement deltas need a new payment",
        ));
    }

    for invoice in &changes.new_invoices {
        insert_invoice(tx, invoice).await?;
    }

    for invoice in &changes.invoice_updates {
        let result = sqlx::query(
            "UPDATE billing.invoices \
             SET amount_paid_cents = $2, status = $3, cancelled_at = $4 \
             WHERE invoice_id = $1",
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.amount_paid.cents())
        .bind(invoice.status.as_str())
        .bind(invoice.cancelled_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::persistence("update_invoice", e))?;
        ensure_updated(result.rows_affected(), "invoice", invoice.id)?;
    }

    for allocation in &changes.new_allocations {
        sqlx::query(
            "INSERT INTO billing.allocations \
             (allocation_id, payment_id, invoice_id, amount_cents, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(allocation.id.as_uuid())
        .bind(allocation.payment_id.as_uuid())
        .bind(allocation.invoice_id.as_uuid())
        .bind(allocation.amount.cents())
        .bind(allocation.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::persistence("insert_allocation", e))?;
    }

    for enrolment in &changes.enrolment_updates {
        let result = sqlx::query(
            "UPDATE billing.enrolments \
             SET credits_remaining = $2, paid_through_date = $3, status = $4 \
             WHERE enrolment_id = $1",
        )
        .bind(enrolment.id.as_uuid())
        .bind(to_db_count(enrolment.credits_remaining))
        .bind(enrolment.paid_through_date)
        .bind(enrolment.status.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::persistence("update_enrolment", e))?;
        ensure_updated(result.rows_affected(), "enrolment", enrolment.id)?;
    }

    if let Some(payment) = &changes.new_payment {
        for delta in &changes.new_deltas {
            let change = serde_json::to_value(&delta.change)
                .map_err(|e| BillingError::persistence("encode_entitlement_change", e))?;
            sqlx::query(
                "INSERT INTO billing.entitlement_deltas \
                 (payment_id, enrolment_id, change, requested_units, applied_units) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(payment.id.as_uuid())
            .bind(delta.enrolment_id.as_uuid())
            .bind(change)
            .bind(to_db_count(delta.requested_units))
            .bind(to_db_count(delta.applied_units))
            .execute(&mut **tx)
            .await
            .map_err(|e| BillingError::persistence("insert_entitlement_delta", e))?;
        }
    }

    for payment in &changes.payment_updates {
        let result = sqlx::query(
            "UPDATE billing.payments \
             SET unallocated_cents = $2, undone = $3, undone_at = $4 \
             WHERE payment_id = $1",
        )
        .bind(payment.id.as_uuid())
        .bind(payment.unallocated.cents())
        .bind(payment.undone)
        .bind(payment.undone_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::persistence("update_payment", e))?;
        ensure_updated(result.rows_affected(), "payment", payment.id)?;
    }

    Ok(())
}

async fn insert_payment(tx: &mut Transaction<'_, Postgres>, payment: &Payment) -> Result<()> {
    sqlx::query(
        "INSERT INTO billing.payments \
         (payment_id, family_id, amount_cents, method, note, paid_at, idempotency_key, \
          unallocated_cents, undone, undone_at, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(payment.id.as_uuid())
    .bind(payment.family_id.map(|id| id.as_uuid()))
    .bind(payment.amount.cents())
    .bind(payment.method.as_str())
    .bind(&payment.note)
    .bind(payment.paid_at)
    .bind(&payment.idempotency_key)
    .bind(payment.unallocated.cents())
    .bind(payment.undone)
    .bind(payment.undone_at)
    .bind(payment.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| BillingError::persistence("insert_payment", e))?;
    Ok(())
}

async fn insert_invoice(tx: &mut Transaction<'_, Postgres>, invoice: &Invoice) -> Result<()> {
    let line_items = serde_json::to_value(&invoice.line_items)
        .map_err(|e| BillingError::persistence("encode_line_items", e))?;
    sqlx::query(
        "INSERT INTO billing.invoices \
         (invoice_id, family_id, enrolment_id, kind, amount_cents, amount_paid_cents, status, \
          due_at, issued_at, coverage_start, coverage_end, description, line_items, \
          created_by_payment_id, cancelled_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
    )
    .bind(invoice.id.as_uuid())
    .bind(invoice.family_id.map(|id| id.as_uuid()))
    .bind(invoice.enrolment_id.map(|id| id.as_uuid()))
    .bind(invoice.kind.as_str())
    .bind(invoice.amount.cents())
    .bind(invoice.amount_paid.cents())
    .bind(invoice.status.as_str())
    .bind(invoice.due_at)
    .bind(invoice.issued_at)
    .bind(invoice.coverage_start)
    .bind(invoice.coverage_end)
    .bind(&invoice.description)
    .bind(line_items)
    .bind(invoice.created_by_payment.map(|id| id.as_uuid()))
    .bind(invoice.cancelled_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| BillingError::persistence("insert_invoice", e))?;
    Ok(())
}

fn ensure_updated(rows: u64, entity: &str, id: impl std::fmt::Display) -> Result<()> {
    if rows == 0 {
        return Err(BillingError::persistence(
            "write_changes",
            format!("{} {} does not exist", entity, id),
        ));
    }
    Ok(())
}
