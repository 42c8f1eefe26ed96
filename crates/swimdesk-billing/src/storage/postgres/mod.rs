mod rows;
mod session;

use crate::domain::catalog::Product;
use crate::domain::enrolments::{Enrolment, EnrolmentPlan};
use crate::domain::families::{Family, Student};
use crate::domain::invoices::Invoice;
use crate::domain::payments::Payment;
use crate::domain::types::{
    EnrolmentId, FamilyId, InvoiceId, PaymentId, PlanId, ProductId,
};
use crate::error::{BillingError, Result};
use crate::storage::{BillingRepository, ChangeSet, FamilySession};
use async_trait::async_trait;
use rows::*;
use session::{write_changes, PgFamilySession};
use sqlx::PgPool;
use swimdesk_common::distributed::{AdvisoryLock, LockError, LockKey};
use tracing::debug;

/// Advisory lock namespace for per-family payment serialisation
const FAMILY_LOCK_NAMESPACE: u16 = 0x5D01;

pub struct PgBillingRepository {
    pool: PgPool,
    lock_timeout_secs: u64,
}

impl PgBillingRepository {
    pub fn new(pool: PgPool, lock_timeout_secs: u64) -> Self {
        Self {
            pool,
            lock_timeout_secs,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn family_lock_key(family_id: &FamilyId) -> LockKey {
    LockKey::from_uuid(FAMILY_LOCK_NAMESPACE, &family_id.as_uuid())
}

#[async_trait]
impl BillingRepository for PgBillingRepository {
    async fn begin_family(&self, family_id: &FamilyId) -> Result<Box<dyn FamilySession>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::database("begin_family", e))?;

        let key = family_lock_key(family_id);
        AdvisoryLock::lock_in_transaction(&mut tx, key, self.lock_timeout_secs)
            .await
            .map_err(|e| match e {
                LockError::Timeout(seconds) => BillingError::FamilyBusy {
                    family_id: family_id.to_string(),
                    seconds,
                },
                other => BillingError::database("lock_family", other),
            })?;
        debug!(family_id = %family_id, lock = %key, "Family lock acquired");

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM billing.families WHERE family_id = $1)",
        )
        .bind(family_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::database("begin_family", e))?;
        if !exists {
            return Err(BillingError::FamilyNotFound {
                id: family_id.to_string(),
            });
        }

        Ok(Box::new(PgFamilySession::new(*family_id, tx)))
    }

    async fn commit_detached(&self, changes: ChangeSet) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::persistence("commit_detached", e))?;
        write_changes(&mut tx, &changes).await?;
        tx.commit()
            .await
            .map_err(|e| BillingError::persistence("commit_detached", e))
    }

    async fn get_family(&self, family_id: &FamilyId) -> Result<Option<Family>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.families WHERE family_id = $1",
            FAMILY_COLUMNS
        ))
        .bind(family_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("get_family", e))?;
        row.as_ref().map(family_from_row).transpose()
    }

    async fn list_students(&self, family_id: &FamilyId) -> Result<Vec<Student>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM billing.students WHERE family_id = $1 ORDER BY last_name, first_name",
            STUDENT_COLUMNS
        ))
        .bind(family_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("list_students", e))?;
        rows.iter().map(student_from_row).collect()
    }

    async fn list_enrolments(&self, family_id: &FamilyId) -> Result<Vec<Enrolment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM billing.enrolments WHERE family_id = $1 ORDER BY start_date, enrolment_id",
            ENROLMENT_COLUMNS
        ))
        .bind(family_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("list_enrolments", e))?;
        rows.iter().map(enrolment_from_row).collect()
    }

    async fn list_invoices(&self, family_id: &FamilyId) -> Result<Vec<Invoice>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM billing.invoices WHERE family_id = $1 ORDER BY issued_at, invoice_id",
            INVOICE_COLUMNS
        ))
        .bind(family_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("list_invoices", e))?;
        rows.iter().map(invoice_from_row).collect()
    }

    async fn list_payments(&self, family_id: &FamilyId) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM billing.payments WHERE family_id = $1 ORDER BY paid_at DESC, created_at DESC",
            PAYMENT_COLUMNS
        ))
        .bind(family_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("list_payments", e))?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.payments WHERE payment_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("get_payment", e))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn get_enrolment(&self, enrolment_id: &EnrolmentId) -> Result<Option<Enrolment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.enrolments WHERE enrolment_id = $1",
            ENROLMENT_COLUMNS
        ))
        .bind(enrolment_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("get_enrolment", e))?;
        row.as_ref().map(enrolment_from_row).transpose()
    }

    async fn get_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<Invoice>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("get_invoice", e))?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn get_plan(&self, plan_id: &PlanId) -> Result<Option<EnrolmentPlan>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.enrolment_plans WHERE plan_id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("get_plan", e))?;
        row.as_ref().map(plan_from_row).transpose()
    }

    async fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM billing.products WHERE product_id = $1",
            PRODUCT_COLUMNS
        ))
        .bind(product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("get_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }
}
