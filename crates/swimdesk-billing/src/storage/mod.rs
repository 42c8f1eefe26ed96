pub mod memory;
pub mod postgres;

use crate::domain::catalog::Product;
use crate::domain::enrolments::{Enrolment, EnrolmentPlan};
use crate::domain::entitlements::EntitlementDelta;
use crate::domain::families::{Family, Student};
use crate::domain::invoices::Invoice;
use crate::domain::payments::{Allocation, Payment, PaymentRecord};
use crate::domain::types::{
    EnrolmentId, FamilyId, InvoiceId, PaymentId, PlanId, ProductId,
};
use crate::error::Result;
use async_trait::async_trait;

pub use memory::InMemoryBillingRepository;
pub use postgres::PgBillingRepository;

/// Every row a payment, undo or invoice operation writes, applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub new_payment: Option<Payment>,
    pub payment_updates: Vec<Payment>,
    pub new_allocations: Vec<Allocation>,
    pub new_invoices: Vec<Invoice>,
    pub invoice_updates: Vec<Invoice>,
    pub enrolment_updates: Vec<Enrolment>,
    /// Deltas of `new_payment`
    pub new_deltas: Vec<EntitlementDelta>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new_payment.is_none()
            && self.payment_updates.is_empty()
            && self.new_allocations.is_empty()
            && self.new_invoices.is_empty()
            && self.invoice_updates.is_empty()
            && self.enrolment_updates.is_empty()
            && self.new_deltas.is_empty()
    }
}

/// Unit of work holding a family's exclusion lock.
///
/// Reads see the state as of the lock. Dropping the session without calling
/// [`FamilySession::commit`] discards it with nothing written.
#[async_trait]
pub trait FamilySession: Send {
    fn family_id(&self) -> FamilyId;

    async fn invoices(&mut self) -> Result<Vec<Invoice>>;
    async fn enrolments(&mut self) -> Result<Vec<Enrolment>>;
    async fn plan(&mut self, plan_id: &PlanId) -> Result<Option<EnrolmentPlan>>;
    async fn find_payment_by_key(&mut self, key: &str) -> Result<Option<PaymentRecord>>;
    async fn payment_record(&mut self, payment_id: &PaymentId) -> Result<Option<PaymentRecord>>;

    /// Write `changes` atomically and release the lock.
    async fn commit(self: Box<Self>, changes: ChangeSet) -> Result<()>;
}

#[async_trait]
pub trait BillingRepository: Send + Sync {
    /// Lock `family_id` and open a unit of work; fails with `FamilyNotFound` for unknown families.
    async fn begin_family(&self, family_id: &FamilyId) -> Result<Box<dyn FamilySession>>;

    /// Atomic write for records with no family (walk-in counter sales).
    async fn commit_detached(&self, changes: ChangeSet) -> Result<()>;

    async fn get_family(&self, family_id: &FamilyId) -> Result<Option<Family>>;
    async fn list_students(&self, family_id: &FamilyId) -> Result<Vec<Student>>;
    async fn list_enrolments(&self, family_id: &FamilyId) -> Result<Vec<Enrolment>>;
    async fn list_invoices(&self, family_id: &FamilyId) -> Result<Vec<Invoice>>;
    async fn list_payments(&self, family_id: &FamilyId) -> Result<Vec<Payment>>;
    async fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<Payment>>;
    async fn get_enrolment(&self, enrolment_id: &EnrolmentId) -> Result<Option<Enrolment>>;
    async fn get_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<Invoice>>;
    async fn get_plan(&self, plan_id: &PlanId) -> Result<Option<EnrolmentPlan>>;
    async fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>>;
}
