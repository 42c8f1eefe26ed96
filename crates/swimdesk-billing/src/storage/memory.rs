use crate::domain::catalog::Product;
use crate::domain::enrolments::{Enrolment, EnrolmentPlan};
use crate::domain::entitlements::EntitlementDelta;
use crate::domain::families::{Family, Student};
use crate::domain::invoices::Invoice;
use crate::domain::payments::{Allocation, Payment, PaymentRecord};
use crate::domain::types::{EnrolmentId, FamilyId, InvoiceId, PaymentId, PlanId, ProductId};
use crate::error::{BillingError, Result};
use crate::storage::{BillingRepository, ChangeSet, FamilySession};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    families: HashMap<FamilyId, Family>,
    students: Vec<Student>,
    plans: HashMap<PlanId, EnrolmentPlan>,
    products: HashMap<ProductId, Product>,
    enrolments: HashMap<EnrolmentId, Enrolment>,
    invoices: HashMap<InvoiceId, Invoice>,
    payments: HashMap<PaymentId, Payment>,
    allocations: Vec<Allocation>,
    deltas: Vec<(PaymentId, EntitlementDelta)>,
}

impl Tables {
    fn payment_record(&self, payment: &Payment) -> PaymentRecord {
        PaymentRecord {
            payment: payment.clone(),
            allocations: self
                .allocations
                .iter()
                .filter(|allocation| allocation.payment_id == payment.id)
                .copied()
                .collect(),
            deltas: self
                .deltas
                .iter()
                .filter(|(payment_id, _)| payment_id == &payment.id)
                .map(|(_, delta)| *delta)
                .collect(),
        }
    }

    fn family_invoices(&self, family_id: &FamilyId) -> Vec<Invoice> {
        let mut invoices: Vec<Invoice> = self
            .invoices
            .values()
            .filter(|invoice| invoice.family_id.as_ref() == Some(family_id))
            .cloned()
            .collect();
        invoices.sort_by_key(|invoice| (invoice.issued_at, invoice.id));
        invoices
    }

    fn family_enrolments(&self, family_id: &FamilyId) -> Vec<Enrolment> {
        let mut enrolments: Vec<Enrolment> = self
            .enrolments
            .values()
            .filter(|enrolment| &enrolment.family_id == family_id)
            .cloned()
            .collect();
        enrolments.sort_by_key(|enrolment| (enrolment.start_date, enrolment.id));
        enrolments
    }

    /// Check every constraint first so a rejected change set leaves no trace.
    fn apply(&mut self, changes: ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        if let Some(payment) = &changes.new_payment {
            if self.payments.contains_key(&payment.id) {
                return Err(conflict(format!("payment {} already exists", payment.id)));
            }
            if let Some(key) = &payment.idempotency_key {
                let taken = self.payments.values().any(|existing| {
                    existing.family_id == payment.family_id
                        && existing.idempotency_key.as_ref() == Some(key)
                });
                if taken {
                    return Err(conflict(format!("idempotency key '{}' already used", key)));
                }
            }
        } else if !changes.new_deltas.is_empty() {
            return Err(conflict("entitlement deltas need a new payment".to_string()));
        }
        for payment in &changes.payment_updates {
            if !self.payments.contains_key(&payment.id) {
                return Err(conflict(format!("payment {} does not exist", payment.id)));
            }
        }
        for invoice in &changes.new_invoices {
            if self.invoices.contains_key(&invoice.id) {
                return Err(conflict(format!("invoice {} already exists", invoice.id)));
            }
        }
        for invoice in &changes.invoice_updates {
            if !self.invoices.contains_key(&invoice.id) {
                return Err(conflict(format!("invoice {} does not exist", invoice.id)));
            }
        }
        for enrolment in &changes.enrolment_updates {
            if !self.enrolments.contains_key(&enrolment.id) {
                return Err(conflict(format!("enrolment {} does not exist", enrolment.id)));
            }
        }
        for allocation in &changes.new_allocations {
            let known = self.invoices.contains_key(&allocation.invoice_id)
                || changes
                    .new_invoices
                    .iter()
                    .any(|invoice| invoice.id == allocation.invoice_id);
            if !known {
                return Err(conflict(format!(
                    "allocation references unknown invoice {}",
                    allocation.invoice_id
                )));
            }
        }

        let payment_id = changes.new_payment.as_ref().map(|payment| payment.id);
        if let Some(payment) = changes.new_payment {
            self.payments.insert(payment.id, payment);
        }
        for payment in changes.payment_updates {
            self.payments.insert(payment.id, payment);
        }
        for invoice in changes.new_invoices.into_iter().chain(changes.invoice_updates) {
            self.invoices.insert(invoice.id, invoice);
        }
        for enrolment in changes.enrolment_updates {
            self.enrolments.insert(enrolment.id, enrolment);
        }
        self.allocations.extend(changes.new_allocations);
        if let Some(payment_id) = payment_id {
            self.deltas
                .extend(changes.new_deltas.into_iter().map(|delta| (payment_id, delta)));
        }
        Ok(())
    }
}

fn conflict(message: String) -> BillingError {
    BillingError::persistence("commit_changes", message)
}

/// Repository kept in process memory, for tests and local runs.
///
/// Each family has its own `tokio` mutex; a session holds it until commit or drop.
pub struct InMemoryBillingRepository {
    tables: Arc<RwLock<Tables>>,
    family_locks: DashMap<FamilyId, Arc<Mutex<()>>>,
    lock_timeout: Duration,
    fail_next_commit: Arc<AtomicBool>,
}

impl Default for InMemoryBillingRepository {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl InMemoryBillingRepository {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            family_locks: DashMap::new(),
            lock_timeout,
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make the next commit fail with `PersistenceFailed` without writing anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn insert_family(&self, family: Family) {
        self.tables.write().await.families.insert(family.id, family);
    }

    pub async fn insert_student(&self, student: Student) {
        self.tables.write().await.students.push(student);
    }

    pub async fn insert_plan(&self, plan: EnrolmentPlan) {
        self.tables.write().await.plans.insert(plan.id, plan);
    }

    pub async fn insert_product(&self, product: Product) {
        self.tables.write().await.products.insert(product.id, product);
    }

    pub async fn insert_enrolment(&self, enrolment: Enrolment) {
        self.tables
            .write()
            .await
            .enrolments
            .insert(enrolment.id, enrolment);
    }

    pub async fn insert_invoice(&self, invoice: Invoice) {
        self.tables.write().await.invoices.insert(invoice.id, invoice);
    }

    pub async fn list_allocations(&self, payment_id: &PaymentId) -> Vec<Allocation> {
        self.tables
            .read()
            .await
            .allocations
            .iter()
            .filter(|allocation| &allocation.payment_id == payment_id)
            .copied()
            .collect()
    }

    fn family_lock(&self, family_id: &FamilyId) -> Arc<Mutex<()>> {
        self.family_locks
            .entry(*family_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl BillingRepository for InMemoryBillingRepository {
    async fn begin_family(&self, family_id: &FamilyId) -> Result<Box<dyn FamilySession>> {
        if !self.tables.read().await.families.contains_key(family_id) {
            return Err(BillingError::FamilyNotFound {
                id: family_id.to_string(),
            });
        }

        let lock = self.family_lock(family_id);
        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| BillingError::FamilyBusy {
                family_id: family_id.to_string(),
                seconds: self.lock_timeout.as_secs(),
            })?;
        debug!(family_id = %family_id, "Family lock acquired");

        Ok(Box::new(MemoryFamilySession {
            family_id: *family_id,
            tables: self.tables.clone(),
            fail_next_commit: self.fail_next_commit.clone(),
            _guard: guard,
        }))
    }

    async fn commit_detached(&self, changes: ChangeSet) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(BillingError::persistence(
                "commit_detached",
                "injected storage failure",
            ));
        }
        self.tables.write().await.apply(changes)
    }

    async fn get_family(&self, family_id: &FamilyId) -> Result<Option<Family>> {
        Ok(self.tables.read().await.families.get(family_id).cloned())
    }

    async fn list_students(&self, family_id: &FamilyId) -> Result<Vec<Student>> {
        Ok(self
            .tables
            .read()
            .await
            .students
            .iter()
            .filter(|student| &student.family_id == family_id)
            .cloned()
            .collect())
    }

    async fn list_enrolments(&self, family_id: &FamilyId) -> Result<Vec<Enrolment>> {
        Ok(self.tables.read().await.family_enrolments(family_id))
    }

    async fn list_invoices(&self, family_id: &FamilyId) -> Result<Vec<Invoice>> {
        Ok(self.tables.read().await.family_invoices(family_id))
    }

    async fn list_payments(&self, family_id: &FamilyId) -> Result<Vec<Payment>> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .values()
            .filter(|payment| payment.family_id.as_ref() == Some(family_id))
            .cloned()
            .collect())
    }

    async fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<Payment>> {
        Ok(self.tables.read().await.payments.get(payment_id).cloned())
    }

    async fn get_enrolment(&self, enrolment_id: &EnrolmentId) -> Result<Option<Enrolment>> {
        Ok(self.tables.read().await.enrolments.get(enrolment_id).cloned())
    }

    async fn get_invoice(&self, invoice_id: &InvoiceId) -> Result<Option<Invoice>> {
        Ok(self.tables.read().await.invoices.get(invoice_id).cloned())
    }

    async fn get_plan(&self, plan_id: &PlanId) -> Result<Option<EnrolmentPlan>> {
        Ok(self.tables.read().await.plans.get(plan_id).cloned())
    }

    async fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>> {
        Ok(self.tables.read().await.products.get(product_id).cloned())
    }
}

struct MemoryFamilySession {
    family_id: FamilyId,
    tables: Arc<RwLock<Tables>>,
    fail_next_commit: Arc<AtomicBool>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl FamilySession for MemoryFamilySession {
    fn family_id(&self) -> FamilyId {
        self.family_id
    }

    async fn invoices(&mut self) -> Result<Vec<Invoice>> {
        Ok(self.tables.read().await.family_invoices(&self.family_id))
    }

    async fn enrolments(&mut self) -> Result<Vec<Enrolment>> {
        Ok(self.tables.read().await.family_enrolments(&self.family_id))
    }

    async fn plan(&mut self, plan_id: &PlanId) -> Result<Option<EnrolmentPlan>> {
        Ok(self.tables.read().await.plans.get(plan_id).cloned())
    }

    async fn find_payment_by_key(&mut self, key: &str) -> Result<Option<PaymentRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .values()
            .find(|payment| {
                payment.family_id == Some(self.family_id)
                    && payment.idempotency_key.as_deref() == Some(key)
            })
            .map(|payment| tables.payment_record(payment)))
    }

    async fn payment_record(&mut self, payment_id: &PaymentId) -> Result<Option<PaymentRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .get(payment_id)
            .filter(|payment| payment.family_id == Some(self.family_id))
            .map(|payment| tables.payment_record(payment)))
    }

    async fn commit(self: Box<Self>, changes: ChangeSet) -> Result<()> {
        if changes.is_empty() {
            debug!(family_id = %self.family_id, "Family unit of work released with no changes");
            return Ok(());
        }
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(BillingError::persistence(
                "commit_changes",
                "injected storage failure",
            ));
        }
        self.tables.write().await.apply(changes)?;
        debug!(family_id = %self.family_id, "Family unit of work committed");
        Ok(())
    }
}
