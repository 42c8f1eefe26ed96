use crate::domain::allocation::{
    AllocationEngine, AllocationMode, AllocationPlan, EnrolmentPurchase, PaymentTarget,
    PlannedAllocation,
};
use crate::domain::enrolments::{Enrolment, EnrolmentPlan, UnitTerms};
use crate::domain::entitlements::{
    EntitlementDelta, EntitlementProjector, ProjectionContext, PurchaseBasis,
};
use crate::domain::invoices::{Invoice, InvoiceLedger};
use crate::domain::money::Money;
use crate::domain::payments::{
    Allocation, EntitlementOutcome, Payment, PaymentMetadata, PaymentReceipt, PaymentRecord,
    UndoReceipt,
};
use crate::domain::types::{
    BillingType, EnrolmentId, FamilyId, InvoiceId, InvoiceKind, InvoiceStatus, PaymentId, PlanId,
    TransactionState,
};
use crate::error::{BillingError, Result};
use crate::metrics::BillingMetrics;
use crate::storage::{BillingRepository, ChangeSet, FamilySession};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub family_id: FamilyId,
    pub amount: Money,
    pub target: PaymentTarget,
    pub idempotency_key: Option<String>,
    pub metadata: PaymentMetadata,
}

/// Several enrolment purchases settled by one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayAheadRequest {
    pub family_id: FamilyId,
    pub items: Vec<EnrolmentPurchase>,
    pub idempotency_key: Option<String>,
    pub metadata: PaymentMetadata,
}

/// What a payment would do if committed now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPreview {
    pub amount: Money,
    pub lines: Vec<PlannedAllocation>,
    pub unallocated: Money,
    pub entitlements: Vec<EntitlementOutcome>,
}

#[async_trait]
pub trait PaymentOperations: Send + Sync {
    async fn submit_payment(
        &self,
        request: PaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt>;
    async fn pay_ahead_and_pay(
        &self,
        request: PayAheadRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt>;
    async fn undo_payment(&self, payment_id: &PaymentId, now: DateTime<Utc>)
        -> Result<UndoReceipt>;
    async fn preview(
        &self,
        family_id: &FamilyId,
        amount: Money,
        target: &PaymentTarget,
        now: DateTime<Utc>,
    ) -> Result<PaymentPreview>;
    /// Record a new invoice and pay it in full in the same atomic write.
    async fn settle_new_invoice(
        &self,
        invoice: Invoice,
        metadata: PaymentMetadata,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt>;
}

/// Runs payments and undos as validate, allocate, project, persist.
pub struct PaymentCoordinator {
    repository: Arc<dyn BillingRepository + Send + Sync>,
    metrics: BillingMetrics,
}

impl PaymentCoordinator {
    pub fn new(repository: Arc<dyn BillingRepository + Send + Sync>) -> Self {
        Self {
            repository,
            metrics: BillingMetrics::default(),
        }
    }

    async fn commit_payment(
        &self,
        family_id: FamilyId,
        idempotency_key: Option<String>,
        metadata: PaymentMetadata,
        now: DateTime<Utc>,
        work: PaymentWork,
    ) -> Result<PaymentReceipt> {
        let started = Instant::now();
        let mut tx = Transaction::new("submit_payment", family_id);

        let mut session = self.repository.begin_family(&family_id).await?;

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(prior) = session.find_payment_by_key(key).await? {
                warn!(
                    family_id = %family_id,
                    payment_id = %prior.payment.id,
                    idempotency_key = key,
                    "Duplicate payment submission, returning prior result"
                );
                self.metrics.record_duplicate();
                return Ok(PaymentReceipt::from_record(&prior, true));
            }
        }

        let plan_ids = work.plan_ids();
        let snapshot = FamilySnapshot::from_session(session.as_mut(), &plan_ids, now).await?;
        let payment_id = PaymentId::new();

        let prepared = match work.prepare(&snapshot, payment_id, &mut tx, now) {
            Ok(prepared) => prepared,
            Err(e) => {
                tx.fail(&e);
                return Err(e);
            }
        };

        let mut payment = Payment::new(
            Some(family_id),
            prepared.amount,
            &metadata,
            idempotency_key,
            now,
        )
        .with_id(payment_id);
        payment.unallocated = prepared.plan.unallocated;

        tx.advance(TransactionState::Persisting);
        let record = PaymentRecord {
            payment: payment.clone(),
            allocations: prepared.allocations.clone(),
            deltas: prepared.deltas.clone(),
        };
        let changes = ChangeSet {
            new_payment: Some(payment),
            new_allocations: prepared.allocations,
            new_invoices: prepared.new_invoices,
            invoice_updates: prepared.invoice_updates,
            enrolment_updates: prepared.enrolment_updates,
            new_deltas: prepared.deltas,
            ..ChangeSet::default()
        };

        if let Err(e) = session.commit(changes).await {
            error!(
                family_id = %family_id,
                payment_id = %payment_id,
                error = %e,
                "Failed to persist payment"
            );
            tx.fail(&e);
            return Err(e);
        }
        tx.advance(TransactionState::Committed);

        info!(
            family_id = %family_id,
            payment_id = %payment_id,
            amount = %record.payment.amount,
            unallocated = %record.payment.unallocated,
            allocations = record.allocations.len(),
            entitlements = record.deltas.len(),
            "Payment committed"
        );
        self.metrics
            .record_commit(record.payment.unallocated, started.elapsed());

        Ok(PaymentReceipt::from_record(&record, false))
    }

    /// Count a failed payment-side operation under its error code.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_failure(e.error_code());
        }
        result
    }

    async fn submit(&self, request: PaymentRequest, now: DateTime<Utc>) -> Result<PaymentReceipt> {
        if !request.amount.is_positive() {
            return Err(BillingError::invalid_amount(format!(
                "payment amount must be positive, got {}",
                request.amount
            )));
        }

        let work = match request.target {
            PaymentTarget::InvoiceAllocation { mode } => PaymentWork::Invoices {
                amount: request.amount,
                mode,
            },
            PaymentTarget::EnrolmentPurchase(purchase) => PaymentWork::Purchases {
                amount: Some(request.amount),
                items: vec![purchase],
            },
        };

        self.commit_payment(
            request.family_id,
            request.idempotency_key,
            request.metadata,
            now,
            work,
        )
        .await
    }

    async fn pay_ahead(
        &self,
        request: PayAheadRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt> {
        let work = PaymentWork::Purchases {
            amount: None,
            items: request.items,
        };
        work.validate_items()?;

        self.commit_payment(
            request.family_id,
            request.idempotency_key,
            request.metadata,
            now,
            work,
        )
        .await
    }

    async fn undo(&self, payment_id: &PaymentId, now: DateTime<Utc>) -> Result<UndoReceipt> {
        let payment = self
            .repository
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound {
                id: payment_id.to_string(),
            })?;
        let family_id = payment.family_id.ok_or_else(|| {
            BillingError::validation(
                "payment_id",
                format!("walk-in payment {} has no family ledger to reverse", payment_id),
            )
        })?;

        let mut tx = Transaction::new("undo_payment", family_id);
        let mut session = self.repository.begin_family(&family_id).await?;

        // Re-read under the lock; a concurrent undo may have won.
        let record = session
            .payment_record(payment_id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound {
                id: payment_id.to_string(),
            })?;
        if record.payment.undone {
            let err = BillingError::AlreadyUndone {
                id: payment_id.to_string(),
            };
            tx.fail(&err);
            return Err(err);
        }

        tx.advance(TransactionState::Allocating);
        let mut invoices: HashMap<InvoiceId, Invoice> = session
            .invoices()
            .await?
            .into_iter()
            .map(|invoice| (invoice.id, invoice))
            .collect();
        let mut touched = Vec::new();
        for allocation in &record.allocations {
            let invoice = invoices.get(&allocation.invoice_id).ok_or_else(|| {
                BillingError::InvoiceNotFound {
                    id: allocation.invoice_id.to_string(),
                }
            })?;
            let reversed = InvoiceLedger::reverse_amount(invoice, allocation.amount, now);
            invoices.insert(reversed.id, reversed);
            if !touched.contains(&allocation.invoice_id) {
                touched.push(allocation.invoice_id);
            }
        }

        let mut cancelled_invoices = Vec::new();
        for invoice in invoices.values_mut() {
            if invoice.created_by_payment == Some(*payment_id) && !invoice.is_cancelled() {
                invoice.cancel(now)?;
                cancelled_invoices.push(invoice.id);
                if !touched.contains(&invoice.id) {
                    touched.push(invoice.id);
                }
            }
        }

        tx.advance(TransactionState::Projecting);
        let mut enrolments: HashMap<EnrolmentId, Enrolment> = session
            .enrolments()
            .await?
            .into_iter()
            .map(|enrolment| (enrolment.id, enrolment))
            .collect();
        let mut restored = Vec::new();
        for delta in &record.deltas {
            let enrolment = enrolments.get_mut(&delta.enrolment_id).ok_or_else(|| {
                BillingError::EnrolmentNotFound {
                    id: delta.enrolment_id.to_string(),
                }
            })?;
            delta.restore(enrolment);
            restored.push(delta.enrolment_id);
        }

        tx.advance(TransactionState::Persisting);
        let mut payment = record.payment.clone();
        payment.mark_undone(now);
        let changes = ChangeSet {
            payment_updates: vec![payment],
            invoice_updates: touched
                .iter()
                .filter_map(|id| invoices.get(id).cloned())
                .collect(),
            enrolment_updates: restored
                .iter()
                .filter_map(|id| enrolments.get(id).cloned())
                .collect(),
            ..ChangeSet::default()
        };

        if let Err(e) = session.commit(changes).await {
            error!(
                family_id = %family_id,
                payment_id = %payment_id,
                error = %e,
                "Failed to persist undo"
            );
            tx.fail(&e);
            return Err(e);
        }
        tx.advance(TransactionState::Committed);

        info!(
            family_id = %family_id,
            payment_id = %payment_id,
            allocations = record.allocations.len(),
            enrolments = restored.len(),
            "Payment undone"
        );
        self.metrics.record_undo();

        Ok(UndoReceipt {
            payment_id: *payment_id,
            reversed_allocations: record.allocations.len(),
            restored_enrolments: restored,
            cancelled_invoices,
        })
    }

    async fn settle(
        &self,
        invoice: Invoice,
        metadata: PaymentMetadata,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt> {
        let started = Instant::now();
        let amount = invoice.amount;
        let mut payment = Payment::new(invoice.family_id, amount, &metadata, None, now);

        let (applied, paid_invoice) = InvoiceLedger::apply_amount(&invoice, amount, now);
        let allocation = Allocation::new(payment.id, invoice.id, applied, now);
        payment.unallocated = amount.saturating_sub(applied);

        let record = PaymentRecord {
            payment: payment.clone(),
            allocations: vec![allocation],
            deltas: Vec::new(),
        };
        let changes = ChangeSet {
            new_payment: Some(payment),
            new_allocations: vec![allocation],
            new_invoices: vec![paid_invoice],
            ..ChangeSet::default()
        };

        let result = match invoice.family_id {
            Some(family_id) => {
                let session = self.repository.begin_family(&family_id).await?;
                session.commit(changes).await
            }
            None => self.repository.commit_detached(changes).await,
        };
        if let Err(e) = result {
            error!(invoice_id = %invoice.id, error = %e, "Failed to persist settled invoice");
            return Err(e);
        }

        info!(
            invoice_id = %invoice.id,
            payment_id = %record.payment.id,
            amount = %amount,
            "Invoice settled at the counter"
        );
        self.metrics
            .record_commit(record.payment.unallocated, started.elapsed());

        Ok(PaymentReceipt::from_record(&record, false))
    }
}

#[async_trait]
impl PaymentOperations for PaymentCoordinator {
    async fn submit_payment(
        &self,
        request: PaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt> {
        self.observe(self.submit(request, now).await)
    }

    async fn pay_ahead_and_pay(
        &self,
        request: PayAheadRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt> {
        self.observe(self.pay_ahead(request, now).await)
    }

    async fn undo_payment(
        &self,
        payment_id: &PaymentId,
        now: DateTime<Utc>,
    ) -> Result<UndoReceipt> {
        self.observe(self.undo(payment_id, now).await)
    }

    async fn preview(
        &self,
        family_id: &FamilyId,
        amount: Money,
        target: &PaymentTarget,
        now: DateTime<Utc>,
    ) -> Result<PaymentPreview> {
        let work = match target {
            PaymentTarget::InvoiceAllocation { mode } => PaymentWork::Invoices {
                amount,
                mode: mode.clone(),
            },
            PaymentTarget::EnrolmentPurchase(purchase) => PaymentWork::Purchases {
                amount: Some(amount),
                items: vec![*purchase],
            },
        };

        let snapshot = FamilySnapshot::from_repository(
            self.repository.as_ref(),
            family_id,
            &work.plan_ids(),
            now,
        )
        .await?;
        let mut tx = Transaction::new("preview", *family_id);
        let prepared = work.prepare(&snapshot, PaymentId::new(), &mut tx, now)?;

        Ok(PaymentPreview {
            amount: prepared.amount,
            lines: prepared.plan.lines,
            unallocated: prepared.plan.unallocated,
            entitlements: prepared
                .deltas
                .iter()
                .map(EntitlementOutcome::from)
                .collect(),
        })
    }

    async fn settle_new_invoice(
        &self,
        invoice: Invoice,
        metadata: PaymentMetadata,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt> {
        self.observe(self.settle(invoice, metadata, now).await)
    }
}

/// State walk of one coordinator run, logged at each step.
struct Transaction {
    operation: &'static str,
    family_id: FamilyId,
    state: TransactionState,
}

impl Transaction {
    fn new(operation: &'static str, family_id: FamilyId) -> Self {
        Self {
            operation,
            family_id,
            state: TransactionState::Validating,
        }
    }

    fn advance(&mut self, next: TransactionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(
            operation = self.operation,
            family_id = %self.family_id,
            from = %self.state,
            to = %next,
            "Transaction state change"
        );
        self.state = next;
    }

    fn fail(&mut self, err: &BillingError) {
        if self.state.is_terminal() {
            return;
        }
        debug!(
            operation = self.operation,
            family_id = %self.family_id,
            state = %self.state,
            code = err.error_code(),
            "Transaction failed"
        );
        self.state = TransactionState::Failed;
    }
}

/// Family rows read at the start of a unit of work.
struct FamilySnapshot {
    family_id: FamilyId,
    invoices: Vec<Invoice>,
    enrolments: Vec<Enrolment>,
    plans: HashMap<PlanId, EnrolmentPlan>,
    now: DateTime<Utc>,
}

impl FamilySnapshot {
    async fn from_session(
        session: &mut dyn FamilySession,
        plan_ids: &[PlanId],
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut plans = HashMap::new();
        for plan_id in plan_ids {
            if let Some(plan) = session.plan(plan_id).await? {
                plans.insert(*plan_id, plan);
            }
        }
        Ok(Self {
            family_id: session.family_id(),
            invoices: session.invoices().await?,
            enrolments: session.enrolments().await?,
            plans,
            now,
        })
    }

    async fn from_repository(
        repository: &(dyn BillingRepository + Send + Sync),
        family_id: &FamilyId,
        plan_ids: &[PlanId],
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if repository.get_family(family_id).await?.is_none() {
            return Err(BillingError::FamilyNotFound {
                id: family_id.to_string(),
            });
        }
        let mut plans = HashMap::new();
        for plan_id in plan_ids {
            if let Some(plan) = repository.get_plan(plan_id).await? {
                plans.insert(*plan_id, plan);
            }
        }
        Ok(Self {
            family_id: *family_id,
            invoices: repository.list_invoices(family_id).await?,
            enrolments: repository.list_enrolments(family_id).await?,
            plans,
            now,
        })
    }

    fn ledger(&self) -> InvoiceLedger {
        InvoiceLedger::new(self.family_id, self.invoices.clone(), self.now)
    }

    fn enrolment(&self, enrolment_id: &EnrolmentId) -> Result<&Enrolment> {
        self.enrolments
            .iter()
            .find(|enrolment| &enrolment.id == enrolment_id)
            .ok_or_else(|| BillingError::EnrolmentNotFound {
                id: enrolment_id.to_string(),
            })
    }

    fn terms_for(&self, purchase: &EnrolmentPurchase) -> Result<(&Enrolment, UnitTerms)> {
        let enrolment = self.enrolment(&purchase.enrolment_id)?;
        let terms = match purchase.plan_id {
            Some(plan_id) => {
                let plan = self
                    .plans
                    .get(&plan_id)
                    .ok_or_else(|| BillingError::PlanNotFound {
                        id: plan_id.to_string(),
                    })?;
                enrolment.unit_terms_for_plan(plan)?
            }
            None => enrolment.unit_terms()?,
        };
        Ok((enrolment, terms))
    }

    /// Latest coverage of the enrolment's PAID invoices, ignoring `excluded` ones.
    /// Unpaid invoices never move the anchor.
    fn latest_paid_coverage_end(
        &self,
        enrolment_id: &EnrolmentId,
        excluded: &HashSet<InvoiceId>,
    ) -> Option<NaiveDate> {
        self.invoices
            .iter()
            .filter(|invoice| invoice.enrolment_id.as_ref() == Some(enrolment_id))
            .filter(|invoice| invoice.status == InvoiceStatus::Paid)
            .filter(|invoice| !excluded.contains(&invoice.id))
            .filter_map(|invoice| invoice.coverage_end)
            .max()
    }
}

/// In-memory result of the allocate and project steps.
struct PreparedPayment {
    amount: Money,
    plan: AllocationPlan,
    allocations: Vec<Allocation>,
    invoice_updates: Vec<Invoice>,
    new_invoices: Vec<Invoice>,
    enrolment_updates: Vec<Enrolment>,
    deltas: Vec<EntitlementDelta>,
}

enum PaymentWork {
    Invoices {
        amount: Money,
        mode: AllocationMode,
    },
    /// `amount` is the caller's figure for a single purchase; batches price themselves.
    Purchases {
        amount: Option<Money>,
        items: Vec<EnrolmentPurchase>,
    },
}

impl PaymentWork {
    fn plan_ids(&self) -> Vec<PlanId> {
        match self {
            PaymentWork::Invoices { .. } => Vec::new(),
            PaymentWork::Purchases { items, .. } => {
                items.iter().filter_map(|item| item.plan_id).collect()
            }
        }
    }

    fn validate_items(&self) -> Result<()> {
        let PaymentWork::Purchases { items, .. } = self else {
            return Ok(());
        };
        if items.is_empty() {
            return Err(BillingError::validation(
                "items",
                "at least one enrolment purchase is required",
            ));
        }
        let mut seen = HashSet::new();
        for item in items {
            if item.quantity == 0 {
                return Err(BillingError::validation(
                    "quantity",
                    format!("quantity for enrolment {} must be at least 1", item.enrolment_id),
                ));
            }
            if !seen.insert(item.enrolment_id) {
                return Err(BillingError::validation(
                    "items",
                    format!("enrolment {} appears more than once", item.enrolment_id),
                ));
            }
        }
        Ok(())
    }

    fn prepare(
        &self,
        snapshot: &FamilySnapshot,
        payment_id: PaymentId,
        tx: &mut Transaction,
        now: DateTime<Utc>,
    ) -> Result<PreparedPayment> {
        self.validate_items()?;
        tx.advance(TransactionState::Allocating);
        match self {
            PaymentWork::Invoices { amount, mode } => {
                prepare_invoices(snapshot, payment_id, *amount, mode, tx, now)
            }
            PaymentWork::Purchases { amount, items } => {
                prepare_purchases(snapshot, payment_id, *amount, items, tx, now)
            }
        }
    }
}

fn prepare_invoices(
    snapshot: &FamilySnapshot,
    payment_id: PaymentId,
    amount: Money,
    mode: &AllocationMode,
    tx: &mut Transaction,
    now: DateTime<Utc>,
) -> Result<PreparedPayment> {
    let ledger = snapshot.ledger();
    let plan = AllocationEngine::plan_invoices(amount, mode, &ledger)?;
    debug!(
        family_id = %snapshot.family_id,
        lines = plan.lines.len(),
        unallocated = %plan.unallocated,
        "Allocation planned"
    );

    let mut allocations = Vec::with_capacity(plan.lines.len());
    let mut invoice_updates = Vec::with_capacity(plan.lines.len());
    let mut per_enrolment: BTreeMap<EnrolmentId, Money> = BTreeMap::new();
    let mut paid_now = HashSet::new();

    for line in &plan.lines {
        let invoice = ledger
            .get(&line.invoice_id)
            .ok_or_else(|| BillingError::InvoiceNotFound {
                id: line.invoice_id.to_string(),
            })?;
        let (applied, updated) = InvoiceLedger::apply_amount(invoice, line.amount, now);
        if applied != line.amount {
            return Err(BillingError::AllocationExceedsBalance {
                invoice_id: invoice.id,
                requested: line.amount,
                balance: invoice.balance(),
            });
        }

        if let (InvoiceKind::Enrolment, Some(enrolment_id)) = (invoice.kind, invoice.enrolment_id)
        {
            let total = per_enrolment.entry(enrolment_id).or_insert(Money::ZERO);
            *total = total.add(applied)?;
        }
        paid_now.insert(invoice.id);
        allocations.push(Allocation::new(payment_id, invoice.id, applied, now));
        invoice_updates.push(updated);
    }

    tx.advance(TransactionState::Projecting);
    let mut enrolment_updates = Vec::new();
    let mut deltas = Vec::new();
    for (enrolment_id, applied) in per_enrolment {
        let enrolment = snapshot.enrolment(&enrolment_id)?;
        let terms = enrolment.unit_terms()?;
        let context = ProjectionContext {
            today: now.date_naive(),
            latest_coverage_end: snapshot.latest_paid_coverage_end(&enrolment_id, &paid_now),
        };
        let projection = EntitlementProjector::project(
            enrolment,
            &terms,
            PurchaseBasis::AppliedAmount(applied),
            &context,
        )?;
        enrolment_updates.push(projection.enrolment);
        deltas.push(projection.delta);
    }

    Ok(PreparedPayment {
        amount,
        plan,
        allocations,
        invoice_updates,
        new_invoices: Vec::new(),
        enrolment_updates,
        deltas,
    })
}

fn prepare_purchases(
    snapshot: &FamilySnapshot,
    payment_id: PaymentId,
    amount: Option<Money>,
    items: &[EnrolmentPurchase],
    tx: &mut Transaction,
    now: DateTime<Utc>,
) -> Result<PreparedPayment> {
    let mut priced = Vec::with_capacity(items.len());
    for item in items {
        let (enrolment, terms) = snapshot.terms_for(item)?;
        let item_amount = match amount {
            Some(amount) => {
                AllocationEngine::plan_purchase(amount, terms.unit_price, item.quantity)?;
                amount
            }
            None => terms.unit_price.multiply(item.quantity)?,
        };
        priced.push((item, enrolment, terms, item_amount));
    }
    let total = Money::sum(priced.iter().map(|(_, _, _, item_amount)| *item_amount))?;

    tx.advance(TransactionState::Projecting);
    let mut allocations = Vec::with_capacity(priced.len());
    let mut new_invoices = Vec::with_capacity(priced.len());
    let mut enrolment_updates = Vec::with_capacity(priced.len());
    let mut deltas = Vec::with_capacity(priced.len());

    for (item, enrolment, terms, item_amount) in priced {
        let context = ProjectionContext {
            today: now.date_naive(),
            latest_coverage_end: snapshot.latest_paid_coverage_end(&enrolment.id, &HashSet::new()),
        };
        let projection = EntitlementProjector::project(
            enrolment,
            &terms,
            PurchaseBasis::Quantity(item.quantity),
            &context,
        )?;
        if projection.delta.applied_units == 0 {
            return Err(BillingError::validation(
                "quantity",
                format!(
                    "enrolment {} has no billable weeks left before its end date",
                    enrolment.id
                ),
            ));
        }

        let mut invoice = Invoice::new(
            Some(snapshot.family_id),
            InvoiceKind::PayAhead,
            item_amount,
            now,
        )?
        .for_enrolment(enrolment.id)
        .created_by(payment_id)
        .with_description(format!(
            "Pay-ahead: {} x {}",
            item.quantity, terms.unit_price
        ));
        if terms.billing_type == BillingType::PerWeek {
            if let Some(window) =
                EntitlementProjector::coverage_window(enrolment, &terms, item.quantity, &context)?
            {
                invoice = invoice.with_coverage(window.start, window.end);
            }
        }

        let (applied, paid) = InvoiceLedger::apply_amount(&invoice, item_amount, now);
        allocations.push(Allocation::new(payment_id, paid.id, applied, now));
        new_invoices.push(paid);
        enrolment_updates.push(projection.enrolment);
        deltas.push(projection.delta);
    }

    Ok(PreparedPayment {
        amount: total,
        plan: AllocationPlan {
            lines: Vec::new(),
            unallocated: Money::ZERO,
        },
        allocations,
        invoice_updates: Vec::new(),
        new_invoices,
        enrolment_updates,
        deltas,
    })
}
