#![allow(dead_code)]

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use swimdesk_billing::domain::{
    Enrolment, EnrolmentPlan, Family, Invoice, InvoiceKind, InvoiceManager, Money,
    PaymentCoordinator, PaymentOperations, Product, Student,
};
use swimdesk_billing::storage::{BillingRepository, InMemoryBillingRepository};

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 12, 20, 10, 0, 0).unwrap()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn cents(value: i64) -> Money {
    Money::from_cents(value)
}

/// One seeded family over an in-memory repository.
pub struct Fixture {
    pub repo: Arc<InMemoryBillingRepository>,
    pub coordinator: Arc<PaymentCoordinator>,
    pub invoices: InvoiceManager,
    pub family: Family,
    pub student: Student,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_repository(InMemoryBillingRepository::default()).await
    }

    pub async fn with_repository(repo: InMemoryBillingRepository) -> Self {
        let repo = Arc::new(repo);
        let family = Family::new("Okafor");
        let student = Student::new(family.id, "Ada", "Okafor");
        repo.insert_family(family.clone()).await;
        repo.insert_student(student.clone()).await;

        let dyn_repo: Arc<dyn BillingRepository + Send + Sync> = repo.clone();
        let coordinator = Arc::new(PaymentCoordinator::new(dyn_repo.clone()));
        let payments: Arc<dyn PaymentOperations> = coordinator.clone();
        let invoices = InvoiceManager::new(dyn_repo, payments, 14);

        Self {
            repo,
            coordinator,
            invoices,
            family,
            student,
        }
    }

    /// Manual invoice issued `age_days` before [`now`], due a week after issue.
    pub async fn add_invoice(&self, amount_cents: i64, age_days: i64) -> Invoice {
        let issued_at = now() - Duration::days(age_days);
        let invoice = Invoice::new(
            Some(self.family.id),
            InvoiceKind::Manual,
            cents(amount_cents),
            issued_at,
        )
        .unwrap()
        .with_due_at(issued_at + Duration::days(30));
        self.repo.insert_invoice(invoice.clone()).await;
        invoice
    }

    pub async fn add_per_class(&self, price_cents: i64, block: u32, credits: u32) -> Enrolment {
        let plan = EnrolmentPlan::per_class("Squad 10-pack", cents(price_cents), block);
        self.repo.insert_plan(plan.clone()).await;
        let mut enrolment =
            Enrolment::from_plan(self.family.id, self.student.id, &plan, date(2023, 9, 1));
        enrolment.credits_remaining = credits;
        self.repo.insert_enrolment(enrolment.clone()).await;
        enrolment
    }

    pub async fn add_per_week(
        &self,
        price_cents: i64,
        weeks: u32,
        paid_through: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Enrolment {
        let plan = EnrolmentPlan::per_week("Term lessons", cents(price_cents), weeks);
        self.repo.insert_plan(plan.clone()).await;
        let mut enrolment =
            Enrolment::from_plan(self.family.id, self.student.id, &plan, date(2023, 9, 1));
        enrolment.paid_through_date = paid_through;
        enrolment.end_date = end_date;
        self.repo.insert_enrolment(enrolment.clone()).await;
        enrolment
    }

    pub async fn add_product(&self, name: &str, price_cents: i64, active: bool) -> Product {
        let mut product = Product::new(name, cents(price_cents));
        product.active = active;
        self.repo.insert_product(product.clone()).await;
        product
    }

    pub async fn invoice(&self, invoice: &Invoice) -> Invoice {
        self.repo.get_invoice(&invoice.id).await.unwrap().unwrap()
    }

    pub async fn enrolment(&self, enrolment: &Enrolment) -> Enrolment {
        self.repo.get_enrolment(&enrolment.id).await.unwrap().unwrap()
    }
}
