use crate::domain::catalog::Product;
use crate::domain::enrolments::{Enrolment, EnrolmentPlan};
use crate::domain::entitlements::{EntitlementChange, EntitlementDelta};
use crate::domain::families::{Family, Student};
use crate::domain::invoices::{Invoice, InvoiceLineItem};
use crate::domain::money::Money;
use crate::domain::payments::{Allocation, Payment};
use crate::domain::types::{
    AllocationId, EnrolmentId, FamilyId, InvoiceId, PaymentId, PlanId, ProductId, StudentId,
};
use crate::error::{BillingError, Result};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

pub(super) const FAMILY_COLUMNS: &str = "family_id, name";

pub(super) const STUDENT_COLUMNS: &str = "student_id, family_id, first_name, last_name";

pub(super) const PLAN_COLUMNS: &str = "plan_id, name, billing_type, price_cents, duration_weeks, \
     block_class_count, sessions_per_week, active";

pub(super) const PRODUCT_COLUMNS: &str = "product_id, name, price_cents, active";

pub(super) const ENROLMENT_COLUMNS: &str = "enrolment_id, family_id, student_id, billing_type, \
     plan_id, plan_price_cents, duration_weeks, block_class_count, credits_remaining, \
     paid_through_date, start_date, end_date, status";

pub(super) const INVOICE_COLUMNS: &str = "invoice_id, family_id, enrolment_id, kind, \
     amount_cents, amount_paid_cents, status, due_at, issued_at, coverage_start, coverage_end, \
     description, line_items, created_by_payment_id, cancelled_at";

pub(super) const PAYMENT_COLUMNS: &str = "payment_id, family_id, amount_cents, method, note, \
     paid_at, idempotency_key, unallocated_cents, undone, undone_at, created_at";

pub(super) const ALLOCATION_COLUMNS: &str =
    "allocation_id, payment_id, invoice_id, amount_cents, created_at";

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| BillingError::database(format!("read column {}", name), e))
}

fn parsed<T>(row: &PgRow, name: &str) -> Result<T>
where
    T: FromStr<Err = BillingError>,
{
    let raw: String = column(row, name)?;
    raw.parse()
}

fn count(row: &PgRow, name: &str) -> Result<u32> {
    let raw: i32 = column(row, name)?;
    u32::try_from(raw).map_err(|e| BillingError::database(format!("read column {}", name), e))
}

fn optional_count(row: &PgRow, name: &str) -> Result<Option<u32>> {
    let raw: Option<i32> = column(row, name)?;
    raw.map(|value| {
        u32::try_from(value).map_err(|e| BillingError::database(format!("read column {}", name), e))
    })
    .transpose()
}

pub(super) fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(super) fn family_from_row(row: &PgRow) -> Result<Family> {
    Ok(Family {
        id: FamilyId::from_uuid(column(row, "family_id")?),
        name: column(row, "name")?,
    })
}

pub(super) fn student_from_row(row: &PgRow) -> Result<Student> {
    Ok(Student {
        id: StudentId::from_uuid(column(row, "student_id")?),
        family_id: FamilyId::from_uuid(column(row, "family_id")?),
        first_name: column(row, "first_name")?,
        last_name: column(row, "last_name")?,
    })
}

pub(super) fn plan_from_row(row: &PgRow) -> Result<EnrolmentPlan> {
    Ok(EnrolmentPlan {
        id: PlanId::from_uuid(column(row, "plan_id")?),
        name: column(row, "name")?,
        billing_type: parsed(row, "billing_type")?,
        price: Money::from_cents(column(row, "price_cents")?),
        duration_weeks: optional_count(row, "duration_weeks")?,
        block_class_count: optional_count(row, "block_class_count")?,
        sessions_per_week: optional_count(row, "sessions_per_week")?,
        active: column(row, "active")?,
    })
}

pub(super) fn product_from_row(row: &PgRow) -> Result<Product> {
    Ok(Product {
        id: ProductId::from_uuid(column(row, "product_id")?),
        name: column(row, "name")?,
        price: Money::from_cents(column(row, "price_cents")?),
        active: column(row, "active")?,
    })
}

pub(super) fn enrolment_from_row(row: &PgRow) -> Result<Enrolment> {
    let plan_id: Option<Uuid> = column(row, "plan_id")?;
    Ok(Enrolment {
        id: EnrolmentId::from_uuid(column(row, "enrolment_id")?),
        family_id: FamilyId::from_uuid(column(row, "family_id")?),
        student_id: StudentId::from_uuid(column(row, "student_id")?),
        billing_type: parsed(row, "billing_type")?,
        plan_id: plan_id.map(PlanId::from_uuid),
        plan_price: Money::from_cents(column(row, "plan_price_cents")?),
        duration_weeks: optional_count(row, "duration_weeks")?,
        block_class_count: optional_count(row, "block_class_count")?,
        credits_remaining: count(row, "credits_remaining")?,
        paid_through_date: column(row, "paid_through_date")?,
        start_date: column(row, "start_date")?,
        end_date: column(row, "end_date")?,
        status: parsed(row, "status")?,
    })
}

pub(super) fn invoice_from_row(row: &PgRow) -> Result<Invoice> {
    let family_id: Option<Uuid> = column(row, "family_id")?;
    let enrolment_id: Option<Uuid> = column(row, "enrolment_id")?;
    let created_by: Option<Uuid> = column(row, "created_by_payment_id")?;
    let line_items: serde_json::Value = column(row, "line_items")?;
    let line_items: Vec<InvoiceLineItem> = serde_json::from_value(line_items)
        .map_err(|e| BillingError::database("decode invoice line items", e))?;

    Ok(Invoice {
        id: InvoiceId::from_uuid(column(row, "invoice_id")?),
        family_id: family_id.map(FamilyId::from_uuid),
        enrolment_id: enrolment_id.map(EnrolmentId::from_uuid),
        kind: parsed(row, "kind")?,
        amount: Money::from_cents(column(row, "amount_cents")?),
        amount_paid: Money::from_cents(column(row, "amount_paid_cents")?),
        status: parsed(row, "status")?,
        due_at: column(row, "due_at")?,
        issued_at: column(row, "issued_at")?,
        coverage_start: column(row, "coverage_start")?,
        coverage_end: column(row, "coverage_end")?,
        description: column(row, "description")?,
        line_items,
        created_by_payment: created_by.map(PaymentId::from_uuid),
        cancelled_at: column(row, "cancelled_at")?,
    })
}

pub(super) fn payment_from_row(row: &PgRow) -> Result<Payment> {
    let family_id: Option<Uuid> = column(row, "family_id")?;
    Ok(Payment {
        id: PaymentId::from_uuid(column(row, "payment_id")?),
        family_id: family_id.map(FamilyId::from_uuid),
        amount: Money::from_cents(column(row, "amount_cents")?),
        method: parsed(row, "method")?,
        note: column(row, "note")?,
        paid_at: column(row, "paid_at")?,
        idempotency_key: column(row, "idempotency_key")?,
        unallocated: Money::from_cents(column(row, "unallocated_cents")?),
        undone: column(row, "undone")?,
        undone_at: column(row, "undone_at")?,
        created_at: column(row, "created_at")?,
    })
}

pub(super) fn allocation_from_row(row: &PgRow) -> Result<Allocation> {
    Ok(Allocation {
        id: AllocationId::from_uuid(column(row, "allocation_id")?),
        payment_id: PaymentId::from_uuid(column(row, "payment_id")?),
        invoice_id: InvoiceId::from_uuid(column(row, "invoice_id")?),
        amount: Money::from_cents(column(row, "amount_cents")?),
        created_at: column(row, "created_at")?,
    })
}

pub(super) fn delta_from_row(row: &PgRow) -> Result<EntitlementDelta> {
    let change: serde_json::Value = column(row, "change")?;
    let change: EntitlementChange = serde_json::from_value(change)
        .map_err(|e| BillingError::database("decode entitlement change", e))?;
    Ok(EntitlementDelta {
        enrolment_id: EnrolmentId::from_uuid(column(row, "enrolment_id")?),
        change,
        requested_units: count(row, "requested_units")?,
        applied_units: count(row, "applied_units")?,
    })
}
