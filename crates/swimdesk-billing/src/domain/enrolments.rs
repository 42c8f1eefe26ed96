use crate::domain::money::Money;
use crate::domain::types::{BillingType, EnrolmentId, EnrolmentStatus, FamilyId, PlanId, StudentId};
use crate::error::{BillingError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A price tier in the class catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolmentPlan {
    pub id: PlanId,
    pub name: String,
    pub billing_type: BillingType,
    pub price: Money,
    /// Weeks covered by one unit (PER_WEEK)
    pub duration_weeks: Option<u32>,
    /// Classes granted by one unit (PER_CLASS)
    pub block_class_count: Option<u32>,
    pub sessions_per_week: Option<u32>,
    pub active: bool,
}

impl EnrolmentPlan {
    pub fn per_class(name: impl Into<String>, price: Money, block_class_count: u32) -> Self {
        Self {
            id: PlanId::new(),
            name: name.into(),
            billing_type: BillingType::PerClass,
            price,
            duration_weeks: None,
            block_class_count: Some(block_class_count),
            sessions_per_week: None,
            active: true,
        }
    }

    pub fn per_week(name: impl Into<String>, price: Money, duration_weeks: u32) -> Self {
        Self {
            id: PlanId::new(),
            name: name.into(),
            billing_type: BillingType::PerWeek,
            price,
            duration_weeks: Some(duration_weeks),
            block_class_count: None,
            sessions_per_week: Some(1),
            active: true,
        }
    }
}

/// A student's subscription to a class plan.
///
/// `credits_remaining` and `paid_through_date` are entitlement counters: only the
/// projector changes them, and undo restores them from recorded deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrolment {
    pub id: EnrolmentId,
    pub family_id: FamilyId,
    pub student_id: StudentId,
    pub billing_type: BillingType,
    pub plan_id: Option<PlanId>,
    pub plan_price: Money,
    pub duration_weeks: Option<u32>,
    pub block_class_count: Option<u32>,
    pub credits_remaining: u32,
    pub paid_through_date: Option<NaiveDate>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status: EnrolmentStatus,
}

impl Enrolment {
    /// Enrolment priced from `plan`, starting on `start_date`.
    pub fn from_plan(
        family_id: FamilyId,
        student_id: StudentId,
        plan: &EnrolmentPlan,
        start_date: NaiveDate,
    ) -> Self {
        Self {
            id: EnrolmentId::new(),
            family_id,
            student_id,
            billing_type: plan.billing_type,
            plan_id: Some(plan.id),
            plan_price: plan.price,
            duration_weeks: plan.duration_weeks,
            block_class_count: plan.block_class_count,
            credits_remaining: 0,
            paid_through_date: None,
            start_date,
            end_date: None,
            status: EnrolmentStatus::Active,
        }
    }

    pub fn with_end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    /// Pricing terms recorded on the enrolment itself.
    pub fn unit_terms(&self) -> Result<UnitTerms> {
        UnitTerms::resolve(
            self.billing_type,
            self.plan_price,
            self.duration_weeks,
            self.block_class_count,
        )
    }

    /// Pricing terms of another tier the enrolment may be paid ahead on.
    pub fn unit_terms_for_plan(&self, plan: &EnrolmentPlan) -> Result<UnitTerms> {
        if plan.billing_type != self.billing_type {
            return Err(BillingError::validation(
                "plan_id",
                format!(
                    "plan {} is {} but enrolment {} is {}",
                    plan.id, plan.billing_type, self.id, self.billing_type
                ),
            ));
        }
        if !plan.active {
            return Err(BillingError::validation(
                "plan_id",
                format!("plan {} is not active", plan.id),
            ));
        }
        UnitTerms::resolve(
            plan.billing_type,
            plan.price,
            plan.duration_weeks,
            plan.block_class_count,
        )
    }
}

/// Price and entitlement granted by one purchased unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitTerms {
    pub billing_type: BillingType,
    pub unit_price: Money,
    pub duration_weeks: u32,
    pub block_class_count: u32,
}

impl UnitTerms {
    fn resolve(
        billing_type: BillingType,
        unit_price: Money,
        duration_weeks: Option<u32>,
        block_class_count: Option<u32>,
    ) -> Result<Self> {
        if !unit_price.is_positive() {
            return Err(BillingError::validation(
                "plan_price",
                format!("unit price must be positive, got {}", unit_price),
            ));
        }

        let (duration_weeks, block_class_count) = match billing_type {
            BillingType::PerWeek => match duration_weeks {
                Some(weeks) if weeks > 0 => (weeks, 0),
                _ => {
                    return Err(BillingError::validation(
                        "duration_weeks",
                        "PER_WEEK pricing needs a positive duration in weeks",
                    ))
                }
            },
            BillingType::PerClass => match block_class_count {
                Some(classes) if classes > 0 => (0, classes),
                _ => {
                    return Err(BillingError::validation(
                        "block_class_count",
                        "PER_CLASS pricing needs a positive block class count",
                    ))
                }
            },
        };

        Ok(Self {
            billing_type,
            unit_price,
            duration_weeks,
            block_class_count,
        })
    }
}
