use crate::domain::enrolments::{Enrolment, UnitTerms};
use crate::domain::money::Money;
use crate::domain::types::{BillingType, EnrolmentId};
use crate::error::{BillingError, Result};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How many units a projection grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseBasis {
    /// Explicit pay-ahead quantity
    Quantity(u32),
    /// Amount applied to the enrolment's invoices; must be whole units
    AppliedAmount(Money),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionContext {
    pub today: NaiveDate,
    /// Coverage end the new periods must follow: paid invoices when granting,
    /// every non-cancelled invoice when placing a new invoice
    pub latest_coverage_end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum EntitlementChange {
    Credits {
        previous: u32,
        new: u32,
    },
    PaidThrough {
        previous: Option<NaiveDate>,
        new: Option<NaiveDate>,
    },
}

/// Reversible record of one projection, stored with the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementDelta {
    pub enrolment_id: EnrolmentId,
    pub change: EntitlementChange,
    pub requested_units: u32,
    pub applied_units: u32,
}

impl EntitlementDelta {
    /// Put back the value recorded before the projection.
    pub fn restore(&self, enrolment: &mut Enrolment) {
        match self.change {
            EntitlementChange::Credits { previous, .. } => enrolment.credits_remaining = previous,
            EntitlementChange::PaidThrough { previous, .. } => {
                enrolment.paid_through_date = previous
            }
        }
    }

    pub fn is_clipped(&self) -> bool {
        self.applied_units < self.requested_units
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub enrolment: Enrolment,
    pub delta: EntitlementDelta,
}

/// Coverage a run of billing periods would add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub applied_units: u32,
}

pub struct EntitlementProjector;

impl EntitlementProjector {
    /// Apply a purchase to an enrolment, returning the updated copy and its delta.
    pub fn project(
        enrolment: &Enrolment,
        terms: &UnitTerms,
        basis: PurchaseBasis,
        context: &ProjectionContext,
    ) -> Result<Projection> {
        let quantity = match basis {
            PurchaseBasis::Quantity(quantity) => quantity,
            PurchaseBasis::AppliedAmount(amount) => units_for_amount(amount, terms.unit_price)?,
        };

        let mut updated = enrolment.clone();
        let delta = match terms.billing_type {
            BillingType::PerClass => {
                let previous = enrolment.credits_remaining;
                let new = terms
                    .block_class_count
                    .checked_mul(quantity)
                    .and_then(|granted| previous.checked_add(granted))
                    .ok_or_else(|| {
                        BillingError::invalid_amount(format!(
                            "{} blocks overflow the credit balance of enrolment {}",
                            quantity, enrolment.id
                        ))
                    })?;
                updated.credits_remaining = new;
                EntitlementDelta {
                    enrolment_id: enrolment.id,
                    change: EntitlementChange::Credits { previous, new },
                    requested_units: quantity,
                    applied_units: quantity,
                }
            }
            BillingType::PerWeek => {
                let previous = enrolment.paid_through_date;
                let window = Self::coverage_window(enrolment, terms, quantity, context)?;
                let new = match window {
                    Some(window) => Some(window.end),
                    None => previous,
                };
                let applied_units = window.map(|w| w.applied_units).unwrap_or(0);
                if applied_units < quantity {
                    warn!(
                        enrolment_id = %enrolment.id,
                        requested = quantity,
                        applied = applied_units,
                        "Pay-ahead clipped at enrolment end date"
                    );
                }
                updated.paid_through_date = new;
                EntitlementDelta {
                    enrolment_id: enrolment.id,
                    change: EntitlementChange::PaidThrough { previous, new },
                    requested_units: quantity,
                    applied_units,
                }
            }
        };

        Ok(Projection {
            enrolment: updated,
            delta,
        })
    }

    /// Where `quantity` PER_WEEK periods would start and end, without changing the enrolment.
    ///
    /// Periods start at the latest of the start date, the current paid-through date, the
    /// latest invoiced coverage and `today`. A period crossing the end date is clipped to it
    /// and anything after is dropped. Returns `None` when no period fits.
    pub fn coverage_window(
        enrolment: &Enrolment,
        terms: &UnitTerms,
        quantity: u32,
        context: &ProjectionContext,
    ) -> Result<Option<CoverageWindow>> {
        let anchor = [
            Some(enrolment.start_date),
            enrolment.paid_through_date,
            context.latest_coverage_end,
            Some(context.today),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(context.today);

        let period = Duration::weeks(i64::from(terms.duration_weeks));
        let mut current = anchor;
        let mut applied_units = 0;

        for _ in 0..quantity {
            if let Some(end) = enrolment.end_date {
                if current >= end {
                    break;
                }
            }
            let next = current.checked_add_signed(period).ok_or_else(|| {
                BillingError::validation("quantity", "coverage runs past the supported calendar")
            })?;
            applied_units += 1;
            match enrolment.end_date {
                Some(end) if next > end => {
                    current = end;
                    break;
                }
                _ => current = next,
            }
        }

        if applied_units == 0 {
            return Ok(None);
        }
        Ok(Some(CoverageWindow {
            start: anchor,
            end: current,
            applied_units,
        }))
    }
}

fn units_for_amount(amount: Money, unit_price: Money) -> Result<u32> {
    match amount.div_rem(unit_price) {
        Some((units, remainder)) if remainder.is_zero() && units >= 0 => u32::try_from(units)
            .map_err(|_| {
                BillingError::invalid_amount(format!("{} buys too many units", amount))
            }),
        _ => Err(BillingError::NonIntegerQuantity { amount, unit_price }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::enrolments::EnrolmentPlan;
    use crate::domain::types::{FamilyId, StudentId};
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn context(today: NaiveDate) -> ProjectionContext {
        ProjectionContext {
            today,
            latest_coverage_end: None,
        }
    }

    fn per_class(credits: u32) -> Enrolment {
        let plan = EnrolmentPlan::per_class("10 class pass", Money::from_cents(15000), 10);
        let mut enrolment =
            Enrolment::from_plan(FamilyId::new(), StudentId::new(), &plan, date(2024, 1, 1));
        enrolment.credits_remaining = credits;
        enrolment
    }

    fn per_week(weeks: u32, paid_through: Option<NaiveDate>) -> Enrolment {
        let plan = EnrolmentPlan::per_week("weekly", Money::from_cents(8000), weeks);
        let mut enrolment =
            Enrolment::from_plan(FamilyId::new(), StudentId::new(), &plan, date(2023, 12, 1));
        enrolment.paid_through_date = paid_through;
        enrolment
    }

    #[test]
    fn test_per_class_block_purchase() {
        let enrolment = per_class(2);
        let terms = enrolment.unit_terms().unwrap();
        let projection = EntitlementProjector::project(
            &enrolment,
            &terms,
            PurchaseBasis::Quantity(1),
            &context(date(2024, 1, 5)),
        )
        .unwrap();

        assert_eq!(projection.enrolment.credits_remaining, 12);
        assert_eq!(
            projection.delta.change,
            EntitlementChange::Credits {
                previous: 2,
                new: 12
            }
        );
    }

    #[test]
    fn test_applied_amount_must_be_whole_blocks() {
        let enrolment = per_class(0);
        let terms = enrolment.unit_terms().unwrap();
        let ctx = context(date(2024, 1, 5));

        let projection = EntitlementProjector::project(
            &enrolment,
            &terms,
            PurchaseBasis::AppliedAmount(Money::from_cents(30000)),
            &ctx,
        )
        .unwrap();
        assert_eq!(projection.enrolment.credits_remaining, 20);

        assert!(matches!(
            EntitlementProjector::project(
                &enrolment,
                &terms,
                PurchaseBasis::AppliedAmount(Money::from_cents(7500)),
                &ctx,
            ),
            Err(BillingError::NonIntegerQuantity { .. })
        ));
    }

    #[test]
    fn test_per_week_clips_at_end_date() {
        let enrolment = per_week(4, Some(date(2024, 1, 1))).with_end_date(date(2024, 1, 20));
        let terms = enrolment.unit_terms().unwrap();
        let projection = EntitlementProjector::project(
            &enrolment,
            &terms,
            PurchaseBasis::Quantity(2),
            &context(date(2023, 12, 20)),
        )
        .unwrap();

        assert_eq!(projection.enrolment.paid_through_date, Some(date(2024, 1, 20)));
        assert_eq!(projection.delta.requested_units, 2);
        assert_eq!(projection.delta.applied_units, 1);
        assert!(projection.delta.is_clipped());
    }

    #[test]
    fn test_per_week_anchor_never_backdates() {
        let enrolment = per_week(1, Some(date(2024, 1, 1)));
        let terms = enrolment.unit_terms().unwrap();

        let projection = EntitlementProjector::project(
            &enrolment,
            &terms,
            PurchaseBasis::Quantity(2),
            &context(date(2024, 2, 1)),
        )
        .unwrap();
        assert_eq!(projection.enrolment.paid_through_date, Some(date(2024, 2, 15)));

        let invoiced = ProjectionContext {
            today: date(2023, 12, 20),
            latest_coverage_end: Some(date(2024, 1, 15)),
        };
        let projection =
            EntitlementProjector::project(&enrolment, &terms, PurchaseBasis::Quantity(1), &invoiced)
                .unwrap();
        assert_eq!(projection.enrolment.paid_through_date, Some(date(2024, 1, 22)));
    }

    #[test]
    fn test_per_week_past_end_applies_nothing() {
        let enrolment = per_week(2, Some(date(2024, 3, 1))).with_end_date(date(2024, 3, 1));
        let terms = enrolment.unit_terms().unwrap();
        let projection = EntitlementProjector::project(
            &enrolment,
            &terms,
            PurchaseBasis::Quantity(3),
            &context(date(2024, 2, 1)),
        )
        .unwrap();

        assert_eq!(projection.enrolment.paid_through_date, Some(date(2024, 3, 1)));
        assert_eq!(projection.delta.applied_units, 0);
    }

    #[test]
    fn test_restore_touches_only_entitlement() {
        let enrolment = per_class(3);
        let terms = enrolment.unit_terms().unwrap();
        let projection = EntitlementProjector::project(
            &enrolment,
            &terms,
            PurchaseBasis::Quantity(2),
            &context(date(2024, 1, 5)),
        )
        .unwrap();

        let mut later = projection.enrolment.clone();
        later.credits_remaining -= 1;
        later.end_date = Some(date(2024, 6, 30));
        projection.delta.restore(&mut later);

        assert_eq!(later.credits_remaining, 3);
        assert_eq!(later.end_date, Some(date(2024, 6, 30)));
    }
}
