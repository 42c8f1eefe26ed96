use crate::domain::invoices::{Invoice, InvoiceLedger};
use crate::domain::money::Money;
use crate::domain::types::{EnrolmentId, InvoiceId, PlanId};
use crate::error::{BillingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One caller-chosen line of a manual allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub invoice_id: InvoiceId,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "allocations", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationMode {
    /// Oldest-first across open invoices
    Auto,
    Manual(Vec<AllocationRequest>),
}

/// Direct purchase of enrolment units (class blocks or billing periods).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolmentPurchase {
    pub enrolment_id: EnrolmentId,
    /// Price tier to buy; defaults to the enrolment's own plan
    pub plan_id: Option<PlanId>,
    pub quantity: u32,
}

/// What a payment is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentTarget {
    InvoiceAllocation { mode: AllocationMode },
    EnrolmentPurchase(EnrolmentPurchase),
}

impl PaymentTarget {
    pub fn auto() -> Self {
        PaymentTarget::InvoiceAllocation {
            mode: AllocationMode::Auto,
        }
    }

    pub fn manual(lines: Vec<AllocationRequest>) -> Self {
        PaymentTarget::InvoiceAllocation {
            mode: AllocationMode::Manual(lines),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAllocation {
    pub invoice_id: InvoiceId,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub lines: Vec<PlannedAllocation>,
    pub unallocated: Money,
}

impl AllocationPlan {
    pub fn allocated(&self) -> Result<Money> {
        Money::sum(self.lines.iter().map(|line| line.amount))
    }
}

/// Pure allocation decisions; the coordinator executes the resulting plan.
pub struct AllocationEngine;

impl AllocationEngine {
    pub fn plan_invoices(
        amount: Money,
        mode: &AllocationMode,
        ledger: &InvoiceLedger,
    ) -> Result<AllocationPlan> {
        ensure_positive(amount)?;
        match mode {
            AllocationMode::Auto => Ok(Self::plan_auto(amount, ledger)),
            AllocationMode::Manual(lines) => Self::plan_manual(amount, lines, ledger),
        }
    }

    /// Validate that `amount` buys exactly `quantity` units at `unit_price`.
    pub fn plan_purchase(
        amount: Money,
        unit_price: Money,
        quantity: u32,
    ) -> Result<AllocationPlan> {
        ensure_positive(amount)?;
        if quantity == 0 {
            return Err(BillingError::validation(
                "quantity",
                "quantity must be at least 1",
            ));
        }
        let expected = unit_price.multiply(quantity)?;
        if expected != amount {
            return Err(BillingError::AmountMismatch {
                amount,
                unit_price,
                quantity,
            });
        }
        Ok(AllocationPlan {
            lines: Vec::new(),
            unallocated: Money::ZERO,
        })
    }

    fn plan_auto(amount: Money, ledger: &InvoiceLedger) -> AllocationPlan {
        let mut remaining = amount;
        let mut lines = Vec::new();

        for invoice in ledger.open_invoices() {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(invoice.balance());
            if take.is_positive() {
                lines.push(PlannedAllocation {
                    invoice_id: invoice.id,
                    amount: take,
                });
                remaining = remaining.saturating_sub(take);
            }
        }

        AllocationPlan {
            lines,
            unallocated: remaining,
        }
    }

    fn plan_manual(
        amount: Money,
        requests: &[AllocationRequest],
        ledger: &InvoiceLedger,
    ) -> Result<AllocationPlan> {
        if requests.is_empty() {
            return Err(BillingError::validation(
                "allocations",
                "manual allocation needs at least one line",
            ));
        }

        let mut seen = HashSet::new();
        for request in requests {
            if !request.amount.is_positive() {
                return Err(BillingError::validation(
                    "allocations",
                    format!(
                        "allocation to invoice {} must be positive, got {}",
                        request.invoice_id, request.amount
                    ),
                ));
            }
            if !seen.insert(request.invoice_id) {
                return Err(BillingError::validation(
                    "allocations",
                    format!("invoice {} appears more than once", request.invoice_id),
                ));
            }
        }

        for request in requests {
            let invoice = ledger.get(&request.invoice_id).ok_or_else(|| {
                BillingError::InvoiceNotFound {
                    id: request.invoice_id.to_string(),
                }
            })?;
            let balance = payable_balance(invoice);
            if request.amount > balance {
                return Err(BillingError::AllocationExceedsBalance {
                    invoice_id: invoice.id,
                    requested: request.amount,
                    balance,
                });
            }
        }

        let allocated = Money::sum(requests.iter().map(|request| request.amount))?;
        if allocated != amount {
            return Err(BillingError::AllocationMismatch { allocated, amount });
        }

        let requested: HashMap<InvoiceId, Money> = requests
            .iter()
            .map(|request| (request.invoice_id, request.amount))
            .collect();
        let lines = ledger
            .open_invoices()
            .into_iter()
            .filter_map(|invoice| {
                requested.get(&invoice.id).map(|amount| PlannedAllocation {
                    invoice_id: invoice.id,
                    amount: *amount,
                })
            })
            .collect();

        Ok(AllocationPlan {
            lines,
            unallocated: Money::ZERO,
        })
    }
}

fn ensure_positive(amount: Money) -> Result<()> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(BillingError::invalid_amount(format!(
            "payment amount must be positive, got {}",
            amount
        )))
    }
}

/// Paid, cancelled and otherwise closed invoices can take nothing.
fn payable_balance(invoice: &Invoice) -> Money {
    if invoice.is_payable() {
        invoice.balance()
    } else {
        Money::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{FamilyId, InvoiceKind};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    fn ledger_with(balances: &[(i64, i64)]) -> (InvoiceLedger, Vec<InvoiceId>) {
        let family_id = FamilyId::new();
        let invoices: Vec<Invoice> = balances
            .iter()
            .enumerate()
            .map(|(i, (amount, paid))| {
                let mut inv = Invoice::new(
                    Some(family_id),
                    InvoiceKind::Manual,
                    Money::from_cents(*amount),
                    now() - Duration::days(30 - i as i64),
                )
                .unwrap();
                inv.amount_paid = Money::from_cents(*paid);
                inv
            })
            .collect();
        let ids = invoices.iter().map(|inv| inv.id).collect();
        (InvoiceLedger::new(family_id, invoices, now()), ids)
    }

    #[test]
    fn test_non_positive_amount_rejected_first() {
        let (ledger, ids) = ledger_with(&[(1000, 0)]);
        let bogus = AllocationMode::Manual(vec![AllocationRequest {
            invoice_id: ids[0],
            amount: Money::from_cents(-5),
        }]);
        for amount in [0, -100] {
            assert!(matches!(
                AllocationEngine::plan_invoices(Money::from_cents(amount), &bogus, &ledger),
                Err(BillingError::InvalidAmount { .. })
            ));
        }
    }

    #[test]
    fn test_auto_walks_oldest_first() {
        let (ledger, ids) = ledger_with(&[(2000, 0), (3000, 1000), (4000, 0)]);
        let plan =
            AllocationEngine::plan_invoices(Money::from_cents(3500), &AllocationMode::Auto, &ledger)
                .unwrap();

        assert_eq!(
            plan.lines,
            vec![
                PlannedAllocation {
                    invoice_id: ids[0],
                    amount: Money::from_cents(2000)
                },
                PlannedAllocation {
                    invoice_id: ids[1],
                    amount: Money::from_cents(1500)
                },
            ]
        );
        assert_eq!(plan.unallocated, Money::ZERO);
    }

    #[test]
    fn test_auto_reports_leftover() {
        let (ledger, _) = ledger_with(&[(2000, 0)]);
        let plan =
            AllocationEngine::plan_invoices(Money::from_cents(5000), &AllocationMode::Auto, &ledger)
                .unwrap();
        assert_eq!(plan.allocated().unwrap(), Money::from_cents(2000));
        assert_eq!(plan.unallocated, Money::from_cents(3000));

        let (empty, _) = ledger_with(&[]);
        let plan =
            AllocationEngine::plan_invoices(Money::from_cents(700), &AllocationMode::Auto, &empty)
                .unwrap();
        assert!(plan.lines.is_empty());
        assert_eq!(plan.unallocated, Money::from_cents(700));
    }

    #[test]
    fn test_manual_sum_must_match_to_the_cent() {
        let (ledger, ids) = ledger_with(&[(2000, 0), (3000, 0)]);
        let mode = AllocationMode::Manual(vec![
            AllocationRequest {
                invoice_id: ids[0],
                amount: Money::from_cents(2000),
            },
            AllocationRequest {
                invoice_id: ids[1],
                amount: Money::from_cents(2999),
            },
        ]);
        let err = AllocationEngine::plan_invoices(Money::from_cents(5000), &mode, &ledger)
            .unwrap_err();
        assert!(matches!(err, BillingError::AllocationMismatch { .. }));
    }

    #[test]
    fn test_manual_line_over_balance_names_invoice() {
        let (ledger, ids) = ledger_with(&[(2000, 0), (3000, 0)]);
        let mode = AllocationMode::Manual(vec![AllocationRequest {
            invoice_id: ids[0],
            amount: Money::from_cents(2500),
        }]);
        match AllocationEngine::plan_invoices(Money::from_cents(2500), &mode, &ledger) {
            Err(BillingError::AllocationExceedsBalance {
                invoice_id,
                balance,
                ..
            }) => {
                assert_eq!(invoice_id, ids[0]);
                assert_eq!(balance, Money::from_cents(2000));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_manual_against_paid_or_unknown_invoice() {
        let (ledger, ids) = ledger_with(&[(2000, 2000)]);
        let paid = AllocationMode::Manual(vec![AllocationRequest {
            invoice_id: ids[0],
            amount: Money::from_cents(100),
        }]);
        assert!(matches!(
            AllocationEngine::plan_invoices(Money::from_cents(100), &paid, &ledger),
            Err(BillingError::AllocationExceedsBalance { balance, .. }) if balance == Money::ZERO
        ));

        let unknown = AllocationMode::Manual(vec![AllocationRequest {
            invoice_id: InvoiceId::new(),
            amount: Money::from_cents(100),
        }]);
        assert!(matches!(
            AllocationEngine::plan_invoices(Money::from_cents(100), &unknown, &ledger),
            Err(BillingError::InvoiceNotFound { .. })
        ));
    }

    #[test]
    fn test_manual_duplicates_rejected() {
        let (ledger, ids) = ledger_with(&[(2000, 0)]);
        let line = AllocationRequest {
            invoice_id: ids[0],
            amount: Money::from_cents(500),
        };
        let mode = AllocationMode::Manual(vec![line, line]);
        assert!(matches!(
            AllocationEngine::plan_invoices(Money::from_cents(1000), &mode, &ledger),
            Err(BillingError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_manual_lines_follow_ledger_order() {
        let (ledger, ids) = ledger_with(&[(2000, 0), (3000, 0)]);
        let mode = AllocationMode::Manual(vec![
            AllocationRequest {
                invoice_id: ids[1],
                amount: Money::from_cents(3000),
            },
            AllocationRequest {
                invoice_id: ids[0],
                amount: Money::from_cents(2000),
            },
        ]);
        let plan = AllocationEngine::plan_invoices(Money::from_cents(5000), &mode, &ledger)
            .unwrap();
        let order: Vec<InvoiceId> = plan.lines.iter().map(|l| l.invoice_id).collect();
        assert_eq!(order, vec![ids[0], ids[1]]);
        assert_eq!(plan.unallocated, Money::ZERO);
    }

    #[test]
    fn test_purchase_requires_exact_amount() {
        let price = Money::from_cents(15000);
        assert!(AllocationEngine::plan_purchase(Money::from_cents(30000), price, 2).is_ok());
        assert!(matches!(
            AllocationEngine::plan_purchase(Money::from_cents(29999), price, 2),
            Err(BillingError::AmountMismatch { quantity: 2, .. })
        ));
        assert!(matches!(
            AllocationEngine::plan_purchase(Money::from_cents(15000), price, 0),
            Err(BillingError::ValidationError { .. })
        ));
    }
}
