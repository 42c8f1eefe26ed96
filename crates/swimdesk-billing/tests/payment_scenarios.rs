mod common;

use common::{cents, date, now, Fixture};
use pretty_assertions::assert_eq;
use swimdesk_billing::domain::{
    AllocationRequest, EnrolmentPurchase, InvoiceStatus, Money, PayAheadRequest, PaymentMetadata,
    PaymentOperations, PaymentRequest, PaymentTarget,
};
use swimdesk_billing::storage::BillingRepository;
use swimdesk_billing::BillingError;

fn request(fixture: &Fixture, amount: i64, target: PaymentTarget) -> PaymentRequest {
    PaymentRequest {
        family_id: fixture.family.id,
        amount: cents(amount),
        target,
        idempotency_key: None,
        metadata: PaymentMetadata::default(),
    }
}

fn purchase(enrolment_id: swimdesk_billing::domain::EnrolmentId, quantity: u32) -> PaymentTarget {
    PaymentTarget::EnrolmentPurchase(EnrolmentPurchase {
        enrolment_id,
        plan_id: None,
        quantity,
    })
}

#[tokio::test]
async fn partial_then_overpayment_across_one_invoice() {
    let fixture = Fixture::new().await;
    let invoice = fixture.add_invoice(5000, 3).await;

    let first = fixture
        .coordinator
        .submit_payment(request(&fixture, 3000, PaymentTarget::auto()), now())
        .await
        .unwrap();
    assert_eq!(first.unallocated, Money::ZERO);
    let stored = fixture.invoice(&invoice).await;
    assert_eq!(stored.amount_paid, cents(3000));
    assert_eq!(stored.status, InvoiceStatus::PartiallyPaid);

    let second = fixture
        .coordinator
        .submit_payment(request(&fixture, 5000, PaymentTarget::auto()), now())
        .await
        .unwrap();
    assert_eq!(second.unallocated, cents(3000));
    assert_eq!(second.allocations.len(), 1);
    assert_eq!(second.allocations[0].amount, cents(2000));
    let stored = fixture.invoice(&invoice).await;
    assert_eq!(stored.amount_paid, cents(5000));
    assert_eq!(stored.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn auto_allocation_pays_oldest_invoice_first() {
    let fixture = Fixture::new().await;
    let newer = fixture.add_invoice(2000, 1).await;
    let older = fixture.add_invoice(2000, 10).await;

    let receipt = fixture
        .coordinator
        .submit_payment(request(&fixture, 3000, PaymentTarget::auto()), now())
        .await
        .unwrap();

    assert_eq!(receipt.allocations[0].invoice_id, older.id);
    assert_eq!(receipt.allocations[1].invoice_id, newer.id);
    assert_eq!(fixture.invoice(&older).await.status, InvoiceStatus::Paid);
    assert_eq!(fixture.invoice(&newer).await.amount_paid, cents(1000));
}

#[tokio::test]
async fn auto_allocation_without_open_invoices_is_all_unallocated() {
    let fixture = Fixture::new().await;
    let receipt = fixture
        .coordinator
        .submit_payment(request(&fixture, 1500, PaymentTarget::auto()), now())
        .await
        .unwrap();
    assert_eq!(receipt.unallocated, cents(1500));
    assert!(receipt.allocations.is_empty());
}

#[tokio::test]
async fn class_block_purchase_adds_credits() {
    let fixture = Fixture::new().await;
    let enrolment = fixture.add_per_class(15000, 10, 2).await;

    let receipt = fixture
        .coordinator
        .submit_payment(request(&fixture, 15000, purchase(enrolment.id, 1)), now())
        .await
        .unwrap();

    assert_eq!(fixture.enrolment(&enrolment).await.credits_remaining, 12);
    assert_eq!(receipt.unallocated, Money::ZERO);
    assert_eq!(receipt.entitlements[0].credits_remaining, Some(12));

    // Synthetic pay-ahead invoice, fully allocated
    let synthetic = fixture
        .repo
        .get_invoice(&receipt.allocations[0].invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synthetic.status, InvoiceStatus::Paid);
    assert_eq!(synthetic.created_by_payment, Some(receipt.payment_id));
    assert_eq!(synthetic.enrolment_id, Some(enrolment.id));
}

#[tokio::test]
async fn weekly_purchase_clips_at_end_date() {
    let fixture = Fixture::new().await;
    let enrolment = fixture
        .add_per_week(8000, 4, Some(date(2024, 1, 1)), Some(date(2024, 1, 20)))
        .await;

    let receipt = fixture
        .coordinator
        .submit_payment(request(&fixture, 16000, purchase(enrolment.id, 2)), now())
        .await
        .unwrap();

    let updated = fixture.enrolment(&enrolment).await;
    assert_eq!(updated.paid_through_date, Some(date(2024, 1, 20)));
    let outcome = receipt.entitlements[0];
    assert_eq!(outcome.requested_units, 2);
    assert_eq!(outcome.applied_units, 1);
    assert_eq!(outcome.paid_through_date, Some(date(2024, 1, 20)));
}

#[tokio::test]
async fn purchase_amount_must_match_unit_price() {
    let fixture = Fixture::new().await;
    let enrolment = fixture.add_per_class(15000, 10, 0).await;

    let err = fixture
        .coordinator
        .submit_payment(request(&fixture, 14000, purchase(enrolment.id, 1)), now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AmountMismatch { .. }));
    assert_eq!(fixture.enrolment(&enrolment).await.credits_remaining, 0);
}

#[tokio::test]
async fn manual_split_pays_both_invoices() {
    let fixture = Fixture::new().await;
    let first = fixture.add_invoice(2000, 5).await;
    let second = fixture.add_invoice(3000, 4).await;

    let receipt = fixture
        .coordinator
        .submit_payment(
            request(
                &fixture,
                5000,
                PaymentTarget::manual(vec![
                    AllocationRequest {
                        invoice_id: second.id,
                        amount: cents(3000),
                    },
                    AllocationRequest {
                        invoice_id: first.id,
                        amount: cents(2000),
                    },
                ]),
            ),
            now(),
        )
        .await
        .unwrap();

    assert_eq!(receipt.unallocated, Money::ZERO);
    assert_eq!(fixture.invoice(&first).await.status, InvoiceStatus::Paid);
    assert_eq!(fixture.invoice(&second).await.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn manual_allocation_to_paid_invoice_is_rejected() {
    let fixture = Fixture::new().await;
    let invoice = fixture.add_invoice(2000, 5).await;
    fixture
        .coordinator
        .submit_payment(request(&fixture, 2000, PaymentTarget::auto()), now())
        .await
        .unwrap();

    let err = fixture
        .coordinator
        .submit_payment(
            request(
                &fixture,
                500,
                PaymentTarget::manual(vec![AllocationRequest {
                    invoice_id: invoice.id,
                    amount: cents(500),
                }]),
            ),
            now(),
        )
        .await
        .unwrap_err();

    match err {
        BillingError::AllocationExceedsBalance {
            invoice_id,
            balance,
            ..
        } => {
            assert_eq!(invoice_id, invoice.id);
            assert_eq!(balance, Money::ZERO);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn manual_mismatch_writes_nothing() {
    let fixture = Fixture::new().await;
    let invoice = fixture.add_invoice(2000, 5).await;

    let err = fixture
        .coordinator
        .submit_payment(
            request(
                &fixture,
                2000,
                PaymentTarget::manual(vec![AllocationRequest {
                    invoice_id: invoice.id,
                    amount: cents(1500),
                }]),
            ),
            now(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::AllocationMismatch { .. }));
    assert!(fixture
        .repo
        .list_payments(&fixture.family.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(fixture.invoice(&invoice).await.amount_paid, Money::ZERO);
}

#[tokio::test]
async fn non_positive_amount_is_rejected() {
    let fixture = Fixture::new().await;
    let err = fixture
        .coordinator
        .submit_payment(request(&fixture, 0, PaymentTarget::auto()), now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidAmount { .. }));
}

#[tokio::test]
async fn unknown_family_is_rejected() {
    let fixture = Fixture::new().await;
    let mut req = request(&fixture, 100, PaymentTarget::auto());
    req.family_id = swimdesk_billing::domain::FamilyId::new();
    let err = fixture
        .coordinator
        .submit_payment(req, now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::FamilyNotFound { .. }));
}

#[tokio::test]
async fn idempotent_retry_returns_prior_result() {
    let fixture = Fixture::new().await;
    let invoice = fixture.add_invoice(5000, 3).await;
    let mut req = request(&fixture, 3000, PaymentTarget::auto());
    req.idempotency_key = Some("till-7-0042".to_string());

    let first = fixture
        .coordinator
        .submit_payment(req.clone(), now())
        .await
        .unwrap();
    let retry = fixture
        .coordinator
        .submit_payment(req, now())
        .await
        .unwrap();

    assert!(!first.duplicate);
    assert!(retry.duplicate);
    assert_eq!(retry.payment_id, first.payment_id);
    assert_eq!(retry.allocations, first.allocations);
    assert_eq!(fixture.invoice(&invoice).await.amount_paid, cents(3000));
    assert_eq!(
        fixture
            .repo
            .list_payments(&fixture.family.id)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn undo_restores_invoices_and_entitlements() {
    let fixture = Fixture::new().await;
    let invoice = fixture.add_invoice(5000, 3).await;
    let enrolment = fixture.add_per_class(15000, 10, 2).await;

    let paid = fixture
        .coordinator
        .submit_payment(request(&fixture, 3000, PaymentTarget::auto()), now())
        .await
        .unwrap();
    let bought = fixture
        .coordinator
        .submit_payment(request(&fixture, 15000, purchase(enrolment.id, 1)), now())
        .await
        .unwrap();

    let undone = fixture
        .coordinator
        .undo_payment(&paid.payment_id, now())
        .await
        .unwrap();
    assert_eq!(undone.reversed_allocations, 1);
    let restored = fixture.invoice(&invoice).await;
    assert_eq!(restored.amount_paid, Money::ZERO);
    assert_eq!(restored.status, InvoiceStatus::Open);

    let undone = fixture
        .coordinator
        .undo_payment(&bought.payment_id, now())
        .await
        .unwrap();
    assert_eq!(undone.restored_enrolments, vec![enrolment.id]);
    assert_eq!(undone.cancelled_invoices.len(), 1);
    assert_eq!(fixture.enrolment(&enrolment).await.credits_remaining, 2);

    let synthetic = fixture
        .repo
        .get_invoice(&bought.allocations[0].invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synthetic.status, InvoiceStatus::Cancelled);

    let payments = fixture.repo.list_payments(&fixture.family.id).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert!(payments.iter().all(|payment| payment.undone));
}

#[tokio::test]
async fn undo_restores_previous_value_verbatim() {
    let fixture = Fixture::new().await;
    let enrolment = fixture.add_per_class(15000, 10, 2).await;
    let bought = fixture
        .coordinator
        .submit_payment(request(&fixture, 15000, purchase(enrolment.id, 1)), now())
        .await
        .unwrap();

    // Classes attended after the purchase do not survive the undo
    let mut attended = fixture.enrolment(&enrolment).await;
    attended.credits_remaining = 9;
    fixture.repo.insert_enrolment(attended).await;

    fixture
        .coordinator
        .undo_payment(&bought.payment_id, now())
        .await
        .unwrap();
    assert_eq!(fixture.enrolment(&enrolment).await.credits_remaining, 2);
}

#[tokio::test]
async fn second_undo_is_rejected() {
    let fixture = Fixture::new().await;
    fixture.add_invoice(5000, 3).await;
    let paid = fixture
        .coordinator
        .submit_payment(request(&fixture, 1000, PaymentTarget::auto()), now())
        .await
        .unwrap();

    fixture
        .coordinator
        .undo_payment(&paid.payment_id, now())
        .await
        .unwrap();
    let err = fixture
        .coordinator
        .undo_payment(&paid.payment_id, now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadyUndone { .. }));

    let err = fixture
        .coordinator
        .undo_payment(&swimdesk_billing::domain::PaymentId::new(), now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PaymentNotFound { .. }));
}

#[tokio::test]
async fn paying_enrolment_invoice_grants_entitlement() {
    let fixture = Fixture::new().await;
    let enrolment = fixture.add_per_class(15000, 10, 0).await;
    let invoice = fixture
        .invoices
        .issue_enrolment_invoice(&enrolment.id, 2, None, now())
        .await
        .unwrap();
    assert_eq!(invoice.amount, cents(30000));
    assert_eq!(fixture.enrolment(&enrolment).await.credits_remaining, 0);

    let receipt = fixture
        .coordinator
        .submit_payment(request(&fixture, 30000, PaymentTarget::auto()), now())
        .await
        .unwrap();

    assert_eq!(fixture.enrolment(&enrolment).await.credits_remaining, 20);
    assert_eq!(receipt.entitlements[0].credits_remaining, Some(20));
    assert_eq!(receipt.entitlements[0].applied_units, 2);
}

#[tokio::test]
async fn partial_block_payment_is_rejected() {
    let fixture = Fixture::new().await;
    let enrolment = fixture.add_per_class(15000, 10, 0).await;
    let invoice = fixture
        .invoices
        .issue_enrolment_invoice(&enrolment.id, 1, None, now())
        .await
        .unwrap();

    let err = fixture
        .coordinator
        .submit_payment(request(&fixture, 5000, PaymentTarget::auto()), now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NonIntegerQuantity { .. }));
    assert_eq!(fixture.invoice(&invoice).await.amount_paid, Money::ZERO);
}

#[tokio::test]
async fn pay_ahead_batch_commits_and_undoes_together() {
    let fixture = Fixture::new().await;
    let classes = fixture.add_per_class(15000, 10, 1).await;
    let weeks = fixture
        .add_per_week(8000, 4, Some(date(2024, 1, 1)), None)
        .await;

    let receipt = fixture
        .coordinator
        .pay_ahead_and_pay(
            PayAheadRequest {
                family_id: fixture.family.id,
                items: vec![
                    EnrolmentPurchase {
                        enrolment_id: classes.id,
                        plan_id: None,
                        quantity: 2,
                    },
                    EnrolmentPurchase {
                        enrolment_id: weeks.id,
                        plan_id: None,
                        quantity: 1,
                    },
                ],
                idempotency_key: Some("batch-1".to_string()),
                metadata: PaymentMetadata::default(),
            },
            now(),
        )
        .await
        .unwrap();

    assert_eq!(receipt.allocations.len(), 2);
    let payment = fixture
        .repo
        .get_payment(&receipt.payment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.amount, cents(38000));
    assert_eq!(fixture.enrolment(&classes).await.credits_remaining, 21);
    assert_eq!(
        fixture.enrolment(&weeks).await.paid_through_date,
        Some(date(2024, 1, 29))
    );

    let undone = fixture
        .coordinator
        .undo_payment(&receipt.payment_id, now())
        .await
        .unwrap();
    assert_eq!(undone.cancelled_invoices.len(), 2);
    assert_eq!(fixture.enrolment(&classes).await.credits_remaining, 1);
    assert_eq!(
        fixture.enrolment(&weeks).await.paid_through_date,
        Some(date(2024, 1, 1))
    );
}

#[tokio::test]
async fn pay_ahead_rejects_repeated_enrolment() {
    let fixture = Fixture::new().await;
    let classes = fixture.add_per_class(15000, 10, 0).await;
    let item = EnrolmentPurchase {
        enrolment_id: classes.id,
        plan_id: None,
        quantity: 1,
    };

    let err = fixture
        .coordinator
        .pay_ahead_and_pay(
            PayAheadRequest {
                family_id: fixture.family.id,
                items: vec![item, item],
                idempotency_key: None,
                metadata: PaymentMetadata::default(),
            },
            now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ValidationError { .. }));
}

#[tokio::test]
async fn failed_commit_leaves_no_trace() {
    let fixture = Fixture::new().await;
    let invoice = fixture.add_invoice(5000, 3).await;
    let enrolment = fixture.add_per_class(15000, 10, 2).await;

    fixture.repo.fail_next_commit();
    let err = fixture
        .coordinator
        .submit_payment(request(&fixture, 15000, purchase(enrolment.id, 1)), now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PersistenceFailed { .. }));
    assert!(err.is_retryable());

    assert_eq!(fixture.enrolment(&enrolment).await.credits_remaining, 2);
    assert_eq!(fixture.invoice(&invoice).await.amount_paid, Money::ZERO);
    assert!(fixture
        .repo
        .list_payments(&fixture.family.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        fixture.repo.list_invoices(&fixture.family.id).await.unwrap().len(),
        1
    );

    // The family lock was released by the failed session
    fixture
        .coordinator
        .submit_payment(request(&fixture, 15000, purchase(enrolment.id, 1)), now())
        .await
        .unwrap();
    assert_eq!(fixture.enrolment(&enrolment).await.credits_remaining, 12);
}

#[tokio::test]
async fn preview_matches_commit_without_writing() {
    let fixture = Fixture::new().await;
    let invoice = fixture.add_invoice(5000, 3).await;
    let target = PaymentTarget::auto();

    let preview = fixture
        .coordinator
        .preview(&fixture.family.id, cents(6000), &target, now())
        .await
        .unwrap();
    assert_eq!(preview.lines.len(), 1);
    assert_eq!(preview.lines[0].amount, cents(5000));
    assert_eq!(preview.unallocated, cents(1000));
    assert_eq!(fixture.invoice(&invoice).await.amount_paid, Money::ZERO);

    let receipt = fixture
        .coordinator
        .submit_payment(request(&fixture, 6000, target), now())
        .await
        .unwrap();
    assert_eq!(receipt.unallocated, preview.unallocated);
    assert_eq!(receipt.allocations[0].amount, preview.lines[0].amount);
}
