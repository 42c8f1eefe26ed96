mod common;

use common::{cents, now, Fixture};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use swimdesk_billing::domain::{
    FamilyId, PaymentMetadata, PaymentOperations, PaymentRequest, PaymentTarget,
};
use swimdesk_billing::storage::{BillingRepository, InMemoryBillingRepository};
use swimdesk_billing::BillingError;

fn auto(family_id: FamilyId, amount: i64) -> PaymentRequest {
    PaymentRequest {
        family_id,
        amount: cents(amount),
        target: PaymentTarget::auto(),
        idempotency_key: None,
        metadata: PaymentMetadata::default(),
    }
}

fn failed(code: &str, count: u64) -> String {
    format!("swimdesk_billing_payments_failed_total{{code=\"{code}\"}} {count}")
}

#[test]
fn lock_and_undo_failures_are_counted() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let fixture = Fixture::with_repository(InMemoryBillingRepository::new(
                Duration::from_millis(50),
            ))
            .await;
            fixture.add_invoice(4000, 5).await;

            let err = fixture
                .coordinator
                .submit_payment(auto(FamilyId::new(), 1000), now())
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::FamilyNotFound { .. }));

            let held = fixture.repo.begin_family(&fixture.family.id).await.unwrap();
            let err = fixture
                .coordinator
                .submit_payment(auto(fixture.family.id, 1000), now())
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::FamilyBusy { .. }));
            drop(held);

            let receipt = fixture
                .coordinator
                .submit_payment(auto(fixture.family.id, 1000), now())
                .await
                .unwrap();
            fixture
                .coordinator
                .undo_payment(&receipt.payment_id, now())
                .await
                .unwrap();
            let err = fixture
                .coordinator
                .undo_payment(&receipt.payment_id, now())
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::AlreadyUndone { .. }));
        });
    });

    let rendered = handle.render();
    assert!(rendered.contains(&failed("BILLING_FAMILY_NOT_FOUND", 1)));
    assert!(rendered.contains(&failed("BILLING_FAMILY_BUSY", 1)));
    assert!(rendered.contains(&failed("BILLING_ALREADY_UNDONE", 1)));
    assert!(rendered.contains("swimdesk_billing_payments_committed_total 1"));
}
