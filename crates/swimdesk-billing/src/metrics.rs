use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

pub struct BillingMetricNames;

impl BillingMetricNames {
    pub const PAYMENTS_COMMITTED: &'static str = "swimdesk_billing_payments_committed_total";
    pub const PAYMENTS_UNDONE: &'static str = "swimdesk_billing_payments_undone_total";
    pub const PAYMENTS_DUPLICATE: &'static str = "swimdesk_billing_payments_duplicate_total";
    pub const PAYMENTS_FAILED: &'static str = "swimdesk_billing_payments_failed_total";
    pub const UNALLOCATED_CENTS: &'static str = "swimdesk_billing_unallocated_cents_total";
    pub const COMMIT_DURATION: &'static str = "swimdesk_billing_commit_duration_seconds";
}

/// Handles into the global `metrics` facade. Without an installed recorder every call is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct BillingMetrics;

impl BillingMetrics {
    pub fn record_commit(&self, unallocated: crate::domain::money::Money, elapsed: Duration) {
        counter!(BillingMetricNames::PAYMENTS_COMMITTED).increment(1);
        if unallocated.is_positive() {
            counter!(BillingMetricNames::UNALLOCATED_CENTS).increment(unallocated.cents() as u64);
        }
        histogram!(BillingMetricNames::COMMIT_DURATION).record(elapsed.as_secs_f64());
    }

    pub fn record_undo(&self) {
        counter!(BillingMetricNames::PAYMENTS_UNDONE).increment(1);
    }

    pub fn record_duplicate(&self) {
        counter!(BillingMetricNames::PAYMENTS_DUPLICATE).increment(1);
    }

    pub fn record_failure(&self, code: &'static str) {
        counter!(BillingMetricNames::PAYMENTS_FAILED, "code" => code).increment(1);
    }
}

/// Process-wide Prometheus recorder backing `/metrics`.
pub struct PrometheusMetricsRecorder {
    handle: PrometheusHandle,
}

impl PrometheusMetricsRecorder {
    /// Install the recorder. Only one can exist per process.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

        Self::register_standard_metrics();

        Ok(Self { handle })
    }

    fn register_standard_metrics() {
        describe_counter!(
            BillingMetricNames::PAYMENTS_COMMITTED,
            Unit::Count,
            "Payments committed, including counter-sale settlements"
        );
        describe_counter!(
            BillingMetricNames::PAYMENTS_UNDONE,
            Unit::Count,
            "Payments reversed by undo"
        );
        describe_counter!(
            BillingMetricNames::PAYMENTS_DUPLICATE,
            Unit::Count,
            "Submissions answered from an earlier payment with the same idempotency key"
        );
        describe_counter!(
            BillingMetricNames::PAYMENTS_FAILED,
            Unit::Count,
            "Failed payment and undo operations by error code"
        );
        describe_counter!(
            BillingMetricNames::UNALLOCATED_CENTS,
            Unit::Count,
            "Cents received but not applied to any invoice"
        );
        describe_histogram!(
            BillingMetricNames::COMMIT_DURATION,
            Unit::Seconds,
            "Time from lock to commit for a payment"
        );
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}
