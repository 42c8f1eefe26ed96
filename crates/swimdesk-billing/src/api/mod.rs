//! HTTP/JSON surface of the billing service

pub mod error;
pub mod routes;
pub mod types;

use crate::domain::clock::Clock;
use crate::domain::coordinator::{PaymentCoordinator, PaymentOperations};
use crate::domain::invoicing::InvoiceManager;
use crate::domain::summary::BillingSummaryBuilder;
use crate::domain::types::FamilyId;
use crate::error::{BillingError, Result};
use crate::metrics::PrometheusMetricsRecorder;
use crate::storage::BillingRepository;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<dyn PaymentOperations>,
    pub invoices: Arc<InvoiceManager>,
    pub summaries: Arc<BillingSummaryBuilder>,
    pub clock: Arc<dyn Clock>,
    /// `None` when metrics are disabled
    pub metrics: Option<Arc<PrometheusMetricsRecorder>>,
}

impl AppState {
    pub fn new(
        repository: Arc<dyn BillingRepository + Send + Sync>,
        clock: Arc<dyn Clock>,
        default_invoice_due_days: u32,
        metrics: Option<Arc<PrometheusMetricsRecorder>>,
    ) -> Self {
        let payments: Arc<dyn PaymentOperations> =
            Arc::new(PaymentCoordinator::new(repository.clone()));
        let invoices = Arc::new(InvoiceManager::new(
            repository.clone(),
            payments.clone(),
            default_invoice_due_days,
        ));
        let summaries = Arc::new(BillingSummaryBuilder::new(repository));

        Self {
            payments,
            invoices,
            summaries,
            clock,
            metrics,
        }
    }
}

/// Routes under `/api/v1`
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/families/:family_id/billing",
            get(routes::billing::get_family_billing),
        )
        .route(
            "/families/:family_id/payments",
            post(routes::payments::create_payment),
        )
        .route(
            "/families/:family_id/payments/preview",
            post(routes::payments::preview_payment),
        )
        .route(
            "/families/:family_id/pay-ahead",
            post(routes::payments::pay_ahead),
        )
        .route(
            "/payments/:payment_id/undo",
            post(routes::payments::undo_payment),
        )
        .route(
            "/counter-invoices",
            post(routes::invoices::create_counter_invoice),
        )
        .route(
            "/enrolments/:enrolment_id/invoices",
            post(routes::invoices::issue_enrolment_invoice),
        )
        .route(
            "/invoices/:invoice_id/cancel",
            post(routes::invoices::cancel_invoice),
        )
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::render_metrics))
        .nest("/api/v1", routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Parse an id taken from the request path.
pub(crate) fn parse_id<T>(field: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr<Err = uuid::Error>,
{
    raw.parse()
        .map_err(|e| BillingError::validation(field, format!("'{}' is not a valid id: {}", raw, e)))
}

pub(crate) fn parse_family_id(raw: &str) -> Result<FamilyId> {
    parse_id("familyId", raw)
}
