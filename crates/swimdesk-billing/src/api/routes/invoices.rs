use crate::api::types::{
    CounterInvoiceResponse, CreateCounterInvoiceRequest, InvoiceDto, IssueInvoiceRequest,
};
use crate::api::{parse_id, AppState};
use crate::domain::types::{EnrolmentId, InvoiceId};
use crate::error::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

pub async fn create_counter_invoice(
    State(state): State<AppState>,
    Json(body): Json<CreateCounterInvoiceRequest>,
) -> Result<(StatusCode, Json<CounterInvoiceResponse>)> {
    let receipt = state
        .invoices
        .create_counter_invoice(body.into(), state.clock.now())
        .await?;
    Ok((StatusCode::CREATED, Json(receipt.into())))
}

pub async fn issue_enrolment_invoice(
    State(state): State<AppState>,
    Path(enrolment_id): Path<String>,
    Json(body): Json<IssueInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceDto>)> {
    let enrolment_id: EnrolmentId = parse_id("enrolmentId", &enrolment_id)?;

    let invoice = state
        .invoices
        .issue_enrolment_invoice(&enrolment_id, body.quantity, body.due_at, state.clock.now())
        .await?;
    Ok((StatusCode::CREATED, Json(InvoiceDto::from(&invoice))))
}

pub async fn cancel_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<Json<InvoiceDto>> {
    let invoice_id: InvoiceId = parse_id("invoiceId", &invoice_id)?;

    let invoice = state
        .invoices
        .cancel_invoice(&invoice_id, state.clock.now())
        .await?;
    Ok(Json(InvoiceDto::from(&invoice)))
}
