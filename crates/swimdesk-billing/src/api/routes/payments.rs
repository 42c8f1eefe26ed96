use crate::api::types::{
    CreatePaymentRequest, PayAheadRequestDto, PaymentPreviewResponse, PaymentResponse,
    UndoPaymentResponse,
};
use crate::api::{parse_family_id, parse_id, AppState};
use crate::domain::types::PaymentId;
use crate::error::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use tracing::info;

pub async fn create_payment(
    State(state): State<AppState>,
    Path(family_id): Path<String>,
    Json(body): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>)> {
    let family_id = parse_family_id(&family_id)?;
    let request = body.into_request(family_id)?;

    let receipt = state
        .payments
        .submit_payment(request, state.clock.now())
        .await?;

    // A replayed key is answered with the original payment
    let status = if receipt.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt.into())))
}

pub async fn preview_payment(
    State(state): State<AppState>,
    Path(family_id): Path<String>,
    Json(body): Json<CreatePaymentRequest>,
) -> Result<Json<PaymentPreviewResponse>> {
    let family_id = parse_family_id(&family_id)?;
    let amount = body.amount()?;
    let target = body.target()?;

    let preview = state
        .payments
        .preview(&family_id, amount, &target, state.clock.now())
        .await?;
    Ok(Json(preview.into()))
}

pub async fn pay_ahead(
    State(state): State<AppState>,
    Path(family_id): Path<String>,
    Json(body): Json<PayAheadRequestDto>,
) -> Result<(StatusCode, Json<PaymentResponse>)> {
    let family_id = parse_family_id(&family_id)?;
    let request = body.into_request(family_id)?;

    let receipt = state
        .payments
        .pay_ahead_and_pay(request, state.clock.now())
        .await?;

    let status = if receipt.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt.into())))
}

pub async fn undo_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Json<UndoPaymentResponse>> {
    let payment_id: PaymentId = parse_id("paymentId", &payment_id)?;
    info!(payment_id = %payment_id, "Undo requested");

    let receipt = state
        .payments
        .undo_payment(&payment_id, state.clock.now())
        .await?;
    Ok(Json(receipt.into()))
}
