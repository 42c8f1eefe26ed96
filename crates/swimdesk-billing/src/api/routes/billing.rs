use crate::api::types::BillingSummaryResponse;
use crate::api::{parse_family_id, AppState};
use crate::error::Result;
use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::debug;

pub async fn get_family_billing(
    State(state): State<AppState>,
    Path(family_id): Path<String>,
) -> Result<Json<BillingSummaryResponse>> {
    let family_id = parse_family_id(&family_id)?;
    debug!(family_id = %family_id, "Building billing summary");

    let summary = state.summaries.build(&family_id, state.clock.now()).await?;
    Ok(Json(summary.into()))
}
