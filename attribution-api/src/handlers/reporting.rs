use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use attribution_common::identity::{IdentityEdge, IdentityError, MatchCandidate};
use attribution_common::pipeline::ConversionPipeline;
use attribution_common::queue::{QueueError, QueueItem};
use attribution_common::reporting::{
    delivery_stats, identity_summary, order_view, DeliveryReport, IdentitySummary, OrderView,
};

use super::{api_error, bad_request, internal_error, not_found, ApiError};

pub async fn get_order(
    State(pipeline): State<ConversionPipeline>,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderView>, ApiError> {
    order_view(&**pipeline.store(), order_id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found("order has no recorded conversion"))
}

pub async fn get_identity(
    State(pipeline): State<ConversionPipeline>,
    Path(email_hash): Path<String>,
) -> Result<Json<IdentitySummary>, ApiError> {
    identity_summary(pipeline.identity(), &email_hash)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found("no visitor is linked to this email"))
}

pub async fn get_matches(
    State(pipeline): State<ConversionPipeline>,
    Path(visitor_id): Path<String>,
) -> Result<Json<Vec<MatchCandidate>>, ApiError> {
    pipeline
        .identity()
        .find_potential_matches(&visitor_id)
        .await
        .map(Json)
        .map_err(internal_error)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MergeRequest {
    pub primary: String,
    pub secondary: String,
}

pub async fn post_merge(
    State(pipeline): State<ConversionPipeline>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<IdentityEdge>, ApiError> {
    match pipeline
        .identity()
        .merge_visitors(&request.primary, &request.secondary)
        .await
    {
        Ok(edge) => Ok(Json(edge)),
        Err(e @ (IdentityError::SameVisitor(_) | IdentityError::PrimaryNotIdentified(_))) => {
            Err(bad_request(&e.to_string()))
        }
        Err(e) => Err(internal_error(e)),
    }
}

pub async fn get_stats(
    State(pipeline): State<ConversionPipeline>,
) -> Result<Json<DeliveryReport>, ApiError> {
    let dispatcher = pipeline.dispatcher();

    delivery_stats(dispatcher.queue(), dispatcher.delivery_log())
        .await
        .map(Json)
        .map_err(internal_error)
}

pub async fn post_cancel(
    State(pipeline): State<ConversionPipeline>,
    Path(id): Path<i64>,
) -> Result<Json<QueueItem>, ApiError> {
    match pipeline.dispatcher().queue().cancel(id).await {
        Ok(item) => Ok(Json(item)),
        Err(e @ QueueError::NotFound(_)) => Err(not_found(&e.to_string())),
        Err(e @ (QueueError::NotPending { .. } | QueueError::ClaimLost(_))) => {
            Err(api_error(axum::http::StatusCode::CONFLICT, &e.to_string()))
        }
        Err(e) => Err(internal_error(e)),
    }
}
