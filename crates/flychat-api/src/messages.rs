use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use axum_extra::extract::WithRejection;
use uuid::Uuid;

use flychat_gateway::Identity;
use flychat_types::api::{PageQuery, UnreadCountsResponse};
use flychat_types::events::HistoryPage;
use flychat_types::models::ChatTarget;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

pub async fn group_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    WithRejection(Query(query), _): WithRejection<Query<PageQuery>, ApiError>,
) -> ApiResult<Json<HistoryPage>> {
    let page = state
        .gateway
        .history()
        .page(ChatTarget::Group, query.page, query.limit, identity.user_id)
        .await?;
    Ok(Json(page))
}

/// Loading a private page marks the caller's incoming messages on it read.
pub async fn private_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    WithRejection(Path(peer), _): WithRejection<Path<Uuid>, ApiError>,
    WithRejection(Query(query), _): WithRejection<Query<PageQuery>, ApiError>,
) -> ApiResult<Json<HistoryPage>> {
    let page = state
        .gateway
        .history()
        .page(ChatTarget::User(peer), query.page, query.limit, identity.user_id)
        .await?;
    Ok(Json(page))
}

pub async fn unread_counts(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<UnreadCountsResponse>> {
    let unread_counts = state.gateway.history().unread_counts(identity.user_id).await?;
    Ok(Json(UnreadCountsResponse { unread_counts }))
}
