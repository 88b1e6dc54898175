use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;

use flychat_gateway::Identity;
use flychat_types::api::{
    FriendsResponse, PendingRequestsResponse, RespondFriendRequestBody, SendFriendRequestBody,
};
use flychat_types::models::FriendRequest;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

pub async fn send_request(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    WithRejection(Json(body), _): WithRejection<Json<SendFriendRequestBody>, ApiError>,
) -> ApiResult<impl IntoResponse> {
    let request = state
        .gateway
        .friends()
        .send_request(&identity, body.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn respond(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    WithRejection(Path(request_id), _): WithRejection<Path<i64>, ApiError>,
    WithRejection(Json(body), _): WithRejection<Json<RespondFriendRequestBody>, ApiError>,
) -> ApiResult<Json<FriendRequest>> {
    let request = state
        .gateway
        .friends()
        .respond(request_id, &identity, body.accept)
        .await?;
    Ok(Json(request))
}

pub async fn list_friends(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<FriendsResponse>> {
    let friends = state.gateway.friends().friends_of(identity.user_id).await?;
    Ok(Json(FriendsResponse { friends }))
}

pub async fn pending_requests(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<PendingRequestsResponse>> {
    let requests = state
        .gateway
        .friends()
        .pending_requests_for(identity.user_id)
        .await?;
    Ok(Json(PendingRequestsResponse { requests }))
}
