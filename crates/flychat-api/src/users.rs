use axum::{
    Extension, Json,
    extract::{Query, State},
};
use axum_extra::extract::WithRejection;

use flychat_gateway::Identity;
use flychat_gateway::error::blocking;
use flychat_types::api::{SearchQuery, SearchResponse};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

const MAX_SEARCH_RESULTS: u32 = 50;

/// Case-insensitive username substring search, never including the caller.
pub async fn search(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    WithRejection(Query(query), _): WithRejection<Query<SearchQuery>, ApiError>,
) -> ApiResult<Json<SearchResponse>> {
    let keyword = query.keyword.trim().to_string();
    if keyword.is_empty() {
        return Ok(Json(SearchResponse { users: Vec::new() }));
    }

    let exclude = identity.user_id;
    let users = blocking(state.gateway.store(), move |s| {
        s.search_users(&keyword, exclude, MAX_SEARCH_RESULTS)
    })
    .await?;

    Ok(Json(SearchResponse {
        users: users.iter().map(|u| u.profile()).collect(),
    }))
}
