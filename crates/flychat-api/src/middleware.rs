use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};

use flychat_gateway::ChatError;

use crate::auth::AppState;
use crate::error::ApiError;

/// Resolve the bearer token to an [`Identity`](flychat_gateway::Identity)
/// and attach it to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let TypedHeader(Authorization(bearer)) =
        bearer.ok_or_else(|| ChatError::authentication("missing bearer token"))?;

    let identity = state.gateway.authenticate(bearer.token()).await?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
