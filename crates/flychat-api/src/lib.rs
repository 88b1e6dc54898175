pub mod auth;
pub mod error;
pub mod friends;
pub mod messages;
pub mod middleware;
pub mod users;

use axum::{
    Router,
    routing::{get, post, put},
};

use crate::auth::AppState;
use crate::middleware::require_auth;

/// The `/api` HTTP surface. Everything except register and login requires a
/// bearer token.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/messages/group", get(messages::group_messages))
        .route("/messages/private/{user_id}", get(messages::private_messages))
        .route("/messages/unread", get(messages::unread_counts))
        .route("/users/search", get(users::search))
        .route("/friends", get(friends::list_friends))
        .route("/friends/request", post(friends::send_request))
        .route("/friends/request/{request_id}", put(friends::respond))
        .route("/friends/requests/pending", get(friends::pending_requests))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .nest("/api", public_routes.merge(protected_routes))
        .with_state(state)
}
