use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use axum_extra::extract::WithRejection;
use chrono::{SubsecRound, Utc};
use tracing::info;
use uuid::Uuid;

use flychat_gateway::error::blocking;
use flychat_gateway::{ChatError, Conflict, Identity, SessionGateway};
use flychat_types::api::{AuthResponse, CurrentUserResponse, LoginRequest, RegisterRequest};
use flychat_types::models::User;

use crate::error::{ApiError, ApiResult};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: SessionGateway,
}

const INVALID_CREDENTIALS: &str = "invalid username or password";

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<RegisterRequest>, ApiError>,
) -> ApiResult<impl IntoResponse> {
    let username = req.username.trim().to_string();
    let name_len = username.chars().count();
    if !(3..=32).contains(&name_len) {
        return Err(ChatError::validation("username must be between 3 and 32 characters").into());
    }
    if req.password.chars().count() < 6 {
        return Err(ChatError::validation("password must be at least 6 characters").into());
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ChatError::Persistence(anyhow::anyhow!("password hashing failed: {}", e)))?
        .to_string();

    let user = User {
        id: Uuid::new_v4(),
        username,
        password_hash,
        avatar: String::new(),
        created_at: Utc::now().trunc_subsecs(6),
    };

    let gateway = &state.gateway;
    let stored = user.clone();
    let inserted = blocking(gateway.store(), move |s| s.insert_user(&stored)).await?;
    if !inserted {
        return Err(Conflict::UsernameTaken.into());
    }

    let token = gateway.auth().issue(user.id, &user.username)?;
    info!("Registered {} ({})", user.username, user.id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user: user.profile(),
            token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<LoginRequest>, ApiError>,
) -> ApiResult<Json<AuthResponse>> {
    let gateway = &state.gateway;
    let username = req.username.trim().to_string();
    let user = blocking(gateway.store(), move |s| s.user_by_username(&username))
        .await?
        .ok_or_else(|| ChatError::authentication(INVALID_CREDENTIALS))?;

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| ChatError::Persistence(anyhow::anyhow!("stored hash for {} is corrupt: {}", user.id, e)))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ChatError::authentication(INVALID_CREDENTIALS))?;

    let token = gateway.auth().issue(user.id, &user.username)?;
    info!("{} ({}) logged in", user.username, user.id);

    Ok(Json(AuthResponse {
        user: user.profile(),
        token,
    }))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<CurrentUserResponse>> {
    let user_id = identity.user_id;
    let user = blocking(state.gateway.store(), move |s| s.user_by_id(user_id))
        .await?
        .ok_or(ApiError(ChatError::NotFound("user")))?;

    Ok(Json(CurrentUserResponse { user: user.profile() }))
}
