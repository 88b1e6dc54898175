mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use flychat_api::auth::{AppState, AppStateInner};
use flychat_db::{Database, MemoryStore, Store};
use flychat_gateway::{JwtAuthService, SessionGateway, connection};

use crate::config::{Config, StoreKind};

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "flychat_server=debug,flychat_gateway=debug,flychat_api=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;
    if config.uses_dev_secret() {
        warn!("FLYCHAT_JWT_SECRET is not set, using the development secret");
    }

    // Init store
    let store: Arc<dyn Store> = match &config.store {
        StoreKind::Sqlite(path) => Arc::new(Database::open(path)?),
        StoreKind::Memory => {
            info!("Using in-memory store, nothing will be persisted");
            Arc::new(MemoryStore::new())
        }
    };

    let auth = Arc::new(JwtAuthService::new(
        &config.jwt_secret,
        chrono::Duration::days(config.token_ttl_days),
    ));
    let gateway = SessionGateway::new(store, auth, config.gateway.clone());

    let dangling = gateway.friends().dangling_acceptances().await?;
    for request in &dangling {
        warn!(
            "Friend request {} ({} -> {}) is accepted but has no friendship",
            request.id, request.from_id, request.to_id
        );
    }

    let app_state: AppState = Arc::new(AppStateInner {
        gateway: gateway.clone(),
    });

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    let app = flychat_api::router(app_state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("flychat server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("flychat server stopped");
    Ok(())
}

/// A credential on the upgrade request is checked before upgrading;
/// without one the socket must send `identify` first.
async fn ws_upgrade(
    State(gateway): State<SessionGateway>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer
        .map(|TypedHeader(Authorization(bearer))| bearer.token().to_string())
        .or(query.token);

    match token {
        Some(token) => match gateway.authenticate(&token).await {
            Ok(identity) => ws
                .on_upgrade(move |socket| connection::handle_connection_authenticated(socket, gateway, identity))
                .into_response(),
            Err(e) => {
                warn!("Rejected gateway upgrade: {}", e);
                (StatusCode::UNAUTHORIZED, e.user_message()).into_response()
            }
        },
        None => ws
            .on_upgrade(move |socket| connection::handle_connection(socket, gateway))
            .into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
