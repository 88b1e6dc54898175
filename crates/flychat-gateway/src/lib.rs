pub mod auth;
pub mod connection;
pub mod error;
pub mod friends;
pub mod history;
pub mod presence;
pub mod router;
pub mod session;

pub use auth::{AuthService, Identity, JwtAuthService};
pub use error::{ChatError, ChatResult, Conflict};
pub use presence::{ConnectionHandle, DeliveryError, PresenceRegistry};
pub use session::{GatewaySettings, Session, SessionGateway, SessionState};
