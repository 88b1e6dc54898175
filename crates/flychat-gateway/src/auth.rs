use chrono::Duration;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use flychat_types::api::Claims;

use crate::error::{ChatError, ChatResult};

/// The authenticated party behind a connection or HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// Issues and validates bearer credentials.
pub trait AuthService: Send + Sync {
    fn issue(&self, user_id: Uuid, username: &str) -> ChatResult<String>;

    /// Resolves a credential to the user it was issued for. Whether that
    /// user still exists is the caller's concern.
    fn verify(&self, token: &str) -> ChatResult<Uuid>;
}

/// HS256 JWTs carrying [`Claims`].
pub struct JwtAuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl JwtAuthService {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }
}

impl AuthService for JwtAuthService {
    fn issue(&self, user_id: Uuid, username: &str) -> ChatResult<String> {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp: (chrono::Utc::now() + self.ttl).timestamp() as usize,
        };

        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ChatError::Persistence(anyhow::anyhow!("token signing failed: {}", e)))
    }

    fn verify(&self, token: &str) -> ChatResult<Uuid> {
        let token_data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|_| ChatError::authentication("invalid or expired token"))?;
        Ok(token_data.claims.sub)
    }
}
