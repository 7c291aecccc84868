use crate::error::{Error, Result};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Secret every hive client is configured with for its engine API.
pub const ENGINE_SECRET: [u8; 32] = *b"secretsecretsecretsecretsecretse";

/// The engine API only looks at the issue time.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: u64,
}

/// Builds an HS256 token issued at `issued_at` (unix seconds).
pub fn engine_token(secret: &[u8], issued_at: u64) -> Result<String> {
    let claims = Claims { iat: issued_at };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| Error::Config(format!("can't sign engine API token: {e}")))
}

pub fn engine_token_now() -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    engine_token(&ENGINE_SECRET, now)
}
