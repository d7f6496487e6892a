// Multi-tenant client-token auth gate (§4.13). Verifies an incoming
// "sk-prx-..." key against the persisted token table and checks
// status/expiry/quota/IP-allowlist/model-allowlist before the request
// reaches the relay.

use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::store::{ClientToken, Store, TokenStatus, User};

const TOKEN_PREFIX: &str = "sk-prx-";

/// Generate a new client token: returns the plaintext (shown once to the
/// caller) and its SHA-256 hash (the only thing persisted).
///
/// `Store::get_token` looks a token up by a single hash argument, which
/// means the hash has to be deterministic — a salted KDF like argon2 can't
/// be looked up this way, only linearly scanned, so this uses a plain
/// digest instead.
pub fn generate_token() -> anyhow::Result<(String, String)> {
    use rand::{distributions::Alphanumeric, Rng};
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    let plaintext = format!("{TOKEN_PREFIX}{suffix}");
    let hash = hash_token(&plaintext);
    Ok((plaintext, hash))
}

pub fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the bearer/x-api-key credential from request headers, the way
/// the teacher's single-key check did, generalized to return the raw
/// string instead of comparing against one static key.
pub fn extract_key<'a>(authorization: Option<&'a str>, x_api_key: Option<&'a str>) -> Option<&'a str> {
    if let Some(auth) = authorization {
        if let Some(key) = auth.strip_prefix("Bearer ") {
            return Some(key);
        }
    }
    x_api_key
}

/// The outcome of a successful gate check: the token and its owning user,
/// ready for the relay to consume (and later decrement/increment).
#[derive(Clone)]
pub struct AuthContext {
    pub token: ClientToken,
    pub user: User,
}

/// Validate a presented client key against the store: hash it, look the
/// token up directly, then check status/expiry/IP/model/quota.
pub async fn authenticate(
    store: &dyn Store,
    presented_key: &str,
    requested_model: Option<&str>,
    client_ip: Option<&str>,
) -> Result<AuthContext, ApiError> {
    let hash = hash_token(presented_key);

    let token = store
        .get_token(&hash)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::AuthError("Invalid or missing API Key".to_string()))?;

    match token.status {
        TokenStatus::Disabled => return Err(ApiError::AuthError("Token disabled".to_string())),
        TokenStatus::Expired => return Err(ApiError::AuthError("Token expired".to_string())),
        TokenStatus::Exhausted => return Err(ApiError::QuotaExhausted("Token quota exhausted".to_string())),
        TokenStatus::Active => {}
    }

    let now = crate::utils::now_epoch_secs();
    if token.is_expired(now) {
        return Err(ApiError::AuthError("Token expired".to_string()));
    }

    if !token.allows_ip(client_ip) {
        return Err(ApiError::AuthError("Token not allowed from this IP".to_string()));
    }

    if !token.allows_model(requested_model) {
        return Err(ApiError::AuthError("Token not allowed to use this model".to_string()));
    }

    let user = store
        .get_user(&token.user_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::AuthError("Token owner not found".to_string()))?;

    if let Some(remaining) = user.remaining_quota {
        if remaining <= 0.0 {
            return Err(ApiError::QuotaExhausted("User quota exhausted".to_string()));
        }
    }

    Ok(AuthContext { token, user })
}
