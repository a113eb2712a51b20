//! Anthropic OAuth token lifecycle.
//!
//! Access tokens are stored encrypted and served from a short-lived in-memory
//! cache. When a token is within the expiry skew, callers funnel through a
//! per-user single-flight refresh: the first arrival POSTs the token
//! endpoint, every concurrent caller for the same user shares that one
//! outcome. A background task sweeps all connected users on a long interval;
//! refresh-on-demand alone is also correct.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::warn;

use crate::constants::{
    ANTHROPIC_TOKEN_URL, OAUTH_CACHE_TTL_SECS, OAUTH_CLIENT_ID, OAUTH_EXPIRY_SKEW_SECS,
    OAUTH_REFRESH_INTERVAL_SECS, OAUTH_STATE_TTL_SECS,
};
use crate::crypto::Crypto;
use crate::error::GatewayError;
use crate::store::{OAuthTokenRecord, StoreClient};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone)]
struct CachedAccess {
    token: String,
    /// Epoch milliseconds; `None` when the upstream never told us.
    expires_at: Option<u64>,
    cached_at: Instant,
}

impl CachedAccess {
    fn usable(&self) -> bool {
        self.cached_at.elapsed().as_secs() < OAUTH_CACHE_TTL_SECS && !near_expiry(self.expires_at)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn near_expiry(expires_at: Option<u64>) -> bool {
    expires_at.is_some_and(|e| now_millis() + OAUTH_EXPIRY_SKEW_SECS * 1000 >= e)
}

type SharedOutcome = Option<Result<String, String>>;

pub struct OAuthManager {
    store: Arc<StoreClient>,
    crypto: Arc<Crypto>,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, CachedAccess>>,
    /// userId → receiver for the in-flight refresh. Check-then-insert is
    /// guarded by the map lock; the refresh itself runs outside it.
    in_flight: Mutex<HashMap<String, watch::Receiver<SharedOutcome>>>,
}

impl OAuthManager {
    pub fn new(store: Arc<StoreClient>, crypto: Arc<Crypto>, http: reqwest::Client) -> Self {
        Self {
            store,
            crypto,
            http,
            cache: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_configured(&self, user_id: &str) -> bool {
        matches!(self.store.get_oauth_tokens(user_id).await, Ok(Some(_)))
    }

    /// Current access token for a user, refreshing through the single-flight
    /// path when it is close to expiry.
    pub async fn get_access_token(&self, user_id: &str) -> Result<String, GatewayError> {
        if let Some(cached) = self.cache.read().await.get(user_id)
            && cached.usable()
        {
            return Ok(cached.token.clone());
        }

        let record = self
            .store
            .get_oauth_tokens(user_id)
            .await?
            .ok_or_else(|| {
                GatewayError::Unauthorized("Anthropic account is not connected".into())
            })?;

        if !near_expiry(record.expires_at) {
            let access = self
                .crypto
                .decrypt(&record.encrypted_access_token, &record.access_token_iv)?;
            self.cache.write().await.insert(
                user_id.to_string(),
                CachedAccess {
                    token: access.clone(),
                    expires_at: record.expires_at,
                    cached_at: Instant::now(),
                },
            );
            return Ok(access);
        }

        self.refresh_single_flight(user_id, &record).await
    }

    async fn refresh_single_flight(
        &self,
        user_id: &str,
        record: &OAuthTokenRecord,
    ) -> Result<String, GatewayError> {
        let tx = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(rx) = in_flight.get(user_id) {
                let rx = rx.clone();
                drop(in_flight);
                return Self::await_shared(rx).await;
            }
            let (tx, rx) = watch::channel(None);
            in_flight.insert(user_id.to_string(), rx);
            tx
        };

        let outcome = self.refresh(user_id, record).await;

        let shared = match &outcome {
            Ok(token) => Ok(token.clone()),
            Err(e) => Err(e.to_string()),
        };
        let _ = tx.send(Some(shared));
        self.in_flight.lock().await.remove(user_id);

        outcome
    }

    async fn await_shared(
        mut rx: watch::Receiver<SharedOutcome>,
    ) -> Result<String, GatewayError> {
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome.map_err(GatewayError::Unauthorized);
            }
            if rx.changed().await.is_err() {
                return Err(GatewayError::provider("Token refresh was aborted"));
            }
        }
    }

    async fn refresh(
        &self,
        user_id: &str,
        record: &OAuthTokenRecord,
    ) -> Result<String, GatewayError> {
        let refresh_token = self
            .crypto
            .decrypt(&record.encrypted_refresh_token, &record.refresh_token_iv)?;

        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": OAUTH_CLIENT_ID,
        });

        let response = self
            .http
            .post(ANTHROPIC_TOKEN_URL)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::provider(format!("Failed to reach token endpoint: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Unauthorized(format!(
                "Token refresh failed ({status}): {text}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            GatewayError::provider(format!("Failed to parse token response: {e}"))
        })?;

        let new_refresh = token.refresh_token.unwrap_or(refresh_token);
        self.store_tokens(user_id, &token.access_token, &new_refresh, token.expires_in)
            .await?;

        Ok(token.access_token)
    }

    /// Encrypt and persist a token pair, updating the in-memory cache.
    pub async fn store_tokens(
        &self,
        user_id: &str,
        access: &str,
        refresh: &str,
        expires_in: Option<u64>,
    ) -> Result<(), GatewayError> {
        let sealed_access = self.crypto.encrypt(access)?;
        let sealed_refresh = self.crypto.encrypt(refresh)?;
        let expires_at = expires_in.map(|secs| now_millis() + secs * 1000);
        let now = Utc::now();

        self.store
            .upsert_oauth_tokens(&OAuthTokenRecord {
                user_id: user_id.to_string(),
                encrypted_access_token: sealed_access.blob,
                access_token_iv: sealed_access.iv,
                encrypted_refresh_token: sealed_refresh.blob,
                refresh_token_iv: sealed_refresh.iv,
                expires_at,
                created_at: now,
                updated_at: now,
            })
            .await?;

        self.cache.write().await.insert(
            user_id.to_string(),
            CachedAccess {
                token: access.to_string(),
                expires_at,
                cached_at: Instant::now(),
            },
        );

        Ok(())
    }

    /// Exchange an authorization code (PKCE) and persist the token pair.
    pub async fn exchange_code(
        &self,
        user_id: &str,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<(), GatewayError> {
        // The pasted code may arrive as "code#state"
        let (code, state) = code.split_once('#').unwrap_or((code, ""));

        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "state": state,
            "client_id": OAUTH_CLIENT_ID,
            "redirect_uri": redirect_uri,
            "code_verifier": verifier,
        });

        let response = self
            .http
            .post(ANTHROPIC_TOKEN_URL)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::provider(format!("Failed to reach token endpoint: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::InvalidRequest(format!(
                "Token exchange failed ({status}): {text}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            GatewayError::provider(format!("Failed to parse token response: {e}"))
        })?;

        self.store_tokens(
            user_id,
            &token.access_token,
            token.refresh_token.as_deref().unwrap_or_default(),
            token.expires_in,
        )
        .await
    }

    /// Disconnect: remove stored tokens and drop the cache entry.
    pub async fn clear(&self, user_id: &str) -> Result<(), GatewayError> {
        self.store.delete_oauth_tokens(user_id).await?;
        self.cache.write().await.remove(user_id);
        Ok(())
    }

    /// Run the refresh path for every connected user, swallowing per-user
    /// errors.
    pub async fn refresh_all(&self) {
        let records = match self.store.list_all_oauth_tokens().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Background refresh could not list OAuth users: {e}");
                return;
            }
        };

        for record in records {
            if let Err(e) = self.get_access_token(&record.user_id).await {
                warn!("Background refresh failed for user {}: {e}", record.user_id);
            }
        }
    }
}

/// Periodic background refresh task. Detached for the process lifetime.
pub fn spawn_background_refresh(manager: Arc<OAuthManager>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            OAUTH_REFRESH_INTERVAL_SECS,
        ));
        interval.tick().await;
        loop {
            interval.tick().await;
            manager.refresh_all().await;
        }
    });
}

// ============================================================================
// PKCE pieces
// ============================================================================

/// 32 random bytes, base64url without padding.
pub fn generate_verifier() -> String {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url(SHA-256(verifier)).
pub fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// 16 random bytes, hex.
pub fn generate_state() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parked authorization state, sealed into a cookie between the redirect and
/// the callback. AEAD-sealing makes the cookie both confidential and signed.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub verifier: String,
    pub state: String,
    pub user_id: String,
    pub redirect_uri: String,
    /// Epoch seconds after which the callback must reject the cookie.
    pub expires_at: u64,
}

impl AuthState {
    pub fn new(verifier: String, state: String, user_id: String, redirect_uri: String) -> Self {
        Self {
            verifier,
            state,
            user_id,
            redirect_uri,
            expires_at: now_millis() / 1000 + OAUTH_STATE_TTL_SECS,
        }
    }

    pub fn seal(&self, crypto: &Crypto) -> Result<String, GatewayError> {
        let payload = serde_json::to_string(self)
            .map_err(|e| GatewayError::provider(format!("Failed to seal OAuth state: {e}")))?;
        let sealed = crypto.encrypt(&payload)?;
        Ok(format!("{}.{}", sealed.iv, sealed.blob))
    }

    pub fn open(cookie: &str, crypto: &Crypto) -> Result<Self, GatewayError> {
        let (iv, blob) = cookie
            .split_once('.')
            .ok_or_else(|| GatewayError::InvalidRequest("Malformed OAuth state cookie".into()))?;
        let payload = crypto
            .decrypt(blob, iv)
            .map_err(|_| GatewayError::InvalidRequest("Invalid OAuth state cookie".into()))?;
        let state: AuthState = serde_json::from_str(&payload)
            .map_err(|_| GatewayError::InvalidRequest("Invalid OAuth state cookie".into()))?;
        if now_millis() / 1000 > state.expires_at {
            return Err(GatewayError::InvalidRequest("OAuth state expired".into()));
        }
        Ok(state)
    }
}
