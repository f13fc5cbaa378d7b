//! Access tokens: issuance, rotation with grace, and one-time consumption.
//!
//! ## Token lifecycle
//!
//! ```text
//! issue ──▶ active ──rotate──▶ superseded (grace) ──grace expires──▶ expired
//!              │
//!              └── lifetime elapses ──▶ expired
//! ```
//!
//! In one-time mode a token is bound to the first visitor identity that
//! presents it. That identity is marked authorized and may reconnect later
//! without any token; any other identity presenting the same token is
//! rejected. Authorized identities survive rotation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AuthError;
use crate::util::now_ms;

/// Random bytes per token; 24 bytes encode to 32 URL-safe characters.
const TOKEN_BYTES: usize = 24;

/// Generate a high-entropy URL-safe token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the token length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Lifetime info exposed to clients for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    /// Epoch ms when the active token was issued.
    pub created_at: u64,
    /// Epoch ms when the active token stops being accepted.
    pub expires_at: u64,
    /// Milliseconds until expiry (0 when already expired).
    pub remaining_ms: u64,
}

struct IssuedToken {
    value: String,
    issued_at: Instant,
    issued_at_ms: u64,
    /// Identity that consumed this token (one-time mode).
    consumed_by: Option<String>,
}

impl IssuedToken {
    fn new(value: String) -> Self {
        Self {
            value,
            issued_at: Instant::now(),
            issued_at_ms: now_ms(),
            consumed_by: None,
        }
    }

    fn matches(&self, provided: &str) -> bool {
        constant_time_eq(self.value.as_bytes(), provided.as_bytes())
    }
}

struct TokenState {
    active: IssuedToken,
    /// Previous token and the instant its grace period ends.
    previous: Option<(IssuedToken, Instant)>,
    authorized: HashSet<String>,
}

enum Slot {
    Active,
    Previous,
}

/// Token store shared by the dispatcher and the rotation task.
pub struct TokenAuth {
    state: RwLock<TokenState>,
    lifetime: Duration,
    one_time: bool,
}

impl TokenAuth {
    /// Issue a fresh random token.
    pub fn new(lifetime: Duration, one_time: bool) -> Self {
        Self::with_token(generate_token(), lifetime, one_time)
    }

    /// Start with a caller-supplied token (from config).
    pub fn with_token(token: String, lifetime: Duration, one_time: bool) -> Self {
        Self {
            state: RwLock::new(TokenState {
                active: IssuedToken::new(token),
                previous: None,
                authorized: HashSet::new(),
            }),
            lifetime,
            one_time,
        }
    }

    /// Current active token (for building the access URL).
    pub async fn token(&self) -> String {
        self.state.read().await.active.value.clone()
    }

    /// Classify `provided` against the active and superseded tokens.
    fn check(&self, state: &TokenState, provided: &str) -> Result<Slot, AuthError> {
        if provided.is_empty() {
            return Err(AuthError::Missing);
        }
        let now = Instant::now();
        if state.active.matches(provided) {
            if now.duration_since(state.active.issued_at) < self.lifetime {
                return Ok(Slot::Active);
            }
            return Err(AuthError::Expired);
        }
        if let Some((prev, grace_until)) = &state.previous {
            if prev.matches(provided) {
                if now < *grace_until {
                    return Ok(Slot::Previous);
                }
                return Err(AuthError::Expired);
            }
        }
        Err(AuthError::Invalid)
    }

    /// Whether `provided` is currently accepted, ignoring consumption.
    pub async fn validate(&self, provided: &str) -> bool {
        let state = self.state.read().await;
        self.check(&state, provided).is_ok()
    }

    /// Validate `provided` for `identity` and, on success, mark the identity
    /// authorized. In one-time mode the token is consumed by the first identity
    /// and rejected for every other identity afterwards.
    pub async fn authorize(&self, provided: &str, identity: &str) -> Result<(), AuthError> {
        let mut state = self.state.write().await;
        let slot = self.check(&state, provided)?;

        if self.one_time {
            let token = match slot {
                Slot::Active => &mut state.active,
                Slot::Previous => match state.previous.as_mut() {
                    Some((prev, _)) => prev,
                    None => return Err(AuthError::Invalid),
                },
            };
            match &token.consumed_by {
                Some(owner) if owner != identity => return Err(AuthError::AlreadyConsumed),
                Some(_) => {}
                None => token.consumed_by = Some(identity.to_string()),
            }
        }

        state.authorized.insert(identity.to_string());
        Ok(())
    }

    /// Whether `identity` has already proven possession of a valid token.
    pub async fn is_authorized(&self, identity: &str) -> bool {
        self.state.read().await.authorized.contains(identity)
    }

    /// Forget an authorized identity; it must present a token again.
    pub async fn revoke(&self, identity: &str) -> bool {
        self.state.write().await.authorized.remove(identity)
    }

    /// Supersede the active token and issue a new one. The old token stays
    /// valid for `grace`. Returns the new token.
    pub async fn rotate(&self, grace: Duration) -> String {
        let mut state = self.state.write().await;
        let fresh = IssuedToken::new(generate_token());
        let value = fresh.value.clone();
        let old = std::mem::replace(&mut state.active, fresh);
        state.previous = Some((old, Instant::now() + grace));
        value
    }

    /// Lifetime of the active token. Never mutates state.
    pub async fn token_info(&self) -> TokenInfo {
        let state = self.state.read().await;
        #[allow(clippy::cast_possible_truncation)]
        let lifetime_ms = self.lifetime.as_millis() as u64;
        let elapsed = Instant::now().duration_since(state.active.issued_at);
        #[allow(clippy::cast_possible_truncation)]
        let remaining_ms = self.lifetime.saturating_sub(elapsed).as_millis() as u64;
        TokenInfo {
            created_at: state.active.issued_at_ms,
            expires_at: state.active.issued_at_ms.saturating_add(lifetime_ms),
            remaining_ms,
        }
    }

    /// Spawn the periodic rotation task. It stops when `cancel` fires.
    ///
    /// `on_rotate` receives each new token (the binary logs the new access URL).
    pub fn spawn_rotation<F>(
        self: Arc<Self>,
        interval: Duration,
        grace: Duration,
        cancel: CancellationToken,
        on_rotate: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&str) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let token = self.rotate(grace).await;
                        info!("Access token rotated (previous valid for {}s)", grace.as_secs());
                        on_rotate(&token);
                    }
                }
            }
        })
    }

    /// Warn once at startup when the lifetime cannot be covered by rotation.
    pub fn check_rotation_covers_lifetime(&self, rotation: Option<Duration>) {
        match rotation {
            None => warn!(
                "Token rotation disabled; the access token expires after {}s",
                self.lifetime.as_secs()
            ),
            Some(interval) if interval > self.lifetime => warn!(
                "Rotation interval ({}s) exceeds token lifetime ({}s); tokens will lapse between rotations",
                interval.as_secs(),
                self.lifetime.as_secs()
            ),
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn test_generated_tokens_are_url_safe_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_active_until_lifetime() {
        let auth = TokenAuth::with_token("tok".into(), HOUR, true);
        assert!(auth.validate("tok").await);
        assert!(!auth.validate("nope").await);
        assert!(!auth.validate("").await);

        tokio::time::advance(HOUR - Duration::from_secs(1)).await;
        assert!(auth.validate("tok").await);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!auth.validate("tok").await);
        assert_eq!(
            auth.authorize("tok", "visitor-a").await,
            Err(AuthError::Expired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_grace_period() {
        let auth = TokenAuth::with_token("old".into(), HOUR, false);
        let new = auth.rotate(Duration::from_secs(60)).await;
        assert_ne!(new, "old");
        assert_eq!(auth.token().await, new);
        assert!(auth.validate("old").await);
        assert!(auth.validate(&new).await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!auth.validate("old").await);
        assert!(auth.validate(&new).await);
    }

    #[tokio::test]
    async fn test_one_time_token_binds_first_identity() {
        let auth = TokenAuth::with_token("tok".into(), HOUR, true);
        assert_eq!(auth.authorize("tok", "visitor-a").await, Ok(()));
        assert!(auth.is_authorized("visitor-a").await);

        // Same identity may present it again.
        assert_eq!(auth.authorize("tok", "visitor-a").await, Ok(()));
        // Anyone else is rejected even though the token itself is still valid.
        assert_eq!(
            auth.authorize("tok", "visitor-b").await,
            Err(AuthError::AlreadyConsumed)
        );
        assert!(!auth.is_authorized("visitor-b").await);
        assert!(auth.validate("tok").await);
    }

    #[tokio::test]
    async fn test_shared_mode_accepts_many_identities() {
        let auth = TokenAuth::with_token("tok".into(), HOUR, false);
        assert_eq!(auth.authorize("tok", "visitor-a").await, Ok(()));
        assert_eq!(auth.authorize("tok", "visitor-b").await, Ok(()));
    }

    #[tokio::test]
    async fn test_rotation_issues_fresh_consumable_token() {
        let auth = TokenAuth::with_token("tok".into(), HOUR, true);
        auth.authorize("tok", "visitor-a").await.unwrap();
        let fresh = auth.rotate(Duration::from_secs(60)).await;

        // Superseded token keeps its owner during grace.
        assert_eq!(
            auth.authorize("tok", "visitor-b").await,
            Err(AuthError::AlreadyConsumed)
        );
        assert_eq!(auth.authorize(&fresh, "visitor-b").await, Ok(()));
        // A survives rotation.
        assert!(auth.is_authorized("visitor-a").await);
    }

    #[tokio::test]
    async fn test_revoke() {
        let auth = TokenAuth::with_token("tok".into(), HOUR, true);
        auth.authorize("tok", "visitor-a").await.unwrap();
        assert!(auth.revoke("visitor-a").await);
        assert!(!auth.is_authorized("visitor-a").await);
        assert!(!auth.revoke("visitor-a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_info_is_read_only() {
        let auth = TokenAuth::with_token("tok".into(), HOUR, true);
        tokio::time::advance(Duration::from_secs(600)).await;
        let info = auth.token_info().await;
        assert_eq!(info.expires_at - info.created_at, 3_600_000);
        assert_eq!(info.remaining_ms, 3_000_000);
        assert_eq!(auth.token_info().await, info);
        assert!(auth.validate("tok").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_task_rotates_and_stops() {
        let auth = Arc::new(TokenAuth::with_token("tok".into(), HOUR, true));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let task = Arc::clone(&auth).spawn_rotation(
            Duration::from_secs(10),
            Duration::from_secs(5),
            cancel.clone(),
            move |t| {
                let _ = tx.send(t.to_string());
            },
        );

        let rotated = rx.recv().await.unwrap();
        assert_eq!(auth.token().await, rotated);
        assert!(auth.validate("tok").await);

        cancel.cancel();
        task.await.unwrap();
    }
}
