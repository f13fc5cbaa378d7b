//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::auth::TokenAuth;
use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::sessions::SessionRegistry;

/// Shared application state for the termrelay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Visitors, their terminals and bound connections.
    pub registry: SessionRegistry,
    /// Access tokens and authorized reconnect identities.
    pub auth: Arc<TokenAuth>,
    /// Failed-handshake throttling per source address.
    pub rate_limiter: Arc<RateLimiter>,
    /// Cancelled on shutdown; open connections close when it fires.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: SessionRegistry,
        auth: Arc<TokenAuth>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            auth,
            rate_limiter,
            shutdown: CancellationToken::new(),
        }
    }
}
