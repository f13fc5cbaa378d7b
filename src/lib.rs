#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! termrelay library: the building blocks behind the `termrelay` binary.
//!
//! - `auth` - access tokens, rotation and authorized reconnect identities
//! - `rate_limit` - failed-handshake throttling per source address
//! - `sessions` - visitors, terminals, replay buffers and fan-out
//! - `multiplexer` - tmux discovery and session control
//! - `protocol` - WebSocket message types
//! - `ws` - WebSocket handshake and message dispatch
//! - `tunnel` - public reachability of the listener

pub mod auth;
pub mod config;
pub mod error;
pub mod multiplexer;
pub mod protocol;
pub mod rate_limit;
pub mod routes;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod tunnel;
pub mod util;
pub mod ws;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use sessions::SessionRegistry;
pub use state::AppState;

/// Build the HTTP router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the WebSocket
/// handler can see the peer address.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
