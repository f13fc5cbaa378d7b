#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # termrelay
//!
//! Shares the host's interactive shell with remote browsers over WebSocket.
//!
//! A visitor opens the printed access URL, authenticates once with the token,
//! and gets a set of PTY-backed terminals (plain shells or tmux sessions)
//! that survive reconnects: each terminal keeps a replay buffer that is sent
//! to every newly bound connection.
//!
//! ## Subcommands
//!
//! - `termrelay serve` (default) - run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path      | Auth    | Description                         |
//! |--------|-----------|---------|-------------------------------------|
//! | GET    | `/health` | No      | Liveness probe and registry totals  |
//! | GET    | `/ws`     | Token*  | WebSocket for visitor terminals     |
//!
//! *WebSocket auth is via `?token=<t>&visitorId=<id>`; an already-authorized
//! `visitorId` reconnects without a token.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use termrelay::auth::TokenAuth;
use termrelay::multiplexer::tmux::Tmux;
use termrelay::multiplexer::Multiplexer;
use termrelay::rate_limit::RateLimiter;
use termrelay::sessions::backend::PtySpawner;
use termrelay::sessions::RegistrySettings;
use termrelay::tunnel::{access_url, DirectTunnel, Tunnel};
use termrelay::{AppState, Config, SessionRegistry};

/// Share your shell with a browser over WebSocket.
#[derive(Parser)]
#[command(name = "termrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve(ServeArgs),
}

#[derive(clap::Args, Default)]
struct ServeArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Serve(args)) => args,
        None => ServeArgs::default(),
    };
    run_server(args).await
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(port) = args.port {
        config.set_port(&port.to_string());
    }

    // RUST_LOG wins over the configured level.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("termrelay v{} starting", env!("CARGO_PKG_VERSION"));

    let multiplexer: Arc<dyn Multiplexer> = if config.multiplexer.enabled {
        Arc::new(Tmux::discover().await)
    } else {
        Arc::new(Tmux::disabled())
    };
    if multiplexer.is_available() {
        info!("tmux available; sessions can be attached");
    } else {
        info!("tmux not available; plain shells only");
    }

    let settings = RegistrySettings::from_config(&config);
    info!(
        "Shell: {} (cwd {}, user {})",
        settings.shell, settings.working_dir, settings.user.name
    );
    let registry = SessionRegistry::new(Arc::new(PtySpawner), multiplexer, settings);

    let auth = Arc::new(match config.auth.token.clone() {
        Some(token) => TokenAuth::with_token(token, config.auth.lifetime(), config.auth.one_time),
        None => TokenAuth::new(config.auth.lifetime(), config.auth.one_time),
    });
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_attempts,
        config.rate_limit_window(),
        config.rate_limit_block(),
    ));

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    let port = listener.local_addr().context("reading listener address")?.port();
    info!("Listening on {}", config.server.listen);

    let state = AppState::new(config, registry, Arc::clone(&auth), Arc::clone(&rate_limiter));

    let tunnel = DirectTunnel;
    let base_url = match tunnel.start(port).await {
        Ok(url) => url,
        Err(e) => {
            warn!("{} tunnel: {e}; falling back to localhost", tunnel.name());
            format!("http://localhost:{port}")
        }
    };
    info!("Access URL: {}", access_url(&base_url, &auth.token().await));

    auth.check_rotation_covers_lifetime(state.config.auth.rotation_interval());
    let rotation_task = state.config.auth.rotation_interval().map(|interval| {
        let base_url = base_url.clone();
        Arc::clone(&auth).spawn_rotation(
            interval,
            state.config.auth.grace_period(),
            state.shutdown.clone(),
            move |token| info!("New access URL: {}", access_url(&base_url, token)),
        )
    });
    let cleanup_task = Arc::clone(&rate_limiter).spawn_cleanup(
        std::time::Duration::from_secs(state.config.rate_limit.cleanup_interval_secs.max(1)),
        state.shutdown.clone(),
    );

    info!("Server ready");

    // Graceful shutdown
    let shutdown_token = state.shutdown.clone();
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
        // Open WebSocket connections close with 1001 when this fires.
        shutdown_token.cancel();
    };

    let registry = state.registry.clone();
    axum::serve(
        listener,
        termrelay::app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;

    // Cleanup
    info!("Shutting down...");
    if let Some(task) = rotation_task {
        task.abort();
    }
    cleanup_task.abort();
    registry.shutdown().await;
    info!("Goodbye");
    Ok(())
}
