//! Visitor and terminal lifecycle.
//!
//! [`SessionRegistry`] is the single authority for visitors, their terminals
//! and the connections bound to them. It is built once, shared through
//! `AppState`, and cheap to clone.
//!
//! - **Visitors** are reconnect identities. They are created on first bind or
//!   first terminal and removed only by [`SessionRegistry::close_all`] or
//!   [`SessionRegistry::shutdown`], never on a timer.
//! - **Terminals** are kept in creation order. The active pointer falls back
//!   to the oldest remaining terminal when the active one is closed.
//! - **Fan-out**: every registry mutation and every output chunk is broadcast
//!   to all connections bound to the visitor.
//!
//! ## Concurrency
//!
//! The visitor map is behind an `RwLock`. Each visitor's terminal set is a
//! `Mutex`, each terminal's replay state is a `Mutex`, and each visitor's
//! fan-out is a `Mutex`. Locks are always taken in that order: visitor state,
//! then terminal I/O, then fan-out.

pub mod backend;
pub mod buffer;
pub mod fanout;
pub mod terminal;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TokenInfo;
use crate::config::Config;
use crate::error::TerminalError;
use crate::multiplexer::{validate_session_name, Multiplexer};
use crate::protocol::ServerMessage;
use crate::shell::{self, UserIdentity};
use crate::util::{expand_tilde, now_ms, short_id};
use backend::{SpawnCommand, SpawnOptions, Spawner, TerminalSize};
use fanout::{ConnectionId, Fanout};
use terminal::{Terminal, TerminalKind, TerminalSummary};

/// Length of generated terminal ids.
const TERMINAL_ID_LEN: usize = 12;

/// Longest accepted terminal display name, in characters.
const MAX_TERMINAL_NAME: usize = 64;

/// How long [`SessionRegistry::shutdown`] waits after SIGTERM before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Registry-wide settings, resolved once from [`Config`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub replay_capacity: usize,
    pub max_terminals: usize,
    pub size: TerminalSize,
    pub shell: String,
    pub working_dir: String,
    pub user: UserIdentity,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        let user = UserIdentity::current();
        let working_dir = expand_tilde(&config.shell.working_dir, &user.home).into_owned();
        Self {
            replay_capacity: config.server.replay_buffer_bytes,
            max_terminals: config.server.max_terminals_per_visitor,
            size: TerminalSize {
                cols: config.server.default_cols,
                rows: config.server.default_rows,
            },
            shell: shell::resolve_shell(config.shell.default_shell.as_deref()),
            working_dir,
            user,
        }
    }

    fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            env: shell::base_env(&self.shell, &self.user),
            working_dir: self.working_dir.clone(),
            size: self.size,
        }
    }
}

/// Totals reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub visitors: usize,
    pub terminals: usize,
    pub connections: usize,
}

/// Trim a client-supplied display name. Blank or over-long names are
/// [`TerminalError::InvalidName`].
fn validate_terminal_name(name: &str) -> Result<String, TerminalError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_TERMINAL_NAME {
        return Err(TerminalError::InvalidName(
            trimmed.chars().take(MAX_TERMINAL_NAME).collect(),
        ));
    }
    Ok(trimmed.to_string())
}

struct VisitorState {
    terminals: IndexMap<String, Arc<Terminal>>,
    active: Option<String>,
    /// Number used for the next default `Terminal N` name.
    next_number: u32,
}

impl VisitorState {
    async fn summaries(&self) -> Vec<TerminalSummary> {
        let mut out = Vec::with_capacity(self.terminals.len());
        for (id, terminal) in &self.terminals {
            out.push(terminal.summary(self.active.as_ref() == Some(id)).await);
        }
        out
    }
}

pub struct Visitor {
    id: String,
    created_at: u64,
    state: Mutex<VisitorState>,
    fanout: Arc<Mutex<Fanout>>,
}

impl Visitor {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: now_ms(),
            state: Mutex::new(VisitorState {
                terminals: IndexMap::new(),
                active: None,
                next_number: 1,
            }),
            fanout: Arc::new(Mutex::new(Fanout::default())),
        }
    }

    pub async fn terminal_count(&self) -> usize {
        self.state.lock().await.terminals.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.fanout.lock().await.len()
    }

    async fn broadcast(&self, msg: &ServerMessage) {
        self.fanout.lock().await.broadcast(msg);
    }
}

/// A connection's membership in a visitor's fan-out.
pub struct Subscription {
    visitor: Arc<Visitor>,
    id: ConnectionId,
    evicted: CancellationToken,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Cancelled when the connection was dropped from the fan-out for being
    /// too slow, or when its visitor was torn down.
    pub fn evicted(&self) -> &CancellationToken {
        &self.evicted
    }

    pub async fn unbind(self) {
        self.visitor.fanout.lock().await.unsubscribe(self.id);
    }
}

/// Manages every visitor's terminals.
///
/// Cloneable; all clones share the same state.
#[derive(Clone)]
pub struct SessionRegistry {
    visitors: Arc<RwLock<HashMap<String, Arc<Visitor>>>>,
    spawner: Arc<dyn Spawner>,
    multiplexer: Arc<dyn Multiplexer>,
    settings: Arc<RegistrySettings>,
    next_connection: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new(
        spawner: Arc<dyn Spawner>,
        multiplexer: Arc<dyn Multiplexer>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            visitors: Arc::new(RwLock::new(HashMap::new())),
            spawner,
            multiplexer,
            settings: Arc::new(settings),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.multiplexer
    }

    pub async fn get_or_create_visitor(&self, visitor_id: &str) -> Arc<Visitor> {
        if let Some(visitor) = self.visitors.read().await.get(visitor_id) {
            return Arc::clone(visitor);
        }
        let mut visitors = self.visitors.write().await;
        let visitor = visitors.entry(visitor_id.to_string()).or_insert_with(|| {
            info!("Visitor {visitor_id} created");
            Arc::new(Visitor::new(visitor_id.to_string()))
        });
        Arc::clone(visitor)
    }

    async fn visitor(&self, visitor_id: &str) -> Option<Arc<Visitor>> {
        self.visitors.read().await.get(visitor_id).cloned()
    }

    async fn terminal(&self, visitor_id: &str, terminal_id: &str) -> Option<Arc<Terminal>> {
        let visitor = self.visitor(visitor_id).await?;
        let state = visitor.state.lock().await;
        state.terminals.get(terminal_id).cloned()
    }

    /// Spawn a plain shell terminal. `name` defaults to `Terminal N`.
    pub async fn create_terminal(
        &self,
        visitor_id: &str,
        name: Option<String>,
    ) -> Result<TerminalSummary, TerminalError> {
        let command = SpawnCommand {
            program: self.settings.shell.clone(),
            args: Vec::new(),
        };
        self.spawn_terminal(visitor_id, TerminalKind::Shell, None, name, &command)
            .await
    }

    /// Attach a terminal to an existing tmux session.
    pub async fn attach_multiplexer_session(
        &self,
        visitor_id: &str,
        session_name: &str,
    ) -> Result<TerminalSummary, TerminalError> {
        if !self.multiplexer.is_available() {
            return Err(TerminalError::NotAvailable);
        }
        validate_session_name(session_name)?;
        if !self.multiplexer.session_exists(session_name).await? {
            return Err(TerminalError::SessionNotFound(session_name.to_string()));
        }
        let command = self.multiplexer.attach_command(session_name)?;
        self.spawn_terminal(
            visitor_id,
            TerminalKind::Multiplexer,
            Some(session_name.to_string()),
            Some(session_name.to_string()),
            &command,
        )
        .await
    }

    /// Attach to a tmux session, creating it first if it does not exist.
    pub async fn create_multiplexer_session(
        &self,
        visitor_id: &str,
        session_name: &str,
    ) -> Result<TerminalSummary, TerminalError> {
        if !self.multiplexer.is_available() {
            return Err(TerminalError::NotAvailable);
        }
        let command = self.multiplexer.create_command(session_name)?;
        self.spawn_terminal(
            visitor_id,
            TerminalKind::Multiplexer,
            Some(session_name.to_string()),
            Some(session_name.to_string()),
            &command,
        )
        .await
    }

    async fn spawn_terminal(
        &self,
        visitor_id: &str,
        kind: TerminalKind,
        session_name: Option<String>,
        name: Option<String>,
        command: &SpawnCommand,
    ) -> Result<TerminalSummary, TerminalError> {
        let visitor = self.get_or_create_visitor(visitor_id).await;
        let mut state = visitor.state.lock().await;
        self.spawn_locked(&visitor, &mut state, kind, session_name, name, command)
            .await
    }

    /// Create the default shell terminal unless the visitor already has one.
    pub async fn ensure_terminal(
        &self,
        visitor_id: &str,
    ) -> Result<Option<TerminalSummary>, TerminalError> {
        let visitor = self.get_or_create_visitor(visitor_id).await;
        let mut state = visitor.state.lock().await;
        if !state.terminals.is_empty() {
            return Ok(None);
        }
        let command = SpawnCommand {
            program: self.settings.shell.clone(),
            args: Vec::new(),
        };
        self.spawn_locked(&visitor, &mut state, TerminalKind::Shell, None, None, &command)
            .await
            .map(Some)
    }

    async fn spawn_locked(
        &self,
        visitor: &Visitor,
        state: &mut VisitorState,
        kind: TerminalKind,
        session_name: Option<String>,
        name: Option<String>,
        command: &SpawnCommand,
    ) -> Result<TerminalSummary, TerminalError> {
        if state.terminals.len() >= self.settings.max_terminals {
            return Err(TerminalError::LimitReached(self.settings.max_terminals));
        }
        let name = match name.filter(|n| !n.trim().is_empty()) {
            Some(name) => validate_terminal_name(&name)?,
            None => format!("Terminal {}", state.next_number),
        };

        let spawned = self
            .spawner
            .spawn(command, &self.settings.spawn_options())?;

        let id = loop {
            let candidate = short_id(TERMINAL_ID_LEN);
            if !state.terminals.contains_key(&candidate) {
                break candidate;
            }
        };
        state.next_number += 1;

        let terminal = Arc::new(Terminal::new(
            id.clone(),
            name,
            kind,
            session_name,
            spawned.backend,
            self.settings.replay_capacity,
        ));
        state.terminals.insert(id.clone(), Arc::clone(&terminal));
        if state.active.is_none() {
            state.active = Some(id.clone());
        }
        let summary = terminal.summary(state.active.as_ref() == Some(&id)).await;

        // Announce before any output can reference the new id.
        visitor
            .broadcast(&ServerMessage::TerminalCreated {
                terminal: summary.clone(),
            })
            .await;
        terminal.start_pump(spawned.events, Arc::clone(&visitor.fanout));

        info!(
            "Terminal {id} ({}) created for visitor {} (pid {})",
            summary.name,
            visitor.id,
            terminal.pid()
        );
        Ok(summary)
    }

    /// Send `msg` to every connection bound to the visitor.
    pub async fn broadcast(&self, visitor_id: &str, msg: &ServerMessage) {
        if let Some(visitor) = self.visitor(visitor_id).await {
            visitor.broadcast(msg).await;
        }
    }

    /// Send input to a terminal without waiting on its backend. Unknown
    /// terminals are ignored (`Ok(false)`); a full input queue is
    /// [`TerminalError::InputBackedUp`].
    pub async fn write(
        &self,
        visitor_id: &str,
        terminal_id: &str,
        data: Vec<u8>,
    ) -> Result<bool, TerminalError> {
        match self.terminal(visitor_id, terminal_id).await {
            Some(terminal) => terminal.write(data).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Resize a terminal. Unknown terminals and zero sizes are ignored.
    pub async fn resize(&self, visitor_id: &str, terminal_id: &str, cols: u16, rows: u16) -> bool {
        if cols == 0 || rows == 0 {
            return false;
        }
        match self.terminal(visitor_id, terminal_id).await {
            Some(terminal) => {
                terminal.resize(cols, rows);
                true
            }
            None => false,
        }
    }

    /// Kill a terminal's backend and forget it.
    ///
    /// For tmux terminals the session itself survives unless
    /// `destroy_session` is set. The terminal is removed even if destroying
    /// the session then fails; that failure is returned.
    pub async fn close_terminal(
        &self,
        visitor_id: &str,
        terminal_id: &str,
        destroy_session: bool,
    ) -> Result<(), TerminalError> {
        let not_found = || TerminalError::NotFound(terminal_id.to_string());
        let visitor = self.visitor(visitor_id).await.ok_or_else(not_found)?;
        let terminal = {
            let mut state = visitor.state.lock().await;
            let terminal = state.terminals.shift_remove(terminal_id).ok_or_else(not_found)?;
            terminal.close();
            if state.active.as_deref() == Some(terminal_id) {
                state.active = state.terminals.keys().next().cloned();
            }
            let terminals = state.summaries().await;
            visitor
                .broadcast(&ServerMessage::TerminalClosed {
                    terminal_id: terminal_id.to_string(),
                    terminals,
                })
                .await;
            terminal
        };
        info!("Terminal {terminal_id} closed for visitor {visitor_id}");

        match terminal.session_name() {
            Some(session) if destroy_session && terminal.kind() == TerminalKind::Multiplexer => {
                self.multiplexer.kill_session(session).await
            }
            _ => Ok(()),
        }
    }

    pub async fn set_active(&self, visitor_id: &str, terminal_id: &str) -> Result<(), TerminalError> {
        let not_found = || TerminalError::NotFound(terminal_id.to_string());
        let visitor = self.visitor(visitor_id).await.ok_or_else(not_found)?;
        let mut state = visitor.state.lock().await;
        if !state.terminals.contains_key(terminal_id) {
            return Err(not_found());
        }
        state.active = Some(terminal_id.to_string());
        Ok(())
    }

    pub async fn active_terminal(&self, visitor_id: &str) -> Option<String> {
        let visitor = self.visitor(visitor_id).await?;
        let state = visitor.state.lock().await;
        state.active.clone()
    }

    /// Rename a terminal and broadcast the new name.
    pub async fn rename(
        &self,
        visitor_id: &str,
        terminal_id: &str,
        name: &str,
    ) -> Result<(), TerminalError> {
        let name = validate_terminal_name(name)?;
        let not_found = || TerminalError::NotFound(terminal_id.to_string());
        let visitor = self.visitor(visitor_id).await.ok_or_else(not_found)?;
        let state = visitor.state.lock().await;
        let terminal = state.terminals.get(terminal_id).ok_or_else(not_found)?;
        terminal.rename(name.clone()).await;
        visitor
            .broadcast(&ServerMessage::TerminalRenamed {
                terminal_id: terminal_id.to_string(),
                name,
            })
            .await;
        Ok(())
    }

    /// Summaries in creation order. Empty for unknown visitors.
    pub async fn list_terminals(&self, visitor_id: &str) -> Vec<TerminalSummary> {
        match self.visitor(visitor_id).await {
            Some(visitor) => visitor.state.lock().await.summaries().await,
            None => Vec::new(),
        }
    }

    pub async fn replay_buffer(&self, visitor_id: &str, terminal_id: &str) -> Option<String> {
        let terminal = self.terminal(visitor_id, terminal_id).await?;
        Some(terminal.replay_text().await)
    }

    /// Bind a connection to a visitor.
    ///
    /// Queues the `session` snapshot followed by every terminal's replay onto
    /// `tx`, then joins the fan-out, all while holding every terminal's I/O
    /// lock, so live output continues exactly where the replay ends.
    pub async fn bind(
        &self,
        visitor_id: &str,
        tx: mpsc::Sender<ServerMessage>,
        token_info: TokenInfo,
    ) -> Subscription {
        let multiplexer_info = self.multiplexer.info().await;
        let visitor = self.get_or_create_visitor(visitor_id).await;
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let evicted = CancellationToken::new();

        let state = visitor.state.lock().await;
        let mut locked = Vec::with_capacity(state.terminals.len());
        for terminal in state.terminals.values() {
            locked.push((terminal, terminal.lock_io().await));
        }

        let terminals = locked
            .iter()
            .map(|(t, io)| t.summary_from(io, state.active.as_deref() == Some(t.id())))
            .collect();
        let mut queued = tx
            .try_send(ServerMessage::Session {
                visitor_id: visitor_id.to_string(),
                terminals,
                active_terminal_id: state.active.clone(),
                multiplexer_info,
                token_info,
            })
            .is_ok();
        for (terminal, io) in &locked {
            if !queued {
                break;
            }
            if io.replay.is_empty() {
                continue;
            }
            queued = tx
                .try_send(ServerMessage::Output {
                    terminal_id: terminal.id().to_string(),
                    data: io.replay.snapshot_text(),
                })
                .is_ok();
        }

        let mut fanout = visitor.fanout.lock().await;
        if queued {
            fanout.subscribe(id, tx, evicted.clone());
        } else {
            warn!("Connection {id} could not take the replay; evicting");
            evicted.cancel();
        }
        let connections = fanout.len();
        drop(fanout);
        drop(locked);
        drop(state);

        info!("Connection {id} bound to visitor {visitor_id} ({connections} connection(s))");
        Subscription {
            visitor,
            id,
            evicted,
        }
    }

    /// Kill every terminal of a visitor and forget the visitor. Bound
    /// connections are evicted.
    pub async fn close_all(&self, visitor_id: &str) -> usize {
        let Some(visitor) = self.visitors.write().await.remove(visitor_id) else {
            return 0;
        };
        let mut state = visitor.state.lock().await;
        let count = state.terminals.len();
        for (_, terminal) in state.terminals.drain(..) {
            terminal.close();
        }
        state.active = None;
        drop(state);
        visitor.fanout.lock().await.evict_all();
        let age_secs = now_ms().saturating_sub(visitor.created_at) / 1000;
        info!("Closed all {count} terminal(s) for visitor {visitor_id} (age {age_secs}s)");
        count
    }

    pub async fn stats(&self) -> RegistryStats {
        let visitors: Vec<Arc<Visitor>> = self.visitors.read().await.values().cloned().collect();
        let mut terminals = 0;
        let mut connections = 0;
        for visitor in &visitors {
            terminals += visitor.terminal_count().await;
            connections += visitor.connection_count().await;
        }
        RegistryStats {
            visitors: visitors.len(),
            terminals,
            connections,
        }
    }

    /// Tear everything down: SIGTERM every backend, wait up to 3 s, then
    /// SIGKILL whatever is left.
    pub async fn shutdown(&self) {
        let visitors: Vec<Arc<Visitor>> = self.visitors.write().await.drain().map(|(_, v)| v).collect();
        let mut terminals = Vec::new();
        for visitor in &visitors {
            let mut state = visitor.state.lock().await;
            terminals.extend(state.terminals.drain(..).map(|(_, t)| t));
            state.active = None;
            drop(state);
            visitor.fanout.lock().await.evict_all();
        }
        if terminals.is_empty() {
            return;
        }

        for terminal in &terminals {
            terminal.terminate();
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !terminals.iter().all(|t| t.has_exited()) {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for terminal in &terminals {
            terminal.close();
        }
        info!("Shut down {} terminal(s)", terminals.len());
    }
}
