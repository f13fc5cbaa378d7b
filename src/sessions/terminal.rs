//! One terminal pane: a backend, its replay buffer, and the output pump.
//!
//! The pump task is the only consumer of the backend's event stream. For each
//! output chunk it takes the terminal's I/O lock, appends to the replay buffer
//! and broadcasts to the visitor's fan-out before releasing, so a connection
//! binding concurrently sees each chunk either in its replay or live, never
//! both and never neither.

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::backend::{BackendEvent, BackendInput, ProcessBackend};
use super::buffer::ReplayBuffer;
use super::fanout::Fanout;
use crate::error::TerminalError;
use crate::protocol::ServerMessage;
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    Shell,
    Multiplexer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Stable, client-facing description of a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSummary {
    pub id: String,
    pub name: String,
    pub kind: TerminalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub created_at: u64,
    pub last_activity: u64,
    pub is_active: bool,
    pub exited: bool,
}

/// State touched by both the pump and the registry.
pub struct TerminalIo {
    pub name: String,
    pub replay: ReplayBuffer,
    pub exit: Option<ExitStatus>,
    pub last_activity: u64,
}

pub struct Terminal {
    id: String,
    kind: TerminalKind,
    session_name: Option<String>,
    created_at: u64,
    backend: Box<dyn ProcessBackend>,
    io: Mutex<TerminalIo>,
    pump: OnceLock<AbortHandle>,
}

impl Terminal {
    pub fn new(
        id: String,
        name: String,
        kind: TerminalKind,
        session_name: Option<String>,
        backend: Box<dyn ProcessBackend>,
        replay_capacity: usize,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            kind,
            session_name,
            created_at: now,
            backend,
            io: Mutex::new(TerminalIo {
                name,
                replay: ReplayBuffer::new(replay_capacity),
                exit: None,
                last_activity: now,
            }),
            pump: OnceLock::new(),
        }
    }

    /// Start forwarding `events` into the replay buffer and `fanout`.
    /// Has no effect after the first call.
    pub fn start_pump(
        self: &Arc<Self>,
        events: mpsc::Receiver<BackendEvent>,
        fanout: Arc<Mutex<Fanout>>,
    ) {
        if self.pump.get().is_some() {
            return;
        }
        let handle = tokio::spawn(pump(Arc::clone(self), events, fanout));
        let _ = self.pump.set(handle.abort_handle());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TerminalKind {
        self.kind
    }

    /// tmux session name for multiplexer terminals.
    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    pub fn pid(&self) -> u32 {
        self.backend.pid()
    }

    pub async fn lock_io(&self) -> MutexGuard<'_, TerminalIo> {
        self.io.lock().await
    }

    pub fn summary_from(&self, io: &TerminalIo, is_active: bool) -> TerminalSummary {
        TerminalSummary {
            id: self.id.clone(),
            name: io.name.clone(),
            kind: self.kind,
            session_name: self.session_name.clone(),
            created_at: self.created_at,
            last_activity: io.last_activity,
            is_active,
            exited: io.exit.is_some(),
        }
    }

    pub async fn summary(&self, is_active: bool) -> TerminalSummary {
        let io = self.io.lock().await;
        self.summary_from(&io, is_active)
    }

    /// Queue input without waiting on the backend. A full queue drops the
    /// data and reports [`TerminalError::InputBackedUp`].
    pub async fn write(&self, data: Vec<u8>) -> Result<(), TerminalError> {
        self.io.lock().await.last_activity = now_ms();
        match self.backend.input().try_send(BackendInput::Data(data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Terminal {} input queue full; dropping input", self.id);
                Err(TerminalError::InputBackedUp(self.id.clone()))
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Terminal {} input dropped: writer closed", self.id);
                Ok(())
            }
        }
    }

    /// Queue a resize. Dropped when the input queue is full or closed.
    pub fn resize(&self, cols: u16, rows: u16) {
        if self
            .backend
            .input()
            .try_send(BackendInput::Resize { cols, rows })
            .is_err()
        {
            debug!("Terminal {} resize to {cols}x{rows} dropped", self.id);
        }
    }

    pub async fn rename(&self, name: String) {
        self.io.lock().await.name = name;
    }

    pub async fn replay_text(&self) -> String {
        self.io.lock().await.replay.snapshot_text()
    }

    pub fn has_exited(&self) -> bool {
        self.backend.has_exited()
    }

    pub fn terminate(&self) {
        self.backend.terminate();
    }

    /// Kill the backend and stop the pump. No further events are published.
    pub fn close(&self) {
        if let Some(pump) = self.pump.get() {
            pump.abort();
        }
        self.backend.kill();
    }
}

async fn pump(
    terminal: Arc<Terminal>,
    mut events: mpsc::Receiver<BackendEvent>,
    fanout: Arc<Mutex<Fanout>>,
) {
    let mut decoder = Utf8Decoder::default();
    while let Some(event) = events.recv().await {
        match event {
            BackendEvent::Output(bytes) => {
                let text = decoder.decode(&bytes);
                if text.is_empty() {
                    continue;
                }
                let mut io = terminal.io.lock().await;
                io.replay.push(text.as_bytes());
                io.last_activity = now_ms();
                fanout.lock().await.broadcast(&ServerMessage::Output {
                    terminal_id: terminal.id.clone(),
                    data: text,
                });
            }
            BackendEvent::Exit { code, signal } => {
                let mut io = terminal.io.lock().await;
                io.exit = Some(ExitStatus { code, signal });
                fanout.lock().await.broadcast(&ServerMessage::Exit {
                    terminal_id: terminal.id.clone(),
                    exit_code: code,
                    signal,
                });
                info!(
                    "Terminal {} exited (code: {code:?}, signal: {signal:?})",
                    terminal.id
                );
                break;
            }
        }
    }
}

/// Incremental UTF-8 decoder. A multi-byte character split across chunks is
/// held back until its remaining bytes arrive; invalid bytes become U+FFFD.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}
