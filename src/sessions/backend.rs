//! Process backends: a child process on a PTY with an ordered input channel
//! and an output/exit event stream.
//!
//! The registry never touches file descriptors. It asks a [`Spawner`] for a
//! [`ProcessBackend`] plus a receiver of [`BackendEvent`]s, pushes
//! [`BackendInput`] into the backend's channel, and signals through
//! `terminate`/`kill`. [`PtySpawner`] is the production implementation.
//!
//! ## Ordering
//!
//! Input and resize requests share one channel, drained by a single writer
//! task, so they apply in submission order. The exit event is sent only after
//! the reader has drained the master side (bounded by
//! [`EXIT_DRAIN_TIMEOUT`]), so it follows every byte produced before death.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::TerminalError;
use crate::shell::pty;

/// How long the exit watcher waits for trailing output after the child dies.
/// A grandchild holding the slave open would otherwise delay exit forever.
pub const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const INPUT_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 256;
const READ_CHUNK: usize = 4096;

/// Columns × rows of a terminal window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Program and arguments to run inside a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Everything besides the command that a spawn needs.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub env: HashMap<String, String>,
    pub working_dir: String,
    pub size: TerminalSize,
}

/// Requests consumed, in order, by the backend's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

/// Events produced by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Output(Vec<u8>),
    /// Always the last event.
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// A running child process owned by exactly one terminal.
pub trait ProcessBackend: Send + Sync {
    fn pid(&self) -> u32;

    /// Sender for ordered input and resize requests.
    fn input(&self) -> &mpsc::Sender<BackendInput>;

    /// SIGTERM to the process group.
    fn terminate(&self);

    /// SIGKILL to the process group.
    fn kill(&self);

    fn has_exited(&self) -> bool;
}

/// A freshly spawned backend and its event stream.
pub struct Spawned {
    pub backend: Box<dyn ProcessBackend>,
    pub events: mpsc::Receiver<BackendEvent>,
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, command: &SpawnCommand, options: &SpawnOptions)
        -> Result<Spawned, TerminalError>;
}

/// Spawns children on a freshly allocated PTY.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

struct PtyBackend {
    pid: u32,
    input: mpsc::Sender<BackendInput>,
    exited: Arc<AtomicBool>,
}

impl PtyBackend {
    fn signal_group(&self, signal: i32) {
        // The pid may be recycled once reaped.
        if self.exited.load(Ordering::Acquire) || self.pid == 0 {
            return;
        }
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let ret = unsafe { libc::kill(-pgid, signal) };
        if ret != 0 {
            debug!(
                "kill(-{pgid}, {signal}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

impl ProcessBackend for PtyBackend {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn input(&self) -> &mpsc::Sender<BackendInput> {
        &self.input
    }

    fn terminate(&self) {
        self.signal_group(libc::SIGTERM);
    }

    fn kill(&self) {
        self.signal_group(libc::SIGKILL);
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

fn dup_fd(fd: &OwnedFd) -> Result<OwnedFd, TerminalError> {
    // SAFETY: dup(2) on a descriptor we own; the result is checked below.
    let raw = unsafe { libc::dup(fd.as_raw_fd()) };
    if raw < 0 {
        return Err(TerminalError::Spawn(format!(
            "dup() failed for PTY master: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: `raw` is a fresh descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

impl Spawner for PtySpawner {
    fn spawn(
        &self,
        command: &SpawnCommand,
        options: &SpawnOptions,
    ) -> Result<Spawned, TerminalError> {
        let size = options.size;
        let pair = pty::allocate_pty(size.cols, size.rows)
            .map_err(|e| TerminalError::Spawn(format!("openpty failed: {e}")))?;

        let mut child = pty::spawn_on_pty(
            &pair,
            &command.program,
            &command.args,
            &options.working_dir,
            &options.env,
        )
        .map_err(|e| TerminalError::Spawn(format!("{}: {e}", command.program)))?;

        let pty::PtyPair { master, slave } = pair;
        // Only the child may hold the slave, or the reader never sees EOF.
        drop(slave);

        let pid = child.id().unwrap_or(0);
        let reader_fd = dup_fd(&master)?;
        let writer_fd = dup_fd(&master)?;
        let master_read = tokio::fs::File::from_std(std::fs::File::from(reader_fd));
        let master_write = tokio::fs::File::from_std(std::fs::File::from(writer_fd));

        let (input_tx, mut input_rx) = mpsc::channel::<BackendInput>(INPUT_QUEUE);
        let (event_tx, event_rx) = mpsc::channel::<BackendEvent>(EVENT_QUEUE);
        let exited = Arc::new(AtomicBool::new(false));

        // Writer: owns the master for resize and lives until every input
        // sender is dropped.
        tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(request) = input_rx.recv().await {
                match request {
                    BackendInput::Data(bytes) => {
                        if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err()
                        {
                            break;
                        }
                    }
                    BackendInput::Resize { cols, rows } => {
                        if let Err(e) = pty::resize_pty(&master, cols, rows) {
                            warn!("PTY {pid} resize to {cols}x{rows} failed: {e}");
                        }
                    }
                }
            }
            debug!("PTY {pid} writer closed");
        });

        let output_tx = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut tmp).await {
                    // EIO once the slave side is fully closed.
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx
                            .send(BackendEvent::Output(tmp[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            debug!("PTY {pid} output closed");
        });

        let exited_flag = Arc::clone(&exited);
        tokio::spawn(async move {
            let (code, signal) = match child.wait().await {
                Ok(status) => (status.code(), status.signal()),
                Err(e) => {
                    error!("PTY {pid} wait error: {e}");
                    (None, None)
                }
            };
            exited_flag.store(true, Ordering::Release);

            let abort = reader.abort_handle();
            if tokio::time::timeout(EXIT_DRAIN_TIMEOUT, reader).await.is_err() {
                warn!("PTY {pid} output still open after exit; dropping the rest");
                abort.abort();
            }
            info!("PTY {pid} exited (code: {code:?}, signal: {signal:?})");
            let _ = event_tx.send(BackendEvent::Exit { code, signal }).await;
        });

        Ok(Spawned {
            backend: Box::new(PtyBackend {
                pid,
                input: input_tx,
                exited,
            }),
            events: event_rx,
        })
    }
}
