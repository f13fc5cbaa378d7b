//! tmux discovery and subcommands, run with a timeout.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    is_no_server, parse_list_sessions, validate_session_name, Multiplexer, MultiplexerInfo,
    MultiplexerSession,
};
use crate::error::TerminalError;
use crate::sessions::backend::SpawnCommand;

/// Timeout for every tmux/which/wsl subprocess.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const LIST_FORMAT: &str =
    "#{session_name}:#{session_windows}:#{session_attached}:#{session_created}";

/// How the tmux binary is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// Native binary at this path.
    Direct(PathBuf),
    /// `wsl tmux ...` inside the given distro (Windows hosts).
    Wsl { distro: String },
}

/// Production [`Multiplexer`] backed by the tmux CLI.
#[derive(Debug, Clone)]
pub struct Tmux {
    launcher: Option<Launcher>,
    wsl_distro: Option<String>,
}

impl Tmux {
    /// tmux integration switched off by config.
    pub fn disabled() -> Self {
        Self {
            launcher: None,
            wsl_distro: None,
        }
    }

    pub fn with_launcher(launcher: Launcher) -> Self {
        let wsl_distro = match &launcher {
            Launcher::Wsl { distro } => Some(distro.clone()),
            Launcher::Direct(_) => None,
        };
        Self {
            launcher: Some(launcher),
            wsl_distro,
        }
    }

    /// Probe the host: `which tmux` natively, or WSL on Windows.
    pub async fn discover() -> Self {
        if cfg!(windows) {
            let Some(distro) = detect_wsl_distro().await else {
                return Self::disabled();
            };
            if run_with_timeout(Command::new("wsl").args(["which", "tmux"]))
                .await
                .is_ok_and(|o| o.status.success())
            {
                info!("Found tmux in WSL ({distro})");
                return Self::with_launcher(Launcher::Wsl { distro });
            }
            warn!("WSL found but tmux is not installed (wsl sudo apt install tmux)");
            return Self {
                launcher: None,
                wsl_distro: Some(distro),
            };
        }

        match run_with_timeout(Command::new("which").arg("tmux")).await {
            Ok(out) if out.status.success() => {
                let path = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if path.is_empty() {
                    Self::disabled()
                } else {
                    info!("Found tmux at {path}");
                    Self::with_launcher(Launcher::Direct(PathBuf::from(path)))
                }
            }
            _ => {
                info!("tmux not found; multiplexer features disabled");
                Self::disabled()
            }
        }
    }

    fn program_and_prefix(&self) -> Result<(String, Vec<String>), TerminalError> {
        if !self.is_available() {
            return Err(TerminalError::NotAvailable);
        }
        match &self.launcher {
            Some(Launcher::Direct(path)) => Ok((path.to_string_lossy().into_owned(), Vec::new())),
            Some(Launcher::Wsl { .. }) => Ok(("wsl".to_string(), vec!["tmux".to_string()])),
            None => Err(TerminalError::NotAvailable),
        }
    }

    fn command(&self, args: &[&str]) -> Result<SpawnCommand, TerminalError> {
        let (program, mut full_args) = self.program_and_prefix()?;
        full_args.extend(args.iter().map(ToString::to_string));
        Ok(SpawnCommand {
            program,
            args: full_args,
        })
    }

    async fn run(&self, args: &[&str]) -> Result<Output, TerminalError> {
        let cmd = self.command(args)?;
        debug!("tmux: {} {}", cmd.program, cmd.args.join(" "));
        run_with_timeout(Command::new(&cmd.program).args(&cmd.args)).await
    }
}

async fn run_with_timeout(cmd: &mut Command) -> Result<Output, TerminalError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(TerminalError::NotAvailable),
        Ok(Err(e)) => Err(TerminalError::Multiplexer(e.to_string())),
        Err(_) => Err(TerminalError::Multiplexer("command timed out".to_string())),
    }
}

/// First distro from `wsl -l -q` (output is UTF-16, so NULs are stripped).
async fn detect_wsl_distro() -> Option<String> {
    let out = run_with_timeout(Command::new("wsl").args(["-l", "-q"]))
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8_lossy(&out.stdout)
        .replace('\0', "")
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(ToString::to_string)
}

fn exact_target(name: &str) -> String {
    format!("={name}")
}

#[async_trait]
impl Multiplexer for Tmux {
    fn is_available(&self) -> bool {
        match &self.launcher {
            Some(Launcher::Direct(path)) => Path::new(path).exists(),
            Some(Launcher::Wsl { .. }) => true,
            None => false,
        }
    }

    async fn info(&self) -> MultiplexerInfo {
        let use_wsl = matches!(self.launcher, Some(Launcher::Wsl { .. }));
        let wsl_available = self.wsl_distro.is_some();
        let mut info = MultiplexerInfo {
            available: self.is_available(),
            use_wsl,
            wsl_distro: self.wsl_distro.clone(),
            wsl_available,
            wsl_tmux_missing: wsl_available && !use_wsl,
            sessions: Vec::new(),
            error: None,
        };
        if info.available {
            match self.list_sessions().await {
                Ok(sessions) => info.sessions = sessions,
                Err(TerminalError::NotAvailable) => info.available = false,
                Err(e) => info.error = Some(e.to_string()),
            }
        }
        info
    }

    async fn list_sessions(&self) -> Result<Vec<MultiplexerSession>, TerminalError> {
        let out = self.run(&["list-sessions", "-F", LIST_FORMAT]).await?;
        if out.status.success() {
            return Ok(parse_list_sessions(&String::from_utf8_lossy(&out.stdout)));
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if is_no_server(&stderr) {
            Ok(Vec::new())
        } else {
            Err(TerminalError::Multiplexer(stderr.trim().to_string()))
        }
    }

    async fn session_exists(&self, name: &str) -> Result<bool, TerminalError> {
        validate_session_name(name)?;
        let out = self.run(&["has-session", "-t", &exact_target(name)]).await?;
        Ok(out.status.success())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TerminalError> {
        validate_session_name(name)?;
        let out = self.run(&["kill-session", "-t", &exact_target(name)]).await?;
        if out.status.success() {
            info!("Killed tmux session {name}");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if is_no_server(&stderr) || stderr.contains("can't find session") {
            Err(TerminalError::SessionNotFound(name.to_string()))
        } else {
            Err(TerminalError::Multiplexer(stderr.trim().to_string()))
        }
    }

    fn attach_command(&self, name: &str) -> Result<SpawnCommand, TerminalError> {
        validate_session_name(name)?;
        self.command(&["attach-session", "-t", &exact_target(name)])
    }

    fn create_command(&self, name: &str) -> Result<SpawnCommand, TerminalError> {
        validate_session_name(name)?;
        self.command(&["new-session", "-A", "-s", name])
    }
}
