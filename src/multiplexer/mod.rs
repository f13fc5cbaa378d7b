//! Terminal-multiplexer (tmux) discovery and session control.
//!
//! The registry only talks to the [`Multiplexer`] trait, so tests swap in an
//! in-memory implementation and never depend on tmux being installed. The
//! production implementation is [`tmux::Tmux`].
//!
//! Every operation re-checks [`Multiplexer::is_available`] at call time and
//! fails with [`TerminalError::NotAvailable`] if the binary has gone away.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::TerminalError;
use crate::sessions::backend::SpawnCommand;

pub mod tmux;

/// Longest accepted session name.
const MAX_SESSION_NAME: usize = 64;

/// One existing tmux session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplexerSession {
    pub name: String,
    pub windows: u32,
    pub attached: bool,
    /// Epoch ms when tmux created the session.
    pub created_at: u64,
}

/// Availability plus session list, sent to clients as `multiplexerInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplexerInfo {
    pub available: bool,
    /// tmux is reached through WSL (Windows hosts).
    pub use_wsl: bool,
    pub wsl_distro: Option<String>,
    pub wsl_available: bool,
    /// WSL exists but tmux is not installed inside it.
    pub wsl_tmux_missing: bool,
    pub sessions: Vec<MultiplexerSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Whether the multiplexer binary is reachable right now.
    fn is_available(&self) -> bool;

    /// Availability details and the current session list. Never fails; list
    /// errors are reported in [`MultiplexerInfo::error`].
    async fn info(&self) -> MultiplexerInfo;

    /// Existing sessions. "No server running" is an empty list.
    async fn list_sessions(&self) -> Result<Vec<MultiplexerSession>, TerminalError>;

    async fn session_exists(&self, name: &str) -> Result<bool, TerminalError>;

    /// Destroy a session and every process inside it.
    async fn kill_session(&self, name: &str) -> Result<(), TerminalError>;

    /// Command that attaches a client to an existing session.
    fn attach_command(&self, name: &str) -> Result<SpawnCommand, TerminalError>;

    /// Command that attaches to `name`, creating it first if needed.
    fn create_command(&self, name: &str) -> Result<SpawnCommand, TerminalError>;
}

/// Reject names tmux would parse as a window/pane target or that are unwieldy.
pub fn validate_session_name(name: &str) -> Result<(), TerminalError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_SESSION_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(TerminalError::InvalidName(name.to_string()))
    }
}

/// Parse `list-sessions -F "#{session_name}:#{session_windows}:#{session_attached}:#{session_created}"`.
///
/// Lines that do not match the format are skipped.
pub fn parse_list_sessions(output: &str) -> Vec<MultiplexerSession> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let mut fields = line.rsplitn(4, ':');
            let created = fields.next()?.parse::<u64>().ok()?;
            let attached = fields.next()?;
            let windows = fields.next()?.parse::<u32>().ok()?;
            let name = fields.next()?;
            Some(MultiplexerSession {
                name: name.to_string(),
                windows,
                attached: attached != "0",
                created_at: created.saturating_mul(1000),
            })
        })
        .collect()
}

/// Whether tmux stderr means "there is simply nothing running yet".
pub fn is_no_server(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("no server running")
        || s.contains("no sessions")
        || s.contains("error connecting to")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_sessions() {
        let out = "main:3:1:1700000000\nscratch:1:0:1700000100\n";
        let sessions = parse_list_sessions(out);
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            sessions[0],
            MultiplexerSession {
                name: "main".into(),
                windows: 3,
                attached: true,
                created_at: 1_700_000_000_000,
            }
        );
        assert!(!sessions[1].attached);
    }

    #[test]
    fn test_parse_ignores_garbage_and_keeps_colons_in_name() {
        let out = "weird:name:2:0:1700000000\nnot a session line\n\n";
        let sessions = parse_list_sessions(out);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "weird:name");
        assert_eq!(sessions[0].windows, 2);
    }

    #[test]
    fn test_no_server_detection() {
        assert!(is_no_server("no server running on /tmp/tmux-1000/default\n"));
        assert!(is_no_server(
            "error connecting to /tmp/tmux-1000/default (No such file or directory)"
        ));
        assert!(!is_no_server("unknown option -- z"));
    }

    #[test]
    fn test_validate_session_name() {
        assert!(validate_session_name("work_1-dev").is_ok());
        let long = "x".repeat(65);
        for bad in ["", "a:b", "a.b", "with space", long.as_str()] {
            assert_eq!(
                validate_session_name(bad),
                Err(TerminalError::InvalidName(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_info_serializes_camel_case() {
        let info = MultiplexerInfo {
            available: true,
            ..MultiplexerInfo::default()
        };
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["available"], true);
        assert_eq!(v["useWsl"], false);
        assert_eq!(v["wslTmuxMissing"], false);
        assert!(v.get("error").is_none());
    }
}
