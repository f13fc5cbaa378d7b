//! Shell resolution and the environment handed to spawned terminals.
//!
//! Terminals never inherit the server's environment. [`base_env`] builds a
//! fresh map containing only what an interactive shell needs, so secrets in
//! the operator's environment do not leak into a visitor's shell.

use std::collections::HashMap;
use std::path::Path;

pub mod pty;

/// Shells tried, in order, when neither the config nor `$SHELL` names one.
const FALLBACK_SHELLS: [&str; 3] = ["/bin/zsh", "/bin/bash", "/bin/sh"];

/// Identity of the user the server runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub home: String,
}

impl UserIdentity {
    /// Resolve from `$USER`/`$HOME`, falling back to the passwd entry.
    pub fn current() -> Self {
        let entry = nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten();
        let name = std::env::var("USER")
            .ok()
            .or_else(|| entry.as_ref().map(|u| u.name.clone()))
            .unwrap_or_else(|| "nobody".to_string());
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| entry.as_ref().map(|u| u.dir.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "/".to_string());
        Self { name, home }
    }
}

/// Pick the shell binary for plain terminals.
///
/// Order: `preferred` (config) → `$SHELL` → zsh → bash → sh. Candidates that
/// do not exist on disk are skipped; `/bin/sh` is returned as a last resort.
pub fn resolve_shell(preferred: Option<&str>) -> String {
    let env_shell = std::env::var("SHELL").ok();
    resolve_shell_from(preferred, env_shell.as_deref(), |p| Path::new(p).exists())
}

fn resolve_shell_from(
    preferred: Option<&str>,
    env_shell: Option<&str>,
    exists: impl Fn(&str) -> bool,
) -> String {
    preferred
        .into_iter()
        .chain(env_shell)
        .chain(FALLBACK_SHELLS)
        .find(|s| !s.is_empty() && exists(s))
        .unwrap_or("/bin/sh")
        .to_string()
}

/// Minimal environment for a terminal process.
pub fn base_env(shell: &str, user: &UserIdentity) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env.insert("COLORTERM".to_string(), "truecolor".to_string());
    env.insert("HOME".to_string(), user.home.clone());
    env.insert(
        "PATH".to_string(),
        std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
    );
    env.insert("SHELL".to_string(), shell.to_string());
    env.insert("USER".to_string(), user.name.clone());
    env.insert(
        "LANG".to_string(),
        std::env::var("LANG").unwrap_or_else(|_| "en_US.UTF-8".to_string()),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_config_then_env() {
        let all = |_: &str| true;
        assert_eq!(
            resolve_shell_from(Some("/usr/bin/fish"), Some("/bin/bash"), all),
            "/usr/bin/fish"
        );
        assert_eq!(resolve_shell_from(None, Some("/bin/bash"), all), "/bin/bash");
        assert_eq!(resolve_shell_from(None, None, all), "/bin/zsh");
    }

    #[test]
    fn test_resolve_skips_missing_candidates() {
        let only_sh = |p: &str| p == "/bin/sh";
        assert_eq!(
            resolve_shell_from(Some("/opt/missing"), Some("/bin/zsh"), only_sh),
            "/bin/sh"
        );
        let nothing = |_: &str| false;
        assert_eq!(resolve_shell_from(None, None, nothing), "/bin/sh");
    }

    #[test]
    fn test_base_env_is_minimal() {
        let user = UserIdentity {
            name: "op".into(),
            home: "/home/op".into(),
        };
        let env = base_env("/bin/bash", &user);
        let mut keys: Vec<&str> = env.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["COLORTERM", "HOME", "LANG", "PATH", "SHELL", "TERM", "USER"]
        );
        assert_eq!(env["SHELL"], "/bin/bash");
        assert_eq!(env["HOME"], "/home/op");
        assert_eq!(env["TERM"], "xterm-256color");
    }
}
