//! Small helpers shared across modules.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expand a leading `~` against `home`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde<'a>(path: &'a str, home: &str) -> Cow<'a, str> {
    if path == "~" {
        return Cow::Owned(home.to_string());
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return Cow::Owned(format!("{}/{rest}", home.trim_end_matches('/')));
    }
    Cow::Borrowed(path)
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Random alphanumeric id of `len` characters (terminal ids).
pub fn short_id(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
