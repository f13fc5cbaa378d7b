//! JSON message protocol spoken over `/ws`.
//!
//! Every frame is a UTF-8 JSON object tagged by `"type"` (kebab-case); field
//! names are camelCase.
//!
//! ## Client → server
//!
//! | Type              | Fields                               |
//! |-------------------|--------------------------------------|
//! | `input`           | `terminalId`, `data`                 |
//! | `resize`          | `terminalId`, `cols`, `rows`         |
//! | `create-terminal` | `name?`                              |
//! | `close-terminal`  | `terminalId`, `destroySession?`      |
//! | `rename-terminal` | `terminalId`, `name`                 |
//! | `switch-terminal` | `terminalId`                         |
//! | `get-terminals`   | -                                    |
//! | `get-sessions`    | -                                    |
//! | `create-session`  | `sessionName`                        |
//! | `attach-session`  | `sessionName`                        |
//! | `ping`            | -                                    |
//!
//! ## Server → client
//!
//! | Type                | Key fields                                                       |
//! |---------------------|------------------------------------------------------------------|
//! | `session`           | `visitorId`, `terminals[]`, `activeTerminalId`, `multiplexerInfo`, `tokenInfo` |
//! | `output`            | `terminalId`, `data`                                             |
//! | `terminal-created`  | `terminal`                                                       |
//! | `terminal-closed`   | `terminalId`, `terminals[]`                                      |
//! | `terminal-renamed`  | `terminalId`, `name`                                             |
//! | `terminal-switched` | `terminalId`                                                     |
//! | `terminals-list`    | `terminals[]`                                                    |
//! | `sessions-list`     | `multiplexerInfo`                                                |
//! | `exit`              | `terminalId`, `exitCode`, `signal`                               |
//! | `error`             | `message`, `retryAfter?`                                         |
//! | `pong`              | -                                                                |

use serde::{Deserialize, Serialize};

use crate::auth::TokenInfo;
use crate::multiplexer::MultiplexerInfo;
use crate::sessions::terminal::TerminalSummary;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Input {
        terminal_id: String,
        data: String,
    },
    Resize {
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
    CreateTerminal {
        #[serde(default)]
        name: Option<String>,
    },
    CloseTerminal {
        terminal_id: String,
        #[serde(default)]
        destroy_session: bool,
    },
    RenameTerminal {
        terminal_id: String,
        name: String,
    },
    SwitchTerminal {
        terminal_id: String,
    },
    GetTerminals,
    GetSessions,
    CreateSession {
        session_name: String,
    },
    AttachSession {
        session_name: String,
    },
    Ping,
}

impl ClientMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Session {
        visitor_id: String,
        terminals: Vec<TerminalSummary>,
        active_terminal_id: Option<String>,
        multiplexer_info: MultiplexerInfo,
        token_info: TokenInfo,
    },
    Output {
        terminal_id: String,
        data: String,
    },
    TerminalCreated {
        terminal: TerminalSummary,
    },
    TerminalClosed {
        terminal_id: String,
        terminals: Vec<TerminalSummary>,
    },
    TerminalRenamed {
        terminal_id: String,
        name: String,
    },
    TerminalSwitched {
        terminal_id: String,
    },
    TerminalsList {
        terminals: Vec<TerminalSummary>,
    },
    SessionsList {
        multiplexer_info: MultiplexerInfo,
    },
    Exit {
        terminal_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
