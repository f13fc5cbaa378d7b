//! HTTP route handlers.
//!
//! The only plain HTTP endpoint is [`health::health`]; terminal traffic goes
//! through the WebSocket handler in [`crate::ws`].

pub mod health;
