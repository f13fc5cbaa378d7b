//! Per-visitor connection fan-out.
//!
//! Each bound connection registers a bounded sender. Broadcasting never
//! awaits: a subscriber whose queue is full is evicted (its eviction token is
//! cancelled so the connection closes and the client reconnects and replays),
//! and one whose receiver is gone is silently dropped.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::protocol::ServerMessage;

pub type ConnectionId = u64;

struct Subscriber {
    tx: mpsc::Sender<ServerMessage>,
    evicted: CancellationToken,
}

#[derive(Default)]
pub struct Fanout {
    subscribers: HashMap<ConnectionId, Subscriber>,
}

impl Fanout {
    pub fn subscribe(
        &mut self,
        id: ConnectionId,
        tx: mpsc::Sender<ServerMessage>,
        evicted: CancellationToken,
    ) {
        self.subscribers.insert(id, Subscriber { tx, evicted });
    }

    pub fn unsubscribe(&mut self, id: ConnectionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Queue `msg` on every subscriber. Returns how many accepted it.
    pub fn broadcast(&mut self, msg: &ServerMessage) -> usize {
        self.subscribers.retain(|id, sub| match sub.tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Connection {id} is not keeping up; evicting");
                sub.evicted.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        self.subscribers.len()
    }

    /// Drop every subscriber and tell its connection to close.
    pub fn evict_all(&mut self) {
        for (_, sub) in self.subscribers.drain() {
            sub.evicted.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_in_order() {
        let mut fanout = Fanout::default();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        fanout.subscribe(1, tx_a, CancellationToken::new());
        fanout.subscribe(2, tx_b, CancellationToken::new());

        for data in ["one", "two"] {
            let msg = ServerMessage::Output {
                terminal_id: "t".into(),
                data: data.into(),
            };
            assert_eq!(fanout.broadcast(&msg), 2);
        }
        for rx in [&mut rx_a, &mut rx_b] {
            for expected in ["one", "two"] {
                match rx.recv().await.unwrap() {
                    ServerMessage::Output { data, .. } => assert_eq!(data, expected),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_is_evicted() {
        let mut fanout = Fanout::default();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let slow_evicted = CancellationToken::new();
        fanout.subscribe(1, slow_tx, slow_evicted.clone());
        fanout.subscribe(2, fast_tx, CancellationToken::new());

        fanout.broadcast(&ServerMessage::Pong);
        assert!(!slow_evicted.is_cancelled());
        assert_eq!(fanout.broadcast(&ServerMessage::Pong), 1);
        assert!(slow_evicted.is_cancelled());
        assert_eq!(fanout.len(), 1);

        assert!(matches!(fast_rx.recv().await, Some(ServerMessage::Pong)));
        assert!(matches!(fast_rx.recv().await, Some(ServerMessage::Pong)));
    }

    #[test]
    fn test_closed_subscriber_is_dropped_without_eviction() {
        let mut fanout = Fanout::default();
        let (tx, rx) = mpsc::channel(4);
        let evicted = CancellationToken::new();
        fanout.subscribe(7, tx, evicted.clone());
        drop(rx);
        assert_eq!(fanout.broadcast(&ServerMessage::Pong), 0);
        assert!(fanout.is_empty());
        assert!(!evicted.is_cancelled());
    }

    #[test]
    fn test_evict_all_and_unsubscribe() {
        let mut fanout = Fanout::default();
        let (tx, _rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        fanout.subscribe(1, tx.clone(), token.clone());
        fanout.subscribe(2, tx, CancellationToken::new());
        assert!(fanout.unsubscribe(2));
        assert!(!fanout.unsubscribe(2));
        fanout.evict_all();
        assert!(token.is_cancelled());
        assert!(fanout.is_empty());
    }
}
