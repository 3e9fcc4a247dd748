//! Topic pub/sub shared by duet participants and the relay.
//!
//! The model follows a small MQTT-like broker: clients connect with an id and
//! an optional last will, publish with or without retention, and receive the
//! retained message of a topic before any live traffic when they subscribe.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

mod broker;
pub mod wire;
#[cfg(feature = "ws-client")]
pub mod ws;

pub use broker::{LocalBroker, LocalConnection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus connection is not established")]
    NotConnected,
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Message the broker publishes on a client's behalf when its connection
/// drops without a goodbye.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub last_will: Option<LastWill>,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            last_will: None,
        }
    }

    pub fn with_last_will(mut self, topic: impl Into<String>, payload: Bytes) -> Self {
        self.last_will = Some(LastWill {
            topic: topic.into(),
            payload,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub retain: bool,
}

impl PublishOptions {
    pub const TRANSIENT: Self = Self { retain: false };
    pub const RETAINED: Self = Self { retain: true };
}

/// Health of a single connection as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> BusResult<Subscription>;
    fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> BusResult<()>;
}

/// A live client session with a broker.
pub trait Connection: Bus {
    fn client_id(&self) -> &str;

    fn link(&self) -> watch::Receiver<LinkState>;

    fn is_connected(&self) -> bool {
        *self.link().borrow() == LinkState::Up
    }

    /// Graceful goodbye. The broker discards the registered last will.
    fn disconnect(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> BusResult<Arc<dyn Connection>>;
}

/// Receiving half of a topic subscription. A retained message, if the broker
/// held one at subscribe time, is yielded before live traffic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    retained: Option<BusMessage>,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        retained: Option<BusMessage>,
        rx: mpsc::UnboundedReceiver<BusMessage>,
    ) -> Self {
        Self {
            topic: topic.into(),
            retained,
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> BusResult<BusMessage> {
        if let Some(message) = self.retained.take() {
            return Ok(message);
        }
        self.rx.recv().await.ok_or(BusError::Closed)
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        if let Some(message) = self.retained.take() {
            return Some(message);
        }
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retained_message_is_yielded_first() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new(
            "room",
            Some(BusMessage {
                topic: "room".into(),
                payload: Bytes::from_static(b"snapshot"),
            }),
            rx,
        );
        tx.send(BusMessage {
            topic: "room".into(),
            payload: Bytes::from_static(b"live"),
        })
        .expect("send");

        assert_eq!(sub.recv().await.expect("first").payload, "snapshot");
        assert_eq!(sub.recv().await.expect("second").payload, "live");
        drop(tx);
        assert!(matches!(sub.recv().await, Err(BusError::Closed)));
    }
}
