//! Session channel: typed envelopes over one bus topic.

use std::sync::Arc;

use bytes::Bytes;
use duet_proto::{session_topic, Envelope, Message};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use transport_bus::{BusMessage, ConnectOptions, Connection, PublishOptions, Subscription};

/// Publishing side of the session channel plus the pump feeding inbound
/// envelopes to the participant.
pub struct Channel {
    topic: String,
    sender_id: String,
    connection: Option<Arc<dyn Connection>>,
    pump: Option<JoinHandle<()>>,
}

impl Channel {
    pub fn new(code: &str, sender_id: impl Into<String>) -> Self {
        Self {
            topic: session_topic(code),
            sender_id: sender_id.into(),
            connection: None,
            pump: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Connect options carrying the last will announcing `name`'s departure.
    pub fn connect_options(&self, name: &str) -> ConnectOptions {
        let will = Envelope::new(
            Message::PartnerDisconnected {
                name: name.to_string(),
            },
            self.sender_id.clone(),
        );
        let options = ConnectOptions::new(self.sender_id.clone());
        match will.to_json() {
            Ok(json) => options.with_last_will(self.topic.clone(), Bytes::from(json)),
            Err(err) => {
                warn!(target = "duet::channel", error = %err, "failed to encode last will");
                options
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }

    /// Adopts a fresh connection and subscribes to the session topic. Each
    /// decoded envelope not sent by us is handed to `deliver`; the pump stops
    /// when the subscription ends or `deliver` returns `false`.
    pub fn attach<F>(&mut self, connection: Arc<dyn Connection>, deliver: F)
    where
        F: Fn(Envelope) -> bool + Send + 'static,
    {
        self.detach();
        match connection.subscribe(&self.topic) {
            Ok(subscription) => {
                debug!(target = "duet::channel", topic = %self.topic, "subscribed");
                self.pump = Some(spawn_pump(subscription, self.sender_id.clone(), deliver));
            }
            Err(err) => {
                warn!(target = "duet::channel", topic = %self.topic, error = %err, "subscribe failed");
            }
        }
        self.connection = Some(connection);
    }

    /// Forgets the current connection without a goodbye.
    pub fn detach(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.connection = None;
    }

    /// Best effort: logs and drops the message while offline.
    pub fn send(&self, message: Message) {
        let kind = message.kind();
        let Some(connection) = self.connection.as_ref().filter(|c| c.is_connected()) else {
            warn!(target = "duet::channel", kind, "channel not connected; message dropped");
            return;
        };
        let options = if message.is_retained() {
            PublishOptions::RETAINED
        } else {
            PublishOptions::TRANSIENT
        };
        let envelope = Envelope::new(message, self.sender_id.clone());
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(target = "duet::channel", kind, error = %err, "failed to encode envelope");
                return;
            }
        };
        match connection.publish(&self.topic, Bytes::from(json), options) {
            Ok(()) => trace!(target = "duet::channel", kind, retain = options.retain, "published"),
            Err(err) => warn!(target = "duet::channel", kind, error = %err, "publish failed"),
        }
    }

    /// Announces departure and closes the connection politely, which makes the
    /// broker discard the last will.
    pub fn leave(&mut self, name: &str) {
        self.send(Message::PartnerDisconnected {
            name: name.to_string(),
        });
        if let Some(connection) = self.connection.as_ref() {
            connection.disconnect();
        }
        self.detach();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Decodes a raw bus message, dropping malformed frames and our own echoes.
pub fn decode_inbound(message: &BusMessage, local_id: &str) -> Option<Envelope> {
    match Envelope::from_slice(&message.payload) {
        Ok(envelope) if envelope.sender_id == local_id => {
            trace!(target = "duet::channel", kind = envelope.message.kind(), "ignoring self echo");
            None
        }
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(target = "duet::channel", topic = %message.topic, error = %err, "dropping undecodable envelope");
            None
        }
    }
}

fn spawn_pump<F>(mut subscription: Subscription, local_id: String, deliver: F) -> JoinHandle<()>
where
    F: Fn(Envelope) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(message) = subscription.recv().await {
            if let Some(envelope) = decode_inbound(&message, &local_id) {
                if !deliver(envelope) {
                    break;
                }
            }
        }
        debug!(target = "duet::channel", topic = subscription.topic(), "inbound pump stopped");
    })
}
