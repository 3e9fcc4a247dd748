use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{
    Bus, BusError, BusMessage, BusResult, ConnectOptions, Connection, Connector, LastWill,
    LinkState, PublishOptions, Subscription,
};

/// In-process broker with retained messages and last-will delivery.
///
/// Used directly by tests and embedded by the relay, which fronts it with a
/// WebSocket endpoint.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    clients: HashMap<String, ClientEntry>,
    next_session: u64,
}

#[derive(Default)]
struct TopicState {
    retained: Option<Bytes>,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    session: u64,
    tx: mpsc::UnboundedSender<BusMessage>,
}

struct ClientEntry {
    session: u64,
    will: Option<LastWill>,
    link: watch::Sender<LinkState>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
            }),
        }
    }

    pub fn connect_local(&self, options: ConnectOptions) -> BusResult<LocalConnection> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(BusError::Unreachable("broker offline".into()));
        }
        let (link_tx, link_rx) = watch::channel(LinkState::Up);
        let mut state = self.inner.state.lock();
        state.next_session += 1;
        let session = state.next_session;
        if let Some(previous) = state.clients.remove(&options.client_id) {
            debug!(
                target = "transport_bus",
                client_id = %options.client_id,
                "client id reused; dropping previous session"
            );
            drop_session(&mut state, previous.session);
            let _ = previous.link.send(LinkState::Down);
        }
        state.clients.insert(
            options.client_id.clone(),
            ClientEntry {
                session,
                will: options.last_will,
                link: link_tx,
            },
        );
        debug!(
            target = "transport_bus",
            client_id = %options.client_id,
            session,
            "client connected"
        );
        Ok(LocalConnection {
            broker: self.clone(),
            client_id: options.client_id,
            session,
            link: link_rx,
        })
    }

    /// Simulates a network drop for one client: its session ends and its last
    /// will is published.
    pub fn kick(&self, client_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.clients.remove(client_id) else {
            return false;
        };
        end_session(&mut state, client_id, entry, true);
        true
    }

    /// Takes the broker offline (every session ends, no wills are sent) or
    /// brings it back.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        if reachable {
            return;
        }
        let mut state = self.inner.state.lock();
        let clients: Vec<(String, ClientEntry)> = state.clients.drain().collect();
        for (client_id, entry) in clients {
            end_session(&mut state, &client_id, entry, false);
        }
    }

    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.retained.clone())
    }

    pub fn connected_clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn is_current(&self, client_id: &str, session: u64) -> bool {
        self.inner
            .state
            .lock()
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.session == session)
    }

    fn subscribe_session(
        &self,
        client_id: &str,
        session: u64,
        topic: &str,
    ) -> BusResult<Subscription> {
        let mut state = self.inner.state.lock();
        if !state
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.session == session)
        {
            return Err(BusError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let topic_state = state.topics.entry(topic.to_string()).or_default();
        let retained = topic_state.retained.clone().map(|payload| BusMessage {
            topic: topic.to_string(),
            payload,
        });
        topic_state.subscribers.push(Subscriber { session, tx });
        Ok(Subscription::new(topic, retained, rx))
    }

    fn publish_session(
        &self,
        client_id: &str,
        session: u64,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> BusResult<()> {
        let mut state = self.inner.state.lock();
        if !state
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.session == session)
        {
            return Err(BusError::NotConnected);
        }
        route(&mut state, topic, payload, options.retain);
        Ok(())
    }

    fn close_session(&self, client_id: &str, session: u64, publish_will: bool) {
        let mut state = self.inner.state.lock();
        let current = state
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.session == session);
        if !current {
            return;
        }
        if let Some(entry) = state.clients.remove(client_id) {
            end_session(&mut state, client_id, entry, publish_will);
        }
    }
}

fn end_session(state: &mut BrokerState, client_id: &str, entry: ClientEntry, publish_will: bool) {
    drop_session(state, entry.session);
    let _ = entry.link.send(LinkState::Down);
    match (publish_will, entry.will) {
        (true, Some(will)) => {
            debug!(
                target = "transport_bus",
                client_id,
                topic = %will.topic,
                "publishing last will"
            );
            route(state, &will.topic, will.payload, false);
        }
        _ => {
            debug!(target = "transport_bus", client_id, "client session closed");
        }
    }
}

impl TopicState {
    fn is_idle(&self) -> bool {
        self.retained.is_none() && self.subscribers.is_empty()
    }
}

fn drop_session(state: &mut BrokerState, session: u64) {
    state.topics.retain(|_, topic| {
        topic.subscribers.retain(|sub| sub.session != session);
        !topic.is_idle()
    });
}

fn route(state: &mut BrokerState, topic: &str, payload: Bytes, retain: bool) {
    let topic_state = state.topics.entry(topic.to_string()).or_default();
    if retain {
        topic_state.retained = Some(payload.clone());
    }
    topic_state.subscribers.retain(|sub| {
        sub.tx
            .send(BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
    });
    if topic_state.is_idle() {
        state.topics.remove(topic);
    }
}

#[async_trait]
impl Connector for LocalBroker {
    async fn connect(&self, options: ConnectOptions) -> BusResult<Arc<dyn Connection>> {
        let connection = self.connect_local(options)?;
        Ok(Arc::new(connection))
    }
}

/// One client session on a [`LocalBroker`]. Dropping it without calling
/// [`Connection::disconnect`] counts as an abrupt disconnect.
pub struct LocalConnection {
    broker: LocalBroker,
    client_id: String,
    session: u64,
    link: watch::Receiver<LinkState>,
}

impl LocalConnection {
    /// Ends the session as if the network went away; the last will fires.
    pub fn sever(&self) {
        self.broker.close_session(&self.client_id, self.session, true);
    }
}

impl Bus for LocalConnection {
    fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        self.broker
            .subscribe_session(&self.client_id, self.session, topic)
    }

    fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> BusResult<()> {
        self.broker
            .publish_session(&self.client_id, self.session, topic, payload, options)
    }
}

impl Connection for LocalConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn link(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    fn is_connected(&self) -> bool {
        self.broker.is_current(&self.client_id, self.session)
    }

    fn disconnect(&self) {
        self.broker
            .close_session(&self.client_id, self.session, false);
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.sever();
    }
}
