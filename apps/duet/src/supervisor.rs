//! Connection lifecycle for the session channel: first connect, manual retry
//! after a failed start, and automatic reconnects once the session is up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use transport_bus::{ConnectOptions, Connection, Connector, LinkState};

pub const CONNECT_FAILED: &str = "Could not connect to game server.";

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Initializing,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorState {
    pub status: Status,
    pub connectivity: Connectivity,
    pub last_error: Option<String>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            connectivity: Connectivity::Disconnected,
            last_error: None,
        }
    }
}

/// Link transitions handed to the owner of the channel.
pub enum LinkEvent {
    Up(Arc<dyn Connection>),
    Down,
    Failed(String),
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    state: watch::Sender<SupervisorState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::default());
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                state,
                events,
                task: Mutex::new(None),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.state.borrow().clone()
    }

    /// Begins a connection attempt if idle. Returns whether one was started.
    pub fn start(&self) -> bool {
        if self.is_closing() {
            return false;
        }
        let mut started = false;
        self.inner.state.send_if_modified(|state| {
            if state.status != Status::Idle {
                return false;
            }
            state.status = Status::Initializing;
            state.connectivity = Connectivity::Reconnecting;
            started = true;
            true
        });
        if !started {
            debug!(target = "duet::supervisor", "start ignored; attempt already made");
            return false;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run().await });
        if let Some(previous) = self.inner.task.lock().replace(handle) {
            previous.abort();
        }
        true
    }

    /// Leaves the error state and tries again. Ignored unless the last attempt
    /// failed, so repeated calls cannot stack attempts.
    pub fn retry(&self) -> bool {
        let mut reset = false;
        self.inner.state.send_if_modified(|state| {
            if state.status != Status::Error {
                return false;
            }
            state.status = Status::Idle;
            state.last_error = None;
            reset = true;
            true
        });
        if !reset {
            debug!(target = "duet::supervisor", "retry ignored; not in error state");
            return false;
        }
        info!(target = "duet::supervisor", "retrying connection");
        self.start()
    }

    /// Stops supervising. Link loss after this point is not acted upon.
    pub fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner
            .state
            .send_modify(|state| state.connectivity = Connectivity::Disconnected);
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    fn set_connectivity(&self, connectivity: Connectivity) {
        self.inner.state.send_if_modified(|state| {
            let changed = state.connectivity != connectivity;
            state.connectivity = connectivity;
            changed
        });
    }

    async fn run(self) {
        let Some(mut link) = self.connect_initial().await else {
            return;
        };
        loop {
            let _ = link.wait_for(|state| *state == LinkState::Down).await;
            if self.is_closing() {
                return;
            }
            warn!(target = "duet::supervisor", "link lost");
            self.set_connectivity(Connectivity::Disconnected);
            if self.inner.events.send(LinkEvent::Down).is_err() {
                return;
            }
            link = match self.reconnect().await {
                Some(link) => link,
                None => return,
            };
        }
    }

    async fn connect_initial(&self) -> Option<watch::Receiver<LinkState>> {
        match self.inner.connector.connect(self.inner.options.clone()).await {
            Ok(connection) => {
                info!(
                    target = "duet::supervisor",
                    client_id = connection.client_id(),
                    "connected"
                );
                self.adopt(connection)
            }
            Err(err) => {
                warn!(target = "duet::supervisor", error = %err, "initial connection failed");
                self.inner.state.send_modify(|state| {
                    state.status = Status::Error;
                    state.connectivity = Connectivity::Disconnected;
                    state.last_error = Some(CONNECT_FAILED.to_string());
                });
                let _ = self
                    .inner
                    .events
                    .send(LinkEvent::Failed(CONNECT_FAILED.to_string()));
                None
            }
        }
    }

    async fn reconnect(&self) -> Option<watch::Receiver<LinkState>> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt: u32 = 0;
        loop {
            if self.is_closing() || self.inner.events.is_closed() {
                return None;
            }
            attempt += 1;
            self.set_connectivity(Connectivity::Reconnecting);
            sleep(delay).await;
            match self.inner.connector.connect(self.inner.options.clone()).await {
                Ok(connection) => {
                    info!(target = "duet::supervisor", attempt, "reconnected");
                    return self.adopt(connection);
                }
                Err(err) => {
                    warn!(
                        target = "duet::supervisor",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "reconnect attempt failed"
                    );
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn adopt(&self, connection: Arc<dyn Connection>) -> Option<watch::Receiver<LinkState>> {
        let link = connection.link();
        self.inner.state.send_modify(|state| {
            state.status = Status::Connected;
            state.connectivity = Connectivity::Connected;
            state.last_error = None;
        });
        if let Err(SendError(LinkEvent::Up(connection))) =
            self.inner.events.send(LinkEvent::Up(connection))
        {
            // Nobody is listening any more; leave without triggering the will.
            connection.disconnect();
            return None;
        }
        Some(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::LocalBroker;

    fn supervisor(broker: &LocalBroker) -> (Supervisor, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            Arc::new(broker.clone()),
            ConnectOptions::new("duet-abcd-test01"),
            tx,
        );
        (supervisor, rx)
    }

    #[tokio::test]
    async fn failed_start_sets_error_until_retry_succeeds() {
        let broker = LocalBroker::new();
        broker.set_reachable(false);
        let (supervisor, mut events) = supervisor(&broker);
        let mut state = supervisor.subscribe();

        assert!(supervisor.start());
        assert!(matches!(events.recv().await, Some(LinkEvent::Failed(_))));
        let snapshot = state.borrow_and_update().clone();
        assert_eq!(snapshot.status, Status::Error);
        assert_eq!(snapshot.last_error.as_deref(), Some(CONNECT_FAILED));
        assert!(!supervisor.start(), "start only runs from idle");

        broker.set_reachable(true);
        assert!(supervisor.retry());
        assert!(matches!(events.recv().await, Some(LinkEvent::Up(_))));
        let snapshot = supervisor.state();
        assert_eq!(snapshot.status, Status::Connected);
        assert_eq!(snapshot.connectivity, Connectivity::Connected);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn retry_is_ignored_unless_in_error() {
        let broker = LocalBroker::new();
        let (supervisor, mut events) = supervisor(&broker);
        assert!(!supervisor.retry());
        assert!(supervisor.start());
        assert!(matches!(events.recv().await, Some(LinkEvent::Up(_))));
        assert!(!supervisor.retry());
        assert!(!supervisor.retry());
        assert_eq!(broker.connected_clients(), vec!["duet-abcd-test01".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_link_loss_while_staying_connected() {
        let broker = LocalBroker::new();
        let (supervisor, mut events) = supervisor(&broker);
        supervisor.start();
        let _first = match events.recv().await {
            Some(LinkEvent::Up(connection)) => connection,
            _ => panic!("expected link up"),
        };

        broker.set_reachable(false);
        assert!(matches!(events.recv().await, Some(LinkEvent::Down)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let state = supervisor.state();
        assert_eq!(state.status, Status::Connected);
        assert_eq!(state.connectivity, Connectivity::Reconnecting);

        broker.set_reachable(true);
        assert!(matches!(events.recv().await, Some(LinkEvent::Up(_))));
        assert_eq!(supervisor.state().connectivity, Connectivity::Connected);
    }

    #[tokio::test]
    async fn shutdown_stops_reconnecting() {
        let broker = LocalBroker::new();
        let (supervisor, mut events) = supervisor(&broker);
        supervisor.start();
        let connection = match events.recv().await {
            Some(LinkEvent::Up(connection)) => connection,
            _ => panic!("expected link up"),
        };
        supervisor.shutdown();
        connection.disconnect();
        drop(connection);
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
        assert!(broker.connected_clients().is_empty());
    }
}
