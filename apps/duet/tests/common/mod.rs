#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use duet_core::media::{LoopbackDevices, LoopbackNetwork};
use duet_core::persistence::MemorySnapshotStore;
use duet_core::supervisor::Status;
use duet_core::{Command, Event, ParticipantConfig, ParticipantHandle, Services};
use duet_proto::{ChallengeKind, Role, SessionState, TurnStatus};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use transport_bus::LocalBroker;

pub const CODE: &str = "ABCD";
pub const WAIT: Duration = Duration::from_secs(30);

pub struct Peer {
    pub role: Role,
    pub handle: ParticipantHandle,
    pub events: UnboundedReceiver<Event>,
    pub devices: Arc<LoopbackDevices>,
    pub store: Arc<MemorySnapshotStore>,
}

impl Peer {
    pub fn send(&self, command: Command) {
        assert!(self.handle.send(command), "participant stopped");
    }

    pub fn client_id(&self) -> String {
        self.handle.client_id().to_string()
    }

    pub async fn leave(self) {
        self.handle.leave().await;
    }

    pub fn abort(self) {
        self.handle.abort();
    }

    pub async fn event<F>(&mut self, pred: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        match try_event(&mut self.events, pred, WAIT).await {
            Some(event) => event,
            None => panic!("{} timed out waiting for event", self.role),
        }
    }

    pub async fn state<F>(&self, mut pred: F) -> SessionState
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.handle.watch_state();
        let state = timeout(WAIT, rx.wait_for(|state| pred(state)))
            .await
            .expect("timed out waiting for state")
            .expect("participant stopped")
            .clone();
        state
    }

    pub async fn call_status(&self, status: duet_core::call::CallStatus) {
        let mut rx = self.handle.watch_call();
        timeout(WAIT, rx.wait_for(|call| call.status == status))
            .await
            .expect("timed out waiting for call state")
            .expect("participant stopped");
    }

    /// Waits until the participant has attached to the channel.
    pub async fn connected(&mut self) {
        self.event(|event| {
            matches!(event, Event::Connectivity(state) if state.status == Status::Connected)
        })
        .await;
    }
}

/// Next event matching `pred` within `wait`, or `None`.
pub async fn try_event<F>(
    events: &mut UnboundedReceiver<Event>,
    mut pred: F,
    wait: Duration,
) -> Option<Event>
where
    F: FnMut(&Event) -> bool,
{
    timeout(wait, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return Some(event),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[derive(Clone, Default)]
pub struct World {
    pub broker: LocalBroker,
    pub network: LoopbackNetwork,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, config: ParticipantConfig) -> Peer {
        self.spawn_with(config, Arc::new(MemorySnapshotStore::new()))
    }

    pub fn spawn_with(&self, config: ParticipantConfig, store: Arc<MemorySnapshotStore>) -> Peer {
        let devices = Arc::new(LoopbackDevices::new());
        let role = config.role;
        let services = Services {
            connector: Arc::new(self.broker.clone()),
            devices: devices.clone(),
            transport: Arc::new(self.network.clone()),
            store: store.clone(),
            questions: Default::default(),
        };
        let (handle, events) = duet_core::spawn(config, services);
        Peer {
            role,
            handle,
            events,
            devices,
            store,
        }
    }

    /// Host and guest on the same session, each having seen the other.
    pub async fn pair(&self) -> (Peer, Peer) {
        self.pair_with(host(), guest()).await
    }

    pub async fn pair_with(&self, host: ParticipantConfig, guest: ParticipantConfig) -> (Peer, Peer) {
        let mut host = self.spawn(host);
        host.connected().await;
        let mut guest = self.spawn(guest);
        host.event(|e| matches!(e, Event::PartnerJoined { .. })).await;
        guest.event(|e| matches!(e, Event::PartnerJoined { .. })).await;
        guest.state(|s| s.host_name == "Alex" && s.guest_name == "Sam").await;
        (host, guest)
    }
}

pub fn host() -> ParticipantConfig {
    ParticipantConfig::new(CODE, Role::Host, "Alex")
}

pub fn guest() -> ParticipantConfig {
    ParticipantConfig::new(CODE, Role::Guest, "Sam")
}

fn active_status(state: &SessionState, status: TurnStatus) -> bool {
    state.active_turn.as_ref().is_some_and(|turn| turn.status == status)
}

/// Plays one accepted turn owned by `owner`.
pub async fn play_round(owner: &Peer, other: &Peer, kind: ChallengeKind, challenge: &str, answer: &str) {
    let done = owner
        .state(|s| s.active_turn.is_none() && s.current_turn == owner.role)
        .await
        .turn_history
        .len();
    owner.send(Command::StartTurn(kind));
    other.state(|s| active_status(s, TurnStatus::Selecting)).await;
    other.send(Command::SubmitChallenge {
        text: challenge.to_string(),
        time_limit: None,
    });
    owner.state(|s| active_status(s, TurnStatus::Pending)).await;
    owner.send(Command::SubmitResponse {
        text: answer.to_string(),
        media: None,
    });
    other.state(|s| active_status(s, TurnStatus::Answered)).await;
    other.send(Command::CompleteTurn {
        accepted: true,
        loved: false,
    });
    owner.state(|s| s.turn_history.len() == done + 1).await;
}

pub fn is_status(state: &SessionState, status: TurnStatus) -> bool {
    active_status(state, status)
}
