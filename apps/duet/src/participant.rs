//! One participant of a session: a single task that owns the game engine,
//! presence cache, call machine, channel and timers. Commands from the
//! handle, inbound envelopes, timer expiries, media events and link changes
//! are queued and handled one at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use duet_proto::{
    now_millis, ChallengeKind, ChatMessage, Envelope, GameMode, Intensity, MediaAttachment,
    Message, PlayerInfo, Role, SessionState, TurnKey,
};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_bus::Connector;

use crate::call::{CallFailure, CallMachine, CallState, CallStatus, IncomingOutcome, NativeOutcome};
use crate::channel::Channel;
use crate::config::Config;
use crate::content::QuestionSource;
use crate::game::{GameEngine, Transition};
use crate::media::{CallEvent, MediaCall, MediaDevices, MediaTransport};
use crate::persistence::{fresh_snapshot, SavedSession, SnapshotStore};
use crate::presence::Presence;
use crate::supervisor::{LinkEvent, Supervisor, SupervisorState};
use crate::timers::KeyedTimer;

const PING_EMOJIS: &[&str] = &["❤️", "😘", "🔥", "😂", "🥰", "😈"];

#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub code: String,
    pub role: Role,
    pub name: String,
    pub intensity: Intensity,
    pub mode: GameMode,
    pub auto_select_delay: Duration,
    pub call_retry_delay: Duration,
}

impl ParticipantConfig {
    pub fn new(code: impl Into<String>, role: Role, name: impl Into<String>) -> Self {
        let defaults = Config::default();
        Self {
            code: code.into(),
            role,
            name: name.into(),
            intensity: Intensity::Friendly,
            mode: GameMode::Fixed,
            auto_select_delay: defaults.auto_select_delay,
            call_retry_delay: defaults.call_retry_delay,
        }
    }

    pub fn with_game(mut self, intensity: Intensity, mode: GameMode) -> Self {
        self.intensity = intensity;
        self.mode = mode;
        self
    }

    pub fn with_timings(mut self, config: &Config) -> Self {
        self.auto_select_delay = config.auto_select_delay;
        self.call_retry_delay = config.call_retry_delay;
        self
    }
}

/// Everything a participant talks to outside its own state.
#[derive(Clone)]
pub struct Services {
    pub connector: Arc<dyn Connector>,
    pub devices: Arc<dyn MediaDevices>,
    pub transport: Arc<dyn MediaTransport>,
    pub store: Arc<dyn SnapshotStore>,
    pub questions: QuestionSource,
}

#[derive(Debug, Clone)]
pub enum Command {
    StartTurn(ChallengeKind),
    SubmitChallenge {
        text: String,
        time_limit: Option<u32>,
    },
    SubmitResponse {
        text: String,
        media: Option<MediaAttachment>,
    },
    CompleteTurn {
        accepted: bool,
        loved: bool,
    },
    RequestIntensity(Intensity),
    /// Host answer to the partner's pending intensity request.
    RespondIntensity(bool),
    ToggleAutoSelect,
    SendChat {
        text: String,
        media: Option<MediaAttachment>,
    },
    SetTyping(String),
    MarkRead(String),
    Ping,
    StartCall,
    AcceptCall,
    RejectCall,
    EndCall,
    ToggleMute,
    ToggleVideo,
    SetMinimized(bool),
    Suggest {
        kind: ChallengeKind,
        keywords: Option<String>,
    },
    React,
    Retry,
    Leave,
}

#[derive(Debug, Clone)]
pub enum Event {
    StateChanged,
    PartnerJoined { name: String, role: Role },
    PartnerDisconnected { name: String },
    ChatReceived(ChatMessage),
    Typing(String),
    MessageRead(String),
    Ping(String),
    IntensityRequested(Intensity),
    IntensityChanged(Intensity),
    IntensityDenied,
    TurnRejected,
    LevelUp(Intensity),
    AutoSelectToggled(bool),
    Call(CallState),
    IncomingCall,
    CallFailed(CallFailure),
    CallDeclined,
    Connectivity(SupervisorState),
    Suggestion { kind: ChallengeKind, text: String },
    Reaction(String),
}

/// Auto-select is keyed by whose turn it is and how many turns are done.
type AutoKey = (Role, usize);

enum Input {
    Inbound(Envelope),
    TurnExpired(TurnKey),
    AutoSelect(AutoKey),
    CallRetry(u64),
    Media { generation: u64, event: CallEvent },
    IncomingCall(MediaCall),
}

pub struct ParticipantHandle {
    client_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    call: watch::Receiver<CallState>,
    connectivity: watch::Receiver<SupervisorState>,
    task: JoinHandle<()>,
}

impl ParticipantHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queues a command. Returns `false` once the participant has stopped.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn call_state(&self) -> CallState {
        *self.call.borrow()
    }

    pub fn watch_call(&self) -> watch::Receiver<CallState> {
        self.call.clone()
    }

    pub fn connectivity(&self) -> SupervisorState {
        self.connectivity.borrow().clone()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<SupervisorState> {
        self.connectivity.clone()
    }

    /// Says goodbye to the partner and waits for the participant to stop.
    pub async fn leave(self) {
        let _ = self.commands.send(Command::Leave);
        if let Err(err) = self.task.await {
            warn!(target = "duet::participant", error = %err, "participant task ended abnormally");
        }
    }

    /// Stops without a goodbye, as a crash or closed tab would.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Starts a participant. Must be called from within a tokio runtime.
pub fn spawn(config: ParticipantConfig, services: Services) -> (ParticipantHandle, mpsc::UnboundedReceiver<Event>) {
    let client_id = client_id(&config.code);
    let state = initial_state(&config, services.store.as_ref());

    let engine = GameEngine::new(config.role, config.name.clone(), state.clone());
    let presence = Presence::new(PlayerInfo {
        name: config.name.clone(),
        role: config.role,
        peer_id: client_id.clone(),
    });
    let channel = Channel::new(&config.code, client_id.clone());

    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(
        Arc::clone(&services.connector),
        channel.connect_options(&config.name),
        link_tx,
    );
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(state);
    let (call_tx, call_rx) = watch::channel(CallMachine::new().state());
    let connectivity = supervisor.subscribe();

    let incoming_calls = listen_for_calls(services.transport.as_ref(), &client_id, input_tx.clone());

    info!(
        target = "duet::participant",
        code = %config.code,
        role = %config.role,
        client_id = %client_id,
        "joining session"
    );

    let actor = Actor {
        config,
        services,
        engine,
        presence,
        call: CallMachine::new(),
        channel,
        supervisor: supervisor.clone(),
        turn_timer: KeyedTimer::new(),
        auto_timer: KeyedTimer::new(),
        call_retry: KeyedTimer::new(),
        pending_intensity: None,
        incoming_calls,
        inputs: input_tx,
        events: event_tx,
        state_tx,
        call_tx,
    };
    supervisor.start();
    let task = tokio::spawn(actor.run(command_rx, input_rx, link_rx));

    (
        ParticipantHandle {
            client_id,
            commands: command_tx,
            state: state_rx,
            call: call_rx,
            connectivity,
            task,
        },
        event_rx,
    )
}

fn client_id(code: &str) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("duet-{}-{suffix}", code.to_ascii_lowercase())
}

fn initial_state(config: &ParticipantConfig, store: &dyn SnapshotStore) -> SessionState {
    match fresh_snapshot(store, &config.code, now_millis()) {
        Ok(Some(mut state)) => {
            info!(target = "duet::participant", code = %config.code, "restored saved session");
            state.set_name(config.role, config.name.clone());
            state
        }
        Ok(None) => SessionState::new(
            config.code.clone(),
            config.role,
            config.name.clone(),
            config.intensity,
            config.mode,
        ),
        Err(err) => {
            warn!(target = "duet::participant", error = %err, "failed to read saved session");
            SessionState::new(
                config.code.clone(),
                config.role,
                config.name.clone(),
                config.intensity,
                config.mode,
            )
        }
    }
}

fn listen_for_calls(
    transport: &dyn MediaTransport,
    peer_id: &str,
    inputs: mpsc::UnboundedSender<Input>,
) -> Option<JoinHandle<()>> {
    let mut calls = match transport.listen(peer_id) {
        Ok(calls) => calls,
        Err(err) => {
            warn!(target = "duet::call", error = %err, "incoming calls unavailable");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while let Some(call) = calls.recv().await {
            if inputs.send(Input::IncomingCall(call)).is_err() {
                break;
            }
        }
    }))
}

fn random_kind() -> ChallengeKind {
    if rand::thread_rng().gen_bool(0.5) {
        ChallengeKind::Truth
    } else {
        ChallengeKind::Dare
    }
}

fn random_emoji() -> &'static str {
    PING_EMOJIS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("❤️")
}

struct Actor {
    config: ParticipantConfig,
    services: Services,
    engine: GameEngine,
    presence: Presence,
    call: CallMachine,
    channel: Channel,
    supervisor: Supervisor,
    turn_timer: KeyedTimer<TurnKey>,
    auto_timer: KeyedTimer<AutoKey>,
    call_retry: KeyedTimer<u64>,
    pending_intensity: Option<Intensity>,
    incoming_calls: Option<JoinHandle<()>>,
    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<Event>,
    state_tx: watch::Sender<SessionState>,
    call_tx: watch::Sender<CallState>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut links: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            // Link changes first so commands queued meanwhile see the new link.
            tokio::select! {
                biased;
                Some(link) = links.recv() => self.on_link(link),
                Some(input) = inputs.recv() => self.on_input(input),
                command = commands.recv() => match command {
                    Some(Command::Leave) => {
                        self.leave();
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!(target = "duet::participant", "handle dropped; stopping without goodbye");
                        break;
                    }
                },
            }
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn role(&self) -> Role {
        self.config.role
    }

    fn apply(&mut self, transition: Option<Transition>) -> bool {
        let Some(transition) = transition else {
            return false;
        };
        for message in transition.outbound {
            self.channel.send(message);
        }
        if let Some(level) = transition.level_up {
            self.emit(Event::LevelUp(level));
        }
        self.after_state();
        true
    }

    /// Runs after every change to the session state.
    fn after_state(&mut self) {
        self.state_tx.send_replace(self.engine.state().clone());
        self.emit(Event::StateChanged);
        self.sync_turn_timer();
        self.sync_auto_select();
        self.persist();
    }

    fn sync_turn_timer(&mut self) {
        let Some((key, deadline)) = self.engine.local_timer() else {
            self.turn_timer.disarm();
            return;
        };
        let delay = Duration::from_millis(deadline.saturating_sub(now_millis()));
        let inputs = self.inputs.clone();
        let expired = key.clone();
        if self.turn_timer.arm(key, delay, async move {
            let _ = inputs.send(Input::TurnExpired(expired));
        }) {
            debug!(target = "duet::game", delay_ms = delay.as_millis() as u64, "turn timer armed");
        }
    }

    fn sync_auto_select(&mut self) {
        if !self.engine.auto_select_due() {
            self.auto_timer.disarm();
            return;
        }
        let state = self.engine.state();
        let key = (state.current_turn, state.turn_history.len());
        let inputs = self.inputs.clone();
        self.auto_timer.arm(key, self.config.auto_select_delay, async move {
            let _ = inputs.send(Input::AutoSelect(key));
        });
    }

    fn persist(&self) {
        let state = self.engine.state();
        if !state.any_name_resolved() {
            return;
        }
        let store = &self.services.store;
        if let Err(err) = store.save(state) {
            warn!(target = "duet::store", error = %err, "failed to save snapshot");
        }
        let entry = SavedSession::from_state(state, self.role(), &self.config.name);
        if let Err(err) = store.remember(entry) {
            warn!(target = "duet::store", error = %err, "failed to update recent sessions");
        }
    }

    fn publish_call(&self) {
        let state = self.call.state();
        if *self.call_tx.borrow() != state {
            self.call_tx.send_replace(state);
            self.emit(Event::Call(state));
        }
    }

    fn on_link(&mut self, link: LinkEvent) {
        match link {
            LinkEvent::Up(connection) => {
                let inputs = self.inputs.clone();
                self.channel
                    .attach(connection, move |envelope| inputs.send(Input::Inbound(envelope)).is_ok());
                for message in self.presence.announce() {
                    self.channel.send(message);
                }
            }
            LinkEvent::Down => self.channel.detach(),
            LinkEvent::Failed(reason) => {
                warn!(target = "duet::participant", %reason, "could not join session");
            }
        }
        self.emit(Event::Connectivity(self.supervisor.state()));
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Inbound(envelope) => self.on_message(envelope.message),
            Input::TurnExpired(key) => {
                self.turn_timer.disarm_if(&key);
                let failed = self.engine.fail_turn(&key);
                self.apply(failed);
            }
            Input::AutoSelect(key) => {
                let state = self.engine.state();
                if !self.engine.auto_select_due() || (state.current_turn, state.turn_history.len()) != key {
                    debug!(target = "duet::game", "auto-select no longer due");
                    return;
                }
                let started = self.engine.start_turn(random_kind());
                self.apply(started);
            }
            Input::CallRetry(generation) => self.on_call_retry(generation),
            Input::Media { generation, event } => self.on_media(generation, event),
            Input::IncomingCall(call) => self.on_incoming_call(call),
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::GameStateSync(state) => self.on_snapshot(*state),
            Message::PlayerInfo(info) => {
                let update = self.presence.record(info.clone());
                if update.first_arrival && info.role != self.role() {
                    self.emit(Event::PartnerJoined {
                        name: info.name.clone(),
                        role: info.role,
                    });
                }
                let learned = self.engine.learn_partner(&info);
                self.apply(learned);
            }
            Message::RequestPlayerInfo {} => self.channel.send(self.presence.info_message()),
            Message::PartnerDisconnected { name } => {
                self.end_call(false);
                self.presence.forget_partner();
                info!(target = "duet::presence", %name, "partner left");
                self.emit(Event::PartnerDisconnected { name });
            }
            Message::ChatMessage(chat) => {
                if self.engine.receive_chat(chat.clone()) {
                    self.emit(Event::ChatReceived(chat));
                    self.after_state();
                }
            }
            Message::RealtimeTyping { text } => self.emit(Event::Typing(text)),
            Message::ReadReceipt { message_id } => {
                if self.engine.mark_read(&message_id) {
                    self.emit(Event::MessageRead(message_id));
                    self.after_state();
                }
            }
            Message::PingEmoji { emoji } => self.emit(Event::Ping(emoji)),
            Message::CallOffer {} => {
                if self.call.on_offer_signal() {
                    self.emit(Event::IncomingCall);
                    self.publish_call();
                }
            }
            Message::CallAccept {} => {
                if self.call.on_accept_signal() {
                    self.publish_call();
                }
            }
            Message::CallReject {} => {
                let declined = self.call.take_unanswered_offer();
                self.end_call(false);
                if declined {
                    self.emit(Event::CallDeclined);
                }
            }
            Message::CallEnd {} => self.end_call(false),
            Message::CallWindowState { minimized } => {
                if self.call.set_minimized(minimized) {
                    self.publish_call();
                }
            }
            Message::IntensityRequest { level } => {
                if self.role() != Role::Host {
                    debug!(target = "duet::game", "ignoring intensity request as guest");
                    return;
                }
                self.pending_intensity = Some(level);
                self.emit(Event::IntensityRequested(level));
            }
            Message::IntensityResponse { accepted, level } => {
                if self.role() != Role::Guest {
                    return;
                }
                match (accepted, level) {
                    (true, Some(level)) => self.emit(Event::IntensityChanged(level)),
                    (true, None) => self.emit(Event::IntensityChanged(self.engine.state().intensity_level)),
                    (false, _) => self.emit(Event::IntensityDenied),
                }
            }
            Message::ToggleAutoSelect { enabled } => {
                if self.engine.apply_auto_select(enabled) {
                    self.after_state();
                }
                self.emit(Event::AutoSelectToggled(enabled));
            }
            Message::RejectTurn {} => self.emit(Event::TurnRejected),
        }
    }

    fn on_snapshot(&mut self, state: SessionState) {
        let role = self.role();
        let previous = self.engine.state();
        let known: HashSet<&str> = previous.chat_messages.iter().map(|m| m.id.as_str()).collect();
        let fresh: Vec<ChatMessage> = state
            .chat_messages
            .iter()
            .filter(|m| m.sender_role != role && !known.contains(m.id.as_str()))
            .cloned()
            .collect();
        let leveled_up = state.game_mode == GameMode::Random
            && state.current_random_mode_intensity > previous.current_random_mode_intensity;
        let level = state.current_random_mode_intensity;

        self.engine.replace(state);
        for chat in fresh {
            self.emit(Event::ChatReceived(chat));
        }
        if leveled_up {
            self.emit(Event::LevelUp(level));
        }
        self.after_state();
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartTurn(kind) => {
                let t = self.engine.start_turn(kind);
                self.apply(t);
            }
            Command::SubmitChallenge { text, time_limit } => {
                let t = self.engine.submit_challenge(&text, time_limit);
                self.apply(t);
            }
            Command::SubmitResponse { text, media } => {
                let t = self.engine.submit_response(&text, media);
                self.apply(t);
            }
            Command::CompleteTurn { accepted, loved } => {
                let t = self.engine.complete_turn(accepted, loved);
                self.apply(t);
            }
            Command::RequestIntensity(level) => {
                let t = self.engine.request_intensity(level);
                if self.apply(t) && self.role() == Role::Host {
                    self.emit(Event::IntensityChanged(level));
                }
            }
            Command::RespondIntensity(accepted) => {
                let Some(level) = self.pending_intensity.take() else {
                    debug!(target = "duet::game", "no intensity request to answer");
                    return;
                };
                let t = self.engine.respond_intensity(accepted, level);
                if self.apply(t) && accepted {
                    self.emit(Event::IntensityChanged(level));
                }
            }
            Command::ToggleAutoSelect => {
                let t = self.engine.toggle_auto_select();
                if self.apply(t) {
                    self.emit(Event::AutoSelectToggled(self.engine.state().auto_select_turn));
                }
            }
            Command::SendChat { text, media } => {
                let t = self.engine.send_chat(&text, media);
                self.apply(t);
            }
            Command::SetTyping(text) => self.channel.send(Message::RealtimeTyping { text }),
            Command::MarkRead(message_id) => {
                if self.engine.mark_read(&message_id) {
                    self.after_state();
                }
                self.channel.send(Message::ReadReceipt { message_id });
            }
            Command::Ping => self.channel.send(Message::PingEmoji {
                emoji: random_emoji().to_string(),
            }),
            Command::StartCall => self.start_call().await,
            Command::AcceptCall => self.accept_call().await,
            Command::RejectCall => {
                if self.call.status() != CallStatus::Ringing {
                    return;
                }
                self.channel.send(Message::CallReject {});
                self.end_call(false);
            }
            Command::EndCall => {
                if self.call.status() != CallStatus::Idle {
                    self.end_call(true);
                }
            }
            Command::ToggleMute => {
                self.call.toggle_mute();
                self.publish_call();
            }
            Command::ToggleVideo => {
                self.call.toggle_video();
                self.publish_call();
            }
            Command::SetMinimized(minimized) => {
                if self.call.set_minimized(minimized) {
                    self.channel.send(Message::CallWindowState { minimized });
                    self.publish_call();
                }
            }
            Command::Suggest { kind, keywords } => self.suggest(kind, keywords),
            Command::React => self.react(),
            Command::Retry => {
                self.supervisor.retry();
            }
            // Handled by the run loop.
            Command::Leave => {}
        }
    }

    fn suggest(&self, kind: ChallengeKind, keywords: Option<String>) {
        let source = self.services.questions.clone();
        let intensity = self.engine.state().active_intensity();
        let events = self.events.clone();
        tokio::spawn(async move {
            let text = source.suggest(kind, intensity, keywords.as_deref()).await;
            let _ = events.send(Event::Suggestion { kind, text });
        });
    }

    fn react(&self) {
        let Some(turn) = self
            .engine
            .state()
            .turn_history
            .iter()
            .rev()
            .find(|turn| turn.response.is_some())
        else {
            debug!(target = "duet::participant", "nothing to react to");
            return;
        };
        let source = self.services.questions.clone();
        let question = turn.challenge.clone();
        let answer = turn.response.clone().unwrap_or_default();
        let kind = turn.kind;
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Some(text) = source.react(&question, &answer, kind).await {
                let _ = events.send(Event::Reaction(text));
            }
        });
    }

    async fn start_call(&mut self) {
        if self.call.status() != CallStatus::Idle {
            debug!(target = "duet::call", status = ?self.call.status(), "call already in progress");
            return;
        }
        let local = match self.services.devices.capture().await {
            Ok(local) => local,
            Err(err) => return self.fail_call(err.into()),
        };
        self.call.begin_offer(local);
        self.publish_call();
        self.dial_partner(true);
    }

    fn dial_partner(&mut self, allow_retry: bool) {
        let Some(peer_id) = self.presence.partner_peer_id().map(str::to_string) else {
            if !allow_retry {
                return self.fail_call(CallFailure::PartnerUnreachable);
            }
            let generation = self.call.generation();
            let inputs = self.inputs.clone();
            info!(target = "duet::call", "partner call identity unknown; retrying shortly");
            self.call_retry.arm(generation, self.config.call_retry_delay, async move {
                let _ = inputs.send(Input::CallRetry(generation));
            });
            return;
        };
        let Some(local) = self.call.local_stream().cloned() else {
            return;
        };
        match self.services.transport.call(&peer_id, local) {
            Ok(call) => {
                let generation = self.call.attach_outgoing(Arc::clone(&call.control));
                self.pump_call_events(generation, call.events);
                self.channel.send(Message::CallOffer {});
                info!(target = "duet::call", %peer_id, "calling partner");
            }
            Err(err) => self.fail_call(err.into()),
        }
    }

    fn on_call_retry(&mut self, generation: u64) {
        self.call_retry.disarm();
        if generation != self.call.generation()
            || self.call.status() != CallStatus::Offering
            || self.call.has_native_call()
        {
            return;
        }
        self.dial_partner(false);
    }

    async fn accept_call(&mut self) {
        if self.call.status() != CallStatus::Ringing {
            debug!(target = "duet::call", "no call to accept");
            return;
        }
        let local = match self.services.devices.capture().await {
            Ok(local) => local,
            Err(err) => return self.fail_call(err.into()),
        };
        let control = self.call.accept(local.clone());
        self.channel.send(Message::CallAccept {});
        if let Some(control) = control {
            if let Err(err) = control.answer(local) {
                return self.fail_call(err.into());
            }
        }
        self.publish_call();
    }

    fn on_incoming_call(&mut self, call: MediaCall) {
        let MediaCall {
            peer_id,
            control,
            events,
        } = call;
        match self.call.on_incoming(Arc::clone(&control)) {
            IncomingOutcome::Ringing(generation) => {
                self.pump_call_events(generation, events);
                self.emit(Event::IncomingCall);
                self.publish_call();
            }
            IncomingOutcome::AnswerNow { generation, local } => {
                self.pump_call_events(generation, events);
                if let Err(err) = control.answer(local) {
                    return self.fail_call(err.into());
                }
                self.publish_call();
            }
            IncomingOutcome::Busy => {
                info!(target = "duet::call", %peer_id, "busy; refusing incoming call");
                control.close();
            }
        }
    }

    fn pump_call_events(&self, generation: u64, mut events: mpsc::UnboundedReceiver<CallEvent>) {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inputs.send(Input::Media { generation, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn on_media(&mut self, generation: u64, event: CallEvent) {
        match self.call.on_native(generation, event) {
            NativeOutcome::Stale | NativeOutcome::Unchanged => {}
            NativeOutcome::Connected | NativeOutcome::Ended => {
                if self.call.status() == CallStatus::Idle {
                    self.call_retry.disarm();
                }
                self.publish_call();
            }
            NativeOutcome::Failed(reason) => {
                self.call_retry.disarm();
                self.channel.send(Message::CallEnd {});
                self.publish_call();
                self.emit(Event::CallFailed(CallFailure::Transport(reason)));
            }
        }
    }

    /// Returns the call to idle, telling the partner when `notify` is set.
    fn end_call(&mut self, notify: bool) {
        self.call_retry.disarm();
        if self.call.teardown() {
            if notify {
                self.channel.send(Message::CallEnd {});
            }
            self.publish_call();
        }
    }

    fn fail_call(&mut self, failure: CallFailure) {
        warn!(target = "duet::call", ?failure, "call failed");
        self.end_call(true);
        self.emit(Event::CallFailed(failure));
    }

    fn leave(&mut self) {
        self.supervisor.shutdown();
        self.turn_timer.disarm();
        self.auto_timer.disarm();
        self.end_call(true);
        self.channel.leave(&self.config.name);
        info!(target = "duet::participant", code = %self.config.code, "left session");
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.supervisor.shutdown();
        if let Some(listener) = self.incoming_calls.take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_scoped_to_the_session() {
        let id = client_id("ABCD");
        let suffix = id.strip_prefix("duet-abcd-").expect("prefix");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(client_id("ABCD"), id);
    }

    #[test]
    fn ping_emoji_comes_from_the_fixed_set() {
        for _ in 0..10 {
            assert!(PING_EMOJIS.contains(&random_emoji()));
        }
    }
}
