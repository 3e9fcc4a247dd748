//! The turn/game machine. Every accepted operation mutates the local
//! [`SessionState`] first and returns what must be published; the caller owns
//! delivery. Operations whose preconditions do not hold are logged no-ops.

use duet_proto::{
    ChallengeKind, ChatMessage, GameMode, Intensity, MediaAttachment, Message, PlayerInfo, Role,
    SessionState, Turn, TurnKey, TurnStatus, QUESTIONS_PER_RANDOM_LEVEL,
};
use tracing::{debug, info};

use crate::content::QuestionDeck;

const MAX_STREAK: u32 = 5;
const STREAK_BONUS: u32 = 2;

/// Points for a confirmed turn: the kind's base value plus a bonus for the
/// owner's current run of confirmed turns.
pub fn score(kind: ChallengeKind, history: &[Turn], owner: Role) -> u32 {
    let streak = history
        .iter()
        .rev()
        .filter(|turn| turn.owner == owner)
        .take_while(|turn| turn.status == TurnStatus::Confirmed)
        .count() as u32;
    kind.base_points() + STREAK_BONUS * streak.min(MAX_STREAK)
}

/// Result of an applied operation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Messages to publish, in order.
    pub outbound: Vec<Message>,
    /// Set when progressive mode moved to a new level.
    pub level_up: Option<Intensity>,
}

impl Transition {
    fn publish(messages: impl IntoIterator<Item = Message>) -> Self {
        Self {
            outbound: messages.into_iter().collect(),
            level_up: None,
        }
    }
}

pub struct GameEngine {
    role: Role,
    name: String,
    state: SessionState,
}

impl GameEngine {
    pub fn new(role: Role, name: impl Into<String>, state: SessionState) -> Self {
        Self {
            role,
            name: name.into(),
            state,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// A snapshot from the partner replaces ours wholesale.
    pub fn replace(&mut self, state: SessionState) {
        debug!(
            target = "duet::game",
            last_updated = state.last_updated,
            history = state.turn_history.len(),
            "applying snapshot"
        );
        self.state = state;
    }

    fn commit(&mut self, mut extra: Vec<Message>) -> Transition {
        self.state.touch();
        let mut outbound = vec![Message::snapshot(&self.state)];
        outbound.append(&mut extra);
        Transition::publish(outbound)
    }

    fn refuse(&self, op: &'static str, reason: &'static str) -> Option<Transition> {
        debug!(target = "duet::game", op, reason, role = %self.role, "operation ignored");
        None
    }

    fn is_mine(&self) -> bool {
        self.state.current_turn == self.role
    }

    pub fn start_turn(&mut self, kind: ChallengeKind) -> Option<Transition> {
        if self.state.active_turn.is_some() {
            return self.refuse("start_turn", "turn already active");
        }
        if !self.is_mine() {
            return self.refuse("start_turn", "not our turn");
        }
        let turn = Turn::new(self.role, kind);
        info!(target = "duet::game", turn = %turn.id, %kind, "turn started");
        self.state.active_turn = Some(turn);
        Some(self.commit(Vec::new()))
    }

    /// The non-owner poses the challenge. Blank text falls back to the first
    /// built-in question for the active level.
    pub fn submit_challenge(&mut self, text: &str, time_limit: Option<u32>) -> Option<Transition> {
        let role = self.role;
        let intensity = self.state.active_intensity();
        let Some(turn) = self.state.active_turn.as_mut() else {
            return self.refuse("submit_challenge", "no active turn");
        };
        if turn.status != TurnStatus::Selecting || turn.owner == role {
            return self.refuse("submit_challenge", "not selecting or own turn");
        }
        let text = text.trim();
        turn.challenge = if text.is_empty() {
            QuestionDeck::first(intensity, turn.kind).to_string()
        } else {
            text.to_string()
        };
        turn.time_limit = time_limit.filter(|secs| *secs > 0);
        turn.started_at = Some(duet_proto::now_millis());
        turn.status = TurnStatus::Pending;
        debug!(target = "duet::game", turn = %turn.id, time_limit = ?turn.time_limit, "challenge set");
        Some(self.commit(Vec::new()))
    }

    pub fn submit_response(
        &mut self,
        text: &str,
        media: Option<MediaAttachment>,
    ) -> Option<Transition> {
        let role = self.role;
        let Some(turn) = self.state.active_turn.as_mut() else {
            return self.refuse("submit_response", "no active turn");
        };
        if turn.status != TurnStatus::Pending || turn.owner != role {
            return self.refuse("submit_response", "not pending or not our turn");
        }
        let text = text.trim();
        turn.response = (!text.is_empty()).then(|| text.to_string());
        if media.is_some() {
            turn.media = media;
        }
        turn.status = TurnStatus::Answered;
        turn.timestamp = duet_proto::now_millis();
        Some(self.commit(Vec::new()))
    }

    pub fn complete_turn(&mut self, accepted: bool, loved: bool) -> Option<Transition> {
        let role = self.role;
        let Some(turn) = self.state.active_turn.as_ref() else {
            return self.refuse("complete_turn", "no active turn");
        };
        if turn.status != TurnStatus::Answered || turn.owner == role {
            return self.refuse("complete_turn", "not answered or own turn");
        }

        if !accepted {
            if let Some(turn) = self.state.active_turn.as_mut() {
                turn.status = TurnStatus::Pending;
                turn.is_retry = true;
                turn.started_at = Some(duet_proto::now_millis());
                info!(target = "duet::game", turn = %turn.id, "turn rejected; retry");
            }
            return Some(self.commit(vec![Message::RejectTurn {}]));
        }

        let mut turn = self.state.active_turn.take()?;
        let points = score(turn.kind, &self.state.turn_history, turn.owner);
        turn.status = TurnStatus::Confirmed;
        turn.loved = loved;
        let owner = turn.owner;
        info!(target = "duet::game", turn = %turn.id, %owner, points, "turn confirmed");
        self.state.turn_history.push(turn);
        self.state.scores.add(owner, points);
        self.state.current_turn = owner.other();

        let level_up = self.advance_progression();
        let mut transition = self.commit(Vec::new());
        transition.level_up = level_up;
        Some(transition)
    }

    fn advance_progression(&mut self) -> Option<Intensity> {
        if self.state.game_mode != GameMode::Random {
            return None;
        }
        self.state.questions_answered_in_current_level += 1;
        if self.state.questions_answered_in_current_level < QUESTIONS_PER_RANDOM_LEVEL * 2 {
            return None;
        }
        let next = self.state.current_random_mode_intensity.next()?;
        self.state.current_random_mode_intensity = next;
        self.state.questions_answered_in_current_level = 0;
        info!(target = "duet::game", level = %next, "level up");
        Some(next)
    }

    /// Times out the pending turn identified by `key`. Stale keys are ignored,
    /// so a repeated expiry cannot fail a turn twice.
    pub fn fail_turn(&mut self, key: &TurnKey) -> Option<Transition> {
        let role = self.role;
        let Some(turn) = self.state.active_turn.as_ref() else {
            return self.refuse("fail_turn", "no active turn");
        };
        if turn.status != TurnStatus::Pending || turn.owner != role {
            return self.refuse("fail_turn", "not pending or not our turn");
        }
        if turn.id != key.id || turn.started_at != Some(key.started_at) {
            return self.refuse("fail_turn", "stale timer");
        }
        let mut turn = self.state.active_turn.take()?;
        turn.status = TurnStatus::Failed;
        turn.timestamp = duet_proto::now_millis();
        let owner = turn.owner;
        info!(target = "duet::game", turn = %turn.id, %owner, "turn timed out");
        self.state.turn_history.push(turn);
        self.state.current_turn = owner.other();
        Some(self.commit(Vec::new()))
    }

    /// Guests ask the host; a host change applies at once.
    pub fn request_intensity(&mut self, level: Intensity) -> Option<Transition> {
        match self.role {
            Role::Guest => Some(Transition::publish([Message::IntensityRequest { level }])),
            Role::Host => {
                if self.state.intensity_level == level {
                    return self.refuse("request_intensity", "already at level");
                }
                self.state.intensity_level = level;
                info!(target = "duet::game", %level, "intensity changed");
                Some(self.commit(Vec::new()))
            }
        }
    }

    pub fn respond_intensity(&mut self, accepted: bool, level: Intensity) -> Option<Transition> {
        if self.role != Role::Host {
            return self.refuse("respond_intensity", "only the host decides");
        }
        let response = Message::IntensityResponse {
            accepted,
            level: Some(level),
        };
        if !accepted {
            return Some(Transition::publish([response]));
        }
        self.state.intensity_level = level;
        info!(target = "duet::game", %level, "intensity change accepted");
        let mut transition = self.commit(Vec::new());
        transition.outbound.insert(0, response);
        Some(transition)
    }

    pub fn toggle_auto_select(&mut self) -> Option<Transition> {
        let enabled = !self.state.auto_select_turn;
        self.state.auto_select_turn = enabled;
        Some(self.commit(vec![Message::ToggleAutoSelect { enabled }]))
    }

    /// Partner toggled auto-select. Returns whether our copy changed.
    pub fn apply_auto_select(&mut self, enabled: bool) -> bool {
        let changed = self.state.auto_select_turn != enabled;
        self.state.auto_select_turn = enabled;
        changed
    }

    /// Whether an automatic turn start is due for us right now.
    pub fn auto_select_due(&self) -> bool {
        self.state.auto_select_turn && self.state.active_turn.is_none() && self.is_mine()
    }

    /// Countdown we are responsible for: our own timed, pending turn.
    pub fn local_timer(&self) -> Option<(TurnKey, u64)> {
        let turn = self.state.active_turn.as_ref()?;
        if turn.owner != self.role {
            return None;
        }
        Some((turn.timer_key()?, turn.deadline()?))
    }

    pub fn send_chat(&mut self, text: &str, media: Option<MediaAttachment>) -> Option<Transition> {
        let text = text.trim();
        if text.is_empty() && media.is_none() {
            return self.refuse("send_chat", "empty message");
        }
        let message = ChatMessage::new(self.role, self.name.clone(), text, media);
        self.state.chat_messages.push(message);
        // Clears the partner's typing preview.
        Some(self.commit(vec![Message::RealtimeTyping {
            text: String::new(),
        }]))
    }

    /// A chat message sent on its own. Returns whether it was new to us.
    pub fn receive_chat(&mut self, message: ChatMessage) -> bool {
        if self.state.chat_messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.state.chat_messages.push(message);
        true
    }

    pub fn mark_read(&mut self, message_id: &str) -> bool {
        match self
            .state
            .chat_messages
            .iter_mut()
            .find(|m| m.id == message_id && !m.read)
        {
            Some(message) => {
                message.read = true;
                true
            }
            None => false,
        }
    }

    /// Latest chat message from the partner, if any.
    pub fn last_partner_message(&self) -> Option<&ChatMessage> {
        self.state
            .chat_messages
            .iter()
            .rev()
            .find(|m| m.sender_role != self.role)
    }

    /// Folds a partner identity into the names. The host owns the names and
    /// republishes; a guest only fills in an unresolved host name locally.
    pub fn learn_partner(&mut self, info: &PlayerInfo) -> Option<Transition> {
        if info.role == self.role || info.name.trim().is_empty() {
            return None;
        }
        match self.role {
            Role::Host => {
                if self.state.guest_name == info.name {
                    return None;
                }
                self.state.guest_name = info.name.clone();
                info!(target = "duet::game", guest = %info.name, "guest name set");
                Some(self.commit(Vec::new()))
            }
            Role::Guest => {
                if self.state.is_resolved(Role::Host) {
                    return None;
                }
                self.state.host_name = info.name.clone();
                Some(Transition::default())
            }
        }
    }
}
