use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_millis;

/// Display name used until a participant's real name is known.
pub const WAITING_NAME: &str = "Waiting...";

/// Accepted turns per player before progressive mode raises the intensity.
pub const QUESTIONS_PER_RANDOM_LEVEL: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn other(self) -> Self {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Friendly,
    Romantic,
    Hot,
    VeryHot,
}

impl Intensity {
    pub const ALL: [Intensity; 4] = [
        Intensity::Friendly,
        Intensity::Romantic,
        Intensity::Hot,
        Intensity::VeryHot,
    ];

    /// The next level up, or `None` at the top.
    pub fn next(self) -> Option<Self> {
        match self {
            Intensity::Friendly => Some(Intensity::Romantic),
            Intensity::Romantic => Some(Intensity::Hot),
            Intensity::Hot => Some(Intensity::VeryHot),
            Intensity::VeryHot => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intensity::Friendly => "friendly",
            Intensity::Romantic => "romantic",
            Intensity::Hot => "hot",
            Intensity::VeryHot => "very_hot",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Intensity::Friendly => "Friendly",
            Intensity::Romantic => "Romantic",
            Intensity::Hot => "Hot",
            Intensity::VeryHot => "Very Hot",
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intensity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "friendly" => Ok(Intensity::Friendly),
            "romantic" => Ok(Intensity::Romantic),
            "hot" => Ok(Intensity::Hot),
            "very_hot" | "veryhot" => Ok(Intensity::VeryHot),
            other => Err(format!("unknown intensity level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Fixed,
    /// Progressive: intensity climbs as turns are accepted.
    Random,
}

impl FromStr for GameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(GameMode::Fixed),
            "random" | "progressive" => Ok(GameMode::Random),
            other => Err(format!("unknown game mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    Truth,
    Dare,
}

impl ChallengeKind {
    pub fn base_points(self) -> u32 {
        match self {
            ChallengeKind::Truth => 10,
            ChallengeKind::Dare => 15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeKind::Truth => "truth",
            ChallengeKind::Dare => "dare",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Selecting,
    Pending,
    Answered,
    Confirmed,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Confirmed | TurnStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    /// Data URL or external reference; never interpreted by the protocol.
    pub data: String,
}

/// Identifies one incarnation of a pending turn. A rejection restarts the
/// clock, which yields a new key for the same turn id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnKey {
    pub id: String,
    pub started_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    #[serde(rename = "playerRole")]
    pub owner: Role,
    #[serde(rename = "type")]
    pub kind: ChallengeKind,
    #[serde(rename = "questionText")]
    pub challenge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAttachment>,
    /// Seconds allowed for the response; `None` or zero means untimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub is_retry: bool,
    pub status: TurnStatus,
    #[serde(default)]
    pub loved: bool,
    pub timestamp: u64,
}

impl Turn {
    pub fn new(owner: Role, kind: ChallengeKind) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            owner,
            kind,
            challenge: String::new(),
            response: None,
            media: None,
            time_limit: None,
            started_at: None,
            is_retry: false,
            status: TurnStatus::Selecting,
            loved: false,
            timestamp: now_millis(),
        }
    }

    /// Key of the running countdown, present only for a timed pending turn.
    pub fn timer_key(&self) -> Option<TurnKey> {
        if self.status != TurnStatus::Pending {
            return None;
        }
        match (self.time_limit, self.started_at) {
            (Some(limit), Some(started_at)) if limit > 0 => Some(TurnKey {
                id: self.id.clone(),
                started_at,
            }),
            _ => None,
        }
    }

    /// Milliseconds since epoch at which a timed pending turn expires.
    /// `None` when the turn is untimed or its stamp cannot hold a deadline.
    pub fn deadline(&self) -> Option<u64> {
        self.timer_key()?;
        let limit = u64::from(self.time_limit?);
        self.started_at?.checked_add(limit.saturating_mul(1000))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_role: Role,
    pub sender_name: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAttachment>,
    pub timestamp: u64,
    #[serde(default)]
    pub read: bool,
}

impl ChatMessage {
    pub fn new(
        sender_role: Role,
        sender_name: impl Into<String>,
        text: impl Into<String>,
        media: Option<MediaAttachment>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            sender_role,
            sender_name: sender_name.into(),
            text: text.into(),
            media,
            timestamp: now_millis(),
            read: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub host: u32,
    pub guest: u32,
}

impl Scores {
    pub fn get(&self, role: Role) -> u32 {
        match role {
            Role::Host => self.host,
            Role::Guest => self.guest,
        }
    }

    pub fn add(&mut self, role: Role, points: u32) {
        let slot = match role {
            Role::Host => &mut self.host,
            Role::Guest => &mut self.guest,
        };
        *slot = slot.saturating_add(points);
    }
}

/// The replicated game session. Every local action produces a new copy that
/// is broadcast in full; receivers replace theirs wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub game_code: String,
    pub host_name: String,
    pub guest_name: String,
    pub intensity_level: Intensity,
    pub game_mode: GameMode,
    pub current_random_mode_intensity: Intensity,
    pub questions_answered_in_current_level: u32,
    pub current_turn: Role,
    #[serde(default)]
    pub active_turn: Option<Turn>,
    #[serde(default)]
    pub turn_history: Vec<Turn>,
    #[serde(default)]
    pub chat_messages: Vec<ChatMessage>,
    #[serde(default)]
    pub scores: Scores,
    #[serde(default)]
    pub auto_select_turn: bool,
    pub last_updated: u64,
}

impl SessionState {
    /// Fresh session as seen by `role` before anything has been exchanged.
    /// The host holds the first turn.
    pub fn new(
        game_code: impl Into<String>,
        role: Role,
        name: impl Into<String>,
        intensity: Intensity,
        game_mode: GameMode,
    ) -> Self {
        let name = name.into();
        let (host_name, guest_name) = match role {
            Role::Host => (name, WAITING_NAME.to_string()),
            Role::Guest => (WAITING_NAME.to_string(), name),
        };
        let current_random_mode_intensity = match game_mode {
            GameMode::Random => Intensity::ALL[0],
            GameMode::Fixed => intensity,
        };
        Self {
            game_code: game_code.into(),
            host_name,
            guest_name,
            intensity_level: intensity,
            game_mode,
            current_random_mode_intensity,
            questions_answered_in_current_level: 0,
            current_turn: Role::Host,
            active_turn: None,
            turn_history: Vec::new(),
            chat_messages: Vec::new(),
            scores: Scores::default(),
            auto_select_turn: false,
            last_updated: now_millis(),
        }
    }

    pub fn name_of(&self, role: Role) -> &str {
        match role {
            Role::Host => &self.host_name,
            Role::Guest => &self.guest_name,
        }
    }

    pub fn set_name(&mut self, role: Role, name: impl Into<String>) {
        match role {
            Role::Host => self.host_name = name.into(),
            Role::Guest => self.guest_name = name.into(),
        }
    }

    pub fn is_resolved(&self, role: Role) -> bool {
        self.name_of(role) != WAITING_NAME
    }

    pub fn any_name_resolved(&self) -> bool {
        self.is_resolved(Role::Host) || self.is_resolved(Role::Guest)
    }

    /// Intensity questions are drawn from: the progressive cursor in random
    /// mode, the chosen level otherwise.
    pub fn active_intensity(&self) -> Intensity {
        match self.game_mode {
            GameMode::Random => self.current_random_mode_intensity,
            GameMode::Fixed => self.intensity_level,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_uses_sentinel_for_the_absent_side() {
        let state = SessionState::new("ABCD", Role::Guest, "Sam", Intensity::Hot, GameMode::Fixed);
        assert_eq!(state.host_name, WAITING_NAME);
        assert_eq!(state.guest_name, "Sam");
        assert!(!state.is_resolved(Role::Host));
        assert!(state.any_name_resolved());
        assert_eq!(state.current_turn, Role::Host);
        assert_eq!(state.active_intensity(), Intensity::Hot);
    }

    #[test]
    fn progressive_mode_starts_at_lowest_level() {
        let state = SessionState::new("ABCD", Role::Host, "Alex", Intensity::Hot, GameMode::Random);
        assert_eq!(state.active_intensity(), Intensity::Friendly);
        assert_eq!(state.intensity_level, Intensity::Hot);
    }

    #[test]
    fn intensity_is_ordered_and_stops_at_top() {
        assert!(Intensity::Friendly < Intensity::Romantic);
        assert!(Intensity::Hot < Intensity::VeryHot);
        assert_eq!(Intensity::Hot.next(), Some(Intensity::VeryHot));
        assert_eq!(Intensity::VeryHot.next(), None);
        assert_eq!("very-hot".parse::<Intensity>(), Ok(Intensity::VeryHot));
    }

    #[test]
    fn turn_wire_field_names() {
        let mut turn = Turn::new(Role::Host, ChallengeKind::Dare);
        turn.challenge = "Sing a song".into();
        let value = serde_json::to_value(&turn).expect("encode");
        assert_eq!(value["playerRole"], "host");
        assert_eq!(value["type"], "dare");
        assert_eq!(value["questionText"], "Sing a song");
        assert_eq!(value["status"], "selecting");
        assert!(value.get("response").is_none());
    }

    #[test]
    fn timer_key_requires_timed_pending_turn() {
        let mut turn = Turn::new(Role::Guest, ChallengeKind::Truth);
        assert!(turn.timer_key().is_none());

        turn.status = TurnStatus::Pending;
        turn.started_at = Some(1_000);
        turn.time_limit = Some(0);
        assert!(turn.timer_key().is_none());

        turn.time_limit = Some(30);
        let key = turn.timer_key().expect("timed");
        assert_eq!(key.started_at, 1_000);
        assert_eq!(turn.deadline(), Some(31_000));
    }

    #[test]
    fn overflowing_start_stamp_leaves_turn_untimed() {
        let turn: Turn = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "playerRole": "guest",
            "type": "truth",
            "questionText": "Why?",
            "status": "pending",
            "timeLimit": 10,
            "startedAt": u64::MAX,
            "timestamp": 1_000,
        }))
        .expect("decode");
        assert!(turn.timer_key().is_some());
        assert_eq!(turn.deadline(), None);
    }

    #[test]
    fn session_state_uses_camel_case_on_the_wire() {
        let state = SessionState::new("ABCD", Role::Host, "Alex", Intensity::VeryHot, GameMode::Fixed);
        let value = serde_json::to_value(&state).expect("encode");
        assert_eq!(value["gameCode"], "ABCD");
        assert_eq!(value["intensityLevel"], "very_hot");
        assert_eq!(value["currentTurn"], "host");
        assert!(value["activeTurn"].is_null());
    }
}
