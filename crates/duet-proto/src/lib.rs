//! Data model and message envelope shared by duet participants.
//! Kept free of runtime dependencies so the relay and tooling can decode
//! traffic without pulling in the participant stack.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

mod message;
mod state;

pub use message::{Envelope, Message, PlayerInfo};
pub use state::{
    ChallengeKind, ChatMessage, GameMode, Intensity, MediaAttachment, MediaKind, Role, Scores,
    SessionState, Turn, TurnKey, TurnStatus, QUESTIONS_PER_RANDOM_LEVEL, WAITING_NAME,
};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is not a json object")]
    NotAnObject,
    #[error("envelope is missing `{0}`")]
    MissingField(&'static str),
}

/// Pub/sub topic carrying all traffic for one session code.
pub fn session_topic(code: &str) -> String {
    format!("duet_game_{}", code.trim().to_lowercase())
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_lowercased() {
        assert_eq!(session_topic("ABCD"), "duet_game_abcd");
        assert_eq!(session_topic(" Xy12 "), "duet_game_xy12");
    }
}
