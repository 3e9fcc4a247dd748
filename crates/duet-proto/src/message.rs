use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{ChatMessage, Intensity, Role, SessionState};
use crate::{now_millis, ProtoError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub name: String,
    pub role: Role,
    /// Identity the partner's media transport should dial.
    pub peer_id: String,
}

/// Everything two participants say to each other over the session topic.
///
/// On the wire each variant is `{"type": "<TAG>", "payload": {...}}`; variants
/// without data still carry an empty payload object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    GameStateSync(Box<SessionState>),
    PlayerInfo(PlayerInfo),
    RequestPlayerInfo {},
    PartnerDisconnected {
        name: String,
    },
    ChatMessage(ChatMessage),
    RealtimeTyping {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        message_id: String,
    },
    PingEmoji {
        emoji: String,
    },
    CallOffer {},
    CallAccept {},
    CallReject {},
    CallEnd {},
    CallWindowState {
        minimized: bool,
    },
    IntensityRequest {
        level: Intensity,
    },
    IntensityResponse {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<Intensity>,
    },
    ToggleAutoSelect {
        enabled: bool,
    },
    RejectTurn {},
}

impl Message {
    pub fn snapshot(state: &SessionState) -> Self {
        Message::GameStateSync(Box::new(state.clone()))
    }

    /// Only full-state snapshots are kept by the broker for late subscribers.
    pub fn is_retained(&self) -> bool {
        matches!(self, Message::GameStateSync(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::GameStateSync(_) => "GAME_STATE_SYNC",
            Message::PlayerInfo(_) => "PLAYER_INFO",
            Message::RequestPlayerInfo {} => "REQUEST_PLAYER_INFO",
            Message::PartnerDisconnected { .. } => "PARTNER_DISCONNECTED",
            Message::ChatMessage(_) => "CHAT_MESSAGE",
            Message::RealtimeTyping { .. } => "REALTIME_TYPING",
            Message::ReadReceipt { .. } => "READ_RECEIPT",
            Message::PingEmoji { .. } => "PING_EMOJI",
            Message::CallOffer {} => "CALL_OFFER",
            Message::CallAccept {} => "CALL_ACCEPT",
            Message::CallReject {} => "CALL_REJECT",
            Message::CallEnd {} => "CALL_END",
            Message::CallWindowState { .. } => "CALL_WINDOW_STATE",
            Message::IntensityRequest { .. } => "INTENSITY_REQUEST",
            Message::IntensityResponse { .. } => "INTENSITY_RESPONSE",
            Message::ToggleAutoSelect { .. } => "TOGGLE_AUTO_SELECT",
            Message::RejectTurn {} => "REJECT_TURN",
        }
    }
}

/// A [`Message`] stamped with its sender and send time.
///
/// Wire shape: `{"type", "payload", "senderId", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message: Message,
    pub sender_id: String,
    pub timestamp: u64,
}

const SENDER_FIELD: &str = "senderId";
const TIMESTAMP_FIELD: &str = "timestamp";

impl Envelope {
    pub fn new(message: Message, sender_id: impl Into<String>) -> Self {
        Self {
            message,
            sender_id: sender_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        let mut value = serde_json::to_value(&self.message)?;
        let object = value
            .as_object_mut()
            .ok_or(ProtoError::NotAnObject)?;
        object.insert(SENDER_FIELD.into(), Value::from(self.sender_id.as_str()));
        object.insert(TIMESTAMP_FIELD.into(), Value::from(self.timestamp));
        Ok(serde_json::to_string(&value)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtoError> {
        let mut value: Value = serde_json::from_slice(bytes)?;
        let object = value.as_object_mut().ok_or(ProtoError::NotAnObject)?;
        let sender_id = match object.remove(SENDER_FIELD) {
            Some(Value::String(id)) => id,
            _ => return Err(ProtoError::MissingField(SENDER_FIELD)),
        };
        let timestamp = object
            .remove(TIMESTAMP_FIELD)
            .and_then(|ts| ts.as_u64())
            .unwrap_or(0);
        let message = serde_json::from_value(value)?;
        Ok(Self {
            message,
            sender_id,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{GameMode, Role};

    #[test]
    fn envelope_wire_shape() {
        let envelope = Envelope {
            message: Message::PartnerDisconnected { name: "Alex".into() },
            sender_id: "duet-abcd-k3j9z1".into(),
            timestamp: 42,
        };
        let value: Value = serde_json::from_str(&envelope.to_json().expect("encode")).expect("json");
        assert_eq!(value["type"], "PARTNER_DISCONNECTED");
        assert_eq!(value["payload"]["name"], "Alex");
        assert_eq!(value["senderId"], "duet-abcd-k3j9z1");
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn empty_variants_carry_an_object_payload() {
        let envelope = Envelope::new(Message::CallOffer {}, "me");
        let value: Value = serde_json::from_str(&envelope.to_json().expect("encode")).expect("json");
        assert_eq!(value["payload"], serde_json::json!({}));

        let decoded = Envelope::from_slice(br#"{"type":"REQUEST_PLAYER_INFO","payload":{},"senderId":"x","timestamp":1}"#)
            .expect("decode");
        assert_eq!(decoded.message, Message::RequestPlayerInfo {});
    }

    #[test]
    fn snapshot_survives_the_wire() {
        let state = SessionState::new("ABCD", Role::Host, "Alex", Intensity::Romantic, GameMode::Random);
        let envelope = Envelope::new(Message::snapshot(&state), "duet-abcd-000001");
        let decoded = Envelope::from_slice(envelope.to_json().expect("encode").as_bytes()).expect("decode");
        assert_eq!(decoded, envelope);
        assert!(decoded.message.is_retained());
    }

    #[test]
    fn read_receipt_uses_camel_case_payload() {
        let decoded = Envelope::from_slice(
            br#"{"type":"READ_RECEIPT","payload":{"messageId":"m1"},"senderId":"x","timestamp":5}"#,
        )
        .expect("decode");
        assert_eq!(
            decoded.message,
            Message::ReadReceipt {
                message_id: "m1".into()
            }
        );
    }

    #[test]
    fn intensity_response_level_is_optional() {
        let decoded = Envelope::from_slice(
            br#"{"type":"INTENSITY_RESPONSE","payload":{"accepted":false},"senderId":"x","timestamp":5}"#,
        )
        .expect("decode");
        assert_eq!(
            decoded.message,
            Message::IntensityResponse {
                accepted: false,
                level: None
            }
        );
    }

    #[test]
    fn rejects_unknown_types_and_missing_sender() {
        assert!(Envelope::from_slice(br#"{"type":"NOPE","payload":{},"senderId":"x"}"#).is_err());
        assert!(matches!(
            Envelope::from_slice(br#"{"type":"CALL_END","payload":{}}"#),
            Err(ProtoError::MissingField("senderId"))
        ));
        assert!(Envelope::from_slice(b"not json").is_err());
    }
}
