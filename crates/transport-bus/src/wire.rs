//! JSON frames exchanged between a relay and its WebSocket clients.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WillFrame {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Connect {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        will: Option<WillFrame>,
    },
    Subscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: String,
        #[serde(default)]
        retain: bool,
    },
    Disconnect,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnAck,
    Message { topic: String, payload: String },
    Error { message: String },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_shape() {
        let frame = ClientFrame::Connect {
            client_id: "duet-abcd-x1y2z3".into(),
            will: Some(WillFrame {
                topic: "duet_game_abcd".into(),
                payload: "{}".into(),
            }),
        };
        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(value["type"], "connect");
        assert_eq!(value["clientId"], "duet-abcd-x1y2z3");
        assert_eq!(value["will"]["topic"], "duet_game_abcd");
    }

    #[test]
    fn publish_retain_defaults_to_false() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"publish","topic":"t","payload":"p"}"#)
                .expect("decode");
        assert_eq!(
            frame,
            ClientFrame::Publish {
                topic: "t".into(),
                payload: "p".into(),
                retain: false,
            }
        );
    }
}
