use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_bus::wire::{ClientFrame, ServerFrame};
use transport_bus::{
    Bus, BusResult, ConnectOptions, Connection, LinkState, LocalBroker, LocalConnection,
    PublishOptions,
};

/// Shared relay state; every socket becomes one session on the broker.
#[derive(Clone, Default)]
pub struct RelayState {
    pub broker: LocalBroker,
}

impl RelayState {
    pub fn new(broker: LocalBroker) -> Self {
        Self { broker }
    }
}

/// How a socket's session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The client said goodbye; its last will is discarded.
    Goodbye,
    /// The socket went away without a goodbye; the last will fires.
    Dropped,
    /// The broker ended the session (kick, takeover or shutdown).
    Closed,
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();

    let options = match read_hello(&mut receiver).await {
        Some(Ok(options)) => options,
        Some(Err(message)) => {
            let _ = sender.send(text(&ServerFrame::Error { message })).await;
            let _ = sender.close().await;
            return;
        }
        None => return,
    };
    let connection = match state.broker.connect_local(options) {
        Ok(connection) => connection,
        Err(err) => {
            let message = err.to_string();
            warn!(target = "relay::ws", %message, "refusing client");
            let _ = sender.send(text(&ServerFrame::Error { message })).await;
            let _ = sender.close().await;
            return;
        }
    };
    if sender.send(text(&ServerFrame::ConnAck)).await.is_err() {
        connection.sever();
        return;
    }
    let client_id = connection.client_id().to_string();
    info!(target = "relay::ws", %client_id, "client connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(text(&frame)).await.is_err() {
                break;
            }
        }
        sender
    });

    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
    let mut link = connection.link();
    let exit = loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(raw))) => match serde_json::from_str::<ClientFrame>(&raw) {
                    Ok(ClientFrame::Disconnect) => break Exit::Goodbye,
                    Ok(frame) => {
                        if let Err(err) = handle_frame(&connection, frame, &tx, &mut forwarders) {
                            let _ = tx.send(ServerFrame::Error { message: err.to_string() });
                        }
                    }
                    Err(err) => {
                        debug!(target = "relay::ws", %client_id, error = %err, "bad frame");
                        let _ = tx.send(ServerFrame::Error {
                            message: format!("invalid frame: {err}"),
                        });
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break Exit::Dropped,
                Some(Ok(_)) => {}
            },
            changed = link.changed() => {
                if changed.is_err() || *link.borrow() == LinkState::Down {
                    break Exit::Closed;
                }
            }
        }
    };

    match exit {
        Exit::Goodbye => connection.disconnect(),
        Exit::Dropped => connection.sever(),
        Exit::Closed => {}
    }
    info!(target = "relay::ws", %client_id, ?exit, "client disconnected");

    for forwarder in &forwarders {
        forwarder.abort();
    }
    drop(tx);
    if let Ok(mut sender) = writer.await {
        let _ = sender.close().await;
    }
}

/// Waits for the `connect` frame that must open every session.
async fn read_hello(
    receiver: &mut SplitStream<WebSocket>,
) -> Option<Result<ConnectOptions, String>> {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(raw)) => return Some(parse_hello(&raw)),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

fn parse_hello(raw: &str) -> Result<ConnectOptions, String> {
    match serde_json::from_str::<ClientFrame>(raw) {
        Ok(ClientFrame::Connect { client_id, will }) => {
            if client_id.trim().is_empty() {
                return Err("client id must not be empty".into());
            }
            let options = ConnectOptions::new(client_id);
            Ok(match will {
                Some(will) => options.with_last_will(will.topic, Bytes::from(will.payload)),
                None => options,
            })
        }
        Ok(_) => Err("expected a connect frame first".into()),
        Err(err) => Err(format!("invalid frame: {err}")),
    }
}

fn handle_frame(
    connection: &LocalConnection,
    frame: ClientFrame,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    forwarders: &mut Vec<JoinHandle<()>>,
) -> BusResult<()> {
    match frame {
        ClientFrame::Subscribe { topic } => {
            let mut subscription = connection.subscribe(&topic)?;
            let tx = tx.clone();
            forwarders.push(tokio::spawn(async move {
                while let Ok(message) = subscription.recv().await {
                    let Ok(payload) = String::from_utf8(message.payload.to_vec()) else {
                        continue;
                    };
                    let frame = ServerFrame::Message {
                        topic: message.topic,
                        payload,
                    };
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
            }));
            Ok(())
        }
        ClientFrame::Publish {
            topic,
            payload,
            retain,
        } => connection.publish(&topic, Bytes::from(payload), PublishOptions { retain }),
        ClientFrame::Ping => {
            let _ = tx.send(ServerFrame::Pong);
            Ok(())
        }
        ClientFrame::Connect { .. } => {
            let _ = tx.send(ServerFrame::Error {
                message: "already connected".into(),
            });
            Ok(())
        }
        ClientFrame::Disconnect => Ok(()),
    }
}

fn text(frame: &ServerFrame) -> Message {
    Message::Text(serde_json::to_string(frame).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::LastWill;

    #[test]
    fn hello_carries_the_last_will() {
        let options = parse_hello(
            r#"{"type":"connect","clientId":"duet-abcd-1","will":{"topic":"duet_game_abcd","payload":"bye"}}"#,
        )
        .expect("connect");
        assert_eq!(options.client_id, "duet-abcd-1");
        assert_eq!(
            options.last_will,
            Some(LastWill {
                topic: "duet_game_abcd".into(),
                payload: Bytes::from_static(b"bye"),
            })
        );
    }

    #[test]
    fn hello_must_come_first() {
        assert!(parse_hello(r#"{"type":"subscribe","topic":"t"}"#).is_err());
        assert!(parse_hello(r#"{"type":"connect","clientId":"  "}"#).is_err());
        assert!(parse_hello("not json").is_err());
    }

    #[tokio::test]
    async fn frames_drive_the_broker_session() {
        let broker = LocalBroker::new();
        let connection = broker
            .connect_local(ConnectOptions::new("relay-test"))
            .expect("connect");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut forwarders = Vec::new();

        handle_frame(
            &connection,
            ClientFrame::Subscribe { topic: "room".into() },
            &tx,
            &mut forwarders,
        )
        .expect("subscribe");
        handle_frame(
            &connection,
            ClientFrame::Publish {
                topic: "room".into(),
                payload: "hello".into(),
                retain: true,
            },
            &tx,
            &mut forwarders,
        )
        .expect("publish");
        handle_frame(&connection, ClientFrame::Ping, &tx, &mut forwarders).expect("ping");

        let mut frames = vec![rx.recv().await.expect("frame"), rx.recv().await.expect("frame")];
        frames.sort_by_key(|frame| matches!(frame, ServerFrame::Pong));
        assert_eq!(
            frames,
            vec![
                ServerFrame::Message {
                    topic: "room".into(),
                    payload: "hello".into(),
                },
                ServerFrame::Pong,
            ]
        );
        assert_eq!(broker.retained("room"), Some(Bytes::from_static(b"hello")));
    }
}
