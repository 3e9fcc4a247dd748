//! WebSocket client for a relay speaking the [`crate::wire`] frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::wire::{ClientFrame, ServerFrame, WillFrame};
use crate::{
    Bus, BusError, BusMessage, BusResult, ConnectOptions, Connection, Connector, LinkState,
    PublishOptions, Subscription,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(30);

type TopicMap = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>>;

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, options: ConnectOptions) -> BusResult<Arc<dyn Connection>> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| BusError::Unreachable(err.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let will = options
            .last_will
            .as_ref()
            .map(|will| {
                Ok::<_, BusError>(WillFrame {
                    topic: will.topic.clone(),
                    payload: utf8(&will.payload)?,
                })
            })
            .transpose()?;
        let hello = ClientFrame::Connect {
            client_id: options.client_id.clone(),
            will,
        };
        sink.send(Message::Text(encode(&hello)?))
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, source.next())
            .await
            .map_err(|_| BusError::Unreachable("relay handshake timed out".into()))?;
        match ack {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::ConnAck) => {}
                Ok(ServerFrame::Error { message }) => return Err(BusError::Unreachable(message)),
                Ok(other) => {
                    return Err(BusError::Transport(format!(
                        "unexpected handshake frame: {other:?}"
                    )));
                }
                Err(err) => return Err(BusError::Transport(err.to_string())),
            },
            Some(Ok(other)) => {
                return Err(BusError::Transport(format!(
                    "unexpected handshake message: {other:?}"
                )));
            }
            Some(Err(err)) => return Err(BusError::Transport(err.to_string())),
            None => return Err(BusError::Unreachable("relay closed during handshake".into())),
        }

        let (link_tx, link_rx) = watch::channel(LinkState::Up);
        let link_tx = Arc::new(link_tx);
        let topics: TopicMap = Arc::new(Mutex::new(HashMap::new()));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();

        let writer_link = Arc::clone(&link_tx);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let goodbye = matches!(frame, ClientFrame::Disconnect);
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if goodbye {
                    let _ = sink.close().await;
                    break;
                }
            }
            let _ = writer_link.send(LinkState::Down);
        });

        let reader_topics = Arc::clone(&topics);
        let reader_link = Arc::clone(&link_tx);
        let client_id = options.client_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Message { topic, payload }) => {
                            dispatch(&reader_topics, topic, Bytes::from(payload));
                        }
                        Ok(ServerFrame::Error { message }) => {
                            warn!(target = "transport_bus", %client_id, %message, "relay reported error");
                        }
                        Ok(ServerFrame::Pong) | Ok(ServerFrame::ConnAck) => {}
                        Err(err) => {
                            warn!(target = "transport_bus", %client_id, error = %err, "undecodable relay frame");
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!(target = "transport_bus", %client_id, "relay socket closed");
            reader_topics.lock().clear();
            let _ = reader_link.send(LinkState::Down);
        });

        let ping_tx = out_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if ping_tx.send(ClientFrame::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(WsConnection {
            client_id: options.client_id,
            outbound: out_tx,
            topics,
            link: link_rx,
            tasks: vec![writer, reader, heartbeat],
        }))
    }
}

struct WsConnection {
    client_id: String,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    topics: TopicMap,
    link: watch::Receiver<LinkState>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsConnection {
    fn send_frame(&self, frame: ClientFrame) -> BusResult<()> {
        if *self.link.borrow() == LinkState::Down {
            return Err(BusError::NotConnected);
        }
        self.outbound.send(frame).map_err(|_| BusError::Closed)
    }
}

impl Bus for WsConnection {
    fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        self.send_frame(ClientFrame::Subscribe {
            topic: topic.to_string(),
        })?;
        Ok(Subscription::new(topic, None, rx))
    }

    fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> BusResult<()> {
        self.send_frame(ClientFrame::Publish {
            topic: topic.to_string(),
            payload: utf8(&payload)?,
            retain: options.retain,
        })
    }
}

impl Connection for WsConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn link(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    fn disconnect(&self) {
        let _ = self.outbound.send(ClientFrame::Disconnect);
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        // The writer is left running so a queued goodbye still reaches the relay.
        for task in self.tasks.iter().skip(1) {
            task.abort();
        }
    }
}

fn dispatch(topics: &TopicMap, topic: String, payload: Bytes) {
    let mut guard = topics.lock();
    if let Some(subscribers) = guard.get_mut(&topic) {
        subscribers.retain(|tx| {
            tx.send(BusMessage {
                topic: topic.clone(),
                payload: payload.clone(),
            })
            .is_ok()
        });
    }
}

fn encode(frame: &ClientFrame) -> BusResult<String> {
    serde_json::to_string(frame).map_err(|err| BusError::Transport(err.to_string()))
}

fn utf8(payload: &Bytes) -> BusResult<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|err| BusError::Transport(format!("payload is not utf-8: {err}")))
}
