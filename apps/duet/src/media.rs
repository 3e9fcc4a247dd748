//! Media seams: device capture, the peer-to-peer call transport and the
//! opaque stream handles passed between them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("media is not available on this device")]
    Unavailable,
    #[error("call negotiation failed: {0}")]
    Negotiation(String),
}

/// Handle to a captured or remote audio/video stream. Clones share tracks.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: u64,
    label: String,
    audio: AtomicBool,
    video: AtomicBool,
    stopped: AtomicBool,
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

impl MediaStream {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                audio: AtomicBool::new(true),
                video: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.inner.audio.store(enabled, Ordering::SeqCst);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.inner.video.store(enabled, Ordering::SeqCst);
    }

    pub fn audio_enabled(&self) -> bool {
        self.inner.audio.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.inner.video.load(Ordering::SeqCst)
    }

    /// Releases the underlying devices. Idempotent.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!(target = "duet::call", stream = self.inner.id, label = %self.inner.label, "stream stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    Stream(MediaStream),
    Close,
    Error(String),
}

pub trait CallControl: Send + Sync {
    fn answer(&self, stream: MediaStream) -> Result<(), MediaError>;
    fn close(&self);
}

/// A native call object: control half plus the events it emits.
pub struct MediaCall {
    pub peer_id: String,
    pub control: Arc<dyn CallControl>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn capture(&self) -> Result<MediaStream, MediaError>;
}

pub trait MediaTransport: Send + Sync {
    /// Registers `local_id` as dialable and returns the incoming call feed.
    fn listen(&self, local_id: &str) -> Result<mpsc::UnboundedReceiver<MediaCall>, MediaError>;

    fn call(&self, remote_id: &str, stream: MediaStream) -> Result<MediaCall, MediaError>;
}

/// Media for hosts without camera or call support.
#[derive(Default)]
pub struct UnavailableMedia {
    listeners: Mutex<Vec<mpsc::UnboundedSender<MediaCall>>>,
}

#[async_trait]
impl MediaDevices for UnavailableMedia {
    async fn capture(&self) -> Result<MediaStream, MediaError> {
        Err(MediaError::Unavailable)
    }
}

impl MediaTransport for UnavailableMedia {
    fn listen(&self, _local_id: &str) -> Result<mpsc::UnboundedReceiver<MediaCall>, MediaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        Ok(rx)
    }

    fn call(&self, _remote_id: &str, _stream: MediaStream) -> Result<MediaCall, MediaError> {
        Err(MediaError::Unavailable)
    }
}

/// In-process call fabric connecting participants of one process.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<MediaCall>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.peers.lock().contains_key(peer_id)
    }
}

impl MediaTransport for LoopbackNetwork {
    fn listen(&self, local_id: &str) -> Result<mpsc::UnboundedReceiver<MediaCall>, MediaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(local_id.to_string(), tx);
        Ok(rx)
    }

    fn call(&self, remote_id: &str, stream: MediaStream) -> Result<MediaCall, MediaError> {
        let incoming = self
            .peers
            .lock()
            .get(remote_id)
            .cloned()
            .ok_or_else(|| MediaError::Negotiation(format!("peer {remote_id} unreachable")))?;

        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        let link = Arc::new(LoopbackLink {
            caller_stream: stream,
            caller: caller_tx,
            callee: callee_tx,
            closed: AtomicBool::new(false),
        });

        incoming
            .send(MediaCall {
                peer_id: "loopback-caller".to_string(),
                control: Arc::new(LoopbackEnd {
                    link: Arc::clone(&link),
                    side: Side::Callee,
                }),
                events: callee_rx,
            })
            .map_err(|_| MediaError::Negotiation(format!("peer {remote_id} went away")))?;

        Ok(MediaCall {
            peer_id: remote_id.to_string(),
            control: Arc::new(LoopbackEnd {
                link,
                side: Side::Caller,
            }),
            events: caller_rx,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

struct LoopbackLink {
    caller_stream: MediaStream,
    caller: mpsc::UnboundedSender<CallEvent>,
    callee: mpsc::UnboundedSender<CallEvent>,
    closed: AtomicBool,
}

struct LoopbackEnd {
    link: Arc<LoopbackLink>,
    side: Side,
}

impl CallControl for LoopbackEnd {
    fn answer(&self, stream: MediaStream) -> Result<(), MediaError> {
        if self.side != Side::Callee {
            return Err(MediaError::Negotiation("only the callee answers".into()));
        }
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("call already closed".into()));
        }
        let _ = self.link.caller.send(CallEvent::Stream(stream));
        let _ = self
            .link
            .callee
            .send(CallEvent::Stream(self.link.caller_stream.clone()));
        Ok(())
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let remote = match self.side {
            Side::Caller => &self.link.callee,
            Side::Callee => &self.link.caller,
        };
        let _ = remote.send(CallEvent::Close);
    }
}

/// Capture stand-in for tests and headless runs; can be told to refuse.
#[derive(Default)]
pub struct LoopbackDevices {
    deny: AtomicBool,
    captured: Mutex<Vec<MediaStream>>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Every stream handed out so far, oldest first.
    pub fn captured(&self) -> Vec<MediaStream> {
        self.captured.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn capture(&self) -> Result<MediaStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let stream = MediaStream::new("loopback-camera");
        self.captured.lock().push(stream.clone());
        Ok(stream)
    }
}
