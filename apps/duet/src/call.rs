//! Call negotiation state. Channel signals and native call events both drive
//! the same machine; whichever reports a connection first wins.

use std::sync::Arc;

use tracing::{debug, info};

use crate::media::{CallControl, CallEvent, MediaError, MediaStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Offering,
    Ringing,
    Connected,
}

/// What the participant exposes about its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallState {
    pub status: CallStatus,
    pub muted: bool,
    pub video_enabled: bool,
    pub minimized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    PermissionDenied,
    MediaUnavailable,
    PartnerUnreachable,
    Transport(String),
}

impl From<MediaError> for CallFailure {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied => CallFailure::PermissionDenied,
            MediaError::Unavailable => CallFailure::MediaUnavailable,
            MediaError::Negotiation(reason) => CallFailure::Transport(reason),
        }
    }
}

#[derive(Debug)]
pub enum IncomingOutcome {
    Ringing(u64),
    /// Already accepted; answer right away with the captured stream.
    AnswerNow { generation: u64, local: MediaStream },
    Busy,
}

/// Effect of a native call event on the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeOutcome {
    /// The event belongs to a call that has already been torn down.
    Stale,
    Connected,
    Unchanged,
    Ended,
    Failed(String),
}

pub struct CallMachine {
    status: CallStatus,
    muted: bool,
    video_enabled: bool,
    minimized: bool,
    local: Option<MediaStream>,
    remote: Option<MediaStream>,
    control: Option<Arc<dyn CallControl>>,
    generation: u64,
    /// Our last offer has not been answered yet. Survives teardown so a
    /// reject arriving after the native close still counts as a decline.
    unanswered_offer: bool,
}

impl Default for CallMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMachine {
    pub fn new() -> Self {
        Self {
            status: CallStatus::Idle,
            muted: false,
            video_enabled: true,
            minimized: false,
            local: None,
            remote: None,
            control: None,
            generation: 0,
            unanswered_offer: false,
        }
    }

    pub fn state(&self) -> CallState {
        CallState {
            status: self.status,
            muted: self.muted,
            video_enabled: self.video_enabled,
            minimized: self.minimized,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_native_call(&self) -> bool {
        self.control.is_some()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote.as_ref()
    }

    /// Local media captured for an outgoing call.
    pub fn begin_offer(&mut self, local: MediaStream) {
        self.local = Some(local);
        self.status = CallStatus::Offering;
        self.unanswered_offer = true;
        debug!(target = "duet::call", "offering");
    }

    /// Adopts the native handle of our outgoing call. Returns the generation
    /// its events must carry.
    pub fn attach_outgoing(&mut self, control: Arc<dyn CallControl>) -> u64 {
        self.generation += 1;
        self.control = Some(control);
        self.generation
    }

    /// Adopts an incoming native call unless another call is in progress.
    pub fn on_incoming(&mut self, control: Arc<dyn CallControl>) -> IncomingOutcome {
        if self.control.is_some() {
            return IncomingOutcome::Busy;
        }
        match self.status {
            CallStatus::Idle | CallStatus::Ringing => {
                self.generation += 1;
                self.control = Some(control);
                self.status = CallStatus::Ringing;
                self.unanswered_offer = false;
                info!(target = "duet::call", generation = self.generation, "incoming call");
                IncomingOutcome::Ringing(self.generation)
            }
            // Accepted from the channel signal before the native call landed.
            CallStatus::Connected => match self.local.clone() {
                Some(local) => {
                    self.generation += 1;
                    self.control = Some(control);
                    IncomingOutcome::AnswerNow {
                        generation: self.generation,
                        local,
                    }
                }
                None => IncomingOutcome::Busy,
            },
            CallStatus::Offering => IncomingOutcome::Busy,
        }
    }

    /// Backup trigger from the channel. Returns whether we started ringing.
    pub fn on_offer_signal(&mut self) -> bool {
        if self.status != CallStatus::Idle {
            return false;
        }
        self.status = CallStatus::Ringing;
        true
    }

    /// The callee picked up. Returns the native handle to answer, if any.
    pub fn accept(&mut self, local: MediaStream) -> Option<Arc<dyn CallControl>> {
        self.local = Some(local);
        self.status = CallStatus::Connected;
        info!(target = "duet::call", "call accepted locally");
        self.control.clone()
    }

    pub fn on_accept_signal(&mut self) -> bool {
        if self.status != CallStatus::Offering {
            return false;
        }
        self.status = CallStatus::Connected;
        self.unanswered_offer = false;
        info!(target = "duet::call", "partner accepted");
        true
    }

    /// The partner rejected. Returns whether it answered an offer of ours.
    pub fn take_unanswered_offer(&mut self) -> bool {
        std::mem::take(&mut self.unanswered_offer)
    }

    pub fn on_native(&mut self, generation: u64, event: CallEvent) -> NativeOutcome {
        if generation != self.generation || self.control.is_none() {
            debug!(target = "duet::call", generation, current = self.generation, "ignoring stale call event");
            return NativeOutcome::Stale;
        }
        match event {
            CallEvent::Stream(remote) => {
                self.remote = Some(remote);
                if self.status == CallStatus::Connected {
                    NativeOutcome::Unchanged
                } else {
                    self.status = CallStatus::Connected;
                    self.unanswered_offer = false;
                    info!(target = "duet::call", "remote stream arrived");
                    NativeOutcome::Connected
                }
            }
            CallEvent::Close => {
                self.teardown();
                NativeOutcome::Ended
            }
            CallEvent::Error(reason) => {
                self.teardown();
                NativeOutcome::Failed(reason)
            }
        }
    }

    /// Returns to idle: stops local capture, closes the native call and
    /// invalidates events still in flight for it. Returns whether anything
    /// was active.
    pub fn teardown(&mut self) -> bool {
        let was_active = self.status != CallStatus::Idle || self.control.is_some() || self.local.is_some();
        if let Some(local) = self.local.take() {
            local.stop();
        }
        self.remote = None;
        if let Some(control) = self.control.take() {
            control.close();
        }
        self.generation += 1;
        self.status = CallStatus::Idle;
        self.muted = false;
        self.video_enabled = true;
        self.minimized = false;
        if was_active {
            info!(target = "duet::call", "call ended");
        }
        was_active
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        if let Some(local) = &self.local {
            local.set_audio_enabled(!self.muted);
        }
        self.muted
    }

    pub fn toggle_video(&mut self) -> bool {
        self.video_enabled = !self.video_enabled;
        if let Some(local) = &self.local {
            local.set_video_enabled(self.video_enabled);
        }
        self.video_enabled
    }

    pub fn set_minimized(&mut self, minimized: bool) -> bool {
        let changed = self.minimized != minimized;
        self.minimized = minimized;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingControl {
        answered: Mutex<Vec<u64>>,
        closed: Mutex<u32>,
    }

    impl CallControl for RecordingControl {
        fn answer(&self, stream: MediaStream) -> Result<(), MediaError> {
            self.answered.lock().push(stream.id());
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock() += 1;
        }
    }

    #[test]
    fn reject_counts_only_against_an_unanswered_offer() {
        let mut machine = CallMachine::new();
        assert!(!machine.take_unanswered_offer(), "nothing offered");

        machine.begin_offer(MediaStream::new("local"));
        let generation = machine.attach_outgoing(Arc::new(RecordingControl::default()));
        assert_eq!(machine.on_native(generation, CallEvent::Close), NativeOutcome::Ended);
        assert!(machine.take_unanswered_offer(), "native close may beat the reject");
        assert!(!machine.take_unanswered_offer());

        machine.begin_offer(MediaStream::new("local"));
        machine.attach_outgoing(Arc::new(RecordingControl::default()));
        assert!(machine.on_accept_signal());
        assert!(!machine.take_unanswered_offer(), "answered offers are not declined");
    }

    #[test]
    fn caller_connects_on_either_signal() {
        let mut by_stream = CallMachine::new();
        by_stream.begin_offer(MediaStream::new("local"));
        let generation = by_stream.attach_outgoing(Arc::new(RecordingControl::default()));
        assert_eq!(
            by_stream.on_native(generation, CallEvent::Stream(MediaStream::new("remote"))),
            NativeOutcome::Connected
        );
        assert!(!by_stream.on_accept_signal(), "late accept is a no-op");
        assert_eq!(by_stream.status(), CallStatus::Connected);

        let mut by_signal = CallMachine::new();
        by_signal.begin_offer(MediaStream::new("local"));
        let generation = by_signal.attach_outgoing(Arc::new(RecordingControl::default()));
        assert!(by_signal.on_accept_signal());
        assert_eq!(
            by_signal.on_native(generation, CallEvent::Stream(MediaStream::new("remote"))),
            NativeOutcome::Unchanged
        );
        assert_eq!(by_signal.status(), CallStatus::Connected);
        assert!(by_signal.remote_stream().is_some());
    }

    #[test]
    fn events_from_torn_down_calls_are_ignored() {
        let mut machine = CallMachine::new();
        let control = Arc::new(RecordingControl::default());
        let IncomingOutcome::Ringing(old) = machine.on_incoming(control.clone()) else {
            panic!("expected ringing");
        };
        machine.teardown();
        assert_eq!(*control.closed.lock(), 1);

        assert_eq!(
            machine.on_native(old, CallEvent::Stream(MediaStream::new("ghost"))),
            NativeOutcome::Stale
        );
        assert_eq!(machine.status(), CallStatus::Idle);
    }

    #[test]
    fn teardown_stops_local_capture_and_resets_flags() {
        let mut machine = CallMachine::new();
        let local = MediaStream::new("local");
        machine.begin_offer(local.clone());
        machine.toggle_mute();
        machine.set_minimized(true);
        assert!(!local.audio_enabled());

        assert!(machine.teardown());
        assert!(local.is_stopped());
        let state = machine.state();
        assert_eq!(state.status, CallStatus::Idle);
        assert!(!state.muted && state.video_enabled && !state.minimized);
        assert!(!machine.teardown(), "second teardown is a no-op");
    }

    #[test]
    fn accept_answers_the_native_call() {
        let mut machine = CallMachine::new();
        let control = Arc::new(RecordingControl::default());
        assert!(matches!(
            machine.on_incoming(control.clone()),
            IncomingOutcome::Ringing(_)
        ));
        assert!(!machine.on_offer_signal(), "already ringing");

        let local = MediaStream::new("local");
        let handle = machine.accept(local.clone()).expect("native handle");
        handle.answer(local.clone()).expect("answer");
        assert_eq!(control.answered.lock().as_slice(), &[local.id()]);
        assert_eq!(machine.status(), CallStatus::Connected);
    }

    #[test]
    fn busy_machine_refuses_second_incoming_call() {
        let mut machine = CallMachine::new();
        machine.begin_offer(MediaStream::new("local"));
        assert!(matches!(
            machine.on_incoming(Arc::new(RecordingControl::default())),
            IncomingOutcome::Busy
        ));
    }

    #[test]
    fn native_call_after_signal_accept_is_answered_immediately() {
        let mut machine = CallMachine::new();
        assert!(machine.on_offer_signal());
        let local = MediaStream::new("local");
        assert!(machine.accept(local.clone()).is_none());

        match machine.on_incoming(Arc::new(RecordingControl::default())) {
            IncomingOutcome::AnswerNow { local: stream, .. } => assert_eq!(stream.id(), local.id()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(machine.status(), CallStatus::Connected);
    }

    #[test]
    fn native_error_tears_down() {
        let mut machine = CallMachine::new();
        let local = MediaStream::new("local");
        machine.begin_offer(local.clone());
        let generation = machine.attach_outgoing(Arc::new(RecordingControl::default()));
        assert_eq!(
            machine.on_native(generation, CallEvent::Error("ice failed".into())),
            NativeOutcome::Failed("ice failed".into())
        );
        assert!(local.is_stopped());
        assert_eq!(machine.status(), CallStatus::Idle);
    }
}
