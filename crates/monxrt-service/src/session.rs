//! Per-client session lifecycle.
//!
//! Mirrors the visible session states: IDLE → READY on creation,
//! READY → SYNCHRONIZED on the first successful `begin_frame`, then
//! VISIBLE/FOCUSED under compositor control, STOPPING on `request_exit`,
//! back to IDLE (and possibly EXITING) after `end_session`. IPC or device
//! loss forces LOSS_PENDING from any state.
//!
//! Every transition lands a `SESSION_STATE_CHANGED` event on the owning
//! client's ring via the [`StateSink`] handed to each method.

use std::sync::{Condvar, Mutex};

use monxrt_common::{Error, Result};
use monxrt_proto::SessionState;
use tracing::{debug, info};

/// Where session transitions report themselves. In the service this is the
/// client's event ring; tests use a plain vector.
pub trait StateSink {
    fn state_changed(&self, state: SessionState);
}

impl<F: Fn(SessionState)> StateSink for F {
    fn state_changed(&self, state: SessionState) {
        self(state)
    }
}

/// Frame id bookkeeping: which frame has been waited on and which begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameIds {
    pub waited: i64,
    pub begun: i64,
}

impl FrameIds {
    const NONE: FrameIds = FrameIds {
        waited: -1,
        begun: -1,
    };
}

/// The per-client session.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    /// `begin_session` seen and not yet ended.
    has_begun: bool,
    /// The first successful `begin_frame` happened.
    has_synchronized: bool,
    /// `request_exit` was called; `end_session` leads to EXITING.
    exiting: bool,
    /// A frame is between `begin_frame` and `end_frame`.
    frame_started: bool,
    pub frame_ids: FrameIds,
    /// Verbose lifecycle logging (`MONXRT_LIFECYCLE_LOG`).
    lifecycle_log: bool,
}

impl Session {
    pub fn new(lifecycle_log: bool) -> Self {
        Self {
            state: SessionState::Idle,
            has_begun: false,
            has_synchronized: false,
            exiting: false,
            frame_started: false,
            frame_ids: FrameIds::NONE,
            lifecycle_log,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.has_begun
            && matches!(
                self.state,
                SessionState::Synchronized
                    | SessionState::Visible
                    | SessionState::Focused
                    | SessionState::Ready
                    | SessionState::Stopping
            )
    }

    pub fn frame_started(&self) -> bool {
        self.frame_started
    }

    pub fn set_frame_started(&mut self, started: bool) {
        self.frame_started = started;
    }

    fn change_state(&mut self, next: SessionState, sink: &dyn StateSink) {
        if self.state == next {
            return;
        }
        if self.lifecycle_log {
            info!(from = self.state.as_str(), to = next.as_str(), "session state");
        } else {
            debug!(from = self.state.as_str(), to = next.as_str(), "session state");
        }
        self.state = next;
        sink.state_changed(next);
    }

    /// `session_create` succeeded: IDLE → READY.
    pub fn on_create(&mut self, sink: &dyn StateSink) {
        self.change_state(SessionState::Ready, sink);
    }

    /// `begin_session`.
    pub fn on_begin_session(&mut self) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(Error::call_order(format!(
                "begin_session in state {}",
                self.state.as_str()
            )));
        }
        if self.has_begun {
            return Err(Error::call_order("session already begun"));
        }
        self.has_begun = true;
        Ok(())
    }

    /// The first successful `begin_frame`: READY → SYNCHRONIZED.
    pub fn on_first_begin_frame(&mut self, sink: &dyn StateSink) {
        if !self.has_synchronized {
            self.has_synchronized = true;
            self.change_state(SessionState::Synchronized, sink);
        }
    }

    /// Compositor-driven visibility/focus fan-out. Walks one step at a time
    /// so every intermediate state lands an event.
    pub fn apply_visibility(&mut self, visible: bool, focused: bool, sink: &dyn StateSink) {
        if !self.has_synchronized {
            return;
        }
        // Climb while the flags allow it.
        if visible && self.state == SessionState::Synchronized {
            self.change_state(SessionState::Visible, sink);
        }
        if focused && self.state == SessionState::Visible {
            self.change_state(SessionState::Focused, sink);
        }
        // Descend when they are withdrawn.
        if !focused && self.state == SessionState::Focused {
            self.change_state(SessionState::Visible, sink);
        }
        if !visible && self.state == SessionState::Visible {
            self.change_state(SessionState::Synchronized, sink);
        }
    }

    /// `request_exit`: advisory; winds the state down to STOPPING.
    pub fn on_request_exit(&mut self, sink: &dyn StateSink) -> Result<()> {
        if !self.is_running() {
            return Err(Error::call_order("request_exit on a session that never ran"));
        }
        if self.state == SessionState::Focused {
            self.change_state(SessionState::Visible, sink);
        }
        if self.state == SessionState::Visible {
            self.change_state(SessionState::Synchronized, sink);
        }
        if !self.has_synchronized {
            // Fake the synchronization so the stop is observable.
            self.has_synchronized = true;
            self.change_state(SessionState::Synchronized, sink);
        }
        self.change_state(SessionState::Stopping, sink);
        self.exiting = true;
        Ok(())
    }

    /// `end_session`: STOPPING → IDLE, then EXITING or READY.
    pub fn on_end_session(&mut self, sink: &dyn StateSink) -> Result<FrameIds> {
        if !self.is_running() {
            return Err(Error::call_order("end_session on a session that never ran"));
        }
        if self.state != SessionState::Stopping {
            return Err(Error::call_order(format!(
                "end_session in state {}",
                self.state.as_str()
            )));
        }

        // Hand any in-flight frame ids back so the caller can discard them.
        let in_flight = self.frame_ids;
        self.frame_ids = FrameIds::NONE;
        self.frame_started = false;

        self.change_state(SessionState::Idle, sink);
        if self.exiting {
            self.change_state(SessionState::Exiting, sink);
        } else {
            // Still alive: allow re-entry.
            self.change_state(SessionState::Ready, sink);
        }

        self.has_begun = false;
        self.has_synchronized = false;
        Ok(in_flight)
    }

    /// IPC or device loss: everything funnels into LOSS_PENDING and then
    /// EXITING.
    pub fn on_loss(&mut self, sink: &dyn StateSink) {
        if matches!(self.state, SessionState::LossPending | SessionState::Exiting) {
            return;
        }
        self.change_state(SessionState::LossPending, sink);
        self.change_state(SessionState::Exiting, sink);
    }
}

/// The begin/wait semaphore, capacity 1.
///
/// `wait_frame` takes the permit; `begin_frame` returns it. Together with
/// the two-entry helper ring this caps outstanding `wait_frame`s at two.
#[derive(Debug)]
pub struct FrameSemaphore {
    inner: Mutex<SemState>,
    condvar: Condvar,
}

#[derive(Debug)]
struct SemState {
    permits: u32,
    /// Total posts ever; zero means no `begin_frame` has completed yet.
    posts: u64,
}

impl Default for FrameSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSemaphore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SemState {
                permits: 1,
                posts: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Take the permit. If none is available and no `begin_frame` has ever
    /// posted one, a second `wait_frame` would deadlock the client, so it
    /// is rejected as a call-order error instead of blocking forever.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.permits == 0 && state.posts == 0 {
            return Err(Error::call_order(
                "wait_frame called twice with no begin_frame in between",
            ));
        }
        while state.permits == 0 {
            state = self.condvar.wait(state).unwrap();
        }
        state.permits -= 1;
        Ok(())
    }

    /// Return the permit.
    pub fn post(&self) {
        let mut state = self.inner.lock().unwrap();
        state.permits += 1;
        state.posts += 1;
        self.condvar.notify_one();
    }

    /// Hand a taken permit back without it counting as a `begin_frame`.
    /// Used on `wait_frame` error paths to keep waits and posts balanced.
    pub fn refund(&self) {
        let mut state = self.inner.lock().unwrap();
        state.permits += 1;
        self.condvar.notify_one();
    }

    /// Back to the freshly-created state, for slot reuse.
    pub fn reset(&self) {
        let mut state = self.inner.lock().unwrap();
        state.permits = 1;
        state.posts = 0;
    }
}

/// The 0–2 outstanding `wait_frame` counter, behind its own lock.
#[derive(Debug, Default)]
pub struct ActiveWaits {
    count: Mutex<u32>,
}

impl ActiveWaits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) -> Result<()> {
        let mut count = self.count.lock().unwrap();
        if *count >= 2 {
            return Err(Error::call_order("more than two outstanding wait_frame"));
        }
        *count += 1;
        Ok(())
    }

    pub fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
    }

    pub fn reset(&self) {
        *self.count.lock().unwrap() = 0;
    }

    pub fn current(&self) -> u32 {
        *self.count.lock().unwrap()
    }
}
