//! Per-client render-timing helper.
//!
//! The render loop owns a global pacer and broadcasts its predictions to
//! every connected client's helper. A helper turns those samples into
//! `wait_frame` answers for its client: it walks the last sample forward in
//! whole periods, never returns a display time at or before the one it
//! returned last, and tracks each in-flight frame through a two-entry ring
//! so at most two predictions can be outstanding.

use tracing::trace;

/// In-flight frames tracked per client. Also the cap on outstanding
/// `wait_frame` predictions.
pub const IN_FLIGHT_FRAMES: usize = 2;

/// Client-attributable timing failures. These are not programmer errors:
/// a misbehaving client can trigger every one of them.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimingError {
    #[error("no timing sample from the render loop yet")]
    NoSample,
    #[error("both in-flight frame slots taken (frame {0} not yet begun)")]
    SlotBusy(i64),
    #[error("unknown frame id {0}")]
    UnknownFrame(i64),
    #[error("frame {frame_id} is not in the {expected} phase")]
    BadPhase { frame_id: i64, expected: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HelperPhase {
    Ready,
    Predicted,
    WaitLeft,
    Begun,
}

#[derive(Debug, Clone, Copy)]
struct HelperFrame {
    frame_id: i64,
    predicted_ns: u64,
    wait_woke_ns: u64,
    begin_ns: u64,
    end_frame_ns: u64,
    phase: HelperPhase,
}

impl HelperFrame {
    const READY: HelperFrame = HelperFrame {
        frame_id: -1,
        predicted_ns: 0,
        wait_woke_ns: 0,
        begin_ns: 0,
        end_frame_ns: 0,
        phase: HelperPhase::Ready,
    };
}

/// What a helper answers for one client `wait_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientPrediction {
    pub frame_id: i64,
    pub wake_up_time_ns: u64,
    pub predicted_display_time_ns: u64,
    pub predicted_display_period_ns: u64,
    pub min_display_period_ns: u64,
}

/// Per-client render-timing helper.
#[derive(Debug)]
pub struct RenderTimingHelper {
    frames: [HelperFrame; IN_FLIGHT_FRAMES],
    frame_counter: i64,

    /// Time between the sampled display time and when the render loop woke.
    extra_ns: u64,
    period_ns: u64,
    /// The display time of the most recent render-loop sample.
    last_input_ns: u64,
    /// The display time most recently returned to the client.
    last_returned_ns: u64,
}

impl Default for RenderTimingHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderTimingHelper {
    pub fn new() -> Self {
        Self {
            frames: [HelperFrame::READY; IN_FLIGHT_FRAMES],
            frame_counter: 0,
            extra_ns: 0,
            period_ns: 0,
            last_input_ns: 0,
            last_returned_ns: 0,
        }
    }

    /// Get the helper ready for a new client, dropping all in-flight frame
    /// state but keeping the render loop's samples.
    pub fn client_clear(&mut self) {
        self.frames = [HelperFrame::READY; IN_FLIGHT_FRAMES];
        self.last_returned_ns = 0;
    }

    fn index_of(frame_id: i64) -> usize {
        (frame_id as u64 % IN_FLIGHT_FRAMES as u64) as usize
    }

    fn frame_mut(
        &mut self,
        frame_id: i64,
        expected: HelperPhase,
        expected_name: &'static str,
    ) -> Result<&mut HelperFrame, TimingError> {
        let f = &mut self.frames[Self::index_of(frame_id)];
        if f.frame_id != frame_id {
            return Err(TimingError::UnknownFrame(frame_id));
        }
        if f.phase != expected {
            return Err(TimingError::BadPhase {
                frame_id,
                expected: expected_name,
            });
        }
        Ok(f)
    }

    /// Predict when the client's next frame will display and when the
    /// client should wake. Called from the client's `wait_frame`; does no
    /// waiting itself.
    pub fn predict(&mut self, now_ns: u64) -> Result<ClientPrediction, TimingError> {
        if self.period_ns == 0 {
            return Err(TimingError::NoSample);
        }

        let frame_id = self.frame_counter + 1;
        let index = Self::index_of(frame_id);
        if self.frames[index].phase != HelperPhase::Ready {
            return Err(TimingError::SlotBusy(self.frames[index].frame_id));
        }
        self.frame_counter = frame_id;

        // Never hand out a time at or before the last one returned.
        let at_least_ns = now_ns.max(self.last_returned_ns);

        let mut predict_ns = self.last_input_ns;
        while predict_ns <= at_least_ns {
            predict_ns += self.period_ns;
        }

        self.last_returned_ns = predict_ns;

        let f = &mut self.frames[index];
        *f = HelperFrame::READY;
        f.frame_id = frame_id;
        f.predicted_ns = now_ns;
        f.phase = HelperPhase::Predicted;

        trace!(frame_id, predict_ns, "client frame predicted");

        Ok(ClientPrediction {
            frame_id,
            wake_up_time_ns: predict_ns - self.period_ns,
            predicted_display_time_ns: predict_ns,
            predicted_display_period_ns: self.period_ns,
            min_display_period_ns: self.period_ns,
        })
    }

    /// The client's `wait_frame` sleep finished.
    pub fn mark_wait_woke(&mut self, frame_id: i64, now_ns: u64) -> Result<(), TimingError> {
        let f = self.frame_mut(frame_id, HelperPhase::Predicted, "predicted")?;
        f.wait_woke_ns = now_ns;
        f.phase = HelperPhase::WaitLeft;
        Ok(())
    }

    /// The client called `begin_frame`.
    pub fn mark_begin(&mut self, frame_id: i64, now_ns: u64) -> Result<(), TimingError> {
        let f = self.frame_mut(frame_id, HelperPhase::WaitLeft, "wait-left")?;
        f.begin_ns = now_ns;
        f.phase = HelperPhase::Begun;
        Ok(())
    }

    /// The frame was discarded rather than submitted. Any in-flight phase
    /// qualifies: a session can end while a frame is merely predicted.
    pub fn mark_discarded(&mut self, frame_id: i64, now_ns: u64) -> Result<(), TimingError> {
        let f = &mut self.frames[Self::index_of(frame_id)];
        if f.frame_id != frame_id {
            return Err(TimingError::UnknownFrame(frame_id));
        }
        if f.phase == HelperPhase::Ready {
            return Err(TimingError::BadPhase {
                frame_id,
                expected: "in-flight",
            });
        }
        f.end_frame_ns = now_ns;
        f.phase = HelperPhase::Ready;
        f.frame_id = -1;
        Ok(())
    }

    /// The client delivered the frame with `end_frame`. The GPU may still
    /// be rendering it.
    pub fn mark_delivered(&mut self, frame_id: i64, now_ns: u64) -> Result<(), TimingError> {
        let f = self.frame_mut(frame_id, HelperPhase::Begun, "begun")?;
        f.end_frame_ns = now_ns;
        trace!(
            frame_id,
            sleep_ns = f.wait_woke_ns.saturating_sub(f.predicted_ns),
            cpu_ns = f.begin_ns.saturating_sub(f.wait_woke_ns),
            draw_ns = f.end_frame_ns.saturating_sub(f.begin_ns),
            "client frame delivered"
        );
        f.phase = HelperPhase::Ready;
        f.frame_id = -1;
        Ok(())
    }

    /// A new sample from the render loop: the global pacer's predicted
    /// display time and period, plus how far before display the loop woke.
    pub fn new_sample(&mut self, display_time_ns: u64, period_ns: u64, extra_ns: u64) {
        self.last_input_ns = display_time_ns;
        self.extra_ns = extra_ns;
        self.period_ns = period_ns;
    }

    /// Time between sampled display and the render loop waking, for
    /// diagnostics.
    pub fn extra_ns(&self) -> u64 {
        self.extra_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: u64 = 11_111_111;

    #[test]
    fn predict_without_sample_fails() {
        let mut helper = RenderTimingHelper::new();
        assert_eq!(helper.predict(0), Err(TimingError::NoSample));
    }

    #[test]
    fn predictions_are_strictly_increasing() {
        let mut helper = RenderTimingHelper::new();
        helper.new_sample(100 * PERIOD, PERIOD, 0);

        let mut last = 0;
        for i in 0..10 {
            let p = helper.predict(i * PERIOD).unwrap();
            assert!(p.predicted_display_time_ns > last);
            last = p.predicted_display_time_ns;
            helper.mark_wait_woke(p.frame_id, 0).unwrap();
            helper.mark_begin(p.frame_id, 0).unwrap();
            helper.mark_delivered(p.frame_id, 0).unwrap();
        }
    }

    #[test]
    fn prediction_stays_after_the_sample_grid() {
        let mut helper = RenderTimingHelper::new();
        helper.new_sample(50_000_000, PERIOD, 1_000_000);
        let now = 100_000_000;
        let p = helper.predict(now).unwrap();
        assert!(p.predicted_display_time_ns > now);
        assert_eq!((p.predicted_display_time_ns - 50_000_000) % PERIOD, 0);
        assert_eq!(p.wake_up_time_ns, p.predicted_display_time_ns - PERIOD);
    }

    #[test]
    fn at_most_two_outstanding_predictions() {
        let mut helper = RenderTimingHelper::new();
        helper.new_sample(PERIOD, PERIOD, 0);

        let a = helper.predict(0).unwrap();
        let _b = helper.predict(0).unwrap();
        // Third concurrent prediction hits the busy slot of frame `a`.
        assert_eq!(helper.predict(0), Err(TimingError::SlotBusy(a.frame_id)));

        // Finishing the oldest frame frees its slot again.
        helper.mark_wait_woke(a.frame_id, 0).unwrap();
        helper.mark_begin(a.frame_id, 0).unwrap();
        helper.mark_delivered(a.frame_id, 0).unwrap();
        assert!(helper.predict(0).is_ok());
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let mut helper = RenderTimingHelper::new();
        helper.new_sample(PERIOD, PERIOD, 0);
        let p = helper.predict(0).unwrap();

        assert!(matches!(
            helper.mark_begin(p.frame_id, 0),
            Err(TimingError::BadPhase { .. })
        ));
        assert_eq!(
            helper.mark_wait_woke(999, 0),
            Err(TimingError::UnknownFrame(999))
        );

        helper.mark_wait_woke(p.frame_id, 0).unwrap();
        assert!(matches!(
            helper.mark_delivered(p.frame_id, 0),
            Err(TimingError::BadPhase { .. })
        ));
        helper.mark_begin(p.frame_id, 0).unwrap();
        helper.mark_delivered(p.frame_id, 0).unwrap();
    }

    #[test]
    fn discard_frees_from_any_in_flight_phase() {
        let mut helper = RenderTimingHelper::new();
        helper.new_sample(PERIOD, PERIOD, 0);

        // Merely predicted, as when a session ends mid wait_frame.
        let p = helper.predict(0).unwrap();
        helper.mark_discarded(p.frame_id, 0).unwrap();

        let q = helper.predict(0).unwrap();
        helper.mark_wait_woke(q.frame_id, 0).unwrap();
        helper.mark_discarded(q.frame_id, 0).unwrap();

        let r = helper.predict(0).unwrap();
        helper.mark_wait_woke(r.frame_id, 0).unwrap();
        helper.mark_begin(r.frame_id, 0).unwrap();
        helper.mark_discarded(r.frame_id, 0).unwrap();

        // Ready slots cannot be discarded again.
        assert!(matches!(
            helper.mark_discarded(r.frame_id, 0),
            Err(TimingError::UnknownFrame(_))
        ));
    }

    #[test]
    fn client_clear_resets_monotonic_floor_but_keeps_sample() {
        let mut helper = RenderTimingHelper::new();
        helper.new_sample(PERIOD, PERIOD, 0);
        let _ = helper.predict(0).unwrap();

        helper.client_clear();
        // A fresh client can predict right away off the retained sample.
        let p = helper.predict(0).unwrap();
        assert!(p.predicted_display_time_ns > 0);
    }
}
