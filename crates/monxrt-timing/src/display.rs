//! Closed-loop pacer for systems with presentation-timing feedback.
//!
//! Keeps a ring of [`NUM_FRAMES`] frame records. `predict` walks forward in
//! whole display periods from the most recent known-good present time until
//! it finds one the application can still hit, then budgets the wake-up
//! time backwards from it. `info` feeds presentation feedback into an
//! adaptive controller that grows the application time budget on missed
//! frames and nudges it toward the target margin otherwise.

use monxrt_common::time::{is_within, is_within_half_ms, ns_to_ms_f, percent_of, HALF_MS_IN_NS, MS_IN_NS};
use tracing::{debug, info, trace, warn};

use crate::{FramePacer, FramePrediction, TimingPoint};

/// Frames tracked in the ring.
pub const NUM_FRAMES: usize = 16;

/// Lifetime phase of one ring entry. Later phases compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FramePhase {
    Skipped,
    Cleared,
    Predicted,
    Woke,
    Began,
    Submitted,
    Info,
}

/// One frame's record in the ring.
#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    frame_id: i64,
    when_predict_ns: u64,
    wake_up_time_ns: u64,
    when_woke_ns: u64,
    when_began_ns: u64,
    when_submitted_ns: u64,
    when_infoed_ns: u64,
    current_app_time_ns: u64,
    desired_present_time_ns: u64,
    predicted_display_time_ns: u64,
    present_margin_ns: u64,
    actual_present_time_ns: u64,
    earliest_present_time_ns: u64,
    phase: FramePhase,
}

impl FrameRecord {
    const CLEARED: FrameRecord = FrameRecord {
        frame_id: -1,
        when_predict_ns: 0,
        wake_up_time_ns: 0,
        when_woke_ns: 0,
        when_began_ns: 0,
        when_submitted_ns: 0,
        when_infoed_ns: 0,
        current_app_time_ns: 0,
        desired_present_time_ns: 0,
        predicted_display_time_ns: 0,
        present_margin_ns: 0,
        actual_present_time_ns: 0,
        earliest_present_time_ns: 0,
        phase: FramePhase::Cleared,
    };
}

/// Closed-loop display pacer.
pub struct DisplayTiming {
    /// Often the present time reported by the system is when scan-out
    /// starts, not when pixels turn into photons. This bridges the two.
    present_offset_ns: u64,
    frame_period_ns: u64,
    /// Time currently budgeted for the application to render a frame.
    app_time_ns: u64,
    /// Ceiling on the application budget.
    app_time_max_ns: u64,
    /// Growth step when a frame misses its present slot.
    adjust_missed_ns: u64,
    /// Step and dead-band for non-miss margin corrections.
    adjust_non_miss_ns: u64,
    /// Target time between GPU completion and scan-out start.
    margin_ns: u64,
    next_frame_id: i64,
    frames: [FrameRecord; NUM_FRAMES],
}

impl DisplayTiming {
    /// Create a pacer for a display with the given period.
    pub fn new(estimated_frame_period_ns: u64) -> Self {
        let dt = Self {
            present_offset_ns: 4 * MS_IN_NS,
            frame_period_ns: estimated_frame_period_ns,
            app_time_ns: percent_of(estimated_frame_period_ns, 10),
            app_time_max_ns: percent_of(estimated_frame_period_ns, 30),
            adjust_missed_ns: percent_of(estimated_frame_period_ns, 4),
            adjust_non_miss_ns: percent_of(estimated_frame_period_ns, 2),
            margin_ns: MS_IN_NS,
            next_frame_id: 0,
            frames: [FrameRecord::CLEARED; NUM_FRAMES],
        };
        info!(
            period_ms = ns_to_ms_f(estimated_frame_period_ns),
            "created display timing"
        );
        dt
    }

    /// The current application time budget. Diagnostic only.
    pub fn app_time_ns(&self) -> u64 {
        self.app_time_ns
    }

    /// Growth step applied when a frame misses.
    pub fn adjust_missed_ns(&self) -> u64 {
        self.adjust_missed_ns
    }

    /// Nudge step applied when the margin drifts.
    pub fn adjust_non_miss_ns(&self) -> u64 {
        self.adjust_non_miss_ns
    }

    fn total_app_time(&self) -> u64 {
        self.app_time_ns + self.margin_ns
    }

    fn index_of(frame_id: i64) -> usize {
        debug_assert!(frame_id >= 0);
        (frame_id as u64 % NUM_FRAMES as u64) as usize
    }

    fn create_frame(&mut self, phase: FramePhase) -> &mut FrameRecord {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        let f = &mut self.frames[Self::index_of(frame_id)];
        *f = FrameRecord::CLEARED;
        f.frame_id = frame_id;
        f.phase = phase;
        f
    }

    fn latest_frame_with_phase_at_least(&self, phase: FramePhase) -> Option<&FrameRecord> {
        let mut count = 1;
        while count <= NUM_FRAMES as i64 && self.next_frame_id >= count {
            let f = &self.frames[Self::index_of(self.next_frame_id - count)];
            if f.phase >= phase && f.frame_id == self.next_frame_id - count {
                return Some(f);
            }
            count += 1;
        }
        None
    }

    /// First prediction ever: no history to walk from.
    fn do_clean_slate_frame(&mut self, now_ns: u64) -> i64 {
        // Wild shot in the dark.
        let the_time_ns = now_ns + self.frame_period_ns * 10;
        let f = self.create_frame(FramePhase::Predicted);
        f.when_predict_ns = now_ns;
        f.desired_present_time_ns = the_time_ns;
        f.frame_id
    }

    fn walk_forward_through_frames(&mut self, now_ns: u64, last_present_time_ns: u64) -> i64 {
        let from_time_ns = now_ns + self.total_app_time();
        let mut desired_present_time_ns = last_present_time_ns + self.frame_period_ns;

        while desired_present_time_ns <= from_time_ns {
            debug!(
                from_time_ns,
                desired_present_time_ns,
                diff_ms = ns_to_ms_f(from_time_ns - desired_present_time_ns),
                "skipped present slot"
            );
            // Try the next frame period.
            desired_present_time_ns += self.frame_period_ns;
        }

        let f = self.create_frame(FramePhase::Predicted);
        f.when_predict_ns = now_ns;
        f.desired_present_time_ns = desired_present_time_ns;
        f.frame_id
    }

    fn predict_next_frame(&mut self, now_ns: u64) -> i64 {
        let last_predicted = self
            .latest_frame_with_phase_at_least(FramePhase::Predicted)
            .map(|f| (f.frame_id, f.predicted_display_time_ns));
        let last_completed = self
            .latest_frame_with_phase_at_least(FramePhase::Info)
            .map(|f| {
                (
                    f.frame_id,
                    f.desired_present_time_ns,
                    f.earliest_present_time_ns,
                )
            });

        let frame_id = match (last_predicted, last_completed) {
            (None, None) => self.do_clean_slate_frame(now_ns),
            (Some((predicted_id, _)), Some((completed_id, _, earliest_ns)))
                if predicted_id == completed_id =>
            {
                // Very high probability that we missed a frame.
                self.walk_forward_through_frames(now_ns, earliest_ns)
            }
            (Some((predicted_id, _)), Some((completed_id, desired_ns, earliest_ns))) => {
                debug_assert!(predicted_id > completed_id);
                let mut diff_id = predicted_id - completed_id;
                let diff_ns = desired_ns.saturating_sub(earliest_ns);
                if diff_ns > MS_IN_NS {
                    debug!("large diff between desired and earliest present");
                }
                if diff_id > 1 {
                    debug!(diff_id, "more than one predicted frame in flight");
                    diff_id = 1;
                }
                let adjusted_last_present_time_ns =
                    earliest_ns + diff_id as u64 * self.frame_period_ns;
                self.walk_forward_through_frames(now_ns, adjusted_last_present_time_ns)
            }
            (Some((_, predicted_display_ns)), None) => {
                self.walk_forward_through_frames(now_ns, predicted_display_ns)
            }
            (None, Some(_)) => unreachable!("completed frames are also predicted"),
        };

        let total_app_time_ns = self.total_app_time();
        let app_time_ns = self.app_time_ns;
        let present_offset_ns = self.present_offset_ns;
        let f = &mut self.frames[Self::index_of(frame_id)];
        f.predicted_display_time_ns = f.desired_present_time_ns + present_offset_ns;
        f.wake_up_time_ns = f.desired_present_time_ns.saturating_sub(total_app_time_ns);
        f.current_app_time_ns = app_time_ns;

        frame_id
    }

    /// The adaptive controller: grow the budget after a miss, otherwise
    /// keep the present margin inside the dead-band around the target.
    fn adjust_app_time(&mut self, index: usize) {
        let f = &self.frames[index];

        if f.actual_present_time_ns > f.desired_present_time_ns
            && !is_within_half_ms(f.actual_present_time_ns, f.desired_present_time_ns)
        {
            let missed_ms = ns_to_ms_f(f.actual_present_time_ns - f.desired_present_time_ns);
            warn!(frame_id = f.frame_id, missed_ms, "frame missed");

            self.app_time_ns = (self.app_time_ns + self.adjust_missed_ns).min(self.app_time_max_ns);
            return;
        }

        // We want the GPU work to stop at margin_ns.
        if is_within(f.present_margin_ns, self.margin_ns, self.adjust_non_miss_ns) {
            return;
        }

        // We didn't miss the frame but we were outside the dead-band.
        if f.present_margin_ns > self.margin_ns {
            // Approach the present time.
            self.app_time_ns = self.app_time_ns.saturating_sub(self.adjust_non_miss_ns);
        } else {
            // Back off the present time.
            self.app_time_ns += self.adjust_non_miss_ns;
        }
    }
}

impl FramePacer for DisplayTiming {
    fn predict(&mut self, now_ns: u64) -> FramePrediction {
        let frame_id = self.predict_next_frame(now_ns);
        let f = &self.frames[Self::index_of(frame_id)];

        FramePrediction {
            frame_id,
            wake_up_time_ns: f.wake_up_time_ns,
            desired_present_time_ns: f.desired_present_time_ns,
            present_slop_ns: HALF_MS_IN_NS,
            predicted_display_time_ns: f.predicted_display_time_ns,
            predicted_display_period_ns: self.frame_period_ns,
            min_display_period_ns: self.frame_period_ns,
        }
    }

    fn mark_point(&mut self, point: TimingPoint, frame_id: i64, when_ns: u64) {
        let f = &mut self.frames[Self::index_of(frame_id)];

        let (expected, next) = match point {
            TimingPoint::WakeUp => (FramePhase::Predicted, FramePhase::Woke),
            TimingPoint::Begin => (FramePhase::Woke, FramePhase::Began),
            TimingPoint::Submit => (FramePhase::Began, FramePhase::Submitted),
        };

        if f.phase != expected || f.frame_id != frame_id {
            debug_assert!(
                false,
                "out of order mark {point:?} for frame {frame_id} in phase {:?}",
                f.phase
            );
            warn!(?point, frame_id, phase = ?f.phase, "ignoring out-of-order mark");
            return;
        }

        match point {
            TimingPoint::WakeUp => f.when_woke_ns = when_ns,
            TimingPoint::Begin => f.when_began_ns = when_ns,
            TimingPoint::Submit => f.when_submitted_ns = when_ns,
        }
        f.phase = next;
    }

    fn info(
        &mut self,
        now_ns: u64,
        frame_id: i64,
        desired_present_time_ns: u64,
        actual_present_time_ns: u64,
        earliest_present_time_ns: u64,
        present_margin_ns: u64,
    ) {
        let index = Self::index_of(frame_id);
        let f = &mut self.frames[index];

        if f.phase != FramePhase::Submitted || f.frame_id != frame_id {
            debug_assert!(
                false,
                "feedback for frame {frame_id} in phase {:?}",
                f.phase
            );
            warn!(frame_id, phase = ?f.phase, "ignoring out-of-order feedback");
            return;
        }

        f.when_infoed_ns = now_ns;
        f.desired_present_time_ns = desired_present_time_ns;
        f.actual_present_time_ns = actual_present_time_ns;
        f.earliest_present_time_ns = earliest_present_time_ns;
        f.present_margin_ns = present_margin_ns;
        f.phase = FramePhase::Info;

        self.adjust_app_time(index);

        let f = &self.frames[index];
        trace!(
            frame_id,
            when_predict_ns = f.when_predict_ns,
            when_woke_ns = f.when_woke_ns,
            when_began_ns = f.when_began_ns,
            when_submitted_ns = f.when_submitted_ns,
            when_infoed_ns = f.when_infoed_ns,
            app_time_ms = ns_to_ms_f(f.current_app_time_ns),
            desired_present_time_ns,
            actual_present_time_ns,
            earliest_present_time_ns,
            present_margin_ms = ns_to_ms_f(present_margin_ns),
            "frame feedback"
        );
    }
}
