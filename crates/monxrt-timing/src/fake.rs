//! Open-loop pacer for systems without presentation feedback.
//!
//! A stateless affine predictor: the next display time is the last known
//! display time plus however many whole periods it takes to leave room for
//! the present offset and the application time. No adaptation; marks and
//! feedback are accepted and ignored beyond lightweight checks.

use monxrt_common::time::{percent_of, HALF_MS_IN_NS, MS_IN_NS};
use tracing::info;

use crate::{FramePacer, FramePrediction, TimingPoint};

/// Open-loop display pacer.
pub struct FakeTiming {
    frame_period_ns: u64,
    /// When the last frame was displayed.
    last_display_time_ns: u64,
    /// Bridges reported present time and photons, same as the closed loop.
    present_offset_ns: u64,
    /// Fixed time budgeted for the application.
    app_time_ns: u64,
    frame_id_generator: i64,
}

impl FakeTiming {
    /// Create a pacer for a display with the given period. `now_ns` seeds
    /// the first display time slightly into the future.
    pub fn new(estimated_frame_period_ns: u64, now_ns: u64) -> Self {
        info!("created fake timing");
        Self {
            frame_period_ns: estimated_frame_period_ns,
            last_display_time_ns: now_ns + 50 * MS_IN_NS,
            present_offset_ns: 4 * MS_IN_NS,
            app_time_ns: percent_of(estimated_frame_period_ns, 20),
            // Make sure calling code copes with a non-zero first frame id.
            frame_id_generator: 5,
        }
    }

    fn predict_next_frame(&self, now_ns: u64) -> u64 {
        let time_needed_ns = self.present_offset_ns + self.app_time_ns;
        let mut predicted_display_time_ns = self.last_display_time_ns + self.frame_period_ns;

        while now_ns + time_needed_ns > predicted_display_time_ns {
            predicted_display_time_ns += self.frame_period_ns;
        }

        predicted_display_time_ns
    }
}

impl FramePacer for FakeTiming {
    fn predict(&mut self, now_ns: u64) -> FramePrediction {
        let frame_id = self.frame_id_generator;
        self.frame_id_generator += 1;

        let predicted_display_time_ns = self.predict_next_frame(now_ns);
        let desired_present_time_ns = predicted_display_time_ns - self.present_offset_ns;
        let wake_up_time_ns = desired_present_time_ns - self.app_time_ns;

        FramePrediction {
            frame_id,
            wake_up_time_ns,
            desired_present_time_ns,
            present_slop_ns: HALF_MS_IN_NS,
            predicted_display_time_ns,
            predicted_display_period_ns: self.frame_period_ns,
            min_display_period_ns: self.frame_period_ns,
        }
    }

    fn mark_point(&mut self, _point: TimingPoint, _frame_id: i64, _when_ns: u64) {
        // Accepted to keep call sites identical to the closed loop.
    }

    fn info(
        &mut self,
        _now_ns: u64,
        _frame_id: i64,
        _desired_present_time_ns: u64,
        _actual_present_time_ns: u64,
        _earliest_present_time_ns: u64,
        _present_margin_ns: u64,
    ) {
        // The render loop may deliver feedback even though it selected the
        // fake pacer; there is nothing useful to do with it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: u64 = 11_111_111;

    #[test]
    fn first_frame_id_is_nonzero() {
        let mut ft = FakeTiming::new(PERIOD, 0);
        assert_eq!(ft.predict(0).frame_id, 5);
        assert_eq!(ft.predict(0).frame_id, 6);
    }

    #[test]
    fn prediction_beats_now_plus_budget() {
        let mut ft = FakeTiming::new(PERIOD, 0);
        let now = 500 * MS_IN_NS;
        let p = ft.predict(now);
        assert!(p.predicted_display_time_ns > now + 4 * MS_IN_NS + percent_of(PERIOD, 20));
        assert_eq!(
            p.predicted_display_time_ns - p.desired_present_time_ns,
            4 * MS_IN_NS
        );
        assert_eq!(
            p.desired_present_time_ns - p.wake_up_time_ns,
            percent_of(PERIOD, 20)
        );
    }

    #[test]
    fn predictions_land_on_the_period_grid() {
        let mut ft = FakeTiming::new(PERIOD, 0);
        let a = ft.predict(0).predicted_display_time_ns;
        let b = ft.predict(200 * MS_IN_NS).predicted_display_time_ns;
        assert_eq!((b - a) % PERIOD, 0);
        assert!(b > a);
    }

    #[test]
    fn marks_and_feedback_are_ignored() {
        let mut ft = FakeTiming::new(PERIOD, 0);
        let p = ft.predict(0);
        // No phase tracking: any order is accepted without panicking.
        ft.mark_point(TimingPoint::Submit, p.frame_id, 0);
        ft.mark_point(TimingPoint::WakeUp, p.frame_id, 0);
        ft.info(0, p.frame_id, 1, 2, 3, 4);
        let q = ft.predict(0);
        assert_eq!(q.frame_id, p.frame_id + 1);
    }
}
