//! Triple-buffered per-client layer slots.
//!
//! Each client owns three slots:
//!
//! - `progress`: being populated by the client worker between
//!   `begin_frame` and `end_frame`; only that worker touches it
//! - `scheduled`: the latest completed stack awaiting its display time
//! - `delivered`: what the render thread composites this tick; only the
//!   render thread touches it
//!
//! Hand-off into and out of `scheduled` happens under the slot lock. The
//! other two slots have dedicated owners; their mutexes exist for Rust's
//! sharing rules and are never contended.

use std::sync::Mutex;
use std::time::Duration;

use monxrt_common::time::monotonic_ns;
use monxrt_proto::{BlendMode, LayerEntry, LayerStack};

/// Render state for a single client, including all layers.
#[derive(Debug, Clone, Default)]
pub struct LayerSlot {
    /// When this stack should be shown.
    pub display_time_ns: u64,
    pub env_blend_mode: BlendMode,
    pub layers: Vec<LayerEntry>,
    pub active: bool,
}

impl LayerSlot {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Move `src` into `self`, leaving `src` cleared.
    pub fn take_from(&mut self, src: &mut LayerSlot) {
        *self = std::mem::take(src);
    }
}

/// The three slots of one client.
#[derive(Debug, Default)]
pub struct ClientSlots {
    progress: Mutex<LayerSlot>,
    scheduled: Mutex<LayerSlot>,
    delivered: Mutex<LayerSlot>,
}

impl ClientSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new frame's stack. Called by the client worker on
    /// `begin_frame`; any leftover progress state is discarded.
    pub fn begin_progress(&self, display_time_ns: u64, env_blend_mode: BlendMode) {
        let mut progress = self.progress.lock().unwrap();
        progress.clear();
        progress.active = true;
        progress.display_time_ns = display_time_ns;
        progress.env_blend_mode = env_blend_mode;
    }

    /// Append one layer to the in-progress stack.
    pub fn push_layer(&self, entry: LayerEntry) {
        let mut progress = self.progress.lock().unwrap();
        debug_assert!(progress.active, "layer pushed outside begin/end frame");
        progress.layers.push(entry);
    }

    /// Replace the whole in-progress stack at once, as the `end_frame`
    /// handler does after decoding the client's submission.
    pub fn set_progress(&self, stack: &LayerStack) {
        let mut progress = self.progress.lock().unwrap();
        progress.clear();
        progress.active = true;
        progress.display_time_ns = stack.display_time_ns;
        progress.env_blend_mode = stack.env_blend_mode;
        progress.layers = stack.layers.clone();
    }

    /// Commit the in-progress stack into `scheduled`.
    ///
    /// Blocks while a still-relevant stack occupies the scheduled slot, so
    /// a client running faster than the compositor back-pressures here. A
    /// scheduled stack whose display time has already passed is replaced
    /// immediately.
    pub fn commit_progress(&self) {
        loop {
            let mut scheduled = self.scheduled.lock().unwrap();

            let replaceable =
                !scheduled.active || scheduled.display_time_ns < monotonic_ns();
            if replaceable {
                let mut progress = self.progress.lock().unwrap();
                scheduled.take_from(&mut progress);
                return;
            }

            drop(scheduled);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Deliver the scheduled stack if its display time has arrived. Called
    /// by the render thread each tick with that tick's target display time;
    /// copies `scheduled` into `delivered` under the slot lock.
    pub fn deliver_any_frame(&self, target_display_time_ns: u64) {
        let mut scheduled = self.scheduled.lock().unwrap();

        if !scheduled.active {
            return;
        }

        if scheduled.display_time_ns <= target_display_time_ns {
            let mut delivered = self.delivered.lock().unwrap();
            delivered.take_from(&mut scheduled);
        }
    }

    /// Run `f` over the delivered stack. Render thread only.
    pub fn with_delivered<R>(&self, f: impl FnOnce(&LayerSlot) -> R) -> R {
        let delivered = self.delivered.lock().unwrap();
        f(&delivered)
    }

    /// The display time the client worker most recently scheduled, if any.
    pub fn scheduled_display_time(&self) -> Option<u64> {
        let scheduled = self.scheduled.lock().unwrap();
        scheduled.active.then_some(scheduled.display_time_ns)
    }

    /// Drop all three stacks, e.g. on session teardown.
    pub fn clear_all(&self) {
        self.progress.lock().unwrap().clear();
        self.scheduled.lock().unwrap().clear();
        self.delivered.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monxrt_proto::{LayerKind, Pose, SpaceKind, SubImageRect};

    fn quad(swapchain_id: u32) -> LayerEntry {
        LayerEntry {
            kind: LayerKind::Quad,
            swapchain_ids: [swapchain_id, 0, 0, 0],
            rects: [SubImageRect::default(); 2],
            pose: Pose::IDENTITY,
            space: SpaceKind::World,
            blend_flags: 0,
        }
    }

    #[test]
    fn progress_to_scheduled_to_delivered() {
        let slots = ClientSlots::new();
        slots.begin_progress(1_000, BlendMode::Opaque);
        slots.push_layer(quad(1));
        slots.commit_progress();

        // Not yet due: target before the scheduled display time.
        slots.deliver_any_frame(999);
        slots.with_delivered(|d| assert!(!d.active));
        assert_eq!(slots.scheduled_display_time(), Some(1_000));

        // Due exactly at the scheduled time.
        slots.deliver_any_frame(1_000);
        slots.with_delivered(|d| {
            assert!(d.active);
            assert_eq!(d.display_time_ns, 1_000);
            assert_eq!(d.layers.len(), 1);
        });
        assert_eq!(slots.scheduled_display_time(), None);
    }

    #[test]
    fn delivered_never_ahead_of_target() {
        let slots = ClientSlots::new();
        for display_time in [5_000u64, 6_000, 7_000] {
            slots.begin_progress(display_time, BlendMode::Opaque);
            slots.push_layer(quad(0));
            slots.commit_progress();
            slots.deliver_any_frame(4_999);
            slots.with_delivered(|d| {
                assert!(
                    !d.active || d.display_time_ns <= 4_999,
                    "delivered a stack from the future"
                );
            });
        }
    }

    #[test]
    fn stale_scheduled_stack_is_replaced() {
        let slots = ClientSlots::new();
        // Display time far in the past relative to the monotonic clock.
        slots.begin_progress(1, BlendMode::Opaque);
        slots.commit_progress();

        // The next commit must not block on the stale stack.
        slots.begin_progress(2, BlendMode::Opaque);
        slots.commit_progress();
        assert_eq!(slots.scheduled_display_time(), Some(2));
    }

    #[test]
    fn clear_all_resets_everything() {
        let slots = ClientSlots::new();
        slots.begin_progress(10, BlendMode::Additive);
        slots.push_layer(quad(3));
        slots.commit_progress();
        slots.deliver_any_frame(10);

        slots.clear_all();
        slots.with_delivered(|d| assert!(!d.active));
        assert_eq!(slots.scheduled_display_time(), None);
    }

    #[test]
    fn begin_progress_discards_previous() {
        let slots = ClientSlots::new();
        slots.begin_progress(10, BlendMode::Opaque);
        slots.push_layer(quad(1));
        slots.push_layer(quad(2));
        slots.begin_progress(20, BlendMode::Opaque);
        slots.commit_progress();
        slots.deliver_any_frame(20);
        slots.with_delivered(|d| {
            assert_eq!(d.display_time_ns, 20);
            assert!(d.layers.is_empty());
        });
    }
}
