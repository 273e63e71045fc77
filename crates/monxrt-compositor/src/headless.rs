//! A native compositor with no display attached.
//!
//! Drives the frame cadence from a pacer and synthesizes on-time
//! presentation feedback at commit. Swapchain images are plain memfd
//! allocations, still exported as transferable handles so the whole
//! swapchain path behaves exactly as with a real GPU. Used for tests and
//! for running the service on machines without an HMD.

use monxrt_common::time::{monotonic_ns, MS_IN_NS};
use monxrt_proto::messages::SwapchainCreate;
use monxrt_proto::{BlendMode, LayerEntry};
use monxrt_timing::{FramePacer, TimingPoint};
use rustix::fs::{ftruncate, memfd_create, MemfdFlags};
use tracing::{debug, trace};

use crate::{CompositorError, FrameTiming, NativeCompositor, NativeImage};

/// Synthesized present margin reported back to the pacer.
const SYNTH_MARGIN_NS: u64 = MS_IN_NS;

/// Headless native compositor.
pub struct HeadlessCompositor {
    pacer: Box<dyn FramePacer>,
    /// Report an immediate wake-up time; tests want ticks back to back.
    free_run: bool,
    session_active: bool,
    in_layer_pass: bool,
    /// Desired present time of the frame currently between begin and commit.
    pending: Option<(i64, u64)>,
    /// The most recently committed stack, for inspection.
    last_commit: Vec<(LayerEntry, BlendMode)>,
    commit_count: u64,
    collecting: Vec<(LayerEntry, BlendMode)>,
}

impl HeadlessCompositor {
    pub fn new(pacer: Box<dyn FramePacer>) -> Self {
        Self {
            pacer,
            free_run: false,
            session_active: false,
            in_layer_pass: false,
            pending: None,
            last_commit: Vec::new(),
            commit_count: 0,
            collecting: Vec::new(),
        }
    }

    /// Report wake-up times in the past so the render loop never sleeps.
    pub fn free_run(pacer: Box<dyn FramePacer>) -> Self {
        let mut hc = Self::new(pacer);
        hc.free_run = true;
        hc
    }

    /// Number of commits so far.
    pub fn commit_count(&self) -> u64 {
        self.commit_count
    }

    /// Whether a session is begun on this compositor.
    pub fn session_active(&self) -> bool {
        self.session_active
    }

    /// The layer stack of the most recent commit, bottom first.
    pub fn last_commit(&self) -> &[(LayerEntry, BlendMode)] {
        &self.last_commit
    }
}

impl NativeCompositor for HeadlessCompositor {
    fn create_images(
        &mut self,
        info: &SwapchainCreate,
    ) -> Result<Vec<NativeImage>, CompositorError> {
        if info.image_count == 0 || info.width == 0 || info.height == 0 {
            return Err(CompositorError::Runtime(format!(
                "degenerate swapchain {}x{} with {} images",
                info.width, info.height, info.image_count
            )));
        }

        // Four bytes per pixel covers every format the headless path sees.
        let size = info.width as u64 * info.height as u64 * 4 * info.array_size.max(1) as u64;

        let mut images = Vec::with_capacity(info.image_count as usize);
        for i in 0..info.image_count {
            let fd = memfd_create(
                format!("monxrt-image-{i}"),
                MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING,
            )
            .map_err(std::io::Error::from)?;
            ftruncate(&fd, size).map_err(std::io::Error::from)?;
            images.push(NativeImage { handle: fd, size });
        }

        debug!(
            width = info.width,
            height = info.height,
            count = info.image_count,
            size,
            "allocated headless swapchain images"
        );
        Ok(images)
    }

    fn begin_session(&mut self) -> Result<(), CompositorError> {
        self.session_active = true;
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), CompositorError> {
        self.session_active = false;
        Ok(())
    }

    fn predict_frame(&mut self) -> Result<FrameTiming, CompositorError> {
        let prediction = self.pacer.predict(monotonic_ns());

        self.pending = Some((prediction.frame_id, prediction.desired_present_time_ns));

        Ok(FrameTiming {
            frame_id: prediction.frame_id,
            wake_up_time_ns: if self.free_run {
                0
            } else {
                prediction.wake_up_time_ns
            },
            predicted_display_time_ns: prediction.predicted_display_time_ns,
            predicted_display_period_ns: prediction.predicted_display_period_ns,
        })
    }

    fn mark_woke(&mut self, frame_id: i64, when_ns: u64) -> Result<(), CompositorError> {
        self.pacer.mark_point(TimingPoint::WakeUp, frame_id, when_ns);
        Ok(())
    }

    fn begin_frame(&mut self, frame_id: i64) -> Result<(), CompositorError> {
        self.pacer
            .mark_point(TimingPoint::Begin, frame_id, monotonic_ns());
        Ok(())
    }

    fn discard_frame(&mut self, frame_id: i64) -> Result<(), CompositorError> {
        trace!(frame_id, "discarding frame");
        self.pending = None;
        Ok(())
    }

    fn layer_begin(&mut self, _frame_id: i64) -> Result<(), CompositorError> {
        self.in_layer_pass = true;
        self.collecting.clear();
        Ok(())
    }

    fn layer(
        &mut self,
        entry: &LayerEntry,
        env_blend_mode: BlendMode,
    ) -> Result<(), CompositorError> {
        if !self.in_layer_pass {
            return Err(CompositorError::Runtime(
                "layer outside layer_begin/layer_commit".to_string(),
            ));
        }
        self.collecting.push((*entry, env_blend_mode));
        Ok(())
    }

    fn layer_commit(&mut self, frame_id: i64) -> Result<(), CompositorError> {
        if !self.in_layer_pass {
            return Err(CompositorError::Runtime(
                "layer_commit without layer_begin".to_string(),
            ));
        }
        self.in_layer_pass = false;
        self.last_commit = std::mem::take(&mut self.collecting);
        self.commit_count += 1;

        let now_ns = monotonic_ns();
        self.pacer.mark_point(TimingPoint::Submit, frame_id, now_ns);

        // With no display there is nothing to miss: report an on-time
        // present at the desired slot.
        if let Some((pending_id, desired_ns)) = self.pending.take() {
            if pending_id == frame_id {
                self.pacer
                    .info(now_ns, frame_id, desired_ns, desired_ns, desired_ns, SYNTH_MARGIN_NS);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monxrt_proto::{LayerKind, Pose, SpaceKind, SubImageRect};
    use monxrt_timing::FakeTiming;

    const PERIOD: u64 = 1_000_000; // 1 ms, keeps tests fast

    fn compositor() -> HeadlessCompositor {
        HeadlessCompositor::free_run(Box::new(FakeTiming::new(PERIOD, monotonic_ns())))
    }

    fn tick(hc: &mut HeadlessCompositor) -> FrameTiming {
        let timing = hc.predict_frame().unwrap();
        hc.mark_woke(timing.frame_id, monotonic_ns()).unwrap();
        timing
    }

    fn quad() -> LayerEntry {
        LayerEntry {
            kind: LayerKind::Quad,
            swapchain_ids: [0; 4],
            rects: [SubImageRect::default(); 2],
            pose: Pose::IDENTITY,
            space: SpaceKind::View,
            blend_flags: 0,
        }
    }

    #[test]
    fn tick_roundtrip_records_layers() {
        let mut hc = compositor();
        let timing = tick(&mut hc);
        hc.begin_frame(timing.frame_id).unwrap();
        hc.layer_begin(timing.frame_id).unwrap();
        hc.layer(&quad(), BlendMode::Opaque).unwrap();
        hc.layer(&quad(), BlendMode::Opaque).unwrap();
        hc.layer_commit(timing.frame_id).unwrap();

        assert_eq!(hc.commit_count(), 1);
        assert_eq!(hc.last_commit().len(), 2);
    }

    #[test]
    fn layer_outside_pass_rejected() {
        let mut hc = compositor();
        let timing = tick(&mut hc);
        hc.begin_frame(timing.frame_id).unwrap();
        assert!(hc.layer(&quad(), BlendMode::Opaque).is_err());
        assert!(hc.layer_commit(timing.frame_id).is_err());
    }

    #[test]
    fn image_allocation_matches_request() {
        let mut hc = compositor();
        let images = hc
            .create_images(&SwapchainCreate {
                width: 64,
                height: 32,
                format: 0,
                image_count: 3,
                mip_count: 1,
                array_size: 1,
                sample_count: 1,
                usage_flags: 0,
            })
            .unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].size, 64 * 32 * 4);
    }

    #[test]
    fn degenerate_swapchain_rejected() {
        let mut hc = compositor();
        let result = hc.create_images(&SwapchainCreate {
            width: 0,
            height: 32,
            format: 0,
            image_count: 3,
            mip_count: 1,
            array_size: 1,
            sample_count: 1,
            usage_flags: 0,
        });
        assert!(result.is_err());
    }

    #[test]
    fn timing_advances_across_ticks() {
        let mut hc = compositor();
        let a = tick(&mut hc);
        hc.begin_frame(a.frame_id).unwrap();
        hc.layer_begin(a.frame_id).unwrap();
        hc.layer_commit(a.frame_id).unwrap();

        let b = tick(&mut hc);
        assert!(b.frame_id > a.frame_id);
        assert!(b.predicted_display_time_ns >= a.predicted_display_time_ns);
    }
}
