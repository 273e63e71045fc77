//! Multi-client compositor.
//!
//! The service composites layer stacks from every connected client into one
//! native present per vsync. This crate holds the pieces of that pipeline
//! that are independent of the transport:
//!
//! - [`slot`]: the triple-buffered per-client layer slots (`progress` →
//!   `scheduled` → `delivered`) and their hand-off rules
//! - [`merge`]: z-ordered collection of delivered stacks into per-layer
//!   dispatch against the native compositor
//! - [`swapchain`]: image FIFO state machine and the deferred-destroy
//!   stack drained by the render thread
//! - [`headless`]: a native compositor implementation with no display,
//!   used for tests and GPU-less operation
//!
//! The native compositor itself is a capability set ([`NativeCompositor`]):
//! variants (real, headless) implement the same trait, and the render loop
//! only ever talks through it.

#![forbid(unsafe_code)]

pub mod headless;
pub mod merge;
pub mod slot;
pub mod swapchain;

use std::os::fd::OwnedFd;

use monxrt_proto::messages::SwapchainCreate;
use monxrt_proto::{BlendMode, LayerEntry};

pub use headless::HeadlessCompositor;
pub use merge::{dispatch_layers, z_sorted_order, ClientZ};
pub use slot::{ClientSlots, LayerSlot};
pub use swapchain::{GcStack, ImagePhase, SwapchainError, SwapchainState};

/// Compositor-side failures.
#[derive(Debug, thiserror::Error)]
pub enum CompositorError {
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("display device lost: {0}")]
    DeviceLost(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the native compositor's `predict_frame` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    pub frame_id: i64,
    /// When the render loop should wake and start the tick.
    pub wake_up_time_ns: u64,
    pub predicted_display_time_ns: u64,
    pub predicted_display_period_ns: u64,
}

/// One GPU-importable image exported as a transferable OS handle.
#[derive(Debug)]
pub struct NativeImage {
    pub handle: OwnedFd,
    pub size: u64,
}

/// The capability set the render loop drives.
///
/// Nothing here blocks: `predict_frame` answers a wake-up time and the
/// caller sleeps until it before reporting back with `mark_woke`, so the
/// compositor can live behind a lock without stalling other callers for a
/// frame. Layer submission is bracketed by `layer_begin` and
/// `layer_commit` and receives entries in z order, bottom first.
pub trait NativeCompositor: Send {
    /// Allocate the image set backing a new swapchain.
    fn create_images(&mut self, info: &SwapchainCreate) -> Result<Vec<NativeImage>, CompositorError>;

    fn begin_session(&mut self) -> Result<(), CompositorError>;

    fn end_session(&mut self) -> Result<(), CompositorError>;

    /// Predict the next frame's timing, including when to wake.
    fn predict_frame(&mut self) -> Result<FrameTiming, CompositorError>;

    /// The render loop woke up for `frame_id` at `when_ns`.
    fn mark_woke(&mut self, frame_id: i64, when_ns: u64) -> Result<(), CompositorError>;

    fn begin_frame(&mut self, frame_id: i64) -> Result<(), CompositorError>;

    fn discard_frame(&mut self, frame_id: i64) -> Result<(), CompositorError>;

    fn layer_begin(&mut self, frame_id: i64) -> Result<(), CompositorError>;

    /// Dispatch one layer of the merged stack.
    fn layer(
        &mut self,
        entry: &LayerEntry,
        env_blend_mode: BlendMode,
    ) -> Result<(), CompositorError>;

    /// Finish the merged stack and kick the native present.
    ///
    /// Presentation feedback, where the platform has any, flows back into
    /// the variant's own pacer; it is not part of this interface.
    fn layer_commit(&mut self, frame_id: i64) -> Result<(), CompositorError>;
}
