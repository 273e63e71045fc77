//! The dedicated render task.
//!
//! Owns the native compositor for the life of the service and runs the
//! wait → begin → collect → commit loop once per vsync:
//!
//! 1. Predict the next frame and sleep until its wake-up time.
//! 2. Broadcast the new timing sample to every client helper, under the
//!    global lock.
//! 3. Deliver due scheduled stacks, z-sort the active clients, and dispatch
//!    their layers into one native present.
//! 4. Drain the swapchain GC stack at the tick's safe point.
//! 5. Poll the control socket with zero timeout so new connections and
//!    shutdown are noticed every vsync.
//!
//! A failing tick aborts its present and the next tick re-synchronizes;
//! repeated failures escalate to `LOSS_PENDING` for every session.

use std::sync::Arc;
use std::time::Duration;

use monxrt_common::time::monotonic_ns;
use monxrt_compositor::{dispatch_layers, z_sorted_order, CompositorError, FrameTiming};
use rustix::event::epoll;
use tracing::{debug, error, info, warn};

use crate::client::start_client;
use crate::server::Server;
use crate::socket::ControlListener;

/// Consecutive failed ticks before every session is torn down.
const MAX_CONSECUTIVE_FAILURES: u32 = 8;

/// Epoll user-data tag for the listening socket.
const DATA_LISTENER: u64 = 1;

/// Run the render loop until the service stops. Returns an error only for
/// unrecoverable setup failures.
pub fn run(server: Arc<Server>, listener: ControlListener) -> anyhow::Result<()> {
    let epfd = epoll::create(epoll::CreateFlags::CLOEXEC)?;
    epoll::add(
        &epfd,
        listener.as_fd(),
        epoll::EventData::new_u64(DATA_LISTENER),
        epoll::EventFlags::IN,
    )?;

    let mut consecutive_failures = 0u32;

    info!("render loop running");
    while server.running() {
        match tick(&server) {
            Ok(()) => consecutive_failures = 0,
            Err(err) => {
                consecutive_failures += 1;
                warn!(%err, consecutive_failures, "render tick failed");
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("render loop cannot recover, escalating loss to all sessions");
                    server.escalate_loss_all();
                    server.mark_failed();
                    server.stop();
                    break;
                }
                // Give the system a beat before re-synchronizing.
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        // Check polling last, so waiters see valid timing data first.
        poll_control(&epfd, &listener, &server);
    }

    info!("render loop exiting");
    Ok(())
}

/// One vsync worth of work.
fn tick(server: &Arc<Server>) -> Result<(), CompositorError> {
    // Predict, then sleep outside the compositor lock.
    let timing: FrameTiming = server.compositor.lock().unwrap().predict_frame()?;

    let now = monotonic_ns();
    if timing.wake_up_time_ns > now {
        std::thread::sleep(Duration::from_nanos(timing.wake_up_time_ns - now));
    }
    let woke_at = monotonic_ns();

    {
        let mut xc = server.compositor.lock().unwrap();
        xc.mark_woke(timing.frame_id, woke_at)?;
    }

    // Broadcast the fresh sample to every per-client timing helper.
    let extra_ns = timing.predicted_display_time_ns.saturating_sub(woke_at);
    {
        let mut global = server.global();
        for control in global.clients.iter_mut().filter(|c| c.occupied) {
            control.helper.new_sample(
                timing.predicted_display_time_ns,
                timing.predicted_display_period_ns,
                extra_ns,
            );
        }
    }

    // Promote due scheduled stacks to delivered.
    for cell in &server.cells {
        cell.slots.deliver_any_frame(timing.predicted_display_time_ns);
    }

    let (primary, overlays) = server.render_snapshot();
    let order = z_sorted_order(primary, &overlays);

    {
        let mut xc = server.compositor.lock().unwrap();
        xc.begin_frame(timing.frame_id)?;
        xc.layer_begin(timing.frame_id)?;

        let dispatched = dispatch_layers(
            &order,
            |index| server.cells.get(index).map(|cell| &cell.slots),
            xc.as_mut(),
        );
        if let Err(err) = dispatched {
            // Abort this present; the next tick re-synchronizes.
            debug!(%err, "aborting present for this tick");
            let _ = xc.discard_frame(timing.frame_id);
            return Err(err);
        }

        xc.layer_commit(timing.frame_id)?;
    }

    // Safe point: nothing from this tick references condemned swapchains.
    drop(server.gc.drain());

    Ok(())
}

/// Zero-timeout poll of the listening socket: accept pending connections.
fn poll_control(epfd: &impl rustix::fd::AsFd, listener: &ControlListener, server: &Arc<Server>) {
    let mut events = epoll::EventVec::with_capacity(8);
    if let Err(err) = epoll::wait(epfd, &mut events, 0) {
        warn!(%err, "epoll wait failed");
        server.stop();
        return;
    }

    for event in events.iter() {
        if event.data.u64() != DATA_LISTENER {
            continue;
        }
        match listener.accept() {
            Ok(conn) => start_client(server, conn),
            Err(err) => warn!(%err, "accept failed"),
        }
    }
}
