//! Process-wide service state.
//!
//! The [`Server`] owns the device table, the shared-memory region, the
//! native compositor, and a fixed table of client slots. The global-state
//! lock guards the control half of every client (session, timing helper,
//! flags) plus active-primary selection; the per-client layer slots, event
//! rings, and semaphores live outside it and have their own locks.
//!
//! Lock order, outermost first: global state → layer slot → event ring.
//! The global lock is never held across blocking I/O or sleeps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use monxrt_common::debug::ServiceOptions;
use monxrt_common::time::monotonic_ns;
use monxrt_common::{Error, Result};
use monxrt_compositor::{ClientSlots, ClientZ, GcStack, NativeCompositor, NativeImage, SwapchainState};
use monxrt_proto::shm::DeviceTable;
use monxrt_proto::{Event, SessionState, MAX_CLIENTS, MAX_CLIENT_SWAPCHAINS};
use tracing::{info, warn};

use crate::device::DeviceProvider;
use crate::events::EventQueue;
use crate::session::{ActiveWaits, FrameSemaphore, Session};
use crate::shm::ShmRegion;

/// Control-plane state of one client slot, guarded by the global lock.
#[derive(Debug)]
pub struct ClientControl {
    pub occupied: bool,
    pub app_name: String,
    pub pid: u32,
    pub instance_created: bool,
    pub session_created: bool,
    pub overlay: bool,
    pub z_order: i32,
    /// The session is actively presenting (first `wait_frame` onward).
    pub session_active: bool,
    pub visible: bool,
    pub focused: bool,
    pub session: Session,
    pub helper: monxrt_timing::RenderTimingHelper,
}

impl ClientControl {
    fn vacant() -> Self {
        Self {
            occupied: false,
            app_name: String::new(),
            pid: 0,
            instance_created: false,
            session_created: false,
            overlay: false,
            z_order: 0,
            session_active: false,
            visible: false,
            focused: false,
            session: Session::new(false),
            helper: monxrt_timing::RenderTimingHelper::new(),
        }
    }

    fn reset(&mut self, lifecycle_log: bool) {
        *self = Self::vacant();
        self.session = Session::new(lifecycle_log);
    }
}

/// One swapchain owned by a client.
#[derive(Debug)]
pub struct SwapchainEntry {
    pub state: SwapchainState,
    pub images: Vec<NativeImage>,
}

/// The parts of a client slot with their own locks.
pub struct ClientCell {
    pub slots: ClientSlots,
    pub events: EventQueue,
    pub sem: FrameSemaphore,
    pub waits: ActiveWaits,
    /// Only the owning worker touches this; the mutex satisfies sharing.
    pub swapchains: Mutex<Vec<Option<SwapchainEntry>>>,
}

impl ClientCell {
    fn new() -> Self {
        Self {
            slots: ClientSlots::new(),
            events: EventQueue::new(),
            sem: FrameSemaphore::new(),
            waits: ActiveWaits::new(),
            swapchains: Mutex::new((0..MAX_CLIENT_SWAPCHAINS).map(|_| None).collect()),
        }
    }
}

/// Everything the global-state lock guards.
pub struct GlobalState {
    pub clients: Vec<ClientControl>,
    /// The active primary, if any.
    pub active_client: Option<usize>,
    pub last_active_client: Option<usize>,
}

/// The service.
pub struct Server {
    pub options: ServiceOptions,
    pub devices: Box<dyn DeviceProvider>,
    pub table: DeviceTable,
    pub shm: Mutex<ShmRegion>,
    pub compositor: Mutex<Box<dyn NativeCompositor>>,
    pub global: Mutex<GlobalState>,
    pub cells: Vec<ClientCell>,
    pub gc: GcStack<Vec<NativeImage>>,
    running: AtomicBool,
    failed: AtomicBool,
}

impl Server {
    pub fn new(
        options: ServiceOptions,
        devices: Box<dyn DeviceProvider>,
        compositor: Box<dyn NativeCompositor>,
    ) -> Result<Arc<Self>> {
        let table = devices.table();
        let shm = ShmRegion::create(&table, monotonic_ns())?;

        let clients = (0..MAX_CLIENTS).map(|_| ClientControl::vacant()).collect();
        let cells = (0..MAX_CLIENTS).map(|_| ClientCell::new()).collect();

        info!(
            devices = table.devices.len(),
            inputs = table.inputs.len(),
            "server initialized"
        );

        Ok(Arc::new(Self {
            options,
            devices,
            table,
            shm: Mutex::new(shm),
            compositor: Mutex::new(compositor),
            global: Mutex::new(GlobalState {
                clients,
                active_client: None,
                last_active_client: None,
            }),
            cells,
            gc: GcStack::new(),
            running: AtomicBool::new(true),
            failed: AtomicBool::new(false),
        }))
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Record an unrecoverable runtime failure before stopping.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// True when the service stopped without a runtime failure.
    pub fn clean_shutdown(&self) -> bool {
        !self.failed.load(Ordering::SeqCst)
    }

    pub fn global(&self) -> MutexGuard<'_, GlobalState> {
        self.global.lock().unwrap()
    }

    /// Claim a free client slot for a new connection.
    pub fn claim_slot(&self, app_name: &str, pid: u32) -> Result<usize> {
        let mut global = self.global();
        let index = global
            .clients
            .iter()
            .position(|c| !c.occupied)
            .ok_or_else(|| Error::resource_exhausted("max client count reached"))?;

        let control = &mut global.clients[index];
        control.reset(self.options.lifecycle_log);
        control.occupied = true;
        control.app_name = app_name.to_string();
        control.pid = pid;

        // Fresh per-cell state for the new tenant.
        let cell = &self.cells[index];
        cell.events.clear();
        cell.sem.reset();
        cell.waits.reset();
        cell.slots.clear_all();
        cell.swapchains
            .lock()
            .unwrap()
            .iter_mut()
            .for_each(|entry| *entry = None);

        info!(index, app_name, pid, "client claimed slot");
        Ok(index)
    }

    /// Tear one client down after its worker returns: loss events, deferred
    /// swapchain destruction, slot release, state fan-out.
    pub fn teardown_client(&self, index: usize) {
        {
            let mut global = self.global();
            let control = &mut global.clients[index];
            if !control.occupied {
                return;
            }

            // A session that already reached EXITING went away cleanly;
            // everything else is a loss.
            if control.session_created && control.session.state() != SessionState::Exiting {
                let events = &self.cells[index].events;
                let now = monotonic_ns();
                // LOSS_PENDING leads so the client can wind down before the
                // forced exit.
                events.push_at(Event::LossPending { loss_time_ns: now }, now);
                control.session.on_loss(&|state| {
                    events.push(Event::SessionStateChanged { state });
                });
                events.push_at(Event::Exiting, now);
            }

            control.reset(self.options.lifecycle_log);
            self.update_server_state_locked(&mut global);
        }

        // Swapchains go to the render thread for deferred destruction.
        let mut swapchains = self.cells[index].swapchains.lock().unwrap();
        for entry in swapchains.iter_mut() {
            if let Some(entry) = entry.take() {
                self.gc.push(entry.images);
            }
        }
        drop(swapchains);

        self.cells[index].slots.clear_all();

        // Clear the shared-memory render slot mirror.
        if let Ok(mut shm) = self.shm.lock() {
            let empty = monxrt_proto::shm::RenderSlotRecord {
                display_time_ns: 0,
                env_blend_mode: monxrt_proto::BlendMode::Opaque,
                active: false,
                layers: Vec::new(),
            };
            if let Err(err) = shm.write_slot(index, &empty) {
                warn!(index, %err, "failed to clear render slot");
            }
        }

        info!(index, "client torn down");

        if self.options.exit_on_disconnect {
            self.stop();
        }
    }

    /// Recompute the active primary and fan visibility/focus out to every
    /// session. Callers that already hold the global lock use the `_locked`
    /// variant.
    pub fn update_server_state(&self) {
        let mut global = self.global();
        self.update_server_state_locked(&mut global);
    }

    pub fn update_server_state_locked(&self, global: &mut GlobalState) {
        // If the set active client is still presenting and unchanged, no
        // events need to go out.
        if let Some(active) = global.active_client {
            if global.clients[active].session_active
                && global.last_active_client == global.active_client
            {
                return;
            }
        }

        // Fall back to the first presenting non-overlay session.
        let fallback = global
            .clients
            .iter()
            .position(|c| c.occupied && !c.overlay && c.session_active);

        let current_valid = global.active_client.is_some_and(|i| {
            let c = &global.clients[i];
            c.occupied && !c.overlay && c.session_active
        });
        if !current_valid {
            global.active_client = fallback;
        }

        self.flush_state_locked(global);
        global.last_active_client = global.active_client;
    }

    /// Push the computed visibility/focus to every occupied slot.
    fn flush_state_locked(&self, global: &mut GlobalState) {
        let active = global.active_client;
        let prev = global.last_active_client;

        for index in 0..global.clients.len() {
            let control = &mut global.clients[index];
            if !control.occupied {
                continue;
            }

            // Exactly one client has focus; active overlays are visible
            // but never focused.
            let (visible, focused) = if active == Some(index) {
                (true, true)
            } else if control.overlay && control.session_active {
                (true, false)
            } else {
                (false, false)
            };

            control.visible = visible;
            control.focused = focused;

            let events = &self.cells[index].events;
            control.session.apply_visibility(visible, focused, &|state| {
                events.push(Event::SessionStateChanged { state });
            });

            // Tell overlays about primary-application comings and goings.
            if control.overlay && control.session_active {
                match (active.is_some(), prev.is_some()) {
                    (true, true) if active != prev => {
                        events.push(Event::OverlayVisibilityChanged { visible: false });
                        events.push(Event::OverlayVisibilityChanged { visible: true });
                    }
                    (true, false) => {
                        events.push(Event::OverlayVisibilityChanged { visible: true });
                    }
                    (false, true) => {
                        events.push(Event::OverlayVisibilityChanged { visible: false });
                    }
                    _ => {}
                }
            }
        }
    }

    /// A session started presenting (first `wait_frame`). New overlay
    /// sessions only need their own state refreshed; new regular sessions
    /// can change the active primary and fan out to everyone.
    pub fn activate_session_locked(&self, global: &mut GlobalState, index: usize) {
        if global.clients[index].session_active {
            return;
        }
        global.clients[index].session_active = true;

        if global.clients[index].overlay {
            self.flush_one_locked(global, index);
        } else {
            self.update_server_state_locked(global);
        }
    }

    /// Refresh visibility/focus for a single slot without touching the
    /// active-primary selection.
    fn flush_one_locked(&self, global: &mut GlobalState, index: usize) {
        let active = global.active_client;
        let control = &mut global.clients[index];

        let (visible, focused) = if active == Some(index) {
            (true, true)
        } else if control.overlay && control.session_active {
            (true, false)
        } else {
            (false, false)
        };
        control.visible = visible;
        control.focused = focused;

        let events = &self.cells[index].events;
        control.session.apply_visibility(visible, focused, &|state| {
            events.push(Event::SessionStateChanged { state });
        });

        // A freshly active overlay learns whether a primary is up.
        if control.overlay && control.session_active && active.is_some() {
            events.push(Event::OverlayVisibilityChanged { visible: true });
        }
    }

    /// Explicitly select the active primary.
    pub fn set_primary_client(&self, index: usize) -> Result<()> {
        let mut global = self.global();
        let control = global
            .clients
            .get(index)
            .ok_or_else(|| Error::validation(format!("no client slot {index}")))?;
        if !control.occupied {
            return Err(Error::validation(format!("client slot {index} is empty")));
        }
        if control.overlay {
            return Err(Error::validation("an overlay cannot be the primary"));
        }
        global.active_client = Some(index);
        self.update_server_state_locked(&mut global);
        Ok(())
    }

    /// Z-order snapshot for this tick: the active primary plus every
    /// presenting overlay.
    pub fn render_snapshot(&self) -> (Option<usize>, Vec<ClientZ>) {
        let global = self.global();
        let primary = global.active_client;
        let overlays = global
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.occupied && c.overlay && c.session_active)
            .map(|(index, c)| ClientZ {
                index,
                z_order: c.z_order,
                overlay: true,
            })
            .collect();
        (primary, overlays)
    }

    /// Force every session into loss; used when the render loop gives up.
    pub fn escalate_loss_all(&self) {
        let mut global = self.global();
        for index in 0..global.clients.len() {
            let control = &mut global.clients[index];
            if !control.occupied || !control.session_created {
                continue;
            }
            let events = &self.cells[index].events;
            let now = monotonic_ns();
            control.session.on_loss(&|state| {
                events.push(Event::SessionStateChanged { state });
            });
            events.push_at(Event::LossPending { loss_time_ns: now }, now);
            control.session_active = false;
        }
        self.update_server_state_locked(&mut global);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StubDevices;
    use monxrt_compositor::HeadlessCompositor;
    use monxrt_proto::SessionState;
    use monxrt_timing::FakeTiming;

    fn test_server() -> Arc<Server> {
        let options = ServiceOptions::default();
        let devices = Box::new(StubDevices::new(&options));
        let pacer = Box::new(FakeTiming::new(devices.frame_interval_ns(), 0));
        let compositor = Box::new(HeadlessCompositor::free_run(pacer));
        Server::new(options, devices, compositor).unwrap()
    }

    /// Claim a slot and put its session into the presenting state, the way
    /// the wait-frame path does.
    fn presenting_client(server: &Server, name: &str, overlay: bool, z_order: i32) -> usize {
        let index = server.claim_slot(name, 1).unwrap();
        let mut global = server.global();
        let control = &mut global.clients[index];
        control.session_created = true;
        control.overlay = overlay;
        control.z_order = z_order;
        control.session.on_create(&|_: SessionState| {});
        control.session.on_begin_session().unwrap();
        control.session.on_first_begin_frame(&|_: SessionState| {});
        server.activate_session_locked(&mut global, index);
        index
    }

    #[test]
    fn slots_are_reused_after_teardown() {
        let server = test_server();
        let a = server.claim_slot("a", 1).unwrap();
        let b = server.claim_slot("b", 2).unwrap();
        assert_ne!(a, b);
        server.teardown_client(a);
        let c = server.claim_slot("c", 3).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn first_primary_becomes_focused() {
        let server = test_server();
        let index = presenting_client(&server, "app", false, 0);

        let global = server.global();
        assert_eq!(global.active_client, Some(index));
        assert!(global.clients[index].visible);
        assert!(global.clients[index].focused);
        assert_eq!(global.clients[index].session.state(), SessionState::Focused);
    }

    #[test]
    fn overlays_are_visible_but_not_focused() {
        let server = test_server();
        let primary = presenting_client(&server, "primary", false, 0);
        let overlay = presenting_client(&server, "overlay", true, 10);

        let global = server.global();
        assert_eq!(global.active_client, Some(primary));
        assert!(global.clients[overlay].visible);
        assert!(!global.clients[overlay].focused);
        assert_eq!(
            global.clients[overlay].session.state(),
            SessionState::Visible
        );
    }

    #[test]
    fn overlay_gets_one_visibility_event_when_primary_appears() {
        let server = test_server();
        let overlay = presenting_client(&server, "overlay", true, 10);
        // Drain events generated so far.
        while server.cells[overlay].events.poll().is_some() {}

        presenting_client(&server, "primary", false, 0);

        let mut overlay_events = Vec::new();
        while let Some((_, event)) = server.cells[overlay].events.poll() {
            if let Event::OverlayVisibilityChanged { visible } = event {
                overlay_events.push(visible);
            }
        }
        assert_eq!(overlay_events, vec![true]);
    }

    #[test]
    fn fallback_promotes_next_primary_on_teardown() {
        let server = test_server();
        let first = presenting_client(&server, "first", false, 0);
        let second = presenting_client(&server, "second", false, 0);
        assert_eq!(server.global().active_client, Some(first));

        server.teardown_client(first);
        let global = server.global();
        assert_eq!(global.active_client, Some(second));
        assert!(global.clients[second].focused);
    }

    #[test]
    fn teardown_emits_loss_then_exiting() {
        let server = test_server();
        let index = presenting_client(&server, "app", false, 0);
        server.teardown_client(index);

        let mut kinds = Vec::new();
        while let Some((_, event)) = server.cells[index].events.poll() {
            kinds.push(event);
        }
        let loss_at = kinds
            .iter()
            .position(|e| matches!(e, Event::LossPending { .. }))
            .expect("loss pending");
        let exiting_at = kinds
            .iter()
            .position(|e| matches!(e, Event::Exiting))
            .expect("exiting");
        assert!(loss_at < exiting_at);
        // Nothing after EXITING.
        assert_eq!(exiting_at, kinds.len() - 1);
    }

    #[test]
    fn set_primary_rejects_overlays_and_empty_slots() {
        let server = test_server();
        let overlay = presenting_client(&server, "overlay", true, 1);
        assert!(server.set_primary_client(overlay).is_err());
        assert!(server.set_primary_client(63).is_err());
        assert!(server.set_primary_client(9999).is_err());
    }

    #[test]
    fn render_snapshot_lists_presenting_overlays() {
        let server = test_server();
        let primary = presenting_client(&server, "primary", false, 0);
        let o1 = presenting_client(&server, "o1", true, 10);
        let o2 = presenting_client(&server, "o2", true, 20);

        let (snapshot_primary, overlays) = server.render_snapshot();
        assert_eq!(snapshot_primary, Some(primary));
        let order = monxrt_compositor::z_sorted_order(snapshot_primary, &overlays);
        assert_eq!(order, vec![primary, o1, o2]);
    }
}
