//! End-to-end scenarios over the real control socket.
//!
//! Each test starts a full service (stub devices, headless compositor in
//! free-run) on its own socket, connects real clients, and drives the wire
//! protocol.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use monxrt_common::debug::ServiceOptions;
use monxrt_compositor::HeadlessCompositor;
use monxrt_service::device::DeviceProvider;
use monxrt_proto::messages::{
    BeginFrame, BeginSession, EndFrame, InstanceCreate, InstanceCreateReply, SessionCreate,
    SessionCreateReply, GraphicsBinding, SwapchainAcquire, SwapchainAcquireReply, SwapchainCreate,
    SwapchainCreateReply, SwapchainDestroy, SwapchainRelease, SwapchainWait, SystemProperties,
    WaitFrameReply,
};
use monxrt_proto::shm::DeviceTable;
use monxrt_proto::wire::{Datagram, DatagramKind, Opcode};
use monxrt_proto::{BlendMode, Event, LayerStack, SessionState, Status};
use monxrt_service::device::StubDevices;
use monxrt_service::render_loop;
use monxrt_service::server::Server;
use monxrt_service::socket::ClientConn;
use monxrt_service::socket::ControlListener;
use monxrt_timing::FakeTiming;

/// 1 ms ticks keep the free-running loop quick under test.
const TEST_PERIOD_NS: u64 = 1_000_000;

struct TestService {
    server: Arc<Server>,
    path: PathBuf,
    handle: Option<JoinHandle<()>>,
}

impl TestService {
    fn start(name: &str) -> Self {
        let options = ServiceOptions::default();
        let devices = Box::new(StubDevices::new(&options));
        let pacer = Box::new(FakeTiming::new(TEST_PERIOD_NS, 0));
        let compositor = Box::new(HeadlessCompositor::free_run(pacer));
        let server = Server::new(options, devices, compositor).unwrap();

        let path = std::env::temp_dir().join(format!(
            "monxrt-e2e-{}-{}.sock",
            std::process::id(),
            name
        ));
        let listener = ControlListener::bind(&path).unwrap();

        let loop_server = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            let _ = render_loop::run(loop_server, listener);
        });

        Self {
            server,
            path,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TestClient {
        TestClient {
            conn: ClientConn::connect(&self.path).unwrap(),
            sequence: 0,
        }
    }

    /// Wait until `predicate` holds on the server or the deadline passes.
    fn wait_for(&self, what: &str, predicate: impl Fn(&Server) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if predicate(&self.server) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for {what}");
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.server.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct TestClient {
    conn: ClientConn,
    sequence: u32,
}

impl TestClient {
    fn request(&mut self, opcode: Opcode, payload: Bytes) -> (Status, Bytes, Vec<OwnedFd>) {
        let request = Datagram::request(self.sequence, opcode, payload);
        self.conn.send(&request, &[]).unwrap();

        let (reply, handles) = self.conn.recv().unwrap();
        assert_eq!(reply.kind().unwrap(), DatagramKind::Reply(opcode));
        assert_eq!(reply.sequence, self.sequence);
        self.sequence += 1;

        let (status, rest) = reply.reply_parts().unwrap();
        (status, rest, handles)
    }

    fn request_ok(&mut self, opcode: Opcode, payload: Bytes) -> (Bytes, Vec<OwnedFd>) {
        let (status, rest, handles) = self.request(opcode, payload);
        assert_eq!(status, Status::Ok, "{opcode:?} failed");
        (rest, handles)
    }

    fn create_instance(&mut self, app_name: &str) -> (InstanceCreateReply, OwnedFd) {
        let (mut rest, mut handles) = self.request_ok(
            Opcode::InstanceCreate,
            InstanceCreate {
                app_name: app_name.to_string(),
                pid: std::process::id(),
            }
            .encode(),
        );
        let reply = InstanceCreateReply::decode(&mut rest).unwrap();
        assert_eq!(handles.len(), 1, "expected the shm handle");
        (reply, handles.remove(0))
    }

    fn create_session(&mut self, overlay: bool, z_order: i32) -> u32 {
        let (mut rest, _) = self.request_ok(
            Opcode::SessionCreate,
            SessionCreate {
                binding: GraphicsBinding::Headless,
                binding_args: Vec::new(),
                overlay,
                z_order,
            }
            .encode(),
        );
        SessionCreateReply::decode(&mut rest).unwrap().session_id
    }

    fn begin_session(&mut self) {
        self.request_ok(
            Opcode::BeginSession,
            BeginSession {
                primary_view_config: 2,
            }
            .encode(),
        );
    }

    /// Full bring-up: instance, session, begin_session.
    fn setup(&mut self, app_name: &str, overlay: bool, z_order: i32) {
        self.create_instance(app_name);
        self.create_session(overlay, z_order);
        self.begin_session();
    }

    fn wait_frame(&mut self) -> WaitFrameReply {
        let (mut rest, _) = self.request_ok(Opcode::WaitFrame, Bytes::new());
        WaitFrameReply::decode(&mut rest).unwrap()
    }

    fn begin_frame(&mut self, frame_id: i64) -> Status {
        let (status, _, _) = self.request(Opcode::BeginFrame, BeginFrame { frame_id }.encode());
        status
    }

    fn end_frame(&mut self, frame_id: i64, display_time_ns: u64) {
        self.request_ok(
            Opcode::EndFrame,
            EndFrame {
                frame_id,
                stack: LayerStack {
                    display_time_ns,
                    env_blend_mode: BlendMode::Opaque,
                    layers: Vec::new(),
                },
            }
            .encode(),
        );
    }

    /// One whole wait → begin → end frame. Returns the prediction.
    fn frame(&mut self) -> WaitFrameReply {
        let prediction = self.wait_frame();
        assert_eq!(self.begin_frame(prediction.frame_id), Status::Ok);
        self.end_frame(prediction.frame_id, prediction.predicted_display_ns);
        prediction
    }

    fn poll_event(&mut self) -> Option<Event> {
        let (mut rest, _) = self.request_ok(Opcode::PollEvent, Bytes::new());
        use bytes::Buf;
        if rest.get_u32_le() == 0 {
            return None;
        }
        let (_, event) = Event::decode_body(&mut rest).unwrap();
        Some(event)
    }

    fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.poll_event() {
            events.push(event);
        }
        events
    }

    /// Poll until the given session state shows up.
    fn wait_for_state(&mut self, wanted: SessionState) -> Vec<Event> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Some(event) = self.poll_event() {
                seen.push(event);
                if matches!(event, Event::SessionStateChanged { state } if state == wanted) {
                    return seen;
                }
            } else {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        panic!("never saw state {wanted:?}; events: {seen:?}");
    }
}

#[test]
fn solo_session_reaches_focused() {
    let service = TestService::start("solo");
    let mut client = service.connect();
    client.setup("solo-app", false, 0);

    // Steady frames; predicted display must be strictly non-decreasing.
    let mut last_display = 0;
    for _ in 0..20 {
        let prediction = client.frame();
        assert!(prediction.predicted_display_ns >= last_display);
        assert_eq!(prediction.predicted_display_period_ns, TEST_PERIOD_NS);
        last_display = prediction.predicted_display_ns;
    }

    let seen = client.wait_for_state(SessionState::Focused);
    // The lifecycle ran Ready → Synchronized → Visible → Focused with no
    // detours.
    let states: Vec<SessionState> = seen
        .iter()
        .filter_map(|e| match e {
            Event::SessionStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Ready,
            SessionState::Synchronized,
            SessionState::Visible,
            SessionState::Focused,
        ]
    );
}

#[test]
fn shared_memory_parses_client_side() {
    let service = TestService::start("shm");
    let mut client = service.connect();
    let (reply, shm_fd) = client.create_instance("shm-reader");

    // Map by reading the whole region through the received fd.
    let file = std::fs::File::from(shm_fd);
    use std::os::unix::fs::FileExt;
    let mut region = vec![0u8; reply.shm_size as usize];
    file.read_exact_at(&mut region, 0).unwrap();

    let (header, table) = DeviceTable::read_region(&region).unwrap();
    assert_eq!(header.layout.offset_idevs, reply.device_table_offset);

    // The table a restarted service would serve is identical.
    let expected = StubDevices::new(&ServiceOptions::default()).table();
    assert_eq!(table, expected);
}

#[test]
fn system_properties_match_the_stub_hmd() {
    let service = TestService::start("props");
    let mut client = service.connect();
    client.create_instance("props");

    let (mut rest, _) = client.request_ok(Opcode::SystemGetProperties, Bytes::new());
    let props = SystemProperties::decode(&mut rest).unwrap();
    assert_eq!(props.view_count, 2);
    assert_eq!(props.view_resolution, [1440, 1600]);
    assert!((props.refresh_hz - 90.0).abs() < 0.5);
}

#[test]
fn double_wait_before_any_begin_is_call_order() {
    let service = TestService::start("double-wait");
    let mut client = service.connect();
    client.setup("eager", false, 0);

    client.wait_frame();
    let (status, _, _) = client.request(Opcode::WaitFrame, Bytes::new());
    assert_eq!(status, Status::CallOrder);
}

#[test]
fn begin_without_wait_is_call_order() {
    let service = TestService::start("no-wait");
    let mut client = service.connect();
    client.setup("rushed", false, 0);

    assert_eq!(client.begin_frame(1), Status::CallOrder);
}

#[test]
fn second_begin_discards_the_first_frame() {
    let service = TestService::start("discard");
    let mut client = service.connect();
    client.setup("discarder", false, 0);

    let first = client.wait_frame();
    assert_eq!(client.begin_frame(first.frame_id), Status::Ok);

    // Pipeline a second wait, then begin it without ending the first.
    let second = client.wait_frame();
    assert_eq!(client.begin_frame(second.frame_id), Status::FrameDiscarded);

    client.end_frame(second.frame_id, second.predicted_display_ns);
}

#[test]
fn overlays_and_primary_fan_out_visibility() {
    let service = TestService::start("overlays");

    let mut overlay_a = service.connect();
    overlay_a.setup("overlay-a", true, 10);
    overlay_a.frame();

    let mut overlay_b = service.connect();
    overlay_b.setup("overlay-b", true, 20);
    overlay_b.frame();

    let mut primary = service.connect();
    primary.setup("primary", false, 0);
    primary.frame();

    // Primary reaches FOCUSED; overlays reach VISIBLE and stay there.
    primary.wait_for_state(SessionState::Focused);
    let a_events = overlay_a.wait_for_state(SessionState::Visible);
    let b_events = overlay_b.wait_for_state(SessionState::Visible);

    // Each overlay hears about the primary exactly once.
    let count_visible = |events: &[Event]| {
        events
            .iter()
            .filter(|e| matches!(e, Event::OverlayVisibilityChanged { visible: true }))
            .count()
    };
    let mut a_all = a_events;
    a_all.extend(overlay_a.drain_events());
    let mut b_all = b_events;
    b_all.extend(overlay_b.drain_events());
    assert_eq!(count_visible(&a_all), 1);
    assert_eq!(count_visible(&b_all), 1);

    // No overlay ever focuses.
    assert!(!a_all
        .iter()
        .any(|e| matches!(e, Event::SessionStateChanged { state: SessionState::Focused })));

    // The render order is primary first, then overlays by z.
    let (snapshot_primary, overlays) = service.server.render_snapshot();
    let order = monxrt_compositor::z_sorted_order(snapshot_primary, &overlays);
    assert_eq!(order.len(), 3);
    assert_eq!(snapshot_primary, Some(order[0]));
}

#[test]
fn client_drop_mid_session_keeps_service_alive() {
    let service = TestService::start("drop");

    let mut doomed = service.connect();
    doomed.setup("doomed", false, 0);
    doomed.frame();

    // Kill the connection while the session is live.
    drop(doomed);
    service.wait_for("slot release", |server| {
        server.global().clients.iter().all(|c| !c.occupied)
    });

    // The service keeps serving new clients.
    let mut survivor = service.connect();
    survivor.setup("survivor", false, 0);
    let prediction = survivor.frame();
    assert!(prediction.predicted_display_ns > 0);
}

#[test]
fn swapchain_lifecycle_over_the_wire() {
    let service = TestService::start("swapchain");
    let mut client = service.connect();
    client.setup("images", false, 0);

    let (mut rest, handles) = client.request_ok(
        Opcode::SwapchainCreate,
        SwapchainCreate {
            width: 64,
            height: 64,
            format: 0,
            image_count: 3,
            mip_count: 1,
            array_size: 1,
            sample_count: 1,
            usage_flags: 0,
        }
        .encode(),
    );
    let created = SwapchainCreateReply::decode(&mut rest).unwrap();
    assert_eq!(created.image_count, 3);
    assert_eq!(handles.len(), 3);
    assert_eq!(created.image_size, 64 * 64 * 4);

    // FIFO order: 0, 1, 2, 0, 1, 2.
    let mut seen = Vec::new();
    for _ in 0..6 {
        let (mut rest, _) = client.request_ok(
            Opcode::SwapchainAcquire,
            SwapchainAcquire {
                swapchain_id: created.swapchain_id,
            }
            .encode(),
        );
        let acquired = SwapchainAcquireReply::decode(&mut rest).unwrap();
        client.request_ok(
            Opcode::SwapchainWait,
            SwapchainWait {
                swapchain_id: created.swapchain_id,
                image_index: acquired.image_index,
                timeout_ns: 1_000_000_000,
            }
            .encode(),
        );
        client.request_ok(
            Opcode::SwapchainRelease,
            SwapchainRelease {
                swapchain_id: created.swapchain_id,
                image_index: acquired.image_index,
            }
            .encode(),
        );
        seen.push(acquired.image_index);
    }
    assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);

    // Destroy defers to the render thread's GC point.
    client.request_ok(
        Opcode::SwapchainDestroy,
        SwapchainDestroy {
            swapchain_id: created.swapchain_id,
        }
        .encode(),
    );
    service.wait_for("gc drain", |server| server.gc.is_empty());

    // The id is gone afterwards.
    let (status, _, _) = client.request(
        Opcode::SwapchainAcquire,
        SwapchainAcquire {
            swapchain_id: created.swapchain_id,
        }
        .encode(),
    );
    assert_eq!(status, Status::InvalidArg);
}

#[test]
fn bad_display_time_discards_frame_but_keeps_session() {
    let service = TestService::start("bad-time");
    let mut client = service.connect();
    client.setup("sloppy", false, 0);

    let prediction = client.wait_frame();
    assert_eq!(client.begin_frame(prediction.frame_id), Status::Ok);

    let (status, _, _) = client.request(
        Opcode::EndFrame,
        EndFrame {
            frame_id: prediction.frame_id,
            stack: LayerStack {
                display_time_ns: 0,
                env_blend_mode: BlendMode::Opaque,
                layers: Vec::new(),
            },
        }
        .encode(),
    );
    assert_eq!(status, Status::Runtime);

    // The frame was discarded; the session keeps going.
    let next = client.frame();
    assert!(next.predicted_display_ns >= prediction.predicted_display_ns);
}

#[test]
fn haptic_stop_round_trips_as_event() {
    use monxrt_proto::messages::{DeviceGetPose, DeviceGetPoseReply, DeviceSetOutput};
    use monxrt_proto::HapticValue;

    let service = TestService::start("haptics");
    let mut client = service.connect();
    client.setup("rumbler", false, 0);
    client.drain_events();

    // Pose query against the left controller.
    let (mut rest, _) = client.request_ok(
        Opcode::DeviceGetPose,
        DeviceGetPose {
            device_id: 1,
            input_name: monxrt_service::device::INPUT_GRIP_POSE,
            at_time_ns: 1_000,
        }
        .encode(),
    );
    let pose = DeviceGetPoseReply::decode(&mut rest).unwrap();
    assert_eq!(pose.timestamp_ns, 1_000);

    // A buzz makes no event; a stop does.
    client.request_ok(
        Opcode::DeviceSetOutput,
        DeviceSetOutput {
            device_id: 1,
            output_name: monxrt_service::device::OUTPUT_HAPTIC,
            value: HapticValue {
                frequency_hz: 160.0,
                amplitude: 0.5,
                duration_ns: 10_000_000,
            },
        }
        .encode(),
    );
    client.request_ok(
        Opcode::DeviceSetOutput,
        DeviceSetOutput {
            device_id: 1,
            output_name: monxrt_service::device::OUTPUT_HAPTIC,
            value: HapticValue {
                frequency_hz: 0.0,
                amplitude: 0.0,
                duration_ns: 0,
            },
        }
        .encode(),
    );

    let events = client.drain_events();
    let stops: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::HapticStop { device_id: 1, .. }))
        .collect();
    assert_eq!(stops.len(), 1);
}

#[test]
fn request_exit_then_end_session_exits() {
    let service = TestService::start("exit");
    let mut client = service.connect();
    client.setup("leaver", false, 0);
    client.frame();
    client.wait_for_state(SessionState::Focused);

    client.request_ok(Opcode::RequestExit, Bytes::new());
    client.wait_for_state(SessionState::Stopping);

    client.request_ok(Opcode::EndSession, Bytes::new());
    let seen = client.wait_for_state(SessionState::Exiting);
    let states: Vec<SessionState> = seen
        .iter()
        .filter_map(|e| match e {
            Event::SessionStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![SessionState::Idle, SessionState::Exiting]);
}
