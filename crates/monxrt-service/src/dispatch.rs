//! Request decoding and handling.
//!
//! Each request gets exactly one reply. Recoverable failures (validation,
//! call order, exhaustion, timeouts) are reported to the caller and the
//! worker keeps serving; IPC and runtime failures propagate out of
//! [`handle_request`] and tear the session down.

use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use monxrt_common::time::monotonic_ns;
use monxrt_common::{Error, Result};
use monxrt_proto::messages::{
    BeginFrame, BeginSession, ClientId, ClientInfo, ClientList, DeviceGetPose, DeviceGetPoseReply,
    DeviceSetOutput, DeviceUpdateInput, EndFrame, InstanceCreate, InstanceCreateReply,
    SessionCreate, SessionCreateReply, SwapchainAcquire, SwapchainAcquireReply, SwapchainCreate,
    SwapchainCreateReply, SwapchainDestroy, SwapchainRelease, SwapchainWait, SystemProperties,
    WaitFrameReply,
};
use monxrt_proto::shm::RenderSlotRecord;
use monxrt_proto::wire::{Datagram, DatagramKind, Opcode};
use monxrt_proto::{Event, LayerStack, SessionState, Status, MAX_SWAPCHAIN_IMAGES};
use monxrt_timing::TimingError;
use tracing::{debug, warn};

use crate::server::{Server, SwapchainEntry};
use crate::socket::ClientConn;
use monxrt_compositor::{SwapchainError, SwapchainState};

/// Default image count when the client leaves it to the service.
const DEFAULT_IMAGE_COUNT: u32 = 3;

/// A handler's answer: status word, payload, out-of-band handles.
struct Reply {
    status: Status,
    payload: Bytes,
    handles: Vec<OwnedFd>,
}

impl Reply {
    fn ok(payload: Bytes) -> Result<Self> {
        Ok(Self {
            status: Status::Ok,
            payload,
            handles: Vec::new(),
        })
    }

    fn empty() -> Result<Self> {
        Self::ok(Bytes::new())
    }

    fn with_status(status: Status) -> Result<Self> {
        Ok(Self {
            status,
            payload: Bytes::new(),
            handles: Vec::new(),
        })
    }

    fn with_handles(payload: Bytes, handles: Vec<OwnedFd>) -> Result<Self> {
        Ok(Self {
            status: Status::Ok,
            payload,
            handles,
        })
    }

    /// A failing reply that does not end the session, shaped like
    /// [`Datagram::error_reply`]'s payload.
    fn failure(status: Status, diagnostic: &str) -> Result<Self> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(diagnostic.len() as u32);
        buf.put_slice(diagnostic.as_bytes());
        Ok(Self {
            status,
            payload: buf.freeze(),
            handles: Vec::new(),
        })
    }
}

fn status_of(err: &Error) -> Status {
    match err {
        Error::Validation(_) => Status::InvalidArg,
        Error::CallOrder(_) => Status::CallOrder,
        Error::ResourceExhausted(_) => Status::ResourceExhausted,
        Error::Timeout(_) => Status::TimeoutExpired,
        Error::Io(_) | Error::IpcFailure(_) => Status::IpcFailure,
        Error::Runtime(_) => Status::Runtime,
        Error::DeviceLost(_) => Status::DeviceLost,
    }
}

fn timing_error(err: TimingError) -> Error {
    match err {
        TimingError::NoSample => Error::runtime("no render-loop timing sample"),
        other => Error::call_order(other),
    }
}

fn swapchain_error(err: SwapchainError) -> Error {
    match err {
        SwapchainError::BadIndex(_) => Error::validation(err),
        _ => Error::call_order(err),
    }
}

/// Handle one datagram from a client, sending exactly one reply. Returns
/// `Err` only for failures that are fatal to the session.
pub fn handle_request(
    server: &Server,
    index: usize,
    conn: &ClientConn,
    dgram: Datagram,
) -> Result<()> {
    let opcode = match dgram.kind() {
        Ok(DatagramKind::Request(opcode)) => opcode,
        Ok(other) => {
            warn!(?other, "non-request datagram from client, dropping");
            return Ok(());
        }
        Err(err) => {
            // Unknown opcode: we cannot name the request in the reply, so
            // this is a protocol breach and fatal.
            return Err(Error::ipc(format!("unknown opcode: {err}")));
        }
    };

    let mut payload = dgram.payload.clone();
    let result = match opcode {
        Opcode::InstanceCreate => instance_create(server, index, &mut payload),
        Opcode::SystemGetProperties => system_get_properties(server),
        Opcode::SessionCreate => session_create(server, index, &mut payload),
        Opcode::SwapchainCreate => swapchain_create(server, index, &mut payload),
        Opcode::SwapchainAcquire => swapchain_acquire(server, index, &mut payload),
        Opcode::SwapchainWait => swapchain_wait(server, index, &mut payload),
        Opcode::SwapchainRelease => swapchain_release(server, index, &mut payload),
        Opcode::SwapchainDestroy => swapchain_destroy(server, index, &mut payload),
        Opcode::BeginSession => begin_session(server, index, &mut payload),
        Opcode::EndSession => end_session(server, index),
        Opcode::RequestExit => request_exit(server, index),
        Opcode::WaitFrame => wait_frame(server, index),
        Opcode::BeginFrame => begin_frame(server, index, &mut payload),
        Opcode::EndFrame => end_frame(server, index, &mut payload),
        Opcode::PollEvent => poll_event(server, index),
        Opcode::DeviceUpdateInput => device_update_input(server, &mut payload),
        Opcode::DeviceGetPose => device_get_pose(server, &mut payload),
        Opcode::DeviceSetOutput => device_set_output(server, index, &mut payload),
        Opcode::SystemGetClients => system_get_clients(server),
        Opcode::SystemGetClientInfo => system_get_client_info(server, &mut payload),
        Opcode::SystemSetPrimaryClient => system_set_primary_client(server, &mut payload),
    };

    match result {
        Ok(reply) => {
            let mut dgram = Datagram::reply(dgram.sequence, opcode, reply.status, reply.payload);
            if !reply.handles.is_empty() {
                dgram = dgram.with_handles();
            }
            let borrowed: Vec<_> = reply.handles.iter().map(|fd| fd.as_fd()).collect();
            conn.send(&dgram, &borrowed)
        }
        Err(err) => {
            let status = status_of(&err);
            debug!(?opcode, %err, "request failed");
            let reply = Datagram::error_reply(dgram.sequence, opcode, status, &err.to_string());
            // Best effort: if the reply cannot be sent the transport is
            // gone anyway.
            let sent = conn.send(&reply, &[]);
            if err.is_fatal_to_session() {
                return Err(err);
            }
            sent
        }
    }
}

fn decode<T>(
    what: &'static str,
    result: std::result::Result<T, monxrt_proto::ProtoError>,
) -> Result<T> {
    result.map_err(|e| Error::validation(format!("{what}: {e}")))
}

fn instance_create(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("instance_create", InstanceCreate::decode(payload))?;

    {
        let mut global = server.global();
        let control = &mut global.clients[index];
        if control.instance_created {
            return Err(Error::call_order("instance already created"));
        }
        control.instance_created = true;
        control.app_name = req.app_name;
        control.pid = req.pid;
    }

    let shm = server.shm.lock().unwrap();
    let layout = shm.layout();
    let handle = shm
        .fd()
        .try_clone_to_owned()
        .map_err(|e| Error::runtime(format!("dup shm fd: {e}")))?;
    drop(shm);

    let reply = InstanceCreateReply {
        instance_id: index as u32,
        shm_size: layout.total_size,
        device_table_offset: layout.offset_idevs,
    };
    Reply::with_handles(reply.encode(), vec![handle])
}

fn system_get_properties(server: &Server) -> Result<Reply> {
    let hmd = server
        .table
        .devices
        .iter()
        .find_map(|d| d.hmd.as_ref().map(|hmd| (d, hmd)))
        .ok_or_else(|| Error::device_lost("no HMD in the device table"))?;
    let (device, block) = hmd;

    let refresh_hz = if block.frame_interval_ns > 0 {
        1e9 / block.frame_interval_ns as f32
    } else {
        0.0
    };

    let reply = SystemProperties {
        hmd_name: device.name.clone(),
        view_count: 2,
        view_resolution: [block.viewports[0][2], block.viewports[0][3]],
        refresh_hz,
        fovs: block.fovs,
    };
    Reply::ok(reply.encode())
}

fn session_create(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("session_create", SessionCreate::decode(payload))?;

    let mut global = server.global();
    let control = &mut global.clients[index];
    if !control.instance_created {
        return Err(Error::call_order("session_create before instance_create"));
    }
    if control.session_created {
        return Err(Error::call_order("session already created"));
    }

    control.session_created = true;
    control.overlay = req.overlay;
    control.z_order = if req.overlay { req.z_order } else { 0 };
    control.session_active = false;

    let events = &server.cells[index].events;
    control.session.on_create(&|state: SessionState| {
        events.push(Event::SessionStateChanged { state });
    });

    server.update_server_state_locked(&mut global);

    Reply::ok(SessionCreateReply {
        session_id: index as u32,
    }
    .encode())
}

fn begin_session(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("begin_session", BeginSession::decode(payload))?;
    if req.primary_view_config != 2 {
        return Err(Error::validation(format!(
            "unsupported view configuration {} (stereo only)",
            req.primary_view_config
        )));
    }

    {
        let mut global = server.global();
        let control = &mut global.clients[index];
        if !control.session_created {
            return Err(Error::call_order("begin_session before session_create"));
        }
        control.session.on_begin_session()?;
    }

    server
        .compositor
        .lock()
        .unwrap()
        .begin_session()
        .map_err(|e| Error::runtime(e.to_string()))?;

    Reply::empty()
}

fn end_session(server: &Server, index: usize) -> Result<Reply> {
    {
        let mut global = server.global();
        let control = &mut global.clients[index];
        let events = &server.cells[index].events;

        let in_flight = control.session.on_end_session(&|state: SessionState| {
            events.push(Event::SessionStateChanged { state });
        })?;

        let now = monotonic_ns();
        if in_flight.waited >= 0 {
            let _ = control.helper.mark_discarded(in_flight.waited, now);
        }
        if in_flight.begun >= 0 {
            let _ = control.helper.mark_discarded(in_flight.begun, now);
        }

        control.session_active = false;
        control.visible = false;
        control.focused = false;
        server.update_server_state_locked(&mut global);
    }

    server
        .compositor
        .lock()
        .unwrap()
        .end_session()
        .map_err(|e| Error::runtime(e.to_string()))?;

    let cell = &server.cells[index];
    cell.slots.clear_all();
    cell.sem.reset();
    cell.waits.reset();

    Reply::empty()
}

fn request_exit(server: &Server, index: usize) -> Result<Reply> {
    let mut global = server.global();
    let control = &mut global.clients[index];
    let events = &server.cells[index].events;
    control.session.on_request_exit(&|state: SessionState| {
        events.push(Event::SessionStateChanged { state });
    })?;
    Reply::empty()
}

fn wait_frame(server: &Server, index: usize) -> Result<Reply> {
    let cell = &server.cells[index];

    {
        let global = server.global();
        if !global.clients[index].session.is_running() {
            return Err(Error::call_order("wait_frame on a session that is not running"));
        }
    }

    // Serialize against the previous begin_frame.
    cell.sem.wait()?;
    if let Err(err) = cell.waits.increment() {
        cell.sem.refund();
        return Err(err);
    }

    // Predict off the shared render-loop sample; before the first tick
    // lands there is nothing to predict from, so poll.
    let prediction = loop {
        {
            let mut global = server.global();
            let control = &mut global.clients[index];
            match control.helper.predict(monotonic_ns()) {
                Ok(prediction) => {
                    control.session.frame_ids.waited = prediction.frame_id;
                    server.activate_session_locked(&mut global, index);
                    break prediction;
                }
                Err(TimingError::NoSample) => {}
                Err(err) => {
                    cell.waits.decrement();
                    cell.sem.refund();
                    return Err(timing_error(err));
                }
            }
        }

        if !server.running() {
            cell.waits.decrement();
            cell.sem.refund();
            return Err(Error::ipc("service shutting down"));
        }
        std::thread::sleep(Duration::from_millis(1));
    };

    if (prediction.predicted_display_time_ns as i64) <= 0 {
        cell.waits.decrement();
        cell.sem.refund();
        return Err(Error::runtime(format!(
            "non-positive predicted display time {}",
            prediction.predicted_display_time_ns as i64
        )));
    }

    let extra_ms = server.options.wait_frame_sleep_ms;
    if extra_ms > 0 {
        std::thread::sleep(Duration::from_millis(extra_ms));
    }

    Reply::ok(
        WaitFrameReply {
            frame_id: prediction.frame_id,
            predicted_display_ns: prediction.predicted_display_time_ns,
            predicted_display_period_ns: prediction.predicted_display_period_ns,
        }
        .encode(),
    )
}

fn begin_frame(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("begin_frame", BeginFrame::decode(payload))?;
    let cell = &server.cells[index];
    let now = monotonic_ns();

    let discarded = {
        let mut global = server.global();
        let control = &mut global.clients[index];
        if !control.session.is_running() {
            return Err(Error::call_order("begin_frame on a session that is not running"));
        }

        let waited = control.session.frame_ids.waited;
        if waited < 0 {
            return Err(Error::call_order("begin_frame without wait_frame"));
        }
        if req.frame_id != waited {
            return Err(Error::validation(format!(
                "begin_frame for frame {} but frame {} was waited",
                req.frame_id, waited
            )));
        }

        // A second begin without end discards the previously begun frame.
        let discarded = control.session.frame_started();
        if discarded {
            let begun = control.session.frame_ids.begun;
            if begun >= 0 {
                let _ = control.helper.mark_discarded(begun, now);
            }
        }

        control
            .helper
            .mark_wait_woke(waited, now)
            .map_err(timing_error)?;
        control.helper.mark_begin(waited, now).map_err(timing_error)?;

        control.session.frame_ids.begun = waited;
        control.session.frame_ids.waited = -1;
        control.session.set_frame_started(true);

        let events = &server.cells[index].events;
        let (visible, focused) = (control.visible, control.focused);
        control.session.on_first_begin_frame(&|state: SessionState| {
            events.push(Event::SessionStateChanged { state });
        });
        // The first begin may land after visibility was already granted;
        // catch the session up now that it is synchronized.
        control.session.apply_visibility(visible, focused, &|state: SessionState| {
            events.push(Event::SessionStateChanged { state });
        });

        discarded
    };

    cell.sem.post();
    cell.waits.decrement();

    if discarded {
        Reply::with_status(Status::FrameDiscarded)
    } else {
        Reply::empty()
    }
}

fn end_frame(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("end_frame", EndFrame::decode(payload))?;
    let cell = &server.cells[index];
    let now = monotonic_ns();

    // Validate before touching anything.
    {
        let global = server.global();
        let control = &global.clients[index];
        if !control.session.is_running() || !control.session.frame_started() {
            return Err(Error::call_order("end_frame without begin_frame"));
        }
        let begun = control.session.frame_ids.begun;
        if begun < 0 || req.frame_id != begun {
            return Err(Error::call_order(format!(
                "end_frame for frame {} but frame {} was begun",
                req.frame_id, begun
            )));
        }
    }

    if (req.stack.display_time_ns as i64) <= 0 {
        // Bad display time: the frame is discarded, reported as a runtime
        // failure.
        let mut global = server.global();
        let control = &mut global.clients[index];
        let begun = control.session.frame_ids.begun;
        if begun >= 0 {
            let _ = control.helper.mark_discarded(begun, now);
        }
        control.session.frame_ids.begun = -1;
        control.session.set_frame_started(false);
        // The frame is discarded but the session lives on.
        return Reply::failure(
            Status::Runtime,
            &format!(
                "non-positive display time {}",
                req.stack.display_time_ns as i64
            ),
        );
    }

    validate_stack_swapchains(server, index, &req.stack)?;

    // Hand the stack to the compositor side. May block for back-pressure;
    // no locks are held here.
    cell.slots.set_progress(&req.stack);
    cell.slots.commit_progress();

    // Mirror the scheduled stack into the shared-memory slot.
    {
        let record = RenderSlotRecord {
            display_time_ns: req.stack.display_time_ns,
            env_blend_mode: req.stack.env_blend_mode,
            active: true,
            layers: req.stack.layers.clone(),
        };
        let mut shm = server.shm.lock().unwrap();
        shm.write_slot(index, &record)?;
    }

    {
        let mut global = server.global();
        let control = &mut global.clients[index];
        control
            .helper
            .mark_delivered(req.frame_id, now)
            .map_err(timing_error)?;
        control.session.frame_ids.begun = -1;
        control.session.set_frame_started(false);
    }

    Reply::empty()
}

/// Every swapchain a layer references must exist and have released images.
fn validate_stack_swapchains(server: &Server, index: usize, stack: &LayerStack) -> Result<()> {
    let swapchains = server.cells[index].swapchains.lock().unwrap();
    for (layer_index, layer) in stack.layers.iter().enumerate() {
        for slot in 0..layer.kind.swapchain_count() {
            let id = layer.swapchain_ids[slot] as usize;
            let valid = swapchains.get(id).map_or(false, |entry| entry.is_some());
            if !valid {
                return Err(Error::validation(format!(
                    "layer {layer_index} references unknown swapchain {id}"
                )));
            }
        }
    }
    Ok(())
}

fn poll_event(server: &Server, index: usize) -> Result<Reply> {
    let mut buf = BytesMut::new();
    match server.cells[index].events.poll() {
        Some((timestamp_ns, event)) => {
            buf.put_u32_le(1);
            event.encode_body(timestamp_ns, &mut buf);
        }
        None => buf.put_u32_le(0),
    }
    Reply::ok(buf.freeze())
}

fn swapchain_create(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let mut req = decode("swapchain_create", SwapchainCreate::decode(payload))?;

    {
        let global = server.global();
        if !global.clients[index].session_created {
            return Err(Error::call_order("swapchain_create before session_create"));
        }
    }

    if req.image_count == 0 {
        req.image_count = DEFAULT_IMAGE_COUNT;
    }
    if req.image_count as usize > MAX_SWAPCHAIN_IMAGES {
        return Err(Error::validation(format!(
            "image count {} over the maximum {}",
            req.image_count, MAX_SWAPCHAIN_IMAGES
        )));
    }

    let mut swapchains = server.cells[index].swapchains.lock().unwrap();
    let slot = swapchains
        .iter()
        .position(|entry| entry.is_none())
        .ok_or_else(|| Error::resource_exhausted("too many swapchains"))?;

    let images = server
        .compositor
        .lock()
        .unwrap()
        .create_images(&req)
        .map_err(|e| Error::runtime(format!("image allocation: {e}")))?;

    let image_count = images.len() as u32;
    let image_size = images.first().map_or(0, |img| img.size);

    let mut handles = Vec::with_capacity(images.len());
    for image in &images {
        handles.push(
            image
                .handle
                .try_clone()
                .map_err(|e| Error::runtime(format!("dup image fd: {e}")))?,
        );
    }

    swapchains[slot] = Some(SwapchainEntry {
        state: SwapchainState::new(image_count),
        images,
    });

    debug!(index, slot, image_count, "created swapchain");

    Reply::with_handles(
        SwapchainCreateReply {
            swapchain_id: slot as u32,
            image_count,
            image_size,
        }
        .encode(),
        handles,
    )
}

fn with_swapchain<R>(
    server: &Server,
    index: usize,
    swapchain_id: u32,
    f: impl FnOnce(&mut SwapchainEntry) -> Result<R>,
) -> Result<R> {
    let mut swapchains = server.cells[index].swapchains.lock().unwrap();
    let entry = swapchains
        .get_mut(swapchain_id as usize)
        .and_then(|entry| entry.as_mut())
        .ok_or_else(|| Error::validation(format!("unknown swapchain {swapchain_id}")))?;
    f(entry)
}

fn swapchain_acquire(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("swapchain_acquire", SwapchainAcquire::decode(payload))?;
    let image_index = with_swapchain(server, index, req.swapchain_id, |entry| {
        entry.state.acquire().map_err(swapchain_error)
    })?;
    Reply::ok(SwapchainAcquireReply { image_index }.encode())
}

fn swapchain_wait(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("swapchain_wait", SwapchainWait::decode(payload))?;
    // Headless images carry no fence; the state transition is the wait.
    // A real GPU backend would block on the fence here, bounded by
    // `timeout_ns`, and return TIMEOUT_EXPIRED on expiry.
    with_swapchain(server, index, req.swapchain_id, |entry| {
        entry.state.wait(req.image_index).map_err(swapchain_error)
    })?;
    Reply::empty()
}

fn swapchain_release(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("swapchain_release", SwapchainRelease::decode(payload))?;
    with_swapchain(server, index, req.swapchain_id, |entry| {
        entry.state.release(req.image_index).map_err(swapchain_error)
    })?;
    Reply::empty()
}

fn swapchain_destroy(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("swapchain_destroy", SwapchainDestroy::decode(payload))?;
    let mut swapchains = server.cells[index].swapchains.lock().unwrap();
    let entry = swapchains
        .get_mut(req.swapchain_id as usize)
        .and_then(|entry| entry.take())
        .ok_or_else(|| Error::validation(format!("unknown swapchain {}", req.swapchain_id)))?;
    drop(swapchains);

    // Deferred: the render thread drains the stack at its next safe point.
    server.gc.push(entry.images);
    debug!(index, swapchain_id = req.swapchain_id, "swapchain queued for gc");
    Reply::empty()
}

fn device_update_input(server: &Server, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("device_update_input", DeviceUpdateInput::decode(payload))?;
    let device = server
        .table
        .devices
        .get(req.device_id as usize)
        .ok_or_else(|| Error::validation(format!("no device {}", req.device_id)))?;

    let refreshed = server.devices.update_inputs(req.device_id, monotonic_ns())?;

    let mut shm = server.shm.lock().unwrap();
    shm.write_inputs(device.first_input_index as usize, &refreshed)?;
    Reply::empty()
}

fn device_get_pose(server: &Server, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("device_get_pose", DeviceGetPose::decode(payload))?;
    let (pose, timestamp_ns) = server
        .devices
        .get_pose(req.device_id, req.input_name, req.at_time_ns)?;
    Reply::ok(DeviceGetPoseReply { pose, timestamp_ns }.encode())
}

fn device_set_output(server: &Server, index: usize, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("device_set_output", DeviceSetOutput::decode(payload))?;
    server
        .devices
        .set_output(req.device_id, req.output_name, req.value)?;

    if req.value.is_stop() {
        server.cells[index].events.push(Event::HapticStop {
            device_id: req.device_id,
            output_name: req.output_name,
        });
    }
    Reply::empty()
}

fn system_get_clients(server: &Server) -> Result<Reply> {
    let global = server.global();
    let ids = global
        .clients
        .iter()
        .enumerate()
        .filter(|(_, c)| c.occupied)
        .map(|(i, _)| i as u32)
        .collect();
    Reply::ok(ClientList { ids }.encode())
}

fn system_get_client_info(server: &Server, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("system_get_client_info", ClientId::decode(payload))?;
    let global = server.global();
    let control = global
        .clients
        .get(req.client_id as usize)
        .filter(|c| c.occupied)
        .ok_or_else(|| Error::validation(format!("no client {}", req.client_id)))?;

    let info = ClientInfo {
        app_name: control.app_name.clone(),
        pid: control.pid,
        primary: global.active_client == Some(req.client_id as usize),
        session_active: control.session_active,
        session_visible: control.visible,
        session_focused: control.focused,
        session_overlay: control.overlay,
        z_order: control.z_order,
    };
    Reply::ok(info.encode())
}

fn system_set_primary_client(server: &Server, payload: &mut Bytes) -> Result<Reply> {
    let req = decode("system_set_primary_client", ClientId::decode(payload))?;
    server.set_primary_client(req.client_id as usize)?;
    Reply::empty()
}
