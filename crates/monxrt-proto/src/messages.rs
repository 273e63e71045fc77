//! Request and reply payload codecs for every control-socket operation.
//!
//! The framing layer ([`crate::wire`]) handles the datagram header and the
//! reply status word; these types are only the payload that follows. Each
//! request type pairs with a reply type (empty replies are omitted).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{need, Fov, HapticValue, LayerStack, Pose};
use crate::wire::ProtoError;
use crate::MAX_CLIENTS;

fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut impl Buf) -> Result<String, ProtoError> {
    need(buf, 4, "string length")?;
    let len = buf.get_u32_le() as usize;
    need(buf, len, "string body")?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ProtoError::BadString)
}

fn get_bool(buf: &mut impl Buf) -> Result<bool, ProtoError> {
    need(buf, 4, "bool")?;
    Ok(buf.get_u32_le() != 0)
}

fn encoded<T: FnOnce(&mut BytesMut)>(f: T) -> Bytes {
    let mut buf = BytesMut::new();
    f(&mut buf);
    buf.freeze()
}

/// `instance_create(app_name)` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceCreate {
    pub app_name: String,
    pub pid: u32,
}

impl InstanceCreate {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            put_string(buf, &self.app_name);
            buf.put_u32_le(self.pid);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let app_name = get_string(buf)?;
        need(buf, 4, "instance pid")?;
        let pid = buf.get_u32_le();
        Ok(Self { app_name, pid })
    }
}

/// Reply to `instance_create`; the shared-memory handle rides out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceCreateReply {
    pub instance_id: u32,
    pub shm_size: u32,
    pub device_table_offset: u32,
}

impl InstanceCreateReply {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.instance_id);
            buf.put_u32_le(self.shm_size);
            buf.put_u32_le(self.device_table_offset);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 12, "instance create reply")?;
        Ok(Self {
            instance_id: buf.get_u32_le(),
            shm_size: buf.get_u32_le(),
            device_table_offset: buf.get_u32_le(),
        })
    }
}

/// Reply to `system_get_properties`.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemProperties {
    pub hmd_name: String,
    pub view_count: u32,
    pub view_resolution: [u32; 2],
    pub refresh_hz: f32,
    pub fovs: [Fov; 2],
}

impl SystemProperties {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            put_string(buf, &self.hmd_name);
            buf.put_u32_le(self.view_count);
            buf.put_u32_le(self.view_resolution[0]);
            buf.put_u32_le(self.view_resolution[1]);
            buf.put_f32_le(self.refresh_hz);
            for fov in &self.fovs {
                fov.encode(buf);
            }
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let hmd_name = get_string(buf)?;
        need(buf, 4 * 4, "system properties")?;
        let view_count = buf.get_u32_le();
        let view_resolution = [buf.get_u32_le(), buf.get_u32_le()];
        let refresh_hz = buf.get_f32_le();
        let fovs = [Fov::decode(buf)?, Fov::decode(buf)?];
        Ok(Self {
            hmd_name,
            view_count,
            view_resolution,
            refresh_hz,
            fovs,
        })
    }
}

/// Graphics API the client binds its session with. The service only needs
/// this to pick the right image import path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GraphicsBinding {
    Vulkan = 0,
    OpenGl = 1,
    Headless = 2,
}

impl GraphicsBinding {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::Vulkan,
            1 => Self::OpenGl,
            2 => Self::Headless,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "graphics binding",
                    value,
                })
            }
        })
    }
}

/// `session_create(graphics_binding_type, binding_args)` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreate {
    pub binding: GraphicsBinding,
    /// Opaque binding arguments, interpreted by the renderer capability.
    pub binding_args: Vec<u8>,
    /// Created as an overlay session composited atop the primary.
    pub overlay: bool,
    /// Z order among overlays; ignored unless `overlay` is set.
    pub z_order: i32,
}

impl SessionCreate {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.binding as u32);
            buf.put_u32_le(self.binding_args.len() as u32);
            buf.put_slice(&self.binding_args);
            buf.put_u32_le(self.overlay as u32);
            buf.put_i32_le(self.z_order);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 8, "session create")?;
        let binding = GraphicsBinding::from_u32(buf.get_u32_le())?;
        let args_len = buf.get_u32_le() as usize;
        need(buf, args_len, "binding args")?;
        let mut binding_args = vec![0u8; args_len];
        buf.copy_to_slice(&mut binding_args);
        let overlay = get_bool(buf)?;
        need(buf, 4, "session z order")?;
        let z_order = buf.get_i32_le();
        Ok(Self {
            binding,
            binding_args,
            overlay,
            z_order,
        })
    }
}

/// Reply to `session_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCreateReply {
    pub session_id: u32,
}

impl SessionCreateReply {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| buf.put_u32_le(self.session_id))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 4, "session create reply")?;
        Ok(Self {
            session_id: buf.get_u32_le(),
        })
    }
}

/// `swapchain_create(info)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreate {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub image_count: u32,
    pub mip_count: u32,
    pub array_size: u32,
    pub sample_count: u32,
    pub usage_flags: u32,
}

impl SwapchainCreate {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.width);
            buf.put_u32_le(self.height);
            buf.put_u32_le(self.format);
            buf.put_u32_le(self.image_count);
            buf.put_u32_le(self.mip_count);
            buf.put_u32_le(self.array_size);
            buf.put_u32_le(self.sample_count);
            buf.put_u32_le(self.usage_flags);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 8 * 4, "swapchain create")?;
        Ok(Self {
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            format: buf.get_u32_le(),
            image_count: buf.get_u32_le(),
            mip_count: buf.get_u32_le(),
            array_size: buf.get_u32_le(),
            sample_count: buf.get_u32_le(),
            usage_flags: buf.get_u32_le(),
        })
    }
}

/// Reply to `swapchain_create`; image handles ride out-of-band, in image
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateReply {
    pub swapchain_id: u32,
    pub image_count: u32,
    /// Size in bytes of each exported image allocation.
    pub image_size: u64,
}

impl SwapchainCreateReply {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.swapchain_id);
            buf.put_u32_le(self.image_count);
            buf.put_u64_le(self.image_size);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 16, "swapchain create reply")?;
        Ok(Self {
            swapchain_id: buf.get_u32_le(),
            image_count: buf.get_u32_le(),
            image_size: buf.get_u64_le(),
        })
    }
}

/// `swapchain_acquire(swapchain_id)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainAcquire {
    pub swapchain_id: u32,
}

impl SwapchainAcquire {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| buf.put_u32_le(self.swapchain_id))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 4, "swapchain acquire")?;
        Ok(Self {
            swapchain_id: buf.get_u32_le(),
        })
    }
}

/// Reply to `swapchain_acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainAcquireReply {
    pub image_index: u32,
}

impl SwapchainAcquireReply {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| buf.put_u32_le(self.image_index))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 4, "swapchain acquire reply")?;
        Ok(Self {
            image_index: buf.get_u32_le(),
        })
    }
}

/// `swapchain_wait(swapchain_id, image_index, timeout_ns)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainWait {
    pub swapchain_id: u32,
    pub image_index: u32,
    pub timeout_ns: u64,
}

impl SwapchainWait {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.swapchain_id);
            buf.put_u32_le(self.image_index);
            buf.put_u64_le(self.timeout_ns);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 16, "swapchain wait")?;
        Ok(Self {
            swapchain_id: buf.get_u32_le(),
            image_index: buf.get_u32_le(),
            timeout_ns: buf.get_u64_le(),
        })
    }
}

/// `swapchain_release(swapchain_id, image_index)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainRelease {
    pub swapchain_id: u32,
    pub image_index: u32,
}

impl SwapchainRelease {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.swapchain_id);
            buf.put_u32_le(self.image_index);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 8, "swapchain release")?;
        Ok(Self {
            swapchain_id: buf.get_u32_le(),
            image_index: buf.get_u32_le(),
        })
    }
}

/// `swapchain_destroy(swapchain_id)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDestroy {
    pub swapchain_id: u32,
}

impl SwapchainDestroy {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| buf.put_u32_le(self.swapchain_id))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 4, "swapchain destroy")?;
        Ok(Self {
            swapchain_id: buf.get_u32_le(),
        })
    }
}

/// `begin_session(primary_view_config)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginSession {
    /// The primary view configuration (stereo == 2 views).
    pub primary_view_config: u32,
}

impl BeginSession {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| buf.put_u32_le(self.primary_view_config))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 4, "begin session")?;
        Ok(Self {
            primary_view_config: buf.get_u32_le(),
        })
    }
}

/// Reply to `wait_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFrameReply {
    pub frame_id: i64,
    pub predicted_display_ns: u64,
    pub predicted_display_period_ns: u64,
}

impl WaitFrameReply {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_i64_le(self.frame_id);
            buf.put_u64_le(self.predicted_display_ns);
            buf.put_u64_le(self.predicted_display_period_ns);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 24, "wait frame reply")?;
        Ok(Self {
            frame_id: buf.get_i64_le(),
            predicted_display_ns: buf.get_u64_le(),
            predicted_display_period_ns: buf.get_u64_le(),
        })
    }
}

/// `begin_frame(frame_id)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginFrame {
    pub frame_id: i64,
}

impl BeginFrame {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| buf.put_i64_le(self.frame_id))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 8, "begin frame")?;
        Ok(Self {
            frame_id: buf.get_i64_le(),
        })
    }
}

/// `end_frame(frame_id, layer_stack, env_blend_mode)` request. The blend
/// mode and display time travel inside the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct EndFrame {
    pub frame_id: i64,
    pub stack: LayerStack,
}

impl EndFrame {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_i64_le(self.frame_id);
            self.stack.encode(buf);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 8, "end frame")?;
        let frame_id = buf.get_i64_le();
        let stack = LayerStack::decode(buf)?;
        Ok(Self { frame_id, stack })
    }
}

/// `device_update_input(device_id)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceUpdateInput {
    pub device_id: u32,
}

impl DeviceUpdateInput {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| buf.put_u32_le(self.device_id))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 4, "device update input")?;
        Ok(Self {
            device_id: buf.get_u32_le(),
        })
    }
}

/// `device_get_pose(device_id, input_name, at_time_ns)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGetPose {
    pub device_id: u32,
    pub input_name: u32,
    pub at_time_ns: u64,
}

impl DeviceGetPose {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.device_id);
            buf.put_u32_le(self.input_name);
            buf.put_u64_le(self.at_time_ns);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 16, "device get pose")?;
        Ok(Self {
            device_id: buf.get_u32_le(),
            input_name: buf.get_u32_le(),
            at_time_ns: buf.get_u64_le(),
        })
    }
}

/// Reply to `device_get_pose`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceGetPoseReply {
    pub pose: Pose,
    pub timestamp_ns: u64,
}

impl DeviceGetPoseReply {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            self.pose.encode(buf);
            buf.put_u64_le(self.timestamp_ns);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let pose = Pose::decode(buf)?;
        need(buf, 8, "pose timestamp")?;
        Ok(Self {
            pose,
            timestamp_ns: buf.get_u64_le(),
        })
    }
}

/// `device_set_output(device_id, output_name, value)` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSetOutput {
    pub device_id: u32,
    pub output_name: u32,
    pub value: HapticValue,
}

impl DeviceSetOutput {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.device_id);
            buf.put_u32_le(self.output_name);
            self.value.encode(buf);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 8, "device set output")?;
        let device_id = buf.get_u32_le();
        let output_name = buf.get_u32_le();
        let value = HapticValue::decode(buf)?;
        Ok(Self {
            device_id,
            output_name,
            value,
        })
    }
}

/// Reply to `system_get_clients`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientList {
    pub ids: Vec<u32>,
}

impl ClientList {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            buf.put_u32_le(self.ids.len() as u32);
            for id in &self.ids {
                buf.put_u32_le(*id);
            }
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 4, "client list")?;
        let count = buf.get_u32_le() as usize;
        if count > MAX_CLIENTS {
            return Err(ProtoError::InvalidEnum {
                name: "client count",
                value: count as u32,
            });
        }
        need(buf, count * 4, "client ids")?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(buf.get_u32_le());
        }
        Ok(Self { ids })
    }
}

/// `system_get_client_info(client_id)` request and
/// `system_set_primary_client(client_id)` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId {
    pub client_id: u32,
}

impl ClientId {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| buf.put_u32_le(self.client_id))
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 4, "client id")?;
        Ok(Self {
            client_id: buf.get_u32_le(),
        })
    }
}

/// Reply to `system_get_client_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub app_name: String,
    pub pid: u32,
    pub primary: bool,
    pub session_active: bool,
    pub session_visible: bool,
    pub session_focused: bool,
    pub session_overlay: bool,
    pub z_order: i32,
}

impl ClientInfo {
    pub fn encode(&self) -> Bytes {
        encoded(|buf| {
            put_string(buf, &self.app_name);
            buf.put_u32_le(self.pid);
            buf.put_u32_le(self.primary as u32);
            buf.put_u32_le(self.session_active as u32);
            buf.put_u32_le(self.session_visible as u32);
            buf.put_u32_le(self.session_focused as u32);
            buf.put_u32_le(self.session_overlay as u32);
            buf.put_i32_le(self.z_order);
        })
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let app_name = get_string(buf)?;
        need(buf, 7 * 4, "client info")?;
        Ok(Self {
            app_name,
            pid: buf.get_u32_le(),
            primary: buf.get_u32_le() != 0,
            session_active: buf.get_u32_le() != 0,
            session_visible: buf.get_u32_le() != 0,
            session_focused: buf.get_u32_le() != 0,
            session_overlay: buf.get_u32_le() != 0,
            z_order: buf.get_i32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlendMode, LayerEntry, LayerKind, SpaceKind, SubImageRect};

    #[test]
    fn instance_create_roundtrip() {
        let req = InstanceCreate {
            app_name: "hello-xr".to_string(),
            pid: 4242,
        };
        let decoded = InstanceCreate::decode(&mut req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn session_create_roundtrip_with_args() {
        let req = SessionCreate {
            binding: GraphicsBinding::Vulkan,
            binding_args: vec![9, 8, 7],
            overlay: true,
            z_order: 10,
        };
        let decoded = SessionCreate::decode(&mut req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn end_frame_roundtrip() {
        let req = EndFrame {
            frame_id: 51,
            stack: LayerStack {
                display_time_ns: 1_000_000,
                env_blend_mode: BlendMode::Opaque,
                layers: vec![LayerEntry {
                    kind: LayerKind::Quad,
                    swapchain_ids: [3, 0, 0, 0],
                    rects: [
                        SubImageRect {
                            x: 0,
                            y: 0,
                            width: 512,
                            height: 512,
                            image_index: 1,
                        },
                        SubImageRect::default(),
                    ],
                    pose: Pose::IDENTITY,
                    space: SpaceKind::View,
                    blend_flags: 1,
                }],
            },
        };
        let decoded = EndFrame::decode(&mut req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn wait_frame_reply_roundtrip() {
        let reply = WaitFrameReply {
            frame_id: 7,
            predicted_display_ns: 22_222_222,
            predicted_display_period_ns: 11_111_111,
        };
        let decoded = WaitFrameReply::decode(&mut reply.encode()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn client_info_roundtrip() {
        let info = ClientInfo {
            app_name: "overlay-keyboard".to_string(),
            pid: 100,
            primary: false,
            session_active: true,
            session_visible: true,
            session_focused: false,
            session_overlay: true,
            z_order: 20,
        };
        let decoded = ClientInfo::decode(&mut info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn bad_utf8_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_slice(&[0xFF, 0xFE]);
        buf.put_u32_le(0);
        assert!(matches!(
            InstanceCreate::decode(&mut buf.freeze()),
            Err(ProtoError::BadString)
        ));
    }
}
