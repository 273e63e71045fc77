//! Plain data types shared between the service, clients, and shared memory.
//!
//! Every type here has a fixed wire encoding (little-endian, no padding
//! surprises) so the same codecs serve the control socket and the
//! shared-memory region.

use bytes::{Buf, BufMut};

use crate::wire::ProtoError;
use crate::MAX_LAYERS;

/// Read guard: error out instead of panicking on short input.
pub(crate) fn need(buf: &impl Buf, n: usize, what: &'static str) -> Result<(), ProtoError> {
    if buf.remaining() < n {
        return Err(ProtoError::Truncated(what));
    }
    Ok(())
}

/// Unit quaternion plus position, the universal rigid transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Orientation as `[x, y, z, w]`.
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

impl Pose {
    pub const ENCODED_SIZE: usize = 7 * 4;

    /// The identity transform.
    pub const IDENTITY: Pose = Pose {
        orientation: [0.0, 0.0, 0.0, 1.0],
        position: [0.0, 0.0, 0.0],
    };

    pub fn encode(&self, buf: &mut impl BufMut) {
        for v in self.orientation {
            buf.put_f32_le(v);
        }
        for v in self.position {
            buf.put_f32_le(v);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "pose")?;
        let mut orientation = [0.0; 4];
        for v in &mut orientation {
            *v = buf.get_f32_le();
        }
        let mut position = [0.0; 3];
        for v in &mut position {
            *v = buf.get_f32_le();
        }
        Ok(Self {
            orientation,
            position,
        })
    }
}

/// Field of view as four half-angles in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    pub const ENCODED_SIZE: usize = 4 * 4;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f32_le(self.angle_left);
        buf.put_f32_le(self.angle_right);
        buf.put_f32_le(self.angle_up);
        buf.put_f32_le(self.angle_down);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "fov")?;
        Ok(Self {
            angle_left: buf.get_f32_le(),
            angle_right: buf.get_f32_le(),
            angle_up: buf.get_f32_le(),
            angle_down: buf.get_f32_le(),
        })
    }
}

/// An axis-aligned sub-image rectangle plus the image it indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubImageRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Which image of the referenced swapchain this frame used.
    pub image_index: u32,
}

impl SubImageRect {
    pub const ENCODED_SIZE: usize = 5 * 4;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.x);
        buf.put_i32_le(self.y);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.image_index);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "sub-image rect")?;
        Ok(Self {
            x: buf.get_i32_le(),
            y: buf.get_i32_le(),
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            image_index: buf.get_u32_le(),
        })
    }
}

/// Composition layer type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LayerKind {
    StereoProjection = 0,
    Quad = 1,
    Cube = 2,
    Cylinder = 3,
    Equirect = 4,
    Passthrough = 5,
}

impl LayerKind {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::StereoProjection,
            1 => Self::Quad,
            2 => Self::Cube,
            3 => Self::Cylinder,
            4 => Self::Equirect,
            5 => Self::Passthrough,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "layer kind",
                    value,
                })
            }
        })
    }

    /// How many swapchain references this layer type carries.
    pub fn swapchain_count(self) -> usize {
        match self {
            Self::StereoProjection => 2,
            Self::Passthrough => 0,
            _ => 1,
        }
    }
}

/// Which space a layer pose is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SpaceKind {
    /// Head-locked, follows the view.
    View = 0,
    /// Fixed in the tracking world.
    World = 1,
}

impl SpaceKind {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::View,
            1 => Self::World,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "space kind",
                    value,
                })
            }
        })
    }
}

/// Environment blend mode for a submitted layer stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum BlendMode {
    #[default]
    Opaque = 0,
    Additive = 1,
    AlphaBlend = 2,
}

impl BlendMode {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::Opaque,
            1 => Self::Additive,
            2 => Self::AlphaBlend,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "blend mode",
                    value,
                })
            }
        })
    }
}

/// One element of a client's per-frame layer stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerEntry {
    pub kind: LayerKind,
    /// Client-local swapchain ids; `kind.swapchain_count()` of these are live.
    pub swapchain_ids: [u32; 4],
    /// Per-eye sub-image rectangles. Mono layer types use only entry 0.
    pub rects: [SubImageRect; 2],
    pub pose: Pose,
    pub space: SpaceKind,
    /// Per-layer blend flags (premultiplied alpha, unpremultiplied, etc).
    pub blend_flags: u32,
}

impl LayerEntry {
    pub const ENCODED_SIZE: usize =
        4 + 4 * 4 + 2 * SubImageRect::ENCODED_SIZE + Pose::ENCODED_SIZE + 4 + 4;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.kind as u32);
        for id in self.swapchain_ids {
            buf.put_u32_le(id);
        }
        for rect in &self.rects {
            rect.encode(buf);
        }
        self.pose.encode(buf);
        buf.put_u32_le(self.space as u32);
        buf.put_u32_le(self.blend_flags);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "layer entry")?;
        let kind = LayerKind::from_u32(buf.get_u32_le())?;
        let mut swapchain_ids = [0u32; 4];
        for id in &mut swapchain_ids {
            *id = buf.get_u32_le();
        }
        let rects = [SubImageRect::decode(buf)?, SubImageRect::decode(buf)?];
        let pose = Pose::decode(buf)?;
        let space = SpaceKind::from_u32(buf.get_u32_le())?;
        let blend_flags = buf.get_u32_le();
        Ok(Self {
            kind,
            swapchain_ids,
            rects,
            pose,
            space,
            blend_flags,
        })
    }
}

/// A complete per-frame submission from one client.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LayerStack {
    pub display_time_ns: u64,
    pub env_blend_mode: BlendMode,
    pub layers: Vec<LayerEntry>,
}

impl LayerStack {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.display_time_ns);
        buf.put_u32_le(self.env_blend_mode as u32);
        buf.put_u32_le(self.layers.len() as u32);
        for layer in &self.layers {
            layer.encode(buf);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, 8 + 4 + 4, "layer stack header")?;
        let display_time_ns = buf.get_u64_le();
        let env_blend_mode = BlendMode::from_u32(buf.get_u32_le())?;
        let count = buf.get_u32_le() as usize;
        if count > MAX_LAYERS {
            return Err(ProtoError::InvalidEnum {
                name: "layer count",
                value: count as u32,
            });
        }
        let mut layers = Vec::with_capacity(count);
        for _ in 0..count {
            layers.push(LayerEntry::decode(buf)?);
        }
        Ok(Self {
            display_time_ns,
            env_blend_mode,
            layers,
        })
    }
}

/// Device class in the device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceClass {
    Hmd = 0,
    LeftController = 1,
    RightController = 2,
    Gamepad = 3,
    Tracker = 4,
    Eyes = 5,
}

impl DeviceClass {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::Hmd,
            1 => Self::LeftController,
            2 => Self::RightController,
            3 => Self::Gamepad,
            4 => Self::Tracker,
            5 => Self::Eyes,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "device class",
                    value,
                })
            }
        })
    }
}

/// Tracking-origin class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TrackingOriginKind {
    /// Fixed mounting, e.g. a 3dof-only headset.
    Static = 0,
    /// Relative to another tracked device.
    DeviceRelative = 1,
    /// Absolute in a world coordinate system (inside-out or lighthouse).
    World = 2,
}

impl TrackingOriginKind {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::Static,
            1 => Self::DeviceRelative,
            2 => Self::World,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "tracking origin kind",
                    value,
                })
            }
        })
    }
}

/// Input value kind for an input descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InputKind {
    Boolean = 0,
    Vec1 = 1,
    Vec2 = 2,
    Pose = 3,
}

impl InputKind {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::Boolean,
            1 => Self::Vec1,
            2 => Self::Vec2,
            3 => Self::Pose,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "input kind",
                    value,
                })
            }
        })
    }
}

/// Output kind for an output descriptor. Only haptics exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OutputKind {
    Haptic = 0,
}

impl OutputKind {
    pub fn from_u32(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => Self::Haptic,
            value => {
                return Err(ProtoError::InvalidEnum {
                    name: "output kind",
                    value,
                })
            }
        })
    }
}

/// A haptic output command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticValue {
    pub frequency_hz: f32,
    pub amplitude: f32,
    pub duration_ns: u64,
}

impl HapticValue {
    pub const ENCODED_SIZE: usize = 4 + 4 + 8;

    /// A stop command: zero amplitude, zero duration.
    pub fn is_stop(&self) -> bool {
        self.amplitude == 0.0 && self.duration_ns == 0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f32_le(self.frequency_hz);
        buf.put_f32_le(self.amplitude);
        buf.put_u64_le(self.duration_ns);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "haptic value")?;
        Ok(Self {
            frequency_hz: buf.get_f32_le(),
            amplitude: buf.get_f32_le(),
            duration_ns: buf.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample_layer() -> LayerEntry {
        LayerEntry {
            kind: LayerKind::StereoProjection,
            swapchain_ids: [0, 1, 0, 0],
            rects: [
                SubImageRect {
                    x: 0,
                    y: 0,
                    width: 1440,
                    height: 1600,
                    image_index: 2,
                },
                SubImageRect {
                    x: 1440,
                    y: 0,
                    width: 1440,
                    height: 1600,
                    image_index: 2,
                },
            ],
            pose: Pose::IDENTITY,
            space: SpaceKind::World,
            blend_flags: 0,
        }
    }

    #[test]
    fn layer_entry_roundtrip() {
        let entry = sample_layer();
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len(), LayerEntry::ENCODED_SIZE);
        let decoded = LayerEntry::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn layer_stack_roundtrip() {
        let stack = LayerStack {
            display_time_ns: 123_456_789,
            env_blend_mode: BlendMode::AlphaBlend,
            layers: vec![sample_layer(), sample_layer()],
        };
        let mut buf = BytesMut::new();
        stack.encode(&mut buf);
        let decoded = LayerStack::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, stack);
    }

    #[test]
    fn layer_stack_rejects_excess_layers() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(MAX_LAYERS as u32 + 1);
        assert!(LayerStack::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn swapchain_counts_per_kind() {
        assert_eq!(LayerKind::StereoProjection.swapchain_count(), 2);
        assert_eq!(LayerKind::Quad.swapchain_count(), 1);
        assert_eq!(LayerKind::Passthrough.swapchain_count(), 0);
    }

    #[test]
    fn haptic_stop_detection() {
        let stop = HapticValue {
            frequency_hz: 0.0,
            amplitude: 0.0,
            duration_ns: 0,
        };
        assert!(stop.is_stop());
        let buzz = HapticValue {
            frequency_hz: 160.0,
            amplitude: 0.8,
            duration_ns: 50_000_000,
        };
        assert!(!buzz.is_stop());
    }

    #[test]
    fn truncated_pose_rejected() {
        let mut short = BytesMut::new();
        short.put_f32_le(1.0);
        assert!(matches!(
            Pose::decode(&mut short.freeze()),
            Err(ProtoError::Truncated("pose"))
        ));
    }
}
