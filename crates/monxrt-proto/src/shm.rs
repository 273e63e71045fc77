//! Shared-memory region layout.
//!
//! One process-global region, created by the service and mapped read-only
//! (by convention) in clients. Sections in order, each starting at an
//! 8-byte-aligned offset recorded in the header:
//!
//! 1. Header (magic, version, counts, section offsets, monotonic epoch)
//! 2. Tracking-origin array
//! 3. Device array
//! 4. Input snapshot array
//! 5. Output descriptor array
//! 6. Per-client render slot array
//!
//! Records are serialized field by field, little-endian, at fixed sizes; no
//! struct casting, no bitfields. The service is the only writer; it holds
//! the global-state lock while mutating anything other than 32/64-bit
//! aligned snapshot fields.

use bytes::{Buf, BufMut};

use crate::types::{
    need, DeviceClass, Fov, InputKind, LayerEntry, OutputKind, Pose, TrackingOriginKind,
};
use crate::wire::ProtoError;
use crate::{BlendMode, MAX_CLIENTS, MAX_LAYERS, PROTOCOL_VERSION};

/// Magic at offset zero of the region.
pub const SHM_MAGIC: [u8; 8] = *b"MONXRT\0\0";

/// Length of a tracking-origin name, bytes.
pub const TRACKING_NAME_LEN: usize = 32;

/// Length of a device description string, bytes.
pub const DEVICE_NAME_LEN: usize = 256;

/// Distortion polynomial coefficients per eye.
pub const DISTORTION_COEFFS: usize = 5;

fn put_fixed_str(buf: &mut impl BufMut, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1); // always NUL-terminated
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, len - n);
}

fn get_fixed_str(buf: &mut impl Buf, len: usize) -> Result<String, ProtoError> {
    need(buf, len, "fixed string")?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8(bytes[..end].to_vec()).map_err(|_| ProtoError::BadString)
}

fn align8(offset: usize) -> usize {
    (offset + 7) & !7
}

/// Section offsets and total size, computed once at service init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLayout {
    pub num_itracks: u32,
    pub num_idevs: u32,
    pub num_inputs: u32,
    pub num_outputs: u32,
    pub offset_itracks: u32,
    pub offset_idevs: u32,
    pub offset_inputs: u32,
    pub offset_outputs: u32,
    pub offset_slots: u32,
    pub total_size: u32,
}

impl ShmLayout {
    /// Lay the sections out back to back for the given element counts.
    pub fn compute(num_itracks: u32, num_idevs: u32, num_inputs: u32, num_outputs: u32) -> Self {
        let offset_itracks = align8(ShmHeader::ENCODED_SIZE);
        let offset_idevs =
            align8(offset_itracks + num_itracks as usize * TrackingOriginRecord::ENCODED_SIZE);
        let offset_inputs = align8(offset_idevs + num_idevs as usize * DeviceRecord::ENCODED_SIZE);
        let offset_outputs = align8(offset_inputs + num_inputs as usize * InputRecord::ENCODED_SIZE);
        let offset_slots =
            align8(offset_outputs + num_outputs as usize * OutputRecord::ENCODED_SIZE);
        let total_size = align8(offset_slots + MAX_CLIENTS * RenderSlotRecord::ENCODED_SIZE);
        Self {
            num_itracks,
            num_idevs,
            num_inputs,
            num_outputs,
            offset_itracks: offset_itracks as u32,
            offset_idevs: offset_idevs as u32,
            offset_inputs: offset_inputs as u32,
            offset_outputs: offset_outputs as u32,
            offset_slots: offset_slots as u32,
            total_size: total_size as u32,
        }
    }

    /// Byte offset of client `index`'s render slot.
    pub fn slot_offset(&self, index: usize) -> usize {
        self.offset_slots as usize + index * RenderSlotRecord::ENCODED_SIZE
    }

    /// Byte offset of input snapshot `index`.
    pub fn input_offset(&self, index: usize) -> usize {
        self.offset_inputs as usize + index * InputRecord::ENCODED_SIZE
    }
}

/// The region header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmHeader {
    pub version: u32,
    pub size: u32,
    pub epoch_ns: u64,
    pub layout: ShmLayout,
}

impl ShmHeader {
    pub const ENCODED_SIZE: usize = 8 + 4 + 4 + 8 + 9 * 4;

    pub fn new(epoch_ns: u64, layout: ShmLayout) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            size: layout.total_size,
            epoch_ns,
            layout,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&SHM_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.size);
        buf.put_u64_le(self.epoch_ns);
        buf.put_u32_le(self.layout.num_itracks);
        buf.put_u32_le(self.layout.num_idevs);
        buf.put_u32_le(self.layout.num_inputs);
        buf.put_u32_le(self.layout.num_outputs);
        buf.put_u32_le(self.layout.offset_itracks);
        buf.put_u32_le(self.layout.offset_idevs);
        buf.put_u32_le(self.layout.offset_inputs);
        buf.put_u32_le(self.layout.offset_outputs);
        buf.put_u32_le(self.layout.offset_slots);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "shm header")?;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != SHM_MAGIC {
            return Err(ProtoError::InvalidEnum {
                name: "shm magic",
                value: u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]),
            });
        }
        let version = buf.get_u32_le();
        let size = buf.get_u32_le();
        let epoch_ns = buf.get_u64_le();
        let num_itracks = buf.get_u32_le();
        let num_idevs = buf.get_u32_le();
        let num_inputs = buf.get_u32_le();
        let num_outputs = buf.get_u32_le();
        let offset_itracks = buf.get_u32_le();
        let offset_idevs = buf.get_u32_le();
        let offset_inputs = buf.get_u32_le();
        let offset_outputs = buf.get_u32_le();
        let offset_slots = buf.get_u32_le();
        Ok(Self {
            version,
            size,
            epoch_ns,
            layout: ShmLayout {
                num_itracks,
                num_idevs,
                num_inputs,
                num_outputs,
                offset_itracks,
                offset_idevs,
                offset_inputs,
                offset_outputs,
                offset_slots,
                total_size: size,
            },
        })
    }
}

/// One tracking origin.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingOriginRecord {
    pub name: String,
    pub kind: TrackingOriginKind,
    pub offset_pose: Pose,
}

impl TrackingOriginRecord {
    pub const ENCODED_SIZE: usize = TRACKING_NAME_LEN + 4 + Pose::ENCODED_SIZE;

    pub fn encode(&self, buf: &mut impl BufMut) {
        put_fixed_str(buf, &self.name, TRACKING_NAME_LEN);
        buf.put_u32_le(self.kind as u32);
        self.offset_pose.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let name = get_fixed_str(buf, TRACKING_NAME_LEN)?;
        need(buf, 4, "tracking origin kind")?;
        let kind = TrackingOriginKind::from_u32(buf.get_u32_le())?;
        let offset_pose = Pose::decode(buf)?;
        Ok(Self {
            name,
            kind,
            offset_pose,
        })
    }
}

/// Per-eye display and distortion data, present on HMD devices only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HmdBlock {
    /// Per-eye viewport into the display, pixels: `[x, y, w, h]`.
    pub viewports: [[u32; 4]; 2],
    /// Full display resolution, pixels.
    pub display_w_pixels: u32,
    pub display_h_pixels: u32,
    pub fovs: [Fov; 2],
    /// Radial distortion polynomial coefficients per eye.
    pub distortion: [[f32; DISTORTION_COEFFS]; 2],
    /// Nominal scan-out interval.
    pub frame_interval_ns: u64,
}

impl HmdBlock {
    pub const ENCODED_SIZE: usize =
        2 * 4 * 4 + 4 + 4 + 2 * Fov::ENCODED_SIZE + 2 * DISTORTION_COEFFS * 4 + 8;

    pub fn encode(&self, buf: &mut impl BufMut) {
        for viewport in &self.viewports {
            for v in viewport {
                buf.put_u32_le(*v);
            }
        }
        buf.put_u32_le(self.display_w_pixels);
        buf.put_u32_le(self.display_h_pixels);
        for fov in &self.fovs {
            fov.encode(buf);
        }
        for eye in &self.distortion {
            for k in eye {
                buf.put_f32_le(*k);
            }
        }
        buf.put_u64_le(self.frame_interval_ns);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "hmd block")?;
        let mut viewports = [[0u32; 4]; 2];
        for viewport in &mut viewports {
            for v in viewport.iter_mut() {
                *v = buf.get_u32_le();
            }
        }
        let display_w_pixels = buf.get_u32_le();
        let display_h_pixels = buf.get_u32_le();
        let fovs = [Fov::decode(buf)?, Fov::decode(buf)?];
        let mut distortion = [[0f32; DISTORTION_COEFFS]; 2];
        for eye in &mut distortion {
            for k in eye.iter_mut() {
                *k = buf.get_f32_le();
            }
        }
        let frame_interval_ns = buf.get_u64_le();
        Ok(Self {
            viewports,
            display_w_pixels,
            display_h_pixels,
            fovs,
            distortion,
            frame_interval_ns,
        })
    }
}

/// One device table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub class: DeviceClass,
    pub name: String,
    pub tracking_origin_index: u32,
    pub num_inputs: u32,
    pub first_input_index: u32,
    pub num_outputs: u32,
    pub first_output_index: u32,
    pub hmd: Option<HmdBlock>,
}

impl DeviceRecord {
    pub const ENCODED_SIZE: usize = 4 + DEVICE_NAME_LEN + 5 * 4 + 4 + HmdBlock::ENCODED_SIZE;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.class as u32);
        put_fixed_str(buf, &self.name, DEVICE_NAME_LEN);
        buf.put_u32_le(self.tracking_origin_index);
        buf.put_u32_le(self.num_inputs);
        buf.put_u32_le(self.first_input_index);
        buf.put_u32_le(self.num_outputs);
        buf.put_u32_le(self.first_output_index);
        buf.put_u32_le(self.hmd.is_some() as u32);
        match &self.hmd {
            Some(hmd) => hmd.encode(buf),
            None => buf.put_bytes(0, HmdBlock::ENCODED_SIZE),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "device record")?;
        let class = DeviceClass::from_u32(buf.get_u32_le())?;
        let name = get_fixed_str(buf, DEVICE_NAME_LEN)?;
        let tracking_origin_index = buf.get_u32_le();
        let num_inputs = buf.get_u32_le();
        let first_input_index = buf.get_u32_le();
        let num_outputs = buf.get_u32_le();
        let first_output_index = buf.get_u32_le();
        let has_hmd = buf.get_u32_le() != 0;
        let hmd = if has_hmd {
            Some(HmdBlock::decode(buf)?)
        } else {
            need(buf, HmdBlock::ENCODED_SIZE, "hmd padding")?;
            buf.advance(HmdBlock::ENCODED_SIZE);
            None
        };
        Ok(Self {
            class,
            name,
            tracking_origin_index,
            num_inputs,
            first_input_index,
            num_outputs,
            first_output_index,
            hmd,
        })
    }
}

/// One input snapshot. The value union is wide enough for a pose; scalar
/// and vector inputs use a prefix of it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputRecord {
    pub name: u32,
    pub kind: InputKind,
    pub active: bool,
    pub timestamp_ns: u64,
    pub value: [f32; 7],
}

impl InputRecord {
    pub const ENCODED_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 7 * 4;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.name);
        buf.put_u32_le(self.kind as u32);
        buf.put_u32_le(self.active as u32);
        buf.put_u32_le(0); // keep the timestamp 8-aligned
        buf.put_u64_le(self.timestamp_ns);
        for v in self.value {
            buf.put_f32_le(v);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "input record")?;
        let name = buf.get_u32_le();
        let kind = InputKind::from_u32(buf.get_u32_le())?;
        let active = buf.get_u32_le() != 0;
        buf.advance(4);
        let timestamp_ns = buf.get_u64_le();
        let mut value = [0f32; 7];
        for v in &mut value {
            *v = buf.get_f32_le();
        }
        Ok(Self {
            name,
            kind,
            active,
            timestamp_ns,
            value,
        })
    }
}

/// One output descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRecord {
    pub name: u32,
    pub kind: OutputKind,
}

impl OutputRecord {
    pub const ENCODED_SIZE: usize = 4 + 4;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.name);
        buf.put_u32_le(self.kind as u32);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "output record")?;
        Ok(Self {
            name: buf.get_u32_le(),
            kind: OutputKind::from_u32(buf.get_u32_le())?,
        })
    }
}

/// One per-client render slot as it appears in shared memory.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSlotRecord {
    pub display_time_ns: u64,
    pub env_blend_mode: BlendMode,
    pub active: bool,
    pub layers: Vec<LayerEntry>,
}

impl RenderSlotRecord {
    pub const ENCODED_SIZE: usize = 8 + 4 + 4 + 4 + 4 + MAX_LAYERS * LayerEntry::ENCODED_SIZE;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.display_time_ns);
        buf.put_u32_le(self.env_blend_mode as u32);
        buf.put_u32_le(self.layers.len() as u32);
        buf.put_u32_le(self.active as u32);
        buf.put_u32_le(0); // pad to 8
        for layer in &self.layers {
            layer.encode(buf);
        }
        let unused = MAX_LAYERS - self.layers.len();
        buf.put_bytes(0, unused * LayerEntry::ENCODED_SIZE);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        need(buf, Self::ENCODED_SIZE, "render slot")?;
        let display_time_ns = buf.get_u64_le();
        let env_blend_mode = BlendMode::from_u32(buf.get_u32_le())?;
        let count = buf.get_u32_le() as usize;
        if count > MAX_LAYERS {
            return Err(ProtoError::InvalidEnum {
                name: "slot layer count",
                value: count as u32,
            });
        }
        let active = buf.get_u32_le() != 0;
        buf.advance(4);
        let mut layers = Vec::with_capacity(count);
        for _ in 0..count {
            layers.push(LayerEntry::decode(buf)?);
        }
        buf.advance((MAX_LAYERS - count) * LayerEntry::ENCODED_SIZE);
        Ok(Self {
            display_time_ns,
            env_blend_mode,
            active,
            layers,
        })
    }
}

/// The static half of the region: everything except input snapshots and
/// render slots, which mutate at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTable {
    pub origins: Vec<TrackingOriginRecord>,
    pub devices: Vec<DeviceRecord>,
    pub inputs: Vec<InputRecord>,
    pub outputs: Vec<OutputRecord>,
}

impl DeviceTable {
    pub fn layout(&self) -> ShmLayout {
        ShmLayout::compute(
            self.origins.len() as u32,
            self.devices.len() as u32,
            self.inputs.len() as u32,
            self.outputs.len() as u32,
        )
    }

    /// Serialize the header and all sections into `region`, which must be at
    /// least `layout().total_size` bytes. Render slots are zeroed.
    pub fn write_region(&self, epoch_ns: u64, region: &mut [u8]) -> Result<(), ProtoError> {
        let layout = self.layout();
        if region.len() < layout.total_size as usize {
            return Err(ProtoError::Truncated("shm region"));
        }
        region[..layout.total_size as usize].fill(0);

        let header = ShmHeader::new(epoch_ns, layout);
        let mut cursor = &mut region[0..];
        header.encode(&mut cursor);

        let mut at = layout.offset_itracks as usize;
        for origin in &self.origins {
            let mut cursor = &mut region[at..];
            origin.encode(&mut cursor);
            at += TrackingOriginRecord::ENCODED_SIZE;
        }

        let mut at = layout.offset_idevs as usize;
        for device in &self.devices {
            let mut cursor = &mut region[at..];
            device.encode(&mut cursor);
            at += DeviceRecord::ENCODED_SIZE;
        }

        let mut at = layout.offset_inputs as usize;
        for input in &self.inputs {
            let mut cursor = &mut region[at..];
            input.encode(&mut cursor);
            at += InputRecord::ENCODED_SIZE;
        }

        let mut at = layout.offset_outputs as usize;
        for output in &self.outputs {
            let mut cursor = &mut region[at..];
            output.encode(&mut cursor);
            at += OutputRecord::ENCODED_SIZE;
        }

        Ok(())
    }

    /// Parse a region produced by [`DeviceTable::write_region`].
    pub fn read_region(region: &[u8]) -> Result<(ShmHeader, Self), ProtoError> {
        let mut cursor = region;
        let header = ShmHeader::decode(&mut cursor)?;
        let layout = header.layout;

        let mut origins = Vec::with_capacity(layout.num_itracks as usize);
        let mut cursor = region
            .get(layout.offset_itracks as usize..)
            .ok_or(ProtoError::Truncated("itracks section"))?;
        for _ in 0..layout.num_itracks {
            origins.push(TrackingOriginRecord::decode(&mut cursor)?);
        }

        let mut devices = Vec::with_capacity(layout.num_idevs as usize);
        let mut cursor = region
            .get(layout.offset_idevs as usize..)
            .ok_or(ProtoError::Truncated("idevs section"))?;
        for _ in 0..layout.num_idevs {
            devices.push(DeviceRecord::decode(&mut cursor)?);
        }

        let mut inputs = Vec::with_capacity(layout.num_inputs as usize);
        let mut cursor = region
            .get(layout.offset_inputs as usize..)
            .ok_or(ProtoError::Truncated("inputs section"))?;
        for _ in 0..layout.num_inputs {
            inputs.push(InputRecord::decode(&mut cursor)?);
        }

        let mut outputs = Vec::with_capacity(layout.num_outputs as usize);
        let mut cursor = region
            .get(layout.offset_outputs as usize..)
            .ok_or(ProtoError::Truncated("outputs section"))?;
        for _ in 0..layout.num_outputs {
            outputs.push(OutputRecord::decode(&mut cursor)?);
        }

        Ok((
            header,
            Self {
                origins,
                devices,
                inputs,
                outputs,
            },
        ))
    }
}
