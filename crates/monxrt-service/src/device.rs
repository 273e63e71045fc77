//! The device capability.
//!
//! Drivers live outside this process; the service consumes them as an
//! abstract provider of a device table, poses at timestamps, input
//! snapshots, and haptic outputs. The built-in [`StubDevices`] provider
//! backs the headless configuration and the test suite with one HMD and a
//! controller pair.

use monxrt_common::debug::ServiceOptions;
use monxrt_common::{Error, Result};
use monxrt_proto::shm::{
    DeviceRecord, DeviceTable, HmdBlock, InputRecord, OutputRecord, TrackingOriginRecord,
    DISTORTION_COEFFS,
};
use monxrt_proto::{
    DeviceClass, Fov, HapticValue, InputKind, OutputKind, Pose, TrackingOriginKind,
};

/// What the service needs from device drivers.
pub trait DeviceProvider: Send + Sync {
    /// The full device table. Called once at startup; the table is
    /// read-only for the life of the process.
    fn table(&self) -> DeviceTable;

    /// Refresh one device's input snapshots. Returns the refreshed
    /// snapshots in table order, `first_input_index` onward.
    fn update_inputs(&self, device_id: u32, now_ns: u64) -> Result<Vec<InputRecord>>;

    /// A tracked pose for one input at a requested time.
    fn get_pose(&self, device_id: u32, input_name: u32, at_time_ns: u64) -> Result<(Pose, u64)>;

    /// Drive a haptic output.
    fn set_output(&self, device_id: u32, output_name: u32, value: HapticValue) -> Result<()>;

    /// The HMD's nominal display period.
    fn frame_interval_ns(&self) -> u64;
}

/// 90 Hz, the stub HMD's cadence.
const STUB_FRAME_INTERVAL_NS: u64 = 11_111_111;

/// Input names used by the stub device set.
pub const INPUT_HEAD_POSE: u32 = 1;
pub const INPUT_GRIP_POSE: u32 = 2;
pub const OUTPUT_HAPTIC: u32 = 1;

/// A fixed device set with no hardware behind it.
pub struct StubDevices {
    ipd_mm: f64,
    fov: Fov,
}

impl StubDevices {
    pub fn new(options: &ServiceOptions) -> Self {
        let fov = match options.fov_override {
            Some(ov) => Fov {
                angle_left: ov.angle_left as f32,
                angle_right: ov.angle_right as f32,
                angle_up: ov.angle_up as f32,
                angle_down: ov.angle_down as f32,
            },
            None => Fov {
                angle_left: -0.942_478,
                angle_right: 0.942_478,
                angle_up: 0.942_478,
                angle_down: -0.942_478,
            },
        };
        Self {
            ipd_mm: options.ipd_mm,
            fov,
        }
    }

    fn check_device(&self, device_id: u32) -> Result<()> {
        if device_id >= 3 {
            return Err(Error::validation(format!("no device {device_id}")));
        }
        Ok(())
    }

    /// Head at the origin, controllers half an IPD out to each side.
    fn pose_for(&self, device_id: u32) -> Pose {
        let half_ipd_m = (self.ipd_mm / 2_000.0) as f32;
        let mut pose = Pose::IDENTITY;
        match device_id {
            1 => pose.position = [-half_ipd_m, -0.3, -0.2],
            2 => pose.position = [half_ipd_m, -0.3, -0.2],
            _ => {}
        }
        pose
    }
}

impl DeviceProvider for StubDevices {
    fn table(&self) -> DeviceTable {
        let origins = vec![TrackingOriginRecord {
            name: "stub-origin".to_string(),
            kind: TrackingOriginKind::World,
            offset_pose: Pose::IDENTITY,
        }];

        let devices = vec![
            DeviceRecord {
                class: DeviceClass::Hmd,
                name: "MONXRT Stub HMD".to_string(),
                tracking_origin_index: 0,
                num_inputs: 1,
                first_input_index: 0,
                num_outputs: 0,
                first_output_index: 0,
                hmd: Some(HmdBlock {
                    viewports: [[0, 0, 1440, 1600], [1440, 0, 1440, 1600]],
                    display_w_pixels: 2880,
                    display_h_pixels: 1600,
                    fovs: [self.fov, self.fov],
                    distortion: [[0.0; DISTORTION_COEFFS]; 2],
                    frame_interval_ns: STUB_FRAME_INTERVAL_NS,
                }),
            },
            DeviceRecord {
                class: DeviceClass::LeftController,
                name: "MONXRT Stub Controller (Left)".to_string(),
                tracking_origin_index: 0,
                num_inputs: 1,
                first_input_index: 1,
                num_outputs: 1,
                first_output_index: 0,
                hmd: None,
            },
            DeviceRecord {
                class: DeviceClass::RightController,
                name: "MONXRT Stub Controller (Right)".to_string(),
                tracking_origin_index: 0,
                num_inputs: 1,
                first_input_index: 2,
                num_outputs: 1,
                first_output_index: 1,
                hmd: None,
            },
        ];

        let mut inputs = Vec::new();
        for device_id in 0..devices.len() as u32 {
            let pose = self.pose_for(device_id);
            inputs.push(InputRecord {
                name: if device_id == 0 {
                    INPUT_HEAD_POSE
                } else {
                    INPUT_GRIP_POSE
                },
                kind: InputKind::Pose,
                active: true,
                timestamp_ns: 0,
                value: [
                    pose.orientation[0],
                    pose.orientation[1],
                    pose.orientation[2],
                    pose.orientation[3],
                    pose.position[0],
                    pose.position[1],
                    pose.position[2],
                ],
            });
        }

        let outputs = vec![
            OutputRecord {
                name: OUTPUT_HAPTIC,
                kind: OutputKind::Haptic,
            },
            OutputRecord {
                name: OUTPUT_HAPTIC,
                kind: OutputKind::Haptic,
            },
        ];

        DeviceTable {
            origins,
            devices,
            inputs,
            outputs,
        }
    }

    fn update_inputs(&self, device_id: u32, now_ns: u64) -> Result<Vec<InputRecord>> {
        self.check_device(device_id)?;
        let pose = self.pose_for(device_id);
        Ok(vec![InputRecord {
            name: if device_id == 0 {
                INPUT_HEAD_POSE
            } else {
                INPUT_GRIP_POSE
            },
            kind: InputKind::Pose,
            active: true,
            timestamp_ns: now_ns,
            value: [
                pose.orientation[0],
                pose.orientation[1],
                pose.orientation[2],
                pose.orientation[3],
                pose.position[0],
                pose.position[1],
                pose.position[2],
            ],
        }])
    }

    fn get_pose(&self, device_id: u32, input_name: u32, at_time_ns: u64) -> Result<(Pose, u64)> {
        self.check_device(device_id)?;
        let expected = if device_id == 0 {
            INPUT_HEAD_POSE
        } else {
            INPUT_GRIP_POSE
        };
        if input_name != expected {
            return Err(Error::validation(format!(
                "device {device_id} has no input {input_name}"
            )));
        }
        Ok((self.pose_for(device_id), at_time_ns))
    }

    fn set_output(&self, device_id: u32, output_name: u32, _value: HapticValue) -> Result<()> {
        self.check_device(device_id)?;
        if device_id == 0 {
            return Err(Error::validation("the HMD has no outputs"));
        }
        if output_name != OUTPUT_HAPTIC {
            return Err(Error::validation(format!(
                "device {device_id} has no output {output_name}"
            )));
        }
        Ok(())
    }

    fn frame_interval_ns(&self) -> u64 {
        STUB_FRAME_INTERVAL_NS
    }
}

/// Format the device table for `monxrt-service test`.
pub fn dump_table(table: &DeviceTable) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "tracking origins: {}", table.origins.len());
    for (i, origin) in table.origins.iter().enumerate() {
        let _ = writeln!(out, "  [{}] {:?} '{}'", i, origin.kind, origin.name);
    }
    let _ = writeln!(out, "devices: {}", table.devices.len());
    for (i, dev) in table.devices.iter().enumerate() {
        let _ = writeln!(
            out,
            "  [{}] {:?} '{}' origin={} inputs={}..{} outputs={}..{}",
            i,
            dev.class,
            dev.name,
            dev.tracking_origin_index,
            dev.first_input_index,
            dev.first_input_index + dev.num_inputs,
            dev.first_output_index,
            dev.first_output_index + dev.num_outputs,
        );
        if let Some(hmd) = &dev.hmd {
            let _ = writeln!(
                out,
                "      hmd {}x{} @ {:.2}ms",
                hmd.display_w_pixels,
                hmd.display_h_pixels,
                hmd.frame_interval_ns as f64 / 1e6,
            );
        }
    }
    let _ = writeln!(out, "inputs: {}", table.inputs.len());
    for (i, input) in table.inputs.iter().enumerate() {
        let _ = writeln!(
            out,
            "  [{}] name={} {:?} active={}",
            i, input.name, input.kind, input.active
        );
    }
    let _ = writeln!(out, "outputs: {}", table.outputs.len());
    for (i, output) in table.outputs.iter().enumerate() {
        let _ = writeln!(out, "  [{}] name={} {:?}", i, output.name, output.kind);
    }
    out
}
