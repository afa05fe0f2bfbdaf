//! High-bay warehouse stacker crane.
//!
//! Three axes: X along the rail (column select), Y up the tower (shelf
//! select), Z the horizontal fork telescope that reaches into a bay. The
//! fork slides under a carrier and lifts it; `gripper` commands drive the
//! fork engagement.

use super::motor::{ElectricalSpec, MotorSim};
use super::sensors::ReferenceSwitch;
use super::{Axis, AxisSet, DeviceSim, DeviceSnapshot, Tick};
use crate::bus::DeviceCommand;
use crate::model::{DeviceId, HardwareStatus, SlotName};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Conveyor pickup position in HBW coordinates.
pub const CONVEYOR_PICKUP: [f64; 3] = [100.0, 0.0, 0.0];
/// Home / reference position.
pub const HOME: [f64; 3] = [0.0, 0.0, 0.0];
/// Fork extension when engaged in a bay.
pub const FORK_EXTENSION_MM: f64 = 80.0;

const HOME_WINDOW_MM: f64 = 5.0;

/// Rack coordinates for a slot, in HBW space.
pub fn slot_position(slot: SlotName) -> [f64; 3] {
    let (x, y) = slot.coordinates();
    [x, y, 0.0]
}

pub struct HbwSim {
    axes: AxisSet,
    ref_switch: ReferenceSwitch,
    gripper_closed: bool,
    has_carrier: bool,
    emergency: bool,
    seq: u64,
    rng: StdRng,
}

impl HbwSim {
    pub fn new(seed: u64) -> Self {
        Self {
            axes: AxisSet {
                x: Axis::new(
                    MotorSim::new("HBW_X", ElectricalSpec::with_running_amps(1.5)),
                    0.0,
                    400.0,
                ),
                y: Axis::new(
                    MotorSim::new("HBW_Y", ElectricalSpec::with_running_amps(1.5)),
                    0.0,
                    400.0,
                ),
                z: Axis::new(
                    MotorSim::new("HBW_Z", ElectricalSpec::with_running_amps(1.0)),
                    0.0,
                    FORK_EXTENSION_MM,
                ),
            },
            ref_switch: ReferenceSwitch::new("HBW_REF_SW"),
            gripper_closed: false,
            has_carrier: false,
            emergency: false,
            seq: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DeviceSim for HbwSim {
    fn device(&self) -> DeviceId {
        DeviceId::Hbw
    }

    fn apply(&mut self, cmd: &DeviceCommand) -> Result<(), String> {
        if self.emergency && !matches!(cmd, DeviceCommand::Reset) {
            return Err("HBW in EMERGENCY, only reset accepted".into());
        }
        match cmd {
            DeviceCommand::Move { x, y, z } => self.axes.move_to(*x, *y, *z),
            DeviceCommand::Gripper { closed } => {
                self.gripper_closed = *closed;
                // The fork either engages the carrier under it or sets it
                // down where it stands.
                self.has_carrier = *closed;
                Ok(())
            }
            DeviceCommand::Stop => {
                self.axes.stop_all();
                Ok(())
            }
            DeviceCommand::Reset => {
                self.emergency = false;
                self.axes.halt_all();
                self.gripper_closed = false;
                self.has_carrier = false;
                Ok(())
            }
            other => Err(format!("HBW does not support {other:?}")),
        }
    }

    fn set_emergency(&mut self, on: bool) {
        self.emergency = on;
        if on {
            self.axes.halt_all();
        }
    }

    fn tick(&mut self, tick: &Tick) -> DeviceSnapshot {
        let motors = self.axes.tick(tick.dt_secs(), &mut self.rng);
        let at_home = self.axes.at_home(HOME_WINDOW_MM);
        let ref_snap = self.ref_switch.update(at_home, tick.now_ms);

        let status = if self.emergency {
            HardwareStatus::Emergency
        } else if self.axes.any_moving() {
            HardwareStatus::Moving
        } else {
            HardwareStatus::Idle
        };

        let total_power_watts: f64 = motors.iter().map(|m| m.power_watts).sum();
        let energy_joules: f64 = motors.iter().map(|m| m.energy_joules).sum();
        let anomalies: Vec<String> =
            motors.iter().filter_map(|m| m.anomaly.clone()).collect();

        self.seq += 1;
        DeviceSnapshot {
            device: DeviceId::Hbw,
            seq: self.seq,
            ts_ms: tick.now_ms,
            status,
            position: self.axes.positions(),
            target: self.axes.targets(),
            motors,
            sensors: vec![ref_snap],
            gripper_closed: self.gripper_closed,
            has_carrier: self.has_carrier,
            vacuum_active: false,
            valve_open: false,
            belt: None,
            total_power_watts,
            energy_joules,
            anomalies,
        }
    }
}
