//! Vacuum gripper robot.
//!
//! Three-axis gantry over the factory floor with a pneumatic suction cup:
//! X/Y position the cup, Z lowers it. A compressor builds the vacuum; the
//! valve routes it to the cup.

use super::motor::{ElectricalSpec, MotorSim};
use super::{Axis, AxisSet, DeviceSim, DeviceSnapshot, Tick};
use crate::bus::DeviceCommand;
use crate::model::{DeviceId, HardwareStatus};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Raw material arrival point.
pub const DELIVERY_ZONE: [f64; 3] = [0.0, 0.0, 0.0];
/// Processing station.
pub const OVEN_POSITION: [f64; 3] = [150.0, 50.0, 0.0];
/// Where the VGR sets items onto the conveyor input.
pub const CONVEYOR_INPUT: [f64; 3] = [200.0, 100.0, 0.0];

pub struct VgrSim {
    axes: AxisSet,
    compressor: MotorSim,
    valve_open: bool,
    vacuum_active: bool,
    has_item: bool,
    emergency: bool,
    seq: u64,
    rng: StdRng,
}

impl VgrSim {
    pub fn new(seed: u64) -> Self {
        Self {
            axes: AxisSet {
                x: Axis::new(
                    MotorSim::new("VGR_X", ElectricalSpec::with_running_amps(1.2)),
                    0.0,
                    250.0,
                ),
                y: Axis::new(
                    MotorSim::new("VGR_Y", ElectricalSpec::with_running_amps(1.2)),
                    0.0,
                    150.0,
                ),
                z: Axis::new(
                    MotorSim::new("VGR_Z", ElectricalSpec::with_running_amps(0.8)),
                    0.0,
                    60.0,
                ),
            },
            compressor: MotorSim::new(
                "VGR_COMP",
                ElectricalSpec {
                    idle_amps: 0.1,
                    startup_amps: 4.0,
                    running_amps: 2.5,
                    ..ElectricalSpec::default()
                },
            ),
            valve_open: false,
            vacuum_active: false,
            has_item: false,
            emergency: false,
            seq: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn release_vacuum(&mut self) {
        self.compressor.deactivate();
        self.valve_open = false;
        self.vacuum_active = false;
        self.has_item = false;
    }
}

impl DeviceSim for VgrSim {
    fn device(&self) -> DeviceId {
        DeviceId::Vgr
    }

    fn apply(&mut self, cmd: &DeviceCommand) -> Result<(), String> {
        if self.emergency && !matches!(cmd, DeviceCommand::Reset) {
            return Err("VGR in EMERGENCY, only reset accepted".into());
        }
        match cmd {
            DeviceCommand::Move { x, y, z } => self.axes.move_to(*x, *y, *z),
            DeviceCommand::Vacuum { on } => {
                if *on {
                    self.compressor.activate();
                    self.valve_open = true;
                    self.vacuum_active = true;
                    self.has_item = true;
                } else {
                    self.release_vacuum();
                }
                Ok(())
            }
            DeviceCommand::Stop => {
                self.axes.stop_all();
                Ok(())
            }
            DeviceCommand::Reset => {
                self.emergency = false;
                self.axes.halt_all();
                self.release_vacuum();
                Ok(())
            }
            other => Err(format!("VGR does not support {other:?}")),
        }
    }

    fn set_emergency(&mut self, on: bool) {
        self.emergency = on;
        if on {
            self.axes.halt_all();
            // Dropping the vacuum on an emergency would drop the item;
            // keep the valve state, cut only motion.
            self.compressor.cut_power();
        }
    }

    fn tick(&mut self, tick: &Tick) -> DeviceSnapshot {
        let mut motors = self.axes.tick(tick.dt_secs(), &mut self.rng);
        motors.push(self.compressor.tick(tick.dt_secs(), &mut self.rng));

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
            device: DeviceId::Vgr,
            seq: self.seq,
            ts_ms: tick.now_ms,
            status,
            position: self.axes.positions(),
            target: self.axes.targets(),
            motors,
            sensors: Vec::new(),
            gripper_closed: false,
            has_carrier: false,
            vacuum_active: self.vacuum_active,
            valve_open: self.valve_open,
            belt: None,
            total_power_watts,
            energy_joules,
            anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Tick;

    fn tick(seq: u64) -> Tick {
        Tick { seq, now_ms: seq * 100, dt_ms: 100 }
    }

    #[test]
    fn vacuum_engages_compressor_and_holds_item() {
        let mut sim = VgrSim::new(7);
        sim.apply(&DeviceCommand::Vacuum { on: true }).unwrap();
        let snap = sim.tick(&tick(1));
        assert!(snap.vacuum_active);
        assert!(snap.valve_open);
        // Compressor is the fourth motor in the snapshot, mid-inrush.
        assert_eq!(snap.motors[3].component_id, "VGR_COMP");
        assert_eq!(snap.motors[3].current_amps, 4.0);

        sim.apply(&DeviceCommand::Vacuum { on: false }).unwrap();
        let snap = sim.tick(&tick(2));
        assert!(!snap.vacuum_active);
        assert!(!snap.valve_open);
    }

    #[test]
    fn gantry_reaches_conveyor_input() {
        let mut sim = VgrSim::new(7);
        sim.apply(&DeviceCommand::Move {
            x: Some(CONVEYOR_INPUT[0]),
            y: Some(CONVEYOR_INPUT[1]),
            z: None,
        })
        .unwrap();
        let mut snap = sim.tick(&tick(1));
        for n in 2..200 {
            snap = sim.tick(&tick(n));
            if snap.status == HardwareStatus::Idle && snap.target.is_none() {
                break;
            }
        }
        assert_eq!(snap.position[0], CONVEYOR_INPUT[0]);
        assert_eq!(snap.position[1], CONVEYOR_INPUT[1]);
    }

    #[test]
    fn emergency_cuts_motion_but_not_the_grip() {
        let mut sim = VgrSim::new(7);
        sim.apply(&DeviceCommand::Vacuum { on: true }).unwrap();
        sim.apply(&DeviceCommand::Move { x: Some(100.0), y: None, z: None }).unwrap();
        sim.tick(&tick(1));

        sim.set_emergency(true);
        let snap = sim.tick(&tick(2));
        assert_eq!(snap.status, HardwareStatus::Emergency);
        assert!(snap.target.is_none());
        // The held item is not dropped by the stop itself.
        assert!(snap.valve_open);
        assert!(sim.apply(&DeviceCommand::Vacuum { on: false }).is_err());
    }
}
