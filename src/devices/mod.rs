pub mod conveyor;
pub mod hbw;
pub mod motor;
pub mod sensors;
pub mod vgr;

pub use conveyor::ConveyorSim;
pub use hbw::HbwSim;
pub use motor::{ElectricalSpec, MotorPhase, MotorSim, MotorSnapshot};
pub use sensors::{SensorKind, SensorSnapshot};
pub use vgr::VgrSim;

use crate::bus::{BusAdapter, DeviceCommand};
use crate::clock::{Tick, Ticker};
use crate::hub::BroadcastHub;
use crate::model::{DeviceId, HardwareStatus};
use crate::store::SharedStore;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Arrival tolerance for translational axes, in mm.
pub const ARRIVAL_EPSILON_MM: f64 = 1.0;

/// Device snapshots are persisted (not published) at this tick divisor.
const PERSIST_EVERY_TICKS: u64 = 5;

/// Full self-contained status snapshot, published on
/// `stf/<device>/status` every tick with a per-device monotonic `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device: DeviceId,
    pub seq: u64,
    pub ts_ms: u64,
    pub status: HardwareStatus,
    pub position: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<[f64; 3]>,
    #[serde(default)]
    pub motors: Vec<MotorSnapshot>,
    #[serde(default)]
    pub sensors: Vec<SensorSnapshot>,
    #[serde(default)]
    pub gripper_closed: bool,
    #[serde(default)]
    pub has_carrier: bool,
    #[serde(default)]
    pub vacuum_active: bool,
    #[serde(default)]
    pub valve_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub belt: Option<BeltState>,
    #[serde(default)]
    pub total_power_watts: f64,
    #[serde(default)]
    pub energy_joules: f64,
    #[serde(default)]
    pub anomalies: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BeltState {
    pub position_mm: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_position_mm: Option<f64>,
    pub has_object: bool,
    pub direction: i8,
}

/// One simulated device. Implementations own their full state; nothing else
/// in the process mutates it.
pub trait DeviceSim: Send {
    fn device(&self) -> DeviceId;

    /// Apply a decoded command as a target-state mutation. A rejection is
    /// logged by the runner and the message is dropped; device state is
    /// untouched.
    fn apply(&mut self, cmd: &DeviceCommand) -> Result<(), String>;

    /// Latch or clear the emergency state. While latched the device zeroes
    /// its motor enables and accepts only `Reset`.
    fn set_emergency(&mut self, on: bool);

    fn tick(&mut self, tick: &Tick) -> DeviceSnapshot;
}

// ---------------------------------------------------------------------------
// Axes
// ---------------------------------------------------------------------------

/// One driven axis: a motor plus bounded travel and an arrival tolerance.
#[derive(Debug)]
pub struct Axis {
    pub motor: MotorSim,
    position: f64,
    target: Option<f64>,
    min_mm: f64,
    max_mm: f64,
    eps: f64,
}

impl Axis {
    pub fn new(motor: MotorSim, min_mm: f64, max_mm: f64) -> Self {
        Self {
            motor,
            position: min_mm,
            target: None,
            min_mm,
            max_mm,
            eps: ARRIVAL_EPSILON_MM,
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn target(&self) -> Option<f64> {
        self.target
    }

    /// Command a new target. Requests past the soft travel limit are
    /// clipped; a request to move further in the direction of a limit the
    /// axis already sits on is rejected.
    pub fn set_target(&mut self, requested: f64) -> Result<(), String> {
        let clipped = requested.clamp(self.min_mm, self.max_mm);
        let at_max = self.position >= self.max_mm - self.eps;
        let at_min = self.position <= self.min_mm + self.eps;
        if (at_max && requested > self.max_mm) || (at_min && requested < self.min_mm) {
            return Err(format!(
                "{}: at soft travel limit, rejecting move to {requested}",
                self.motor.component_id()
            ));
        }
        if (clipped - self.position).abs() < self.eps {
            return Ok(());
        }
        self.target = Some(clipped);
        self.motor.activate();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.target = None;
        self.motor.deactivate();
    }

    pub fn halt(&mut self) {
        self.target = None;
        self.motor.cut_power();
    }

    pub fn tick(&mut self, dt_secs: f64, rng: &mut StdRng) -> MotorSnapshot {
        let snap = self.motor.tick(dt_secs, rng);
        if let Some(target) = self.target {
            if self.motor.velocity() > 0.0 {
                let step = self.motor.velocity() * dt_secs;
                let direction = if target > self.position { 1.0 } else { -1.0 };
                self.position =
                    (self.position + direction * step).clamp(self.min_mm, self.max_mm);
            }
            if (target - self.position).abs() < self.eps {
                self.position = target;
                self.target = None;
                self.motor.deactivate();
            }
        }
        snap
    }
}

/// The three driven axes of a gantry-style device.
#[derive(Debug)]
pub struct AxisSet {
    pub x: Axis,
    pub y: Axis,
    pub z: Axis,
}

impl AxisSet {
    pub fn positions(&self) -> [f64; 3] {
        [self.x.position(), self.y.position(), self.z.position()]
    }

    /// Per-axis targets, `None` when no axis is driven. Undriven axes
    /// report their current position.
    pub fn targets(&self) -> Option<[f64; 3]> {
        if self.x.target().is_none() && self.y.target().is_none() && self.z.target().is_none() {
            return None;
        }
        Some([
            self.x.target().unwrap_or_else(|| self.x.position()),
            self.y.target().unwrap_or_else(|| self.y.position()),
            self.z.target().unwrap_or_else(|| self.z.position()),
        ])
    }

    pub fn move_to(
        &mut self,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
    ) -> Result<(), String> {
        if let Some(x) = x {
            self.x.set_target(x)?;
        }
        if let Some(y) = y {
            self.y.set_target(y)?;
        }
        if let Some(z) = z {
            self.z.set_target(z)?;
        }
        Ok(())
    }

    pub fn any_moving(&self) -> bool {
        [&self.x, &self.y, &self.z]
            .iter()
            .any(|a| a.motor.phase() != MotorPhase::Idle)
    }

    pub fn stop_all(&mut self) {
        self.x.stop();
        self.y.stop();
        self.z.stop();
    }

    pub fn halt_all(&mut self) {
        self.x.halt();
        self.y.halt();
        self.z.halt();
    }

    pub fn tick(&mut self, dt_secs: f64, rng: &mut StdRng) -> Vec<MotorSnapshot> {
        vec![
            self.x.tick(dt_secs, rng),
            self.y.tick(dt_secs, rng),
            self.z.tick(dt_secs, rng),
        ]
    }

    pub fn at_home(&self, window_mm: f64) -> bool {
        self.positions().iter().all(|p| *p < window_mm)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run one simulator as its own task: `select!` over the clock, its command
/// topics, and the global broadcast topics. Snapshots go to the bus and the
/// hub every tick and to the store at a lower rate, the way the original
/// cell throttled its database writes.
pub fn spawn_simulator(
    mut sim: Box<dyn DeviceSim>,
    ticker: &Ticker,
    bus: &BusAdapter,
    store: SharedStore,
    hub: BroadcastHub,
) -> JoinHandle<()> {
    let device = sim.device();
    let mut ticks = ticker.subscribe();
    let mut commands = bus.subscribe(&format!("stf/{}/cmd/#", device.topic_segment()));
    let mut global = bus.subscribe("stf/global/cmd/#");
    let bus = bus.clone();
    let status_topic = crate::bus::status_topic(device);

    tokio::spawn(async move {
        let mut pending_energy = 0.0_f64;
        loop {
            tokio::select! {
                tick = ticks.recv() => {
                    let tick = match tick {
                        Ok(t) => t,
                        // Lagged: resume with the next tick, dt unchanged.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    let snapshot = sim.tick(&tick);
                    pending_energy += snapshot.energy_joules;
                    if let Err(e) = bus.publish(status_topic.as_str(), &snapshot) {
                        warn!(target: "stf_twin::devices", %device, error = %e, "status publish failed");
                    }
                    hub.publish_device_status(tick.now_ms, &snapshot);
                    if tick.seq % PERSIST_EVERY_TICKS == 0 {
                        persist_snapshot(&store, &snapshot, &mut pending_energy).await;
                    }
                }
                Some(msg) = commands.recv() => {
                    let action = msg.topic.rsplit('/').next().unwrap_or_default();
                    match DeviceCommand::parse(action, &msg.payload) {
                        Ok(cmd) => {
                            if let Err(reason) = sim.apply(&cmd) {
                                warn!(target: "stf_twin::devices", %device, %reason, "command rejected");
                            } else {
                                debug!(target: "stf_twin::devices", %device, ?cmd, "command applied");
                            }
                        }
                        Err(e) => {
                            // Malformed or unknown: drop, never mutate state.
                            warn!(target: "stf_twin::devices", %device, error = %e, "malformed command dropped");
                        }
                    }
                }
                Some(msg) = global.recv() => {
                    match msg.topic.rsplit('/').next() {
                        Some("emergency_stop") => {
                            warn!(target: "stf_twin::devices", %device, "emergency stop received");
                            sim.set_emergency(true);
                        }
                        Some(other) => {
                            debug!(target: "stf_twin::devices", %device, topic = other, "global event ignored");
                        }
                        None => {}
                    }
                }
                else => break,
            }
        }
    })
}

async fn persist_snapshot(store: &SharedStore, snapshot: &DeviceSnapshot, energy: &mut f64) {
    let device = snapshot.device;
    if let Ok(value) = serde_json::to_value(snapshot) {
        let _ = store.record_device_snapshot(device, value).await;
    }
    for motor in &snapshot.motors {
        let _ = store
            .append_telemetry(device, &format!("{}.current_amps", motor.component_id), motor.current_amps, Some("A"))
            .await;
        let _ = store
            .append_telemetry(device, &format!("{}.health_score", motor.component_id), motor.health_score, None)
            .await;
    }
    if *energy > 0.0 {
        let _ = store
            .append_energy(device, *energy, 24.0, snapshot.total_power_watts)
            .await;
        *energy = 0.0;
    }
}
