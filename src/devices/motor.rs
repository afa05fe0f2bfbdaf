//! Motor electrical + wear model.
//!
//! Phase sequence IDLE -> STARTUP -> RUNNING -> STOPPING -> IDLE with a
//! one-tick inrush spike on startup. Wear accumulates while the motor is
//! out of IDLE; degraded health injects bounded current anomalies and,
//! below 0.5, probabilistic one-tick micro-stoppages.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MotorPhase {
    Idle,
    Startup,
    Running,
    Stopping,
}

/// Electrical characteristics, per component.
#[derive(Debug, Clone, Copy)]
pub struct ElectricalSpec {
    pub idle_amps: f64,
    pub startup_amps: f64,
    pub running_amps: f64,
    pub voltage: f64,
    /// Current drawn when a worn bearing bites.
    pub anomaly_amps: f64,
}

impl Default for ElectricalSpec {
    fn default() -> Self {
        Self {
            idle_amps: 0.05,
            startup_amps: 2.5,
            running_amps: 1.2,
            voltage: 24.0,
            anomaly_amps: 3.5,
        }
    }
}

impl ElectricalSpec {
    pub fn with_running_amps(running_amps: f64) -> Self {
        Self { running_amps, ..Self::default() }
    }
}

/// Health score below which current anomalies start.
pub const HEALTH_ANOMALY_THRESHOLD: f64 = 0.8;
/// Health score below which micro-stoppages start.
pub const HEALTH_STOPPAGE_THRESHOLD: f64 = 0.5;
/// Fixed wear per active tick.
pub const WEAR_PER_TICK: f64 = 1e-4;

const ANOMALY_PROBABILITY: f64 = 0.05;
const STOPPAGE_PROBABILITY: f64 = 0.02;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorSnapshot {
    pub component_id: String,
    pub phase: MotorPhase,
    pub current_amps: f64,
    pub voltage: f64,
    pub health_score: f64,
    pub accumulated_runtime_sec: f64,
    pub is_active: bool,
    pub velocity: f64,
    pub power_watts: f64,
    pub energy_joules: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<String>,
}

#[derive(Debug)]
pub struct MotorSim {
    component_id: &'static str,
    spec: ElectricalSpec,
    phase: MotorPhase,
    current_amps: f64,
    health: f64,
    runtime_sec: f64,
    velocity: f64,
    max_velocity: f64,
    active: bool,
}

impl MotorSim {
    pub fn new(component_id: &'static str, spec: ElectricalSpec) -> Self {
        Self {
            component_id,
            spec,
            phase: MotorPhase::Idle,
            current_amps: spec.idle_amps,
            health: 1.0,
            runtime_sec: 0.0,
            velocity: 0.0,
            max_velocity: 100.0,
            active: false,
        }
    }

    pub fn component_id(&self) -> &'static str {
        self.component_id
    }

    pub fn phase(&self) -> MotorPhase {
        self.phase
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn health(&self) -> f64 {
        self.health
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        if self.phase == MotorPhase::Idle {
            self.phase = MotorPhase::Startup;
        }
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        if self.phase != MotorPhase::Idle {
            self.phase = MotorPhase::Stopping;
        }
        self.active = false;
    }

    /// Hard stop: motor enable dropped immediately (emergency path).
    pub fn cut_power(&mut self) {
        self.phase = MotorPhase::Idle;
        self.active = false;
        self.velocity = 0.0;
        self.current_amps = self.spec.idle_amps;
    }

    /// Reset clears wear bookkeeping back to factory state. Used only by
    /// tests and explicit maintenance, never by RESET commands, which must
    /// preserve health and runtime.
    pub fn refurbish(&mut self) {
        self.cut_power();
        self.health = 1.0;
        self.runtime_sec = 0.0;
    }

    pub fn tick(&mut self, dt_secs: f64, rng: &mut StdRng) -> MotorSnapshot {
        let mut anomaly = None;

        match self.phase {
            MotorPhase::Startup => {
                // Inrush lasts one tick.
                self.current_amps = self.spec.startup_amps;
                self.velocity = (self.velocity + self.max_velocity * dt_secs * 4.0)
                    .min(self.max_velocity);
                self.phase = MotorPhase::Running;
            }
            MotorPhase::Running => {
                self.current_amps = self.spec.running_amps;
                self.velocity = self.max_velocity;

                if self.health < HEALTH_ANOMALY_THRESHOLD
                    && rng.gen_bool(ANOMALY_PROBABILITY)
                {
                    self.current_amps = self.spec.anomaly_amps;
                    anomaly = Some(format!("CURRENT_ANOMALY {}", self.component_id));
                }
                if self.health < HEALTH_STOPPAGE_THRESHOLD
                    && rng.gen_bool(STOPPAGE_PROBABILITY)
                {
                    self.phase = MotorPhase::Stopping;
                    anomaly = Some(format!("MICRO_STOPPAGE {}", self.component_id));
                }
            }
            MotorPhase::Stopping => {
                self.velocity = (self.velocity - self.max_velocity * dt_secs * 2.0).max(0.0);
                self.current_amps = (self.current_amps * 0.5).max(self.spec.idle_amps);
                if self.velocity <= 0.0 {
                    // A micro-stoppage restarts on its own; a commanded stop
                    // stays down.
                    if self.active {
                        self.phase = MotorPhase::Startup;
                    } else {
                        self.phase = MotorPhase::Idle;
                        self.current_amps = self.spec.idle_amps;
                    }
                }
            }
            MotorPhase::Idle => {
                self.current_amps = self.spec.idle_amps;
                self.velocity = 0.0;
            }
        }

        if self.phase != MotorPhase::Idle {
            self.health = (self.health - WEAR_PER_TICK).max(0.0);
            self.runtime_sec += dt_secs;
        }

        let power_watts = self.current_amps * self.spec.voltage;
        let energy_joules = power_watts * dt_secs;

        MotorSnapshot {
            component_id: self.component_id.to_string(),
            phase: self.phase,
            current_amps: self.current_amps,
            voltage: self.spec.voltage,
            health_score: self.health,
            accumulated_runtime_sec: self.runtime_sec,
            is_active: self.active,
            velocity: self.velocity,
            power_watts,
            energy_joules,
            anomaly,
        }
    }

    #[cfg(test)]
    pub fn set_health(&mut self, health: f64) {
        self.health = health;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const DT: f64 = 0.1;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn startup_draws_inrush_for_one_tick() {
        let mut rng = rng();
        let mut m = MotorSim::new("HBW_X", ElectricalSpec::default());
        m.activate();
        let s1 = m.tick(DT, &mut rng);
        assert_eq!(s1.phase, MotorPhase::Running);
        assert_eq!(s1.current_amps, 2.5);
        let s2 = m.tick(DT, &mut rng);
        assert_eq!(s2.current_amps, 1.2);
    }

    #[test]
    fn stop_decays_to_idle() {
        let mut rng = rng();
        let mut m = MotorSim::new("HBW_X", ElectricalSpec::default());
        m.activate();
        for _ in 0..3 {
            m.tick(DT, &mut rng);
        }
        m.deactivate();
        let mut ticks = 0;
        while m.phase() != MotorPhase::Idle {
            m.tick(DT, &mut rng);
            ticks += 1;
            assert!(ticks < 20, "motor never reached IDLE");
        }
        let s = m.tick(DT, &mut rng);
        assert_eq!(s.current_amps, 0.05);
        assert_eq!(s.velocity, 0.0);
    }

    #[test]
    fn wear_is_fixed_per_active_tick() {
        let mut rng = rng();
        let mut m = MotorSim::new("CONV_M1", ElectricalSpec::default());
        m.activate();
        for _ in 0..100 {
            m.tick(DT, &mut rng);
        }
        let expected = 1.0 - 100.0 * WEAR_PER_TICK;
        assert!((m.health() - expected).abs() < 1e-9);
        assert!((m.tick(DT, &mut rng).accumulated_runtime_sec - 10.1).abs() < 1e-6);
    }

    #[test]
    fn idle_motor_does_not_wear() {
        let mut rng = rng();
        let mut m = MotorSim::new("CONV_M1", ElectricalSpec::default());
        for _ in 0..100 {
            m.tick(DT, &mut rng);
        }
        assert_eq!(m.health(), 1.0);
    }

    #[test]
    fn degraded_motor_emits_anomalies() {
        let mut rng = rng();
        let mut m = MotorSim::new("VGR_X", ElectricalSpec::default());
        m.set_health(0.7);
        m.activate();
        let mut anomalies = 0;
        for _ in 0..500 {
            if m.tick(DT, &mut rng).anomaly.is_some() {
                anomalies += 1;
            }
        }
        assert!(anomalies > 0, "no anomaly in 500 degraded ticks");
    }

    #[test]
    fn severely_degraded_motor_micro_stops_and_recovers() {
        let mut rng = rng();
        let mut m = MotorSim::new("VGR_X", ElectricalSpec::default());
        m.set_health(0.4);
        m.activate();
        let mut stoppages = 0;
        for _ in 0..1000 {
            let s = m.tick(DT, &mut rng);
            if s.anomaly.as_deref().is_some_and(|a| a.starts_with("MICRO_STOPPAGE")) {
                stoppages += 1;
            }
        }
        assert!(stoppages > 0, "no micro-stoppage in 1000 ticks at health 0.4");
        // Still commanded on: the motor restarts after each stoppage.
        assert!(m.is_active());
    }

    #[test]
    fn power_is_voltage_times_current() {
        let mut rng = rng();
        let mut m = MotorSim::new("HBW_Y", ElectricalSpec::default());
        m.activate();
        m.tick(DT, &mut rng);
        let s = m.tick(DT, &mut rng);
        assert!((s.power_watts - 1.2 * 24.0).abs() < 1e-9);
        assert!((s.energy_joules - s.power_watts * DT).abs() < 1e-9);
    }
}
