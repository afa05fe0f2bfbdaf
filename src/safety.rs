//! Safety management: the cooperative emergency latch and the health
//! monitor that watches every status snapshot for wear anomalies,
//! overcurrent, and safety-floor breaches.

use crate::bus::{global_topic, BusAdapter};
use crate::devices::DeviceSnapshot;
use crate::hub::BroadcastHub;
use crate::model::{AlertSeverity, ComponentSpec, DeviceId, LogLevel};
use crate::store::SharedStore;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const MAX_SAFETY_EVENTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyEvent {
    EmergencyLatched,
    Resumed,
    HealthWarning,
    HealthCritical,
    Overcurrent,
    MicroStoppage,
}

#[derive(Debug, Clone, Copy)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub ts_ms: u64,
    pub device: Option<DeviceId>,
}

/// Shared emergency latch. While latched the executor claims only RESET
/// rows and every device ignores motion commands.
#[derive(Clone)]
pub struct SafetyHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl SafetyHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: std::sync::Arc::new(tx) }
    }

    pub fn latch(&self) {
        if !*self.tx.borrow() {
            warn!(target: "stf_twin::safety", "emergency latch SET");
        }
        let _ = self.tx.send(true);
    }

    /// Operator resume. Recorded by the caller; the latch itself only flips.
    pub fn clear(&self) {
        if *self.tx.borrow() {
            info!(target: "stf_twin::safety", "emergency latch cleared (resume)");
        }
        let _ = self.tx.send(false);
    }

    pub fn is_latched(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for SafetyHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-motor health band, used to alert once per crossing instead of every
/// tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HealthBand {
    Nominal,
    Worn,
    Degraded,
    Breached,
}

fn band_of(health: f64, floor: f64) -> HealthBand {
    if health < floor {
        HealthBand::Breached
    } else if health < 0.5 {
        HealthBand::Degraded
    } else if health < 0.8 {
        HealthBand::Worn
    } else {
        HealthBand::Nominal
    }
}

pub struct SafetyMonitor {
    store: SharedStore,
    bus: BusAdapter,
    hub: BroadcastHub,
    handle: SafetyHandle,
    safety_floor: f64,
    specs: HashMap<String, ComponentSpec>,
    bands: HashMap<String, HealthBand>,
    history: heapless::Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
}

impl SafetyMonitor {
    pub async fn new(
        store: SharedStore,
        bus: BusAdapter,
        hub: BroadcastHub,
        handle: SafetyHandle,
        safety_floor: f64,
    ) -> Self {
        let specs = store
            .component_specs()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        Self {
            store,
            bus,
            hub,
            handle,
            safety_floor,
            specs,
            bands: HashMap::new(),
            history: heapless::Vec::new(),
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        let mut statuses = self.bus.subscribe("stf/+/status");
        tokio::spawn(async move {
            while let Some(msg) = statuses.recv().await {
                let snapshot: DeviceSnapshot = match serde_json::from_value(msg.payload.clone()) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                self.inspect(&snapshot).await;
            }
        })
    }

    fn record(&mut self, event: SafetyEvent, ts_ms: u64, device: Option<DeviceId>) {
        let rec = SafetyEventRecord { event, ts_ms, device };
        if self.history.push(rec).is_err() {
            self.history.remove(0);
            let _ = self.history.push(rec);
        }
    }

    async fn raise(
        &mut self,
        event: SafetyEvent,
        severity: AlertSeverity,
        alert_type: &str,
        title: &str,
        message: &str,
        snapshot: &DeviceSnapshot,
    ) {
        self.record(event, snapshot.ts_ms, Some(snapshot.device));
        if let Ok(alert) = self
            .store
            .append_alert(alert_type, severity, title, message, Some(snapshot.device))
            .await
        {
            self.hub.publish_alert(snapshot.ts_ms, &alert);
        }
    }

    async fn inspect(&mut self, snapshot: &DeviceSnapshot) {
        for anomaly in snapshot.anomalies.clone() {
            if anomaly.starts_with("MICRO_STOPPAGE") {
                self.raise(
                    SafetyEvent::MicroStoppage,
                    AlertSeverity::High,
                    "MICRO_STOPPAGE",
                    "Motor micro-stoppage",
                    &anomaly,
                    snapshot,
                )
                .await;
            } else {
                self.raise(
                    SafetyEvent::Overcurrent,
                    AlertSeverity::Medium,
                    "CURRENT_ANOMALY",
                    "Motor current anomaly",
                    &anomaly,
                    snapshot,
                )
                .await;
            }
        }

        // One pass over the motors: band crossings and spec overcurrent.
        for motor in snapshot.motors.clone() {
            let prev = self
                .bands
                .get(motor.component_id.as_str())
                .copied()
                .unwrap_or(HealthBand::Nominal);
            let band = band_of(motor.health_score, self.safety_floor);
            if band > prev {
                self.bands.insert(motor.component_id.clone(), band);
                match band {
                    HealthBand::Worn => {
                        self.raise(
                            SafetyEvent::HealthWarning,
                            AlertSeverity::Medium,
                            "HEALTH_WARNING",
                            "Motor health below 0.8",
                            &format!("{} health {:.4}", motor.component_id, motor.health_score),
                            snapshot,
                        )
                        .await;
                    }
                    HealthBand::Degraded => {
                        self.raise(
                            SafetyEvent::HealthCritical,
                            AlertSeverity::High,
                            "HEALTH_CRITICAL",
                            "Motor health below 0.5",
                            &format!("{} health {:.4}", motor.component_id, motor.health_score),
                            snapshot,
                        )
                        .await;
                    }
                    HealthBand::Breached => {
                        error!(
                            target: "stf_twin::safety",
                            component = %motor.component_id,
                            health = motor.health_score,
                            "health below safety floor, latching emergency"
                        );
                        self.raise(
                            SafetyEvent::EmergencyLatched,
                            AlertSeverity::Critical,
                            "SAFETY_FLOOR",
                            "Health below safety floor",
                            &format!(
                                "{} health {:.4} < floor {:.2}",
                                motor.component_id, motor.health_score, self.safety_floor
                            ),
                            snapshot,
                        )
                        .await;
                        self.trigger_emergency().await;
                    }
                    HealthBand::Nominal => {}
                }
            }

            if let Some(max_current) = self
                .specs
                .get(motor.component_id.as_str())
                .map(|s| s.spec_max_current)
            {
                if motor.current_amps > max_current && band == HealthBand::Nominal {
                    // Overcurrent on a healthy motor gets its own alert; worn
                    // motors already alert through the anomaly path.
                    self.raise(
                        SafetyEvent::Overcurrent,
                        AlertSeverity::High,
                        "OVERCURRENT",
                        "Current above component spec",
                        &format!(
                            "{} drew {:.2} A (spec max {:.2} A)",
                            motor.component_id, motor.current_amps, max_current
                        ),
                        snapshot,
                    )
                    .await;
                }
            }
        }
    }

    async fn trigger_emergency(&mut self) {
        self.handle.latch();
        let _ = self
            .bus
            .publish(global_topic("cmd/emergency_stop").as_str(), &json!({"source": "SAFETY"}));
        let _ = self
            .store
            .append_log(LogLevel::Critical, "SAFETY", "emergency latched by safety monitor")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_order_by_severity() {
        assert!(band_of(0.05, 0.1) > band_of(0.4, 0.1));
        assert!(band_of(0.4, 0.1) > band_of(0.7, 0.1));
        assert!(band_of(0.7, 0.1) > band_of(0.9, 0.1));
        assert_eq!(band_of(0.85, 0.1), HealthBand::Nominal);
    }

    #[tokio::test]
    async fn latch_round_trip() {
        let handle = SafetyHandle::new();
        let mut watcher = handle.subscribe();
        assert!(!handle.is_latched());
        handle.latch();
        assert!(handle.is_latched());
        assert!(watcher.changed().await.is_ok());
        assert!(*watcher.borrow());
        handle.clear();
        assert!(!handle.is_latched());
    }
}
