//! Message bus adapter.
//!
//! Topic grammar is fixed: `stf/<device>/cmd/<action>` for commands,
//! `stf/<device>/status` for periodic snapshots, `stf/global/*` for
//! broadcast events. Payloads are self-describing JSON objects; the typed
//! structs in this module are the per-topic schema, enforced here at the
//! adapter boundary rather than inside the simulators.

use crate::error::BusError;
use crate::model::DeviceId;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const TOPIC_MAX: usize = 64;
const BROKER_CHANNEL_CAPACITY: usize = 1024;

pub type TopicBuf = ArrayString<TOPIC_MAX>;

pub fn cmd_topic(device: DeviceId, action: &str) -> TopicBuf {
    let mut t = TopicBuf::new();
    let _ = t.try_push_str("stf/");
    let _ = t.try_push_str(device.topic_segment());
    let _ = t.try_push_str("/cmd/");
    let _ = t.try_push_str(action);
    t
}

pub fn status_topic(device: DeviceId) -> TopicBuf {
    let mut t = TopicBuf::new();
    let _ = t.try_push_str("stf/");
    let _ = t.try_push_str(device.topic_segment());
    let _ = t.try_push_str("/status");
    t
}

pub fn global_topic(event: &str) -> TopicBuf {
    let mut t = TopicBuf::new();
    let _ = t.try_push_str("stf/global/");
    let _ = t.try_push_str(event);
    t
}

/// MQTT-style matching: `+` matches one level, `#` the remainder.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('/');
    let mut top = topic.split('/');
    loop {
        match (pat.next(), top.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A published message. Subscribers share one allocation per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub publisher: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Per-topic command schemas
// ---------------------------------------------------------------------------

/// `stf/<device>/cmd/move` — absent axes keep their current target.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MovePayload {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub z: Option<f64>,
}

/// `stf/hbw/cmd/gripper`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GripperPayload {
    pub action: String,
}

/// `stf/vgr/cmd/vacuum`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VacuumPayload {
    pub activate: bool,
}

/// `stf/conveyor/cmd/belt`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeltPayload {
    pub action: String,
    #[serde(default)]
    pub direction: Option<i8>,
}

/// `stf/conveyor/cmd/object` — carrier handoff onto / off the belt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectPayload {
    pub action: String,
    #[serde(default)]
    pub position_mm: Option<f64>,
}

/// Decoded device command. Unknown actions or malformed payloads are
/// rejected here and never reach a simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Move { x: Option<f64>, y: Option<f64>, z: Option<f64> },
    Gripper { closed: bool },
    Vacuum { on: bool },
    BeltStart { direction: i8 },
    BeltStop,
    PlaceObject { position_mm: f64 },
    RemoveObject,
    Stop,
    Reset,
}

impl DeviceCommand {
    /// Parse the `<action>` topic segment plus payload against its schema.
    pub fn parse(action: &str, payload: &serde_json::Value) -> Result<Self, BusError> {
        let schema_err = |reason: String| BusError::SchemaViolation {
            topic: action.to_string(),
            reason,
        };
        match action {
            "move" => {
                let p: MovePayload =
                    serde_json::from_value(payload.clone()).map_err(|e| schema_err(e.to_string()))?;
                if p.x.is_none() && p.y.is_none() && p.z.is_none() {
                    return Err(schema_err("move requires at least one axis target".into()));
                }
                Ok(DeviceCommand::Move { x: p.x, y: p.y, z: p.z })
            }
            "gripper" => {
                let p: GripperPayload =
                    serde_json::from_value(payload.clone()).map_err(|e| schema_err(e.to_string()))?;
                match p.action.as_str() {
                    "close" | "extend" => Ok(DeviceCommand::Gripper { closed: true }),
                    "open" | "retract" => Ok(DeviceCommand::Gripper { closed: false }),
                    other => Err(schema_err(format!("unknown gripper action `{other}`"))),
                }
            }
            "vacuum" => {
                let p: VacuumPayload =
                    serde_json::from_value(payload.clone()).map_err(|e| schema_err(e.to_string()))?;
                Ok(DeviceCommand::Vacuum { on: p.activate })
            }
            "belt" => {
                let p: BeltPayload =
                    serde_json::from_value(payload.clone()).map_err(|e| schema_err(e.to_string()))?;
                match p.action.as_str() {
                    "start" => Ok(DeviceCommand::BeltStart {
                        direction: if p.direction.unwrap_or(1) < 0 { -1 } else { 1 },
                    }),
                    "stop" => Ok(DeviceCommand::BeltStop),
                    other => Err(schema_err(format!("unknown belt action `{other}`"))),
                }
            }
            "object" => {
                let p: ObjectPayload =
                    serde_json::from_value(payload.clone()).map_err(|e| schema_err(e.to_string()))?;
                match p.action.as_str() {
                    "place" => Ok(DeviceCommand::PlaceObject {
                        position_mm: p.position_mm.unwrap_or(0.0),
                    }),
                    "remove" => Ok(DeviceCommand::RemoveObject),
                    other => Err(schema_err(format!("unknown object action `{other}`"))),
                }
            }
            "stop" => Ok(DeviceCommand::Stop),
            "reset" => Ok(DeviceCommand::Reset),
            other => Err(BusError::InvalidTopic(format!("unknown command action `{other}`"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Broker + adapter
// ---------------------------------------------------------------------------

/// In-process broker: one fan-out channel, subscribers filter by pattern.
/// Stands in for the external MQTT broker; the adapter below treats it the
/// same way it would treat a socket.
#[derive(Clone)]
pub struct InProcBroker {
    tx: broadcast::Sender<Arc<BusMessage>>,
}

impl InProcBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROKER_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for InProcBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side adapter. Survives broker disconnects by buffering up to a
/// bounded number of outbound messages and flushing them in order on
/// reconnect; overflow drops the oldest with a logged warning.
#[derive(Clone)]
pub struct BusAdapter {
    client_id: String,
    tx: broadcast::Sender<Arc<BusMessage>>,
    connected: Arc<AtomicBool>,
    buffer: Arc<Mutex<VecDeque<Arc<BusMessage>>>>,
    buffer_depth: usize,
    dropped: Arc<AtomicU64>,
}

impl BusAdapter {
    pub fn connect(broker: &InProcBroker, client_id: &str, buffer_depth: usize) -> Self {
        Self {
            client_id: client_id.to_string(),
            tx: broker.tx.clone(),
            connected: Arc::new(AtomicBool::new(true)),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            buffer_depth,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Simulate losing / regaining the broker. Reconnecting flushes the
    /// offline buffer in publish order.
    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Relaxed);
        if up {
            let queued: Vec<Arc<BusMessage>> = {
                let mut buf = self.buffer.lock().expect("bus buffer poisoned");
                buf.drain(..).collect()
            };
            if !queued.is_empty() {
                debug!(
                    target: "stf_twin::bus",
                    client = %self.client_id,
                    count = queued.len(),
                    "flushing offline buffer"
                );
            }
            for msg in queued {
                let _ = self.tx.send(msg);
            }
        }
    }

    pub fn publish<P: Serialize>(&self, topic: &str, payload: &P) -> Result<(), BusError> {
        let msg = Arc::new(BusMessage {
            topic: topic.to_string(),
            publisher: self.client_id.clone(),
            payload: serde_json::to_value(payload)?,
        });
        if !self.is_connected() {
            let mut buf = self.buffer.lock().expect("bus buffer poisoned");
            if buf.len() >= self.buffer_depth {
                buf.pop_front();
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    target: "stf_twin::bus",
                    client = %self.client_id,
                    dropped = n,
                    "offline buffer full, dropped oldest message"
                );
            }
            buf.push_back(msg);
            return Ok(());
        }
        // No subscribers is not an error on a pub/sub bus.
        let _ = self.tx.send(msg);
        Ok(())
    }

    pub fn subscribe(&self, pattern: &str) -> BusSubscription {
        BusSubscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

pub struct BusSubscription {
    pattern: String,
    rx: broadcast::Receiver<Arc<BusMessage>>,
}

impl BusSubscription {
    /// Next message matching this subscription's pattern. Returns `None`
    /// once the broker is gone. A lagged subscriber skips to the oldest
    /// retained message; status consumers tolerate this because snapshots
    /// are self-contained.
    pub async fn recv(&mut self) -> Option<Arc<BusMessage>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if topic_matches(&self.pattern, &msg.topic) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "stf_twin::bus", pattern = %self.pattern, skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<BusMessage>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if topic_matches(&self.pattern, &msg.topic) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
