use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row letters of the storage rack.
pub const SLOT_ROWS: [char; 3] = ['A', 'B', 'C'];
/// Column numbers of the storage rack.
pub const SLOT_COLS: [u8; 3] = [1, 2, 3];

/// Storage slot identifier: row letter A-C plus column 1-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotName {
    pub row: char,
    pub col: u8,
}

impl SlotName {
    pub fn parse(s: &str) -> Option<Self> {
        let mut chars = s.chars();
        let row = chars.next()?;
        let col = chars.next()?.to_digit(10)? as u8;
        if chars.next().is_some() || !SLOT_ROWS.contains(&row) || !SLOT_COLS.contains(&col) {
            return None;
        }
        Some(Self { row, col })
    }

    /// All nine slots in rack order (A1, A2, ... C3).
    pub fn all() -> impl Iterator<Item = SlotName> {
        SLOT_ROWS
            .iter()
            .flat_map(|&row| SLOT_COLS.iter().map(move |&col| SlotName { row, col }))
    }

    /// Physical rack coordinates in mm, fixed configuration.
    pub fn coordinates(&self) -> (f64, f64) {
        let x = self.col as f64 * 100.0;
        let y = match self.row {
            'A' => 100.0,
            'B' => 200.0,
            _ => 300.0,
        };
        (x, y)
    }
}

impl std::fmt::Display for SlotName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.row, self.col)
    }
}

impl TryFrom<String> for SlotName {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        SlotName::parse(&s).ok_or_else(|| format!("invalid slot name: {s}"))
    }
}

impl From<SlotName> for String {
    fn from(s: SlotName) -> String {
        s.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceId {
    Hbw,
    Vgr,
    Conveyor,
}

impl DeviceId {
    pub const ALL: [DeviceId; 3] = [DeviceId::Hbw, DeviceId::Vgr, DeviceId::Conveyor];

    /// Topic segment, lower case as on the wire.
    pub fn topic_segment(&self) -> &'static str {
        match self {
            DeviceId::Hbw => "hbw",
            DeviceId::Vgr => "vgr",
            DeviceId::Conveyor => "conveyor",
        }
    }

    pub fn from_topic_segment(s: &str) -> Option<Self> {
        match s {
            "hbw" => Some(DeviceId::Hbw),
            "vgr" => Some(DeviceId::Vgr),
            "conveyor" => Some(DeviceId::Conveyor),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceId::Hbw => "HBW",
            DeviceId::Vgr => "VGR",
            DeviceId::Conveyor => "CONVEYOR",
        };
        f.write_str(s)
    }
}

/// Set of devices a command occupies while in flight. Two commands whose
/// sets intersect must not run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceSet(u8);

impl DeviceSet {
    pub const EMPTY: DeviceSet = DeviceSet(0);
    pub const ALL: DeviceSet = DeviceSet(0b111);

    pub fn single(device: DeviceId) -> Self {
        DeviceSet(1 << device as u8)
    }

    pub fn with(self, device: DeviceId) -> Self {
        DeviceSet(self.0 | (1 << device as u8))
    }

    pub fn union(self, other: DeviceSet) -> Self {
        DeviceSet(self.0 | other.0)
    }

    pub fn intersects(self, other: DeviceSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, device: DeviceId) -> bool {
        self.0 & (1 << device as u8) != 0
    }

    pub fn devices(self) -> impl Iterator<Item = DeviceId> {
        DeviceId::ALL.into_iter().filter(move |d| self.contains(*d))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Zone {
    Hbw,
    Conveyor,
    Vgr,
    Oven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CookieFlavor {
    Choco,
    Vanilla,
    Strawberry,
}

impl CookieFlavor {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CHOCO" => Some(CookieFlavor::Choco),
            "VANILLA" => Some(CookieFlavor::Vanilla),
            "STRAWBERRY" => Some(CookieFlavor::Strawberry),
            _ => None,
        }
    }
}

/// Cookie lifecycle. Status only ever moves forward through this sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CookieStatus {
    RawDough,
    Baked,
    Packaged,
    Shipped,
}

impl CookieStatus {
    pub fn can_advance_to(self, next: CookieStatus) -> bool {
        next > self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Carrier {
    pub id: i64,
    pub zone: Zone,
    pub locked: bool,
    /// Command currently holding the lock, if any.
    pub locked_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub batch_uuid: String,
    pub carrier_id: i64,
    pub flavor: CookieFlavor,
    pub status: CookieStatus,
    pub expiry_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One rack position. The coordinates are immutable configuration; only the
/// carrier reference changes over the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub name: SlotName,
    pub x_pos: f64,
    pub y_pos: f64,
    pub carrier_id: Option<i64>,
}

impl Slot {
    pub fn seeded(name: SlotName) -> Self {
        let (x_pos, y_pos) = name.coordinates();
        Slot { name, x_pos, y_pos, carrier_id: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Store,
    Retrieve,
    Process,
    Move,
    Reset,
    EmergencyStop,
}

impl CommandKind {
    /// Devices the command occupies while executing. Commands on disjoint
    /// sets may run concurrently.
    pub fn device_set(&self, params: &CommandParams) -> DeviceSet {
        match self {
            CommandKind::Store | CommandKind::Retrieve => DeviceSet::single(DeviceId::Hbw),
            CommandKind::Process => DeviceSet::ALL,
            CommandKind::Move => params
                .device
                .map(DeviceSet::single)
                .unwrap_or(DeviceSet::single(DeviceId::Hbw)),
            CommandKind::Reset => DeviceSet::ALL,
            // Never queues behind running work: it exists to kill it.
            CommandKind::EmergencyStop => DeviceSet::EMPTY,
        }
    }

    /// RESET outranks everything else in the claim order.
    pub fn priority(&self) -> u8 {
        match self {
            CommandKind::Reset | CommandKind::EmergencyStop => 0,
            _ => 1,
        }
    }
}

/// Linear command lifecycle. Terminal rows are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    pub fn may_transition_to(&self, next: CommandStatus) -> bool {
        matches!(
            (self, next),
            (CommandStatus::Pending, CommandStatus::InProgress)
                | (CommandStatus::InProgress, CommandStatus::Completed)
                | (CommandStatus::InProgress, CommandStatus::Failed)
        )
    }
}

/// Opaque parameter blob carried by a queue row. Unknown fields are kept
/// intact so older rows survive schema growth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<CookieFlavor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<[f64; 3]>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: i64,
    pub kind: CommandKind,
    pub target_slot: Option<SlotName>,
    pub params: CommandParams,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub result: Option<String>,
}

impl CommandRow {
    pub fn device_set(&self) -> DeviceSet {
        self.kind.device_set(&self.params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HardwareStatus {
    Idle,
    Moving,
    Error,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub device: Option<DeviceId>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub id: i64,
    pub device: DeviceId,
    pub metric: String,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergySample {
    pub id: i64,
    pub device: DeviceId,
    pub joules: f64,
    pub voltage: f64,
    pub power_watts: f64,
    pub timestamp: DateTime<Utc>,
}

/// Static component specification, seeded at startup. The safety monitor
/// checks live current draw against `spec_max_current`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub id: String,
    pub name: String,
    pub device: DeviceId,
    pub spec_voltage: f64,
    pub spec_max_current: f64,
}

pub fn component_registry() -> Vec<ComponentSpec> {
    let spec = |id: &str, name: &str, device, max_current| ComponentSpec {
        id: id.to_string(),
        name: name.to_string(),
        device,
        spec_voltage: 24.0,
        spec_max_current: max_current,
    };
    vec![
        spec("HBW_X", "HBW X-Axis Motor", DeviceId::Hbw, 3.0),
        spec("HBW_Y", "HBW Y-Axis Motor", DeviceId::Hbw, 3.0),
        spec("HBW_Z", "HBW Fork Motor", DeviceId::Hbw, 2.5),
        spec("CONV_M1", "Conveyor Belt Motor", DeviceId::Conveyor, 4.0),
        spec("VGR_X", "VGR X-Axis Motor", DeviceId::Vgr, 2.5),
        spec("VGR_Y", "VGR Y-Axis Motor", DeviceId::Vgr, 2.5),
        spec("VGR_Z", "VGR Z-Axis Motor", DeviceId::Vgr, 2.0),
        spec("VGR_COMP", "VGR Vacuum Compressor", DeviceId::Vgr, 5.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_name_parse_round_trip() {
        for slot in SlotName::all() {
            let parsed = SlotName::parse(&slot.to_string()).unwrap();
            assert_eq!(parsed, slot);
        }
        assert!(SlotName::parse("D1").is_none());
        assert!(SlotName::parse("A4").is_none());
        assert!(SlotName::parse("A11").is_none());
        assert!(SlotName::parse("").is_none());
    }

    #[test]
    fn slot_order_is_rack_order() {
        let slots: Vec<String> = SlotName::all().map(|s| s.to_string()).collect();
        assert_eq!(slots[0], "A1");
        assert_eq!(slots[8], "C3");
        let mut sorted = slots.clone();
        sorted.sort();
        assert_eq!(slots, sorted);
    }

    #[test]
    fn cookie_status_only_moves_forward() {
        assert!(CookieStatus::RawDough.can_advance_to(CookieStatus::Baked));
        assert!(CookieStatus::Baked.can_advance_to(CookieStatus::Shipped));
        assert!(!CookieStatus::Baked.can_advance_to(CookieStatus::RawDough));
        assert!(!CookieStatus::Shipped.can_advance_to(CookieStatus::Shipped));
    }

    #[test]
    fn command_status_transitions_are_linear() {
        assert!(CommandStatus::Pending.may_transition_to(CommandStatus::InProgress));
        assert!(CommandStatus::InProgress.may_transition_to(CommandStatus::Failed));
        assert!(!CommandStatus::Completed.may_transition_to(CommandStatus::InProgress));
        assert!(!CommandStatus::Pending.may_transition_to(CommandStatus::Completed));
    }

    #[test]
    fn device_sets_intersect() {
        let hbw = DeviceSet::single(DeviceId::Hbw);
        let process = DeviceSet::ALL;
        let vgr = DeviceSet::single(DeviceId::Vgr);
        assert!(hbw.intersects(process));
        assert!(!hbw.intersects(vgr));
        assert!(process.intersects(vgr));
    }
}
