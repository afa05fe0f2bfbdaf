//! Durable store seam.
//!
//! The relational store itself is an external collaborator; this module
//! defines the operations the twin needs from it and ships the in-memory
//! engine the single-cell server runs on. Every method is one atomic unit:
//! the in-memory engine takes a single lock per call, which is how the
//! linearisable claim and the multi-row terminal transaction of the queue
//! contract are realised here.

use crate::error::StoreError;
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Count-based retention for the append-only tables. Unbounded retention is
/// opt-in through [`Retention::unbounded`].
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub telemetry_rows: usize,
    pub energy_rows: usize,
    pub alert_rows: usize,
    pub log_rows: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            telemetry_rows: 10_000,
            energy_rows: 10_000,
            alert_rows: 1_000,
            log_rows: 1_000,
        }
    }
}

impl Retention {
    pub fn unbounded() -> Self {
        Self {
            telemetry_rows: usize::MAX,
            energy_rows: usize::MAX,
            alert_rows: usize::MAX,
            log_rows: usize::MAX,
        }
    }
}

/// Row updates applied together with a terminal command transition, so
/// observers never see a half-updated inventory.
#[derive(Debug, Clone)]
pub enum Mutation {
    CreateCookieInSlot {
        slot: SlotName,
        flavor: CookieFlavor,
        batch_uuid: String,
    },
    ShipAndClearSlot {
        slot: SlotName,
    },
    SetCookieStatus {
        slot: SlotName,
        status: CookieStatus,
    },
}

pub type SharedStore = Arc<dyn TwinStore>;

#[async_trait]
pub trait TwinStore: Send + Sync {
    // -- queue ------------------------------------------------------------
    async fn enqueue_command(
        &self,
        kind: CommandKind,
        target_slot: Option<SlotName>,
        params: CommandParams,
    ) -> Result<CommandRow, StoreError>;

    /// Atomically claim the single oldest eligible PENDING row: RESET rows
    /// first, then `created_at`, ties on smaller id. A row is eligible when
    /// its device set is disjoint from every IN_PROGRESS row's set. Under
    /// an emergency latch only RESET may be claimed.
    async fn claim_next(
        &self,
        executor_id: &str,
        emergency: bool,
    ) -> Result<Option<CommandRow>, StoreError>;

    /// Record an FSM progress event for a running command.
    async fn record_progress(&self, id: i64, note: &str) -> Result<(), StoreError>;

    /// Terminal transition: command row plus all affected cookie / slot /
    /// carrier rows in one transaction.
    async fn finish_command(
        &self,
        id: i64,
        status: CommandStatus,
        result: &str,
        mutations: Vec<Mutation>,
    ) -> Result<CommandRow, StoreError>;

    async fn get_command(&self, id: i64) -> Result<CommandRow, StoreError>;
    async fn list_commands(&self, limit: usize) -> Result<Vec<CommandRow>, StoreError>;

    /// Fail every IN_PROGRESS row (emergency stop). Returns the rows that
    /// were transitioned so the caller can fan them out.
    async fn fail_all_in_flight(&self, reason: &str) -> Result<Vec<CommandRow>, StoreError>;

    // -- inventory --------------------------------------------------------
    async fn slots(&self) -> Result<Vec<Slot>, StoreError>;
    async fn find_empty_slot(&self) -> Result<Option<SlotName>, StoreError>;
    /// Lowest slot name holding a RAW_DOUGH cookie, optionally filtered by
    /// flavor.
    async fn find_raw_dough_slot(
        &self,
        flavor: Option<CookieFlavor>,
    ) -> Result<Option<SlotName>, StoreError>;
    async fn cookie_in_slot(&self, slot: SlotName) -> Result<Option<Cookie>, StoreError>;

    async fn lock_carrier(&self, slot: SlotName, command_id: i64) -> Result<i64, StoreError>;
    async fn unlock_carrier(&self, carrier_id: i64, command_id: i64) -> Result<(), StoreError>;
    async fn update_carrier_zone(&self, carrier_id: i64, zone: Zone) -> Result<(), StoreError>;
    async fn unlock_all_for_command(&self, command_id: i64) -> Result<(), StoreError>;

    // -- device + append-only tables --------------------------------------
    async fn record_device_snapshot(
        &self,
        device: DeviceId,
        snapshot: serde_json::Value,
    ) -> Result<(), StoreError>;
    async fn device_snapshots(&self) -> Result<Vec<serde_json::Value>, StoreError>;

    async fn append_telemetry(
        &self,
        device: DeviceId,
        metric: &str,
        value: f64,
        unit: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn append_energy(
        &self,
        device: DeviceId,
        joules: f64,
        voltage: f64,
        power_watts: f64,
    ) -> Result<(), StoreError>;
    async fn append_alert(
        &self,
        alert_type: &str,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        device: Option<DeviceId>,
    ) -> Result<Alert, StoreError>;
    async fn append_log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError>;
    async fn logs(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError>;
    async fn component_specs(&self) -> Result<Vec<ComponentSpec>, StoreError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> bool;
}

// ---------------------------------------------------------------------------
// In-memory engine
// ---------------------------------------------------------------------------

struct Inner {
    commands: BTreeMap<i64, CommandRow>,
    slots: BTreeMap<SlotName, Slot>,
    carriers: HashMap<i64, Carrier>,
    cookies: HashMap<String, Cookie>,
    snapshots: HashMap<DeviceId, serde_json::Value>,
    telemetry: VecDeque<TelemetrySample>,
    energy: VecDeque<EnergySample>,
    alerts: VecDeque<Alert>,
    logs: VecDeque<LogEntry>,
    components: Vec<ComponentSpec>,
    next_command_id: i64,
    next_carrier_id: i64,
    next_row_id: i64,
    retention: Retention,
}

impl Inner {
    fn next_row_id(&mut self) -> i64 {
        self.next_row_id += 1;
        self.next_row_id
    }

    fn cookie_for_carrier(&self, carrier_id: i64) -> Option<&Cookie> {
        self.cookies.values().find(|c| c.carrier_id == carrier_id)
    }

    fn cookie_for_slot(&self, slot: SlotName) -> Result<Option<Cookie>, StoreError> {
        let row = self
            .slots
            .get(&slot)
            .ok_or_else(|| StoreError::SlotNotFound(slot.to_string()))?;
        Ok(row
            .carrier_id
            .and_then(|cid| self.cookie_for_carrier(cid))
            .cloned())
    }

    fn push_log(&mut self, level: LogLevel, source: &str, message: &str) {
        let entry = LogEntry {
            id: self.next_row_id(),
            timestamp: Utc::now(),
            level,
            source: source.to_string(),
            message: message.to_string(),
        };
        push_bounded(&mut self.logs, entry, self.retention.log_rows);
    }

    fn apply_mutation(&mut self, command_id: i64, mutation: &Mutation) -> Result<(), StoreError> {
        match mutation {
            Mutation::CreateCookieInSlot { slot, flavor, batch_uuid } => {
                let row = self
                    .slots
                    .get(slot)
                    .ok_or_else(|| StoreError::SlotNotFound(slot.to_string()))?;
                if row.carrier_id.is_some() {
                    return Err(StoreError::Invariant(format!(
                        "slot {slot} already occupied"
                    )));
                }
                self.next_carrier_id += 1;
                let carrier_id = self.next_carrier_id;
                self.carriers.insert(
                    carrier_id,
                    Carrier {
                        id: carrier_id,
                        zone: Zone::Hbw,
                        locked: false,
                        locked_by: None,
                        created_at: Utc::now(),
                    },
                );
                self.cookies.insert(
                    batch_uuid.clone(),
                    Cookie {
                        batch_uuid: batch_uuid.clone(),
                        carrier_id,
                        flavor: *flavor,
                        status: CookieStatus::RawDough,
                        expiry_date: None,
                        created_at: Utc::now(),
                    },
                );
                self.slots.get_mut(slot).expect("slot checked above").carrier_id =
                    Some(carrier_id);
                Ok(())
            }
            Mutation::ShipAndClearSlot { slot } => {
                let row = self
                    .slots
                    .get_mut(slot)
                    .ok_or_else(|| StoreError::SlotNotFound(slot.to_string()))?;
                let carrier_id = row.carrier_id.take().ok_or_else(|| {
                    StoreError::Invariant(format!("slot {slot} is empty"))
                })?;
                if let Some(cookie) = self
                    .cookies
                    .values_mut()
                    .find(|c| c.carrier_id == carrier_id)
                {
                    cookie.status = CookieStatus::Shipped;
                }
                if let Some(carrier) = self.carriers.get_mut(&carrier_id) {
                    carrier.zone = Zone::Vgr;
                    carrier.locked = false;
                    carrier.locked_by = None;
                }
                Ok(())
            }
            Mutation::SetCookieStatus { slot, status } => {
                let carrier_id = self
                    .slots
                    .get(slot)
                    .ok_or_else(|| StoreError::SlotNotFound(slot.to_string()))?
                    .carrier_id
                    .ok_or_else(|| StoreError::Invariant(format!("slot {slot} is empty")))?;
                let cookie = self
                    .cookies
                    .values_mut()
                    .find(|c| c.carrier_id == carrier_id)
                    .ok_or_else(|| {
                        StoreError::Invariant(format!("slot {slot} has no cookie"))
                    })?;
                if !cookie.status.can_advance_to(*status) {
                    return Err(StoreError::Invariant(format!(
                        "cookie {} cannot move {:?} -> {:?} (command {command_id})",
                        cookie.batch_uuid, cookie.status, status
                    )));
                }
                cookie.status = *status;
                Ok(())
            }
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    if cap != usize::MAX && queue.len() >= cap {
        queue.pop_front();
    }
    queue.push_back(item);
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_retention(Retention::default())
    }

    pub fn with_retention(retention: Retention) -> Self {
        let slots = SlotName::all().map(|s| (s, Slot::seeded(s))).collect();
        Self {
            inner: Mutex::new(Inner {
                commands: BTreeMap::new(),
                slots,
                carriers: HashMap::new(),
                cookies: HashMap::new(),
                snapshots: HashMap::new(),
                telemetry: VecDeque::new(),
                energy: VecDeque::new(),
                alerts: VecDeque::new(),
                logs: VecDeque::new(),
                components: component_registry(),
                next_command_id: 0,
                next_carrier_id: 0,
                next_row_id: 0,
                retention,
            }),
        }
    }

    /// Fill every rack slot with a RAW_DOUGH CHOCO cookie, the way the demo
    /// environment is seeded.
    pub async fn seed_demo_inventory(&self) {
        let mut inner = self.inner.lock().await;
        let slots: Vec<SlotName> = SlotName::all().collect();
        for slot in slots {
            let uuid = uuid::Uuid::new_v4().to_string();
            let _ = inner.apply_mutation(
                0,
                &Mutation::CreateCookieInSlot {
                    slot,
                    flavor: CookieFlavor::Choco,
                    batch_uuid: uuid,
                },
            );
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TwinStore for MemoryStore {
    async fn enqueue_command(
        &self,
        kind: CommandKind,
        target_slot: Option<SlotName>,
        params: CommandParams,
    ) -> Result<CommandRow, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_command_id += 1;
        let row = CommandRow {
            id: inner.next_command_id,
            kind,
            target_slot,
            params,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            claimed_by: None,
            result: None,
        };
        inner.commands.insert(row.id, row.clone());
        inner.push_log(
            LogLevel::Info,
            "QUEUE",
            &format!("enqueued {:?} command {}", kind, row.id),
        );
        Ok(row)
    }

    async fn claim_next(
        &self,
        executor_id: &str,
        emergency: bool,
    ) -> Result<Option<CommandRow>, StoreError> {
        let mut inner = self.inner.lock().await;

        let busy: DeviceSet = inner
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::InProgress)
            .fold(DeviceSet::EMPTY, |acc, c| acc.union(c.device_set()));

        let candidate = inner
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::Pending)
            .filter(|c| !emergency || c.kind == CommandKind::Reset)
            .filter(|c| !c.device_set().intersects(busy))
            .min_by_key(|c| (c.kind.priority(), c.created_at, c.id))
            .map(|c| c.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let row = inner.commands.get_mut(&id).expect("candidate id valid");
        row.status = CommandStatus::InProgress;
        row.started_at = Some(Utc::now());
        row.claimed_by = Some(executor_id.to_string());
        let claimed = row.clone();
        inner.push_log(
            LogLevel::Info,
            "QUEUE",
            &format!("command {} claimed by {}", id, executor_id),
        );
        Ok(Some(claimed))
    }

    async fn record_progress(&self, id: i64, note: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.commands.contains_key(&id) {
            return Err(StoreError::CommandNotFound(id));
        }
        inner.push_log(LogLevel::Info, "EXECUTOR", &format!("command {id}: {note}"));
        Ok(())
    }

    async fn finish_command(
        &self,
        id: i64,
        status: CommandStatus,
        result: &str,
        mutations: Vec<Mutation>,
    ) -> Result<CommandRow, StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .commands
            .get(&id)
            .ok_or(StoreError::CommandNotFound(id))?
            .clone();
        if row.status.is_terminal() {
            return Err(StoreError::TerminalRow { id, status: row.status });
        }
        if !row.status.may_transition_to(status) {
            return Err(StoreError::InvalidTransition { id, from: row.status, to: status });
        }
        // Mutations first: if any row update is impossible the command must
        // not report success.
        if status == CommandStatus::Completed {
            for m in &mutations {
                inner.apply_mutation(id, m)?;
            }
        }
        let row = inner.commands.get_mut(&id).expect("row exists");
        row.status = status;
        row.completed_at = Some(Utc::now());
        row.result = Some(result.to_string());
        let finished = row.clone();
        let level = if status == CommandStatus::Completed {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        inner.push_log(level, "EXECUTOR", &format!("command {id} {:?}: {result}", status));
        Ok(finished)
    }

    async fn get_command(&self, id: i64) -> Result<CommandRow, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .commands
            .get(&id)
            .cloned()
            .ok_or(StoreError::CommandNotFound(id))
    }

    async fn list_commands(&self, limit: usize) -> Result<Vec<CommandRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.commands.values().rev().take(limit).cloned().collect())
    }

    async fn fail_all_in_flight(&self, reason: &str) -> Result<Vec<CommandRow>, StoreError> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<i64> = inner
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::InProgress)
            .map(|c| c.id)
            .collect();
        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            let row = inner.commands.get_mut(&id).expect("id from scan");
            row.status = CommandStatus::Failed;
            row.completed_at = Some(Utc::now());
            row.result = Some(reason.to_string());
            failed.push(row.clone());
            for carrier in inner.carriers.values_mut() {
                if carrier.locked_by == Some(id) {
                    carrier.locked = false;
                    carrier.locked_by = None;
                }
            }
        }
        if !failed.is_empty() {
            inner.push_log(
                LogLevel::Critical,
                "EXECUTOR",
                &format!("{} in-flight command(s) failed: {reason}", failed.len()),
            );
        }
        Ok(failed)
    }

    async fn slots(&self) -> Result<Vec<Slot>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.slots.values().cloned().collect())
    }

    async fn find_empty_slot(&self) -> Result<Option<SlotName>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .slots
            .values()
            .find(|s| s.carrier_id.is_none())
            .map(|s| s.name))
    }

    async fn find_raw_dough_slot(
        &self,
        flavor: Option<CookieFlavor>,
    ) -> Result<Option<SlotName>, StoreError> {
        let inner = self.inner.lock().await;
        for slot in inner.slots.values() {
            let Some(carrier_id) = slot.carrier_id else { continue };
            let Some(cookie) = inner.cookie_for_carrier(carrier_id) else { continue };
            if cookie.status != CookieStatus::RawDough {
                continue;
            }
            if let Some(f) = flavor {
                if cookie.flavor != f {
                    continue;
                }
            }
            return Ok(Some(slot.name));
        }
        Ok(None)
    }

    async fn cookie_in_slot(&self, slot: SlotName) -> Result<Option<Cookie>, StoreError> {
        let inner = self.inner.lock().await;
        inner.cookie_for_slot(slot)
    }

    async fn lock_carrier(&self, slot: SlotName, command_id: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let carrier_id = inner
            .slots
            .get(&slot)
            .ok_or_else(|| StoreError::SlotNotFound(slot.to_string()))?
            .carrier_id
            .ok_or_else(|| StoreError::Invariant(format!("slot {slot} is empty")))?;
        let carrier = inner
            .carriers
            .get_mut(&carrier_id)
            .ok_or(StoreError::CarrierNotFound(carrier_id))?;
        if carrier.locked && carrier.locked_by != Some(command_id) {
            return Err(StoreError::CarrierLocked {
                carrier: carrier_id,
                owner: carrier.locked_by.unwrap_or(0),
            });
        }
        carrier.locked = true;
        carrier.locked_by = Some(command_id);
        Ok(carrier_id)
    }

    async fn unlock_carrier(&self, carrier_id: i64, command_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let carrier = inner
            .carriers
            .get_mut(&carrier_id)
            .ok_or(StoreError::CarrierNotFound(carrier_id))?;
        if carrier.locked_by == Some(command_id) {
            carrier.locked = false;
            carrier.locked_by = None;
        }
        Ok(())
    }

    async fn update_carrier_zone(&self, carrier_id: i64, zone: Zone) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let carrier = inner
            .carriers
            .get_mut(&carrier_id)
            .ok_or(StoreError::CarrierNotFound(carrier_id))?;
        carrier.zone = zone;
        Ok(())
    }

    async fn unlock_all_for_command(&self, command_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for carrier in inner.carriers.values_mut() {
            if carrier.locked_by == Some(command_id) {
                carrier.locked = false;
                carrier.locked_by = None;
            }
        }
        Ok(())
    }

    async fn record_device_snapshot(
        &self,
        device: DeviceId,
        snapshot: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.snapshots.insert(device, snapshot);
        Ok(())
    }

    async fn device_snapshots(&self) -> Result<Vec<serde_json::Value>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<serde_json::Value> = inner.snapshots.values().cloned().collect();
        out.sort_by_key(|v| v["device"].as_str().map(String::from));
        Ok(out)
    }

    async fn append_telemetry(
        &self,
        device: DeviceId,
        metric: &str,
        value: f64,
        unit: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let sample = TelemetrySample {
            id: inner.next_row_id(),
            device,
            metric: metric.to_string(),
            value,
            unit: unit.map(String::from),
            timestamp: Utc::now(),
        };
        let cap = inner.retention.telemetry_rows;
        push_bounded(&mut inner.telemetry, sample, cap);
        Ok(())
    }

    async fn append_energy(
        &self,
        device: DeviceId,
        joules: f64,
        voltage: f64,
        power_watts: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let sample = EnergySample {
            id: inner.next_row_id(),
            device,
            joules,
            voltage,
            power_watts,
            timestamp: Utc::now(),
        };
        let cap = inner.retention.energy_rows;
        push_bounded(&mut inner.energy, sample, cap);
        Ok(())
    }

    async fn append_alert(
        &self,
        alert_type: &str,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        device: Option<DeviceId>,
    ) -> Result<Alert, StoreError> {
        let mut inner = self.inner.lock().await;
        let alert = Alert {
            id: inner.next_row_id(),
            alert_type: alert_type.to_string(),
            severity,
            title: title.to_string(),
            message: message.to_string(),
            device,
            acknowledged: false,
            acknowledged_at: None,
            created_at: Utc::now(),
        };
        let cap = inner.retention.alert_rows;
        push_bounded(&mut inner.alerts, alert.clone(), cap);
        if severity >= AlertSeverity::Critical {
            info!(target: "stf_twin::store", title, "critical alert recorded");
        }
        Ok(alert)
    }

    async fn append_log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.push_log(level, source, message);
        Ok(())
    }

    async fn alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.alerts.iter().rev().take(limit).cloned().collect())
    }

    async fn logs(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.logs.iter().rev().take(limit).cloned().collect())
    }

    async fn component_specs(&self) -> Result<Vec<ComponentSpec>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.components.clone())
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn claim_is_oldest_first_with_reset_priority() {
        let s = store();
        let a = s
            .enqueue_command(CommandKind::Store, SlotName::parse("A1"), CommandParams::default())
            .await
            .unwrap();
        let _b = s
            .enqueue_command(CommandKind::Retrieve, SlotName::parse("A2"), CommandParams::default())
            .await
            .unwrap();
        let reset = s
            .enqueue_command(CommandKind::Reset, None, CommandParams::default())
            .await
            .unwrap();

        // RESET outranks the older STORE.
        let claimed = s.claim_next("exec-1", false).await.unwrap().unwrap();
        assert_eq!(claimed.id, reset.id);
        assert_eq!(claimed.status, CommandStatus::InProgress);

        // RESET occupies all devices; nothing else can be claimed.
        assert!(s.claim_next("exec-1", false).await.unwrap().is_none());

        s.finish_command(reset.id, CommandStatus::Completed, "done", vec![])
            .await
            .unwrap();
        let claimed = s.claim_next("exec-1", false).await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
    }

    #[tokio::test]
    async fn overlapping_device_sets_serialise() {
        let s = store();
        let first = s
            .enqueue_command(CommandKind::Retrieve, SlotName::parse("A1"), CommandParams::default())
            .await
            .unwrap();
        let second = s
            .enqueue_command(CommandKind::Retrieve, SlotName::parse("A2"), CommandParams::default())
            .await
            .unwrap();

        let claimed = s.claim_next("exec-1", false).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        // Same device set (HBW): blocked until the first is terminal.
        assert!(s.claim_next("exec-2", false).await.unwrap().is_none());

        s.finish_command(first.id, CommandStatus::Failed, "timeout", vec![])
            .await
            .unwrap();
        let claimed = s.claim_next("exec-2", false).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
    }

    #[tokio::test]
    async fn disjoint_device_sets_run_concurrently() {
        let s = store();
        let hbw = s
            .enqueue_command(CommandKind::Retrieve, SlotName::parse("A1"), CommandParams::default())
            .await
            .unwrap();
        let mut params = CommandParams::default();
        params.device = Some(DeviceId::Vgr);
        params.target = Some([0.0, 0.0, 0.0]);
        let vgr = s.enqueue_command(CommandKind::Move, None, params).await.unwrap();

        let c1 = s.claim_next("exec-1", false).await.unwrap().unwrap();
        let c2 = s.claim_next("exec-1", false).await.unwrap().unwrap();
        assert_eq!(c1.id, hbw.id);
        assert_eq!(c2.id, vgr.id);
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let s = store();
        let row = s
            .enqueue_command(CommandKind::Store, SlotName::parse("A1"), CommandParams::default())
            .await
            .unwrap();
        s.claim_next("exec-1", false).await.unwrap().unwrap();
        s.finish_command(row.id, CommandStatus::Completed, "ok", vec![])
            .await
            .unwrap();
        let err = s
            .finish_command(row.id, CommandStatus::Failed, "late", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalRow { .. }));
    }

    #[tokio::test]
    async fn pending_cannot_jump_to_completed() {
        let s = store();
        let row = s
            .enqueue_command(CommandKind::Store, SlotName::parse("A1"), CommandParams::default())
            .await
            .unwrap();
        let err = s
            .finish_command(row.id, CommandStatus::Completed, "ok", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn terminal_mutations_are_atomic_with_the_row() {
        let s = store();
        let slot = SlotName::parse("B2").unwrap();
        let row = s
            .enqueue_command(CommandKind::Store, Some(slot), CommandParams::default())
            .await
            .unwrap();
        s.claim_next("exec-1", false).await.unwrap();
        s.finish_command(
            row.id,
            CommandStatus::Completed,
            "stored",
            vec![Mutation::CreateCookieInSlot {
                slot,
                flavor: CookieFlavor::Vanilla,
                batch_uuid: "batch-1".into(),
            }],
        )
        .await
        .unwrap();

        let cookie = s.cookie_in_slot(slot).await.unwrap().unwrap();
        assert_eq!(cookie.status, CookieStatus::RawDough);
        assert_eq!(cookie.flavor, CookieFlavor::Vanilla);

        // A second STORE into the same slot must fail the mutation and the
        // command must not report success.
        let row2 = s
            .enqueue_command(CommandKind::Store, Some(slot), CommandParams::default())
            .await
            .unwrap();
        s.claim_next("exec-1", false).await.unwrap();
        let err = s
            .finish_command(
                row2.id,
                CommandStatus::Completed,
                "stored",
                vec![Mutation::CreateCookieInSlot {
                    slot,
                    flavor: CookieFlavor::Choco,
                    batch_uuid: "batch-2".into(),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
        // Row is still IN_PROGRESS, so the executor can fail it cleanly.
        let row2 = s.get_command(row2.id).await.unwrap();
        assert_eq!(row2.status, CommandStatus::InProgress);
    }

    #[tokio::test]
    async fn carrier_lock_is_exclusive() {
        let s = store();
        s.seed_demo_inventory().await;
        let slot = SlotName::parse("A1").unwrap();
        let carrier = s.lock_carrier(slot, 10).await.unwrap();
        let err = s.lock_carrier(slot, 11).await.unwrap_err();
        assert!(matches!(err, StoreError::CarrierLocked { .. }));
        s.unlock_carrier(carrier, 10).await.unwrap();
        s.lock_carrier(slot, 11).await.unwrap();
    }

    #[tokio::test]
    async fn raw_dough_selection_is_lowest_slot_name() {
        let s = store();
        s.seed_demo_inventory().await;
        // Bake A1 so it no longer qualifies.
        let row = s
            .enqueue_command(CommandKind::Process, SlotName::parse("A1"), CommandParams::default())
            .await
            .unwrap();
        s.claim_next("exec-1", false).await.unwrap();
        s.finish_command(
            row.id,
            CommandStatus::Completed,
            "baked",
            vec![Mutation::SetCookieStatus {
                slot: SlotName::parse("A1").unwrap(),
                status: CookieStatus::Baked,
            }],
        )
        .await
        .unwrap();

        let next = s.find_raw_dough_slot(None).await.unwrap().unwrap();
        assert_eq!(next.to_string(), "A2");
        assert!(s
            .find_raw_dough_slot(Some(CookieFlavor::Strawberry))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn emergency_fails_all_in_flight_and_releases_locks() {
        let s = store();
        s.seed_demo_inventory().await;
        let slot = SlotName::parse("A1").unwrap();
        let row = s
            .enqueue_command(CommandKind::Retrieve, Some(slot), CommandParams::default())
            .await
            .unwrap();
        s.claim_next("exec-1", false).await.unwrap();
        s.lock_carrier(slot, row.id).await.unwrap();

        let failed = s.fail_all_in_flight("EMERGENCY_STOP").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, CommandStatus::Failed);
        assert_eq!(failed[0].result.as_deref(), Some("EMERGENCY_STOP"));
        // Lock released: a new command can take the carrier.
        s.lock_carrier(slot, 99).await.unwrap();
    }

    #[tokio::test]
    async fn append_only_tables_respect_retention() {
        let s = MemoryStore::with_retention(Retention {
            telemetry_rows: 3,
            energy_rows: 3,
            alert_rows: 2,
            log_rows: 100,
        });
        for i in 0..10 {
            s.append_telemetry(DeviceId::Hbw, "current_amps", i as f64, Some("A"))
                .await
                .unwrap();
        }
        let inner = s.inner.lock().await;
        assert_eq!(inner.telemetry.len(), 3);
        assert_eq!(inner.telemetry.back().unwrap().value, 9.0);
    }
}
