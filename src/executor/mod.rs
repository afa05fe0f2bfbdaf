//! Command executor.
//!
//! Polls the queue at a bounded interval, atomically claims the oldest
//! eligible PENDING row, and drives one FSM task per claimed command. All
//! device interaction goes through the bus; all persistence through the
//! store. An FSM failure terminates only its own command.

pub mod fsm;

use crate::bus::{cmd_topic, global_topic, BusAdapter, BusSubscription};
use crate::config::TwinConfig;
use crate::devices::{DeviceSnapshot, ARRIVAL_EPSILON_MM};
use crate::hub::BroadcastHub;
use crate::model::*;
use crate::safety::SafetyHandle;
use crate::store::SharedStore;
use fsm::{CommandFsm, Effect, FsmEvent, Op, Plan, WaitFor};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Grace period after a timeout STOP before the operation is failed anyway.
const STOP_GRACE: Duration = Duration::from_millis(500);

fn wall_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Broadcast an emergency stop: global bus event, latch, fail everything
/// in flight. Shared between the edge endpoint and the queued
/// EMERGENCY_STOP command kind.
pub async fn trigger_emergency(
    bus: &BusAdapter,
    store: &SharedStore,
    hub: &BroadcastHub,
    safety: &SafetyHandle,
    source: &str,
) {
    error!(target: "stf_twin::executor", source, "EMERGENCY STOP");
    let _ = bus.publish(
        global_topic("cmd/emergency_stop").as_str(),
        &json!({"source": source}),
    );
    safety.latch();
    match store.fail_all_in_flight("EMERGENCY_STOP").await {
        Ok(failed) => {
            for row in failed {
                hub.publish_command_update(wall_ms(), &row);
            }
        }
        Err(e) => error!(target: "stf_twin::executor", error = %e, "failed to fail in-flight rows"),
    }
    if let Ok(alert) = store
        .append_alert(
            "EMERGENCY_STOP",
            AlertSeverity::Critical,
            "Emergency stop",
            &format!("emergency stop requested by {source}"),
            None,
        )
        .await
    {
        hub.publish_alert(wall_ms(), &alert);
    }
}

pub struct Executor {
    id: String,
    cfg: Arc<TwinConfig>,
    store: SharedStore,
    bus: BusAdapter,
    hub: BroadcastHub,
    safety: SafetyHandle,
}

impl Executor {
    pub fn new(
        id: &str,
        cfg: Arc<TwinConfig>,
        store: SharedStore,
        bus: BusAdapter,
        hub: BroadcastHub,
        safety: SafetyHandle,
    ) -> Self {
        Self {
            id: id.to_string(),
            cfg,
            store,
            bus,
            hub,
            safety,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(self) {
        info!(target: "stf_twin::executor", id = %self.id, "executor started");
        let mut interval = tokio::time::interval(self.cfg.poll_interval);
        loop {
            interval.tick().await;
            self.poll().await;
        }
    }

    /// Claim every currently eligible command. Claims on disjoint device
    /// sets start concurrently; a lost claim is simply skipped until the
    /// next poll.
    pub async fn poll(&self) {
        loop {
            match self
                .store
                .claim_next(&self.id, self.safety.is_latched())
                .await
            {
                Ok(Some(row)) => {
                    self.hub.publish_command_update(wall_ms(), &row);
                    let ctx = DriverCtx {
                        cfg: Arc::clone(&self.cfg),
                        store: Arc::clone(&self.store),
                        bus: self.bus.clone(),
                        hub: self.hub.clone(),
                        safety: self.safety.clone(),
                    };
                    tokio::spawn(async move { drive_command(ctx, row).await });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "stf_twin::executor", error = %e, "claim failed");
                    break;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct DriverCtx {
    pub cfg: Arc<TwinConfig>,
    pub store: SharedStore,
    pub bus: BusAdapter,
    pub hub: BroadcastHub,
    pub safety: SafetyHandle,
}

/// Drive a single claimed command to a terminal state. Never panics the
/// executor: every failure ends in a FAILED row.
pub async fn drive_command(ctx: DriverCtx, row: CommandRow) {
    debug!(target: "stf_twin::executor", id = row.id, kind = ?row.kind, "driving command");

    if row.kind == CommandKind::EmergencyStop {
        // Complete the broadcast row first so it is not failed by its own
        // emergency.
        finish(&ctx, &row, CommandStatus::Completed, "emergency stop broadcast", vec![]).await;
        trigger_emergency(&ctx.bus, &ctx.store, &ctx.hub, &ctx.safety, "QUEUE").await;
        return;
    }

    // Commands that move an existing carrier take its lock for their whole
    // lifetime.
    let carrier_id = match (row.kind, row.target_slot) {
        (CommandKind::Retrieve | CommandKind::Process, Some(slot)) => {
            match ctx.store.lock_carrier(slot, row.id).await {
                Ok(id) => Some(id),
                Err(e) => {
                    finish(&ctx, &row, CommandStatus::Failed, &format!("carrier unavailable: {e}"), vec![])
                        .await;
                    return;
                }
            }
        }
        _ => None,
    };

    let plan = match Plan::build(&row, ctx.cfg.bake_time.as_millis() as u64) {
        Ok(plan) => plan,
        Err(e) => {
            let _ = ctx.store.unlock_all_for_command(row.id).await;
            finish(&ctx, &row, CommandStatus::Failed, &e.to_string(), vec![]).await;
            return;
        }
    };

    let deadline = Instant::now() + ctx.cfg.command_deadline;
    let mut statuses = ctx.bus.subscribe("stf/+/status");
    let mut latch = ctx.safety.subscribe();
    let mut latest: HashMap<DeviceId, DeviceSnapshot> = HashMap::new();
    let mut fsm = CommandFsm::new(row.id, plan.steps.clone());
    let mut pending = fsm.step(FsmEvent::Begin);

    'drive: loop {
        let mut next_event = None;
        for effect in std::mem::take(&mut pending) {
            match effect {
                Effect::Progress { note } => {
                    let _ = ctx.store.record_progress(row.id, &note).await;
                }
                Effect::StartOp { index, retry } => {
                    let op = fsm.op(index).clone();
                    for (device, action, payload) in op.messages() {
                        if let Err(e) = ctx.bus.publish(cmd_topic(device, action).as_str(), &payload)
                        {
                            warn!(target: "stf_twin::executor", id = row.id, error = %e, "command publish failed");
                        }
                    }
                    // Retries run under a tightened deadline.
                    let timeout = if retry {
                        ctx.cfg.op_timeout / 2
                    } else {
                        ctx.cfg.op_timeout
                    };
                    let event = wait_for_op(
                        &op,
                        timeout,
                        deadline,
                        &mut statuses,
                        &mut latch,
                        &mut latest,
                    )
                    .await;
                    if event == FsmEvent::OpTimedOut {
                        stop_and_grace(&ctx, &op).await;
                    }
                    if event == FsmEvent::ConditionMet {
                        if let (Some(zone), Some(carrier)) = (op.zone_after(), carrier_id) {
                            let _ = ctx.store.update_carrier_zone(carrier, zone).await;
                        }
                    }
                    next_event = Some(event);
                }
                Effect::Complete => {
                    complete(&ctx, &row, &plan, carrier_id).await;
                    break 'drive;
                }
                Effect::Fail { reason } => {
                    let _ = ctx.store.unlock_all_for_command(row.id).await;
                    finish(&ctx, &row, CommandStatus::Failed, &reason, vec![]).await;
                    if reason != "EMERGENCY_STOP" {
                        if let Ok(alert) = ctx
                            .store
                            .append_alert(
                                "COMMAND_FAILED",
                                AlertSeverity::Critical,
                                "Command failed",
                                &format!("command {} failed: {reason}", row.id),
                                None,
                            )
                            .await
                        {
                            ctx.hub.publish_alert(wall_ms(), &alert);
                        }
                    }
                }
                Effect::SafePark => {
                    safe_park(&ctx, &row, &latest).await;
                    break 'drive;
                }
            }
        }
        match next_event {
            Some(event) => pending = fsm.step(event),
            None => break,
        }
    }
}

async fn complete(ctx: &DriverCtx, row: &CommandRow, plan: &Plan, carrier_id: Option<i64>) {
    match ctx
        .store
        .finish_command(row.id, CommandStatus::Completed, &plan.summary, plan.mutations.clone())
        .await
    {
        Ok(finished) => {
            ctx.hub.publish_command_update(wall_ms(), &finished);
            info!(target: "stf_twin::executor", id = row.id, "command completed");
            if row.kind == CommandKind::Reset && ctx.safety.is_latched() {
                ctx.safety.clear();
                let _ = ctx
                    .store
                    .append_log(LogLevel::Info, "EXECUTOR", "resume recorded after reset")
                    .await;
            }
        }
        Err(e) => {
            // The terminal transaction refused a row update; the command
            // must not report success.
            warn!(target: "stf_twin::executor", id = row.id, error = %e, "terminal transaction rejected");
            finish(
                ctx,
                row,
                CommandStatus::Failed,
                &format!("consistency check failed: {e}"),
                vec![],
            )
            .await;
        }
    }
    if let Some(carrier) = carrier_id {
        let _ = ctx.store.unlock_carrier(carrier, row.id).await;
    }
}

async fn finish(
    ctx: &DriverCtx,
    row: &CommandRow,
    status: CommandStatus,
    result: &str,
    mutations: Vec<crate::store::Mutation>,
) {
    match ctx.store.finish_command(row.id, status, result, mutations).await {
        Ok(finished) => ctx.hub.publish_command_update(wall_ms(), &finished),
        // Already terminal: the emergency path beat us to it.
        Err(crate::error::StoreError::TerminalRow { .. }) => {}
        Err(e) => {
            error!(target: "stf_twin::executor", id = row.id, error = %e, "terminal write failed")
        }
    }
}

/// Timeout recovery, first half: stop the affected devices and give them a
/// short grace period before the operation is declared failed.
async fn stop_and_grace(ctx: &DriverCtx, op: &Op) {
    if let Some(device) = op.wait().device() {
        let _ = ctx.bus.publish(cmd_topic(device, "stop").as_str(), &json!({}));
    }
    tokio::time::sleep(STOP_GRACE).await;
}

/// Bring the command's devices into a passive state after a failure: stop
/// motion, release grippers that hold nothing, drop the carrier lock.
async fn safe_park(ctx: &DriverCtx, row: &CommandRow, latest: &HashMap<DeviceId, DeviceSnapshot>) {
    warn!(target: "stf_twin::executor", id = row.id, "safe-parking devices");
    let set = row.device_set();
    for device in set.devices() {
        let _ = ctx.bus.publish(cmd_topic(device, "stop").as_str(), &json!({}));
    }
    if set.contains(DeviceId::Hbw) {
        let holding = latest.get(&DeviceId::Hbw).map(|s| s.has_carrier).unwrap_or(false);
        if !holding {
            let _ = ctx.bus.publish(
                cmd_topic(DeviceId::Hbw, "gripper").as_str(),
                &json!({"action": "open"}),
            );
        }
    }
    if set.contains(DeviceId::Vgr) {
        let holding = latest.get(&DeviceId::Vgr).map(|s| s.vacuum_active).unwrap_or(false);
        if !holding {
            let _ = ctx.bus.publish(
                cmd_topic(DeviceId::Vgr, "vacuum").as_str(),
                &json!({"activate": false}),
            );
        }
    }
    let _ = ctx.store.unlock_all_for_command(row.id).await;
    if let Ok(alert) = ctx
        .store
        .append_alert(
            "SAFE_PARK",
            AlertSeverity::Critical,
            "Safe park executed",
            &format!("command {} parked its devices after failure", row.id),
            None,
        )
        .await
    {
        ctx.hub.publish_alert(wall_ms(), &alert);
    }
}

/// Wait until the operation's terminal condition is met, it times out, the
/// command deadline fires, or an emergency interrupts it.
async fn wait_for_op(
    op: &Op,
    timeout: Duration,
    deadline: Instant,
    statuses: &mut BusSubscription,
    latch: &mut watch::Receiver<bool>,
    latest: &mut HashMap<DeviceId, DeviceSnapshot>,
) -> FsmEvent {
    let wait = op.wait();

    if let WaitFor::Elapsed { ms } = wait {
        let done_at = Instant::now() + Duration::from_millis(ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(done_at) => return FsmEvent::ConditionMet,
                _ = tokio::time::sleep_until(deadline) => return FsmEvent::DeadlineExceeded,
                changed = latch.changed() => {
                    if changed.is_ok() && *latch.borrow() {
                        return FsmEvent::EmergencyStopped;
                    }
                }
            }
        }
    }

    let timeout_at = Instant::now() + timeout;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(timeout_at) => return FsmEvent::OpTimedOut,
            _ = tokio::time::sleep_until(deadline) => return FsmEvent::DeadlineExceeded,
            changed = latch.changed() => {
                if changed.is_ok() && *latch.borrow() {
                    return FsmEvent::EmergencyStopped;
                }
            }
            msg = statuses.recv() => {
                let Some(msg) = msg else {
                    // Broker gone: only the timers can resolve this wait.
                    return if deadline < timeout_at {
                        tokio::time::sleep_until(deadline).await;
                        FsmEvent::DeadlineExceeded
                    } else {
                        tokio::time::sleep_until(timeout_at).await;
                        FsmEvent::OpTimedOut
                    };
                };
                let Ok(snapshot) = serde_json::from_value::<DeviceSnapshot>(msg.payload.clone())
                else {
                    continue;
                };
                let device = snapshot.device;
                latest.insert(device, snapshot);
                if device_errored(&wait, device, latest) {
                    return FsmEvent::DeviceErrored { device };
                }
                if wait_satisfied(&wait, latest) {
                    return FsmEvent::ConditionMet;
                }
            }
        }
    }
}

fn device_errored(
    wait: &WaitFor,
    device: DeviceId,
    latest: &HashMap<DeviceId, DeviceSnapshot>,
) -> bool {
    let involved = match wait {
        WaitFor::AllIdle { devices } => devices.contains(device),
        other => other.device() == Some(device),
    };
    involved
        && latest
            .get(&device)
            .map(|s| s.status == HardwareStatus::Error)
            .unwrap_or(false)
}

/// Check an operation's terminal condition against the latest snapshots.
pub fn wait_satisfied(wait: &WaitFor, latest: &HashMap<DeviceId, DeviceSnapshot>) -> bool {
    match wait {
        WaitFor::Arrival { device, target } => latest.get(device).is_some_and(|s| {
            s.position
                .iter()
                .zip(target.iter())
                .all(|(current, want)| (want - current).abs() < ARRIVAL_EPSILON_MM)
        }),
        WaitFor::GripperIs { closed } => latest
            .get(&DeviceId::Hbw)
            .is_some_and(|s| s.gripper_closed == *closed),
        WaitFor::VacuumIs { on } => latest
            .get(&DeviceId::Vgr)
            .is_some_and(|s| s.vacuum_active == *on),
        WaitFor::BeltMoving { direction } => latest.get(&DeviceId::Conveyor).is_some_and(|s| {
            s.status == HardwareStatus::Moving
                && s.belt.map(|b| b.direction == *direction).unwrap_or(false)
        }),
        WaitFor::BeltStopped => latest
            .get(&DeviceId::Conveyor)
            .is_some_and(|s| s.status == HardwareStatus::Idle),
        WaitFor::BeltHasObject { present } => latest
            .get(&DeviceId::Conveyor)
            .is_some_and(|s| s.belt.map(|b| b.has_object == *present).unwrap_or(false)),
        WaitFor::AllIdle { devices } => devices.devices().all(|d| {
            latest
                .get(&d)
                .map(|s| s.status == HardwareStatus::Idle)
                .unwrap_or(false)
        }),
        WaitFor::Elapsed { .. } => true,
    }
}
