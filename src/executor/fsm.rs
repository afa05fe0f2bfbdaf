//! Per-command state machine.
//!
//! A command compiles to a flat operation plan; execution is a single step
//! function `(state, event) -> (state, effects)`. The driver in the parent
//! module applies effects (publish, persist, park) and turns bus
//! observations into events. Everything here is pure and synchronous.

use crate::devices::hbw;
use crate::error::ExecutorError;
use crate::model::*;
use crate::store::Mutation;
use serde_json::json;

/// Retry budget for idempotent operations.
pub const MAX_OP_RETRIES: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    MoveTo {
        device: DeviceId,
        target: [f64; 3],
        label: &'static str,
    },
    Gripper {
        closed: bool,
    },
    Vacuum {
        on: bool,
    },
    BeltRun {
        direction: i8,
    },
    BeltStop,
    PlaceOnBelt {
        position_mm: f64,
    },
    TakeFromBelt,
    Wait {
        ms: u64,
        label: &'static str,
    },
    /// Stop + reset every device, then wait for all of them to go IDLE.
    ResetDevices,
}

impl Op {
    pub fn label(&self) -> &'static str {
        match self {
            Op::MoveTo { label, .. } => label,
            Op::Gripper { closed: true } => "grip_close",
            Op::Gripper { closed: false } => "release",
            Op::Vacuum { on: true } => "vacuum_on",
            Op::Vacuum { on: false } => "vacuum_off",
            Op::BeltRun { .. } => "run_belt",
            Op::BeltStop => "stop_belt",
            Op::PlaceOnBelt { .. } => "place",
            Op::TakeFromBelt => "pick_from_belt",
            Op::Wait { label, .. } => label,
            Op::ResetDevices => "reset_devices",
        }
    }

    /// Idempotent operations are retried on timeout with a shorter
    /// deadline; everything else fails the command on first timeout.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Op::MoveTo { .. } | Op::BeltRun { .. } | Op::BeltStop | Op::ResetDevices
        )
    }

    pub fn retry_budget(&self) -> u8 {
        if self.is_idempotent() {
            MAX_OP_RETRIES
        } else {
            0
        }
    }

    /// Command messages this operation puts on the bus.
    pub fn messages(&self) -> Vec<(DeviceId, &'static str, serde_json::Value)> {
        match self {
            Op::MoveTo { device, target, .. } => vec![(
                *device,
                "move",
                json!({"x": target[0], "y": target[1], "z": target[2]}),
            )],
            Op::Gripper { closed } => vec![(
                DeviceId::Hbw,
                "gripper",
                json!({"action": if *closed { "close" } else { "open" }}),
            )],
            Op::Vacuum { on } => {
                vec![(DeviceId::Vgr, "vacuum", json!({"activate": on}))]
            }
            Op::BeltRun { direction } => vec![(
                DeviceId::Conveyor,
                "belt",
                json!({"action": "start", "direction": direction}),
            )],
            Op::BeltStop => {
                vec![(DeviceId::Conveyor, "belt", json!({"action": "stop"}))]
            }
            Op::PlaceOnBelt { position_mm } => vec![(
                DeviceId::Conveyor,
                "object",
                json!({"action": "place", "position_mm": position_mm}),
            )],
            Op::TakeFromBelt => {
                vec![(DeviceId::Conveyor, "object", json!({"action": "remove"}))]
            }
            Op::Wait { .. } => Vec::new(),
            Op::ResetDevices => DeviceId::ALL
                .into_iter()
                .flat_map(|d| [(d, "stop", json!({})), (d, "reset", json!({}))])
                .collect(),
        }
    }

    /// Terminal condition the driver waits on after sending the messages.
    pub fn wait(&self) -> WaitFor {
        match self {
            Op::MoveTo { device, target, .. } => WaitFor::Arrival {
                device: *device,
                target: *target,
            },
            Op::Gripper { closed } => WaitFor::GripperIs { closed: *closed },
            Op::Vacuum { on } => WaitFor::VacuumIs { on: *on },
            Op::BeltRun { direction } => WaitFor::BeltMoving {
                direction: *direction,
            },
            Op::BeltStop => WaitFor::BeltStopped,
            Op::PlaceOnBelt { .. } => WaitFor::BeltHasObject { present: true },
            Op::TakeFromBelt => WaitFor::BeltHasObject { present: false },
            Op::Wait { ms, .. } => WaitFor::Elapsed { ms: *ms },
            Op::ResetDevices => WaitFor::AllIdle {
                devices: DeviceSet::ALL,
            },
        }
    }

    /// Carrier zone after this operation completes, for commands holding a
    /// carrier lock.
    pub fn zone_after(&self) -> Option<Zone> {
        match self {
            Op::PlaceOnBelt { .. } => Some(Zone::Conveyor),
            Op::Wait { label: "bake", .. } => Some(Zone::Oven),
            Op::TakeFromBelt => Some(Zone::Hbw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitFor {
    Arrival { device: DeviceId, target: [f64; 3] },
    GripperIs { closed: bool },
    VacuumIs { on: bool },
    BeltMoving { direction: i8 },
    BeltStopped,
    BeltHasObject { present: bool },
    AllIdle { devices: DeviceSet },
    Elapsed { ms: u64 },
}

impl WaitFor {
    /// The single device whose snapshots decide this wait, `None` when it
    /// spans several.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            WaitFor::Arrival { device, .. } => Some(*device),
            WaitFor::GripperIs { .. } => Some(DeviceId::Hbw),
            WaitFor::VacuumIs { .. } => Some(DeviceId::Vgr),
            WaitFor::BeltMoving { .. } | WaitFor::BeltStopped | WaitFor::BeltHasObject { .. } => {
                Some(DeviceId::Conveyor)
            }
            WaitFor::AllIdle { .. } | WaitFor::Elapsed { .. } => None,
        }
    }
}

/// Compiled execution plan: ordered operations plus the row updates to
/// apply with the terminal COMPLETED transition.
#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<Op>,
    pub mutations: Vec<Mutation>,
    pub summary: String,
}

impl Plan {
    pub fn build(row: &CommandRow, bake_ms: u64) -> Result<Plan, ExecutorError> {
        let slot_pos = |slot: SlotName| hbw::slot_position(slot);
        match row.kind {
            CommandKind::Store => {
                let slot = row
                    .target_slot
                    .ok_or_else(|| ExecutorError::InvalidCommand("STORE needs a slot".into()))?;
                let flavor = row.params.flavor.unwrap_or(CookieFlavor::Choco);
                let batch_uuid = row
                    .params
                    .batch_uuid
                    .clone()
                    .ok_or_else(|| ExecutorError::InvalidCommand("STORE needs a batch id".into()))?;
                Ok(Plan {
                    steps: vec![
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: hbw::CONVEYOR_PICKUP,
                            label: "move_to_pickup",
                        },
                        Op::Gripper { closed: true },
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: slot_pos(slot),
                            label: "move_to_slot",
                        },
                        Op::Gripper { closed: false },
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: hbw::HOME,
                            label: "return_home",
                        },
                    ],
                    mutations: vec![Mutation::CreateCookieInSlot { slot, flavor, batch_uuid }],
                    summary: format!("stored {flavor:?} in {slot}"),
                })
            }
            CommandKind::Retrieve => {
                let slot = row
                    .target_slot
                    .ok_or_else(|| ExecutorError::InvalidCommand("RETRIEVE needs a slot".into()))?;
                Ok(Plan {
                    steps: vec![
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: slot_pos(slot),
                            label: "move_to_slot",
                        },
                        Op::Gripper { closed: true },
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: hbw::CONVEYOR_PICKUP,
                            label: "move_to_dropoff",
                        },
                        Op::Gripper { closed: false },
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: hbw::HOME,
                            label: "return_home",
                        },
                    ],
                    mutations: vec![Mutation::ShipAndClearSlot { slot }],
                    summary: format!("retrieved from {slot}"),
                })
            }
            CommandKind::Process => {
                let slot = row
                    .target_slot
                    .ok_or_else(|| ExecutorError::InvalidCommand("PROCESS needs a slot".into()))?;
                Ok(Plan {
                    steps: vec![
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: slot_pos(slot),
                            label: "move_to_slot",
                        },
                        Op::Gripper { closed: true },
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: hbw::CONVEYOR_PICKUP,
                            label: "move_to_conveyor_in",
                        },
                        Op::PlaceOnBelt { position_mm: 0.0 },
                        Op::BeltRun { direction: 1 },
                        Op::Wait { ms: bake_ms, label: "bake" },
                        Op::BeltStop,
                        Op::Gripper { closed: true },
                        Op::TakeFromBelt,
                        Op::MoveTo {
                            device: DeviceId::Hbw,
                            target: slot_pos(slot),
                            label: "move_to_slot",
                        },
                        Op::Gripper { closed: false },
                    ],
                    mutations: vec![Mutation::SetCookieStatus {
                        slot,
                        status: CookieStatus::Baked,
                    }],
                    summary: format!("baked cookie at {slot}"),
                })
            }
            CommandKind::Move => {
                let device = row
                    .params
                    .device
                    .ok_or_else(|| ExecutorError::InvalidCommand("MOVE needs a device".into()))?;
                let target = row.params.target.or_else(|| {
                    row.target_slot.map(slot_pos)
                });
                let target = target
                    .ok_or_else(|| ExecutorError::InvalidCommand("MOVE needs a target".into()))?;
                Ok(Plan {
                    steps: vec![Op::MoveTo { device, target, label: "move" }],
                    mutations: Vec::new(),
                    summary: format!("moved {device} to {target:?}"),
                })
            }
            CommandKind::Reset => Ok(Plan {
                steps: vec![Op::ResetDevices],
                mutations: Vec::new(),
                summary: "reset complete".into(),
            }),
            CommandKind::EmergencyStop => Ok(Plan {
                steps: Vec::new(),
                mutations: Vec::new(),
                summary: "emergency stop broadcast".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Step function
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FsmState {
    Start,
    AwaitingOp { index: usize, retries_left: u8 },
    Done,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FsmEvent {
    Begin,
    ConditionMet,
    OpTimedOut,
    DeviceErrored { device: DeviceId },
    EmergencyStopped,
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish the op's messages and wait on its condition. `retry` marks a
    /// repeat attempt, which runs under a shortened timeout.
    StartOp { index: usize, retry: bool },
    Progress { note: String },
    Complete,
    Fail { reason: String },
    SafePark,
}

#[derive(Debug)]
pub struct CommandFsm {
    pub command_id: i64,
    steps: Vec<Op>,
    state: FsmState,
}

impl CommandFsm {
    pub fn new(command_id: i64, steps: Vec<Op>) -> Self {
        Self { command_id, steps, state: FsmState::Start }
    }

    pub fn state(&self) -> &FsmState {
        &self.state
    }

    pub fn op(&self, index: usize) -> &Op {
        &self.steps[index]
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, FsmState::Done | FsmState::Failed { .. })
    }

    fn enter_op(&mut self, index: usize, retry: bool) -> Vec<Effect> {
        let op = &self.steps[index];
        let retries_left = if retry {
            match self.state {
                FsmState::AwaitingOp { retries_left, .. } => retries_left.saturating_sub(1),
                _ => 0,
            }
        } else {
            op.retry_budget()
        };
        let note = if retry {
            format!("retry {} ({} left)", op.label(), retries_left)
        } else {
            format!("op {}/{}: {}", index + 1, self.steps.len(), op.label())
        };
        self.state = FsmState::AwaitingOp { index, retries_left };
        vec![Effect::Progress { note }, Effect::StartOp { index, retry }]
    }

    fn fail(&mut self, reason: String, park: bool) -> Vec<Effect> {
        self.state = FsmState::Failed { reason: reason.clone() };
        let mut effects = vec![Effect::Fail { reason }];
        if park {
            effects.push(Effect::SafePark);
        }
        effects
    }

    /// The single transition function.
    pub fn step(&mut self, event: FsmEvent) -> Vec<Effect> {
        match (self.state.clone(), event) {
            (FsmState::Start, FsmEvent::Begin) => {
                if self.steps.is_empty() {
                    self.state = FsmState::Done;
                    vec![Effect::Complete]
                } else {
                    self.enter_op(0, false)
                }
            }
            (FsmState::AwaitingOp { index, .. }, FsmEvent::ConditionMet) => {
                if index + 1 == self.steps.len() {
                    self.state = FsmState::Done;
                    vec![Effect::Complete]
                } else {
                    self.enter_op(index + 1, false)
                }
            }
            (FsmState::AwaitingOp { index, retries_left }, FsmEvent::OpTimedOut) => {
                let op = &self.steps[index];
                if op.is_idempotent() && retries_left > 0 {
                    self.enter_op(index, true)
                } else {
                    let reason =
                        format!("operation `{}` timed out", op.label());
                    self.fail(reason, true)
                }
            }
            (FsmState::AwaitingOp { .. }, FsmEvent::DeviceErrored { device }) => {
                self.fail(format!("device {device} reported ERROR"), true)
            }
            (_, FsmEvent::EmergencyStopped) => {
                // Devices are already halted by the broadcast; parking would
                // only queue motion commands they will reject.
                self.fail("EMERGENCY_STOP".into(), false)
            }
            (_, FsmEvent::DeadlineExceeded) => {
                self.fail("command deadline exceeded".into(), true)
            }
            // Late events against a terminal state are dropped.
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(kind: CommandKind, slot: Option<&str>) -> CommandRow {
        let mut params = CommandParams::default();
        if kind == CommandKind::Store {
            params.batch_uuid = Some("batch-test".into());
        }
        CommandRow {
            id: 1,
            kind,
            target_slot: slot.and_then(SlotName::parse),
            params,
            status: CommandStatus::InProgress,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            claimed_by: Some("exec-test".into()),
            result: None,
        }
    }

    #[test]
    fn process_plan_follows_the_documented_order() {
        let plan = Plan::build(&row(CommandKind::Process, Some("B2")), 5000).unwrap();
        let labels: Vec<&str> = plan.steps.iter().map(|op| op.label()).collect();
        assert_eq!(
            labels,
            vec![
                "move_to_slot",
                "grip_close",
                "move_to_conveyor_in",
                "place",
                "run_belt",
                "bake",
                "stop_belt",
                "grip_close",
                "pick_from_belt",
                "move_to_slot",
                "release",
            ]
        );
        assert!(matches!(
            plan.mutations[0],
            Mutation::SetCookieStatus { status: CookieStatus::Baked, .. }
        ));
    }

    #[test]
    fn store_plan_ends_at_home_and_creates_the_cookie() {
        let plan = Plan::build(&row(CommandKind::Store, Some("A1")), 5000).unwrap();
        match plan.steps.last().unwrap() {
            Op::MoveTo { target, .. } => assert_eq!(*target, crate::devices::hbw::HOME),
            other => panic!("unexpected last op {other:?}"),
        }
        assert!(matches!(plan.mutations[0], Mutation::CreateCookieInSlot { .. }));
    }

    #[test]
    fn store_without_slot_is_invalid() {
        assert!(Plan::build(&row(CommandKind::Store, None), 5000).is_err());
    }

    #[test]
    fn happy_path_walks_every_op_then_completes() {
        let plan = Plan::build(&row(CommandKind::Retrieve, Some("A1")), 5000).unwrap();
        let total = plan.steps.len();
        let mut fsm = CommandFsm::new(1, plan.steps);

        let effects = fsm.step(FsmEvent::Begin);
        assert!(matches!(effects[1], Effect::StartOp { index: 0, retry: false }));

        for i in 1..total {
            let effects = fsm.step(FsmEvent::ConditionMet);
            assert!(
                effects.iter().any(|e| matches!(e, Effect::StartOp { index, .. } if *index == i))
            );
        }
        let effects = fsm.step(FsmEvent::ConditionMet);
        assert_eq!(effects, vec![Effect::Complete]);
        assert!(fsm.is_terminal());
    }

    #[test]
    fn idempotent_op_retries_then_fails() {
        let plan = Plan::build(&row(CommandKind::Retrieve, Some("A1")), 5000).unwrap();
        let mut fsm = CommandFsm::new(1, plan.steps);
        fsm.step(FsmEvent::Begin);

        // First op is a MOVE: three retries, then failure with safe-park.
        for expected_left in [2u8, 1, 0] {
            let effects = fsm.step(FsmEvent::OpTimedOut);
            assert!(matches!(effects[1], Effect::StartOp { index: 0, retry: true }));
            match fsm.state() {
                FsmState::AwaitingOp { retries_left, .. } => {
                    assert_eq!(*retries_left, expected_left)
                }
                other => panic!("unexpected state {other:?}"),
            }
        }
        let effects = fsm.step(FsmEvent::OpTimedOut);
        assert!(matches!(effects[0], Effect::Fail { .. }));
        assert!(effects.contains(&Effect::SafePark));
    }

    #[test]
    fn non_idempotent_op_fails_on_first_timeout() {
        let plan = Plan::build(&row(CommandKind::Retrieve, Some("A1")), 5000).unwrap();
        let mut fsm = CommandFsm::new(1, plan.steps);
        fsm.step(FsmEvent::Begin);
        fsm.step(FsmEvent::ConditionMet); // now at grip_close (non-idempotent)

        let effects = fsm.step(FsmEvent::OpTimedOut);
        assert!(matches!(effects[0], Effect::Fail { .. }));
        assert!(effects.contains(&Effect::SafePark));
    }

    #[test]
    fn emergency_fails_without_parking() {
        let plan = Plan::build(&row(CommandKind::Process, Some("A1")), 5000).unwrap();
        let mut fsm = CommandFsm::new(1, plan.steps);
        fsm.step(FsmEvent::Begin);
        let effects = fsm.step(FsmEvent::EmergencyStopped);
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Fail { reason } => assert_eq!(reason, "EMERGENCY_STOP"),
            other => panic!("unexpected effect {other:?}"),
        }
        // Late condition events after the terminal state are ignored.
        assert!(fsm.step(FsmEvent::ConditionMet).is_empty());
    }

    #[test]
    fn deadline_fails_and_parks() {
        let plan = Plan::build(&row(CommandKind::Retrieve, Some("A1")), 5000).unwrap();
        let mut fsm = CommandFsm::new(1, plan.steps);
        fsm.step(FsmEvent::Begin);
        let effects = fsm.step(FsmEvent::DeadlineExceeded);
        assert!(effects.contains(&Effect::SafePark));
    }

    #[test]
    fn reset_plan_targets_every_device() {
        let plan = Plan::build(&row(CommandKind::Reset, None), 5000).unwrap();
        let msgs = plan.steps[0].messages();
        // stop + reset per device
        assert_eq!(msgs.len(), 6);
        assert_eq!(plan.steps[0].wait(), WaitFor::AllIdle { devices: DeviceSet::ALL });
    }
}
