//! Shared harness: a full cell (simulators, executor, safety monitor)
//! running against the in-memory store and in-process broker, with the
//! clock accelerated so 100 ms simulation ticks fire every 2 ms of wall
//! time.

use std::sync::Arc;
use std::time::Duration;
use stf_twin::devices::{spawn_simulator, ConveyorSim, DeviceSim, HbwSim, VgrSim};
use stf_twin::model::{CommandRow, CommandStatus};
use stf_twin::safety::SafetyMonitor;
use stf_twin::{
    BroadcastHub, BusAdapter, Executor, InProcBroker, MemoryStore, SafetyHandle, SharedStore,
    Ticker, TwinConfig,
};
use tokio::task::JoinHandle;

pub struct TestCell {
    pub cfg: Arc<TwinConfig>,
    pub store: SharedStore,
    pub broker: InProcBroker,
    pub hub: BroadcastHub,
    pub safety: SafetyHandle,
    pub executor_bus: BusAdapter,
    tasks: Vec<JoinHandle<()>>,
}

impl TestCell {
    pub async fn start(seed_demo: bool) -> Self {
        let cfg = Arc::new(TwinConfig {
            poll_interval: Duration::from_millis(20),
            bake_time: Duration::from_millis(200),
            op_timeout: Duration::from_secs(10),
            ..TwinConfig::default()
        });

        let memory = MemoryStore::new();
        if seed_demo {
            memory.seed_demo_inventory().await;
        }
        let store: SharedStore = Arc::new(memory);

        let broker = InProcBroker::new();
        let hub = BroadcastHub::new(cfg.hub_queue_depth);
        let safety = SafetyHandle::new();
        let ticker = Ticker::new(cfg.tick_period);
        let mut tasks = Vec::new();

        let sims: [Box<dyn DeviceSim>; 3] = [
            Box::new(HbwSim::new(11)),
            Box::new(VgrSim::new(22)),
            Box::new(ConveyorSim::new(33)),
        ];
        for sim in sims {
            let client_id = format!("sim_{}", sim.device().topic_segment());
            let adapter = BusAdapter::connect(&broker, &client_id, cfg.bus_buffer_depth);
            tasks.push(spawn_simulator(
                sim,
                &ticker,
                &adapter,
                Arc::clone(&store),
                hub.clone(),
            ));
        }

        let safety_bus = BusAdapter::connect(&broker, "safety", cfg.bus_buffer_depth);
        tasks.push(
            SafetyMonitor::new(
                Arc::clone(&store),
                safety_bus,
                hub.clone(),
                safety.clone(),
                cfg.health_safety_floor,
            )
            .await
            .spawn(),
        );

        let executor_bus = BusAdapter::connect(&broker, "executor", cfg.bus_buffer_depth);
        tasks.push(
            Executor::new(
                "exec-test",
                Arc::clone(&cfg),
                Arc::clone(&store),
                executor_bus.clone(),
                hub.clone(),
                safety.clone(),
            )
            .spawn(),
        );

        // Accelerated clock: nominal 100 ms ticks, fired every 2 ms.
        let fire = ticker.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                fire.fire();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }));

        Self {
            cfg,
            store,
            broker,
            hub,
            safety,
            executor_bus,
            tasks,
        }
    }

    /// Poll the queue row until it reaches a terminal state.
    pub async fn wait_terminal(&self, id: i64, wall: Duration) -> CommandRow {
        let deadline = tokio::time::Instant::now() + wall;
        loop {
            let row = self.store.get_command(id).await.expect("row exists");
            if row.status.is_terminal() {
                return row;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("command {id} still {:?} after {wall:?}", row.status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the row has been claimed.
    pub async fn wait_in_progress(&self, id: i64, wall: Duration) {
        let deadline = tokio::time::Instant::now() + wall;
        loop {
            let row = self.store.get_command(id).await.expect("row exists");
            if row.status == CommandStatus::InProgress {
                return;
            }
            if row.status.is_terminal() {
                panic!("command {id} went terminal before IN_PROGRESS");
            }
            if tokio::time::Instant::now() > deadline {
                panic!("command {id} never claimed");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for TestCell {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
