use std::sync::Arc;
use stf_twin::api::{self, AppState};
use stf_twin::devices::{spawn_simulator, ConveyorSim, HbwSim, VgrSim};
use stf_twin::safety::SafetyMonitor;
use stf_twin::{
    BroadcastHub, BusAdapter, Executor, InProcBroker, MemoryStore, SafetyHandle, SharedStore,
    Ticker, TwinConfig,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = Arc::new(TwinConfig::from_env()?);
    info!(
        tick_ms = cfg.tick_ms(),
        poll_ms = cfg.poll_interval.as_millis() as u64,
        addr = %cfg.http_addr,
        "starting cell twin"
    );

    let memory = MemoryStore::new();
    if std::env::var("STF_SEED_DEMO").is_ok() {
        memory.seed_demo_inventory().await;
        info!("seeded demo inventory: 9 slots of RAW_DOUGH CHOCO");
    }
    let store: SharedStore = Arc::new(memory);

    let broker = InProcBroker::new();
    let hub = BroadcastHub::new(cfg.hub_queue_depth);
    let safety = SafetyHandle::new();
    let ticker = Ticker::new(cfg.tick_period);

    // One simulator task per device, each with its own bus client.
    for sim in [
        Box::new(HbwSim::new(rand::random())) as Box<dyn stf_twin::devices::DeviceSim>,
        Box::new(VgrSim::new(rand::random())),
        Box::new(ConveyorSim::new(rand::random())),
    ] {
        let client_id = format!("sim_{}", sim.device().topic_segment());
        let adapter = BusAdapter::connect(&broker, &client_id, cfg.bus_buffer_depth);
        spawn_simulator(sim, &ticker, &adapter, Arc::clone(&store), hub.clone());
    }

    let safety_bus = BusAdapter::connect(&broker, "safety", cfg.bus_buffer_depth);
    SafetyMonitor::new(
        Arc::clone(&store),
        safety_bus,
        hub.clone(),
        safety.clone(),
        cfg.health_safety_floor,
    )
    .await
    .spawn();

    let executor_bus = BusAdapter::connect(&broker, "executor", cfg.bus_buffer_depth);
    Executor::new(
        "executor-1",
        Arc::clone(&cfg),
        Arc::clone(&store),
        executor_bus,
        hub.clone(),
        safety.clone(),
    )
    .spawn();

    let ticker_task = ticker.spawn_periodic();

    let state = AppState {
        cfg: Arc::clone(&cfg),
        store,
        bus: BusAdapter::connect(&broker, "api", cfg.bus_buffer_depth),
        hub,
        safety,
    };
    let addr = cfg.http_addr.clone();

    tokio::select! {
        result = api::serve(state, &addr) => {
            if let Err(e) = result {
                error!(error = %e, "edge server terminated");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    ticker_task.abort();
    Ok(())
}
