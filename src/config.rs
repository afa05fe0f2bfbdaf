use crate::error::ConfigError;
use std::time::Duration;

/// Runtime configuration, read from `STF_*` environment variables with
/// defaults suitable for a local cell.
#[derive(Debug, Clone)]
pub struct TwinConfig {
    /// Simulation tick period.
    pub tick_period: Duration,
    /// Durable store locator. `memory://` selects the in-tree engine.
    pub database_url: String,
    /// Bus broker locator. `inproc://` selects the in-tree broker.
    pub broker_url: String,
    /// Executor queue poll interval.
    pub poll_interval: Duration,
    /// Per-operation wait timeout.
    pub op_timeout: Duration,
    /// Per-command overall deadline.
    pub command_deadline: Duration,
    /// Broadcast hub per-subscriber queue depth.
    pub hub_queue_depth: usize,
    /// Bus adapter offline buffer depth.
    pub bus_buffer_depth: usize,
    /// PROCESS bake duration.
    pub bake_time: Duration,
    /// HTTP edge bind address.
    pub http_addr: String,
    /// Motor health below this latches the emergency path.
    pub health_safety_floor: f64,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(100),
            database_url: "memory://".into(),
            broker_url: "inproc://".into(),
            poll_interval: Duration::from_millis(200),
            op_timeout: Duration::from_secs(30),
            command_deadline: Duration::from_secs(600),
            hub_queue_depth: 256,
            bus_buffer_depth: 1024,
            bake_time: Duration::from_millis(5000),
            http_addr: "127.0.0.1:8000".into(),
            health_safety_floor: 0.1,
        }
    }
}

impl TwinConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(ms) = read_u64("STF_TICK_MS")? {
            cfg.tick_period = Duration::from_millis(ms);
        }
        if let Ok(url) = std::env::var("STF_DATABASE_URL") {
            cfg.database_url = url;
        }
        if let Ok(url) = std::env::var("STF_BROKER_URL") {
            cfg.broker_url = url;
        }
        if let Some(ms) = read_u64("STF_POLL_MS")? {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(s) = read_u64("STF_OP_TIMEOUT_S")? {
            cfg.op_timeout = Duration::from_secs(s);
        }
        if let Some(s) = read_u64("STF_CMD_DEADLINE_S")? {
            cfg.command_deadline = Duration::from_secs(s);
        }
        if let Some(n) = read_u64("STF_HUB_QUEUE")? {
            cfg.hub_queue_depth = n as usize;
        }
        if let Some(n) = read_u64("STF_BUS_BUFFER")? {
            cfg.bus_buffer_depth = n as usize;
        }
        if let Some(ms) = read_u64("STF_BAKE_MS")? {
            cfg.bake_time = Duration::from_millis(ms);
        }
        if let Ok(addr) = std::env::var("STF_HTTP_ADDR") {
            cfg.http_addr = addr;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period.is_zero() {
            return Err(ConfigError::NonPositive { var: "STF_TICK_MS" });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NonPositive { var: "STF_POLL_MS" });
        }
        if self.op_timeout.is_zero() {
            return Err(ConfigError::NonPositive { var: "STF_OP_TIMEOUT_S" });
        }
        if self.command_deadline < self.op_timeout {
            return Err(ConfigError::Invalid {
                var: "STF_CMD_DEADLINE_S",
                value: "deadline shorter than a single operation timeout".into(),
            });
        }
        if self.hub_queue_depth == 0 {
            return Err(ConfigError::NonPositive { var: "STF_HUB_QUEUE" });
        }
        if self.bus_buffer_depth == 0 {
            return Err(ConfigError::NonPositive { var: "STF_BUS_BUFFER" });
        }
        Ok(())
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_period.as_millis() as u64
    }
}

fn read_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TwinConfig::default().validate().unwrap();
    }

    #[test]
    fn deadline_must_cover_one_operation() {
        let cfg = TwinConfig {
            command_deadline: Duration::from_secs(1),
            op_timeout: Duration::from_secs(30),
            ..TwinConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
