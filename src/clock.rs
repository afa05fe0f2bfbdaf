use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

const TICK_CHANNEL_CAPACITY: usize = 64;

/// One discrete step of simulated time. `now_ms` is monotonic and advances
/// by the nominal `dt_ms` regardless of wall-clock jitter; a late tick is
/// counted as an overrun, never stretched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub seq: u64,
    pub now_ms: u64,
    pub dt_ms: u64,
}

impl Tick {
    pub fn dt_secs(&self) -> f64 {
        self.dt_ms as f64 / 1000.0
    }
}

/// Single source of simulated time. Every simulator subscribes here; a
/// subscriber that is still busy when the next tick fires simply observes
/// the channel lagging, which keeps its own tick handling non-overlapping.
#[derive(Clone)]
pub struct Ticker {
    tx: broadcast::Sender<Tick>,
    seq: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
    dt_ms: u64,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let (tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicU64::new(0)),
            dt_ms: period.as_millis() as u64,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Tick> {
        self.tx.subscribe()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Emit one tick immediately. The periodic driver calls this; tests can
    /// call it directly to step simulated time deterministically.
    pub fn fire(&self) -> Tick {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let tick = Tick {
            seq,
            now_ms: seq * self.dt_ms,
            dt_ms: self.dt_ms,
        };
        // No receivers yet is fine; simulators may still be starting up.
        let _ = self.tx.send(tick);
        tick
    }

    /// Drive the ticker at its fixed period until the task is aborted.
    pub fn spawn_periodic(&self) -> tokio::task::JoinHandle<()> {
        let ticker = self.clone();
        let period = Duration::from_millis(ticker.dt_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // A missed deadline schedules the next tick immediately; dt is
            // never inflated to catch up.
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            let mut last = Instant::now();
            loop {
                interval.tick().await;
                let now = Instant::now();
                if now.duration_since(last) > period * 2 {
                    let n = ticker.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(target: "stf_twin::clock", overruns = n, "tick overrun");
                }
                last = now;
                ticker.fire();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fired_ticks_are_sequential_and_monotonic() {
        let ticker = Ticker::new(Duration::from_millis(100));
        let mut rx = ticker.subscribe();

        let t1 = ticker.fire();
        let t2 = ticker.fire();
        assert_eq!(t1.seq + 1, t2.seq);
        assert!(t2.now_ms > t1.now_ms);
        assert_eq!(t1.dt_ms, 100);

        assert_eq!(rx.recv().await.unwrap(), t1);
        assert_eq!(rx.recv().await.unwrap(), t2);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_ticks() {
        let ticker = Ticker::new(Duration::from_millis(100));
        ticker.fire();
        let mut rx = ticker.subscribe();
        let t = ticker.fire();
        assert_eq!(rx.recv().await.unwrap().seq, t.seq);
    }
}
