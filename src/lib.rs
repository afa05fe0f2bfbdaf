//! # STF Cell Twin
//!
//! Digital twin of a small high-bay warehouse cell: a storage/retrieval
//! machine (HBW), a conveyor with light barriers, and a vacuum gripper
//! robot (VGR). The crate accepts factory orders, decomposes them into
//! device motion plans, runs a fixed-rate physics simulation of the
//! devices, and streams the resulting state to observers.
//!
//! ## Architecture
//!
//! - [`clock`] - single tick source, 100 ms nominal
//! - [`devices`] - one simulator task per device: kinematics, electrical
//!   and wear models, sensor geometry
//! - [`bus`] - topic-based pub/sub adapter with offline buffering
//! - [`executor`] - durable command queue executor: claim, per-command
//!   FSM, failure handling
//! - [`hub`] - backpressure-aware fan-out to live observers
//! - [`store`] - durable store seam plus the in-memory engine
//! - [`safety`] - emergency latch and health monitoring
//! - [`api`] - HTTP/WebSocket edge
//!
//! Tasks share nothing mutable: all cross-task communication runs over the
//! bus, the store, or the hub.

pub mod api;
pub mod bus;
pub mod clock;
pub mod config;
pub mod devices;
pub mod error;
pub mod executor;
pub mod hub;
pub mod model;
pub mod safety;
pub mod store;

pub use bus::{BusAdapter, InProcBroker};
pub use clock::{Tick, Ticker};
pub use config::TwinConfig;
pub use executor::Executor;
pub use hub::BroadcastHub;
pub use safety::SafetyHandle;
pub use store::{MemoryStore, SharedStore, TwinStore};
