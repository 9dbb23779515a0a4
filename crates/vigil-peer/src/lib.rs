//! Per-peer runtime for the Vigil activity monitor. Wires the pure core
//! (election, scheduling, change detection) to a real bus, clock, and
//! fetcher behind injectable ports, and runs the coordinator loop that keeps
//! exactly one peer polling upstream while the rest mirror its snapshots.

pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod fetch;
pub mod store;

pub use bus::{ChannelBus, LoopbackBus, LoopbackGroup};
#[cfg(unix)]
pub use bus::UdsBus;
pub use clock::{Clock, SystemClock, VisibilityFlag, VisibilityProbe};
pub use config::{ConfigError, ConfigStore};
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorSetup, PeerEvent,
};
pub use fetch::{ActivityFetcher, FetchError, FetchOutcome};
pub use store::{StateStore, StoreError};
