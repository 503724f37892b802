//! iDRAC power fleet monitor
//!
//! Polls Dell iDRAC controllers over Redfish for power telemetry, directly or
//! through SSH jumphost tunnels, and reports a single reading or averages over
//! a sampling window for one server or a whole fleet.
//!
//! Pipeline per target: `tunnel` -> `collector` (retry) -> `sampler` (cadence),
//! fanned out by `fleet` under a worker ceiling, rendered by `report`.

pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod fleet;
pub mod inventory;
pub mod model;
pub mod progress;
pub mod report;
pub mod sampler;
pub mod shutdown;
pub mod telemetry;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use collector::{RetryEvent, RetryPolicy, RetryingCollector};
pub use error::{CollectionError, ContractError, FetchError, TargetError, TunnelError};
pub use fleet::{FleetMonitor, FleetResult, TargetResult, TargetStatus};
pub use model::{Credentials, Endpoint, MonitorMode, TargetConfig, TunnelAuth, TunnelSpec};
pub use progress::{NullSink, ProgressEvent, ProgressSink, TracingSink};
pub use sampler::{Sample, SampleWindow, Sampler};
pub use shutdown::{listen_for_signals, stop_channel, StopHandle, StopSignal};
pub use telemetry::{PowerSnapshot, PowerSupply, RedfishClient, Redundancy, TelemetryClient};
pub use tunnel::{Forward, SshTransport, TunnelHandle, TunnelManager, TunnelTransport};
