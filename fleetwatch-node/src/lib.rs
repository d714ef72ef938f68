//! fleetwatch node: discovers the devices of its subnet, keeps their
//! status and backup staleness current, and relays commands to them.

pub mod backup;
pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod http;
pub mod logging;
pub mod network;
pub mod orchestrator;
pub mod probe;
pub mod refresh;
pub mod registry;
pub mod scanner;
pub mod scheduler;
pub mod self_update;
pub mod transport;

pub use config::NodeConfig;
pub use dispatch::{DeviceAction, DispatchError};
pub use orchestrator::{Orchestrator, SweepError, SweepSummary};
pub use registry::{DeviceRecord, Registry, RegistryHandle, Snapshot};
pub use transport::{DeviceRequest, DeviceResponse, DeviceTransport, HttpTransport, TransportError};
