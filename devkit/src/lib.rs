/*!
# fleetwatch devkit - test doubles for the node

- In-memory device transport with call recording and in-flight accounting
- Device builder that installs identity and status replies
- Temporary backup trees with controlled file ages
- A harness wiring all of the above into an orchestrator
*/

pub mod device_builder;
pub mod mock_transport;
pub mod test_utils;

pub use device_builder::MockDevice;
pub use mock_transport::{MockReply, MockTransport};
pub use test_utils::{init_logging, BackupTree, FleetHarness};
