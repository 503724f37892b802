/*!
# iDRAC Power DevKit - Mocks and harness for development

Lets the monitoring engine run end to end without hardware:
- Mock Redfish client with scripted outcomes and concurrency tracking
- Mock tunnel transport with injectable login and forward failures
- Test harness recording progress events
*/

pub mod mock_redfish;
pub mod mock_tunnel;
pub mod test_utils;

pub use mock_redfish::{snapshot, transient, MockRedfishClient, SnapshotBuilder};
pub use mock_tunnel::{MockForward, MockTransport};
pub use test_utils::{direct_target, tunneled_target, windowed, RecordingSink, TestHarness};
