/*!
Test harness for fleet runs

Wires a `FleetMonitor` to the mock client and mock transport, records
every progress event and offers assertions over the outcome.
*/

use crate::mock_redfish::MockRedfishClient;
use crate::mock_tunnel::MockTransport;
use anyhow::{bail, Result};
use idrac_power::{
    Credentials, FleetMonitor, FleetResult, MonitorMode, ProgressEvent, ProgressSink,
    RetryPolicy, StopSignal, TargetConfig, TargetStatus, TunnelAuth, TunnelSpec,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sink keeping every event, shareable with the monitor
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&ProgressEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Complete mock environment for one fleet run
pub struct TestHarness {
    pub client: MockRedfishClient,
    pub transport: MockTransport,
    pub sink: RecordingSink,
    pub policy: RetryPolicy,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        Self {
            client: MockRedfishClient::new(),
            transport: MockTransport::new(),
            sink: RecordingSink::default(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_client(mut self, client: MockRedfishClient) -> Self {
        self.client = client;
        self
    }

    pub fn monitor(&self) -> FleetMonitor<MockRedfishClient, MockTransport> {
        FleetMonitor::new(self.client.clone(), self.transport.clone())
            .with_sink(Arc::new(self.sink.clone()))
            .with_retry_policy(self.policy)
    }

    pub async fn run(&self, targets: &[TargetConfig], mode: MonitorMode, max_workers: usize) -> FleetResult {
        self.run_until(targets, mode, max_workers, StopSignal::never()).await
    }

    pub async fn run_until(
        &self,
        targets: &[TargetConfig],
        mode: MonitorMode,
        max_workers: usize,
        stop: StopSignal,
    ) -> FleetResult {
        log::info!("🧪 Running {} target(s) with {} worker(s)", targets.len(), max_workers);
        self.monitor().monitor(targets, mode, max_workers, stop).await
    }

    pub fn assert_status(&self, fleet: &FleetResult, name: &str, expected: TargetStatus) -> Result<()> {
        let Some(result) = fleet.results.iter().find(|r| r.name == name) else {
            bail!("no result for target {}", name);
        };
        if result.status != expected {
            bail!(
                "target {}: expected {}, got {} ({:?})",
                name,
                expected,
                result.status,
                result.error_message()
            );
        }
        Ok(())
    }

    /// Every tunnel that was opened has been closed
    pub fn assert_tunnels_released(&self) -> Result<()> {
        let open = self.transport.open_now();
        if open != 0 {
            bail!(
                "{} tunnel(s) still open ({} opened, {} closed)",
                open,
                self.transport.open_count(),
                self.transport.close_count()
            );
        }
        Ok(())
    }
}

/// Direct target named after its host
pub fn direct_target(host: &str) -> TargetConfig {
    TargetConfig::new(host, host, 443, Credentials::new("root", "calvin"))
}

/// Target reached through `jumphost` with agent auth
pub fn tunneled_target(host: &str, jumphost: &str) -> TargetConfig {
    direct_target(host).with_tunnel(TunnelSpec::new(jumphost, Some("ops".to_string()), TunnelAuth::Agent))
}

pub fn windowed(duration_secs: u64, interval_secs: u64) -> MonitorMode {
    MonitorMode::Windowed {
        duration: Duration::from_secs(duration_secs),
        interval: Duration::from_secs(interval_secs),
    }
}
