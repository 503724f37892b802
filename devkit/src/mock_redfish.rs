/*!
Mock Redfish client for development without controllers

Replays scripted outcomes per controller host, records every call and
tracks how many fetches run at the same time.
*/

use chrono::{DateTime, Utc};
use idrac_power::telemetry::{PowerSnapshot, PowerSupply, Redundancy, TelemetryClient};
use idrac_power::{Credentials, Endpoint, FetchError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded fetch
#[derive(Debug, Clone)]
pub struct FetchRecord {
    /// Controller host (the `Host` header when tunneled)
    pub host: String,
    pub endpoint: String,
    pub tunneled: bool,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<Result<PowerSnapshot, FetchError>>>,
    fallback: HashMap<String, Result<PowerSnapshot, FetchError>>,
    latency: HashMap<String, Duration>,
    calls: Vec<FetchRecord>,
}

/// Mock client standing in for `RedfishClient`
#[derive(Clone, Default)]
pub struct MockRedfishClient {
    state: Arc<Mutex<MockState>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    default_latency: Duration,
}

impl MockRedfishClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch takes at least this long (tokio time, so paused clocks skip it)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Queue outcomes for a host, consumed in order
    pub fn script(&self, host: &str, outcomes: Vec<Result<PowerSnapshot, FetchError>>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(host.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Answer with `snapshot` whenever the host's script is empty
    pub fn always(&self, host: &str, snapshot: PowerSnapshot) -> &Self {
        self.state.lock().unwrap().fallback.insert(host.to_string(), Ok(snapshot));
        self
    }

    /// Fail with `error` whenever the host's script is empty
    pub fn always_fail(&self, host: &str, error: FetchError) -> &Self {
        self.state.lock().unwrap().fallback.insert(host.to_string(), Err(error));
        self
    }

    pub fn set_latency(&self, host: &str, latency: Duration) -> &Self {
        self.state.lock().unwrap().latency.insert(host.to_string(), latency);
        self
    }

    pub fn calls(&self) -> Vec<FetchRecord> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, host: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| c.host == host).count()
    }

    /// Highest number of fetches observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        log::info!("🧹 [MOCK] cleared scripts and call history");
        let mut state = self.state.lock().unwrap();
        state.scripts.clear();
        state.fallback.clear();
        state.calls.clear();
        self.peak.store(0, Ordering::SeqCst);
    }

    fn next_outcome(&self, host: &str) -> (Duration, Result<PowerSnapshot, FetchError>) {
        let mut state = self.state.lock().unwrap();
        let latency = state.latency.get(host).copied().unwrap_or(self.default_latency);
        let outcome = state
            .scripts
            .get_mut(host)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.fallback.get(host).cloned())
            .unwrap_or_else(|| Err(FetchError::Transport(format!("no route to host {}", host))));
        (latency, outcome)
    }
}

/// Decrements the in-flight gauge even when the fetch is cancelled
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TelemetryClient for MockRedfishClient {
    async fn fetch(&self, endpoint: &Endpoint, _credentials: &Credentials) -> Result<PowerSnapshot, FetchError> {
        let host = endpoint.host_header.clone().unwrap_or_else(|| endpoint.host.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        self.state.lock().unwrap().calls.push(FetchRecord {
            host: host.clone(),
            endpoint: endpoint.to_string(),
            tunneled: endpoint.host_header.is_some(),
            at: Utc::now(),
        });

        let (latency, outcome) = self.next_outcome(&host);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        log::debug!("📡 [MOCK] fetch {} -> {}", host, if outcome.is_ok() { "ok" } else { "error" });
        outcome
    }
}

/// Builds snapshots shaped like a two-PSU PowerEdge
pub struct SnapshotBuilder {
    snapshot: PowerSnapshot,
}

impl SnapshotBuilder {
    pub fn new(current_watts: u32) -> Self {
        Self {
            snapshot: PowerSnapshot {
                chassis_id: "System.Embedded.1".to_string(),
                current_watts: Some(current_watts),
                average_watts: None,
                max_watts: Some(1_100),
                min_watts: None,
                max_consumed_watts: None,
                power_limit: None,
                average_interval_min: None,
                redundancy: None,
                power_supplies: Vec::new(),
            },
        }
    }

    pub fn average(mut self, watts: u32, interval_min: u32) -> Self {
        self.snapshot.average_watts = Some(watts);
        self.snapshot.average_interval_min = Some(interval_min);
        self
    }

    pub fn peak(mut self, watts: u32) -> Self {
        self.snapshot.max_consumed_watts = Some(watts);
        self
    }

    pub fn redundancy(mut self, mode: &str, status: &str) -> Self {
        self.snapshot.redundancy = Some(Redundancy {
            mode: Some(mode.to_string()),
            status: Some(status.to_string()),
            min_needed: Some(1),
            max_supported: Some(2),
        });
        self
    }

    /// Active supply carrying `output` watts
    pub fn supply(mut self, name: &str, output: u32, input: u32, efficiency: f64) -> Self {
        self.snapshot.power_supplies.push(PowerSupply {
            name: name.to_string(),
            state: Some("Enabled".to_string()),
            health: Some("OK".to_string()),
            capacity_watts: Some(1_100),
            last_power_output: Some(output),
            input_watts: Some(input),
            output_watts: Some(output),
            efficiency_percent: Some(efficiency),
            line_input_voltage: Some(230.0),
        });
        self
    }

    /// Hot-spare supply reporting no load figures
    pub fn standby_supply(mut self, name: &str) -> Self {
        self.snapshot.power_supplies.push(PowerSupply {
            name: name.to_string(),
            state: Some("StandbySpare".to_string()),
            health: Some("OK".to_string()),
            capacity_watts: Some(1_100),
            last_power_output: None,
            input_watts: None,
            output_watts: None,
            efficiency_percent: None,
            line_input_voltage: Some(230.0),
        });
        self
    }

    pub fn build(self) -> PowerSnapshot {
        self.snapshot
    }
}

/// Typical reading: one loaded supply, one hot spare
pub fn snapshot(watts: u32) -> PowerSnapshot {
    SnapshotBuilder::new(watts)
        .supply("PS1 Status", watts, watts + watts / 10, 92.0)
        .standby_supply("PS2 Status")
        .build()
}

pub fn transient(detail: &str) -> Result<PowerSnapshot, FetchError> {
    Err(FetchError::Transport(detail.to_string()))
}
