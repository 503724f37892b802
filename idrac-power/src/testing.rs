//! In-crate fakes for unit tests

use crate::error::{FetchError, TunnelError};
use crate::model::{Credentials, Endpoint, TargetConfig, TunnelSpec};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::telemetry::{PowerSnapshot, PowerSupply, TelemetryClient};
use crate::tunnel::{Forward, TunnelTransport};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn snapshot(watts: u32) -> PowerSnapshot {
    PowerSnapshot {
        chassis_id: "System.Embedded.1".into(),
        current_watts: Some(watts),
        average_watts: None,
        max_watts: Some(750),
        min_watts: None,
        max_consumed_watts: None,
        power_limit: None,
        average_interval_min: None,
        redundancy: None,
        power_supplies: vec![PowerSupply {
            name: "PS1 Status".into(),
            state: Some("Enabled".into()),
            health: Some("OK".into()),
            capacity_watts: Some(750),
            last_power_output: Some(watts / 2),
            input_watts: Some(watts / 2 + 10),
            output_watts: Some(watts / 2),
            efficiency_percent: Some(91.0),
            line_input_voltage: Some(230.0),
        }],
    }
}

pub fn transient() -> Result<PowerSnapshot, FetchError> {
    Err(FetchError::Transport("connection refused".into()))
}

/// Replays a fixed list of outcomes, then keeps failing
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<PowerSnapshot, FetchError>>>,
    latency: Duration,
    calls: AtomicU32,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<PowerSnapshot, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TelemetryClient for ScriptedClient {
    async fn fetch(
        &self,
        _endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<PowerSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(FetchError::Transport("script exhausted".into())))
    }
}

/// Keeps every emitted event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Forward whose ssh process already died
#[derive(Default)]
pub struct DeadForward {
    pub closed: bool,
}

impl Forward for DeadForward {
    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 40443))
    }

    fn is_alive(&mut self) -> bool {
        false
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Rejects every jumphost login
pub struct RefusingTransport;

impl TunnelTransport for RefusingTransport {
    type Forward = DeadForward;

    async fn open(&self, _target: &TargetConfig, spec: &TunnelSpec) -> Result<DeadForward, TunnelError> {
        Err(TunnelError::Auth {
            jumphost: spec.jumphost.clone(),
            detail: "Permission denied (publickey,password)".into(),
        })
    }
}
