//! Fleet orchestrator: one pipeline per target under a bounded worker pool
//!
//! Each pipeline is {tunnel acquire -> sampler run -> tunnel release}. Pipelines
//! are tokio tasks in a `JoinSet`; a semaphore caps how many run at once.
//! Failures and panics stay inside their pipeline and become a `failed`
//! result. Results are re-ordered to match the input before returning.

use crate::collector::RetryPolicy;
use crate::error::TargetError;
use crate::model::{MonitorMode, TargetConfig};
use crate::progress::{ProgressEvent, ProgressSink, TracingSink};
use crate::sampler::{SampleWindow, Sampler};
use crate::shutdown::StopSignal;
use crate::telemetry::TelemetryClient;
use crate::tunnel::{TunnelManager, TunnelTransport};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Outcome class of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Ok,
    Partial,
    Failed,
}

impl TargetStatus {
    /// `ok` when every expected sample arrived, `failed` when none did
    pub fn classify(window: &SampleWindow) -> Self {
        let succeeded = window.succeeded();
        if succeeded == 0 {
            TargetStatus::Failed
        } else if succeeded >= window.expected() && window.failed() == 0 {
            TargetStatus::Ok
        } else {
            TargetStatus::Partial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Ok => "ok",
            TargetStatus::Partial => "partial",
            TargetStatus::Failed => "failed",
        }
    }

    pub fn has_data(&self) -> bool {
        !matches!(self, TargetStatus::Failed)
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome for one target
#[derive(Debug)]
pub struct TargetResult {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub jumphost: Option<String>,
    pub status: TargetStatus,
    pub window: SampleWindow,
    /// Last error seen, only when status is not `ok`
    pub error: Option<TargetError>,
}

impl TargetResult {
    fn new(target: &TargetConfig, status: TargetStatus, window: SampleWindow, error: Option<TargetError>) -> Self {
        Self {
            name: target.name.clone(),
            host: target.host.clone(),
            port: target.port,
            jumphost: target.tunnel.as_ref().map(|t| t.jumphost.clone()),
            status,
            window,
            error,
        }
    }

    pub fn from_window(target: &TargetConfig, window: SampleWindow) -> Self {
        let status = TargetStatus::classify(&window);
        let error = if status == TargetStatus::Ok {
            None
        } else if let Some(err) = window.last_error() {
            Some(TargetError::Collection(err.clone()))
        } else if window.is_interrupted() {
            Some(TargetError::Interrupted)
        } else {
            None
        };
        Self::new(target, status, window, error)
    }

    pub fn failed(target: &TargetConfig, mode: MonitorMode, error: TargetError) -> Self {
        Self::new(target, TargetStatus::Failed, SampleWindow::empty(mode), Some(error))
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// All target results of a run, in input order
#[derive(Debug)]
pub struct FleetResult {
    pub results: Vec<TargetResult>,
    pub total: usize,
    /// `ok` plus `partial`
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub interrupted: bool,
}

impl FleetResult {
    pub fn from_results(results: Vec<TargetResult>, interrupted: bool) -> Self {
        let count = |status: TargetStatus| results.iter().filter(|r| r.status == status).count();
        let partial = count(TargetStatus::Partial);
        let failed = count(TargetStatus::Failed);
        let succeeded = count(TargetStatus::Ok) + partial;

        Self {
            total: results.len(),
            succeeded,
            partial,
            failed,
            interrupted,
            results,
        }
    }

    /// The run counts as successful when at least one target produced data
    pub fn exit_success(&self) -> bool {
        self.succeeded > 0
    }
}

/// Runs monitoring pipelines for a fleet
pub struct FleetMonitor<C, T> {
    client: Arc<C>,
    tunnels: Arc<TunnelManager<T>>,
    sink: Arc<dyn ProgressSink>,
    policy: RetryPolicy,
}

impl<C: TelemetryClient, T: TunnelTransport> FleetMonitor<C, T> {
    pub fn new(client: C, transport: T) -> Self {
        Self {
            client: Arc::new(client),
            tunnels: Arc::new(TunnelManager::new(transport)),
            sink: Arc::new(TracingSink),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn tunnels(&self) -> &TunnelManager<T> {
        &self.tunnels
    }

    /// Monitor every target with at most `max_workers` pipelines at once.
    ///
    /// Always returns exactly one result per target, in input order. After
    /// `stop` fires, queued targets are reported as interrupted and running
    /// ones keep the samples gathered so far.
    pub async fn monitor(
        &self,
        targets: &[TargetConfig],
        mode: MonitorMode,
        max_workers: usize,
        stop: StopSignal,
    ) -> FleetResult {
        let workers = max_workers.max(1);
        self.sink.emit(&ProgressEvent::FleetStarted {
            targets: targets.len(),
            max_workers: workers,
        });

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set = JoinSet::new();

        for (index, target) in targets.iter().enumerate() {
            let target = target.clone();
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let tunnels = self.tunnels.clone();
            let sink = self.sink.clone();
            let policy = self.policy;
            let mut stop = stop.clone();

            join_set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = stop.stopped() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };

                let result = match permit {
                    None => TargetResult::failed(&target, mode, TargetError::Interrupted),
                    Some(_permit) => {
                        let unit = run_pipeline(&*client, &tunnels, &*sink, policy, &target, mode, stop);
                        match AssertUnwindSafe(unit).catch_unwind().await {
                            Ok(result) => result,
                            Err(payload) => {
                                let message = panic_message(payload);
                                error!("[{}] monitoring task panicked: {}", target.name, message);
                                TargetResult::failed(&target, mode, TargetError::Aborted(message))
                            }
                        }
                    }
                };

                sink.emit(&ProgressEvent::TargetFinished {
                    target: target.name.clone(),
                    status: result.status,
                    detail: result.error_message(),
                });
                (index, result)
            });
        }

        let mut slots: Vec<Option<TargetResult>> = targets.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(result);
                    }
                }
                Err(e) => error!("Monitoring task failed to complete: {}", e),
            }
        }

        let results = slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| {
                    TargetResult::failed(target, mode, TargetError::Aborted("task did not complete".into()))
                })
            })
            .collect();

        let interrupted = stop.is_stopped();
        if interrupted {
            self.sink.emit(&ProgressEvent::Interrupted);
        }

        let fleet = FleetResult::from_results(results, interrupted);
        debug!(
            "Fleet done: {} total, {} succeeded, {} partial, {} failed",
            fleet.total, fleet.succeeded, fleet.partial, fleet.failed
        );
        fleet
    }
}

async fn run_pipeline<C: TelemetryClient, T: TunnelTransport>(
    client: &C,
    tunnels: &TunnelManager<T>,
    sink: &dyn ProgressSink,
    policy: RetryPolicy,
    target: &TargetConfig,
    mode: MonitorMode,
    stop: StopSignal,
) -> TargetResult {
    sink.emit(&ProgressEvent::TargetStarted {
        target: target.name.clone(),
    });

    let mut watch = stop.clone();
    let acquired = tokio::select! {
        biased;
        _ = watch.stopped() => {
            return TargetResult::failed(target, mode, TargetError::Interrupted);
        }
        acquired = tunnels.acquire(target) => acquired,
    };

    let mut handle = match acquired {
        Ok(handle) => handle,
        Err(err) => {
            warn!("[{}] tunnel setup failed: {}", target.name, err);
            return TargetResult::failed(target, mode, TargetError::Tunnel(err));
        }
    };

    if let (Some(jumphost), Some(local)) = (handle.jumphost(), handle.local_addr()) {
        sink.emit(&ProgressEvent::TunnelUp {
            target: target.name.clone(),
            jumphost: jumphost.to_string(),
            local,
        });
    }

    let window = Sampler::new(client, policy, sink, stop)
        .run(target, &mut handle, mode)
        .await;
    tunnels.release(&mut handle);

    TargetResult::from_window(target, window)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
