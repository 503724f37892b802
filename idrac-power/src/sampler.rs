//! Sampler: drives the retrying collector on a fixed cadence and aggregates the window
//!
//! - Instant mode: one collection
//! - Windowed mode: `ceil(duration / interval)` ticks paced by wall clock; a slow
//!   collection pushes the next tick to "now" instead of bursting to catch up
//! - A failed sample never ends the run; it is counted and the next tick proceeds

use crate::collector::{RetryPolicy, RetryingCollector};
use crate::error::CollectionError;
use crate::model::{Endpoint, MonitorMode, TargetConfig};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::shutdown::StopSignal;
use crate::telemetry::{round_tenth, PowerSnapshot, TelemetryClient};
use crate::tunnel::{Forward, TunnelHandle};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// One successful telemetry read
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub snapshot: PowerSnapshot,
}

impl Sample {
    pub fn new(snapshot: PowerSnapshot) -> Self {
        Self {
            timestamp: Utc::now(),
            snapshot,
        }
    }

    pub fn system_watts(&self) -> Option<u32> {
        self.snapshot.current_watts
    }
}

/// Mean/min/max over the readings that were present
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl FieldStats {
    /// `None` when there is nothing to aggregate ("no data", never zero)
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }

        (count > 0).then(|| FieldStats {
            count,
            mean: sum / count as f64,
            min,
            max,
        })
    }
}

/// Aggregates for one power supply across a window
#[derive(Debug, Clone, PartialEq)]
pub struct SupplyStats {
    pub name: String,
    pub state: Option<String>,
    pub health: Option<String>,
    pub capacity_watts: Option<u32>,
    pub output_watts: Option<FieldStats>,
    pub input_watts: Option<FieldStats>,
    pub efficiency_percent: Option<FieldStats>,
}

/// Aggregates for a whole window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub system_watts: Option<FieldStats>,
    pub supplies: Vec<SupplyStats>,
}

/// Samples and attempt counters for one target's run
#[derive(Debug, Clone)]
pub struct SampleWindow {
    mode: MonitorMode,
    expected: u32,
    samples: Vec<Sample>,
    failed: u32,
    last_error: Option<CollectionError>,
    interrupted: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl SampleWindow {
    pub fn new(mode: MonitorMode) -> Self {
        Self {
            mode,
            expected: mode.expected_samples(),
            samples: Vec::new(),
            failed: 0,
            last_error: None,
            interrupted: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Finalized window with no attempts (target never reached the sampler)
    pub fn empty(mode: MonitorMode) -> Self {
        let mut window = Self::new(mode);
        window.finish();
        window
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn attempted(&self) -> u32 {
        self.succeeded() + self.failed
    }

    pub fn succeeded(&self) -> u32 {
        self.samples.len() as u32
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn last_error(&self) -> Option<&CollectionError> {
        self.last_error.as_ref()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    fn record_success(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    fn record_failure(&mut self, err: CollectionError) {
        self.failed += 1;
        self.last_error = Some(err);
    }

    fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    fn finish(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Statistics over succeeded samples; `None` when the window holds no data
    pub fn stats(&self) -> Option<WindowStats> {
        if self.samples.is_empty() {
            return None;
        }

        let system_watts = FieldStats::from_values(
            self.samples.iter().filter_map(|s| s.system_watts()).map(f64::from),
        );

        // Grouped by PSU name, in first-seen order
        let mut names: Vec<&str> = Vec::new();
        for sample in &self.samples {
            for ps in &sample.snapshot.power_supplies {
                if !names.contains(&ps.name.as_str()) {
                    names.push(&ps.name);
                }
            }
        }

        let supplies = names
            .into_iter()
            .map(|name| {
                let readings: Vec<_> = self
                    .samples
                    .iter()
                    .flat_map(|s| s.snapshot.power_supplies.iter())
                    .filter(|ps| ps.name == name)
                    .collect();
                let last = readings.last().copied();

                SupplyStats {
                    name: name.to_string(),
                    state: last.and_then(|ps| ps.state.clone()),
                    health: last.and_then(|ps| ps.health.clone()),
                    capacity_watts: readings.iter().find_map(|ps| ps.capacity_watts),
                    output_watts: FieldStats::from_values(
                        readings.iter().filter_map(|ps| ps.output_watts).map(f64::from),
                    ),
                    input_watts: FieldStats::from_values(
                        readings.iter().filter_map(|ps| ps.input_watts).map(f64::from),
                    ),
                    efficiency_percent: FieldStats::from_values(
                        readings.iter().filter_map(|ps| ps.efficiency_percent),
                    )
                    .map(|mut stats| {
                        stats.mean = round_tenth(stats.mean);
                        stats
                    }),
                }
            })
            .collect();

        Some(WindowStats {
            system_watts,
            supplies,
        })
    }
}

#[cfg(test)]
impl SampleWindow {
    pub(crate) fn push_for_test(&mut self, snapshot: PowerSnapshot) {
        self.record_success(Sample::new(snapshot));
    }

    pub(crate) fn fail_for_test(&mut self) {
        self.record_failure(CollectionError::Exhausted {
            attempts: 3,
            last_cause: crate::error::FetchError::Transport("operation timed out".into()),
        });
    }
}

/// Runs one target's collection schedule
pub struct Sampler<'a, C> {
    collector: RetryingCollector<'a, C>,
    sink: &'a dyn ProgressSink,
    stop: StopSignal,
}

impl<'a, C: TelemetryClient> Sampler<'a, C> {
    pub fn new(client: &'a C, policy: RetryPolicy, sink: &'a dyn ProgressSink, stop: StopSignal) -> Self {
        Self {
            collector: RetryingCollector::new(client, policy),
            sink,
            stop,
        }
    }

    /// Collect according to `mode` through `tunnel` and return the finalized window
    pub async fn run<F: Forward>(
        &self,
        target: &TargetConfig,
        tunnel: &mut TunnelHandle<F>,
        mode: MonitorMode,
    ) -> SampleWindow {
        let mut window = SampleWindow::new(mode);

        match mode {
            MonitorMode::Instant => self.run_instant(target, tunnel, &mut window).await,
            MonitorMode::Windowed { duration, interval } => {
                self.run_windowed(target, tunnel, duration, interval, &mut window)
                    .await
            }
        }

        window.finish();
        debug!(
            "[{}] window closed: {}/{} samples, {} failed",
            target.name,
            window.succeeded(),
            window.expected(),
            window.failed()
        );
        window
    }

    async fn run_instant<F: Forward>(
        &self,
        target: &TargetConfig,
        tunnel: &mut TunnelHandle<F>,
        window: &mut SampleWindow,
    ) {
        let mut stop = self.stop.clone();
        let endpoint = tunnel.endpoint().clone();
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = stop.stopped() => {
                window.mark_interrupted();
                return;
            }
            outcome = self.collect_once(target, &endpoint) => outcome,
        };

        self.record(target, window, 1, outcome, started, started);
    }

    async fn run_windowed<F: Forward>(
        &self,
        target: &TargetConfig,
        tunnel: &mut TunnelHandle<F>,
        duration: Duration,
        interval: Duration,
        window: &mut SampleWindow,
    ) {
        let mut stop = self.stop.clone();
        let endpoint = tunnel.endpoint().clone();
        let expected = window.expected();
        let mut tunnel_lost_reported = false;

        self.sink.emit(&ProgressEvent::WindowStarted {
            target: target.name.clone(),
            expected,
            interval,
        });

        let started = Instant::now();
        let deadline = started + duration;
        let mut next_tick = started;

        for index in 1..=expected {
            if index > 1 && next_tick >= deadline {
                break;
            }

            tokio::select! {
                biased;
                _ = stop.stopped() => {
                    window.mark_interrupted();
                    break;
                }
                _ = sleep_until(next_tick) => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = stop.stopped() => {
                    window.mark_interrupted();
                    break;
                }
                outcome = self.collect_once(target, &endpoint) => outcome,
            };

            let exhausted = matches!(outcome, Err(CollectionError::Exhausted { .. }));
            self.record(target, window, index, outcome, started, deadline);

            // Re-establishing the forward is left to the next run
            if exhausted && !tunnel_lost_reported && tunnel.is_tunneled() && !tunnel.is_alive() {
                tunnel_lost_reported = true;
                self.sink.emit(&ProgressEvent::TunnelLost {
                    target: target.name.clone(),
                });
            }

            next_tick = (next_tick + interval).max(Instant::now());
        }
    }

    async fn collect_once(
        &self,
        target: &TargetConfig,
        endpoint: &Endpoint,
    ) -> Result<Sample, CollectionError> {
        let sink = self.sink;
        let name = target.name.as_str();

        self.collector
            .collect(endpoint, &target.credentials, |event| {
                sink.emit(&ProgressEvent::Retry {
                    target: name.to_string(),
                    event,
                })
            })
            .await
    }

    fn record(
        &self,
        target: &TargetConfig,
        window: &mut SampleWindow,
        index: u32,
        outcome: Result<Sample, CollectionError>,
        started: Instant,
        deadline: Instant,
    ) {
        let expected = window.expected();

        match outcome {
            Ok(sample) => {
                let now = Instant::now();
                self.sink.emit(&ProgressEvent::SampleCollected {
                    target: target.name.clone(),
                    index,
                    expected,
                    watts: sample.system_watts(),
                    elapsed: now.duration_since(started),
                    remaining: deadline.saturating_duration_since(now),
                });
                window.record_success(sample);
            }
            Err(err) => {
                self.sink.emit(&ProgressEvent::SampleSkipped {
                    target: target.name.clone(),
                    index,
                    expected,
                    reason: err.to_string(),
                });
                window.record_failure(err);
            }
        }
    }
}
