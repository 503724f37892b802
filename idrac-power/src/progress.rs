//! Progress reporting for long runs
//!
//! The engine never formats output itself: it emits `ProgressEvent`s into a
//! `ProgressSink`. `TracingSink` logs them, `NullSink` drops them (`--quiet`).
//! Suppressing progress never changes what gets collected.

use crate::collector::RetryEvent;
use crate::fleet::TargetStatus;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Observable milestones of a monitoring run
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    FleetStarted {
        targets: usize,
        max_workers: usize,
    },
    TargetStarted {
        target: String,
    },
    TunnelUp {
        target: String,
        jumphost: String,
        local: SocketAddr,
    },
    WindowStarted {
        target: String,
        expected: u32,
        interval: Duration,
    },
    Retry {
        target: String,
        event: RetryEvent,
    },
    SampleCollected {
        target: String,
        index: u32,
        expected: u32,
        watts: Option<u32>,
        elapsed: Duration,
        remaining: Duration,
    },
    SampleSkipped {
        target: String,
        index: u32,
        expected: u32,
        reason: String,
    },
    TunnelLost {
        target: String,
    },
    TargetFinished {
        target: String,
        status: TargetStatus,
        detail: Option<String>,
    },
    Interrupted,
}

/// Receiver of progress events, shared by every pipeline of a run
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Logs progress through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::FleetStarted { targets, max_workers } => {
                info!("Monitoring {} server(s) with up to {} in parallel", targets, max_workers);
            }
            ProgressEvent::TargetStarted { target } => {
                info!(target_name = %target, "Starting");
            }
            ProgressEvent::TunnelUp { target, jumphost, local } => {
                info!(target_name = %target, "SSH tunnel: {} -> {}", local, jumphost);
            }
            ProgressEvent::WindowStarted { target, expected, interval } => {
                info!(
                    target_name = %target,
                    "Expecting {} samples, one every {}",
                    expected,
                    humantime::format_duration(*interval)
                );
            }
            ProgressEvent::Retry { target, event } => match event.next_delay {
                Some(delay) => warn!(
                    target_name = %target,
                    "Error collecting sample (attempt {}/{}): {}. Retrying in {}s...",
                    event.attempt,
                    event.max_attempts,
                    event.cause,
                    delay.as_secs()
                ),
                None => warn!(
                    target_name = %target,
                    "Error collecting sample after {} attempts: {}",
                    event.attempt,
                    event.cause
                ),
            },
            ProgressEvent::SampleCollected {
                target,
                index,
                expected,
                watts,
                elapsed,
                remaining,
            } => {
                let watts = watts.map(|w| format!("{}W", w)).unwrap_or_else(|| "N/A".to_string());
                info!(
                    target_name = %target,
                    "Sample {}/{} ({:.1}%) - System: {} - Elapsed: {} - Remaining: {}",
                    index,
                    expected,
                    percent(*index, *expected),
                    watts,
                    humantime::format_duration(whole_seconds(*elapsed)),
                    humantime::format_duration(whole_seconds(*remaining))
                );
            }
            ProgressEvent::SampleSkipped { target, index, expected, reason } => {
                warn!(target_name = %target, "Sample {}/{} skipped: {}", index, expected, reason);
            }
            ProgressEvent::TunnelLost { target } => {
                warn!(
                    target_name = %target,
                    "SSH tunnel is down; remaining samples will keep failing until the next run"
                );
            }
            ProgressEvent::TargetFinished { target, status, detail } => match detail {
                Some(detail) if *status != TargetStatus::Ok => {
                    warn!(target_name = %target, "{} - {}", status, detail)
                }
                _ => info!(target_name = %target, "{}", status),
            },
            ProgressEvent::Interrupted => {
                warn!("Monitoring interrupted, reporting the samples collected so far");
            }
        }
    }
}

fn percent(index: u32, expected: u32) -> f64 {
    if expected == 0 {
        0.0
    } else {
        index as f64 * 100.0 / expected as f64
    }
}

fn whole_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(3, 0), 0.0);
    }

    #[test]
    fn test_sinks_accept_every_event() {
        let events = vec![
            ProgressEvent::FleetStarted { targets: 2, max_workers: 5 },
            ProgressEvent::SampleSkipped {
                target: "r740-01".into(),
                index: 2,
                expected: 5,
                reason: "timed out".into(),
            },
            ProgressEvent::TargetFinished {
                target: "r740-01".into(),
                status: TargetStatus::Partial,
                detail: Some("gave up".into()),
            },
            ProgressEvent::Interrupted,
        ];
        for event in &events {
            NullSink.emit(event);
            TracingSink.emit(event);
        }
    }
}
