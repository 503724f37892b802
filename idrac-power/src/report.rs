//! Report assembler: fleet and single-target results as JSON or text
//!
//! JSON field names (`power_watts`, `power_supplies[].efficiency_percent`,
//! `system_average_watts`, ...) are a compatibility surface for downstream
//! sizing sheets; keep them stable.

use crate::config::format_duration;
use crate::fleet::{FleetResult, TargetResult, TargetStatus};
use crate::model::MonitorMode;
use crate::sampler::{FieldStats, SampleWindow, WindowStats};
use crate::telemetry::PowerSnapshot;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Text => "txt",
            OutputFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub total: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub interrupted: bool,
    pub servers: Vec<ServerReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jumphost: Option<String>,
    pub status: TargetStatus,
    pub success: bool,
    pub error: Option<String>,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Metrics {
    Reading(Reading),
    Monitoring(Monitoring),
}

/// Instant-mode metrics: the snapshot plus the headline figure
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub timestamp: String,
    pub power_watts: Option<u32>,
    #[serde(flatten)]
    pub snapshot: PowerSnapshot,
}

/// Windowed-mode metrics. Watt aggregates are truncated to whole watts.
#[derive(Debug, Clone, Serialize)]
pub struct Monitoring {
    pub monitoring_duration_hours: f64,
    pub sample_interval_minutes: f64,
    pub sample_count: u32,
    pub samples_expected: u32,
    pub samples_failed: u32,
    pub interrupted: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub system_average_watts: Option<u32>,
    pub system_min_watts: Option<u32>,
    pub system_max_watts: Option<u32>,
    pub power_supplies: Vec<SupplyAverages>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupplyAverages {
    pub name: String,
    pub state: Option<String>,
    pub health: Option<String>,
    pub capacity_watts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_output_watts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_output_watts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_watts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_input_watts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_input_watts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_input_watts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_efficiency_percent: Option<f64>,
}

impl FleetReport {
    pub fn from_fleet(fleet: &FleetResult) -> Self {
        Self {
            total: fleet.total,
            succeeded: fleet.succeeded,
            partial: fleet.partial,
            failed: fleet.failed,
            interrupted: fleet.interrupted,
            servers: fleet.results.iter().map(ServerReport::from_result).collect(),
        }
    }
}

impl ServerReport {
    pub fn from_result(result: &TargetResult) -> Self {
        Self {
            name: result.name.clone(),
            ip: result.host.clone(),
            port: result.port,
            jumphost: result.jumphost.clone(),
            status: result.status,
            success: result.status.has_data(),
            error: result.error_message(),
            metrics: Metrics::from_window(&result.window),
        }
    }
}

impl Metrics {
    /// `None` when the window holds no sample
    pub fn from_window(window: &SampleWindow) -> Option<Self> {
        match window.mode() {
            MonitorMode::Instant => window.samples().last().map(|sample| {
                Metrics::Reading(Reading {
                    timestamp: timestamp(sample.timestamp),
                    power_watts: sample.snapshot.headline_watts(),
                    snapshot: sample.snapshot.clone(),
                })
            }),
            MonitorMode::Windowed { duration, interval } => window.stats().map(|stats| {
                Metrics::Monitoring(Monitoring::new(window, &stats, duration.as_secs_f64(), interval.as_secs_f64()))
            }),
        }
    }
}

impl Monitoring {
    fn new(window: &SampleWindow, stats: &WindowStats, duration_secs: f64, interval_secs: f64) -> Self {
        let samples = window.samples();
        let system = stats.system_watts.as_ref();

        Self {
            monitoring_duration_hours: duration_secs / 3_600.0,
            sample_interval_minutes: interval_secs / 60.0,
            sample_count: window.succeeded(),
            samples_expected: window.expected(),
            samples_failed: window.failed(),
            interrupted: window.is_interrupted(),
            start_time: samples.first().map(|s| timestamp(s.timestamp)),
            end_time: samples.last().map(|s| timestamp(s.timestamp)),
            system_average_watts: system.map(|s| s.mean as u32),
            system_min_watts: system.map(|s| s.min as u32),
            system_max_watts: system.map(|s| s.max as u32),
            power_supplies: stats
                .supplies
                .iter()
                .map(|ps| {
                    let (average_output_watts, min_output_watts, max_output_watts) = whole_watts(&ps.output_watts);
                    let (average_input_watts, min_input_watts, max_input_watts) = whole_watts(&ps.input_watts);
                    SupplyAverages {
                        name: ps.name.clone(),
                        state: ps.state.clone(),
                        health: ps.health.clone(),
                        capacity_watts: ps.capacity_watts,
                        average_output_watts,
                        min_output_watts,
                        max_output_watts,
                        average_input_watts,
                        min_input_watts,
                        max_input_watts,
                        average_efficiency_percent: ps.efficiency_percent.map(|e| e.mean),
                    }
                })
                .collect(),
        }
    }
}

fn whole_watts(stats: &Option<FieldStats>) -> (Option<u32>, Option<u32>, Option<u32>) {
    match stats {
        Some(s) => (Some(s.mean as u32), Some(s.min as u32), Some(s.max as u32)),
        None => (None, None, None),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Multi-server report
pub fn render_fleet(fleet: &FleetResult, format: OutputFormat) -> Result<String> {
    let report = FleetReport::from_fleet(fleet);
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(&report).context("Failed to serialize fleet report"),
        OutputFormat::Text => Ok(fleet_text(&report)),
    }
}

/// Single-server report (invocations without a servers file)
pub fn render_target(result: &TargetResult, format: OutputFormat) -> Result<String> {
    let report = ServerReport::from_result(result);
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(&report).context("Failed to serialize report"),
        OutputFormat::Text => Ok(match &report.metrics {
            Some(Metrics::Reading(reading)) => reading_text(reading),
            Some(Metrics::Monitoring(monitoring)) => monitoring_text(monitoring),
            None => format!(
                "{} ({}): {}",
                report.name,
                report.ip,
                report.error.as_deref().unwrap_or("no data collected")
            ),
        }),
    }
}

fn watts(value: Option<u32>) -> String {
    value.map(|w| format!("{} W", w)).unwrap_or_else(|| "N/A".to_string())
}

fn state_line(state: &Option<String>, health: &Option<String>) -> String {
    match state {
        Some(state) => format!("{} - {}", state, health.as_deref().unwrap_or("Unknown")),
        None => "Unknown".to_string(),
    }
}

pub fn reading_text(reading: &Reading) -> String {
    let snap = &reading.snapshot;
    let mut lines = vec![format!("Chassis: {}", snap.chassis_id)];

    if let Some(primary) = reading.power_watts {
        let label = if snap.average_watts.is_some() { "Average Power" } else { "Current Power" };
        let window = match (snap.average_watts, snap.average_interval_min) {
            (Some(_), Some(minutes)) => format!(" ({}min avg)", minutes),
            _ => String::new(),
        };
        lines.push(format!("{}: {} W{}", label, primary, window));
    }
    if let (Some(_), Some(current)) = (snap.average_watts, snap.current_watts) {
        lines.push(format!("Current Power: {} W", current));
    }
    if let Some(peak) = snap.max_consumed_watts {
        lines.push(format!("Peak Power: {} W", peak));
    }
    if let Some(limit) = snap.power_limit {
        lines.push(format!("Power Limit: {} W", limit));
    }
    if let Some(capacity) = snap.max_watts {
        lines.push(format!("Max Capacity: {} W", capacity));
    }

    if let Some(red) = &snap.redundancy {
        lines.push(format!(
            "\nRedundancy: {} ({}) - {}/{} PSUs needed",
            red.mode.as_deref().unwrap_or("Unknown"),
            red.status.as_deref().unwrap_or("Unknown"),
            red.min_needed.map(|n| n.to_string()).unwrap_or_else(|| "?".into()),
            red.max_supported.map(|n| n.to_string()).unwrap_or_else(|| "?".into()),
        ));
    }

    if !snap.power_supplies.is_empty() {
        lines.push("\nPower Supplies:".to_string());
        for ps in &snap.power_supplies {
            lines.push(format!("  {}: {}", ps.name, state_line(&ps.state, &ps.health)));
            if let Some(capacity) = ps.capacity_watts {
                lines.push(format!("    Capacity: {} W", capacity));
            }
            // Output is always shown, N/A for standby supplies
            lines.push(format!("    Output: {}", watts(ps.output_watts)));
            if let Some(input) = ps.input_watts {
                lines.push(format!("    Input: {} W", input));
            }
            if let Some(efficiency) = ps.efficiency_percent {
                lines.push(format!("    Efficiency: {:.1}%", efficiency));
            }
        }
    }

    lines.join("\n")
}

fn hours(value: f64) -> String {
    format_duration(std::time::Duration::from_millis((value.max(0.0) * 3_600_000.0).round() as u64))
}

pub fn monitoring_text(m: &Monitoring) -> String {
    let interval = hours(m.sample_interval_minutes / 60.0);
    let mut samples = format!("Samples: {} (every {})", m.sample_count, interval);
    if m.sample_count < m.samples_expected || m.samples_failed > 0 {
        samples = format!(
            "Samples: {} of {} (every {}), {} failed",
            m.sample_count, m.samples_expected, interval, m.samples_failed
        );
    }

    let mut lines = vec![format!(
        "=== {} Power Monitoring Results ===",
        hours(m.monitoring_duration_hours)
    )];
    if m.interrupted {
        lines.push("(interrupted before the window ended)".to_string());
    }
    lines.push(samples);
    lines.push(format!(
        "Period: {} to {}",
        m.start_time.as_deref().unwrap_or("N/A"),
        m.end_time.as_deref().unwrap_or("N/A")
    ));
    lines.push(String::new());
    lines.push(format!("System Average: {}", watts(m.system_average_watts)));
    lines.push(format!("System Min: {}", watts(m.system_min_watts)));
    lines.push(format!("System Max: {}", watts(m.system_max_watts)));
    lines.push(String::new());
    lines.push("Power Supply Averages:".to_string());

    for ps in &m.power_supplies {
        lines.push(format!("  {}: {}", ps.name, state_line(&ps.state, &ps.health)));
        if let Some(capacity) = ps.capacity_watts {
            lines.push(format!("    Capacity: {} W", capacity));
        }
        if let Some(average) = ps.average_output_watts {
            lines.push(format!("    Average Output: {} W", average));
            lines.push(format!(
                "    Min/Max Output: {} / {}",
                watts(ps.min_output_watts),
                watts(ps.max_output_watts)
            ));
        }
        if let Some(average) = ps.average_input_watts {
            lines.push(format!("    Average Input: {} W", average));
            lines.push(format!(
                "    Min/Max Input: {} / {}",
                watts(ps.min_input_watts),
                watts(ps.max_input_watts)
            ));
        }
        if let Some(efficiency) = ps.average_efficiency_percent {
            lines.push(format!("    Average Efficiency: {:.1}%", efficiency));
        }
    }

    lines.join("\n")
}

fn fleet_text(report: &FleetReport) -> String {
    let mut lines = vec!["=== Multi-Server Power Monitoring ===\n".to_string()];
    if report.interrupted {
        lines.push("Monitoring was interrupted; results are partial.\n".to_string());
    }
    lines.push(format!(
        "Total: {} | Success: {} | Partial: {} | Failed: {}\n",
        report.total,
        report.succeeded - report.partial,
        report.partial,
        report.failed
    ));

    let failed: Vec<_> = report.servers.iter().filter(|s| !s.success).collect();
    if !failed.is_empty() {
        lines.push("Failed Servers:".to_string());
        for server in failed {
            lines.push(format!(
                "  {} ({}): {}",
                server.name,
                server.ip,
                server.error.as_deref().unwrap_or("no data collected")
            ));
        }
        lines.push(String::new());
    }

    for server in report.servers.iter().filter(|s| s.success) {
        let suffix = if server.status == TargetStatus::Partial { " [partial]" } else { "" };
        lines.push(format!("--- {} ({}){} ---", server.name, server.ip, suffix));

        match &server.metrics {
            Some(Metrics::Monitoring(m)) => {
                lines.push(format!(
                    "  Duration: {} ({} samples)",
                    hours(m.monitoring_duration_hours),
                    m.sample_count
                ));
                lines.push(format!("  System Average: {}", watts(m.system_average_watts)));
                lines.push(format!(
                    "  System Range: {} - {}",
                    m.system_min_watts.map(|w| w.to_string()).unwrap_or_else(|| "N/A".into()),
                    watts(m.system_max_watts)
                ));
                lines.push("  Power Supplies:".to_string());
                for ps in &m.power_supplies {
                    lines.push(format!("    {}: {}", ps.name, state_line(&ps.state, &ps.health)));
                    if let Some(average) = ps.average_output_watts {
                        lines.push(format!("      Avg Output: {} W", average));
                    }
                }
            }
            Some(Metrics::Reading(reading)) => {
                lines.push(format!("  Power: {}", watts(reading.power_watts)));
                if let Some(mode) = reading.snapshot.redundancy.as_ref().and_then(|r| r.mode.as_deref()) {
                    lines.push(format!("  Redundancy: {}", mode));
                }
                lines.push("  Power Supplies:".to_string());
                for ps in &reading.snapshot.power_supplies {
                    lines.push(format!("    {}: {}", ps.name, state_line(&ps.state, &ps.health)));
                    if let Some(output) = ps.output_watts {
                        lines.push(format!("      Output: {} W", output));
                    }
                }
            }
            None => {}
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Append `.json`/`.txt` unless the name already carries one of them
pub fn output_path(path: &Path, format: OutputFormat) -> PathBuf {
    let name = path.to_string_lossy();
    if name.ends_with(".txt") || name.ends_with(".json") {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{}.{}", name, format.extension()))
    }
}

/// Write a rendered report, returning the path actually used
pub async fn write_report(path: &Path, format: OutputFormat, text: &str) -> Result<PathBuf> {
    let target = output_path(path, format);
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&target, text)
        .await
        .with_context(|| format!("Failed to write report to {}", target.display()))?;
    Ok(target)
}
