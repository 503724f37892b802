//! Power telemetry snapshots read from a controller
//!
//! Provides:
//! - `PowerSnapshot` / `PowerSupply` / `Redundancy` (one Redfish power reading)
//! - `TelemetryClient`, the single-call contract the sampler drives
//! - Pure parsers for the two Redfish documents involved (chassis list, chassis power)

mod redfish;

pub use redfish::RedfishClient;

use crate::error::{ContractError, FetchError};
use crate::model::{Credentials, Endpoint};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// One power reading (field names are part of the JSON report)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerSnapshot {
    pub chassis_id: String,
    pub current_watts: Option<u32>,
    pub average_watts: Option<u32>,
    /// Power capacity of the chassis
    pub max_watts: Option<u32>,
    pub min_watts: Option<u32>,
    pub max_consumed_watts: Option<u32>,
    pub power_limit: Option<u32>,
    pub average_interval_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redundancy: Option<Redundancy>,
    pub power_supplies: Vec<PowerSupply>,
}

impl PowerSnapshot {
    /// Figure used for sizing: controller-side average when present, else instantaneous
    pub fn headline_watts(&self) -> Option<u32> {
        self.average_watts.or(self.current_watts)
    }
}

/// Per power-supply record. Every watt/efficiency field may be absent (standby, not applicable).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerSupply {
    pub name: String,
    pub state: Option<String>,
    pub health: Option<String>,
    pub capacity_watts: Option<u32>,
    pub last_power_output: Option<u32>,
    pub input_watts: Option<u32>,
    pub output_watts: Option<u32>,
    pub efficiency_percent: Option<f64>,
    pub line_input_voltage: Option<f64>,
}

/// PSU redundancy status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redundancy {
    pub mode: Option<String>,
    pub status: Option<String>,
    pub min_needed: Option<u32>,
    pub max_supported: Option<u32>,
}

/// Single telemetry call against a reachable endpoint
pub trait TelemetryClient: Send + Sync + 'static {
    fn fetch(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<PowerSnapshot, FetchError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ChassisCollection {
    #[serde(rename = "Members", default)]
    members: Vec<ODataLink>,
}

#[derive(Debug, Deserialize)]
struct ODataLink {
    #[serde(rename = "@odata.id")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPower {
    #[serde(default)]
    power_control: Vec<RawPowerControl>,
    #[serde(default)]
    power_supplies: Vec<RawSupply>,
    #[serde(default)]
    redundancy: Vec<RawRedundancy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPowerControl {
    power_consumed_watts: Option<f64>,
    power_capacity_watts: Option<f64>,
    power_metrics: Option<RawPowerMetrics>,
    power_limit: Option<RawPowerLimit>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPowerMetrics {
    average_consumed_watts: Option<f64>,
    min_consumed_watts: Option<f64>,
    max_consumed_watts: Option<f64>,
    interval_in_min: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPowerLimit {
    limit_in_watts: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStatus {
    state: Option<String>,
    health: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSupply {
    name: Option<String>,
    status: Option<RawStatus>,
    power_capacity_watts: Option<f64>,
    last_power_output_watts: Option<f64>,
    power_input_watts: Option<f64>,
    power_output_watts: Option<f64>,
    efficiency_percent: Option<f64>,
    line_input_voltage: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRedundancy {
    mode: Option<String>,
    status: Option<RawStatus>,
    min_num_needed: Option<u32>,
    max_num_supported: Option<u32>,
}

/// Extract the first chassis id from a `/Chassis` collection document
pub fn parse_chassis_id(body: &[u8]) -> Result<String, ContractError> {
    let collection: ChassisCollection = serde_json::from_slice(body)
        .map_err(|e| ContractError(format!("chassis collection: {}", e)))?;

    let first = collection
        .members
        .first()
        .ok_or_else(|| ContractError("No chassis found".to_string()))?;

    first
        .id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ContractError(format!("invalid chassis link: {}", first.id)))
}

/// Build a snapshot from a `/Chassis/{id}/Power` document
pub fn parse_power(chassis_id: &str, body: &[u8]) -> Result<PowerSnapshot, ContractError> {
    let raw: RawPower = serde_json::from_slice(body)
        .map_err(|e| ContractError(format!("power document: {}", e)))?;

    let control = raw.power_control.into_iter().next().unwrap_or_default();
    let metrics = control.power_metrics.unwrap_or_default();

    let power_supplies = raw
        .power_supplies
        .into_iter()
        .enumerate()
        .map(|(index, ps)| {
            let status = ps.status.unwrap_or_default();
            PowerSupply {
                name: ps.name.unwrap_or_else(|| format!("PSU {}", index + 1)),
                state: status.state,
                health: status.health,
                capacity_watts: watts(ps.power_capacity_watts),
                last_power_output: watts(ps.last_power_output_watts),
                input_watts: watts(ps.power_input_watts),
                output_watts: watts(ps.power_output_watts),
                efficiency_percent: ps.efficiency_percent.map(round_tenth),
                line_input_voltage: ps.line_input_voltage,
            }
        })
        .collect();

    let redundancy = raw.redundancy.into_iter().next().map(|red| Redundancy {
        mode: red.mode,
        status: red.status.and_then(|s| s.health),
        min_needed: red.min_num_needed,
        max_supported: red.max_num_supported,
    });

    Ok(PowerSnapshot {
        chassis_id: chassis_id.to_string(),
        current_watts: watts(control.power_consumed_watts),
        average_watts: watts(metrics.average_consumed_watts),
        max_watts: watts(control.power_capacity_watts),
        min_watts: watts(metrics.min_consumed_watts),
        max_consumed_watts: watts(metrics.max_consumed_watts),
        power_limit: watts(control.power_limit.and_then(|l| l.limit_in_watts)),
        average_interval_min: watts(metrics.interval_in_min),
        redundancy,
        power_supplies,
    })
}

/// Whole watts; negative or non-finite readings count as absent
fn watts(value: Option<f64>) -> Option<u32> {
    value
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.min(u32::MAX as f64) as u32)
}

pub(crate) fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const POWER_DOC: &str = r#"{
        "PowerControl": [{
            "PowerConsumedWatts": 245,
            "PowerCapacityWatts": 750,
            "PowerMetrics": {
                "AverageConsumedWatts": 230,
                "MinConsumedWatts": 180,
                "MaxConsumedWatts": 380,
                "IntervalInMin": 60
            },
            "PowerLimit": {"LimitInWatts": 500}
        }],
        "PowerSupplies": [{
            "Name": "PS1 Status",
            "Status": {"State": "Enabled", "Health": "OK"},
            "PowerCapacityWatts": 750,
            "LastPowerOutputWatts": 123,
            "PowerInputWatts": 140,
            "PowerOutputWatts": 123,
            "EfficiencyPercent": 91.46,
            "LineInputVoltage": 230
        }, {
            "Name": "PS2 Status",
            "Status": {"State": "StandbySpare", "Health": "OK"},
            "PowerCapacityWatts": 750,
            "PowerOutputWatts": null,
            "EfficiencyPercent": null
        }],
        "Redundancy": [{
            "Mode": "N+1",
            "Status": {"Health": "OK"},
            "MinNumNeeded": 1,
            "MaxNumSupported": 2
        }]
    }"#;

    #[test]
    fn test_parse_chassis_id() {
        let body = br#"{"Members": [{"@odata.id": "/redfish/v1/Chassis/System.Embedded.1"}]}"#;
        assert_eq!(parse_chassis_id(body).unwrap(), "System.Embedded.1");
    }

    #[test]
    fn test_parse_chassis_id_empty() {
        let err = parse_chassis_id(br#"{"Members": []}"#).unwrap_err();
        assert!(err.to_string().contains("No chassis found"));
        assert!(parse_chassis_id(b"<html>login</html>").is_err());
    }

    #[test]
    fn test_parse_power() {
        let snapshot = parse_power("System.Embedded.1", POWER_DOC.as_bytes()).unwrap();
        assert_eq!(snapshot.current_watts, Some(245));
        assert_eq!(snapshot.average_watts, Some(230));
        assert_eq!(snapshot.max_watts, Some(750));
        assert_eq!(snapshot.min_watts, Some(180));
        assert_eq!(snapshot.max_consumed_watts, Some(380));
        assert_eq!(snapshot.power_limit, Some(500));
        assert_eq!(snapshot.average_interval_min, Some(60));
        assert_eq!(snapshot.headline_watts(), Some(230));

        assert_eq!(snapshot.power_supplies.len(), 2);
        let ps1 = &snapshot.power_supplies[0];
        assert_eq!(ps1.efficiency_percent, Some(91.5));
        assert_eq!(ps1.input_watts, Some(140));
        let ps2 = &snapshot.power_supplies[1];
        assert_eq!(ps2.state.as_deref(), Some("StandbySpare"));
        assert_eq!(ps2.output_watts, None);
        assert_eq!(ps2.efficiency_percent, None);

        let red = snapshot.redundancy.unwrap();
        assert_eq!(red.mode.as_deref(), Some("N+1"));
        assert_eq!(red.status.as_deref(), Some("OK"));
        assert_eq!(red.min_needed, Some(1));
    }

    #[test]
    fn test_parse_power_sparse() {
        let snapshot = parse_power("1", br#"{"PowerControl": []}"#).unwrap();
        assert_eq!(snapshot.current_watts, None);
        assert!(snapshot.power_supplies.is_empty());
        assert!(snapshot.redundancy.is_none());
    }

    #[test]
    fn test_report_field_names() {
        let snapshot = parse_power("System.Embedded.1", POWER_DOC.as_bytes()).unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["power_supplies"][0]["efficiency_percent"], 91.5);
        assert_eq!(json["current_watts"], 245);
    }
}
