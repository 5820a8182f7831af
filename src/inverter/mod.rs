//! Inverter drivers.
//!
//! The control state machine talks to the battery through three abstract
//! operations; how they land on hardware is the driver's business. The
//! GEN24 driver realizes them as time-of-use rule sets, the default driver
//! only logs so the service can run in observation mode.

pub mod digest;
pub mod fronius;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub use fronius::FroniusGen24;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("inverter returned HTTP {0}")]
    Http(reqwest::StatusCode),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("inverter did not confirm write of '{0}'")]
    Unconfirmed(String),
    #[error("backup file error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[async_trait]
pub trait InverterDriver: Send + Sync {
    /// Battery charges from grid at no less than `power_w`.
    async fn set_force_charge(&self, power_w: f64) -> Result<(), DriverError>;

    /// Battery holds its charge; PV charging stays permitted.
    async fn set_avoid_discharge(&self) -> Result<(), DriverError>;

    /// Normal operation.
    async fn set_allow_discharge(&self) -> Result<(), DriverError>;

    /// Puts back the rule set captured before the first write. Called once
    /// during shutdown.
    async fn restore_baseline(&self) -> Result<(), DriverError>;
}

/// Driver used when no hardware is configured: every operation is a log line.
pub struct LogOnlyInverter;

#[async_trait]
impl InverterDriver for LogOnlyInverter {
    async fn set_force_charge(&self, power_w: f64) -> Result<(), DriverError> {
        info!(power_w, "inverter disabled, would force charge");
        Ok(())
    }

    async fn set_avoid_discharge(&self) -> Result<(), DriverError> {
        info!("inverter disabled, would avoid discharge");
        Ok(())
    }

    async fn set_allow_discharge(&self) -> Result<(), DriverError> {
        info!("inverter disabled, would allow discharge");
        Ok(())
    }

    async fn restore_baseline(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// One entry of the GEN24 time-of-use table, wire format of
/// `/config/timeofuse`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfUseRule {
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "Power")]
    pub power: u32,
    #[serde(rename = "ScheduleType")]
    pub schedule_type: ScheduleType,
    #[serde(rename = "TimeTable")]
    pub time_table: TimeTable,
    #[serde(rename = "Weekdays")]
    pub weekdays: Weekdays,
}

impl TimeOfUseRule {
    /// Rule active around the clock on every weekday; the only shape the
    /// control loop ever writes.
    pub fn all_day(schedule_type: ScheduleType, power: u32) -> Self {
        Self {
            active: true,
            power,
            schedule_type,
            time_table: TimeTable {
                start: "00:00".to_string(),
                end: "23:59".to_string(),
            },
            weekdays: Weekdays::all(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    ChargeMin,
    ChargeMax,
    DischargeMax,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTable {
    #[serde(rename = "Start")]
    pub start: String,
    #[serde(rename = "End")]
    pub end: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weekdays {
    #[serde(rename = "Mon")]
    pub mon: bool,
    #[serde(rename = "Tue")]
    pub tue: bool,
    #[serde(rename = "Wed")]
    pub wed: bool,
    #[serde(rename = "Thu")]
    pub thu: bool,
    #[serde(rename = "Fri")]
    pub fri: bool,
    #[serde(rename = "Sat")]
    pub sat: bool,
    #[serde(rename = "Sun")]
    pub sun: bool,
}

impl Weekdays {
    pub fn all() -> Self {
        Self {
            mon: true,
            tue: true,
            wed: true,
            thu: true,
            fri: true,
            sat: true,
            sun: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_serializes_to_firmware_wire_format() {
        let rule = TimeOfUseRule::all_day(ScheduleType::ChargeMin, 4500);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["Active"], true);
        assert_eq!(json["Power"], 4500);
        assert_eq!(json["ScheduleType"], "CHARGE_MIN");
        assert_eq!(json["TimeTable"]["Start"], "00:00");
        assert_eq!(json["TimeTable"]["End"], "23:59");
        assert_eq!(json["Weekdays"]["Mon"], true);
        assert_eq!(json["Weekdays"]["Sun"], true);
    }

    #[test]
    fn rule_round_trips_through_json() {
        let rule = TimeOfUseRule::all_day(ScheduleType::DischargeMax, 0);
        let json = serde_json::to_string(&rule).unwrap();
        let back: TimeOfUseRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
