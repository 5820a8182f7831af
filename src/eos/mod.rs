//! EOS optimization server client.
//!
//! Builds the optimize request from the provider snapshots, posts it with
//! the configured deadline and extracts the current-hour control values from
//! the response. The previous `start_solution` is carried into the next
//! request so the optimizer can warm-start.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{BatteryConfig, EosConfig};
use crate::domain::PriceSet;
use crate::httpx::{self, FetchError};

#[derive(Debug, Error)]
pub enum EosError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
}

/// Request schema generation, probed once via `/v1/health`.
///
/// Servers from 2025-04-09 on answer the health endpoint and require
/// `device_id` fields in every nested device object; older servers 404 there
/// and reject unknown fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosSchema {
    Legacy,
    DeviceId,
}

pub struct EosClient {
    base_url: String,
    client: reqwest::Client,
    probe_client: reqwest::Client,
    clock: Clock,
    battery: BatteryConfig,
    inverter_max_power_w: f64,
    schema: RwLock<Option<EosSchema>>,
    last_start_solution: RwLock<Option<Value>>,
}

/// Provider snapshots feeding one optimize request.
#[derive(Debug, Clone)]
pub struct RequestInputs {
    pub pv_forecast_wh: Vec<f64>,
    pub prices: PriceSet,
    pub load_wh: Vec<f64>,
    pub temperature_c: Vec<f64>,
    pub battery_soc_percent: f64,
}

/// Current-hour control values extracted from a valid response.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HourlyPlan {
    pub ac_charge_rel: Option<f64>,
    pub dc_charge_rel: Option<f64>,
    pub discharge_allowed: Option<bool>,
}

impl EosClient {
    pub fn new(
        config: &EosConfig,
        battery: BatteryConfig,
        inverter_max_power_w: f64,
        clock: Clock,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: config.base_url(),
            client: httpx::client(Duration::from_secs(config.timeout))?,
            probe_client: httpx::client(Duration::from_secs(10))?,
            clock,
            battery,
            inverter_max_power_w,
            schema: RwLock::new(None),
            last_start_solution: RwLock::new(None),
        })
    }

    /// Cached schema probe. Network failures leave the schema undecided so
    /// the next run probes again; only a definitive answer is cached.
    pub async fn schema(&self) -> EosSchema {
        if let Some(schema) = *self.schema.read().await {
            return schema;
        }
        let url = format!("{}/v1/health", self.base_url);
        let schema = match httpx::get_json::<HealthResponse>(&self.probe_client, &url).await {
            Ok(health) if health.status == "alive" => {
                info!("EOS server >= 2025-04-09, using device_id schema");
                Some(EosSchema::DeviceId)
            }
            Ok(health) => {
                warn!(status = %health.status, "unexpected EOS health status, assuming legacy schema");
                Some(EosSchema::Legacy)
            }
            Err(FetchError::Status(status)) if status == reqwest::StatusCode::NOT_FOUND => {
                info!("EOS server < 2025-04-09, using legacy schema");
                Some(EosSchema::Legacy)
            }
            Err(err) => {
                warn!(error = %err, "EOS version probe failed, assuming legacy schema for this run");
                None
            }
        };
        if let Some(schema) = schema {
            *self.schema.write().await = Some(schema);
            schema
        } else {
            EosSchema::Legacy
        }
    }

    pub async fn build_request(&self, inputs: RequestInputs) -> OptimizeRequest {
        let schema = self.schema().await;
        let with_id = |id: &str| match schema {
            EosSchema::DeviceId => Some(id.to_string()),
            EosSchema::Legacy => None,
        };
        OptimizeRequest {
            ems: EmsData {
                pv_prognose_wh: inputs.pv_forecast_wh,
                strompreis_euro_pro_wh: inputs.prices.total,
                einspeiseverguetung_euro_pro_wh: inputs.prices.feed_in,
                preis_euro_pro_wh_akku: 0.0,
                gesamtlast: inputs.load_wh,
            },
            pv_akku: StorageDevice {
                device_id: with_id("battery1"),
                capacity_wh: self.battery.capacity_wh,
                charging_efficiency: self.battery.charge_efficiency,
                discharging_efficiency: self.battery.discharge_efficiency,
                max_charge_power_w: self.battery.max_charge_power_w,
                initial_soc_percentage: inputs.battery_soc_percent.round() as i64,
                min_soc_percentage: self.battery.min_soc_percentage,
                max_soc_percentage: self.battery.max_soc_percentage,
            },
            inverter: InverterDevice {
                device_id: with_id("inverter1"),
                max_power_wh: self.inverter_max_power_w,
                battery_id: with_id("battery1"),
            },
            eauto: StorageDevice {
                device_id: with_id("ev1"),
                capacity_wh: 27000.0,
                charging_efficiency: 0.90,
                discharging_efficiency: 0.95,
                max_charge_power_w: 7360.0,
                initial_soc_percentage: 50,
                min_soc_percentage: 5.0,
                max_soc_percentage: 100.0,
            },
            dishwasher: DishwasherDevice {
                device_id: with_id("dishwasher1"),
                consumption_wh: 1,
                duration_h: 1,
            },
            temperature_forecast: inputs.temperature_c,
            start_solution: self.last_start_solution.read().await.clone(),
        }
    }

    /// Posts the request with `start_hour` set to the current local hour.
    /// Returns both the raw JSON (persisted for the operator) and the typed
    /// control view.
    pub async fn optimize(
        &self,
        request: &OptimizeRequest,
    ) -> Result<(Value, OptimizeResponse), EosError> {
        let url = format!(
            "{}/optimize?start_hour={}",
            self.base_url,
            self.clock.current_hour()
        );
        info!(%url, "requesting optimization");
        let started = std::time::Instant::now();
        let raw: Value =
            httpx::post_json(&self.client, &url, reqwest::header::HeaderMap::new(), request)
                .await?;
        info!(elapsed_s = started.elapsed().as_secs(), "optimization response received");
        let typed: OptimizeResponse = serde_json::from_value(raw.clone())
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        Ok((raw, typed))
    }

    /// Validates the response and picks the current-hour values. A response
    /// without a usable `start_solution` is rejected wholesale; a rejected
    /// response must not steer the inverter.
    pub async fn examine(&self, response: &OptimizeResponse) -> Result<HourlyPlan, EosError> {
        let solution = response
            .start_solution
            .as_ref()
            .ok_or(EosError::InvalidResponse("start_solution missing"))?;
        let usable = solution.as_array().map(|a| a.len() > 1).unwrap_or(false);
        if !usable {
            return Err(EosError::InvalidResponse("start_solution too short"));
        }
        *self.last_start_solution.write().await = Some(solution.clone());

        let hour = self.clock.current_hour();
        Ok(HourlyPlan {
            ac_charge_rel: response.ac_charge.get(hour).copied(),
            dc_charge_rel: response.dc_charge.get(hour).copied(),
            discharge_allowed: response.discharge_allowed.get(hour).map(|v| *v != 0.0),
        })
    }

    #[cfg(test)]
    pub async fn last_start_solution(&self) -> Option<Value> {
        self.last_start_solution.read().await.clone()
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub ems: EmsData,
    pub pv_akku: StorageDevice,
    pub inverter: InverterDevice,
    pub eauto: StorageDevice,
    pub dishwasher: DishwasherDevice,
    pub temperature_forecast: Vec<f64>,
    pub start_solution: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmsData {
    pub pv_prognose_wh: Vec<f64>,
    pub strompreis_euro_pro_wh: Vec<f64>,
    pub einspeiseverguetung_euro_pro_wh: Vec<f64>,
    pub preis_euro_pro_wh_akku: f64,
    pub gesamtlast: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub capacity_wh: f64,
    pub charging_efficiency: f64,
    pub discharging_efficiency: f64,
    pub max_charge_power_w: f64,
    pub initial_soc_percentage: i64,
    pub min_soc_percentage: f64,
    pub max_soc_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub max_power_wh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DishwasherDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub consumption_wh: u32,
    pub duration_h: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptimizeResponse {
    #[serde(default)]
    pub ac_charge: Vec<f64>,
    #[serde(default)]
    pub dc_charge: Vec<f64>,
    #[serde(default)]
    pub discharge_allowed: Vec<f64>,
    #[serde(default)]
    pub start_solution: Option<Value>,
}
