use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

/// Top-level application configuration, read from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub load: LoadConfig,

    #[serde(default)]
    #[validate(nested)]
    pub eos: EosConfig,

    #[serde(default)]
    #[validate(nested)]
    pub price: PriceConfig,

    #[serde(default)]
    #[validate(nested)]
    pub battery: BatteryConfig,

    #[serde(default)]
    #[validate(nested)]
    pub pv_forecast_source: PvForecastSourceConfig,

    #[serde(default = "default_pv_forecast")]
    #[validate(nested)]
    pub pv_forecast: Vec<PvArrayConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub inverter: InverterConfig,

    #[serde(default)]
    pub evcc: EvccConfig,

    /// Scheduler period in minutes.
    #[serde(default = "default_refresh_time")]
    #[validate(range(min = 1, max = 1440))]
    pub refresh_time: u64,

    /// IANA time zone for all hour-of-day logic.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    #[serde(default = "default_web_port")]
    pub eos_connect_web_port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Household load profile source.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct LoadConfig {
    pub source: LoadSource,
    pub url: String,
    pub load_sensor: String,
    pub car_charge_load_sensor: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    #[default]
    Default,
    Openhab,
    Homeassistant,
}

/// EOS optimization server endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct EosConfig {
    pub server: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    /// Per-call deadline in seconds. Must stay below the scheduler period.
    #[validate(range(min = 1, max = 3600))]
    pub timeout: u64,
}

impl Default for EosConfig {
    fn default() -> Self {
        Self {
            server: "192.168.1.94".to_string(),
            port: 8503,
            timeout: default_eos_timeout(),
        }
    }
}

impl EosConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.server, self.port)
    }
}

/// Electricity price source.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PriceConfig {
    pub source: PriceSource,
    /// Bearer token, only used by the tibber source.
    pub token: String,
    /// Feed-in tariff in EUR per kWh.
    #[validate(range(min = 0.0))]
    pub feed_in_price: f64,
    /// Suppress feed-in revenue for hours with negative market prices.
    pub negative_price_switch: bool,
    /// Constant day profile in EUR per kWh, used by the fixed_24h source.
    pub fixed_24h_array: Vec<f64>,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            source: PriceSource::Akkudoktor,
            token: String::new(),
            feed_in_price: 0.0,
            negative_price_switch: false,
            fixed_24h_array: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Akkudoktor,
    Tibber,
    SmartenergyAt,
    Fixed24h,
}

/// Battery SoC source and physical parameters.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_battery_config"))]
pub struct BatteryConfig {
    pub source: BatterySource,
    pub url: String,
    pub soc_sensor: String,
    pub access_token: String,

    #[validate(range(min = 100.0))]
    pub capacity_wh: f64,

    #[validate(range(min = 0.5, max = 1.0))]
    pub charge_efficiency: f64,

    #[validate(range(min = 0.5, max = 1.0))]
    pub discharge_efficiency: f64,

    #[validate(range(min = 500.0, max = 100000.0))]
    pub max_charge_power_w: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percentage: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_percentage: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            source: BatterySource::Default,
            url: String::new(),
            soc_sensor: String::new(),
            access_token: String::new(),
            capacity_wh: 11059.0,
            charge_efficiency: 0.88,
            discharge_efficiency: 0.88,
            max_charge_power_w: 5000.0,
            min_soc_percentage: 5.0,
            max_soc_percentage: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatterySource {
    #[default]
    Default,
    Openhab,
    Homeassistant,
}

fn validate_battery_config(config: &BatteryConfig) -> Result<(), validator::ValidationError> {
    if config.min_soc_percentage >= config.max_soc_percentage {
        return Err(validator::ValidationError::new(
            "min_soc_below_max_soc",
        ));
    }
    Ok(())
}

/// PV forecast backend selection.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PvForecastSourceConfig {
    pub source: PvForecastSource,
    /// API key, required by the solcast source.
    pub api_key: String,
}

impl Default for PvForecastSourceConfig {
    fn default() -> Self {
        Self {
            source: PvForecastSource::Akkudoktor,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PvForecastSource {
    Akkudoktor,
    Openmeteo,
    OpenmeteoLocal,
    ForecastSolar,
    Solcast,
    Evcc,
    Default,
}

/// Geometry and rating of one PV array.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PvArrayConfig {
    #[serde(default)]
    pub name: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub lon: f64,

    /// Panel azimuth in degrees, 0 = south, negative = east.
    #[validate(range(min = -180.0, max = 180.0))]
    pub azimuth: f64,

    #[validate(range(min = 0.0, max = 90.0))]
    pub tilt: f64,

    /// Peak panel power in W.
    #[validate(range(min = 1.0))]
    pub power: f64,

    #[serde(default = "default_power_inverter")]
    pub power_inverter: f64,

    #[serde(default = "default_inverter_efficiency")]
    #[validate(range(min = 0.5, max = 1.0))]
    pub inverter_efficiency: f64,

    /// Comma separated minimum sun elevations per azimuth bin, empty = no shading.
    #[serde(default)]
    pub horizon: String,

    /// Solcast rooftop resource id.
    #[serde(default)]
    pub resource_id: String,
}

/// Inverter hardware driver.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct InverterConfig {
    #[serde(rename = "type")]
    pub kind: InverterKind,
    pub address: String,
    pub user: String,
    pub password: String,

    #[validate(range(min = 0.0, max = 50000.0))]
    pub max_grid_charge_rate: f64,

    #[validate(range(min = 0.0, max = 50000.0))]
    pub max_pv_charge_rate: f64,

    #[validate(range(min = 0.0, max = 50000.0))]
    pub max_bat_discharge_rate: f64,
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            kind: InverterKind::Default,
            address: "192.168.1.102".to_string(),
            user: "customer".to_string(),
            password: String::new(),
            max_grid_charge_rate: 5000.0,
            max_pv_charge_rate: 5000.0,
            max_bat_discharge_rate: 5000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InverterKind {
    #[default]
    Default,
    FroniusGen24,
    FroniusGen24V2,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EvccConfig {
    /// Base URL of the EVCC instance, empty disables the provider.
    pub url: String,
}

// Default value functions
fn default_refresh_time() -> u64 { 3 }
fn default_eos_timeout() -> u64 { 180 }
fn default_time_zone() -> String { "Europe/Berlin".to_string() }
fn default_web_port() -> u16 { 8081 }
fn default_log_level() -> String { "info".to_string() }
fn default_power_inverter() -> f64 { 5000.0 }
fn default_inverter_efficiency() -> f64 { 0.9 }

fn default_pv_forecast() -> Vec<PvArrayConfig> {
    vec![PvArrayConfig {
        name: "default".to_string(),
        lat: 47.5,
        lon: 8.5,
        azimuth: 10.0,
        tilt: 30.0,
        power: 4600.0,
        power_inverter: 5000.0,
        inverter_efficiency: 0.9,
        horizon: String::new(),
        resource_id: String::new(),
    }]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            load: LoadConfig::default(),
            eos: EosConfig::default(),
            price: PriceConfig::default(),
            battery: BatteryConfig::default(),
            pv_forecast_source: PvForecastSourceConfig::default(),
            pv_forecast: default_pv_forecast(),
            inverter: InverterConfig::default(),
            evcc: EvccConfig::default(),
            refresh_time: default_refresh_time(),
            time_zone: default_time_zone(),
            eos_connect_web_port: default_web_port(),
            log_level: default_log_level(),
        }
    }
}

/// Outcome of reading the configuration file at boot.
pub enum ConfigLoad {
    Loaded(AppConfig),
    /// No file existed; a commented default was written for the operator to edit.
    CreatedDefault(PathBuf),
}

impl AppConfig {
    /// Reads `config.yaml` from `dir`. When the file is missing a default one
    /// is written and `CreatedDefault` is returned so the caller can exit
    /// cleanly and ask the operator to edit it.
    pub fn load(dir: &Path) -> Result<ConfigLoad> {
        let path = dir.join("config.yaml");
        if !path.exists() {
            std::fs::write(&path, default_config_yaml())
                .with_context(|| format!("failed to write default config to {}", path.display()))?;
            return Ok(ConfigLoad::CreatedDefault(path));
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in {}", path.display()))?;
        config.validate_all()?;
        Ok(ConfigLoad::Loaded(config))
    }

    /// Field ranges plus the cross-field checks that must hold before any
    /// worker is started.
    pub fn validate_all(&self) -> Result<()> {
        self.validate().context("configuration validation failed")?;

        self.parse_time_zone()?;

        if self.eos.timeout > self.refresh_time * 60 {
            bail!(
                "eos.timeout ({} s) must not exceed refresh_time ({} min = {} s)",
                self.eos.timeout,
                self.refresh_time,
                self.refresh_time * 60
            );
        }

        if self.pv_forecast.is_empty() {
            bail!("pv_forecast must contain at least one array entry");
        }

        if self.pv_forecast_source.source == PvForecastSource::Solcast {
            if self.pv_forecast_source.api_key.is_empty() {
                bail!("pv_forecast_source.api_key is required for the solcast source");
            }
            for entry in &self.pv_forecast {
                if entry.resource_id.is_empty() {
                    bail!(
                        "pv_forecast entry '{}' is missing resource_id required for solcast",
                        entry.name
                    );
                }
            }
        }

        Ok(())
    }

    pub fn parse_time_zone(&self) -> Result<Tz> {
        self.time_zone
            .parse::<Tz>()
            .map_err(|_| anyhow::anyhow!("time_zone '{}' is not a valid IANA zone", self.time_zone))
    }
}

/// Commented template written on first start. Kept in sync with the struct
/// defaults by the round-trip test below.
fn default_config_yaml() -> &'static str {
    r#"# EOS Connect configuration
# Load configuration
load:
  # Data source for load power - default, openhab or homeassistant
  source: default
  url: ""
  load_sensor: ""
  car_charge_load_sensor: ""
  access_token: ""
# EOS server configuration
eos:
  server: 192.168.1.94
  port: 8503
  # Optimization request deadline in seconds, must not exceed refresh_time
  timeout: 180
# Electricity price configuration
price:
  # akkudoktor, tibber, smartenergy_at or fixed_24h
  source: akkudoktor
  token: ""
  # Feed-in tariff in EUR per kWh
  feed_in_price: 0.0
  # Zero out feed-in for hours with negative market prices
  negative_price_switch: false
  fixed_24h_array: []
# Battery SoC source and physical parameters
battery:
  source: default
  url: ""
  soc_sensor: ""
  access_token: ""
  capacity_wh: 11059.0
  charge_efficiency: 0.88
  discharge_efficiency: 0.88
  max_charge_power_w: 5000.0
  min_soc_percentage: 5.0
  max_soc_percentage: 100.0
# PV forecast backend - akkudoktor, openmeteo, openmeteo_local, forecast_solar,
# solcast, evcc or default
pv_forecast_source:
  source: akkudoktor
  api_key: ""
# One entry per PV array
pv_forecast:
  - name: default
    lat: 47.5
    lon: 8.5
    azimuth: 10.0
    tilt: 30.0
    power: 4600.0
    power_inverter: 5000.0
    inverter_efficiency: 0.9
    # Comma separated minimum sun elevations per azimuth bin, empty = no shading
    horizon: ""
    resource_id: ""
# Inverter hardware driver - default (log only), fronius_gen24 or fronius_gen24_v2
inverter:
  type: default
  address: 192.168.1.102
  user: customer
  password: ""
  max_grid_charge_rate: 5000.0
  max_pv_charge_rate: 5000.0
  max_bat_discharge_rate: 5000.0
# EVCC instance, empty URL disables the provider
evcc:
  url: ""
# Scheduler period in minutes
refresh_time: 3
time_zone: Europe/Berlin
eos_connect_web_port: 8081
log_level: info
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses_and_matches_struct_defaults() {
        let from_template: AppConfig = serde_yaml::from_str(default_config_yaml()).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(
            serde_yaml::to_string(&from_template).unwrap(),
            serde_yaml::to_string(&defaults).unwrap()
        );
        from_template.validate_all().unwrap();
    }

    #[test]
    fn missing_file_creates_default_and_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        match AppConfig::load(dir.path()).unwrap() {
            ConfigLoad::CreatedDefault(path) => assert!(path.exists()),
            ConfigLoad::Loaded(_) => panic!("expected default creation"),
        }
        // Second load picks up the freshly written file.
        match AppConfig::load(dir.path()).unwrap() {
            ConfigLoad::Loaded(config) => assert_eq!(config.refresh_time, 3),
            ConfigLoad::CreatedDefault(_) => panic!("expected loaded config"),
        }
    }

    #[test]
    fn eos_timeout_must_not_exceed_refresh_period() {
        let mut config = AppConfig::default();
        config.refresh_time = 3;
        config.eos.timeout = 181;
        assert!(config.validate_all().is_err());

        // Equal to the period is the documented default and stays valid.
        config.eos.timeout = 180;
        assert!(config.validate_all().is_ok());
    }

    #[test]
    fn invalid_time_zone_is_fatal() {
        let mut config = AppConfig::default();
        config.time_zone = "Mars/Olympus_Mons".to_string();
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn solcast_requires_api_key_and_resource_ids() {
        let mut config = AppConfig::default();
        config.pv_forecast_source.source = PvForecastSource::Solcast;
        assert!(config.validate_all().is_err());

        config.pv_forecast_source.api_key = "key".to_string();
        assert!(config.validate_all().is_err());

        config.pv_forecast[0].resource_id = "aaaa-bbbb".to_string();
        assert!(config.validate_all().is_ok());
    }

    #[test]
    fn battery_soc_window_is_checked() {
        let mut config = AppConfig::default();
        config.battery.min_soc_percentage = 80.0;
        config.battery.max_soc_percentage = 20.0;
        assert!(config.validate_all().is_err());
    }
}
