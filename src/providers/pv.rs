//! PV generation and temperature forecast provider.
//!
//! One background worker refreshes every 15 minutes (2.5 h for Solcast, whose
//! free tier is rate limited). Each configured array is fetched separately
//! and the results are summed elementwise; temperature always comes from the
//! akkudoktor endpoint for the first array, whatever the PV source is.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{PvArrayConfig, PvForecastSource};
use crate::domain::{normalize_series, HORIZON_HOURS};
use crate::httpx::{self, FetchError};
use crate::providers::{ProviderError, SnapshotCell};

const AKKUDOKTOR_FORECAST_URL: &str = "https://api.akkudoktor.net/forecast";
const OPENMETEO_FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";
const FORECAST_SOLAR_URL: &str = "https://api.forecast.solar/estimate";
const SOLCAST_URL: &str = "https://api.solcast.com.au/rooftop_sites";

const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
const SOLCAST_REFRESH_INTERVAL: Duration = Duration::from_secs(150 * 60);

/// Irradiance scaling applied when the sun is below the configured horizon
/// elevation for its azimuth bin (diffuse light only).
const HORIZON_SHADING_FACTOR: f64 = 0.25;

pub struct PvProvider {
    source: PvForecastSource,
    api_key: String,
    evcc_url: String,
    arrays: Vec<PvArrayConfig>,
    clock: Clock,
    client: reqwest::Client,
    pv: SnapshotCell<Vec<f64>>,
    temperature: SnapshotCell<Vec<f64>>,
    last_error: SnapshotCell<Option<ProviderError>>,
}

impl PvProvider {
    pub fn new(
        source: PvForecastSource,
        api_key: String,
        evcc_url: String,
        arrays: Vec<PvArrayConfig>,
        clock: Clock,
    ) -> anyhow::Result<Self> {
        let total_peak: f64 = arrays.iter().map(|a| a.power).sum();
        Ok(Self {
            source,
            api_key,
            evcc_url,
            clock,
            client: httpx::client(Duration::from_secs(10))?,
            pv: SnapshotCell::new(default_power_shape(total_peak)),
            temperature: SnapshotCell::new(vec![15.0; HORIZON_HOURS]),
            last_error: SnapshotCell::new(None),
            arrays,
        })
    }

    pub async fn current_pv(&self) -> Vec<f64> {
        self.pv.get().await
    }

    pub async fn current_temperature(&self) -> Vec<f64> {
        self.temperature.get().await
    }

    pub async fn last_error(&self) -> Option<ProviderError> {
        self.last_error.get().await
    }

    pub fn refresh_interval(&self) -> Duration {
        if self.source == PvForecastSource::Solcast {
            SOLCAST_REFRESH_INTERVAL
        } else {
            REFRESH_INTERVAL
        }
    }

    pub async fn run(self: std::sync::Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = token.cancelled() => break,
            }
            self.refresh().await;
        }
    }

    pub async fn refresh(&self) {
        let mut aggregate = vec![0.0; HORIZON_HOURS];
        for array in &self.arrays {
            let forecast = match self.fetch_array(array).await {
                Ok(values) => values,
                Err(err) => {
                    warn!(
                        array = %array.name,
                        source = ?self.source,
                        error = %err,
                        "PV fetch failed, using default shape"
                    );
                    self.last_error
                        .set(Some(ProviderError::from_fetch(
                            "pv_forecast",
                            format!("pv_forecast[{}]", array.name),
                            &err,
                        )))
                        .await;
                    default_power_shape(array.power)
                }
            };
            for (sum, value) in aggregate.iter_mut().zip(forecast.iter()) {
                *sum += value;
            }
        }
        self.pv.set(aggregate).await;

        let temperature = match self.fetch_temperature().await {
            Ok(values) => values,
            Err(err) => {
                warn!(error = %err, "temperature fetch failed, using 15 degC fallback");
                vec![15.0; HORIZON_HOURS]
            }
        };
        self.temperature.set(temperature).await;
        info!(source = ?self.source, "PV and temperature forecast updated");
    }

    async fn fetch_array(&self, array: &PvArrayConfig) -> Result<Vec<f64>, FetchError> {
        let values = match self.source {
            PvForecastSource::Akkudoktor => self.fetch_akkudoktor_power(array).await?,
            PvForecastSource::Openmeteo => self.fetch_openmeteo(array).await?,
            PvForecastSource::OpenmeteoLocal => self.fetch_openmeteo_local(array).await?,
            PvForecastSource::ForecastSolar => self.fetch_forecast_solar(array).await?,
            PvForecastSource::Solcast => self.fetch_solcast(array).await?,
            PvForecastSource::Evcc => self.fetch_evcc_solar(array).await?,
            PvForecastSource::Default => default_power_shape(array.power),
        };
        Ok(normalize_series(values, HORIZON_HOURS))
    }

    fn akkudoktor_url(&self, array: &PvArrayConfig) -> String {
        let mut url = format!(
            "{AKKUDOKTOR_FORECAST_URL}?lat={}&lon={}&azimuth={}&tilt={}&power={}&powerInverter={}&inverterEfficiency={}",
            array.lat,
            array.lon,
            array.azimuth,
            array.tilt,
            array.power,
            array.power_inverter,
            array.inverter_efficiency
        );
        if !array.horizon.is_empty() {
            url.push_str("&horizont=");
            url.push_str(&array.horizon);
        }
        url
    }

    async fn fetch_akkudoktor_power(&self, array: &PvArrayConfig) -> Result<Vec<f64>, FetchError> {
        let payload: AkkudoktorForecast =
            httpx::get_json(&self.client, &self.akkudoktor_url(array)).await?;
        let mut values = self.collect_window(&payload, |entry| entry.power.map(|p| p.max(0.0)))?;
        // The upstream grid is shifted by one sample against the local hour
        // grid; drop the first entry and backfill the tail.
        if !values.is_empty() {
            values.remove(0);
            values.push(0.0);
        }
        Ok(values)
    }

    async fn fetch_temperature(&self) -> Result<Vec<f64>, FetchError> {
        let array = self
            .arrays
            .first()
            .ok_or(FetchError::MissingField("pv_forecast[0]"))?;
        let payload: AkkudoktorForecast =
            httpx::get_json(&self.client, &self.akkudoktor_url(array)).await?;
        let values = self.collect_window(&payload, |entry| entry.temperature)?;
        Ok(normalize_series(values, HORIZON_HOURS))
    }

    /// Collects one value per sample inside [local midnight, +48 h).
    fn collect_window(
        &self,
        payload: &AkkudoktorForecast,
        select: impl Fn(&AkkudoktorEntry) -> Option<f64>,
    ) -> Result<Vec<f64>, FetchError> {
        let start = self.clock.local_midnight().with_timezone(&Utc);
        let end = start + chrono::Duration::hours(HORIZON_HOURS as i64);
        let mut values = Vec::with_capacity(HORIZON_HOURS);
        for day in &payload.values {
            for entry in day {
                let at = DateTime::parse_from_rfc3339(&entry.datetime)
                    .map_err(|e| FetchError::Decode(format!("bad datetime: {e}")))?
                    .with_timezone(&Utc);
                if at >= start && at < end {
                    values.push(select(entry).unwrap_or(0.0));
                }
            }
        }
        if values.is_empty() {
            return Err(FetchError::MissingField("values"));
        }
        Ok(values)
    }

    /// Quarter-hour plane-of-array irradiance from Open-Meteo, integrated to
    /// Wh per hour.
    async fn fetch_openmeteo(&self, array: &PvArrayConfig) -> Result<Vec<f64>, FetchError> {
        let url = format!(
            "{OPENMETEO_FORECAST_URL}?latitude={}&longitude={}&minutely_15=global_tilted_irradiance&tilt={}&azimuth={}&forecast_days=2&timezone=auto",
            array.lat, array.lon, array.tilt, array.azimuth
        );
        let payload: OpenMeteoMinutely = httpx::get_json(&self.client, &url).await?;
        let irradiance = payload.minutely_15.global_tilted_irradiance;
        if irradiance.is_empty() {
            return Err(FetchError::MissingField("minutely_15.global_tilted_irradiance"));
        }
        let shading = HorizonTable::parse(&array.horizon);
        let midnight = self.clock.local_midnight();
        let hours = irradiance.len() / 4;
        let mut out = Vec::with_capacity(hours);
        for hour in 0..hours {
            let slots = &irradiance[hour * 4..hour * 4 + 4];
            let mut energy_wh = 0.0;
            for (slot, gti) in slots.iter().enumerate() {
                let gti = gti.unwrap_or(0.0).max(0.0);
                let at = midnight
                    + chrono::Duration::minutes((hour * 60 + slot * 15 + 7) as i64);
                let sun = SunPosition::at(at.with_timezone(&Utc), array.lat, array.lon);
                let factor = if shading.is_shaded(&sun) {
                    HORIZON_SHADING_FACTOR
                } else {
                    1.0
                };
                let dc_w = gti * factor / 1000.0 * array.power;
                let ac_w = dc_w.min(array.power_inverter) * array.inverter_efficiency;
                energy_wh += ac_w / 4.0;
            }
            out.push(energy_wh);
        }
        Ok(out)
    }

    /// Local irradiance model: raw shortwave radiation split into direct and
    /// diffuse by cloud cover, projected onto the array plane, shaded by the
    /// horizon table.
    async fn fetch_openmeteo_local(&self, array: &PvArrayConfig) -> Result<Vec<f64>, FetchError> {
        let url = format!(
            "{OPENMETEO_FORECAST_URL}?latitude={}&longitude={}&hourly=shortwave_radiation,cloud_cover&forecast_days=2&timezone=auto",
            array.lat, array.lon
        );
        let payload: OpenMeteoHourly = httpx::get_json(&self.client, &url).await?;
        let radiation = payload.hourly.shortwave_radiation;
        if radiation.is_empty() {
            return Err(FetchError::MissingField("hourly.shortwave_radiation"));
        }
        let clouds = payload.hourly.cloud_cover;
        let shading = HorizonTable::parse(&array.horizon);
        let midnight = self.clock.local_midnight();

        let mut out = Vec::with_capacity(radiation.len());
        for (hour, ghi) in radiation.iter().enumerate() {
            let ghi = ghi.unwrap_or(0.0).max(0.0);
            let cloud_fraction = clouds
                .get(hour)
                .copied()
                .flatten()
                .unwrap_or(100.0)
                .clamp(0.0, 100.0)
                / 100.0;
            let at = midnight + chrono::Duration::minutes(hour as i64 * 60 + 30);
            let sun = SunPosition::at(at.with_timezone(&Utc), array.lat, array.lon);
            let poa = plane_of_array_irradiance(ghi, cloud_fraction, &sun, array, &shading);
            let dc_w = poa / 1000.0 * array.power;
            let ac_w = dc_w.min(array.power_inverter) * array.inverter_efficiency;
            out.push(ac_w);
        }
        Ok(out)
    }

    async fn fetch_forecast_solar(&self, array: &PvArrayConfig) -> Result<Vec<f64>, FetchError> {
        let url = format!(
            "{FORECAST_SOLAR_URL}/{}/{}/{}/{}/{}",
            array.lat,
            array.lon,
            array.tilt,
            array.azimuth,
            array.power / 1000.0
        );
        let payload: ForecastSolarResponse = httpx::get_json(&self.client, &url).await?;
        let watts = payload.result.watts;
        if watts.is_empty() {
            return Err(FetchError::MissingField("result.watts"));
        }
        let mut slots = HourSlots::new(self.clock.local_midnight().fixed_offset());
        for (stamp, value) in &watts {
            // Keys are local "YYYY-MM-DD HH:MM:SS" strings.
            let Ok(naive) = chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S") else {
                continue;
            };
            slots.add_naive_local(naive, *value);
        }
        Ok(slots.averages())
    }

    async fn fetch_solcast(&self, array: &PvArrayConfig) -> Result<Vec<f64>, FetchError> {
        let url = format!("{SOLCAST_URL}/{}/forecasts?format=json", array.resource_id);
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| FetchError::Decode("invalid solcast api key".into()))?,
        );
        let payload: SolcastResponse =
            httpx::get_json_with_headers(&self.client, &url, headers).await?;
        if payload.forecasts.is_empty() {
            return Err(FetchError::MissingField("forecasts"));
        }
        let tz = self.clock.tz();
        let mut slots = HourSlots::new(self.clock.local_midnight().fixed_offset());
        for entry in &payload.forecasts {
            // period_end marks the end of a 30 min estimate; shift to its
            // middle so the sample lands in the right hour bucket.
            let mid = (entry.period_end - chrono::Duration::minutes(15)).with_timezone(&tz);
            slots.add_local(mid.fixed_offset(), entry.pv_estimate * 1000.0);
        }
        Ok(slots.averages())
    }

    async fn fetch_evcc_solar(&self, _array: &PvArrayConfig) -> Result<Vec<f64>, FetchError> {
        if self.evcc_url.is_empty() {
            return Err(FetchError::MissingField("evcc.url"));
        }
        let url = format!("{}/api/tariff/solar", self.evcc_url.trim_end_matches('/'));
        let payload: EvccSolarResponse = httpx::get_json(&self.client, &url).await?;
        let rates = payload.result.rates;
        if rates.is_empty() {
            return Err(FetchError::MissingField("result.rates"));
        }
        let tz = self.clock.tz();
        let mut slots = HourSlots::new(self.clock.local_midnight().fixed_offset());
        for rate in &rates {
            let mid = (rate.start + chrono::Duration::minutes(7)).with_timezone(&tz);
            slots.add_local(mid.fixed_offset(), rate.value.max(0.0));
        }
        Ok(slots.averages())
    }
}

/// Clear-day generation shape used when no forecast is reachable: zero at
/// night, peaking at 70 % of the array rating around noon.
pub fn default_power_shape(peak_power_w: f64) -> Vec<f64> {
    const FRACTIONS: [f64; 24] = [
        0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.6, 0.5, 0.4, 0.3,
        0.2, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0,
    ];
    FRACTIONS
        .iter()
        .cycle()
        .take(HORIZON_HOURS)
        .map(|f| f * peak_power_w)
        .collect()
}

/// Accumulates sub-hourly samples into the 48 hour window and averages them
/// per hour. Hours without samples stay at zero.
struct HourSlots {
    midnight: DateTime<FixedOffset>,
    sums: [f64; HORIZON_HOURS],
    counts: [u32; HORIZON_HOURS],
}

impl HourSlots {
    fn new(midnight: DateTime<FixedOffset>) -> Self {
        Self {
            midnight,
            sums: [0.0; HORIZON_HOURS],
            counts: [0; HORIZON_HOURS],
        }
    }

    fn add_local(&mut self, at: DateTime<FixedOffset>, value: f64) {
        let offset = at.signed_duration_since(self.midnight);
        let hours = offset.num_hours();
        if (0..HORIZON_HOURS as i64).contains(&hours) && offset.num_seconds() >= 0 {
            self.sums[hours as usize] += value;
            self.counts[hours as usize] += 1;
        }
    }

    fn add_naive_local(&mut self, at: chrono::NaiveDateTime, value: f64) {
        let localized = at.and_local_timezone(self.midnight.timezone()).earliest();
        if let Some(at) = localized {
            self.add_local(at, value);
        }
    }

    fn averages(&self) -> Vec<f64> {
        self.sums
            .iter()
            .zip(self.counts.iter())
            .map(|(sum, count)| if *count > 0 { sum / *count as f64 } else { 0.0 })
            .collect()
    }
}

/// Per-azimuth minimum sun elevation below which the array sits in shade.
/// 36 bins of 10 degrees, starting north, clockwise.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonTable {
    elevations: Option<[f64; 36]>,
}

impl HorizonTable {
    /// Parses the comma separated config string. Entries may carry a legacy
    /// `<elevation>t<factor>` suffix; only the elevation part is used.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self { elevations: None };
        }
        let values: Vec<f64> = raw
            .split(',')
            .map(|entry| {
                let head = entry.split('t').next().unwrap_or("");
                head.trim().parse::<f64>().unwrap_or(0.0)
            })
            .collect();
        if values.is_empty() {
            return Self { elevations: None };
        }
        Self {
            elevations: Some(resample_to_bins(&values)),
        }
    }

    pub fn is_shaded(&self, sun: &SunPosition) -> bool {
        let Some(table) = &self.elevations else {
            return false;
        };
        if sun.elevation_deg <= 0.0 {
            return false;
        }
        let bin = ((sun.azimuth_deg.rem_euclid(360.0)) / 10.0) as usize % 36;
        sun.elevation_deg < table[bin]
    }
}

/// Linear resample of an arbitrary-length horizon list onto the 36 bins.
fn resample_to_bins(values: &[f64]) -> [f64; 36] {
    let mut bins = [0.0; 36];
    if values.len() == 1 {
        bins.fill(values[0]);
        return bins;
    }
    for (i, bin) in bins.iter_mut().enumerate() {
        let position = i as f64 * (values.len() - 1) as f64 / 35.0;
        let lower = position.floor() as usize;
        let upper = (lower + 1).min(values.len() - 1);
        let weight = position - lower as f64;
        *bin = values[lower] * (1.0 - weight) + values[upper] * weight;
    }
    bins
}

/// Sun elevation and azimuth (degrees, azimuth from north, clockwise) from a
/// compact declination / hour-angle model. Accuracy around one degree, which
/// is plenty for shading decisions.
#[derive(Debug, Clone, Copy)]
pub struct SunPosition {
    pub elevation_deg: f64,
    pub azimuth_deg: f64,
}

impl SunPosition {
    pub fn at(at: DateTime<Utc>, lat_deg: f64, lon_deg: f64) -> Self {
        let day = at.ordinal() as f64;
        let declination =
            23.45_f64.to_radians() * ((360.0 / 365.0) * (284.0 + day)).to_radians().sin();
        let solar_hour =
            at.hour() as f64 + at.minute() as f64 / 60.0 + lon_deg / 15.0;
        let hour_angle = (15.0 * (solar_hour - 12.0)).to_radians();
        let lat = lat_deg.to_radians();

        let sin_elevation = lat.sin() * declination.sin()
            + lat.cos() * declination.cos() * hour_angle.cos();
        let elevation = sin_elevation.clamp(-1.0, 1.0).asin();

        let cos_azimuth = (declination.sin() - elevation.sin() * lat.sin())
            / (elevation.cos() * lat.cos()).max(1e-9);
        let mut azimuth = cos_azimuth.clamp(-1.0, 1.0).acos().to_degrees();
        if hour_angle > 0.0 {
            azimuth = 360.0 - azimuth;
        }
        Self {
            elevation_deg: elevation.to_degrees(),
            azimuth_deg: azimuth,
        }
    }
}

/// Projects global horizontal irradiance onto the array plane. Direct and
/// diffuse components are split by cloud fraction; only the direct part is
/// subject to horizon shading.
fn plane_of_array_irradiance(
    ghi: f64,
    cloud_fraction: f64,
    sun: &SunPosition,
    array: &PvArrayConfig,
    shading: &HorizonTable,
) -> f64 {
    if sun.elevation_deg <= 0.0 || ghi <= 0.0 {
        return 0.0;
    }
    let diffuse_fraction = (0.2 + 0.8 * cloud_fraction).min(1.0);
    let diffuse = ghi * diffuse_fraction;
    let direct_horizontal = ghi - diffuse;

    let elevation = sun.elevation_deg.to_radians();
    let tilt = array.tilt.to_radians();
    // Config azimuth is south-referenced; the sun azimuth is north-referenced.
    let panel_azimuth = (180.0 + array.azimuth).rem_euclid(360.0);
    let azimuth_delta = (sun.azimuth_deg - panel_azimuth).to_radians();
    let cos_incidence =
        elevation.sin() * tilt.cos() + elevation.cos() * tilt.sin() * azimuth_delta.cos();

    let dni = direct_horizontal / elevation.sin().max(0.05);
    let mut direct_poa = dni * cos_incidence.max(0.0);
    if shading.is_shaded(sun) {
        direct_poa *= HORIZON_SHADING_FACTOR;
    }
    let diffuse_poa = diffuse * (1.0 + tilt.cos()) / 2.0;
    direct_poa + diffuse_poa
}

#[derive(Debug, Deserialize)]
struct AkkudoktorForecast {
    values: Vec<Vec<AkkudoktorEntry>>,
}

#[derive(Debug, Deserialize)]
struct AkkudoktorEntry {
    datetime: String,
    power: Option<f64>,
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoMinutely {
    minutely_15: OpenMeteoMinutelyBlock,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoMinutelyBlock {
    global_tilted_irradiance: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    hourly: OpenMeteoHourlyBlock,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourlyBlock {
    shortwave_radiation: Vec<Option<f64>>,
    #[serde(default)]
    cloud_cover: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct ForecastSolarResponse {
    result: ForecastSolarResult,
}

#[derive(Debug, Deserialize)]
struct ForecastSolarResult {
    watts: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct SolcastResponse {
    forecasts: Vec<SolcastEntry>,
}

#[derive(Debug, Deserialize)]
struct SolcastEntry {
    pv_estimate: f64,
    period_end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct EvccSolarResponse {
    result: EvccSolarResult,
}

#[derive(Debug, Deserialize)]
struct EvccSolarResult {
    rates: Vec<EvccSolarRate>,
}

#[derive(Debug, Deserialize)]
struct EvccSolarRate {
    start: DateTime<Utc>,
    #[serde(alias = "price")]
    value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn array() -> PvArrayConfig {
        PvArrayConfig {
            name: "test".to_string(),
            lat: 47.5,
            lon: 8.5,
            azimuth: 0.0,
            tilt: 30.0,
            power: 5000.0,
            power_inverter: 5000.0,
            inverter_efficiency: 0.9,
            horizon: String::new(),
            resource_id: String::new(),
        }
    }

    #[test]
    fn default_shape_is_dark_at_night_and_peaks_at_noon() {
        let shape = default_power_shape(1000.0);
        assert_eq!(shape.len(), HORIZON_HOURS);
        assert_eq!(shape[0], 0.0);
        assert_eq!(shape[12], 700.0);
        assert_eq!(shape[36], 700.0);
    }

    #[test]
    fn horizon_table_passthrough_when_empty() {
        let table = HorizonTable::parse("");
        let sun = SunPosition {
            elevation_deg: 1.0,
            azimuth_deg: 180.0,
        };
        assert!(!table.is_shaded(&sun));
    }

    #[test]
    fn horizon_table_shades_low_sun() {
        let table = HorizonTable::parse(&vec!["30"; 36].join(","));
        let low = SunPosition {
            elevation_deg: 10.0,
            azimuth_deg: 170.0,
        };
        let high = SunPosition {
            elevation_deg: 45.0,
            azimuth_deg: 170.0,
        };
        assert!(table.is_shaded(&low));
        assert!(!table.is_shaded(&high));
    }

    #[test]
    fn horizon_table_ignores_legacy_factor_suffix() {
        let table = HorizonTable::parse("50t0.4");
        let sun = SunPosition {
            elevation_deg: 40.0,
            azimuth_deg: 10.0,
        };
        assert!(table.is_shaded(&sun));
    }

    #[test]
    fn horizon_table_interpolates_short_lists() {
        // 4 entries spread over 36 bins; the midpoint between 0 and 40
        // should sit near 20.
        let table = HorizonTable::parse("0,40,0,40");
        let elevations = table.elevations.unwrap();
        assert_eq!(elevations[0], 0.0);
        assert!((elevations[6] - 20.0).abs() < 5.0);
    }

    #[test]
    fn sun_is_up_at_noon_and_down_at_midnight() {
        let noon = Utc.with_ymd_and_hms(2025, 6, 21, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2025, 6, 21, 0, 0, 0).unwrap();
        assert!(SunPosition::at(noon, 47.5, 0.0).elevation_deg > 40.0);
        assert!(SunPosition::at(midnight, 47.5, 0.0).elevation_deg < 0.0);
    }

    #[test]
    fn south_facing_sun_has_southern_azimuth() {
        let noon = Utc.with_ymd_and_hms(2025, 6, 21, 12, 0, 0).unwrap();
        let azimuth = SunPosition::at(noon, 47.5, 0.0).azimuth_deg;
        assert!((azimuth - 180.0).abs() < 15.0, "azimuth was {azimuth}");
    }

    #[test]
    fn poa_is_zero_at_night() {
        let sun = SunPosition {
            elevation_deg: -5.0,
            azimuth_deg: 0.0,
        };
        let poa =
            plane_of_array_irradiance(500.0, 0.0, &sun, &array(), &HorizonTable::parse(""));
        assert_eq!(poa, 0.0);
    }

    #[test]
    fn clear_sky_beats_overcast() {
        let sun = SunPosition {
            elevation_deg: 45.0,
            azimuth_deg: 180.0,
        };
        let table = HorizonTable::parse("");
        let clear = plane_of_array_irradiance(600.0, 0.0, &sun, &array(), &table);
        let overcast = plane_of_array_irradiance(600.0, 1.0, &sun, &array(), &table);
        assert!(clear > overcast);
    }

    #[test]
    fn hour_slots_average_subhourly_samples() {
        let midnight = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2025, 6, 21, 0, 0, 0)
            .unwrap()
            .fixed_offset();
        let mut slots = HourSlots::new(midnight);
        slots.add_local(midnight + chrono::Duration::minutes(610), 1000.0);
        slots.add_local(midnight + chrono::Duration::minutes(640), 2000.0);
        let averages = slots.averages();
        assert_eq!(averages[10], 1500.0);
        assert_eq!(averages[9], 0.0);
    }

    #[test]
    fn hour_slots_drop_out_of_window_samples() {
        let midnight = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2025, 6, 21, 0, 0, 0)
            .unwrap()
            .fixed_offset();
        let mut slots = HourSlots::new(midnight);
        slots.add_local(midnight - chrono::Duration::minutes(30), 999.0);
        slots.add_local(midnight + chrono::Duration::hours(49), 999.0);
        assert!(slots.averages().iter().all(|v| *v == 0.0));
    }

    proptest! {
        #[test]
        fn resampled_horizon_always_has_36_bins(
            values in proptest::collection::vec(0.0f64..90.0, 1..80),
        ) {
            let raw = values
                .iter()
                .map(|v| format!("{v:.1}"))
                .collect::<Vec<_>>()
                .join(",");
            let table = HorizonTable::parse(&raw);
            prop_assert!(table.elevations.is_some());
        }

        #[test]
        fn sun_elevation_is_physical(
            hour in 0u32..24,
            lat in -60.0f64..60.0,
            lon in -180.0f64..180.0,
        ) {
            let at = Utc.with_ymd_and_hms(2025, 3, 21, hour, 0, 0).unwrap();
            let sun = SunPosition::at(at, lat, lon);
            prop_assert!(sun.elevation_deg >= -90.0 && sun.elevation_deg <= 90.0);
            prop_assert!(sun.azimuth_deg >= 0.0 && sun.azimuth_deg <= 360.0);
        }
    }
}
