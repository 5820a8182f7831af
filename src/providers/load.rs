//! Household load profile provider.
//!
//! Produces the 48 hour consumption forecast the optimizer needs. There is no
//! background worker: the profile is computed on demand during request
//! building, from persisted history when a smart-home backend is configured
//! and from a static day shape otherwise.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{LoadConfig, LoadSource};
use crate::domain::{normalize_series, HORIZON_HOURS};
use crate::httpx::{self, FetchError};

/// Average Wh per hour of a typical household day, used by the default source
/// and whenever history retrieval fails.
const DEFAULT_DAY_PROFILE: [f64; 24] = [
    200.0, 200.0, 200.0, 200.0, 200.0, 300.0, 350.0, 400.0, 350.0, 300.0, 300.0, 550.0, 450.0,
    400.0, 300.0, 300.0, 400.0, 450.0, 500.0, 500.0, 500.0, 400.0, 300.0, 200.0,
];

/// Car-charger readings below this are interpreted as kW and scaled to W.
const CAR_LOAD_KW_THRESHOLD: f64 = 23.0;

pub struct LoadProvider {
    config: LoadConfig,
    clock: Clock,
    client: reqwest::Client,
}

impl LoadProvider {
    pub fn new(config: LoadConfig, clock: Clock) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            clock,
            client: httpx::client(Duration::from_secs(10))?,
        })
    }

    /// 48 hourly Wh values. History failures degrade to the default profile,
    /// never to an error.
    pub async fn load_profile(&self) -> Vec<f64> {
        match self.config.source {
            LoadSource::Default => default_profile(),
            LoadSource::Openhab => match self.profile_from_openhab().await {
                Ok(profile) => profile,
                Err(err) => {
                    warn!(error = %err, "openhab load history failed, using default profile");
                    default_profile()
                }
            },
            LoadSource::Homeassistant => match self.profile_from_homeassistant().await {
                Ok(profile) => profile,
                Err(err) => {
                    warn!(error = %err, "home assistant load history failed, using default profile");
                    default_profile()
                }
            },
        }
    }

    /// Builds the profile from the previous 48 hours of OpenHAB persistence
    /// data, one request per hour.
    async fn profile_from_openhab(&self) -> Result<Vec<f64>, FetchError> {
        info!("creating load profile from openhab history");
        let end = self.clock.local_midnight().fixed_offset();
        let start = end - ChronoDuration::hours(HORIZON_HOURS as i64);

        let mut profile = Vec::with_capacity(HORIZON_HOURS);
        let mut hour = start;
        while hour < end {
            let next = hour + ChronoDuration::hours(1);
            let samples = self.fetch_openhab_hour(hour, next).await?;
            let energy_wh = average_power_wh(&samples, next);
            if energy_wh != 0.0 {
                profile.push(energy_wh.abs());
            }
            hour = next;
        }
        if profile.is_empty() {
            return Err(FetchError::MissingField("persistence data"));
        }
        Ok(normalize_series(profile, HORIZON_HOURS))
    }

    async fn fetch_openhab_hour(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<PowerSample>, FetchError> {
        let url = format!(
            "{}/rest/persistence/items/{}?starttime={}&endtime={}",
            self.config.url.trim_end_matches('/'),
            self.config.load_sensor,
            start.to_rfc3339(),
            end.to_rfc3339()
        );
        let payload: OpenhabHistory = httpx::get_json(&self.client, &url).await?;
        Ok(payload
            .data
            .into_iter()
            .filter_map(|entry| {
                let state = entry.state.parse::<f64>().ok()?;
                Some(PowerSample {
                    state,
                    at: DateTime::from_timestamp_millis(entry.time)?.fixed_offset(),
                })
            })
            .collect())
    }

    /// Builds the profile from Home Assistant history, subtracting the EV
    /// charger series when a sensor is configured.
    async fn profile_from_homeassistant(&self) -> Result<Vec<f64>, FetchError> {
        info!("creating load profile from home assistant history");
        let end = self.clock.local_midnight().fixed_offset();
        let start = end - ChronoDuration::hours(HORIZON_HOURS as i64);

        // One bulk fetch of the charger series to detect its unit. Values
        // below 23 can only be kW on a home charger.
        let car_unit_factor = if self.config.car_charge_load_sensor.is_empty() {
            1.0
        } else {
            let car_history = self
                .fetch_ha_history(&self.config.car_charge_load_sensor, start, end)
                .await
                .unwrap_or_default();
            let max_car_load = car_history
                .iter()
                .filter_map(|s| s.state.parse::<f64>().ok())
                .fold(0.0_f64, f64::max);
            if max_car_load > 0.0 && max_car_load < CAR_LOAD_KW_THRESHOLD {
                debug!(max_car_load, "car charger reports kW, scaling by 1000");
                1000.0
            } else {
                1.0
            }
        };

        let mut profile = Vec::with_capacity(HORIZON_HOURS);
        let mut hour = start;
        while hour < end {
            let next = hour + ChronoDuration::hours(1);
            let load_samples = self
                .fetch_ha_history(&self.config.load_sensor, hour, next)
                .await?;
            let samples = to_power_samples(&load_samples);
            let mut energy_wh = average_power_wh(&samples, next).abs();

            if !self.config.car_charge_load_sensor.is_empty() {
                let car_samples = self
                    .fetch_ha_history(&self.config.car_charge_load_sensor, hour, next)
                    .await
                    .unwrap_or_default();
                let car_wh =
                    (average_power_wh(&to_power_samples(&car_samples), next) * car_unit_factor)
                        .abs()
                        .max(0.0);
                energy_wh -= car_wh;
            }

            if energy_wh != 0.0 {
                profile.push(energy_wh.max(0.0));
            }
            hour = next;
        }
        if profile.is_empty() {
            return Err(FetchError::MissingField("history data"));
        }
        Ok(normalize_series(profile, HORIZON_HOURS))
    }

    async fn fetch_ha_history(
        &self,
        entity_id: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<HaStateEntry>, FetchError> {
        let url = format!(
            "{}/api/history/period/{}?filter_entity_id={}&end_time={}",
            self.config.url.trim_end_matches('/'),
            start.to_rfc3339(),
            entity_id,
            end.to_rfc3339()
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.access_token))
                .map_err(|_| FetchError::Decode("load.access_token is not a valid header".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let payload: Vec<Vec<HaStateEntry>> =
            httpx::get_json_with_headers(&self.client, &url, headers).await?;
        Ok(payload.into_iter().flatten().collect())
    }
}

pub fn default_profile() -> Vec<f64> {
    DEFAULT_DAY_PROFILE
        .iter()
        .cycle()
        .take(HORIZON_HOURS)
        .copied()
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct PowerSample {
    /// Instantaneous power in W.
    state: f64,
    at: DateTime<FixedOffset>,
}

fn to_power_samples(entries: &[HaStateEntry]) -> Vec<PowerSample> {
    entries
        .iter()
        .filter_map(|entry| {
            let state = entry.state.parse::<f64>().ok()?;
            let at = DateTime::parse_from_rfc3339(&entry.last_updated).ok()?;
            Some(PowerSample { state, at })
        })
        .collect()
}

/// Time-weighted average power over the hour, which numerically equals the
/// energy in Wh. The last sample is extended to the end of the hour.
fn average_power_wh(samples: &[PowerSample], hour_end: DateTime<FixedOffset>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut total_energy = 0.0;
    let mut total_seconds = 0.0;
    for pair in samples.windows(2) {
        let seconds = (pair[1].at - pair[0].at).num_seconds().max(0) as f64;
        total_energy += pair[0].state * seconds;
        total_seconds += seconds;
    }
    if let Some(last) = samples.last() {
        let tail_seconds = (hour_end - last.at).num_seconds().max(0) as f64;
        total_energy += last.state * tail_seconds;
        total_seconds += tail_seconds;
    }
    if total_seconds > 0.0 {
        ((total_energy / total_seconds) * 1e4).round() / 1e4
    } else {
        0.0
    }
}

#[derive(Debug, Deserialize)]
struct OpenhabHistory {
    #[serde(default)]
    data: Vec<OpenhabHistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenhabHistoryEntry {
    state: String,
    time: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct HaStateEntry {
    state: String,
    last_updated: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(minute: u32, power: f64) -> PowerSample {
        PowerSample {
            state: power,
            at: chrono::Utc
                .with_ymd_and_hms(2025, 6, 21, 10, minute, 0)
                .unwrap()
                .fixed_offset(),
        }
    }

    fn hour_end() -> DateTime<FixedOffset> {
        chrono::Utc
            .with_ymd_and_hms(2025, 6, 21, 11, 0, 0)
            .unwrap()
            .fixed_offset()
    }

    #[test]
    fn default_profile_covers_full_window() {
        let profile = default_profile();
        assert_eq!(profile.len(), HORIZON_HOURS);
        assert_eq!(profile[0], 200.0);
        assert_eq!(profile[11], 550.0);
        assert_eq!(profile[24], 200.0);
    }

    #[test]
    fn constant_power_yields_equal_energy() {
        let samples = vec![sample(0, 500.0), sample(30, 500.0)];
        assert_eq!(average_power_wh(&samples, hour_end()), 500.0);
    }

    #[test]
    fn weighted_average_respects_durations() {
        // 1000 W for 45 min, 0 W for the remaining 15 min -> 750 Wh.
        let samples = vec![sample(0, 1000.0), sample(45, 0.0)];
        assert_eq!(average_power_wh(&samples, hour_end()), 750.0);
    }

    #[test]
    fn single_sample_extends_to_hour_end() {
        let samples = vec![sample(30, 600.0)];
        assert_eq!(average_power_wh(&samples, hour_end()), 600.0);
    }

    #[test]
    fn empty_history_is_zero_energy() {
        assert_eq!(average_power_wh(&[], hour_end()), 0.0);
    }

    #[test]
    fn unparsable_states_are_skipped() {
        let entries = vec![
            HaStateEntry {
                state: "unavailable".to_string(),
                last_updated: "2025-06-21T10:00:00+00:00".to_string(),
            },
            HaStateEntry {
                state: "400".to_string(),
                last_updated: "2025-06-21T10:10:00+00:00".to_string(),
            },
        ];
        let samples = to_power_samples(&entries);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].state, 400.0);
    }
}
