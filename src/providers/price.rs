//! Electricity price provider.
//!
//! Refreshed at the start of every optimization run rather than on its own
//! cadence: the scheduler needs vectors that are current for exactly the
//! window it is about to optimize.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{PriceConfig, PriceSource};
use crate::domain::{round_price, PriceSet, HORIZON_HOURS};
use crate::httpx::{self, FetchError};
use crate::providers::{ProviderError, SnapshotCell};

const AKKUDOKTOR_PRICES_URL: &str = "https://api.akkudoktor.net/prices";
const TIBBER_API_URL: &str = "https://api.tibber.com/v1-beta/gql";
const SMARTENERGY_API_URL: &str = "https://apis.smartenergy.at/market/v1/price";

pub struct PriceProvider {
    config: PriceConfig,
    clock: Clock,
    client: reqwest::Client,
    snapshot: SnapshotCell<PriceSet>,
    last_error: SnapshotCell<Option<ProviderError>>,
    ever_succeeded: SnapshotCell<bool>,
}

impl PriceProvider {
    pub fn new(config: PriceConfig, clock: Clock) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            clock,
            client: httpx::client(Duration::from_secs(10))?,
            snapshot: SnapshotCell::new(PriceSet::fallback(HORIZON_HOURS)),
            last_error: SnapshotCell::new(None),
            ever_succeeded: SnapshotCell::new(false),
        })
    }

    pub async fn current(&self) -> PriceSet {
        self.snapshot.get().await
    }

    pub async fn last_error(&self) -> Option<ProviderError> {
        self.last_error.get().await
    }

    /// Fetches today+tomorrow, slices from the current hour with wrap-around
    /// and publishes the derived price set. On failure the previous snapshot
    /// stays; until a first success that is the documented flat fallback.
    pub async fn refresh(&self) {
        match self.fetch_raw().await {
            Ok((total, direct)) => {
                let current_hour = self.clock.current_hour();
                let set = PriceSet::from_vectors(
                    slice_from_hour(total, current_hour, HORIZON_HOURS),
                    slice_from_hour(direct, current_hour, HORIZON_HOURS),
                    HORIZON_HOURS,
                    self.config.feed_in_price,
                    self.config.negative_price_switch,
                );
                self.snapshot.set(set).await;
                self.ever_succeeded.set(true).await;
                self.last_error.set(None).await;
                info!(source = ?self.config.source, "prices updated");
            }
            Err(err) => {
                let fallback = if self.ever_succeeded.get().await {
                    "keeping last known prices"
                } else {
                    "using flat fallback prices"
                };
                warn!(source = ?self.config.source, error = %err, fallback, "price refresh failed");
                self.last_error
                    .set(Some(ProviderError::from_fetch("price", "price.source", &err)))
                    .await;
            }
        }
    }

    /// Returns midnight-aligned (total, direct) vectors covering two days,
    /// today repeated when tomorrow is not published yet.
    async fn fetch_raw(&self) -> Result<(Vec<f64>, Vec<f64>), FetchError> {
        match self.config.source {
            PriceSource::Akkudoktor => self.fetch_akkudoktor().await,
            PriceSource::Tibber => self.fetch_tibber().await,
            PriceSource::SmartenergyAt => self.fetch_smartenergy().await,
            PriceSource::Fixed24h => self.fixed_prices(),
        }
    }

    async fn fetch_akkudoktor(&self) -> Result<(Vec<f64>, Vec<f64>), FetchError> {
        let start = self.clock.local_midnight();
        let end = start + chrono::Duration::days(1);
        let url = format!(
            "{AKKUDOKTOR_PRICES_URL}?start={}&end={}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        debug!(%url, "requesting akkudoktor prices");
        let payload: AkkudoktorPrices = httpx::get_json(&self.client, &url).await?;
        if payload.values.is_empty() {
            return Err(FetchError::MissingField("values"));
        }
        // Eurocent/kWh -> EUR/Wh. The market price has no tax component, so
        // total and direct coincide for this source.
        let prices: Vec<f64> = payload
            .values
            .iter()
            .map(|v| round_price(v.marketprice_eurocent_per_kwh / 100_000.0))
            .collect();
        let tiled = repeat_today_if_needed(prices);
        Ok((tiled.clone(), tiled))
    }

    async fn fetch_tibber(&self) -> Result<(Vec<f64>, Vec<f64>), FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&self.config.token)
                .map_err(|_| FetchError::Decode("price.token is not a valid header value".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let query = serde_json::json!({
            "query": "{ viewer { homes { currentSubscription { priceInfo { \
                      today { total energy startsAt } \
                      tomorrow { total energy startsAt } } } } } }"
        });
        let payload: TibberResponse =
            httpx::post_json(&self.client, TIBBER_API_URL, headers, &query).await?;

        if let Some(errors) = payload.errors {
            let message = errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown tibber error".to_string());
            return Err(FetchError::Decode(message));
        }

        let price_info = payload
            .data
            .and_then(|d| d.viewer.homes.into_iter().next())
            .and_then(|h| h.current_subscription)
            .map(|s| s.price_info)
            .ok_or(FetchError::MissingField("viewer.homes[0].currentSubscription"))?;
        if price_info.today.is_empty() {
            return Err(FetchError::MissingField("priceInfo.today"));
        }

        let mut total: Vec<f64> = Vec::with_capacity(HORIZON_HOURS);
        let mut direct: Vec<f64> = Vec::with_capacity(HORIZON_HOURS);
        for entry in price_info.today.iter().chain(price_info.tomorrow.iter()) {
            total.push(round_price(entry.total / 1000.0));
            direct.push(round_price(entry.energy / 1000.0));
        }
        if price_info.tomorrow.is_empty() {
            let today_total: Vec<f64> = total.iter().take(24).copied().collect();
            let today_direct: Vec<f64> = direct.iter().take(24).copied().collect();
            total.extend(today_total);
            direct.extend(today_direct);
        }
        Ok((total, direct))
    }

    async fn fetch_smartenergy(&self) -> Result<(Vec<f64>, Vec<f64>), FetchError> {
        let payload: SmartenergyPrices =
            httpx::get_json(&self.client, SMARTENERGY_API_URL).await?;
        if payload.data.is_empty() {
            return Err(FetchError::MissingField("data"));
        }
        // Quarter-hour market values in ct/kWh, averaged to hourly EUR/Wh.
        let hourly: Vec<f64> = payload
            .data
            .chunks(4)
            .map(|chunk| {
                let mean = chunk.iter().map(|e| e.value).sum::<f64>() / chunk.len() as f64;
                round_price(mean / 100_000.0)
            })
            .collect();
        let tiled = repeat_today_if_needed(hourly);
        Ok((tiled.clone(), tiled))
    }

    fn fixed_prices(&self) -> Result<(Vec<f64>, Vec<f64>), FetchError> {
        if self.config.fixed_24h_array.is_empty() {
            return Err(FetchError::MissingField("price.fixed_24h_array"));
        }
        let day: Vec<f64> = self
            .config
            .fixed_24h_array
            .iter()
            .map(|v| round_price(v / 1000.0))
            .collect();
        let tiled = repeat_today_if_needed(day);
        Ok((tiled.clone(), tiled))
    }
}

/// Upstreams publish tomorrow's prices in the afternoon; before that, today's
/// day is repeated so the window is always fully covered.
fn repeat_today_if_needed(mut prices: Vec<f64>) -> Vec<f64> {
    if prices.len() < HORIZON_HOURS {
        let today: Vec<f64> = prices.iter().take(24).copied().collect();
        while prices.len() < HORIZON_HOURS {
            let missing = HORIZON_HOURS - prices.len();
            prices.extend(today.iter().take(missing).copied());
        }
    }
    prices
}

/// Window starts at the current local hour; a short tail wraps around to the
/// start of the fetched range.
fn slice_from_hour(prices: Vec<f64>, current_hour: usize, horizon: usize) -> Vec<f64> {
    if prices.is_empty() {
        return prices;
    }
    let mut out: Vec<f64> = prices
        .iter()
        .skip(current_hour)
        .take(horizon)
        .copied()
        .collect();
    if out.len() < horizon {
        let missing = horizon - out.len();
        out.extend(prices.iter().take(missing).copied());
    }
    out
}

#[derive(Debug, Deserialize)]
struct AkkudoktorPrices {
    values: Vec<AkkudoktorPriceEntry>,
}

#[derive(Debug, Deserialize)]
struct AkkudoktorPriceEntry {
    #[serde(rename = "marketpriceEurocentPerKWh")]
    marketprice_eurocent_per_kwh: f64,
}

#[derive(Debug, Deserialize)]
struct TibberResponse {
    data: Option<TibberData>,
    errors: Option<Vec<TibberError>>,
}

#[derive(Debug, Deserialize)]
struct TibberError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TibberData {
    viewer: TibberViewer,
}

#[derive(Debug, Deserialize)]
struct TibberViewer {
    homes: Vec<TibberHome>,
}

#[derive(Debug, Deserialize)]
struct TibberHome {
    #[serde(rename = "currentSubscription")]
    current_subscription: Option<TibberSubscription>,
}

#[derive(Debug, Deserialize)]
struct TibberSubscription {
    #[serde(rename = "priceInfo")]
    price_info: TibberPriceInfo,
}

#[derive(Debug, Deserialize, Default)]
struct TibberPriceInfo {
    #[serde(default)]
    today: Vec<TibberPriceEntry>,
    #[serde(default)]
    tomorrow: Vec<TibberPriceEntry>,
}

#[derive(Debug, Deserialize)]
struct TibberPriceEntry {
    total: f64,
    energy: f64,
}

#[derive(Debug, Deserialize)]
struct SmartenergyPrices {
    data: Vec<SmartenergyEntry>,
}

#[derive(Debug, Deserialize)]
struct SmartenergyEntry {
    value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn provider_with(config: PriceConfig) -> PriceProvider {
        PriceProvider::new(config, Clock::new(chrono_tz::Europe::Berlin)).unwrap()
    }

    #[test]
    fn slice_wraps_around_to_window_start() {
        let prices: Vec<f64> = (0..48).map(f64::from).collect();
        let sliced = slice_from_hour(prices, 40, 48);
        assert_eq!(sliced.len(), 48);
        assert_eq!(sliced[0], 40.0);
        assert_eq!(sliced[7], 47.0);
        assert_eq!(sliced[8], 0.0);
        assert_eq!(sliced[47], 39.0);
    }

    #[test]
    fn missing_tomorrow_repeats_today() {
        let today: Vec<f64> = (0..24).map(f64::from).collect();
        let tiled = repeat_today_if_needed(today.clone());
        assert_eq!(tiled.len(), 48);
        assert_eq!(&tiled[24..], today.as_slice());
    }

    #[test]
    fn dst_sized_day_still_covers_window() {
        // 25-hour fall-back day: no padding needed past 48.
        let tiled = repeat_today_if_needed(vec![0.1; 50]);
        assert_eq!(tiled.len(), 50);
        assert_eq!(slice_from_hour(tiled, 3, 48).len(), 48);
    }

    #[tokio::test]
    async fn fallback_prices_until_first_success() {
        let provider = provider_with(PriceConfig {
            source: PriceSource::Fixed24h,
            fixed_24h_array: Vec::new(), // misconfigured on purpose
            ..PriceConfig::default()
        });
        provider.refresh().await;
        let set = provider.current().await;
        assert_eq!(set.total, vec![0.0001; HORIZON_HOURS]);
        assert_eq!(provider.last_error().await.unwrap().kind, "missing_field");
    }

    #[tokio::test]
    async fn fixed_prices_tile_and_rotate() {
        let provider = provider_with(PriceConfig {
            source: PriceSource::Fixed24h,
            fixed_24h_array: (0..24).map(|h| h as f64).collect(),
            ..PriceConfig::default()
        });
        provider.refresh().await;
        let set = provider.current().await;
        assert_eq!(set.total.len(), HORIZON_HOURS);
        let hour = Clock::new(chrono_tz::Europe::Berlin).current_hour();
        assert_eq!(set.total[0], round_price(hour as f64 / 1000.0));
    }

    proptest! {
        #[test]
        fn slice_preserves_horizon_for_any_start(
            len in 24usize..96,
            hour in 0usize..24,
        ) {
            let prices: Vec<f64> = (0..len).map(|i| i as f64).collect();
            prop_assert_eq!(slice_from_hour(prices, hour, 48).len(), 48);
        }
    }
}
