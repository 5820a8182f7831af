//! Battery state-of-charge provider.
//!
//! Polls the configured smart-home backend every 30 seconds and publishes a
//! [`BatterySnapshot`]. Control is notified through the event channel so an
//! active grid-charge setpoint can be re-clamped as soon as the SoC-dependent
//! charge limit moves.

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{BatteryConfig, BatterySource};
use crate::control::ControlEvent;
use crate::domain::BatterySnapshot;
use crate::httpx::{self, FetchError};
use crate::providers::{ProviderError, SnapshotCell};

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// SoC assumed until the first successful reading, and forever for the
/// `default` source. Pessimistic on purpose.
const DEFAULT_SOC_PERCENT: f64 = 5.0;

pub struct BatteryProvider {
    config: BatteryConfig,
    client: reqwest::Client,
    snapshot: SnapshotCell<BatterySnapshot>,
    last_error: SnapshotCell<Option<ProviderError>>,
    events: mpsc::Sender<ControlEvent>,
}

impl BatteryProvider {
    pub fn new(
        config: BatteryConfig,
        events: mpsc::Sender<ControlEvent>,
    ) -> anyhow::Result<Self> {
        let initial = BatterySnapshot::from_soc(DEFAULT_SOC_PERCENT, &config);
        Ok(Self {
            client: httpx::client(Duration::from_secs(6))?,
            snapshot: SnapshotCell::new(initial),
            last_error: SnapshotCell::new(None),
            events,
            config,
        })
    }

    pub async fn current(&self) -> BatterySnapshot {
        self.snapshot.get().await
    }

    pub async fn last_error(&self) -> Option<ProviderError> {
        self.last_error.get().await
    }

    pub async fn run(self: std::sync::Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
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
        match self.fetch_soc().await {
            Ok(soc) => {
                let previous = self.snapshot.get().await;
                let snapshot = BatterySnapshot::from_soc(soc, &self.config);
                self.snapshot.set(snapshot).await;
                self.last_error.set(None).await;
                if snapshot != previous {
                    debug!(
                        soc = snapshot.soc_percent,
                        dynamic_max_charge_w = snapshot.dynamic_max_charge_w,
                        "battery snapshot updated"
                    );
                    let _ = self.events.send(ControlEvent::BatteryUpdated(snapshot)).await;
                }
            }
            Err(err) => {
                warn!(
                    source = ?self.config.source,
                    error = %err,
                    "battery SoC fetch failed, keeping last known value"
                );
                self.last_error
                    .set(Some(ProviderError::from_fetch(
                        "battery",
                        "battery.source",
                        &err,
                    )))
                    .await;
            }
        }
    }

    async fn fetch_soc(&self) -> Result<f64, FetchError> {
        match self.config.source {
            BatterySource::Default => Ok(DEFAULT_SOC_PERCENT),
            BatterySource::Openhab => self.fetch_soc_from_openhab().await,
            BatterySource::Homeassistant => self.fetch_soc_from_homeassistant().await,
        }
    }

    async fn fetch_soc_from_openhab(&self) -> Result<f64, FetchError> {
        let url = format!(
            "{}/rest/items/{}",
            self.config.url.trim_end_matches('/'),
            self.config.soc_sensor
        );
        let payload: OpenhabItem = httpx::get_json(&self.client, &url).await?;
        let raw = payload
            .state
            .parse::<f64>()
            .map_err(|_| FetchError::Decode(format!("SoC state '{}' is not numeric", payload.state)))?;
        // Items are exposed either as a 0..1 fraction or as percent.
        let soc = if raw <= 1.0 { raw * 100.0 } else { raw };
        Ok(soc.round())
    }

    async fn fetch_soc_from_homeassistant(&self) -> Result<f64, FetchError> {
        let url = format!(
            "{}/api/states/{}",
            self.config.url.trim_end_matches('/'),
            self.config.soc_sensor
        );
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", self.config.access_token))
                .map_err(|_| FetchError::Decode("battery.access_token is not a valid header".into()))?,
        );
        let payload: HaState = httpx::get_json_with_headers(&self.client, &url, headers).await?;
        let soc = payload
            .state
            .parse::<f64>()
            .map_err(|_| FetchError::Decode(format!("SoC state '{}' is not numeric", payload.state)))?;
        Ok(soc.round())
    }
}

#[derive(Debug, Deserialize)]
struct OpenhabItem {
    state: String,
}

#[derive(Debug, Deserialize)]
struct HaState {
    state: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(source: BatterySource, url: String) -> BatteryConfig {
        BatteryConfig {
            source,
            url,
            soc_sensor: "BatterySoc".to_string(),
            access_token: "token".to_string(),
            ..BatteryConfig::default()
        }
    }

    fn provider(config: BatteryConfig) -> (BatteryProvider, mpsc::Receiver<ControlEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (BatteryProvider::new(config, tx).unwrap(), rx)
    }

    #[tokio::test]
    async fn default_source_reports_five_percent() {
        let (provider, _rx) = provider(config(BatterySource::Default, String::new()));
        assert_eq!(provider.fetch_soc().await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn openhab_fraction_encoding_is_scaled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/items/BatterySoc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "0.55"})),
            )
            .mount(&server)
            .await;

        let (provider, _rx) = provider(config(BatterySource::Openhab, server.uri()));
        assert_eq!(provider.fetch_soc().await.unwrap(), 55.0);
    }

    #[tokio::test]
    async fn openhab_percent_encoding_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/items/BatterySoc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "72.4"})),
            )
            .mount(&server)
            .await;

        let (provider, _rx) = provider(config(BatterySource::Openhab, server.uri()));
        assert_eq!(provider.fetch_soc().await.unwrap(), 72.0);
    }

    #[tokio::test]
    async fn homeassistant_uses_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states/BatterySoc"))
            .and(header("Authorization", "Bearer token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "48"})),
            )
            .mount(&server)
            .await;

        let (provider, _rx) = provider(config(BatterySource::Homeassistant, server.uri()));
        assert_eq!(provider.fetch_soc().await.unwrap(), 48.0);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_last_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (provider, mut rx) = provider(config(BatterySource::Openhab, server.uri()));
        let before = provider.current().await;
        provider.refresh().await;
        assert_eq!(provider.current().await, before);
        assert!(provider.last_error().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn soc_change_notifies_control() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/items/BatterySoc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "80"})),
            )
            .mount(&server)
            .await;

        let (provider, mut rx) = provider(config(BatterySource::Openhab, server.uri()));
        provider.refresh().await;
        match rx.try_recv().unwrap() {
            ControlEvent::BatteryUpdated(snapshot) => {
                assert_eq!(snapshot.soc_percent, 80.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Unchanged reading, no second notification.
        provider.refresh().await;
        assert!(rx.try_recv().is_err());
    }
}
