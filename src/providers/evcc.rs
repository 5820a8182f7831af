//! EVCC loadpoint provider.
//!
//! Polls `/api/state` every 10 seconds. A transition of the `charging` flag
//! fires exactly one control event; mode changes alone only update the
//! published snapshot, control picks them up on its next evaluation.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::control::ControlEvent;
use crate::domain::{EvChargeMode, EvState};
use crate::httpx::{self, FetchError};
use crate::providers::{ProviderError, SnapshotCell};

const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

pub struct EvccProvider {
    url: String,
    client: reqwest::Client,
    snapshot: SnapshotCell<EvState>,
    last_error: SnapshotCell<Option<ProviderError>>,
    events: mpsc::Sender<ControlEvent>,
}

impl EvccProvider {
    pub fn new(url: String, events: mpsc::Sender<ControlEvent>) -> anyhow::Result<Self> {
        Ok(Self {
            url,
            client: httpx::client(Duration::from_secs(6))?,
            snapshot: SnapshotCell::new(EvState::default()),
            last_error: SnapshotCell::new(None),
            events,
        })
    }

    pub async fn current(&self) -> EvState {
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
        match self.fetch_state().await {
            Ok(state) => {
                let previous = self.snapshot.get().await;
                self.snapshot.set(state).await;
                self.last_error.set(None).await;
                if state.charging != previous.charging {
                    info!(
                        charging = state.charging,
                        mode = %state.mode,
                        "EV charging state changed"
                    );
                    let _ = self.events.send(ControlEvent::EvEdge(state)).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "EVCC state fetch failed, keeping last known state");
                self.last_error
                    .set(Some(ProviderError::from_fetch("evcc", "evcc.url", &err)))
                    .await;
            }
        }
    }

    async fn fetch_state(&self) -> Result<EvState, FetchError> {
        let url = format!("{}/api/state", self.url.trim_end_matches('/'));
        let payload: EvccState = httpx::get_json(&self.client, &url).await?;
        let loadpoint = payload
            .result
            .loadpoints
            .into_iter()
            .next()
            .ok_or(FetchError::MissingField("result.loadpoints[0]"))?;
        let charging = loadpoint
            .charging
            .ok_or(FetchError::MissingField("loadpoints[0].charging"))?;
        // The loadpoint mode wins; vehicle entries only carry a configured
        // default mode.
        let mode = loadpoint
            .mode
            .or_else(|| {
                payload
                    .result
                    .vehicles
                    .into_values()
                    .find_map(|vehicle| vehicle.mode)
            })
            .map(|raw| EvChargeMode::from_wire(&raw))
            .unwrap_or(EvChargeMode::Unknown);
        Ok(EvState { charging, mode })
    }
}

#[derive(Debug, Deserialize)]
struct EvccState {
    result: EvccResult,
}

#[derive(Debug, Deserialize)]
struct EvccResult {
    #[serde(default)]
    loadpoints: Vec<EvccLoadpoint>,
    #[serde(default)]
    vehicles: BTreeMap<String, EvccVehicle>,
}

#[derive(Debug, Deserialize)]
struct EvccLoadpoint {
    charging: Option<bool>,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EvccVehicle {
    mode: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(url: String) -> (std::sync::Arc<EvccProvider>, mpsc::Receiver<ControlEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (std::sync::Arc::new(EvccProvider::new(url, tx).unwrap()), rx)
    }

    async fn mock_state(server: &MockServer, body: serde_json::Value) {
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/api/state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn extracts_charging_and_mode() {
        let server = MockServer::start().await;
        mock_state(
            &server,
            serde_json::json!({
                "result": {
                    "loadpoints": [{"charging": true, "mode": "pv+now"}],
                    "vehicles": {}
                }
            }),
        )
        .await;

        let (provider, _rx) = provider(server.uri());
        let state = provider.fetch_state().await.unwrap();
        assert!(state.charging);
        assert_eq!(state.mode, EvChargeMode::PvNow);
    }

    #[tokio::test]
    async fn vehicle_mode_is_fallback_only() {
        let server = MockServer::start().await;
        mock_state(
            &server,
            serde_json::json!({
                "result": {
                    "loadpoints": [{"charging": false}],
                    "vehicles": {"ev1": {"mode": "minpv"}}
                }
            }),
        )
        .await;

        let (provider, _rx) = provider(server.uri());
        let state = provider.fetch_state().await.unwrap();
        assert_eq!(state.mode, EvChargeMode::MinPv);
    }

    #[tokio::test]
    async fn missing_charging_flag_is_typed_error() {
        let server = MockServer::start().await;
        mock_state(
            &server,
            serde_json::json!({"result": {"loadpoints": [{"mode": "pv"}], "vehicles": {}}}),
        )
        .await;

        let (provider, _rx) = provider(server.uri());
        assert!(matches!(
            provider.fetch_state().await,
            Err(FetchError::MissingField("loadpoints[0].charging"))
        ));
    }

    #[tokio::test]
    async fn charging_edge_fires_exactly_one_event() {
        let server = MockServer::start().await;
        mock_state(
            &server,
            serde_json::json!({
                "result": {"loadpoints": [{"charging": true, "mode": "now"}], "vehicles": {}}
            }),
        )
        .await;

        let (provider, mut rx) = provider(server.uri());
        provider.refresh().await;
        match rx.try_recv().unwrap() {
            ControlEvent::EvEdge(state) => assert!(state.charging),
            other => panic!("unexpected event {other:?}"),
        }

        // Same state again: no further event.
        provider.refresh().await;
        assert!(rx.try_recv().is_err());

        // Falling edge fires again.
        mock_state(
            &server,
            serde_json::json!({
                "result": {"loadpoints": [{"charging": false, "mode": "now"}], "vehicles": {}}
            }),
        )
        .await;
        provider.refresh().await;
        match rx.try_recv().unwrap() {
            ControlEvent::EvEdge(state) => assert!(!state.charging),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_failure_keeps_last_state() {
        let server = MockServer::start().await;
        mock_state(
            &server,
            serde_json::json!({
                "result": {"loadpoints": [{"charging": true, "mode": "pv"}], "vehicles": {}}
            }),
        )
        .await;
        let (provider, mut rx) = provider(server.uri());
        provider.refresh().await;
        let _ = rx.try_recv();

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        provider.refresh().await;
        assert!(provider.current().await.charging);
        assert!(provider.last_error().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
