//! Optimization scheduler.
//!
//! One worker owns the periodic tick: refresh prices, snapshot the other
//! providers, build and post the EOS request, persist the request/response
//! pair and hand the current-hour plan to control. Everything inside a tick
//! is strictly ordered; failures skip the application step and wait for the
//! next tick.

use chrono::Timelike;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::control::Controller;
use crate::eos::{EosClient, RequestInputs};
use crate::providers::battery::BatteryProvider;
use crate::providers::load::LoadProvider;
use crate::providers::price::PriceProvider;
use crate::providers::pv::PvProvider;
use crate::providers::SnapshotCell;

pub const REQUEST_FILE_NAME: &str = "optimize_request.json";
pub const RESPONSE_FILE_NAME: &str = "optimize_response.json";

/// Facade view of the scheduler lifecycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerState {
    pub request_state: Option<String>,
    pub last_request_timestamp: Option<String>,
    pub last_response_timestamp: Option<String>,
    pub next_run: Option<String>,
}

pub struct OptimizationScheduler {
    clock: Clock,
    period: Duration,
    data_dir: PathBuf,
    price: Arc<PriceProvider>,
    pv: Arc<PvProvider>,
    load: Arc<LoadProvider>,
    battery: Arc<BatteryProvider>,
    eos: Arc<EosClient>,
    controller: Arc<Controller>,
    last_request: SnapshotCell<String>,
    last_response: SnapshotCell<String>,
    state: SnapshotCell<SchedulerState>,
}

impl OptimizationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Clock,
        refresh_time_minutes: u64,
        data_dir: PathBuf,
        price: Arc<PriceProvider>,
        pv: Arc<PvProvider>,
        load: Arc<LoadProvider>,
        battery: Arc<BatteryProvider>,
        eos: Arc<EosClient>,
        controller: Arc<Controller>,
    ) -> Self {
        let pending_request = serde_json::json!({
            "status": "Awaiting first optimization run",
        });
        let pending_response = serde_json::json!({
            "status": "starting up",
            "message": "The first request has been sent to EOS and is now waiting \
                        for the completion of the first optimization run.",
        });
        Self {
            clock,
            period: Duration::from_secs(refresh_time_minutes * 60),
            data_dir,
            price,
            pv,
            load,
            battery,
            eos,
            controller,
            last_request: SnapshotCell::new(pretty(&pending_request)),
            last_response: SnapshotCell::new(pretty(&pending_response)),
            state: SnapshotCell::new(SchedulerState::default()),
        }
    }

    pub async fn last_request_json(&self) -> String {
        self.last_request.get().await
    }

    pub async fn last_response_json(&self) -> String {
        self.last_response.get().await
    }

    pub async fn state(&self) -> SchedulerState {
        self.state.get().await
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        loop {
            let tick_start = self.clock.now();
            info!("starting optimization run");
            self.run_optimization().await;

            // Next tick is anchored to the start of this one, truncated to
            // the whole second, so the cadence does not drift with run time.
            let next_eval = tick_start
                .with_nanosecond(0)
                .unwrap_or(tick_start)
                + chrono::Duration::from_std(self.period).unwrap_or_default();
            {
                let mut state = self.state.get().await;
                state.next_run = Some(next_eval.to_rfc3339());
                self.state.set(state).await;
            }
            let sleep = (next_eval - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            info!(
                next_run = %next_eval.format("%H:%M:%S"),
                sleep_s = sleep.as_secs(),
                "optimization run finished"
            );
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {},
                _ = token.cancelled() => break,
            }
        }
    }

    async fn run_optimization(&self) {
        // Prices are tied to the optimization run.
        self.price.refresh().await;

        let battery = self.battery.current().await;
        let inputs = RequestInputs {
            pv_forecast_wh: self.pv.current_pv().await,
            prices: self.price.current().await,
            load_wh: self.load.load_profile().await,
            temperature_c: self.pv.current_temperature().await,
            battery_soc_percent: battery.soc_percent,
        };
        let request = self.eos.build_request(inputs).await;

        let mut request_json = match serde_json::to_value(&request) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "failed to serialize optimize request");
                return;
            }
        };
        self.persist(REQUEST_FILE_NAME, &request_json).await;
        {
            let mut state = self.state.get().await;
            state.request_state = Some("request send".to_string());
            state.last_request_timestamp = Some(self.clock.now_iso());
            self.state.set(state).await;
        }

        match self.eos.optimize(&request).await {
            Ok((mut raw, typed)) => {
                stamp(&mut request_json, &self.clock);
                self.last_request.set(pretty(&request_json)).await;
                stamp(&mut raw, &self.clock);
                self.last_response.set(pretty(&raw)).await;
                self.persist(RESPONSE_FILE_NAME, &raw).await;
                {
                    let mut state = self.state.get().await;
                    state.request_state = Some("response received".to_string());
                    state.last_response_timestamp = Some(self.clock.now_iso());
                    self.state.set(state).await;
                }

                match self.eos.examine(&typed).await {
                    Ok(plan) => {
                        self.controller.apply_plan(plan, battery).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "skipping response application");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "optimization request failed");
                stamp(&mut request_json, &self.clock);
                self.last_request.set(pretty(&request_json)).await;
                let failure = serde_json::json!({
                    "error": e.to_string(),
                    "timestamp": self.clock.now_iso(),
                });
                self.last_response.set(pretty(&failure)).await;
                let mut state = self.state.get().await;
                state.request_state = Some("request failed".to_string());
                self.state.set(state).await;
            }
        }
    }

    async fn persist(&self, file_name: &str, value: &Value) {
        let path = self.data_dir.join(file_name);
        if let Err(e) = tokio::fs::write(&path, pretty(value)).await {
            warn!(path = %path.display(), error = %e, "failed to persist JSON state file");
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn stamp(value: &mut Value, clock: &Clock) {
    if let Some(object) = value.as_object_mut() {
        object.insert("timestamp".to_string(), Value::String(clock.now_iso()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AppConfig, BatterySource, EosConfig, LoadConfig, PriceConfig, PriceSource,
        PvForecastSource,
    };
    use crate::inverter::LogOnlyInverter;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn scheduler_against(server: &MockServer, dir: &std::path::Path) -> Arc<OptimizationScheduler> {
        let clock = Clock::new(chrono_tz::Europe::Berlin);
        let config = AppConfig::default();
        let uri = server.uri();
        let address = uri.trim_start_matches("http://");
        let (host, port) = address.split_once(':').unwrap();

        let (events_tx, _events_rx) = mpsc::channel(8);
        let price = Arc::new(
            PriceProvider::new(
                PriceConfig {
                    source: PriceSource::Fixed24h,
                    fixed_24h_array: vec![100.0; 24],
                    ..PriceConfig::default()
                },
                clock,
            )
            .unwrap(),
        );
        let pv = Arc::new(
            PvProvider::new(
                PvForecastSource::Default,
                String::new(),
                String::new(),
                config.pv_forecast.clone(),
                clock,
            )
            .unwrap(),
        );
        let load = Arc::new(LoadProvider::new(LoadConfig::default(), clock).unwrap());
        let battery = Arc::new(
            BatteryProvider::new(
                crate::config::BatteryConfig {
                    source: BatterySource::Default,
                    ..config.battery.clone()
                },
                events_tx,
            )
            .unwrap(),
        );
        let eos = Arc::new(
            EosClient::new(
                &EosConfig {
                    server: host.to_string(),
                    port: port.parse().unwrap(),
                    timeout: 5,
                },
                config.battery.clone(),
                config.inverter.max_pv_charge_rate,
                clock,
            )
            .unwrap(),
        );
        let controller = Arc::new(Controller::new(
            &config.battery,
            Arc::new(LogOnlyInverter) as Arc<dyn crate::inverter::InverterDriver>,
        ));
        Arc::new(OptimizationScheduler::new(
            clock,
            3,
            dir.to_path_buf(),
            price,
            pv,
            load,
            battery,
            eos,
            controller,
        ))
    }

    #[tokio::test]
    async fn successful_run_persists_request_and_response() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path("/v1/health"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/optimize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ac_charge": vec![0.0; 48],
                "dc_charge": vec![0.0; 48],
                "discharge_allowed": vec![1; 48],
                "start_solution": [1, 2, 3]
            })))
            .mount(&server)
            .await;

        let scheduler = scheduler_against(&server, dir.path()).await;
        scheduler.run_optimization().await;

        assert!(dir.path().join(REQUEST_FILE_NAME).exists());
        assert!(dir.path().join(RESPONSE_FILE_NAME).exists());

        let state = scheduler.state().await;
        assert_eq!(state.request_state.as_deref(), Some("response received"));
        assert!(state.last_response_timestamp.is_some());

        let response = scheduler.last_response_json().await;
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["start_solution"], serde_json::json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn eos_outage_is_survived_and_reported() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path("/v1/health"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/optimize"))
            .respond_with(ResponseTemplate::new(504))
            .mount(&server)
            .await;

        let scheduler = scheduler_against(&server, dir.path()).await;
        for _ in 0..3 {
            scheduler.run_optimization().await;
        }

        let state = scheduler.state().await;
        assert_eq!(state.request_state.as_deref(), Some("request failed"));
        let response = scheduler.last_response_json().await;
        assert!(response.contains("error"));
        // No response file is written for failed runs.
        assert!(!dir.path().join(RESPONSE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn invalid_response_skips_application() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path("/v1/health"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/optimize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ac_charge": vec![1.0; 48],
                "start_solution": []
            })))
            .mount(&server)
            .await;

        let scheduler = scheduler_against(&server, dir.path()).await;
        scheduler.run_optimization().await;

        // Response persisted for inspection, but control remains untouched.
        assert!(dir.path().join(RESPONSE_FILE_NAME).exists());
        let status = scheduler.controller.status();
        assert_eq!(status.inverter_mode_num, -1);
    }
}
