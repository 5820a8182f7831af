//! Fronius GEN24 driver.
//!
//! Battery modes are realized as time-of-use rule sets written to
//! `config/timeofuse`. Firmware 1.36.5-1+ serves the endpoint under `/api/`,
//! older builds under `/`; the base is probed once and cached. Every write is
//! confirmed through the `writeSuccess` list. The rule set found before the
//! first write is backed up to disk and restored at shutdown.

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::InverterConfig;
use crate::inverter::digest::{
    authorization_header, challenge_from_headers, parse_challenge, random_cnonce,
};
use crate::inverter::{DriverError, InverterDriver, ScheduleType, TimeOfUseRule};

const TIMEOFUSE_ENDPOINT: &str = "/config/timeofuse";
/// Hard firmware limit for grid charging, independent of configuration.
const GRID_CHARGE_CAP_W: f64 = 10000.0;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const BACKUP_FILE_NAME: &str = "battery_config_v2.json";

pub struct FroniusGen24 {
    address: String,
    user: String,
    password: String,
    max_grid_charge_rate: f64,
    max_pv_charge_rate: f64,
    client: reqwest::Client,
    api_base: RwLock<Option<&'static str>>,
    /// Set to `MD5` once the fallback succeeded, so later requests skip the
    /// doomed SHA-256 cycle.
    forced_algorithm: RwLock<Option<String>>,
    backup_path: PathBuf,
    backup_done: Mutex<bool>,
}

impl FroniusGen24 {
    pub fn new(config: &InverterConfig, data_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            address: config.address.clone(),
            // The web UI account name is case-insensitive on screen but the
            // digest hash is not; firmware expects it lowercased.
            user: config.user.to_lowercase(),
            password: config.password.clone(),
            max_grid_charge_rate: config.max_grid_charge_rate,
            max_pv_charge_rate: config.max_pv_charge_rate,
            client: crate::httpx::client(Duration::from_secs(10))?,
            api_base: RwLock::new(None),
            forced_algorithm: RwLock::new(None),
            backup_path: data_dir.join(BACKUP_FILE_NAME),
            backup_done: Mutex::new(false),
        })
    }

    /// Probes which base path this firmware serves. A 401 means the endpoint
    /// exists and only wants credentials.
    async fn api_base(&self) -> &'static str {
        if let Some(base) = *self.api_base.read().await {
            return base;
        }
        let mut detected = None;
        for base in ["/api", ""] {
            let url = format!("http://{}{base}{TIMEOFUSE_ENDPOINT}", self.address);
            match self.client.get(&url).send().await {
                Ok(response)
                    if response.status() == StatusCode::UNAUTHORIZED
                        || response.status().is_success() =>
                {
                    info!(base, "detected inverter API base");
                    detected = Some(base);
                    break;
                }
                Ok(response) => {
                    debug!(base, status = %response.status(), "API base probe rejected");
                }
                Err(e) => {
                    debug!(base, error = %e, "API base probe failed");
                }
            }
        }
        let base = detected.unwrap_or_else(|| {
            warn!("could not detect inverter API base, defaulting to /api");
            "/api"
        });
        *self.api_base.write().await = Some(base);
        base
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        authorization: Option<&str>,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, DriverError> {
        let mut request = self.client.request(method.clone(), url);
        if let Some(auth) = authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// One unauthenticated probe plus up to two challenge/response cycles:
    /// the advertised algorithm first, then an MD5 retry for passwords set
    /// before the firmware switched to SHA-256. 404 responses are handed back
    /// untouched.
    async fn exchange(
        &self,
        method: &Method,
        url: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, DriverError> {
        let response = self.send(method, url, None, body).await?;
        match response.status() {
            status if status.is_success() => return Ok(response),
            StatusCode::NOT_FOUND => return Ok(response),
            StatusCode::UNAUTHORIZED => {}
            status => return Err(DriverError::Http(status)),
        }

        let header = challenge_from_headers(response.headers())
            .ok_or_else(|| DriverError::Auth("no digest challenge in 401 response".to_string()))?;
        let mut challenge = parse_challenge(header)
            .ok_or_else(|| DriverError::Auth(format!("unparseable digest challenge '{header}'")))?;
        if let Some(forced) = self.forced_algorithm.read().await.clone() {
            challenge.algorithm = forced;
        }
        let advertised_sha = matches!(challenge.algorithm.as_str(), "SHA-256" | "SHA256");

        let auth = authorization_header(
            &self.user,
            &self.password,
            method.as_str(),
            path,
            &challenge,
            &random_cnonce(),
        );
        let response = self.send(method, url, Some(&auth), body).await?;
        match response.status() {
            status if status.is_success() => {
                debug!(algorithm = %challenge.algorithm, "digest authentication succeeded");
                return Ok(response);
            }
            StatusCode::NOT_FOUND => return Ok(response),
            StatusCode::UNAUTHORIZED if advertised_sha => {}
            StatusCode::UNAUTHORIZED => return Err(self.credentials_error()),
            status => return Err(DriverError::Http(status)),
        }

        // Second 401 on a SHA challenge: the password may predate the
        // SHA-256 firmware. One MD5 retry with the fresh nonce.
        info!("SHA-256 digest rejected, retrying once with MD5");
        let mut md5_challenge = challenge_from_headers(response.headers())
            .and_then(parse_challenge)
            .unwrap_or(challenge);
        md5_challenge.algorithm = "MD5".to_string();
        let auth = authorization_header(
            &self.user,
            &self.password,
            method.as_str(),
            path,
            &md5_challenge,
            &random_cnonce(),
        );
        let response = self.send(method, url, Some(&auth), body).await?;
        match response.status() {
            status if status.is_success() => {
                info!("MD5 fallback authentication succeeded");
                *self.forced_algorithm.write().await = Some("MD5".to_string());
                Ok(response)
            }
            StatusCode::NOT_FOUND => Ok(response),
            StatusCode::UNAUTHORIZED => Err(self.credentials_error()),
            status => Err(DriverError::Http(status)),
        }
    }

    fn credentials_error(&self) -> DriverError {
        DriverError::Auth(format!(
            "invalid credentials for user '{}'. If the inverter firmware was recently \
             updated, reset the password in the web UI (http://{}/) under \
             Settings -> User Management and update the configuration",
            self.user, self.address
        ))
    }

    async fn request(
        &self,
        method: Method,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, DriverError> {
        let base = self.api_base().await;
        let path = format!("{base}{TIMEOFUSE_ENDPOINT}");
        let url = format!("http://{}{path}", self.address);

        let mut last_error = DriverError::Network("no attempt made".to_string());
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            match self.exchange(&method, &url, &path, body).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "inverter request failed");
                    last_error = err;
                }
            }
        }
        error!(attempts = MAX_ATTEMPTS, "all inverter request attempts failed");
        Err(last_error)
    }

    async fn read_time_of_use(&self) -> Result<Vec<TimeOfUseRule>, DriverError> {
        let response = self.request(Method::GET, None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DriverError::Http(status));
        }
        let payload: TimeOfUseConfig = response
            .json()
            .await
            .map_err(|e| DriverError::Decode(e.to_string()))?;
        Ok(payload.timeofuse)
    }

    async fn write_time_of_use(&self, rules: &[TimeOfUseRule]) -> Result<(), DriverError> {
        let body = serde_json::json!({ "timeofuse": rules });
        let response = self.request(Method::POST, Some(&body)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DriverError::Http(status));
        }
        let confirmation: WriteConfirmation = response
            .json()
            .await
            .map_err(|e| DriverError::Decode(e.to_string()))?;
        if !confirmation.write_success.iter().any(|key| key == "timeofuse") {
            return Err(DriverError::Unconfirmed("timeofuse".to_string()));
        }
        debug!(rules = rules.len(), "time-of-use rule set written");
        Ok(())
    }

    /// Captures the pre-existing rule set before the first write so shutdown
    /// can hand the inverter back unchanged. A failed capture is retried on
    /// the next mutating call.
    async fn ensure_backup(&self) {
        let mut done = self.backup_done.lock().await;
        if *done {
            return;
        }
        match self.read_time_of_use().await {
            Ok(rules) => match serde_json::to_string_pretty(&rules) {
                Ok(json) => match tokio::fs::write(&self.backup_path, json).await {
                    Ok(()) => {
                        info!(path = %self.backup_path.display(), "inverter rule set backed up");
                        *done = true;
                    }
                    Err(e) => warn!(error = %e, "failed to write rule set backup"),
                },
                Err(e) => warn!(error = %e, "failed to serialize rule set backup"),
            },
            Err(e) => warn!(error = %e, "failed to read rule set for backup"),
        }
    }

    fn force_charge_rules(&self, power_w: f64) -> Vec<TimeOfUseRule> {
        let capped = power_w.min(self.max_grid_charge_rate).min(GRID_CHARGE_CAP_W);
        if capped < power_w {
            warn!(requested = power_w, applied = capped, "grid charge power capped");
        }
        vec![TimeOfUseRule::all_day(
            ScheduleType::ChargeMin,
            capped.max(0.0).round() as u32,
        )]
    }

    fn avoid_discharge_rules(&self) -> Vec<TimeOfUseRule> {
        let mut rules = vec![TimeOfUseRule::all_day(ScheduleType::DischargeMax, 0)];
        if self.max_pv_charge_rate > 0.0 {
            rules.push(TimeOfUseRule::all_day(
                ScheduleType::ChargeMax,
                self.max_pv_charge_rate.round() as u32,
            ));
        }
        rules
    }

    fn allow_discharge_rules(&self) -> Vec<TimeOfUseRule> {
        if self.max_pv_charge_rate > 0.0 {
            vec![TimeOfUseRule::all_day(
                ScheduleType::ChargeMax,
                self.max_pv_charge_rate.round() as u32,
            )]
        } else {
            Vec::new()
        }
    }

    #[cfg(test)]
    async fn mark_backup_done(&self) {
        *self.backup_done.lock().await = true;
    }
}

#[async_trait::async_trait]
impl InverterDriver for FroniusGen24 {
    async fn set_force_charge(&self, power_w: f64) -> Result<(), DriverError> {
        info!(power_w, "setting force charge mode");
        self.ensure_backup().await;
        self.write_time_of_use(&self.force_charge_rules(power_w)).await
    }

    async fn set_avoid_discharge(&self) -> Result<(), DriverError> {
        info!("setting avoid discharge mode");
        self.ensure_backup().await;
        self.write_time_of_use(&self.avoid_discharge_rules()).await
    }

    async fn set_allow_discharge(&self) -> Result<(), DriverError> {
        info!("setting allow discharge mode");
        self.ensure_backup().await;
        self.write_time_of_use(&self.allow_discharge_rules()).await
    }

    async fn restore_baseline(&self) -> Result<(), DriverError> {
        if !self.backup_path.exists() {
            debug!("no rule set backup to restore");
            return Ok(());
        }
        let raw = tokio::fs::read_to_string(&self.backup_path)
            .await
            .map_err(|e| DriverError::Io(e.to_string()))?;
        let rules: Vec<TimeOfUseRule> =
            serde_json::from_str(&raw).map_err(|e| DriverError::Decode(e.to_string()))?;
        self.write_time_of_use(&rules).await?;
        if let Err(e) = tokio::fs::remove_file(&self.backup_path).await {
            warn!(error = %e, "could not remove rule set backup after restore");
        } else {
            info!("inverter rule set restored from backup");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TimeOfUseConfig {
    #[serde(default)]
    timeofuse: Vec<TimeOfUseRule>,
}

#[derive(Debug, Deserialize)]
struct WriteConfirmation {
    #[serde(rename = "writeSuccess", default)]
    write_success: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    struct NoAuthHeader;

    impl Match for NoAuthHeader {
        fn matches(&self, request: &Request) -> bool {
            !request.headers.contains_key("authorization")
        }
    }

    struct AuthContains(&'static str);

    impl Match for AuthContains {
        fn matches(&self, request: &Request) -> bool {
            request
                .headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.contains(self.0))
        }
    }

    fn driver_for(server: &MockServer, dir: &Path) -> FroniusGen24 {
        let address = server.uri().trim_start_matches("http://").to_string();
        let config = InverterConfig {
            address,
            user: "Customer".to_string(),
            password: "secret".to_string(),
            max_grid_charge_rate: 5000.0,
            max_pv_charge_rate: 4000.0,
            ..InverterConfig::default()
        };
        FroniusGen24::new(&config, dir).unwrap()
    }

    fn challenge(algorithm: &str) -> ResponseTemplate {
        ResponseTemplate::new(401).insert_header(
            "X-Www-Authenticate",
            format!(
                "Digest realm=\"Webinterface area\", nonce=\"abc123\", qop=\"auth\", algorithm={algorithm}"
            )
            .as_str(),
        )
    }

    fn write_ok() -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_json(serde_json::json!({"writeSuccess": ["timeofuse"]}))
    }

    #[tokio::test]
    async fn digest_exchange_echoes_nonstandard_sha256_token() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/api/config/timeofuse"))
            .and(NoAuthHeader)
            .respond_with(challenge("SHA256"))
            .mount(&server)
            .await;
        // Unauthenticated base-path probe.
        Mock::given(method("GET"))
            .and(path("/api/config/timeofuse"))
            .and(NoAuthHeader)
            .respond_with(challenge("SHA256"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/config/timeofuse"))
            .and(AuthContains("algorithm=\"SHA256\""))
            .respond_with(write_ok())
            .expect(1)
            .mount(&server)
            .await;

        let driver = driver_for(&server, dir.path());
        driver.mark_backup_done().await;
        driver.set_avoid_discharge().await.unwrap();
    }

    #[tokio::test]
    async fn md5_fallback_after_second_challenge() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(path("/api/config/timeofuse"))
            .and(NoAuthHeader)
            .respond_with(challenge("SHA256"))
            .mount(&server)
            .await;
        // First authenticated attempt still rejected, fresh challenge attached.
        Mock::given(method("POST"))
            .and(path("/api/config/timeofuse"))
            .and(AuthContains("algorithm=\"SHA256\""))
            .respond_with(challenge("SHA256"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/config/timeofuse"))
            .and(AuthContains("algorithm=\"MD5\""))
            .respond_with(write_ok())
            .expect(1)
            .mount(&server)
            .await;

        let driver = driver_for(&server, dir.path());
        driver.mark_backup_done().await;
        driver.set_allow_discharge().await.unwrap();

        // The fallback outcome is remembered for later requests.
        assert_eq!(
            driver.forced_algorithm.read().await.as_deref(),
            Some("MD5")
        );
    }

    #[tokio::test]
    async fn unconfirmed_write_is_an_error() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(path("/api/config/timeofuse"))
            .and(NoAuthHeader)
            .respond_with(challenge("MD5"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(AuthContains("algorithm=\"MD5\""))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"writeSuccess": []})),
            )
            .mount(&server)
            .await;

        let driver = driver_for(&server, dir.path());
        driver.mark_backup_done().await;
        let result = driver.set_avoid_discharge().await;
        assert!(matches!(result, Err(DriverError::Unconfirmed(_))));
    }

    #[tokio::test]
    async fn force_charge_power_is_capped_by_grid_rate() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let expected_rule = TimeOfUseRule::all_day(ScheduleType::ChargeMin, 5000);
        Mock::given(path("/api/config/timeofuse"))
            .and(NoAuthHeader)
            .respond_with(challenge("MD5"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(AuthContains("algorithm=\"MD5\""))
            .and(body_json(serde_json::json!({"timeofuse": [expected_rule]})))
            .respond_with(write_ok())
            .expect(1)
            .mount(&server)
            .await;

        let driver = driver_for(&server, dir.path());
        driver.mark_backup_done().await;
        driver.set_force_charge(8000.0).await.unwrap();
    }

    #[tokio::test]
    async fn backup_is_captured_once_and_restored_on_shutdown() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let baseline = vec![TimeOfUseRule::all_day(ScheduleType::ChargeMax, 1234)];
        Mock::given(path("/api/config/timeofuse"))
            .and(NoAuthHeader)
            .respond_with(challenge("MD5"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(AuthContains("algorithm=\"MD5\""))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"timeofuse": baseline})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(AuthContains("algorithm=\"MD5\""))
            .respond_with(write_ok())
            .mount(&server)
            .await;

        let driver = driver_for(&server, dir.path());
        driver.set_avoid_discharge().await.unwrap();
        let backup_path = dir.path().join(BACKUP_FILE_NAME);
        assert!(backup_path.exists());

        // Second write must not capture again (GET expect(1) verifies).
        driver.set_allow_discharge().await.unwrap();

        driver.restore_baseline().await.unwrap();
        assert!(!backup_path.exists());
    }

    #[tokio::test]
    async fn old_firmware_base_path_is_detected() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        // `/api/` unknown on old firmware, bare path answers with 401.
        Mock::given(path("/api/config/timeofuse"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/config/timeofuse"))
            .and(NoAuthHeader)
            .respond_with(challenge("MD5"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/config/timeofuse"))
            .and(AuthContains("algorithm=\"MD5\""))
            .respond_with(write_ok())
            .mount(&server)
            .await;

        let driver = driver_for(&server, dir.path());
        driver.mark_backup_done().await;
        driver.set_allow_discharge().await.unwrap();
        assert_eq!(*driver.api_base.read().await, Some(""));
    }
}
