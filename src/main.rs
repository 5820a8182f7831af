mod api;
mod clock;
mod config;
mod control;
mod domain;
mod eos;
mod httpx;
mod inverter;
mod providers;
mod scheduler;
mod telemetry;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use clock::Clock;
use config::{AppConfig, ConfigLoad, InverterKind};
use control::Controller;
use eos::EosClient;
use inverter::{FroniusGen24, InverterDriver, LogOnlyInverter};
use providers::battery::BatteryProvider;
use providers::evcc::EvccProvider;
use providers::load::LoadProvider;
use providers::price::PriceProvider;
use providers::pv::PvProvider;
use providers::Supervisor;
use scheduler::OptimizationScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional first argument selects the data directory holding config.yaml
    // and the JSON state files.
    let data_dir = match std::env::args().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("cannot determine working directory")?,
    };

    let cfg = match AppConfig::load(&data_dir)? {
        ConfigLoad::Loaded(cfg) => cfg,
        ConfigLoad::CreatedDefault(path) => {
            println!("Config file not found. Created a new one with default values.");
            println!(
                "Please edit {} and restart the server.",
                path.display()
            );
            return Ok(());
        }
    };

    telemetry::init_tracing(&cfg.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        time_zone = %cfg.time_zone,
        "starting EOS Connect"
    );

    let clock = Clock::new(cfg.parse_time_zone()?);

    let inverter: Arc<dyn InverterDriver> = match cfg.inverter.kind {
        InverterKind::FroniusGen24 | InverterKind::FroniusGen24V2 => {
            Arc::new(FroniusGen24::new(&cfg.inverter, &data_dir)?)
        }
        InverterKind::Default => {
            info!("inverter type 'default', running in show-only mode");
            Arc::new(LogOnlyInverter)
        }
    };

    let (control_events_tx, control_events_rx) = mpsc::channel(64);
    let controller = Arc::new(Controller::new(&cfg.battery, inverter.clone()));
    let price = Arc::new(PriceProvider::new(cfg.price.clone(), clock)?);
    let pv = Arc::new(PvProvider::new(
        cfg.pv_forecast_source.source,
        cfg.pv_forecast_source.api_key.clone(),
        cfg.evcc.url.clone(),
        cfg.pv_forecast.clone(),
        clock,
    )?);
    let load = Arc::new(LoadProvider::new(cfg.load.clone(), clock)?);
    let battery = Arc::new(BatteryProvider::new(
        cfg.battery.clone(),
        control_events_tx.clone(),
    )?);
    let evcc = if cfg.evcc.url.is_empty() {
        info!("no EVCC URL configured, EV provider disabled");
        None
    } else {
        Some(Arc::new(EvccProvider::new(
            cfg.evcc.url.clone(),
            control_events_tx,
        )?))
    };
    let eos = Arc::new(EosClient::new(
        &cfg.eos,
        cfg.battery.clone(),
        cfg.inverter.max_pv_charge_rate,
        clock,
    )?);
    let optimization = Arc::new(OptimizationScheduler::new(
        clock,
        cfg.refresh_time,
        data_dir.clone(),
        price.clone(),
        pv.clone(),
        load,
        battery.clone(),
        eos,
        controller.clone(),
    ));

    let mut supervisor = Supervisor::new();
    supervisor.spawn(
        "control",
        controller.clone().run(control_events_rx, supervisor.token()),
    );
    supervisor.spawn("battery", battery.clone().run(supervisor.token()));
    supervisor.spawn("pv", pv.clone().run(supervisor.token()));
    if let Some(evcc) = &evcc {
        supervisor.spawn("evcc", evcc.clone().run(supervisor.token()));
    }
    supervisor.spawn("scheduler", optimization.clone().run(supervisor.token()));

    let app = api::router(api::AppState {
        controller,
        scheduler: optimization,
        price,
        pv,
        battery,
        evcc,
        clock,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.eos_connect_web_port));
    info!(%addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind web port {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    supervisor.shutdown().await;
    // Blocking restore, bounded by the driver's own HTTP timeout.
    if let Err(e) = inverter.restore_baseline().await {
        warn!(error = %e, "could not restore inverter rule set");
    }
    info!("shutdown complete");
    Ok(())
}
