//! Control state machine.
//!
//! Fuses the hourly EOS plan with live EV-charging signals, the dynamic
//! battery charge limit and operator overrides into a single inverter mode.
//! The pure state machine lives in [`ControlState`] behind one mutex; the
//! async [`Controller`] wrapper serializes updates from the scheduler, the
//! provider event channel and the override endpoint, and pushes the result
//! to the hardware driver.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BatteryConfig;
use crate::domain::{BatterySnapshot, ControlMode, EvState};
use crate::eos::HourlyPlan;
use crate::inverter::InverterDriver;

/// Upper bound of the state-change window; older entries are dropped.
const MAX_CHANGE_TIMESTAMPS: usize = 1000;
/// Longest accepted override, 12 hours.
pub const MAX_OVERRIDE_MINUTES: u64 = 720;
/// Cadence of the background sweep that expires overrides even when no
/// provider delivers updates.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// Updates delivered from provider workers to the control task.
#[derive(Debug, Clone, Copy)]
pub enum ControlEvent {
    /// `charging` flag of the loadpoint flipped.
    EvEdge(EvState),
    /// Battery snapshot changed (SoC or dynamic charge limit).
    BatteryUpdated(BatterySnapshot),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverrideError {
    #[error("override duration {0} min outside 0..={MAX_OVERRIDE_MINUTES}")]
    InvalidDuration(u64),
    #[error("mode {0} cannot be requested as an override")]
    InvalidMode(i8),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ModeOverride {
    mode: ControlMode,
    end_time: DateTime<Utc>,
}

/// Pure state machine. Every mutating call passes `now` explicitly so the
/// transition rules are deterministic under test.
#[derive(Debug)]
pub struct ControlState {
    max_charge_power_w: f64,
    ac_charge_demand_w: f64,
    ac_charge_demand_no_override_w: f64,
    last_ac_charge_demand_w: f64,
    dc_charge_demand_w: f64,
    /// -1 until the first plan arrives.
    discharge_allowed: i8,
    ev: EvState,
    battery: Option<BatterySnapshot>,
    mode: ControlMode,
    mode_override: Option<ModeOverride>,
    change_timestamps: VecDeque<DateTime<Utc>>,
}

impl ControlState {
    pub fn new(max_charge_power_w: f64) -> Self {
        Self {
            max_charge_power_w,
            ac_charge_demand_w: 0.0,
            ac_charge_demand_no_override_w: 0.0,
            last_ac_charge_demand_w: 0.0,
            dc_charge_demand_w: 0.0,
            discharge_allowed: -1,
            ev: EvState::default(),
            battery: None,
            mode: ControlMode::Startup,
            mode_override: None,
            change_timestamps: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn ac_charge_demand_w(&self) -> f64 {
        self.ac_charge_demand_w
    }

    pub fn dc_charge_demand_w(&self) -> f64 {
        self.dc_charge_demand_w
    }

    pub fn discharge_allowed(&self) -> i8 {
        self.discharge_allowed
    }

    pub fn ev(&self) -> EvState {
        self.ev
    }

    pub fn battery(&self) -> Option<BatterySnapshot> {
        self.battery
    }

    pub fn override_end_time(&self) -> Option<DateTime<Utc>> {
        self.mode_override.map(|o| o.end_time)
    }

    /// Scales the relative EOS demand by the configured maximum charge power.
    /// While an override is active only the remembered unoverridden value is
    /// updated.
    pub fn set_ac_charge_demand_relative(&mut self, relative: f64, now: DateTime<Utc>) {
        let demand = relative * self.max_charge_power_w;
        self.ac_charge_demand_no_override_w = demand;
        if self.mode_override.is_none() {
            self.ac_charge_demand_w = demand;
            debug!(demand_w = demand, "AC charge demand set");
        } else {
            debug!(demand_w = demand, "override active, AC charge demand remembered only");
        }
        self.recompute(now);
    }

    pub fn set_dc_charge_demand_relative(&mut self, relative: f64, now: DateTime<Utc>) {
        self.dc_charge_demand_w = relative * self.max_charge_power_w;
        self.recompute(now);
    }

    pub fn set_discharge_allowed(&mut self, allowed: bool, now: DateTime<Utc>) {
        self.discharge_allowed = i8::from(allowed);
        self.recompute(now);
    }

    pub fn set_ev_state(&mut self, ev: EvState, now: DateTime<Utc>) {
        self.ev = ev;
        self.recompute(now);
    }

    pub fn set_battery(&mut self, snapshot: BatterySnapshot) {
        self.battery = Some(snapshot);
    }

    /// Operator override. `mode_number` -1 clears, 0..=2 forces the mode for
    /// `duration_minutes`. A positive `charge_rate_kw` replaces the AC demand
    /// when grid charging is forced.
    pub fn set_override(
        &mut self,
        mode_number: i8,
        duration_minutes: u64,
        charge_rate_kw: f64,
        now: DateTime<Utc>,
    ) -> Result<(), OverrideError> {
        if mode_number == -1 {
            self.clear_override(now);
            return Ok(());
        }
        if duration_minutes > MAX_OVERRIDE_MINUTES {
            return Err(OverrideError::InvalidDuration(duration_minutes));
        }
        let mode = ControlMode::from_override_number(mode_number)
            .ok_or(OverrideError::InvalidMode(mode_number))?;

        let end_time = (now + ChronoDuration::minutes(duration_minutes as i64))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        self.mode = mode;
        self.mode_override = Some(ModeOverride { mode, end_time });
        self.push_change(now);
        info!(%mode, %end_time, "override set");
        if charge_rate_kw > 0.0 && mode == ControlMode::ChargeFromGrid {
            self.ac_charge_demand_w = charge_rate_kw * 1000.0;
            info!(demand_w = self.ac_charge_demand_w, "override AC charge demand set");
        }
        Ok(())
    }

    /// Drops the override, reverts the AC demand to the last EOS-driven value
    /// and runs a normal re-evaluation.
    pub fn clear_override(&mut self, now: DateTime<Utc>) {
        if self.mode_override.take().is_some() {
            info!("override cleared");
        }
        self.ac_charge_demand_w = self.ac_charge_demand_no_override_w;
        self.recompute(now);
    }

    /// Transition rule. While an override is active only its expiry is
    /// checked; the EOS-derived inputs keep accumulating but do not change
    /// the mode.
    pub fn recompute(&mut self, now: DateTime<Utc>) {
        if let Some(active) = self.mode_override {
            if now > active.end_time {
                info!("override end time reached");
                self.clear_override(now);
            }
            return;
        }

        let mut new_mode = if self.ac_charge_demand_w > 0.0 {
            ControlMode::ChargeFromGrid
        } else if self.discharge_allowed > 0 {
            ControlMode::DischargeAllowed
        } else if self.discharge_allowed == 0 {
            ControlMode::AvoidDischarge
        } else {
            ControlMode::Startup
        };

        if new_mode == ControlMode::DischargeAllowed && self.ev.charging {
            if self.ev.mode.is_fast() {
                new_mode = ControlMode::AvoidDischargeEvccFast;
            } else if self.ev.mode == crate::domain::EvChargeMode::Pv {
                new_mode = ControlMode::DischargeAllowedEvccPv;
            } else if self.ev.mode == crate::domain::EvChargeMode::MinPv {
                new_mode = ControlMode::DischargeAllowedEvccMinPv;
            }
        }

        let demand_changed = self.ac_charge_demand_w != self.last_ac_charge_demand_w;
        if new_mode != self.mode || demand_changed {
            self.push_change(now);
            if demand_changed {
                info!(demand_w = self.ac_charge_demand_w, "AC charge demand changed");
            } else {
                debug!(mode = %new_mode, "overall mode changed");
            }
        }
        self.last_ac_charge_demand_w = self.ac_charge_demand_w;
        self.mode = new_mode;
    }

    fn push_change(&mut self, now: DateTime<Utc>) {
        self.change_timestamps.push_back(now);
        while self.change_timestamps.len() > MAX_CHANGE_TIMESTAMPS {
            self.change_timestamps.pop_front();
        }
    }

    /// True when at least one state change happened within the last
    /// `window_seconds`. Expired entries are dropped on the way.
    pub fn was_changed_recently(&mut self, window_seconds: i64, now: DateTime<Utc>) -> bool {
        while let Some(first) = self.change_timestamps.front() {
            if (now - *first).num_seconds() > window_seconds {
                self.change_timestamps.pop_front();
            } else {
                break;
            }
        }
        !self.change_timestamps.is_empty()
    }

    #[cfg(test)]
    pub fn change_window_len(&self) -> usize {
        self.change_timestamps.len()
    }

    /// Grid charge power to command: the EOS/override demand clamped by the
    /// SoC-dependent battery limit.
    fn commanded_charge_power_w(&self) -> f64 {
        let limit = self
            .battery
            .map(|b| b.dynamic_max_charge_w)
            .unwrap_or(self.max_charge_power_w);
        self.ac_charge_demand_w.min(limit)
    }
}

/// Serializable view for the HTTP facade.
#[derive(Debug, Clone, Serialize)]
pub struct ControlStatus {
    pub current_ac_charge_demand: f64,
    pub current_dc_charge_demand: f64,
    pub current_discharge_allowed: i8,
    pub inverter_mode: String,
    pub inverter_mode_num: i8,
    pub override_active: bool,
    pub override_end_time: Option<String>,
    pub ev_charging: bool,
    pub ev_mode: String,
    pub battery_soc: f64,
    pub battery_usable_capacity_wh: f64,
    pub battery_max_charge_power_dyn: f64,
}

pub struct Controller {
    state: Mutex<ControlState>,
    inverter: Arc<dyn InverterDriver>,
    /// Mode and charge power of the last successful driver write; nothing is
    /// re-sent while they are unchanged.
    last_applied: Mutex<Option<(ControlMode, f64)>>,
}

impl Controller {
    pub fn new(battery: &BatteryConfig, inverter: Arc<dyn InverterDriver>) -> Self {
        Self {
            state: Mutex::new(ControlState::new(battery.max_charge_power_w)),
            inverter,
            last_applied: Mutex::new(None),
        }
    }

    /// Feeds a fresh hourly plan plus the battery snapshot taken with it,
    /// then pushes the outcome to the inverter.
    pub async fn apply_plan(&self, plan: HourlyPlan, battery: BatterySnapshot) {
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            state.set_battery(battery);
            if let Some(relative) = plan.ac_charge_rel {
                state.set_ac_charge_demand_relative(relative, now);
            }
            if let Some(relative) = plan.dc_charge_rel {
                state.set_dc_charge_demand_relative(relative, now);
            }
            if let Some(allowed) = plan.discharge_allowed {
                state.set_discharge_allowed(allowed, now);
            }
        }
        self.apply().await;
    }

    pub async fn handle_event(&self, event: ControlEvent) {
        let now = Utc::now();
        match event {
            ControlEvent::EvEdge(ev) => {
                self.state.lock().set_ev_state(ev, now);
            }
            ControlEvent::BatteryUpdated(snapshot) => {
                let mut state = self.state.lock();
                state.set_battery(snapshot);
                state.recompute(now);
            }
        }
        self.apply().await;
    }

    pub async fn set_override(
        &self,
        mode_number: i8,
        duration_minutes: u64,
        charge_rate_kw: f64,
    ) -> Result<(), OverrideError> {
        self.state
            .lock()
            .set_override(mode_number, duration_minutes, charge_rate_kw, Utc::now())?;
        self.apply().await;
        Ok(())
    }

    /// Event loop: serializes provider updates and sweeps periodically so an
    /// expired override is noticed without external traffic.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ControlEvent>,
        token: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.state.lock().recompute(Utc::now());
                    self.apply().await;
                }
                _ = token.cancelled() => break,
            }
        }
    }

    /// Writes the current mode to the inverter when mode or commanded charge
    /// power moved since the last successful write.
    pub async fn apply(&self) {
        let (mode, charge_power_w) = {
            let state = self.state.lock();
            (state.mode(), state.commanded_charge_power_w())
        };
        if mode == ControlMode::Startup {
            warn!("inverter mode not initialized yet");
            return;
        }
        let command = (mode, charge_power_w);
        if *self.last_applied.lock() == Some(command) {
            debug!(mode = %mode, "inverter already in target state");
            return;
        }

        let result = match mode {
            ControlMode::ChargeFromGrid => {
                info!(mode = %mode, charge_power_w, "applying inverter mode");
                self.inverter.set_force_charge(charge_power_w).await
            }
            ControlMode::AvoidDischarge | ControlMode::AvoidDischargeEvccFast => {
                info!(mode = %mode, "applying inverter mode");
                self.inverter.set_avoid_discharge().await
            }
            ControlMode::DischargeAllowed
            | ControlMode::DischargeAllowedEvccPv
            | ControlMode::DischargeAllowedEvccMinPv => {
                info!(mode = %mode, "applying inverter mode");
                self.inverter.set_allow_discharge().await
            }
            ControlMode::Startup => unreachable!("filtered above"),
        };
        match result {
            Ok(()) => {
                *self.last_applied.lock() = Some(command);
            }
            Err(e) => {
                // Keep last_applied untouched so the next evaluation retries.
                error!(mode = %mode, error = %e, "inverter write failed");
            }
        }
    }

    pub fn was_changed_recently(&self, window_seconds: i64) -> bool {
        self.state
            .lock()
            .was_changed_recently(window_seconds, Utc::now())
    }

    pub fn status(&self) -> ControlStatus {
        let state = self.state.lock();
        let battery = state.battery();
        ControlStatus {
            current_ac_charge_demand: state.ac_charge_demand_w(),
            current_dc_charge_demand: state.dc_charge_demand_w(),
            current_discharge_allowed: state.discharge_allowed(),
            inverter_mode: state.mode().to_string(),
            inverter_mode_num: state.mode().as_number(),
            override_active: state.override_end_time().is_some(),
            override_end_time: state.override_end_time().map(|t| t.to_rfc3339()),
            ev_charging: state.ev().charging,
            ev_mode: state.ev().mode.to_string(),
            battery_soc: battery.map(|b| b.soc_percent).unwrap_or(0.0),
            battery_usable_capacity_wh: battery.map(|b| b.usable_capacity_wh).unwrap_or(0.0),
            battery_max_charge_power_dyn: battery.map(|b| b.dynamic_max_charge_w).unwrap_or(0.0),
        }
    }
}
