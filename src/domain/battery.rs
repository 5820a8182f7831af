use serde::Serialize;

use crate::config::BatteryConfig;

const MIN_CHARGE_POWER_W: f64 = 500.0;
const CHARGE_POWER_STEP_W: f64 = 50.0;

/// Published view of the battery, derived from the latest SoC reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatterySnapshot {
    /// State of charge in percent, 0..=100.
    pub soc_percent: f64,
    /// Energy extractable above the configured minimum SoC, in Wh.
    pub usable_capacity_wh: f64,
    /// SoC-dependent grid charge limit, in W.
    pub dynamic_max_charge_w: f64,
}

impl BatterySnapshot {
    pub fn from_soc(soc_percent: f64, config: &BatteryConfig) -> Self {
        let soc = soc_percent.clamp(0.0, 100.0);
        let usable = config.capacity_wh
            * config.discharge_efficiency
            * ((soc - config.min_soc_percentage).max(0.0) / 100.0);
        Self {
            soc_percent: soc,
            usable_capacity_wh: usable,
            dynamic_max_charge_w: dynamic_max_charge_w(soc, config.max_charge_power_w),
        }
    }
}

/// Maximum charge power the cells accept at the given SoC.
///
/// Below 50 % the pack takes the full configured rate (C-rate 1.0). Above,
/// the acceptance curve falls off quadratically down to a 5 % floor:
/// `max(0.05, (1 - (soc - 50) / 60)^2)`. The result is clamped to
/// [500 W, configured max] and stepped to 50 W so the inverter is not
/// rewritten for single-watt jitter.
pub fn dynamic_max_charge_w(soc_percent: f64, configured_max_w: f64) -> f64 {
    let soc = soc_percent.clamp(0.0, 100.0);
    let c_rate = if soc <= 50.0 {
        1.0
    } else {
        let derate = 1.0 - (soc - 50.0) / 60.0;
        (derate * derate).max(0.05)
    };
    let clamped = (configured_max_w * c_rate).clamp(MIN_CHARGE_POWER_W, configured_max_w);
    let stepped = (clamped / CHARGE_POWER_STEP_W).round() * CHARGE_POWER_STEP_W;
    let ceiling = (configured_max_w / CHARGE_POWER_STEP_W).floor() * CHARGE_POWER_STEP_W;
    stepped.min(ceiling).max(MIN_CHARGE_POWER_W)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_config() -> BatteryConfig {
        BatteryConfig {
            capacity_wh: 10000.0,
            discharge_efficiency: 0.9,
            min_soc_percentage: 10.0,
            max_charge_power_w: 5000.0,
            ..BatteryConfig::default()
        }
    }

    #[test]
    fn full_rate_at_or_below_half_charge() {
        assert_eq!(dynamic_max_charge_w(0.0, 5000.0), 5000.0);
        assert_eq!(dynamic_max_charge_w(50.0, 5000.0), 5000.0);
    }

    #[test]
    fn derates_quadratically_above_half() {
        // soc 80: (1 - 30/60)^2 = 0.25 -> 1250 W
        assert_eq!(dynamic_max_charge_w(80.0, 5000.0), 1250.0);
        // soc 110 clamps to 100: (1 - 50/60)^2 ~ 0.0278 -> floor at 500 W
        assert_eq!(dynamic_max_charge_w(110.0, 5000.0), 500.0);
    }

    #[test]
    fn usable_capacity_subtracts_reserve() {
        let snapshot = BatterySnapshot::from_soc(60.0, &test_config());
        assert!((snapshot.usable_capacity_wh - 10000.0 * 0.9 * 0.5).abs() < 1e-9);

        let empty = BatterySnapshot::from_soc(5.0, &test_config());
        assert_eq!(empty.usable_capacity_wh, 0.0);
    }

    proptest! {
        #[test]
        fn charge_limit_stays_in_band_and_on_grid(
            soc in 0.0f64..=100.0,
            max_w in 500.0f64..=20000.0,
        ) {
            let limit = dynamic_max_charge_w(soc, max_w);
            prop_assert!(limit >= MIN_CHARGE_POWER_W);
            prop_assert!(limit <= max_w);
            let steps = limit / CHARGE_POWER_STEP_W;
            prop_assert!((steps - steps.round()).abs() < 1e-9);
        }
    }
}
