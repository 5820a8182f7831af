//! Hourly forecast vectors and their normalization rules.
//!
//! Every vector handed to the optimizer covers the same window: 48 hourly
//! samples aligned to today's local midnight. Upstreams deliver anything from
//! 23 to 50 samples around DST transitions, so all providers funnel their raw
//! data through [`normalize_series`] before publishing.

use serde::{Deserialize, Serialize};

/// Optimization window in hours: today plus tomorrow.
pub const HORIZON_HOURS: usize = 48;

/// Forces `values` to exactly `horizon` entries: oversize input is truncated,
/// undersize input is padded by repeating the last sample (zeros when empty).
pub fn normalize_series(mut values: Vec<f64>, horizon: usize) -> Vec<f64> {
    if values.len() > horizon {
        values.truncate(horizon);
    } else if values.len() < horizon {
        let filler = values.last().copied().unwrap_or(0.0);
        values.resize(horizon, filler);
    }
    values
}

/// Prices carry nine significant decimals in EUR per Wh.
pub fn round_price(value: f64) -> f64 {
    (value * 1e9).round() / 1e9
}

/// Consumption and feed-in price vectors for the optimization window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSet {
    /// Tax-inclusive consumption price, EUR/Wh.
    pub total: Vec<f64>,
    /// Energy-only price, EUR/Wh. Drives the negative-price feed-in rule.
    pub direct: Vec<f64>,
    /// Feed-in revenue, EUR/Wh.
    pub feed_in: Vec<f64>,
}

impl PriceSet {
    /// Builds the set from raw total/direct vectors. Both are normalized to
    /// the horizon first; the feed-in vector is derived from `direct`: the
    /// configured tariff (EUR/kWh, stored as EUR/Wh) for every hour, or zero
    /// for hours with a negative energy price when suppression is on.
    pub fn from_vectors(
        total: Vec<f64>,
        direct: Vec<f64>,
        horizon: usize,
        feed_in_tariff_eur_kwh: f64,
        negative_price_switch: bool,
    ) -> Self {
        let total = normalize_series(total, horizon);
        let direct = normalize_series(direct, horizon);
        let tariff = round_price(feed_in_tariff_eur_kwh / 1000.0);
        let feed_in = direct
            .iter()
            .map(|&price| {
                if negative_price_switch && price < 0.0 {
                    0.0
                } else {
                    tariff
                }
            })
            .collect();
        Self { total, direct, feed_in }
    }

    /// Flat fallback set used until the first successful price fetch.
    pub fn fallback(horizon: usize) -> Self {
        Self {
            total: vec![0.0001; horizon],
            direct: vec![0.0001; horizon],
            feed_in: vec![0.0; horizon],
        }
    }
}
