pub mod battery;
pub mod control;
pub mod ev;
pub mod forecast;

pub use battery::{dynamic_max_charge_w, BatterySnapshot};
pub use control::ControlMode;
pub use ev::{EvChargeMode, EvState};
pub use forecast::{normalize_series, round_price, PriceSet, HORIZON_HOURS};
