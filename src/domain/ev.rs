use std::fmt;

/// Charge strategy reported by the EVCC loadpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvChargeMode {
    Off,
    Now,
    Pv,
    MinPv,
    PvNow,
    MinPvNow,
    #[default]
    Unknown,
}

impl EvChargeMode {
    /// Maps the EVCC wire string; anything unexpected becomes `Unknown`
    /// rather than an error, a missing mode must not stall control.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "off" => Self::Off,
            "now" => Self::Now,
            "pv" => Self::Pv,
            "minpv" => Self::MinPv,
            "pv+now" => Self::PvNow,
            "minpv+now" => Self::MinPvNow,
            _ => Self::Unknown,
        }
    }

    /// True for the modes that pull grid power regardless of PV surplus.
    pub fn is_fast(self) -> bool {
        matches!(self, Self::Now | Self::PvNow | Self::MinPvNow)
    }
}

impl fmt::Display for EvChargeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Off => "off",
            Self::Now => "now",
            Self::Pv => "pv",
            Self::MinPv => "minpv",
            Self::PvNow => "pv+now",
            Self::MinPvNow => "minpv+now",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Latest loadpoint state published by the EVCC provider.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvState {
    pub charging: bool,
    pub mode: EvChargeMode,
}
