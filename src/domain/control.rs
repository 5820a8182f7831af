use serde::Serialize;
use strum_macros::Display;

/// Inverter operating mode selected by the control state machine.
///
/// The numeric values are part of the JSON status contract
/// (`inverter_mode_num`) and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum ControlMode {
    #[strum(serialize = "MODE Startup")]
    Startup,
    #[strum(serialize = "MODE CHARGE FROM GRID")]
    ChargeFromGrid,
    #[strum(serialize = "MODE AVOID DISCHARGE")]
    AvoidDischarge,
    #[strum(serialize = "MODE DISCHARGE ALLOWED")]
    DischargeAllowed,
    #[strum(serialize = "MODE AVOID DISCHARGE EVCC FAST")]
    AvoidDischargeEvccFast,
    #[strum(serialize = "MODE DISCHARGE ALLOWED EVCC PV")]
    DischargeAllowedEvccPv,
    #[strum(serialize = "MODE DISCHARGE ALLOWED EVCC MIN+PV")]
    DischargeAllowedEvccMinPv,
}

impl ControlMode {
    pub fn as_number(self) -> i8 {
        match self {
            Self::Startup => -1,
            Self::ChargeFromGrid => 0,
            Self::AvoidDischarge => 1,
            Self::DischargeAllowed => 2,
            Self::AvoidDischargeEvccFast => 3,
            Self::DischargeAllowedEvccPv => 4,
            Self::DischargeAllowedEvccMinPv => 5,
        }
    }

    /// Operator-facing override modes; the EV-fused states are derived, never
    /// requested directly.
    pub fn from_override_number(value: i8) -> Option<Self> {
        match value {
            0 => Some(Self::ChargeFromGrid),
            1 => Some(Self::AvoidDischarge),
            2 => Some(Self::DischargeAllowed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_match_status_contract() {
        assert_eq!(ControlMode::Startup.as_number(), -1);
        assert_eq!(ControlMode::ChargeFromGrid.as_number(), 0);
        assert_eq!(ControlMode::AvoidDischarge.as_number(), 1);
        assert_eq!(ControlMode::DischargeAllowed.as_number(), 2);
        assert_eq!(ControlMode::AvoidDischargeEvccFast.as_number(), 3);
        assert_eq!(ControlMode::DischargeAllowedEvccPv.as_number(), 4);
        assert_eq!(ControlMode::DischargeAllowedEvccMinPv.as_number(), 5);
    }

    #[test]
    fn override_accepts_base_modes_only() {
        assert_eq!(
            ControlMode::from_override_number(0),
            Some(ControlMode::ChargeFromGrid)
        );
        assert_eq!(ControlMode::from_override_number(3), None);
        assert_eq!(ControlMode::from_override_number(-1), None);
    }

    #[test]
    fn display_matches_legacy_labels() {
        assert_eq!(
            ControlMode::DischargeAllowedEvccMinPv.to_string(),
            "MODE DISCHARGE ALLOWED EVCC MIN+PV"
        );
    }
}
