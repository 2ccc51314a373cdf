/// Why a claim was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The cell's single governing cap is met.
    CapMet,
    /// The shared, all-users cap is met.
    GlobalCapMet,
    /// The claimant's own cap for this offer is met.
    UserCapMet,
}

/// The definitive result of one atomic claim attempt.
///
/// A denial is an ordinary outcome, not an error, and is never retried by the
/// primitive itself: within one run the caps it reports cannot change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted,
    Denied(DenyReason),
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted)
    }

    /// Wire representation shared with the server-side claim scripts.
    pub fn as_wire(&self) -> &'static str {
        match self {
            ClaimOutcome::Granted => "SUCCESS",
            ClaimOutcome::Denied(DenyReason::CapMet) => "FAIL_CAP_MET",
            ClaimOutcome::Denied(DenyReason::GlobalCapMet) => "FAIL_GLOBAL_CAP_MET",
            ClaimOutcome::Denied(DenyReason::UserCapMet) => "FAIL_USER_CAP_MET",
        }
    }

    /// Parses a wire representation produced by a claim script.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "SUCCESS" => Some(ClaimOutcome::Granted),
            "FAIL_CAP_MET" => Some(ClaimOutcome::Denied(DenyReason::CapMet)),
            "FAIL_GLOBAL_CAP_MET" => Some(ClaimOutcome::Denied(DenyReason::GlobalCapMet)),
            "FAIL_USER_CAP_MET" => Some(ClaimOutcome::Denied(DenyReason::UserCapMet)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let outcomes = [
            ClaimOutcome::Granted,
            ClaimOutcome::Denied(DenyReason::CapMet),
            ClaimOutcome::Denied(DenyReason::GlobalCapMet),
            ClaimOutcome::Denied(DenyReason::UserCapMet),
        ];
        for outcome in outcomes {
            assert_eq!(ClaimOutcome::from_wire(outcome.as_wire()), Some(outcome));
        }
    }

    #[test]
    fn unknown_wire_value_is_rejected() {
        assert_eq!(ClaimOutcome::from_wire("MAYBE"), None);
        assert_eq!(ClaimOutcome::from_wire(""), None);
    }
}
