use crate::CoreError;
use riptide_engine::UnitStatus;

/// Check a unit state change against the lifecycle state machine.
///
/// `Starting -> Stopped` covers a start abandoned before anything was
/// created; `Starting -> Stopping` a start rolled back after cancellation.
pub fn validate_transition(from: &UnitStatus, to: &UnitStatus) -> Result<(), CoreError> {
    use UnitStatus::{Error, Running, Starting, Stopped, Stopping};

    let valid = matches!(
        (from, to),
        (Stopped | Error(_), Starting)
            | (Starting, Running | Stopping | Stopped | Error(_))
            | (Running | Error(_), Stopping)
            | (Stopping, Stopped | Error(_))
            | (Error(_), Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> UnitStatus {
        UnitStatus::Error("exited".to_owned())
    }

    #[test]
    fn valid_transitions() {
        use UnitStatus::{Running, Starting, Stopped, Stopping};
        assert!(validate_transition(&Stopped, &Starting).is_ok());
        assert!(validate_transition(&Starting, &Running).is_ok());
        assert!(validate_transition(&Running, &Stopping).is_ok());
        assert!(validate_transition(&Stopping, &Stopped).is_ok());
        assert!(validate_transition(&Starting, &err()).is_ok());
        assert!(validate_transition(&Stopping, &err()).is_ok());
        assert!(validate_transition(&err(), &Starting).is_ok()); // retry
        assert!(validate_transition(&err(), &Stopping).is_ok()); // cleanup
        assert!(validate_transition(&Starting, &Stopping).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        use UnitStatus::{Running, Starting, Stopped, Stopping};
        assert!(validate_transition(&Stopped, &Running).is_err());
        assert!(validate_transition(&Stopped, &Stopping).is_err());
        assert!(validate_transition(&Running, &Starting).is_err());
        assert!(validate_transition(&Running, &Stopped).is_err());
        assert!(validate_transition(&Stopping, &Running).is_err());
        assert!(validate_transition(&Running, &err()).is_err());
    }

    #[test]
    fn error_names_both_states() {
        let e = validate_transition(&UnitStatus::Stopped, &UnitStatus::Running).unwrap_err();
        assert_eq!(e.to_string(), "invalid state transition: stopped -> running");
    }
}
