//! Experiment state machine
//!
//! ```text
//! CREATED ──start──> RUNNING <──start/resume── PAUSED
//!    │                 │  └──────pause──────────>│
//!    │                 ├──complete──> COMPLETED <─┤ complete
//!    └──cancel──> CANCELLED <──cancel──┴──────────┘ cancel
//! ```
//!
//! COMPLETED and CANCELLED are terminal. A rejected transition leaves the
//! experiment untouched.

use crate::error::ExperimentError;
use crate::experiment::Experiment;
use crate::types::ExperimentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// CREATED/PAUSED -> RUNNING
    Start,
    /// RUNNING -> PAUSED
    Pause,
    /// PAUSED -> RUNNING
    Resume,
    /// RUNNING/PAUSED -> COMPLETED
    Complete,
    /// any non-terminal -> CANCELLED
    Cancel,
}

impl Transition {
    /// Every operation
    pub const ALL: [Transition; 5] = [
        Transition::Start,
        Transition::Pause,
        Transition::Resume,
        Transition::Complete,
        Transition::Cancel,
    ];

    /// Status reached on success
    #[inline]
    #[must_use]
    pub fn target(self) -> ExperimentStatus {
        match self {
            Transition::Start | Transition::Resume => ExperimentStatus::Running,
            Transition::Pause => ExperimentStatus::Paused,
            Transition::Complete => ExperimentStatus::Completed,
            Transition::Cancel => ExperimentStatus::Cancelled,
        }
    }

    /// Operation that moves an experiment to `status`, used by status-change updates
    pub fn toward(status: ExperimentStatus) -> Result<Self, ExperimentError> {
        match status {
            ExperimentStatus::Running => Ok(Transition::Start),
            ExperimentStatus::Paused => Ok(Transition::Pause),
            ExperimentStatus::Completed => Ok(Transition::Complete),
            ExperimentStatus::Cancelled => Ok(Transition::Cancel),
            ExperimentStatus::Created => Err(ExperimentError::validation(
                "an experiment cannot be moved back to CREATED",
            )),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Start => "start",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Complete => "complete",
            Transition::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Operations legal from `from`
#[must_use]
pub fn allowed_transitions(from: ExperimentStatus) -> Vec<Transition> {
    use ExperimentStatus::*;
    match from {
        Created => vec![Transition::Start, Transition::Cancel],
        Running => vec![Transition::Pause, Transition::Complete, Transition::Cancel],
        Paused => vec![
            Transition::Start,
            Transition::Resume,
            Transition::Complete,
            Transition::Cancel,
        ],
        Completed | Cancelled => vec![],
    }
}

/// Check a transition; returns the resulting status
pub fn validate_transition(
    from: ExperimentStatus,
    transition: Transition,
) -> Result<ExperimentStatus, ExperimentError> {
    if allowed_transitions(from).contains(&transition) {
        Ok(transition.target())
    } else {
        Err(ExperimentError::illegal(transition.to_string(), from))
    }
}

/// Apply a transition and stamp the lifecycle timestamps
pub fn apply_transition(
    experiment: &mut Experiment,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<(), ExperimentError> {
    let next = validate_transition(experiment.status, transition)?;

    experiment.status = next;
    experiment.updated_at = now;
    match next {
        ExperimentStatus::Running => {
            if experiment.started_at.is_none() {
                experiment.started_at = Some(now);
            }
        }
        ExperimentStatus::Completed | ExperimentStatus::Cancelled => {
            experiment.completed_at = Some(now);
        }
        ExperimentStatus::Created | ExperimentStatus::Paused => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentDefinition;
    use proptest::prelude::*;

    fn experiment() -> Experiment {
        let def = ExperimentDefinition::new("t", "a", "b").with_backend("p", "m");
        Experiment::from_definition(def, Utc::now()).unwrap()
    }

    fn any_status() -> impl Strategy<Value = ExperimentStatus> {
        prop_oneof![
            Just(ExperimentStatus::Created),
            Just(ExperimentStatus::Running),
            Just(ExperimentStatus::Paused),
            Just(ExperimentStatus::Completed),
            Just(ExperimentStatus::Cancelled),
        ]
    }

    fn any_transition() -> impl Strategy<Value = Transition> {
        prop::sample::select(Transition::ALL.to_vec())
    }

    #[test]
    fn created_transitions() {
        assert!(validate_transition(ExperimentStatus::Created, Transition::Start).is_ok());
        assert!(validate_transition(ExperimentStatus::Created, Transition::Cancel).is_ok());

        assert!(validate_transition(ExperimentStatus::Created, Transition::Pause).is_err());
        assert!(validate_transition(ExperimentStatus::Created, Transition::Resume).is_err());
        assert!(validate_transition(ExperimentStatus::Created, Transition::Complete).is_err());
    }

    #[test]
    fn terminal_states_allow_nothing() {
        assert!(allowed_transitions(ExperimentStatus::Completed).is_empty());
        assert!(allowed_transitions(ExperimentStatus::Cancelled).is_empty());
    }

    #[test]
    fn start_stamps_started_at_once() {
        let mut exp = experiment();
        let t0 = Utc::now();
        apply_transition(&mut exp, Transition::Start, t0).unwrap();
        apply_transition(&mut exp, Transition::Pause, t0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(5);
        apply_transition(&mut exp, Transition::Resume, t1).unwrap();

        assert_eq!(exp.status, ExperimentStatus::Running);
        assert_eq!(exp.started_at, Some(t0));
        assert_eq!(exp.updated_at, t1);
    }

    #[test]
    fn complete_and_cancel_stamp_completed_at() {
        let mut exp = experiment();
        let now = Utc::now();
        apply_transition(&mut exp, Transition::Cancel, now).unwrap();
        assert_eq!(exp.completed_at, Some(now));
    }

    #[test]
    fn cancel_on_completed_is_rejected_without_mutation() {
        let mut exp = experiment();
        let now = Utc::now();
        apply_transition(&mut exp, Transition::Start, now).unwrap();
        apply_transition(&mut exp, Transition::Complete, now).unwrap();
        let before = exp.clone();

        let err = apply_transition(&mut exp, Transition::Cancel, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::IllegalTransition { current: ExperimentStatus::Completed, .. }
        ));
        assert_eq!(exp, before);
    }

    #[test]
    fn toward_maps_requested_status() {
        assert_eq!(
            Transition::toward(ExperimentStatus::Paused).unwrap(),
            Transition::Pause
        );
        assert!(Transition::toward(ExperimentStatus::Created).is_err());
    }

    proptest! {
        #[test]
        fn prop_validation_agrees_with_table(from in any_status(), transition in any_transition()) {
            let allowed = allowed_transitions(from);
            match validate_transition(from, transition) {
                Ok(to) => {
                    prop_assert!(allowed.contains(&transition));
                    prop_assert_eq!(to, transition.target());
                }
                Err(_) => prop_assert!(!allowed.contains(&transition)),
            }
        }

        #[test]
        fn prop_terminal_is_absorbing(from in any_status(), transition in any_transition()) {
            if from.is_terminal() {
                prop_assert!(validate_transition(from, transition).is_err());
            }
        }
    }
}
