//! Lifecycle state machine: the constrained set of states a node moves
//! through in response to control-plane commands.

use std::fmt;

use tracing::{info, warn};

/// One of the four states a node's lifecycle can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Active,
    Cordoned,
    Draining,
    Terminating,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Active => "active",
            LifecycleState::Cordoned => "cordoned",
            LifecycleState::Draining => "draining",
            LifecycleState::Terminating => "terminating",
        };
        write!(f, "{s}")
    }
}

impl LifecycleState {
    /// `IsCordoned()` per the spec: true once cordoned or further along.
    pub fn is_cordoned(self) -> bool {
        matches!(self, LifecycleState::Cordoned | LifecycleState::Draining | LifecycleState::Terminating)
    }

    /// `IsDraining()` per the spec: true once draining or further along.
    pub fn is_draining(self) -> bool {
        matches!(self, LifecycleState::Draining | LifecycleState::Terminating)
    }

    fn legal_targets(self) -> &'static [LifecycleState] {
        match self {
            LifecycleState::Active => &[LifecycleState::Cordoned, LifecycleState::Draining, LifecycleState::Terminating],
            LifecycleState::Cordoned => &[LifecycleState::Active, LifecycleState::Draining, LifecycleState::Terminating],
            LifecycleState::Draining => &[LifecycleState::Terminating],
            LifecycleState::Terminating => &[],
        }
    }
}

/// A transition was rejected: `from`/`to` describe the attempted move,
/// `command` names the command that attempted it.
#[derive(Debug, thiserror::Error)]
#[error("invalid transition {from} -> {to} (command: {command})")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub command: String,
}

/// Attempt a lifecycle transition. Self-transitions are always legal
/// no-ops. Any other transition not in the legal-transitions table is
/// rejected without mutating `current`.
///
/// Returns `Ok(true)` if the state actually changed, `Ok(false)` if it was
/// an idempotent self-transition.
pub fn transition(
    current: &mut LifecycleState,
    to: LifecycleState,
    command: &str,
) -> Result<bool, InvalidTransition> {
    let from = *current;

    if from == to {
        info!(%from, %to, command, "lifecycle self-transition (no-op)");
        return Ok(false);
    }

    if !from.legal_targets().contains(&to) {
        warn!(%from, %to, command, "rejected illegal lifecycle transition");
        return Err(InvalidTransition {
            from,
            to,
            command: command.to_string(),
        });
    }

    info!(%from, %to, command, "lifecycle transition");
    *current = to;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn active_to_cordoned_is_legal() {
        let mut state = Active;
        assert!(transition(&mut state, Cordoned, "cordon").unwrap());
        assert_eq!(state, Cordoned);
    }

    #[test]
    fn cordoned_to_active_uncordon_is_legal() {
        let mut state = Cordoned;
        assert!(transition(&mut state, Active, "cordon").unwrap());
        assert_eq!(state, Active);
    }

    #[test]
    fn draining_to_active_is_illegal() {
        let mut state = Draining;
        let err = transition(&mut state, Active, "cordon").unwrap_err();
        assert_eq!(err.from, Draining);
        assert_eq!(err.to, Active);
        assert_eq!(err.command, "cordon");
        assert_eq!(state, Draining, "state must not change on rejection");
    }

    #[test]
    fn terminating_is_terminal() {
        let mut state = Terminating;
        assert!(transition(&mut state, Active, "cordon").is_err());
        assert!(transition(&mut state, Draining, "drain").is_err());
    }

    #[test]
    fn self_transition_is_idempotent_noop() {
        let mut state = Cordoned;
        assert!(!transition(&mut state, Cordoned, "cordon").unwrap());
        assert_eq!(state, Cordoned);
    }

    #[test]
    fn predicates_match_spec_invariant_2() {
        assert!(!Active.is_cordoned());
        assert!(Cordoned.is_cordoned());
        assert!(Draining.is_cordoned());
        assert!(Terminating.is_cordoned());

        assert!(!Active.is_draining());
        assert!(!Cordoned.is_draining());
        assert!(Draining.is_draining());
        assert!(Terminating.is_draining());
    }
}
