//! One-shot jail lifecycle
//!
//! Every sortie walks create, provision, execute, stop, destroy. The
//! machine runs in dynamic mode so the executor can drive it from runtime
//! results, and it records where a sortie was when something went wrong.

use state_machines::state_machine;

state_machine! {
    name: SortieMachine,
    dynamic: true,
    initial: Unstarted,
    states: [Unstarted, Created, Provisioned, Executed, Stopped, Destroyed, Failed],
    events {
        create {
            transition: { from: Unstarted, to: Created }
        }
        provision {
            transition: { from: Created, to: Provisioned }
        }
        execute {
            transition: { from: Provisioned, to: Executed }
        }
        stop {
            transition: { from: [Created, Provisioned, Executed, Failed], to: Stopped }
        }
        destroy {
            transition: { from: Stopped, to: Destroyed }
        }
        fail {
            transition: { from: [Unstarted, Created, Provisioned], to: Failed }
        }
    }
}

/// Lifecycle stage as a plain enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unstarted,
    Created,
    Provisioned,
    Executed,
    Stopped,
    Destroyed,
    Failed,
}

impl Stage {
    /// Parse stage from the machine's state name
    pub fn from_str(s: &str) -> Self {
        match s {
            "Created" => Stage::Created,
            "Provisioned" => Stage::Provisioned,
            "Executed" => Stage::Executed,
            "Stopped" => Stage::Stopped,
            "Destroyed" => Stage::Destroyed,
            "Failed" => Stage::Failed,
            _ => Stage::Unstarted,
        }
    }
}

/// Lifecycle tracker for a single sortie
pub struct Sortie {
    machine: DynamicSortieMachine<()>,
    name: String,
}

impl Sortie {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            machine: SortieMachine::new(()).into_dynamic(),
            name: name.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        Stage::from_str(self.machine.current_state())
    }

    /// Apply an event, logging transitions the machine refuses
    pub fn advance(&mut self, event: SortieMachineEvent) {
        let from = self.machine.current_state().to_string();
        if let Err(e) = self.machine.handle(event) {
            tracing::debug!(jail = %self.name, from = %from, error = ?e, "ignored lifecycle event");
        } else {
            tracing::trace!(jail = %self.name, from = %from, to = self.machine.current_state(), "lifecycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = SortieMachine::new(()).into_dynamic();
        assert_eq!(machine.current_state(), "Unstarted");
    }

    #[test]
    fn test_full_lifecycle() {
        let mut sortie = Sortie::new("one-shot");

        sortie.advance(SortieMachineEvent::Create);
        sortie.advance(SortieMachineEvent::Provision);
        sortie.advance(SortieMachineEvent::Execute);
        assert_eq!(sortie.stage(), Stage::Executed);

        sortie.advance(SortieMachineEvent::Stop);
        sortie.advance(SortieMachineEvent::Destroy);
        assert_eq!(sortie.stage(), Stage::Destroyed);
    }

    #[test]
    fn test_stop_after_partial_setup() {
        let mut machine = SortieMachine::new(()).into_dynamic();
        machine.handle(SortieMachineEvent::Create).unwrap();
        machine.handle(SortieMachineEvent::Stop).unwrap();
        assert_eq!(machine.current_state(), "Stopped");
    }

    #[test]
    fn test_failed_sortie_is_still_torn_down() {
        let mut sortie = Sortie::new("one-shot");
        sortie.advance(SortieMachineEvent::Create);
        sortie.advance(SortieMachineEvent::Fail);
        sortie.advance(SortieMachineEvent::Stop);
        sortie.advance(SortieMachineEvent::Destroy);
        assert_eq!(sortie.stage(), Stage::Destroyed);
    }

    #[test]
    fn test_create_failure() {
        let mut sortie = Sortie::new("one-shot");
        sortie.advance(SortieMachineEvent::Fail);
        assert_eq!(sortie.stage(), Stage::Failed);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = SortieMachine::new(()).into_dynamic();
        assert!(machine.handle(SortieMachineEvent::Execute).is_err());
        assert!(machine.handle(SortieMachineEvent::Destroy).is_err());
        assert_eq!(machine.current_state(), "Unstarted");
    }
}
