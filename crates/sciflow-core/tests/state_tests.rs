use proptest::prelude::*;
use sciflow_core::state::{allowed_transitions, validate_transition};
use sciflow_core::{FlowMachine, FlowState};

fn any_state() -> impl Strategy<Value = FlowState> {
    prop_oneof![
        Just(FlowState::Planning),
        Just(FlowState::WaitingConfirmation),
        Just(FlowState::Executing),
        Just(FlowState::Retry),
        Just(FlowState::Guarded),
        Just(FlowState::Completed),
    ]
}

#[test]
fn test_planning_transitions() {
    assert!(validate_transition(FlowState::Planning, FlowState::WaitingConfirmation).is_ok());
    assert!(validate_transition(FlowState::Planning, FlowState::Executing).is_ok());

    assert!(validate_transition(FlowState::Planning, FlowState::Retry).is_err());
    assert!(validate_transition(FlowState::Planning, FlowState::Guarded).is_err());
}

#[test]
fn test_retry_only_returns_to_executing() {
    assert_eq!(allowed_transitions(FlowState::Retry), &[FlowState::Executing]);
    assert!(validate_transition(FlowState::Retry, FlowState::Completed).is_err());
}

#[test]
fn test_terminal_states() {
    for state in [
        FlowState::WaitingConfirmation,
        FlowState::Guarded,
        FlowState::Completed,
    ] {
        assert!(state.is_terminal());
    }
    assert!(!FlowState::Executing.is_terminal());
}

proptest! {
    #[test]
    fn prop_all_transitions_are_subset_of_allowed(from in any_state(), to in any_state()) {
        let res = validate_transition(from, to);
        prop_assert_eq!(res.is_ok(), allowed_transitions(from).contains(&to));
    }

    #[test]
    fn prop_machine_history_only_holds_legal_steps(steps in prop::collection::vec(any_state(), 0..12)) {
        let mut machine = FlowMachine::new();
        for to in steps {
            let before = machine.state();
            let legal = allowed_transitions(before).contains(&to);
            prop_assert_eq!(machine.advance(to).is_ok(), legal);
            if !legal {
                prop_assert_eq!(machine.state(), before);
            }
        }
        for pair in machine.history().windows(2) {
            prop_assert!(validate_transition(pair[0], pair[1]).is_ok());
        }
        prop_assert_eq!(machine.history()[0], FlowState::Planning);
    }
}
