//! Property-based checks over both transition tables.

use proptest::prelude::*;

use asset_provisioner::payload::TaskType;
use asset_provisioner::pipeline::{PipelineDefinition, PipelineError, PipelineKind, StepOutcome};

fn pipeline_strategy() -> impl Strategy<Value = PipelineKind> {
    prop_oneof![Just(PipelineKind::Hub), Just(PipelineKind::Spoke)]
}

fn state_strategy() -> impl Strategy<Value = TaskType> {
    prop::sample::select(TaskType::ALL.to_vec())
}

fn outcome_strategy() -> impl Strategy<Value = StepOutcome> {
    prop::sample::select(StepOutcome::ALL.to_vec())
}

/// Outcomes that leave `state` for a different state.
fn forward_outcomes(definition: &PipelineDefinition, state: TaskType) -> Vec<StepOutcome> {
    definition
        .transitions
        .iter()
        .filter(|tr| tr.from == state && tr.to != state)
        .map(|tr| tr.on)
        .collect()
}

proptest! {
    #[test]
    fn next_stays_inside_the_pipeline(
        kind in pipeline_strategy(),
        state in state_strategy(),
        outcome in outcome_strategy(),
    ) {
        let definition = kind.definition();
        match definition.next(state, outcome) {
            Ok(Some(next)) => {
                prop_assert!(definition.contains(next));
                prop_assert!(!state.is_terminal());
            }
            Ok(None) => prop_assert!(state.is_terminal()),
            Err(PipelineError::UnknownState { .. }) => prop_assert!(!definition.contains(state)),
            Err(PipelineError::NoTransition { outcome: failed_on, .. }) => {
                prop_assert_ne!(failed_on, StepOutcome::Failed);
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    #[test]
    fn failure_always_routes_to_failed(kind in pipeline_strategy(), state in state_strategy()) {
        let definition = kind.definition();
        prop_assume!(definition.contains(state) && !state.is_terminal());
        prop_assert_eq!(
            definition.next(state, StepOutcome::Failed).unwrap(),
            Some(TaskType::Failed),
        );
    }

    #[test]
    fn forward_walks_reach_complete(
        kind in pipeline_strategy(),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 32),
    ) {
        let definition = kind.definition();
        let mut state = definition.initial;
        let limit = definition.states().len();
        let mut steps = 0;

        while !state.is_terminal() {
            let choices = forward_outcomes(&definition, state);
            prop_assert!(!choices.is_empty(), "{} has no way forward", state);
            let outcome = *picks[steps % picks.len()].get(&choices);
            state = definition.next(state, outcome).unwrap().unwrap();
            steps += 1;
            prop_assert!(steps <= limit, "walk did not terminate");
        }
        prop_assert_eq!(state, TaskType::Complete);
    }

    #[test]
    fn running_only_loops_on_poll_states(kind in pipeline_strategy(), state in state_strategy()) {
        let definition = kind.definition();
        if let Ok(Some(next)) = definition.next(state, StepOutcome::Running) {
            prop_assert_eq!(next, state);
            prop_assert!(definition.is_poll_state(state));
        }
    }
}

#[test]
fn hub_and_spoke_share_only_terminals() {
    let hub = PipelineKind::Hub.definition();
    let spoke = PipelineKind::Spoke.definition();
    for state in hub.states() {
        if spoke.contains(state) {
            assert!(state.is_terminal(), "{state} appears in both pipelines");
        }
    }
}
