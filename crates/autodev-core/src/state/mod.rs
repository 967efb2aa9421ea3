//! Task state machine.
//!
//! Pure functions over [`TaskStatus`]: edge validity, the next action for a
//! status, and terminality. The DB-backed application of validated
//! transitions lives in [`store`].

pub mod store;

use autodev_db::models::TaskStatus;

/// What the orchestrator should do next for a task in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Plan,
    Breakdown,
    Orchestrate,
    Code,
    Test,
    Fix,
    Reflect,
    Replan,
    Review,
    OpenPr,
    Wait,
    Done,
    Failed,
}

/// Error returned by [`transition`] for an edge outside the table.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid state transition: {from} -> {to} (allowed from {from}: {allowed:?})")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub allowed: Vec<TaskStatus>,
}

/// Check whether `from -> to` is a valid edge in the state graph.
///
/// Every non-terminal status may additionally transition to `Failed`.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    if to == Failed {
        return !is_terminal(from);
    }

    matches!(
        (from, to),
        (New, Planning)
            | (Planning, PlanningDone)
            | (PlanningDone, Coding)
            | (PlanningDone, BreakingDown)
            | (BreakingDown, BreakdownDone)
            | (BreakdownDone, Orchestrating)
            | (Orchestrating, Orchestrating)
            | (Orchestrating, TestsPassed)
            | (Coding, CodingDone)
            | (CodingDone, Testing)
            | (Testing, TestsPassed)
            | (Testing, TestsFailed)
            | (TestsFailed, Fixing)
            | (TestsFailed, Reflecting)
            | (Fixing, CodingDone)
            | (Reflecting, Replanning)
            | (Reflecting, Fixing)
            | (Replanning, Coding)
            | (TestsPassed, Reviewing)
            | (Reviewing, ReviewApproved)
            | (Reviewing, ReviewRejected)
            | (ReviewApproved, PrCreated)
            | (ReviewRejected, Coding)
            | (PrCreated, WaitingHuman)
            | (WaitingHuman, Completed)
            | (WaitingHuman, ReviewRejected)
    )
}

/// All statuses reachable from `from` in one step.
pub fn allowed_from(from: TaskStatus) -> Vec<TaskStatus> {
    TaskStatus::ALL
        .iter()
        .copied()
        .filter(|to| can_transition(from, *to))
        .collect()
}

/// Validate a transition, returning the target status or a typed error.
pub fn transition(from: TaskStatus, to: TaskStatus) -> Result<TaskStatus, InvalidTransition> {
    if can_transition(from, to) {
        Ok(to)
    } else {
        Err(InvalidTransition {
            from,
            to,
            allowed: allowed_from(from),
        })
    }
}

/// Whether a status has no outgoing edges.
pub fn is_terminal(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Completed | TaskStatus::Failed)
}

/// Whether a status is waiting on an in-flight operation or external input.
///
/// Waiting tasks must not be re-driven until the operation finishes; the
/// driver's resume paths (CI polling, PR merge checks) are the only thing
/// that touches them.
pub fn is_waiting(status: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        status,
        Planning | BreakingDown | Coding | Testing | Fixing | Reviewing | PrCreated
            | WaitingHuman
    )
}

/// Map every status to the single action the driver takes for it.
///
/// Waiting statuses map to `Wait`. `Orchestrating`, `Reflecting`, and
/// `Replanning` are driveable on re-entry (the orchestrating self-edge
/// processes one subtask per invocation).
pub fn next_action(status: TaskStatus) -> NextAction {
    use TaskStatus::*;
    match status {
        New => NextAction::Plan,
        Planning => NextAction::Wait,
        PlanningDone => NextAction::Code,
        BreakingDown => NextAction::Wait,
        BreakdownDone => NextAction::Orchestrate,
        Orchestrating => NextAction::Orchestrate,
        Coding => NextAction::Wait,
        CodingDone => NextAction::Test,
        Testing => NextAction::Wait,
        TestsPassed => NextAction::Review,
        TestsFailed => NextAction::Fix,
        Fixing => NextAction::Wait,
        Reflecting => NextAction::Reflect,
        Replanning => NextAction::Replan,
        Reviewing => NextAction::Wait,
        ReviewApproved => NextAction::OpenPr,
        ReviewRejected => NextAction::Code,
        PrCreated => NextAction::Wait,
        WaitingHuman => NextAction::Wait,
        Completed => NextAction::Done,
        Failed => NextAction::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    /// The §4.1 edge list, spelled out for the closure test.
    const EDGES: &[(TaskStatus, TaskStatus)] = &[
        (New, Planning),
        (Planning, PlanningDone),
        (PlanningDone, Coding),
        (PlanningDone, BreakingDown),
        (BreakingDown, BreakdownDone),
        (BreakdownDone, Orchestrating),
        (Orchestrating, Orchestrating),
        (Orchestrating, TestsPassed),
        (Coding, CodingDone),
        (CodingDone, Testing),
        (Testing, TestsPassed),
        (Testing, TestsFailed),
        (TestsFailed, Fixing),
        (TestsFailed, Reflecting),
        (Fixing, CodingDone),
        (Reflecting, Replanning),
        (Reflecting, Fixing),
        (Replanning, Coding),
        (TestsPassed, Reviewing),
        (Reviewing, ReviewApproved),
        (Reviewing, ReviewRejected),
        (ReviewApproved, PrCreated),
        (ReviewRejected, Coding),
        (PrCreated, WaitingHuman),
        (WaitingHuman, Completed),
        (WaitingHuman, ReviewRejected),
    ];

    fn in_table(from: TaskStatus, to: TaskStatus) -> bool {
        EDGES.contains(&(from, to)) || (to == Failed && !is_terminal(from))
    }

    #[test]
    fn transition_closure_over_full_product() {
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                let expected = in_table(from, to);
                assert_eq!(
                    can_transition(from, to),
                    expected,
                    "can_transition({from}, {to}) disagreed with the edge table"
                );
                assert_eq!(
                    transition(from, to).is_ok(),
                    expected,
                    "transition({from}, {to}) disagreed with the edge table"
                );
            }
        }
    }

    #[test]
    fn invalid_transition_error_carries_allowed_set() {
        let err = transition(New, Coding).unwrap_err();
        assert_eq!(err.from, New);
        assert_eq!(err.to, Coding);
        assert!(err.allowed.contains(&Planning));
        assert!(err.allowed.contains(&Failed));
        assert!(!err.allowed.contains(&Coding));
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for status in [Completed, Failed] {
            assert!(is_terminal(status));
            for to in TaskStatus::ALL {
                assert!(
                    !can_transition(status, to),
                    "terminal {status} must not transition to {to}"
                );
            }
        }
        for status in TaskStatus::ALL {
            if status != Completed && status != Failed {
                assert!(!is_terminal(status));
            }
        }
    }

    #[test]
    fn every_nonterminal_can_fail() {
        for status in TaskStatus::ALL {
            if !is_terminal(status) {
                assert!(can_transition(status, Failed), "{status} must be able to fail");
            }
        }
    }

    #[test]
    fn next_action_is_total_and_wait_matches_waiting() {
        for status in TaskStatus::ALL {
            let action = next_action(status);
            assert_eq!(
                action == NextAction::Wait,
                is_waiting(status),
                "next_action({status}) = {action:?} disagrees with is_waiting"
            );
        }
    }

    #[test]
    fn driveable_ing_statuses() {
        assert_eq!(next_action(Orchestrating), NextAction::Orchestrate);
        assert_eq!(next_action(Reflecting), NextAction::Reflect);
        assert_eq!(next_action(Replanning), NextAction::Replan);
    }

    #[test]
    fn terminal_actions() {
        assert_eq!(next_action(Completed), NextAction::Done);
        assert_eq!(next_action(Failed), NextAction::Failed);
    }
}
