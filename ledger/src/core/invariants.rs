//! History invariants not enforceable by a single write.

use crate::core::graph::{INITIAL_STATE, is_legal};
use crate::core::types::{StateTransition, Task};

/// Check that a task's transition history is a valid walk of the state graph:
/// - The first record is `none -> PLANNING`
/// - Every later record has a `from` equal to the previous `to`
/// - Every later edge is legal
/// - Sequence numbers strictly increase
///
/// When `task` is given, the last `to` must also match its stored state.
pub fn validate_walk(transitions: &[StateTransition], task: Option<&Task>) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(first) = transitions.first() else {
        errors.push("history is empty".to_string());
        return errors;
    };
    if first.from.is_some() || first.to != INITIAL_STATE {
        errors.push(format!(
            "seq {}: history must start with none -> {}",
            first.seq, INITIAL_STATE
        ));
    }

    for pair in transitions.windows(2) {
        let prev = &pair[0];
        let next = &pair[1];
        if next.seq <= prev.seq {
            errors.push(format!(
                "seq {}: sequence does not increase after {}",
                next.seq, prev.seq
            ));
        }
        match next.from {
            None => errors.push(format!("seq {}: missing from-state", next.seq)),
            Some(from) if from != prev.to => errors.push(format!(
                "seq {}: from {} does not continue previous to {}",
                next.seq, from, prev.to
            )),
            Some(from) if !is_legal(from, next.to) => errors.push(format!(
                "seq {}: illegal edge {} -> {}",
                next.seq, from, next.to
            )),
            Some(_) => {}
        }
    }

    if let (Some(task), Some(last)) = (task, transitions.last()) {
        if task.state != last.to {
            errors.push(format!(
                "task {} stored state {} differs from last transition {}",
                task.id, task.state, last.to
            ));
        }
    }

    errors
}
