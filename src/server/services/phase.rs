use crate::server::models::chat::Phase;

const RATIONAL_AFTER_ROUNDS: i64 = 5;
const SOLUTION_AFTER_ROUNDS: i64 = 10;

/// Decides per-turn phase transitions. Evaluated once per turn, after the
/// round is counted, so the prompt used for generation reflects the new
/// phase when a transition fires.
pub struct PhaseManager {
    solution_triggers: Vec<String>,
}

impl PhaseManager {
    pub fn new(solution_triggers: Vec<String>) -> Self {
        Self { solution_triggers }
    }

    /// Returns the phase to move to, or `None` to stay put. Explicit
    /// solution-seeking language jumps straight to `Solution`; otherwise
    /// rounds advance `Emotional → Rational → Solution` and never backwards.
    pub fn evaluate(&self, current: Phase, round_count: i64, user_input: &str) -> Option<Phase> {
        let input = user_input.to_lowercase();
        if current != Phase::Solution
            && self
                .solution_triggers
                .iter()
                .any(|trigger| input.contains(trigger.as_str()))
        {
            return Some(Phase::Solution);
        }

        match current {
            Phase::Emotional if round_count > RATIONAL_AFTER_ROUNDS => Some(Phase::Rational),
            Phase::Rational if round_count > SOLUTION_AFTER_ROUNDS => Some(Phase::Solution),
            _ => None,
        }
    }
}
