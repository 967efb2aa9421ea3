//! Model selection policy.
//!
//! Pure functions mapping (complexity, effort, attempt) to a model tier.
//! The escalation direction is the contract: retries always move to a
//! stronger (or differently-provisioned) model, and L/XL work is never
//! attempted directly -- it must be decomposed first.

use autodev_db::models::Complexity;

// Model ids per tier. Tunable, but the escalation ordering must hold.
const CHEAP: &str = "claude-haiku-4-5";
const FAST: &str = "gpt-5-mini";
const MID: &str = "gpt-5";
const QUALITY: &str = "claude-sonnet-4-5";
const PREMIUM: &str = "claude-opus-4-1";
/// Cheap reasoning model used for the first retry.
const RECOVERY: &str = "gpt-5-mini";
/// Second recovery model; the fixer alternates to spread provider load.
const RECOVERY_ALT: &str = "claude-haiku-4-5";
/// Last-resort premium model once cheaper retries have failed.
const FALLBACK: &str = "claude-opus-4-1";

/// How much the caller wants to spend on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
}

impl std::str::FromStr for Effort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("invalid effort: {other:?}")),
        }
    }
}

/// Planning, breakdown, and review always run on the quality model; their
/// output steers everything downstream, so skimping there is false economy.
pub fn planner_model() -> &'static str {
    QUALITY
}

pub fn breakdown_model() -> &'static str {
    QUALITY
}

pub fn reviewer_model() -> &'static str {
    QUALITY
}

/// Reflection is a cheap judgment call.
pub fn reflection_model() -> &'static str {
    FAST
}

/// Named rung of the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Economy,
    Fast,
    Standard,
    Quality,
    Premium,
    /// First-retry tier: cheap reasoning models.
    Recovery,
    /// Retries beyond the first: premium fallback.
    Fallback,
    /// L/XL issues are not attempted; they must be broken down.
    Decompose,
}

/// The outcome of a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub tier: ModelTier,
    pub models: Vec<String>,
    pub use_multi_agent: bool,
    pub reason: String,
}

impl Selection {
    fn single(tier: ModelTier, model: &str, reason: impl Into<String>) -> Self {
        Self {
            tier,
            models: vec![model.to_owned()],
            use_multi_agent: false,
            reason: reason.into(),
        }
    }

    /// The primary model of this selection.
    pub fn model(&self) -> &str {
        self.models.first().map(String::as_str).unwrap_or(QUALITY)
    }
}

/// Select the coder model for a task.
pub fn select(complexity: Complexity, effort: Effort, attempt: u32) -> Selection {
    use Complexity::*;

    if matches!(complexity, L | Xl) {
        return Selection {
            tier: ModelTier::Decompose,
            models: Vec::new(),
            use_multi_agent: false,
            reason: format!("complexity {complexity} requires decomposition into subtasks"),
        };
    }

    match attempt {
        0 => first_attempt(complexity, effort),
        1 => Selection::single(
            ModelTier::Recovery,
            RECOVERY,
            "first retry: cheap reasoning recovery model",
        ),
        _ => Selection::single(
            ModelTier::Fallback,
            FALLBACK,
            format!("attempt {attempt}: premium fallback"),
        ),
    }
}

fn first_attempt(complexity: Complexity, effort: Effort) -> Selection {
    use Complexity::*;
    use Effort::*;

    let (tier, model) = match (complexity, effort) {
        (Xs, Low) | (Xs, Medium) => (ModelTier::Economy, CHEAP),
        (Xs, High) => (ModelTier::Quality, QUALITY),
        (S, Low) => (ModelTier::Fast, FAST),
        (S, Medium) => (ModelTier::Standard, MID),
        (S, High) => (ModelTier::Quality, QUALITY),
        (M, Low) => (ModelTier::Standard, MID),
        (M, Medium) => (ModelTier::Quality, QUALITY),
        (M, High) => (ModelTier::Premium, PREMIUM),
        // L/XL handled by the caller.
        (L, _) | (Xl, _) => (ModelTier::Decompose, QUALITY),
    };

    // Parallel candidates pay off on S/M first attempts; XS issues are too
    // small to benefit and L/XL never get here.
    let use_multi_agent = matches!(complexity, S | M);

    Selection {
        tier,
        models: vec![model.to_owned()],
        use_multi_agent,
        reason: format!("complexity {complexity}, {effort:?} effort, first attempt"),
    }
}

/// Select the fixer model, alternating between the two recovery models by
/// attempt parity to spread provider load.
pub fn select_fixer(attempt: u32) -> Selection {
    let model = if attempt % 2 == 0 { RECOVERY } else { RECOVERY_ALT };
    Selection::single(
        ModelTier::Recovery,
        model,
        format!("fixer attempt {attempt}: alternating recovery model"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodev_db::models::Complexity::*;

    #[test]
    fn xs_ladder() {
        assert_eq!(select(Xs, Effort::Low, 0).tier, ModelTier::Economy);
        assert_eq!(select(Xs, Effort::Medium, 0).tier, ModelTier::Economy);
        assert_eq!(select(Xs, Effort::High, 0).tier, ModelTier::Quality);
        assert_eq!(select(Xs, Effort::Low, 1).tier, ModelTier::Recovery);
        assert_eq!(select(Xs, Effort::Low, 2).tier, ModelTier::Fallback);
        assert_eq!(select(Xs, Effort::Low, 5).tier, ModelTier::Fallback);
    }

    #[test]
    fn s_and_m_escalate_with_effort() {
        assert_eq!(select(S, Effort::Low, 0).tier, ModelTier::Fast);
        assert_eq!(select(S, Effort::Medium, 0).tier, ModelTier::Standard);
        assert_eq!(select(S, Effort::High, 0).tier, ModelTier::Quality);
        assert_eq!(select(M, Effort::Low, 0).tier, ModelTier::Standard);
        assert_eq!(select(M, Effort::Medium, 0).tier, ModelTier::Quality);
        assert_eq!(select(M, Effort::High, 0).tier, ModelTier::Premium);
    }

    #[test]
    fn retries_escalate_regardless_of_effort() {
        for effort in [Effort::Low, Effort::Medium, Effort::High] {
            assert_eq!(select(M, effort, 1).tier, ModelTier::Recovery);
            assert_eq!(select(M, effort, 2).tier, ModelTier::Fallback);
        }
    }

    #[test]
    fn large_issues_require_decomposition() {
        for complexity in [L, Xl] {
            for attempt in 0..3 {
                let sel = select(complexity, Effort::Medium, attempt);
                assert_eq!(sel.tier, ModelTier::Decompose);
                assert!(sel.models.is_empty());
                assert!(!sel.use_multi_agent);
            }
        }
    }

    #[test]
    fn multi_agent_only_for_s_and_m_first_attempts() {
        assert!(!select(Xs, Effort::Medium, 0).use_multi_agent);
        assert!(select(S, Effort::Medium, 0).use_multi_agent);
        assert!(select(M, Effort::Medium, 0).use_multi_agent);
        assert!(!select(M, Effort::Medium, 1).use_multi_agent);
        assert!(!select(L, Effort::Medium, 0).use_multi_agent);
    }

    #[test]
    fn fixer_alternates_models() {
        let a = select_fixer(0);
        let b = select_fixer(1);
        let c = select_fixer(2);
        assert_ne!(a.models, b.models);
        assert_eq!(a.models, c.models);
        assert_eq!(a.tier, ModelTier::Recovery);
    }
}
