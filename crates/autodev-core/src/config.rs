//! Engine configuration, read from the environment once at startup.
//!
//! Credentials are held in memory and never logged; the `Debug` impl on
//! [`EngineConfig`] redacts them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::policy::Effort;

/// How the multi-agent runner picks a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsensusStrategy {
    /// Deterministic heuristic scoring only.
    #[default]
    Score,
    /// Reviewer agent votes combined with the heuristic score.
    Reviewer,
}

impl FromStr for ConsensusStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "score" => Ok(Self::Score),
            "reviewer" => Ok(Self::Reviewer),
            other => Err(format!("invalid consensus strategy: {other:?}")),
        }
    }
}

/// Multi-agent runner configuration (spec: `MULTI_AGENT_*` variables).
#[derive(Debug, Clone)]
pub struct MultiAgentConfig {
    pub enabled: bool,
    pub coder_count: usize,
    pub fixer_count: usize,
    pub coder_models: Vec<String>,
    pub fixer_models: Vec<String>,
    pub consensus_strategy: ConsensusStrategy,
    pub timeout: Duration,
}

impl MultiAgentConfig {
    /// Hard cap on parallel candidates per phase.
    pub const MAX_CANDIDATES: usize = 4;

    fn from_env() -> Self {
        let enabled = env_bool("MULTI_AGENT_MODE", false);
        let coder_count =
            env_usize("MULTI_AGENT_CODER_COUNT", 2).min(Self::MAX_CANDIDATES);
        let fixer_count =
            env_usize("MULTI_AGENT_FIXER_COUNT", 2).min(Self::MAX_CANDIDATES);
        let coder_models = env_csv("MULTI_AGENT_CODER_MODELS");
        let fixer_models = env_csv("MULTI_AGENT_FIXER_MODELS");
        let consensus_strategy = std::env::var("MULTI_AGENT_CONSENSUS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let timeout = Duration::from_millis(env_u64("MULTI_AGENT_TIMEOUT_MS", 180_000));

        Self {
            enabled,
            coder_count,
            fixer_count,
            coder_models,
            fixer_models,
            consensus_strategy,
            timeout,
        }
    }
}

/// Provider and collaborator credentials.
#[derive(Clone, Default)]
pub struct Credentials {
    pub github_token: Option<String>,
    pub linear_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn mark(v: &Option<String>) -> &'static str {
            if v.is_some() { "<set>" } else { "<unset>" }
        }
        f.debug_struct("Credentials")
            .field("github_token", &mark(&self.github_token))
            .field("linear_api_key", &mark(&self.linear_api_key))
            .field("anthropic_api_key", &mark(&self.anthropic_api_key))
            .field("openai_api_key", &mark(&self.openai_api_key))
            .field("openrouter_api_key", &mark(&self.openrouter_api_key))
            .finish()
    }
}

/// Full engine configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub multi_agent: MultiAgentConfig,
    /// Run the full diff validator (clone + typecheck) after the quick pass.
    pub validate_diff: bool,
    /// Expand planner target files along the repo import graph.
    pub expand_imports: bool,
    pub import_depth: usize,
    pub max_related_files: usize,
    /// Run local tests through the foreman before waiting on CI.
    pub use_foreman: bool,
    pub foreman_max_attempts: u32,
    /// Feed failure modes and fix patterns through the learning store.
    pub enable_learning: bool,
    /// Comment on the source issue when a task fails terminally.
    pub comment_on_failure: bool,
    /// Spend level for first-attempt model selection.
    pub effort: Effort,
    /// Hard cap on coder/fixer diff size, in lines.
    pub max_diff_lines: usize,
    /// Attempt budget for new tasks.
    pub default_max_attempts: i32,
    /// How long the TEST phase waits for a CI conclusion before parking the
    /// task in TESTING for the check_run webhook to wake it.
    pub ci_wait_timeout: Duration,
    pub credentials: Credentials,
}

impl EngineConfig {
    /// Read the whole configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            multi_agent: MultiAgentConfig::from_env(),
            validate_diff: env_bool("VALIDATE_DIFF", true),
            expand_imports: env_bool("EXPAND_IMPORTS", true),
            import_depth: env_usize("IMPORT_DEPTH", 1),
            max_related_files: env_usize("MAX_RELATED_FILES", 5),
            use_foreman: env_bool("USE_FOREMAN", false),
            foreman_max_attempts: env_u64("FOREMAN_MAX_ATTEMPTS", 2) as u32,
            enable_learning: env_bool("ENABLE_LEARNING", false),
            comment_on_failure: env_bool("COMMENT_ON_FAILURE", true),
            effort: std::env::var("MODEL_EFFORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            max_diff_lines: env_usize("MAX_DIFF_LINES", 1500),
            default_max_attempts: env_u64("MAX_ATTEMPTS", 3) as i32,
            ci_wait_timeout: Duration::from_secs(env_u64("CI_WAIT_TIMEOUT_SECS", 600)),
            credentials: Credentials {
                github_token: env_opt("GITHUB_TOKEN"),
                linear_api_key: env_opt("LINEAR_API_KEY"),
                anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
                openai_api_key: env_opt("OPENAI_API_KEY"),
                openrouter_api_key: env_opt("OPENROUTER_API_KEY"),
            },
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            multi_agent: MultiAgentConfig {
                enabled: false,
                coder_count: 2,
                fixer_count: 2,
                coder_models: Vec::new(),
                fixer_models: Vec::new(),
                consensus_strategy: ConsensusStrategy::Score,
                timeout: Duration::from_millis(180_000),
            },
            validate_diff: true,
            expand_imports: true,
            import_depth: 1,
            max_related_files: 5,
            use_foreman: false,
            foreman_max_attempts: 2,
            enable_learning: false,
            comment_on_failure: true,
            effort: Effort::Medium,
            max_diff_lines: 1500,
            default_max_attempts: 3,
            ci_wait_timeout: Duration::from_secs(600),
            credentials: Credentials::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_strategy_parse() {
        assert_eq!(
            "score".parse::<ConsensusStrategy>().unwrap(),
            ConsensusStrategy::Score
        );
        assert_eq!(
            "reviewer".parse::<ConsensusStrategy>().unwrap(),
            ConsensusStrategy::Reviewer
        );
        assert!("votes".parse::<ConsensusStrategy>().is_err());
    }

    #[test]
    fn credentials_debug_redacts() {
        let creds = Credentials {
            github_token: Some("ghp_secret".into()),
            ..Default::default()
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("ghp_secret"));
        assert!(debug.contains("<set>"));
    }

    #[test]
    fn defaults_are_spec_defaults() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate_diff);
        assert!(cfg.expand_imports);
        assert!(!cfg.multi_agent.enabled);
        assert_eq!(cfg.default_max_attempts, 3);
    }
}
