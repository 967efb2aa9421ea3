//! Consensus selection over parallel candidates.
//!
//! Two strategies: a deterministic heuristic score over the diff itself, and
//! reviewer voting that blends the heuristic with a reviewer agent's score.
//! The reviewer weighting is fixed at 0.6 heuristic / 0.4 reviewer.

use anyhow::{Result, bail};
use serde_json::json;

use crate::agents::reviewer::Verdict;
use crate::diff::{diff_stats, quick_validate};

use super::AgentCandidate;

const HEURISTIC_WEIGHT: f64 = 0.6;
const REVIEWER_WEIGHT: f64 = 0.4;

/// Access to the fields the heuristic scorer needs. Implemented by the
/// coder and fixer outputs.
pub trait DiffOutput {
    fn diff(&self) -> &str;
    fn commit_message(&self) -> &str;
}

impl DiffOutput for crate::agents::coder::CoderOutput {
    fn diff(&self) -> &str {
        &self.diff
    }
    fn commit_message(&self) -> &str {
        &self.commit_message
    }
}

impl DiffOutput for crate::agents::fixer::FixerOutput {
    fn diff(&self) -> &str {
        &self.diff
    }
    fn commit_message(&self) -> &str {
        &self.commit_message
    }
}

/// A reviewer's vote on one candidate.
#[derive(Debug, Clone)]
pub struct ReviewerVote {
    pub verdict: Verdict,
    pub score: f64,
    pub comments: Vec<String>,
}

/// The selected winner plus full provenance.
#[derive(Debug)]
pub struct ConsensusResult<T> {
    pub winner_index: usize,
    pub candidates: Vec<AgentCandidate<T>>,
    /// One score per candidate; errored candidates score 0.
    pub scores: Vec<f64>,
    pub reviewer_votes: Option<Vec<Option<ReviewerVote>>>,
    pub reason: String,
    pub total_tokens: i64,
    pub total_duration_ms: i64,
}

impl<T> ConsensusResult<T> {
    pub fn winner(&self) -> &AgentCandidate<T> {
        &self.candidates[self.winner_index]
    }

    /// Per-candidate provenance for the CONSENSUS_DECISION event.
    pub fn provenance(&self) -> serde_json::Value {
        let candidates: Vec<serde_json::Value> = self
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                json!({
                    "index": c.index,
                    "model": c.model,
                    "succeeded": c.succeeded(),
                    "error": c.error,
                    "tokens": c.tokens,
                    "duration_ms": c.duration_ms,
                    "score": self.scores.get(i),
                    "winner": i == self.winner_index,
                })
            })
            .collect();
        json!({
            "strategy_reason": self.reason,
            "candidates": candidates,
            "total_tokens": self.total_tokens,
            "total_duration_ms": self.total_duration_ms,
        })
    }

    /// Markdown summary rendered into the PR body.
    pub fn render_report(&self) -> String {
        let mut out = String::from("### Multi-agent consensus\n\n");
        out.push_str("| candidate | model | score | outcome |\n");
        out.push_str("|---|---|---|---|\n");
        for (i, c) in self.candidates.iter().enumerate() {
            let outcome = if i == self.winner_index {
                "**winner**"
            } else if c.succeeded() {
                "not selected"
            } else {
                "errored"
            };
            out.push_str(&format!(
                "| {} | {} | {:.3} | {} |\n",
                i + 1,
                c.model,
                self.scores.get(i).copied().unwrap_or(0.0),
                outcome
            ));
        }
        out.push_str(&format!("\n{}\n", self.reason));
        out
    }
}

/// Deterministic quality score for a candidate diff, in `[0, 1]`.
///
/// Rewards structural cleanliness, a moderate diff size over a small file
/// set, a conventional commit message, and a sane addition/deletion
/// balance.
pub fn heuristic_score(diff: &str, commit_message: &str) -> f64 {
    let report = quick_validate(diff);
    let stats = diff_stats(diff);

    // Structure: 0.35. Invalid diffs bottom out; warnings shave points.
    let structure: f64 = if !report.valid() {
        0.0
    } else {
        (0.35 - 0.05 * report.warnings.len() as f64).max(0.1)
    };

    // Size: 0.25. Ideal band is 5..=300 changed lines.
    let changed = (stats.additions + stats.deletions) as f64;
    let size = if changed == 0.0 {
        0.0
    } else if (5.0..=300.0).contains(&changed) {
        0.25
    } else if changed < 5.0 {
        0.15
    } else {
        // Large diffs decay toward zero.
        (0.25 * (600.0 - changed).max(0.0) / 300.0).min(0.25)
    };

    // File count: 0.15. One to three files is the sweet spot.
    let files = stats.files as f64;
    let file_score = if files == 0.0 {
        0.0
    } else if files <= 3.0 {
        0.15
    } else {
        (0.15 * (8.0 - files).max(0.0) / 5.0).min(0.15)
    };

    // Commit message: 0.15.
    let first_line = commit_message.lines().next().unwrap_or("");
    let mut message = 0.0;
    if (10..=72).contains(&first_line.len()) {
        message += 0.10;
    } else if !first_line.is_empty() {
        message += 0.05;
    }
    if first_line
        .split_once(':')
        .map(|(prefix, _)| {
            matches!(
                prefix.trim_end_matches(|c| c == '!' || c == ')').split('(').next(),
                Some("feat") | Some("fix") | Some("refactor") | Some("docs") | Some("test")
                    | Some("chore") | Some("perf") | Some("build") | Some("ci")
            )
        })
        .unwrap_or(false)
    {
        message += 0.05;
    }

    // Balance: 0.10. Penalize pure-deletion or pathological ratios.
    let balance = if stats.additions == 0 && stats.deletions > 20 {
        0.02
    } else {
        0.10
    };

    structure + size + file_score + message + balance
}

/// Score strategy: highest heuristic score wins, ties to the lower index.
pub fn select_by_score<T: DiffOutput>(
    candidates: Vec<AgentCandidate<T>>,
) -> Result<ConsensusResult<T>> {
    let scores: Vec<f64> = candidates
        .iter()
        .map(|c| match &c.output {
            Some(output) => heuristic_score(output.diff(), output.commit_message()),
            None => 0.0,
        })
        .collect();

    let winner_index = argmax_successful(&candidates, &scores)?;

    let total_tokens = candidates.iter().map(|c| c.tokens).sum();
    let total_duration_ms = candidates.iter().map(|c| c.duration_ms).sum();
    let reason = format!(
        "score strategy: candidate {} ({}) scored {:.3}, best of {} candidate(s)",
        winner_index + 1,
        candidates[winner_index].model,
        scores[winner_index],
        candidates.len()
    );

    Ok(ConsensusResult {
        winner_index,
        candidates,
        scores,
        reviewer_votes: None,
        reason,
        total_tokens,
        total_duration_ms,
    })
}

/// Reviewer strategy: combine the heuristic with a reviewer vote per
/// candidate. A candidate whose verdict is REQUEST_CHANGES only wins when
/// no candidate escaped that verdict.
pub fn select_by_reviewer<T: DiffOutput>(
    candidates: Vec<AgentCandidate<T>>,
    votes: Vec<Option<ReviewerVote>>,
) -> Result<ConsensusResult<T>> {
    let scores: Vec<f64> = candidates
        .iter()
        .zip(votes.iter())
        .map(|(c, vote)| match (&c.output, vote) {
            (Some(output), Some(vote)) => {
                HEURISTIC_WEIGHT * heuristic_score(output.diff(), output.commit_message())
                    + REVIEWER_WEIGHT * vote.score.clamp(0.0, 1.0)
            }
            (Some(output), None) => {
                // No vote came back; fall back to the heuristic alone.
                HEURISTIC_WEIGHT * heuristic_score(output.diff(), output.commit_message())
            }
            (None, _) => 0.0,
        })
        .collect();

    let not_rejected = |i: &usize| {
        !matches!(
            votes[*i].as_ref().map(|v| v.verdict),
            Some(Verdict::RequestChanges)
        )
    };

    let eligible: Vec<usize> = (0..candidates.len())
        .filter(|i| candidates[*i].succeeded())
        .filter(not_rejected)
        .collect();

    let winner_index = if eligible.is_empty() {
        argmax_successful(&candidates, &scores)?
    } else {
        *eligible
            .iter()
            .max_by(|a, b| {
                scores[**a]
                    .partial_cmp(&scores[**b])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // On a tie, prefer the lower index.
                    .then(b.cmp(a))
            })
            .expect("eligible set is non-empty")
    };

    let total_tokens = candidates.iter().map(|c| c.tokens).sum();
    let total_duration_ms = candidates.iter().map(|c| c.duration_ms).sum();
    let verdict = votes[winner_index].as_ref().map(|v| v.verdict);
    let reason = format!(
        "reviewer strategy: candidate {} ({}) combined score {:.3}, verdict {:?}",
        winner_index + 1,
        candidates[winner_index].model,
        scores[winner_index],
        verdict
    );

    Ok(ConsensusResult {
        winner_index,
        candidates,
        scores,
        reviewer_votes: Some(votes),
        reason,
        total_tokens,
        total_duration_ms,
    })
}

/// Index of the best-scoring successful candidate; ties go to the lower
/// index because the scan keeps the first strict maximum.
fn argmax_successful<T>(candidates: &[AgentCandidate<T>], scores: &[f64]) -> Result<usize> {
    let mut best: Option<usize> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        if !candidate.succeeded() {
            continue;
        }
        match best {
            None => best = Some(i),
            Some(b) if scores[i] > scores[b] => best = Some(i),
            _ => {}
        }
    }
    match best {
        Some(i) => Ok(i),
        None => bail!("all {} candidates failed", candidates.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::coder::CoderOutput;

    const CLEAN_DIFF: &str = "\
--- a/src/a.ts
+++ b/src/a.ts
@@ -1,2 +1,3 @@
 const a = 1;
+const b = 2;
 export { a };
";

    fn candidate(index: usize, diff: &str, message: &str) -> AgentCandidate<CoderOutput> {
        AgentCandidate {
            index,
            model: format!("model-{index}"),
            output: Some(CoderOutput {
                diff: diff.to_owned(),
                commit_message: message.to_owned(),
                files_modified: None,
                notes: None,
            }),
            error: None,
            tokens: 100,
            duration_ms: 10,
        }
    }

    fn errored(index: usize) -> AgentCandidate<CoderOutput> {
        AgentCandidate {
            index,
            model: format!("model-{index}"),
            output: None,
            error: Some("timed out".into()),
            tokens: 0,
            duration_ms: 0,
        }
    }

    #[test]
    fn clean_diff_outscores_corrupt_diff() {
        let clean = heuristic_score(CLEAN_DIFF, "feat: add b");
        let corrupt = heuristic_score("not a diff at all", "feat: add b");
        assert!(clean > corrupt);
        assert!((0.0..=1.0).contains(&clean));
    }

    #[test]
    fn conventional_commit_message_scores_higher() {
        let good = heuristic_score(CLEAN_DIFF, "fix(parser): handle empty hunks");
        let bad = heuristic_score(CLEAN_DIFF, "wip");
        assert!(good > bad);
    }

    #[test]
    fn score_strategy_picks_best_and_sums_provenance() {
        let candidates = vec![
            candidate(0, "garbage", "wip"),
            candidate(1, CLEAN_DIFF, "feat: add b"),
            errored(2),
        ];
        let result = select_by_score(candidates).unwrap();
        assert_eq!(result.winner_index, 1);
        assert!(result.winner().succeeded());
        assert_eq!(result.total_tokens, 200);
        assert_eq!(result.scores.len(), 3);
        assert_eq!(result.scores[2], 0.0);
    }

    #[test]
    fn score_ties_break_to_lower_index() {
        let candidates = vec![
            candidate(0, CLEAN_DIFF, "feat: add b"),
            candidate(1, CLEAN_DIFF, "feat: add b"),
        ];
        let result = select_by_score(candidates).unwrap();
        assert_eq!(result.winner_index, 0);
    }

    #[test]
    fn all_failed_is_an_error() {
        let candidates: Vec<AgentCandidate<CoderOutput>> = vec![errored(0), errored(1)];
        assert!(select_by_score(candidates).is_err());
    }

    #[test]
    fn reviewer_strategy_demotes_request_changes() {
        let candidates = vec![
            candidate(0, CLEAN_DIFF, "feat: add b"),
            candidate(1, CLEAN_DIFF, "feat: add b"),
        ];
        let votes = vec![
            Some(ReviewerVote {
                verdict: Verdict::RequestChanges,
                score: 0.95,
                comments: vec![],
            }),
            Some(ReviewerVote {
                verdict: Verdict::Approve,
                score: 0.5,
                comments: vec![],
            }),
        ];
        let result = select_by_reviewer(candidates, votes).unwrap();
        // Candidate 0 has the higher combined score but was rejected.
        assert_eq!(result.winner_index, 1);
    }

    #[test]
    fn reviewer_strategy_falls_back_when_all_rejected() {
        let candidates = vec![
            candidate(0, CLEAN_DIFF, "feat: add b"),
            candidate(1, "garbage", "wip"),
        ];
        let votes = vec![
            Some(ReviewerVote {
                verdict: Verdict::RequestChanges,
                score: 0.4,
                comments: vec![],
            }),
            Some(ReviewerVote {
                verdict: Verdict::RequestChanges,
                score: 0.2,
                comments: vec![],
            }),
        ];
        let result = select_by_reviewer(candidates, votes).unwrap();
        assert_eq!(result.winner_index, 0);
    }

    #[test]
    fn provenance_marks_the_winner() {
        let candidates = vec![candidate(0, CLEAN_DIFF, "feat: add b"), errored(1)];
        let result = select_by_score(candidates).unwrap();
        let prov = result.provenance();
        assert_eq!(prov["candidates"][0]["winner"], true);
        assert_eq!(prov["candidates"][1]["winner"], false);
        assert_eq!(prov["total_tokens"], 100);

        let report = result.render_report();
        assert!(report.contains("**winner**"));
        assert!(report.contains("errored"));
    }
}
