//! The `ReasoningCoordinator` facade: ties VOI scoring, mode routing,
//! Tree-of-Thought exploration, and debate together into the operations the
//! rest of the core calls. Ported from `reasoning_coordinator.py`.

use aic_protocol::{Alternative, DebateVerdict, ReasoningMode, ReasoningResult, Verdict};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::mode_router::{ModeRouter, TaskSpec};
use crate::tot::beam_search;
use crate::voi::{AdaptiveVoi, VoiEstimator, VoiOutcome};

/// A decision already drafted by a caller (e.g. governance arbitration),
/// submitted to `debate_decision` for an up-or-down judgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedDecision {
    pub summary: String,
    pub confidence: f64,
    pub risk: f64,
}

/// One step of a `explore_solutions` walk. The sequence is fixed — every
/// exploration visits these four stages in order — but each stage is still
/// scored against the problem text, since a later gate (governance, a
/// human reviewer) may want to know which stage looked weakest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionStep {
    Analyze,
    Isolate,
    Patch,
    Refactor,
}

impl SolutionStep {
    fn label(self) -> &'static str {
        match self {
            SolutionStep::Analyze => "analyze",
            SolutionStep::Isolate => "isolate",
            SolutionStep::Patch => "patch",
            SolutionStep::Refactor => "refactor",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            SolutionStep::Analyze => &["understand", "diagnose", "root cause", "why"],
            SolutionStep::Isolate => &["isolate", "reproduce", "scope", "narrow"],
            SolutionStep::Patch => &["fix", "patch", "correct", "resolve"],
            SolutionStep::Refactor => &["refactor", "clean", "improve", "harden"],
        }
    }

    fn next(self) -> Option<SolutionStep> {
        match self {
            SolutionStep::Analyze => Some(SolutionStep::Isolate),
            SolutionStep::Isolate => Some(SolutionStep::Patch),
            SolutionStep::Patch => Some(SolutionStep::Refactor),
            SolutionStep::Refactor => None,
        }
    }

    fn score(self, problem_lower: &str) -> f64 {
        let hits = self.keywords().iter().filter(|kw| problem_lower.contains(*kw)).count();
        1.0 + hits as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SolutionExploration {
    pub steps: Vec<SolutionStep>,
    pub trace: Vec<String>,
    pub confidence: f64,
}

pub struct ReasoningCoordinator {
    voi: Mutex<AdaptiveVoi>,
    mode_router: ModeRouter,
}

impl ReasoningCoordinator {
    pub fn new(cost_weight: f64, risk_weight: f64) -> Self {
        Self {
            voi: Mutex::new(AdaptiveVoi::new(VoiEstimator::new(cost_weight, risk_weight))),
            mode_router: ModeRouter::new(),
        }
    }

    pub fn calculate_voi(&self, expected_gain: f64, expected_cost: f64, expected_risk: f64) -> f64 {
        self.voi.lock().estimate(expected_gain, expected_cost, expected_risk)
    }

    /// Feeds an observed cost/risk back into the adaptive estimator so
    /// future VOI calls account for systematic over/under-estimation.
    pub fn record_outcome(&self, outcome: VoiOutcome) {
        self.voi.lock().update(outcome);
    }

    pub fn route_reasoning_mode(&self, task: &TaskSpec) -> ReasoningMode {
        self.mode_router.route(task)
    }

    /// Scores every alternative by VOI, explores the top candidates with a
    /// beam search when the mode calls for it, runs an internal top-2
    /// debate under `Critical`, and synthesizes a confidence score and
    /// recommended action. Never fails: an empty `alternatives` falls back
    /// to a fixed-confidence heuristic result rather than erroring.
    #[instrument(skip(self, alternatives), fields(count = alternatives.len()))]
    pub fn reason_about_alternatives(
        &self,
        decision: &str,
        alternatives: &mut Vec<Alternative>,
        mode: ReasoningMode,
    ) -> ReasoningResult {
        if alternatives.is_empty() {
            tracing::warn!(decision, "no alternatives supplied, falling back to heuristic");
            return self.fallback_reasoning(decision);
        }

        let estimator = self.voi.lock().estimator();
        estimator.rank(alternatives);

        let mut trace = vec![format!("voi ranked {} alternatives", alternatives.len())];

        if matches!(mode, ReasoningMode::Deep | ReasoningMode::Critical) {
            let beam_width = alternatives.len().min(4);
            let best = beam_search(
                0usize,
                beam_width,
                2,
                |idx: &usize| {
                    let next = idx + 1;
                    if next < alternatives.len() {
                        vec![next]
                    } else {
                        vec![]
                    }
                },
                |idx: &usize| alternatives[*idx].voi.unwrap_or(f64::MIN),
            );
            trace.push(format!(
                "tree-of-thought explored beam_width={beam_width} depth=2, confirmed best index {}",
                best.state
            ));
        }

        let debate_verdict = if matches!(mode, ReasoningMode::Critical) && alternatives.len() >= 2 {
            let verdict = self.debate_alternatives(&alternatives[0], &alternatives[1]);
            trace.push(format!("debated top-2 alternatives: {:?}", verdict.verdict));
            Some(verdict)
        } else {
            None
        };

        let best_alternative = alternatives.first().cloned();
        let top_voi = best_alternative.as_ref().and_then(|a| a.voi).unwrap_or(0.0);
        let gap = if alternatives.len() >= 2 {
            top_voi - alternatives[1].voi.unwrap_or(0.0)
        } else {
            top_voi
        };

        let confidence = Self::synthesize_confidence(top_voi, gap, debate_verdict.as_ref());
        let recommended_action = aic_protocol::RecommendedAction::from_confidence(confidence);

        ReasoningResult {
            decision: decision.to_owned(),
            alternatives_explored: alternatives.len(),
            best_alternative,
            confidence,
            voi_score: top_voi,
            reasoning_trace: trace,
            debate_verdict,
            recommended_action,
        }
    }

    /// base 0.5, +0.2 if the top VOI clears 0.6, then a gap-based
    /// adjustment (+0.2 if the lead over the runner-up exceeds 0.2, -0.1 if
    /// it's under 0.05, else unchanged). If a debate ran, the result is
    /// averaged with the debate's own confidence. Clamped to [0, 1].
    fn synthesize_confidence(top_voi: f64, gap: f64, debate_verdict: Option<&DebateVerdict>) -> f64 {
        let mut confidence: f64 = 0.5;
        if top_voi >= 0.6 {
            confidence += 0.2;
        }
        if gap > 0.2 {
            confidence += 0.2;
        } else if gap < 0.05 {
            confidence -= 0.1;
        }

        if let Some(verdict) = debate_verdict {
            confidence = (confidence + verdict.confidence) / 2.0;
        }

        confidence.clamp(0.0, 1.0)
    }

    /// The internal top-2 debate run inside `reason_about_alternatives`,
    /// distinct from the standalone `debate_decision` judge: a lead over
    /// 0.2 VOI is `clear` (confidence 0.9), anything narrower is `marginal`
    /// (confidence 0.7).
    fn debate_alternatives(&self, top: &Alternative, runner_up: &Alternative) -> DebateVerdict {
        let gap = top.voi.unwrap_or(0.0) - runner_up.voi.unwrap_or(0.0);
        if gap > 0.2 {
            DebateVerdict { verdict: Verdict::Approved, confidence: 0.9, requires_revision: false }
        } else {
            DebateVerdict { verdict: Verdict::Conditional, confidence: 0.7, requires_revision: false }
        }
    }

    /// Pure value-cost heuristic, used when there is nothing to reason
    /// about. Confidence is fixed at 0.5, matching the original's
    /// `_fallback_reasoning`.
    fn fallback_reasoning(&self, decision: &str) -> ReasoningResult {
        ReasoningResult {
            decision: decision.to_owned(),
            alternatives_explored: 0,
            best_alternative: None,
            confidence: 0.5,
            voi_score: 0.0,
            reasoning_trace: vec!["no alternatives supplied, used fallback heuristic".to_owned()],
            debate_verdict: None,
            recommended_action: aic_protocol::RecommendedAction::from_confidence(0.5),
        }
    }

    /// A standalone up-or-down judge over an already-drafted decision, not
    /// the iterative `DebateRunner` loop: `confidence > 0.7` and
    /// `risk < 0.3` approves outright; `confidence > 0.5` is conditional;
    /// `confidence <= 0.2` is rejected; everything else needs revision.
    #[instrument(skip(self, proposed))]
    pub fn debate_decision(&self, proposed: &ProposedDecision, _rounds: u32) -> DebateVerdict {
        let verdict = if proposed.confidence > 0.7 && proposed.risk < 0.3 {
            Verdict::Approved
        } else if proposed.confidence > 0.5 {
            Verdict::Conditional
        } else if proposed.confidence <= 0.2 {
            Verdict::Rejected
        } else {
            Verdict::NeedsRevision
        };

        DebateVerdict {
            verdict,
            confidence: proposed.confidence,
            requires_revision: matches!(verdict, Verdict::NeedsRevision),
        }
    }

    /// A direct Tree-of-Thought walk over the fixed analyze/isolate/patch/
    /// refactor stages, for the CLI's `reason explore` entry point. Each
    /// stage is scored by how many of its keywords appear in `problem`;
    /// unlike `reason_about_alternatives`'s exploratory beam search, this
    /// pipeline always walks every stage up to `max_depth` — it scores the
    /// fixed sequence rather than searching for a shortcut through it.
    pub fn explore_solutions(&self, problem: &str, max_depth: usize) -> SolutionExploration {
        let problem_lower = problem.to_lowercase();
        let depth = max_depth.clamp(1, 4);

        let mut steps = vec![SolutionStep::Analyze];
        while steps.len() < depth {
            match steps.last().and_then(|s| s.next()) {
                Some(next) => steps.push(next),
                None => break,
            }
        }

        let mut trace = Vec::new();
        let mut confidence_sum = 0.0;
        for step in &steps {
            let score = step.score(&problem_lower);
            confidence_sum += score;
            trace.push(format!("{}: score={score}", step.label()));
        }
        let confidence = (confidence_sum / (steps.len() as f64 * 5.0)).clamp(0.0, 1.0);

        SolutionExploration { steps, trace, confidence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_used_when_no_alternatives() {
        let coordinator = ReasoningCoordinator::new(1.0, 0.5);
        let mut alts = Vec::new();
        let result = coordinator.reason_about_alternatives("pick one", &mut alts, ReasoningMode::Standard);
        assert_eq!(result.confidence, 0.5);
        assert!(result.best_alternative.is_none());
    }

    #[test]
    fn wide_gap_boosts_confidence() {
        let coordinator = ReasoningCoordinator::new(1.0, 0.5);
        let mut alts = vec![Alternative::new("strong", 10.0, 0.1, 0.1), Alternative::new("weak", 0.1, 0.1, 0.1)];
        let result = coordinator.reason_about_alternatives("pick one", &mut alts, ReasoningMode::Standard);
        assert!(result.confidence > 0.8);
        assert_eq!(result.best_alternative.unwrap().name, "strong");
    }

    #[test]
    fn narrow_gap_penalizes_confidence() {
        let coordinator = ReasoningCoordinator::new(1.0, 0.5);
        let mut alts = vec![Alternative::new("a", 1.0, 0.1, 0.1), Alternative::new("b", 0.98, 0.1, 0.1)];
        let result = coordinator.reason_about_alternatives("pick one", &mut alts, ReasoningMode::Standard);
        assert!(result.confidence < 0.5);
    }

    #[test]
    fn critical_mode_runs_internal_debate() {
        let coordinator = ReasoningCoordinator::new(1.0, 0.5);
        let mut alts = vec![Alternative::new("a", 5.0, 0.1, 0.1), Alternative::new("b", 1.0, 0.1, 0.1)];
        let result = coordinator.reason_about_alternatives("pick one", &mut alts, ReasoningMode::Critical);
        assert!(result.debate_verdict.is_some());
    }

    #[test]
    fn debate_decision_thresholds() {
        let coordinator = ReasoningCoordinator::new(1.0, 0.5);
        assert_eq!(
            coordinator.debate_decision(&ProposedDecision { summary: "x".into(), confidence: 0.9, risk: 0.1 }, 1).verdict,
            Verdict::Approved
        );
        assert_eq!(
            coordinator.debate_decision(&ProposedDecision { summary: "x".into(), confidence: 0.6, risk: 0.5 }, 1).verdict,
            Verdict::Conditional
        );
        assert_eq!(
            coordinator.debate_decision(&ProposedDecision { summary: "x".into(), confidence: 0.1, risk: 0.5 }, 1).verdict,
            Verdict::Rejected
        );
        assert_eq!(
            coordinator.debate_decision(&ProposedDecision { summary: "x".into(), confidence: 0.45, risk: 0.5 }, 1).verdict,
            Verdict::NeedsRevision
        );
    }

    #[test]
    fn explore_solutions_walks_all_four_stages() {
        let coordinator = ReasoningCoordinator::new(1.0, 0.5);
        let exploration = coordinator.explore_solutions("diagnose why the service crashes, then patch it", 4);
        assert_eq!(exploration.steps.len(), 4);
        assert_eq!(exploration.steps[0], SolutionStep::Analyze);
        assert_eq!(exploration.steps[3], SolutionStep::Refactor);
    }
}
