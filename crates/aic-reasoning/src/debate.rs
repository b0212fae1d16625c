//! Multi-agent debate: a proposer drafts, a critic reviews, a judge decides
//! whether the draft needs another round. Ported from `brainmods/debate.py`.
//! Proposer/critic/judge are caller-supplied closures so the coordinator can
//! back them with an LLM call, a heuristic, or a test stub.

use aic_protocol::{DebateVerdict, Verdict};

/// A single round's critique, fed back into the next proposal.
#[derive(Debug, Clone, Default)]
pub struct Critique {
    pub summary: String,
    pub requires_revision: bool,
}

/// What the proposer receives: the previous proposal and its critique, or
/// nothing on round one.
#[derive(Debug, Clone, Default)]
pub struct DebateContext {
    pub previous: Option<String>,
    pub critique: Option<Critique>,
}

#[derive(Debug, Clone)]
pub struct DebateOutcome {
    pub final_proposal: String,
    pub rounds_used: u32,
    pub verdict: DebateVerdict,
}

/// Runs proposer -> critic -> judge for up to `rounds` iterations. If the
/// judge flags `requires_revision` and rounds remain, the proposer is
/// re-invoked with `{previous, critique}`; otherwise the debate stops early.
pub struct DebateRunner<P, C, J>
where
    P: Fn(&DebateContext) -> String,
    C: Fn(&str) -> Critique,
    J: Fn(&str, &Critique) -> DebateVerdict,
{
    proposer: P,
    critic: C,
    judge: J,
}

impl<P, C, J> DebateRunner<P, C, J>
where
    P: Fn(&DebateContext) -> String,
    C: Fn(&str) -> Critique,
    J: Fn(&str, &Critique) -> DebateVerdict,
{
    pub fn new(proposer: P, critic: C, judge: J) -> Self {
        Self { proposer, critic, judge }
    }

    pub fn run(&self, rounds: u32) -> DebateOutcome {
        let mut context = DebateContext::default();
        let mut proposal = (self.proposer)(&context);
        let mut verdict = DebateVerdict { verdict: Verdict::NeedsRevision, confidence: 0.0, requires_revision: true };

        for round in 1..=rounds.max(1) {
            let critique = (self.critic)(&proposal);
            verdict = (self.judge)(&proposal, &critique);

            if !critique.requires_revision || round == rounds {
                return DebateOutcome { final_proposal: proposal, rounds_used: round, verdict };
            }

            context = DebateContext { previous: Some(proposal.clone()), critique: Some(critique) };
            proposal = (self.proposer)(&context);
        }

        DebateOutcome { final_proposal: proposal, rounds_used: rounds.max(1), verdict }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_early_when_critic_is_satisfied() {
        let runner = DebateRunner::new(
            |ctx: &DebateContext| ctx.previous.clone().unwrap_or_else(|| "draft v1".to_owned()),
            |_proposal: &str| Critique { summary: "looks fine".to_owned(), requires_revision: false },
            |_proposal: &str, _critique: &Critique| DebateVerdict {
                verdict: Verdict::Approved,
                confidence: 0.9,
                requires_revision: false,
            },
        );

        let outcome = runner.run(5);
        assert_eq!(outcome.rounds_used, 1);
        assert_eq!(outcome.final_proposal, "draft v1");
    }

    #[test]
    fn revises_when_critic_flags_issues() {
        let runner = DebateRunner::new(
            |ctx: &DebateContext| match &ctx.previous {
                None => "draft v1".to_owned(),
                Some(_) => "draft v2".to_owned(),
            },
            |proposal: &str| Critique {
                summary: "needs work".to_owned(),
                requires_revision: proposal == "draft v1",
            },
            |proposal: &str, critique: &Critique| DebateVerdict {
                verdict: if critique.requires_revision { Verdict::NeedsRevision } else { Verdict::Approved },
                confidence: if proposal == "draft v2" { 0.8 } else { 0.4 },
                requires_revision: critique.requires_revision,
            },
        );

        let outcome = runner.run(5);
        assert_eq!(outcome.rounds_used, 2);
        assert_eq!(outcome.final_proposal, "draft v2");
        assert_eq!(outcome.verdict.verdict, Verdict::Approved);
    }

    #[test]
    fn stops_at_round_limit_even_if_still_flagged() {
        let runner = DebateRunner::new(
            |_ctx: &DebateContext| "draft".to_owned(),
            |_proposal: &str| Critique { summary: "never satisfied".to_owned(), requires_revision: true },
            |_proposal: &str, _critique: &Critique| DebateVerdict {
                verdict: Verdict::NeedsRevision,
                confidence: 0.3,
                requires_revision: true,
            },
        );

        let outcome = runner.run(3);
        assert_eq!(outcome.rounds_used, 3);
    }
}
