//! Tree-of-Thought/MCTS exploration, value-of-information scoring, task mode
//! routing, and multi-agent debate for the Autonomous Improvement Core's
//! Reasoning Coordinator (SPEC_FULL.md §4.5).
//!
//! `aic-protocol::reasoning` owns the wire types (`Alternative`,
//! `ReasoningResult`, `DebateVerdict`, ...); this crate owns the logic that
//! produces and consumes them.

mod coordinator;
mod debate;
mod mode_router;
mod tot;
mod voi;

pub use coordinator::{ProposedDecision, ReasoningCoordinator, SolutionExploration, SolutionStep};
pub use debate::{Critique, DebateContext, DebateOutcome, DebateRunner};
pub use mode_router::{ModeRouter, TaskSpec};
pub use tot::{beam_search, mcts_search, ucb1_score, BeamNode, McNode};
pub use voi::{AdaptiveVoi, VoiEstimator, VoiOutcome};
