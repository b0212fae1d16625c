//! Synthesis Governance: quarantine, the seven promotion gates, promotion,
//! risk classification, and quota counters for the Autonomous Improvement
//! Core (SPEC_FULL.md §4.2). Ported from `governance.py`'s
//! `SynthesisGovernance`.

mod engine;
mod quotas;
mod risk;

pub use engine::GovernanceEngine;
pub use quotas::{count_today_synthesis, count_week_promotions};
pub use risk::classify_risk;
