//! Picks a `ReasoningMode` for a task from an explicit override, risk
//! signals, and keyword matching. Ported from `brainmods/mode_router.py`;
//! the original's "thunderdome" tier collapses into `Deep` here since this
//! port has no separate tier above it.

use aic_protocol::ReasoningMode;
use serde::{Deserialize, Serialize};

const HARD_KEYWORDS: &[&str] = &[
    "prove", "optimize", "formal", "api design", "security", "theorem", "compiler", "plan",
    "architecture", "design", "complex", "difficult", "challenge",
];

const RISKY_KEYWORDS: &[&str] = &[
    "delete", "remove", "drop", "modify", "change", "update", "production", "database", "system",
    "critical",
];

/// What `route` is routing: the task text plus any signals the caller
/// already knows (an explicit mode override, a permissions requirement, or
/// tags).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub query: String,
    pub mode: Option<ReasoningMode>,
    pub requires_permissions: bool,
    pub tags: Vec<String>,
}

impl TaskSpec {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), ..Default::default() }
    }
}

#[derive(Debug, Default)]
pub struct ModeRouter;

impl ModeRouter {
    pub fn new() -> Self {
        Self
    }

    /// Explicit `mode` wins outright. Then: `requires_permissions` or a
    /// risky tag forces `Standard` (never trust a low-deliberation mode
    /// with something that can act on the system). Then a hard-keyword
    /// match forces `Deep`. Then a short, non-interrogative query (no `?`
    /// and none of how/why/what) is `Light`. Everything else is `Standard`.
    pub fn route(&self, task: &TaskSpec) -> ReasoningMode {
        if let Some(mode) = task.mode {
            return mode;
        }

        let risky_tag = task.tags.iter().any(|tag| {
            let tag = tag.to_lowercase();
            tag == "risky" || tag == "dangerous" || tag == "critical"
        });
        if task.requires_permissions || risky_tag {
            return ReasoningMode::Standard;
        }

        let query_lower = task.query.to_lowercase();
        if HARD_KEYWORDS.iter().any(|kw| query_lower.contains(kw)) {
            return ReasoningMode::Deep;
        }
        // Risky-keyword matches on an otherwise plain query still warrant
        // more deliberation than the default light pass.
        if RISKY_KEYWORDS.iter().any(|kw| query_lower.contains(kw)) {
            return ReasoningMode::Standard;
        }

        let word_count = task.query.split_whitespace().count();
        let is_interrogative =
            task.query.contains('?') || ["how", "why", "what"].iter().any(|w| query_lower.contains(w));
        if word_count <= 5 && !is_interrogative {
            return ReasoningMode::Light;
        }

        ReasoningMode::Standard
    }
}
