use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::short_id;

/// `warn | error | critical`, ordered so a numeric comparison is possible
/// if a future playbook wants "at least this severe" matching (not used
/// today; the matcher only does equality per §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
    Critical,
}

/// Immutable record of an observation (§3 `HealEvent`).
///
/// `(id, ts_mono)` is strictly monotonic per process: `ts_mono` is sourced
/// from a monotonic clock at construction time, and `id` is freshly
/// generated, so two events constructed in the same process are never
/// equal on either field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealEvent {
    pub id: String,
    pub ts_wall: String,
    pub ts_mono: i64,
    pub source: String,
    pub kind: String,
    pub severity: Severity,
    #[serde(default)]
    pub context: IndexMap<String, Value>,
}

impl HealEvent {
    /// Constructs an event the way the source's `mk_event` factory does:
    /// 8-char id, current wall clock, caller-supplied context map.
    pub fn new(
        source: impl Into<String>,
        kind: impl Into<String>,
        severity: Severity,
        context: IndexMap<String, Value>,
    ) -> Self {
        Self {
            id: short_id(),
            ts_wall: Utc::now().to_rfc3339(),
            ts_mono: monotonic_micros(),
            source: source.into(),
            kind: kind.into(),
            severity,
            context,
        }
    }

    /// True iff every key present in `pattern` equals this event's value —
    /// the exact partial-match semantics the source's `HealEvent.matches`
    /// implements, including the nested `context` sub-match.
    pub fn matches(&self, pattern: &MatchPatternRef<'_>) -> bool {
        if let Some(source) = pattern.source {
            if source != self.source {
                return false;
            }
        }
        if let Some(kind) = pattern.kind {
            if kind != self.kind {
                return false;
            }
        }
        if let Some(severity) = pattern.severity {
            if severity != self.severity {
                return false;
            }
        }
        for (key, val) in pattern.context {
            if self.context.get(key) != Some(val) {
                return false;
            }
        }
        true
    }
}

/// Borrowed view over a [`crate::MatchPattern`], used so `HealEvent::matches`
/// doesn't need to clone the pattern to compare it.
pub struct MatchPatternRef<'a> {
    pub source: Option<&'a str>,
    pub kind: Option<&'a str>,
    pub severity: Option<Severity>,
    pub context: &'a IndexMap<String, Value>,
}

fn monotonic_micros() -> i64 {
    use std::time::Instant;
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_partial_pattern() {
        let mut ctx = IndexMap::new();
        ctx.insert("tool_name".to_string(), Value::String("rag".to_string()));
        let event = HealEvent::new("validator", "low_context_overlap", Severity::Warn, ctx);

        let pattern = MatchPatternRef {
            source: Some("validator"),
            kind: None,
            severity: None,
            context: &IndexMap::new(),
        };
        assert!(event.matches(&pattern));

        let pattern = MatchPatternRef {
            source: Some("rag"),
            kind: None,
            severity: None,
            context: &IndexMap::new(),
        };
        assert!(!event.matches(&pattern));
    }

    #[test]
    fn ids_and_clocks_are_monotonic() {
        let a = HealEvent::new("s", "k", Severity::Warn, IndexMap::new());
        let b = HealEvent::new("s", "k", Severity::Warn, IndexMap::new());
        assert_ne!(a.id, b.id);
        assert!(b.ts_mono >= a.ts_mono);
    }
}
