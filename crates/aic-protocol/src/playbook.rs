use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::ActionParams;
use crate::event::{HealEvent, MatchPatternRef, Severity};

/// Declarative healing recipe (§3 `Playbook`), loaded once at startup from
/// YAML (§6 format) and immutable while in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub name: String,
    #[serde(default = "default_rank")]
    pub rank: i64,
    #[serde(default)]
    #[serde(rename = "match")]
    pub match_pattern: MatchPattern,
    #[serde(default)]
    pub steps: Vec<PlaybookStep>,
    #[serde(default)]
    pub validate: Option<ValidateProbe>,
    #[serde(default)]
    pub canary_scope: Option<String>,
}

fn default_rank() -> i64 {
    50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchPattern {
    pub source: Option<String>,
    pub kind: Option<String>,
    pub severity: Option<Severity>,
    #[serde(default)]
    pub context: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub action: String,
    #[serde(default)]
    pub params: ActionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateProbe {
    pub probe: String,
    #[serde(default)]
    pub args: IndexMap<String, Value>,
}

impl Playbook {
    pub fn matches_event(&self, event: &HealEvent) -> bool {
        let pattern = MatchPatternRef {
            source: self.match_pattern.source.as_deref(),
            kind: self.match_pattern.kind.as_deref(),
            severity: self.match_pattern.severity,
            context: &self.match_pattern.context,
        };
        event.matches(&pattern)
    }
}

/// Finds every playbook whose `match` is a subset of `event`, sorted by
/// descending `rank` (stable on ties, so load order breaks ties — §4.1
/// step 2).
pub fn find_matching<'a>(event: &HealEvent, playbooks: &'a [Playbook]) -> Vec<&'a Playbook> {
    let mut matches: Vec<&Playbook> = playbooks.iter().filter(|pb| pb.matches_event(event)).collect();
    matches.sort_by_key(|pb| std::cmp::Reverse(pb.rank));
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;

    fn pb(name: &str, rank: i64, source: &str) -> Playbook {
        Playbook {
            name: name.to_string(),
            rank,
            match_pattern: MatchPattern {
                source: Some(source.to_string()),
                kind: None,
                severity: None,
                context: IndexMap::new(),
            },
            steps: vec![],
            validate: None,
            canary_scope: None,
        }
    }

    #[test]
    fn rank_precedence() {
        let event = HealEvent::new("rag", "synthesis_timeout", Severity::Error, IndexMap::new());
        let playbooks = vec![pb("low", 50, "rag"), pb("high", 70, "rag")];
        let matches = find_matching(&event, &playbooks);
        assert_eq!(matches[0].name, "high");
        assert_eq!(matches[1].name, "low");
    }
}
