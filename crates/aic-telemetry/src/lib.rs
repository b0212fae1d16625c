//! Per-skill execution telemetry: rolling latency/error/cost stats, an
//! append-only `skill_metrics.jsonl` history, and the cost model governance
//! and the CLI use to report what a synthesized tool has been costing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aic_protocol::{append_jsonl, read_jsonl, AicResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// USD per 1M tokens, keyed by model-name substring. Looked up by longest
/// key first so `"gpt-4o"` matches before the shorter `"gpt-4"` — same
/// resolution order as the original table.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("claude-opus-4", 15.00, 75.00),
    ("claude-sonnet-4-5", 3.00, 15.00),
    ("claude-sonnet-4", 3.00, 15.00),
    ("claude-haiku-4", 0.25, 1.25),
    ("claude-3-5-sonnet", 3.00, 15.00),
    ("claude-3-opus", 15.00, 75.00),
    ("claude-3-sonnet", 3.00, 15.00),
    ("claude-3-haiku", 0.25, 1.25),
    ("gpt-4-turbo", 10.00, 30.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 5.00, 15.00),
    ("gpt-4", 30.00, 60.00),
    ("gpt-3.5-turbo", 0.50, 1.50),
    ("ollama", 0.00, 0.00),
    ("llama", 0.00, 0.00),
    ("mistral", 0.00, 0.00),
];

const DEFAULT_PRICING: (f64, f64) = (1.00, 2.00);

/// Cost in USD for one LLM call, given per-1M-token input/output pricing
/// resolved by the longest matching substring of `model`.
pub fn calculate_cost(tokens_in: u64, tokens_out: u64, model: &str) -> f64 {
    let model_lower = model.to_lowercase();
    let mut candidates: Vec<&(&str, f64, f64)> =
        MODEL_PRICING.iter().filter(|(key, _, _)| model_lower.contains(key)).collect();
    candidates.sort_by_key(|(key, _, _)| std::cmp::Reverse(key.len()));

    let (input_price, output_price) = candidates.first().map(|(_, i, o)| (*i, *o)).unwrap_or(DEFAULT_PRICING);

    let cost_in = (tokens_in as f64 / 1_000_000.0) * input_price;
    let cost_out = (tokens_out as f64 / 1_000_000.0) * output_price;
    cost_in + cost_out
}

/// Rolling stats for one `skill@version`. Percentiles are computed by
/// sorted-index truncation (`floor(len * p)`), not interpolation, matching
/// the original's `sorted[int(len * 0.95)]`.
#[derive(Debug, Clone, Default)]
pub struct SkillMetrics {
    pub skill: String,
    pub version: String,
    pub calls: u64,
    pub errors: u64,
    pub latencies_ms: Vec<u64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub model_usage: HashMap<String, u64>,
}

impl SkillMetrics {
    fn new(skill: impl Into<String>, version: impl Into<String>) -> Self {
        Self { skill: skill.into(), version: version.into(), ..Default::default() }
    }

    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 / self.calls as f64
        }
    }

    fn percentile(&self, p: f64) -> Option<u64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * p) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn p50_latency_ms(&self) -> Option<u64> {
        self.percentile(0.5)
    }

    pub fn p95_latency_ms(&self) -> Option<u64> {
        self.percentile(0.95)
    }

    pub fn p99_latency_ms(&self) -> Option<u64> {
        self.percentile(0.99)
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            None
        } else {
            Some(self.latencies_ms.iter().sum::<u64>() as f64 / self.latencies_ms.len() as f64)
        }
    }

    pub fn avg_cost_per_call(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.cost_usd / self.calls as f64
        }
    }
}

/// One line of `skill_metrics.jsonl`: a snapshot of a skill's metrics at
/// the moment of an execution, not a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricsRecord {
    ts: String,
    skill: String,
    version: String,
    calls: u64,
    errors: u64,
    error_rate: f64,
    p50_latency_ms: Option<u64>,
    p95_latency_ms: Option<u64>,
    p99_latency_ms: Option<u64>,
    avg_latency_ms: Option<f64>,
    tokens_in: u64,
    tokens_out: u64,
    cost_usd: f64,
    avg_cost_per_call: f64,
    model_usage: HashMap<String, u64>,
}

impl MetricsRecord {
    fn from_metrics(m: &SkillMetrics) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            skill: m.skill.clone(),
            version: m.version.clone(),
            calls: m.calls,
            errors: m.errors,
            error_rate: m.error_rate(),
            p50_latency_ms: m.p50_latency_ms(),
            p95_latency_ms: m.p95_latency_ms(),
            p99_latency_ms: m.p99_latency_ms(),
            avg_latency_ms: m.avg_latency_ms(),
            tokens_in: m.tokens_in,
            tokens_out: m.tokens_out,
            cost_usd: m.cost_usd,
            avg_cost_per_call: m.avg_cost_per_call(),
            model_usage: m.model_usage.clone(),
        }
    }
}

fn key(skill: &str, version: &str) -> String {
    format!("{skill}@{version}")
}

/// In-memory metrics table with an append-only JSONL audit trail. Telemetry
/// failures never propagate to callers (§9 "telemetry must not break
/// execution") — `record_execution` logs and swallows storage errors.
pub struct TelemetryCollector {
    metrics_file: PathBuf,
    metrics: RwLock<HashMap<String, SkillMetrics>>,
}

impl TelemetryCollector {
    pub fn new(metrics_file: PathBuf) -> Self {
        Self { metrics_file, metrics: RwLock::new(HashMap::new()) }
    }

    #[instrument(skip(self))]
    pub async fn record_execution(
        &self,
        skill: &str,
        version: &str,
        latency_ms: u64,
        success: bool,
        tokens_in: u64,
        tokens_out: u64,
        model: Option<&str>,
    ) {
        let snapshot = {
            let mut metrics = self.metrics.write();
            let entry = metrics.entry(key(skill, version)).or_insert_with(|| SkillMetrics::new(skill, version));
            entry.calls += 1;
            entry.latencies_ms.push(latency_ms);
            entry.tokens_in += tokens_in;
            entry.tokens_out += tokens_out;

            if let Some(model) = model {
                if tokens_in > 0 || tokens_out > 0 {
                    entry.cost_usd += calculate_cost(tokens_in, tokens_out, model);
                    *entry.model_usage.entry(model.to_owned()).or_insert(0) += 1;
                }
            }

            if !success {
                entry.errors += 1;
            }

            entry.clone()
        };

        let record = MetricsRecord::from_metrics(&snapshot);
        if let Err(error) = append_jsonl(&self.metrics_file, &record).await {
            tracing::warn!(%error, "telemetry append failed, continuing without persistence");
        }
    }

    pub fn get_metrics(&self, skill: &str, version: &str) -> Option<SkillMetrics> {
        self.metrics.read().get(&key(skill, version)).cloned()
    }

    /// Reads the most recent persisted entry for `skill@version`, in case
    /// the in-memory table was reset by a process restart.
    pub async fn load_metrics_from_file(&self, skill: &str, version: &str) -> AicResult<Option<SkillMetrics>> {
        let records: Vec<MetricsRecord> = read_jsonl(&self.metrics_file).await?;
        Ok(records
            .into_iter()
            .rev()
            .find(|r| r.skill == skill && r.version == version)
            .map(|r| SkillMetrics {
                skill: r.skill,
                version: r.version,
                calls: r.calls,
                errors: r.errors,
                latencies_ms: Vec::new(),
                tokens_in: r.tokens_in,
                tokens_out: r.tokens_out,
                cost_usd: r.cost_usd,
                model_usage: r.model_usage,
            }))
    }

    pub fn get_cost_summary(&self) -> HashMap<String, f64> {
        self.metrics.read().iter().map(|(k, v)| (k.clone(), v.cost_usd)).collect()
    }

    pub fn metrics_file(&self) -> &Path {
        &self.metrics_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_key_wins_substring_match() {
        assert!((calculate_cost(1_000_000, 0, "gpt-4o-mini") - 0.15).abs() < 1e-9);
        assert!((calculate_cost(1_000_000, 0, "gpt-4o") - 5.00).abs() < 1e-9);
        assert!((calculate_cost(1_000_000, 0, "gpt-4") - 30.00).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let cost = calculate_cost(1_000_000, 1_000_000, "some-unlisted-model");
        assert!((cost - 3.00).abs() < 1e-9);
    }

    #[test]
    fn percentile_uses_index_truncation_not_interpolation() {
        let mut m = SkillMetrics::new("rag", "1.0.0");
        m.latencies_ms = (1..=20).collect();
        m.calls = 20;
        assert_eq!(m.p95_latency_ms(), Some(20));
        assert_eq!(m.p50_latency_ms(), Some(11));
    }

    #[tokio::test]
    async fn record_execution_accumulates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skill_metrics.jsonl");
        let collector = TelemetryCollector::new(path.clone());

        collector.record_execution("rag", "1.0.0", 120, true, 1000, 500, Some("gpt-4o")).await;
        collector.record_execution("rag", "1.0.0", 80, false, 0, 0, None).await;

        let metrics = collector.get_metrics("rag", "1.0.0").unwrap();
        assert_eq!(metrics.calls, 2);
        assert_eq!(metrics.errors, 1);
        assert!((metrics.error_rate() - 0.5).abs() < 1e-9);
        assert!(metrics.cost_usd > 0.0);

        let from_disk = collector.load_metrics_from_file("rag", "1.0.0").await.unwrap().unwrap();
        assert_eq!(from_disk.calls, 2);
    }
}
