//! Shadow Tester: routes a slice of traffic to a quarantined capability,
//! compares it against a baseline without exposing any side effect, and
//! aggregates the run history into a promotion-readiness verdict
//! (SPEC_FULL.md §4.3). Ported from `shadow_tester.py`'s `ShadowTester`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use aic_protocol::{append_jsonl, read_jsonl, AicError, AicResult, CapabilityStatus};
use aic_sandbox::{SandboxRequest, SandboxRunner};
use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

const TRUNCATE_LEN: usize = 200;

#[derive(Debug, Clone)]
struct ShadowRoute {
    percent: f64,
    baseline_version: Option<String>,
    shadow_version: Option<String>,
}

/// One recorded shadow run, persisted to `shadow_results.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowResult {
    pub tool_name: String,
    pub timestamp: String,
    pub baseline_result: String,
    pub shadow_result: String,
    pub latency_baseline_ms: f64,
    pub latency_shadow_ms: f64,
    pub r#match: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowStats {
    pub tool_name: String,
    pub sample_count: u64,
    pub accuracy: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub match_count: u64,
    pub error_count: u64,
}

/// Metrics for one capability version, supplied by the caller (`aic-core`,
/// which owns the `TelemetryCollector`) so this crate never has to depend
/// on `aic-telemetry` just to compare two numbers.
#[derive(Debug, Clone, Copy)]
pub struct VersionMetrics {
    pub calls: u64,
    pub error_rate: f64,
    pub p95_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionComparison {
    pub tool_name: String,
    pub baseline_version: String,
    pub shadow_version: String,
    pub baseline_calls: u64,
    pub shadow_calls: u64,
    pub baseline_error_rate: f64,
    pub shadow_error_rate: f64,
    pub baseline_p95_latency_ms: Option<u64>,
    pub shadow_p95_latency_ms: Option<u64>,
    /// Percent improvement in p95 latency, `None` if either side lacks a
    /// p95 sample.
    pub latency_improvement_pct: Option<f64>,
    /// Percent improvement in error rate; the baseline error rate is
    /// floored at 0.001 before dividing, matching the source's
    /// `max(baseline.error_rate, 0.001)` guard against division by zero.
    pub error_rate_improvement_pct: Option<f64>,
}

/// Compares `baseline` against `shadow` by the source's three-rule text
/// comparator: a shadow-only error fails, a length delta over 50% fails,
/// otherwise any non-error shadow result counts as a match.
pub fn compare_results(baseline: &str, shadow: &str) -> bool {
    let baseline_lower = baseline.to_lowercase();
    let shadow_lower = shadow.to_lowercase();

    if shadow_lower.contains("error") && !baseline_lower.contains("error") {
        return false;
    }

    let max_len = baseline.len().max(shadow.len()) as f64;
    if (baseline.len() as f64 - shadow.len() as f64).abs() > max_len * 0.5 {
        return false;
    }

    !shadow_lower.contains("error")
}

fn truncate(s: &str) -> String {
    s.chars().take(TRUNCATE_LEN).collect()
}

/// Routes traffic to quarantined capabilities, runs shadow executions in
/// the sandbox, and persists an append-only comparison log.
pub struct ShadowTester {
    routes: RwLock<HashMap<String, ShadowRoute>>,
    results_log: PathBuf,
    sandbox: Arc<dyn SandboxRunner>,
}

impl ShadowTester {
    pub fn new(results_log: PathBuf, sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self { routes: RwLock::new(HashMap::new()), results_log, sandbox }
    }

    /// Enables shadow testing for `tool_name` at `percent` of traffic.
    pub fn enable_shadow(&self, tool_name: &str, percent: f64) -> AicResult<()> {
        if !(0.0..=1.0).contains(&percent) {
            return Err(AicError::ActionFailed("shadow percent must be between 0 and 1".to_owned()));
        }
        self.routes.write().insert(
            tool_name.to_owned(),
            ShadowRoute { percent, baseline_version: None, shadow_version: None },
        );
        Ok(())
    }

    pub fn disable_shadow(&self, tool_name: &str) {
        self.routes.write().remove(tool_name);
    }

    /// Bernoulli trial against the configured percent; absent routes never
    /// shadow.
    pub fn should_shadow(&self, tool_name: &str) -> bool {
        let percent = self.routes.read().get(tool_name).map(|r| r.percent).unwrap_or(0.0);
        rand::thread_rng().gen::<f64>() < percent
    }

    /// Configures an A/B split between two versions of a tool, keyed by
    /// `tool_name@shadow_version` so a tool can run several concurrent
    /// version experiments.
    pub fn enable_versioned_shadow(
        &self,
        tool_name: &str,
        baseline_version: &str,
        shadow_version: &str,
        percent: f64,
    ) -> AicResult<()> {
        if !(0.0..=1.0).contains(&percent) {
            return Err(AicError::ActionFailed("shadow percent must be between 0 and 1".to_owned()));
        }
        let key = format!("{tool_name}@{shadow_version}");
        self.routes.write().insert(
            key,
            ShadowRoute {
                percent,
                baseline_version: Some(baseline_version.to_owned()),
                shadow_version: Some(shadow_version.to_owned()),
            },
        );
        Ok(())
    }

    pub fn flip_traffic(&self, tool_name: &str, shadow_version: &str, new_percent: f64) -> AicResult<()> {
        let key = format!("{tool_name}@{shadow_version}");
        let mut routes = self.routes.write();
        let Some(route) = routes.get_mut(&key) else {
            return Err(AicError::ActionFailed(format!("no shadow routing found for {key}")));
        };
        route.percent = new_percent;
        Ok(())
    }

    pub fn promote_shadow_to_production(&self, tool_name: &str, shadow_version: &str) -> AicResult<()> {
        self.flip_traffic(tool_name, shadow_version, 1.0)
    }

    /// Runs `tool_name` in the sandbox and compares it to `baseline_result`,
    /// returning `None` if this invocation is not sampled for shadowing or
    /// the capability isn't quarantined (a promoted/deprecated tool has no
    /// business being shadow-tested).
    pub async fn run_shadow(
        &self,
        tool_name: &str,
        status: CapabilityStatus,
        request: SandboxRequest,
        baseline_result: Option<String>,
    ) -> Option<ShadowResult> {
        if !self.should_shadow(tool_name) {
            return None;
        }
        if status != CapabilityStatus::Quarantine {
            tracing::info!(tool = tool_name, ?status, "not in quarantine, skipping shadow test");
            return None;
        }

        let baseline_result = baseline_result.unwrap_or_else(|| format!("No baseline for {tool_name}"));

        let baseline_start = Utc::now();
        let latency_baseline_ms = (Utc::now() - baseline_start).num_milliseconds() as f64;

        let shadow_start = Utc::now();
        let (shadow_result, error) = match self.sandbox.run(request).await {
            Ok(execution) if execution.succeeded() => (execution.stdout, None),
            Ok(execution) => {
                let message = format!("exit {}: {}", execution.exit_code, execution.stderr);
                (format!("Error: {message}"), Some(message))
            }
            Err(err) => (format!("Error: {err}"), Some(err.to_string())),
        };
        let latency_shadow_ms = (Utc::now() - shadow_start).num_milliseconds() as f64;

        let is_match = compare_results(&baseline_result, &shadow_result);
        let result = ShadowResult {
            tool_name: tool_name.to_owned(),
            timestamp: Utc::now().to_rfc3339(),
            baseline_result: truncate(&baseline_result),
            shadow_result: truncate(&shadow_result),
            latency_baseline_ms,
            latency_shadow_ms,
            r#match: is_match,
            error,
        };

        if let Err(err) = append_jsonl(&self.results_log, &result).await {
            tracing::warn!(%err, "failed to log shadow result, continuing");
        }

        tracing::info!(
            tool = tool_name,
            r#match = is_match,
            latency_ms = latency_shadow_ms,
            "shadow test completed"
        );
        Some(result)
    }

    pub async fn get_shadow_stats(&self, tool_name: &str) -> Option<ShadowStats> {
        let results: Vec<ShadowResult> = read_jsonl(&self.results_log).await.ok()?;
        let results: Vec<&ShadowResult> = results.iter().filter(|r| r.tool_name == tool_name).collect();
        if results.is_empty() {
            return None;
        }

        let total = results.len() as u64;
        let matches = results.iter().filter(|r| r.r#match).count() as u64;
        let errors = results.iter().filter(|r| r.error.is_some()).count() as u64;
        let avg_latency = results.iter().map(|r| r.latency_shadow_ms).sum::<f64>() / results.len() as f64;

        Some(ShadowStats {
            tool_name: tool_name.to_owned(),
            sample_count: total,
            accuracy: matches as f64 / total as f64,
            error_rate: errors as f64 / total as f64,
            avg_latency_ms: (avg_latency * 100.0).round() / 100.0,
            match_count: matches,
            error_count: errors,
        })
    }

    /// Checks shadow results against the promotion thresholds, returning a
    /// human-readable reason either way.
    pub async fn meets_promotion_threshold(
        &self,
        tool_name: &str,
        min_samples: u64,
        min_accuracy: f64,
        max_error_rate: f64,
    ) -> (bool, String) {
        let Some(stats) = self.get_shadow_stats(tool_name).await else {
            return (false, format!("no shadow results for {tool_name}"));
        };

        if stats.sample_count < min_samples {
            return (
                false,
                format!("insufficient samples: {} < {min_samples}", stats.sample_count),
            );
        }
        if stats.accuracy < min_accuracy {
            return (
                false,
                format!("accuracy too low: {:.1}% < {:.0}%", stats.accuracy * 100.0, min_accuracy * 100.0),
            );
        }
        if stats.error_rate > max_error_rate {
            return (
                false,
                format!("error rate too high: {:.1}% > {:.0}%", stats.error_rate * 100.0, max_error_rate * 100.0),
            );
        }

        (
            true,
            format!("shadow tests passed ({} samples, {:.1}% accuracy)", stats.sample_count, stats.accuracy * 100.0),
        )
    }

    pub fn compare_version_metrics(
        &self,
        tool_name: &str,
        baseline_version: &str,
        shadow_version: &str,
        baseline: VersionMetrics,
        shadow: VersionMetrics,
    ) -> VersionComparison {
        let latency_improvement_pct = match (baseline.p95_latency_ms, shadow.p95_latency_ms) {
            (Some(b), Some(s)) if b > 0 => Some(((b as f64 - s as f64) / b as f64) * 100.0),
            _ => None,
        };

        let error_rate_improvement_pct = if baseline.calls > 0 {
            let floor = baseline.error_rate.max(0.001);
            Some(((baseline.error_rate - shadow.error_rate) / floor) * 100.0)
        } else {
            None
        };

        VersionComparison {
            tool_name: tool_name.to_owned(),
            baseline_version: baseline_version.to_owned(),
            shadow_version: shadow_version.to_owned(),
            baseline_calls: baseline.calls,
            shadow_calls: shadow.calls,
            baseline_error_rate: baseline.error_rate,
            shadow_error_rate: shadow.error_rate,
            baseline_p95_latency_ms: baseline.p95_latency_ms,
            shadow_p95_latency_ms: shadow.p95_latency_ms,
            latency_improvement_pct,
            error_rate_improvement_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aic_sandbox::{SandboxExecution, SandboxLimits};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSandbox {
        stdout: String,
        exit_code: i32,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SandboxRunner for FakeSandbox {
        async fn run(&self, _request: SandboxRequest) -> anyhow::Result<SandboxExecution> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            Ok(SandboxExecution {
                started_at: now,
                ended_at: now,
                duration_ms: 0,
                exit_code: self.exit_code,
                stdout: self.stdout.clone(),
                stderr: String::new(),
                timed_out: false,
            })
        }
    }

    fn request() -> SandboxRequest {
        SandboxRequest {
            command: "quarantine-tool".to_owned(),
            args: vec![],
            cwd: std::env::temp_dir(),
            env: Default::default(),
            read_only: true,
            limits: SandboxLimits::default(),
        }
    }

    #[test]
    fn comparator_rejects_shadow_only_error() {
        assert!(!compare_results("42 results found", "Error: timeout"));
    }

    #[test]
    fn comparator_rejects_large_length_delta() {
        assert!(!compare_results("short", "this response is a great deal longer than the baseline text"));
    }

    #[test]
    fn comparator_matches_similar_non_error_text() {
        assert!(compare_results("42 results found for query", "43 results found for query"));
    }

    #[test]
    fn enable_shadow_rejects_out_of_range_percent() {
        let tester = ShadowTester::new(
            PathBuf::from("/tmp/shadow_results.jsonl"),
            Arc::new(FakeSandbox { stdout: String::new(), exit_code: 0, calls: AtomicUsize::new(0) }),
        );
        assert!(tester.enable_shadow("rag", 1.5).is_err());
    }

    #[test]
    fn should_shadow_respects_bounds() {
        let tester = ShadowTester::new(
            PathBuf::from("/tmp/shadow_results.jsonl"),
            Arc::new(FakeSandbox { stdout: String::new(), exit_code: 0, calls: AtomicUsize::new(0) }),
        );
        tester.enable_shadow("always", 1.0).unwrap();
        tester.enable_shadow("never", 0.0).unwrap();
        for _ in 0..20 {
            assert!(tester.should_shadow("always"));
            assert!(!tester.should_shadow("never"));
        }
        assert!(!tester.should_shadow("unconfigured"));
    }

    #[tokio::test]
    async fn run_shadow_skips_non_quarantined_tools() {
        let dir = tempfile::tempdir().unwrap();
        let tester = ShadowTester::new(
            dir.path().join("shadow_results.jsonl"),
            Arc::new(FakeSandbox { stdout: "ok".to_owned(), exit_code: 0, calls: AtomicUsize::new(0) }),
        );
        tester.enable_shadow("rag", 1.0).unwrap();
        let result = tester.run_shadow("rag", CapabilityStatus::Promoted, request(), None).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn run_shadow_logs_and_accumulates_stats() {
        let dir = tempfile::tempdir().unwrap();
        let tester = ShadowTester::new(
            dir.path().join("shadow_results.jsonl"),
            Arc::new(FakeSandbox { stdout: "42 results found".to_owned(), exit_code: 0, calls: AtomicUsize::new(0) }),
        );
        tester.enable_shadow("rag", 1.0).unwrap();

        for _ in 0..10 {
            let result = tester
                .run_shadow("rag", CapabilityStatus::Quarantine, request(), Some("42 results found".to_owned()))
                .await;
            assert!(result.is_some());
        }

        let stats = tester.get_shadow_stats("rag").await.unwrap();
        assert_eq!(stats.sample_count, 10);
        assert!((stats.accuracy - 1.0).abs() < f64::EPSILON);

        let (meets, _) = tester.meets_promotion_threshold("rag", 10, 0.8, 0.2).await;
        assert!(meets);
    }

    #[tokio::test]
    async fn meets_promotion_threshold_fails_with_too_few_samples() {
        let dir = tempfile::tempdir().unwrap();
        let tester = ShadowTester::new(
            dir.path().join("shadow_results.jsonl"),
            Arc::new(FakeSandbox { stdout: "42 results found".to_owned(), exit_code: 0, calls: AtomicUsize::new(0) }),
        );
        tester.enable_shadow("rag", 1.0).unwrap();
        tester.run_shadow("rag", CapabilityStatus::Quarantine, request(), None).await;

        let (meets, reason) = tester.meets_promotion_threshold("rag", 10, 0.8, 0.2).await;
        assert!(!meets);
        assert!(reason.contains("insufficient samples"));
    }

    #[test]
    fn compare_version_metrics_computes_improvements() {
        let dir = tempfile::tempdir().unwrap();
        let tester = ShadowTester::new(
            dir.path().join("shadow_results.jsonl"),
            Arc::new(FakeSandbox { stdout: String::new(), exit_code: 0, calls: AtomicUsize::new(0) }),
        );
        let baseline = VersionMetrics { calls: 100, error_rate: 0.05, p95_latency_ms: Some(200) };
        let shadow = VersionMetrics { calls: 100, error_rate: 0.01, p95_latency_ms: Some(100) };
        let comparison = tester.compare_version_metrics("rag", "1.0.0", "1.1.0", baseline, shadow);
        assert!((comparison.latency_improvement_pct.unwrap() - 50.0).abs() < 1e-9);
        assert!(comparison.error_rate_improvement_pct.unwrap() > 0.0);
    }

    #[test]
    fn flip_traffic_requires_existing_route() {
        let tester = ShadowTester::new(
            PathBuf::from("/tmp/shadow_results.jsonl"),
            Arc::new(FakeSandbox { stdout: String::new(), exit_code: 0, calls: AtomicUsize::new(0) }),
        );
        assert!(tester.flip_traffic("rag", "1.1.0", 0.5).is_err());
        tester.enable_versioned_shadow("rag", "1.0.0", "1.1.0", 0.1).unwrap();
        assert!(tester.flip_traffic("rag", "1.1.0", 0.5).is_ok());
        tester.promote_shadow_to_production("rag", "1.1.0").unwrap();
    }
}
