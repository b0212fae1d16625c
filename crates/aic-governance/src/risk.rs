//! Static risk classification from an artifact's source text. Ported from
//! `governance.py`'s `classify_risk`, with the pattern list translated to
//! Rust-surface equivalents per the risk-classification supplement: network
//! sockets, process spawning, raw `unsafe`, and recursive deletes replace
//! the original's `socket`/`subprocess`/`os.remove` Python idioms.

use aic_protocol::RiskClass;

const HIGH_RISK_PATTERNS: &[&str] = &[
    "command::new",
    "std::process::command",
    "unsafe",
    "tcpstream::connect",
    "tcplistener::bind",
    "udpsocket::bind",
    "remove_dir_all",
    "mqtt",
    "paho",
    "serialport",
    "gpio",
];

const MEDIUM_RISK_PATTERNS: &[&str] =
    &["file::create", "openoptions", "fs::write", ".write(", ".write_all(", "serde_json::to_writer"];

const SAFE_PATH_HINTS: &[&str] = &["/tmp/", ".kloros/"];

/// High-risk patterns always win outright. A medium-risk pattern is
/// downgraded to `Medium` only if the source also mentions a known-safe
/// write target (`/tmp/`, `.kloros/`); otherwise an unconstrained write
/// path is treated as high risk. Anything matching neither list defaults
/// to `Low` (read-only, pure compute).
pub fn classify_risk(source: &str) -> RiskClass {
    let lower = source.to_lowercase();

    if HIGH_RISK_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        return RiskClass::High;
    }

    if MEDIUM_RISK_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        return if SAFE_PATH_HINTS.iter().any(|hint| lower.contains(hint)) {
            RiskClass::Medium
        } else {
            RiskClass::High
        };
    }

    RiskClass::Low
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_spawn_is_high_risk() {
        assert_eq!(classify_risk("Command::new(\"rm\").arg(\"-rf\").spawn()"), RiskClass::High);
    }

    #[test]
    fn unconfined_write_is_high_risk() {
        assert_eq!(classify_risk("std::fs::write(\"/etc/passwd\", data)"), RiskClass::High);
    }

    #[test]
    fn write_to_safe_path_is_medium_risk() {
        assert_eq!(classify_risk("std::fs::write(\"/tmp/scratch.json\", data)"), RiskClass::Medium);
    }

    #[test]
    fn pure_compute_is_low_risk() {
        assert_eq!(classify_risk("pub fn add(a: i32, b: i32) -> i32 { a + b }"), RiskClass::Low);
    }
}
