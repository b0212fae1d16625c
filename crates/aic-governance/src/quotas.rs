//! Daily synthesis and weekly promotion quota counters, both derived from
//! the provenance log rather than a separate counter file — matching the
//! original's "recompute from the append-only log" approach, which needs
//! no reset logic of its own.

use aic_protocol::ProvenanceRecord;
use chrono::{Datelike, Utc};

/// Counts provenance entries whose `date` falls on today (UTC) and whose
/// `origin` is `synthesis`.
pub fn count_today_synthesis(records: &[ProvenanceRecord]) -> u32 {
    let today = Utc::now().format("%Y-%m-%d").to_string();
    records
        .iter()
        .filter(|r| r.date.starts_with(&today) && r.origin.as_deref() == Some("synthesis"))
        .count() as u32
}

/// Counts `promotion` events since this week's Monday 00:00 UTC.
pub fn count_week_promotions(records: &[ProvenanceRecord]) -> u32 {
    let now = Utc::now();
    let days_since_monday = now.weekday().num_days_from_monday();
    let week_start = (now - chrono::Duration::days(days_since_monday as i64))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc();
    let week_start_str = week_start.to_rfc3339();

    records.iter().filter(|r| r.event == "promotion" && r.date.as_str() >= week_start_str.as_str()).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use aic_protocol::{RiskClass, ToolVersion};

    fn synth_record(date: &str) -> ProvenanceRecord {
        let mut record =
            ProvenanceRecord::synthesis("rag", ToolVersion::quarantine(), "test", "gpt-4o", "deadbeef", RiskClass::Low);
        record.date = date.to_owned();
        record
    }

    fn promotion_record(date: &str) -> ProvenanceRecord {
        let mut record =
            ProvenanceRecord::promotion("rag", ToolVersion::quarantine(), ToolVersion::promoted(), "auto@policy/v1");
        record.date = date.to_owned();
        record
    }

    #[test]
    fn counts_only_todays_synthesis_entries() {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let records = vec![
            synth_record(&format!("{today}T10:00:00+00:00")),
            synth_record(&format!("{today}T11:00:00+00:00")),
            synth_record("2020-01-01T00:00:00+00:00"),
        ];
        assert_eq!(count_today_synthesis(&records), 2);
    }

    #[test]
    fn counts_only_promotions_since_monday() {
        let records = vec![promotion_record("2099-01-01T00:00:00+00:00"), synth_record("2099-01-01T00:00:00+00:00")];
        assert_eq!(count_week_promotions(&records), 1);
    }
}
