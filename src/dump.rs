//! Human-readable history report.

use std::fmt::Write;

use crate::config::PersistenceParams;
use crate::snapshot::HistoricalOps;

/// Format `ms` as `1h2m3s4ms`, dropping zero components.
pub fn format_duration(ms: i64) -> String {
    if ms == 0 {
        return "0ms".to_string();
    }
    let mut out = String::new();
    if ms < 0 {
        out.push('-');
    }
    let mut rest = ms.unsigned_abs();
    for (unit, size) in [("d", 86_400_000u64), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if rest >= size {
            let _ = write!(out, "{}{}", rest / size, unit);
            rest %= size;
        }
    }
    if rest > 0 {
        let _ = write!(out, "{}ms", rest);
    }
    out
}

/// Render `intervals` (epoch ms, oldest first) relative to `now_ms`.
pub fn format_history(
    intervals: &[HistoricalOps],
    now_ms: i64,
    params: &PersistenceParams,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Historical ops (mode={} base={} multiplier={}):",
        params.mode,
        format_duration(params.base_interval_ms),
        params.multiplier
    );
    if intervals.iter().all(HistoricalOps::is_empty) {
        out.push_str("  No history\n");
        return out;
    }

    for interval in intervals.iter().filter(|i| !i.is_empty()) {
        let _ = writeln!(
            out,
            "  [-{}, -{}):",
            format_duration(now_ms - interval.begin_ms()),
            format_duration(now_ms - interval.end_ms())
        );
        for (uid, uid_ops) in interval.uids() {
            let _ = writeln!(out, "    Uid {}:", uid);
            for (package, package_ops) in uid_ops.packages() {
                let _ = writeln!(out, "      Package {}:", package);
                for (op, entry) in package_ops.ops() {
                    let _ = writeln!(out, "        Op {}:", op);
                    let mut accesses = Vec::new();
                    let mut rejects = Vec::new();
                    let mut durations = Vec::new();
                    for (state, counters) in entry.states() {
                        if counters.access_count > 0 {
                            accesses.push(format!("{}={}", state.label(), counters.access_count));
                        }
                        if counters.reject_count > 0 {
                            rejects.push(format!("{}={}", state.label(), counters.reject_count));
                        }
                        if counters.access_duration_ms > 0 {
                            durations.push(format!(
                                "{}=+{}",
                                state.label(),
                                format_duration(counters.access_duration_ms as i64)
                            ));
                        }
                    }
                    for (label, values) in [
                        ("Access", accesses),
                        ("Reject", rejects),
                        ("Duration", durations),
                    ] {
                        if !values.is_empty() {
                            let _ = writeln!(out, "          {}: {}", label, values.join(" "));
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UidState;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0ms");
        assert_eq!(format_duration(999), "999ms");
        assert_eq!(format_duration(61_001), "1m1s1ms");
        assert_eq!(format_duration(3_600_000), "1h");
        assert_eq!(format_duration(-1_500), "-1s500ms");
    }

    #[test]
    fn test_format_history() {
        let mut ops = HistoricalOps::new(10_000, 11_000);
        ops.increase_access_count(42, 1000, "com.example", UidState::Foreground, 3);
        ops.increase_access_duration(42, 1000, "com.example", UidState::Top, 1_200);

        let report = format_history(&[ops], 12_000, &PersistenceParams::default());
        assert!(report.contains("[-2s, -1s):"));
        assert!(report.contains("Uid 1000:"));
        assert!(report.contains("Package com.example:"));
        assert!(report.contains("Access: fg=3"));
        assert!(report.contains("Duration: top=+1s200ms"));
        assert!(!report.contains("Reject"));
    }

    #[test]
    fn test_format_empty_history() {
        let report = format_history(&[], 0, &PersistenceParams::default());
        assert!(report.ends_with("No history\n"));
    }
}
