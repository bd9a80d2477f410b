use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local};

// ── Billing period ────────────────────────────────────────────────────────────

/// `true` when `modified` and `now` fall in different calendar months.
///
/// Only the month number is compared, not the year: a ledger last written in
/// May 2023 is considered current when read in May 2024. Callers that run at
/// least once a month never observe the difference.
pub fn billing_month_changed(modified: DateTime<Local>, now: DateTime<Local>) -> bool {
    modified.month() != now.month()
}

/// Human-readable label for the billing period containing `now`, e.g. `"2024-05"`.
pub fn billing_period_label(now: DateTime<Local>) -> String {
    now.format("%Y-%m").to_string()
}

// ── File timestamps ───────────────────────────────────────────────────────────

/// Last-modification time of `path` in local time.
pub fn modified_local(path: &Path) -> std::io::Result<DateTime<Local>> {
    let modified: SystemTime = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Local>::from(modified))
}
