use quota_core::formatting::{format_bytes, format_number};
use quota_core::models::{Ledger, UsageEntry};
use quota_runtime::engine::RunReport;
use std::net::IpAddr;

/// Plain-text table of every host, heaviest first.
pub fn render_usage_table(ledger: &Ledger) -> String {
    if ledger.is_empty() {
        return "No usage recorded for this billing period.\n".to_string();
    }

    let mut rows: Vec<(&IpAddr, &UsageEntry)> = ledger.iter().collect();
    rows.sort_by(|a, b| {
        b.1.cumulative_bytes
            .total_cmp(&a.1.cumulative_bytes)
            .then_with(|| a.0.cmp(b.0))
    });

    let host_width = rows
        .iter()
        .map(|(host, _)| host.to_string().len())
        .max()
        .unwrap_or(0)
        .max("HOST".len());

    let mut out = format!(
        "{:<hw$}  {:>12}  {:>14}  {}\n",
        "HOST",
        "USAGE",
        "GiB",
        "LAST SEEN",
        hw = host_width
    );
    for (host, entry) in rows {
        out.push_str(&format!(
            "{:<hw$}  {:>12}  {:>14}  {}\n",
            host.to_string(),
            format_bytes(entry.cumulative_bytes),
            format_number(entry.gibibytes(), 3),
            entry.last_timestamp,
            hw = host_width
        ));
    }
    out.push_str(&format!(
        "{:<hw$}  {:>12}\n",
        "TOTAL",
        format_bytes(ledger.total_bytes()),
        hw = host_width
    ));
    out
}

/// One-line summary of a run for the log.
pub fn summary_line(report: &RunReport) -> String {
    format!(
        "period {}: {} hosts, {} files parsed ({} unreadable), {} of {} archives extracted, \
         {} records ({} attributed, {} malformed lines){}",
        report.billing_period,
        report.hosts,
        report.files_parsed,
        report.files_unreadable,
        report.archives_extracted,
        report.archives,
        report.lines.records_parsed,
        report.records_attributed,
        report.lines.malformed,
        if report.rolled_over {
            ", ledger reset for new month"
        } else {
            ""
        }
    )
}
