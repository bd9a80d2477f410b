//! Persistence of the per-host usage ledger.
//!
//! The ledger lives in a headerless CSV file with one row per host:
//! `host,cumulative_gibibytes,last_timestamp`. Usage is held in bytes in
//! memory and converted to GiB only at this boundary.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use quota_core::error::{QuotaError, Result};
use quota_core::models::{Ledger, UsageEntry, BYTES_PER_GIB};
use quota_core::network::parse_host;
use quota_core::time_utils::{billing_month_changed, modified_local};
use tracing::{info, warn};

// ── LedgerStore ───────────────────────────────────────────────────────────────

/// Reads and writes the ledger file at a fixed path.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` when a ledger exists and was last written in a different
    /// calendar month (by month number only) than `now`.
    pub fn should_reset(&self, now: DateTime<Local>) -> Result<bool> {
        if !self.path.exists() {
            info!(
                "No existing ledger found at {}. Proceeding without reset.",
                self.path.display()
            );
            return Ok(false);
        }
        let modified = modified_local(&self.path).map_err(|source| QuotaError::FileRead {
            path: self.path.clone(),
            source,
        })?;
        Ok(billing_month_changed(modified, now))
    }

    /// Delete the ledger file if it belongs to a previous billing month.
    ///
    /// Returns whether a reset happened.
    pub fn reset_if_stale(&self, now: DateTime<Local>) -> Result<bool> {
        if !self.should_reset(now)? {
            return Ok(false);
        }
        info!("Resetting monthly usage file: {}", self.path.display());
        std::fs::remove_file(&self.path).map_err(|source| QuotaError::Persistence {
            path: self.path.clone(),
            source,
        })?;
        Ok(true)
    }

    /// Apply the rollover rule, then read whatever ledger remains.
    pub fn load(&self, now: DateTime<Local>) -> Result<Ledger> {
        self.reset_if_stale(now)?;
        self.read()
    }

    /// Read the ledger without applying the rollover rule.
    ///
    /// A missing file is an empty ledger. Any row that cannot be understood
    /// fails the whole read.
    pub fn read(&self) -> Result<Ledger> {
        if !self.path.exists() {
            info!(
                "Ledger {} not found. Starting with empty usage data.",
                self.path.display()
            );
            return Ok(Ledger::new());
        }

        info!("Loading usage data from {}", self.path.display());
        let content =
            std::fs::read_to_string(&self.path).map_err(|source| QuotaError::FileRead {
                path: self.path.clone(),
                source,
            })?;

        let mut ledger = Ledger::new();
        let rows = parse_csv(&content).map_err(|(line, reason)| self.corrupt(line, reason))?;

        for (index, fields) in rows.into_iter().enumerate() {
            let row = index + 1;
            let [host, gib, timestamp]: [String; 3] = fields.try_into().map_err(|f: Vec<String>| {
                self.corrupt(row, format!("expected 3 fields, found {}", f.len()))
            })?;

            let host = parse_host(&host).map_err(|e| self.corrupt(row, e.to_string()))?;
            let gib: f64 = gib
                .trim()
                .parse()
                .map_err(|_| self.corrupt(row, format!("invalid usage value {:?}", gib)))?;
            if !gib.is_finite() || gib < 0.0 {
                return Err(self.corrupt(row, format!("usage out of range: {}", gib)));
            }

            let entry = UsageEntry {
                cumulative_bytes: gib * BYTES_PER_GIB,
                last_timestamp: timestamp,
            };
            if ledger.insert(host, entry).is_some() {
                return Err(self.corrupt(row, format!("duplicate host {}", host)));
            }
        }

        Ok(ledger)
    }

    /// Replace the ledger file with `ledger`.
    ///
    /// Writes a sibling temp file and renames it over the target so readers
    /// never see a partial ledger.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        if ledger.is_empty() {
            info!("No data to save.");
        } else {
            info!(
                "Saving {} entries to {}",
                ledger.len(),
                self.path.display()
            );
        }

        let mut out = String::new();
        for (host, entry) in ledger.iter() {
            out.push_str(&host.to_string());
            out.push(',');
            out.push_str(&entry.gibibytes().to_string());
            out.push(',');
            out.push_str(&escape_field(&entry.last_timestamp));
            out.push('\n');
        }

        self.write_atomically(out.as_bytes())
            .map_err(|source| QuotaError::Persistence {
                path: self.path.clone(),
                source,
            })
    }

    fn write_atomically(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let result = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, &self.path));
        if result.is_err() {
            if let Err(e) = std::fs::remove_file(&tmp) {
                warn!("Could not remove {}: {}", tmp.display(), e);
            }
        }
        result
    }

    fn corrupt(&self, line: usize, reason: String) -> QuotaError {
        QuotaError::LedgerCorrupt {
            path: self.path.clone(),
            line,
            reason,
        }
    }
}

// ── CSV helpers ───────────────────────────────────────────────────────────────

/// Quote a field when it contains a separator, quote or line break.
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split CSV text into records of fields.
///
/// Quoted fields may contain separators, doubled quotes and line breaks.
/// Blank lines are skipped. Errors carry the 1-based record number.
fn parse_csv(content: &str) -> std::result::Result<Vec<Vec<String>>, (usize, String)> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            '"' => {
                return Err((
                    records.len() + 1,
                    "unexpected quote in unquoted field".to_string(),
                ))
            }
            ',' => {
                fields.push(std::mem::take(&mut field));
                quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                if !fields.is_empty() || !field.is_empty() || quoted {
                    fields.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut fields));
                }
                quoted = false;
            }
            _ if quoted => {
                return Err((
                    records.len() + 1,
                    "text after closing quote".to_string(),
                ))
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err((records.len() + 1, "unterminated quoted field".to_string()));
    }
    if !fields.is_empty() || !field.is_empty() || quoted {
        fields.push(field);
        records.push(fields);
    }

    Ok(records)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::IpAddr;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn local(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
    }

    fn set_mtime(path: &Path, when: DateTime<Local>) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::from(when)).unwrap();
    }

    fn store_in(dir: &TempDir) -> LedgerStore {
        LedgerStore::new(dir.path().join("data_usage.csv"))
    }

    // ── rollover ──────────────────────────────────────────────────────────────

    #[test]
    fn test_should_reset_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(!store_in(&dir).should_reset(local(2024, 6, 1)).unwrap());
    }

    #[test]
    fn test_should_reset_same_month() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "10.0.0.1,1,t\n").unwrap();
        set_mtime(store.path(), local(2024, 5, 2));

        assert!(!store.should_reset(local(2024, 5, 30)).unwrap());
    }

    #[test]
    fn test_load_after_month_change_discards_ledger() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "10.0.0.1,1,t\n").unwrap();
        set_mtime(store.path(), local(2024, 5, 20));

        let ledger = store.load(local(2024, 6, 1)).unwrap();

        assert!(ledger.is_empty());
        assert!(!store.path().exists(), "stale ledger must be deleted");
    }

    #[test]
    fn test_same_month_number_next_year_is_kept() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "10.0.0.1,1,t\n").unwrap();
        set_mtime(store.path(), local(2023, 5, 20));

        let ledger = store.load(local(2024, 5, 21)).unwrap();
        assert_eq!(ledger.len(), 1);
    }

    // ── read / save ───────────────────────────────────────────────────────────

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).read().unwrap().is_empty());
    }

    #[test]
    fn test_save_converts_to_gibibytes() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut ledger = Ledger::new();
        ledger.merge(ip("10.0.0.1"), BYTES_PER_GIB * 2.5, "2024-05-01T00:00:00");

        store.save(&ledger).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(text, "10.0.0.1,2.5,2024-05-01T00:00:00\n");
    }

    #[test]
    fn test_read_converts_back_to_bytes() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "192.168.1.7,0.5,1714521600.5\n").unwrap();

        let ledger = store.read().unwrap();
        let entry = ledger.get(&ip("192.168.1.7")).unwrap();
        assert_eq!(entry.cumulative_bytes, BYTES_PER_GIB / 2.0);
        assert_eq!(entry.last_timestamp, "1714521600.5");
    }

    #[test]
    fn test_round_trip_preserves_hosts_and_totals() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut ledger = Ledger::new();
        ledger.merge(ip("10.1.1.1"), 2000.0, "2024-05-01T00:00:00");
        ledger.merge(ip("172.16.4.4"), 123_456_789.0, "");
        ledger.merge(ip("fd00::1"), 1.0, "with,comma and \"quote\"");

        store.save(&ledger).unwrap();
        let loaded = store.read().unwrap();

        assert_eq!(loaded.len(), 3);
        for (host, entry) in ledger.iter() {
            let back = loaded.get(host).unwrap();
            assert!((back.cumulative_bytes - entry.cumulative_bytes).abs() < 1e-6);
            assert_eq!(back.last_timestamp, entry.last_timestamp);
        }
    }

    #[test]
    fn test_save_then_save_again_does_not_double_convert() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut ledger = Ledger::new();
        ledger.merge(ip("10.0.0.9"), BYTES_PER_GIB, "t");

        store.save(&ledger).unwrap();
        let reloaded = store.read().unwrap();
        store.save(&reloaded).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(text, "10.0.0.9,1,t\n");
    }

    #[test]
    fn test_save_empty_ledger_writes_empty_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&Ledger::new()).unwrap();

        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "");
        assert!(!dir.path().join("data_usage.csv.tmp").exists());
    }

    #[test]
    fn test_save_into_missing_directory_creates_it() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::new(dir.path().join("state").join("usage.csv"));
        store.save(&Ledger::new()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_failure_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        // The target path is an existing directory, so the rename fails.
        let target = dir.path().join("ledger");
        std::fs::create_dir_all(target.join("occupied")).unwrap();
        let store = LedgerStore::new(&target);

        let err = store.save(&Ledger::new()).unwrap_err();
        assert!(matches!(err, QuotaError::Persistence { .. }));
        assert!(target.join("occupied").exists());
    }

    #[test]
    fn test_read_rejects_wrong_field_count() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "10.0.0.1,1,t\n10.0.0.2,1\n").unwrap();

        match store.read().unwrap_err() {
            QuotaError::LedgerCorrupt { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_read_rejects_bad_host_and_value() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        std::fs::write(store.path(), "not-a-host,1,t\n").unwrap();
        assert!(matches!(
            store.read(),
            Err(QuotaError::LedgerCorrupt { .. })
        ));

        std::fs::write(store.path(), "10.0.0.1,lots,t\n").unwrap();
        assert!(matches!(
            store.read(),
            Err(QuotaError::LedgerCorrupt { .. })
        ));

        std::fs::write(store.path(), "10.0.0.1,-1,t\n").unwrap();
        assert!(matches!(
            store.read(),
            Err(QuotaError::LedgerCorrupt { .. })
        ));
    }

    #[test]
    fn test_read_rejects_duplicate_host() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "10.0.0.1,1,a\n10.0.0.1,2,b\n").unwrap();
        assert!(matches!(
            store.read(),
            Err(QuotaError::LedgerCorrupt { line: 2, .. })
        ));
    }

    // ── CSV helpers ───────────────────────────────────────────────────────────

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_parse_csv_quoted_and_crlf() {
        let rows = parse_csv("a,\"b,c\",\"d\"\"e\"\r\n\nx,y,\"multi\nline\"\n").unwrap();
        assert_eq!(
            rows,
            vec![
                vec!["a".to_string(), "b,c".to_string(), "d\"e".to_string()],
                vec!["x".to_string(), "y".to_string(), "multi\nline".to_string()],
            ]
        );
    }

    #[test]
    fn test_parse_csv_empty_trailing_field() {
        let rows = parse_csv("10.0.0.1,1,\n").unwrap();
        assert_eq!(rows, vec![vec!["10.0.0.1".to_string(), "1".to_string(), String::new()]]);
    }

    #[test]
    fn test_parse_csv_unterminated_quote() {
        assert!(parse_csv("a,\"open\n").is_err());
    }
}
