use clap::Parser;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{QuotaError, Result};
use crate::network::{NetworkClassifier, DEFAULT_INTERNAL_RANGES};

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Ledger file name, relative to the working directory.
pub const DEFAULT_LEDGER_FILE: &str = "data_usage.csv";

/// Directory levels below the root that discovery descends into.
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Flow-log categories picked up by discovery.
pub const DEFAULT_LOG_PREFIXES: [&str; 4] = ["conn", "dns", "http", "ssl"];

/// Upper bound on decompression workers, from any source.
pub const MAX_WORKERS: usize = 1024;

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Monthly per-host network usage accounting from flow logs
#[derive(Parser, Debug, Clone)]
#[command(
    name = "flow-quota",
    about = "Monthly per-host network usage accounting from flow logs",
    version
)]
pub struct Settings {
    /// Directory searched for flow logs
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Ledger CSV path (default: data_usage.csv in the working directory)
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// Maximum directory depth below the root to search
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// Number of parallel decompression workers
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=MAX_WORKERS as i64))]
    pub workers: Option<u32>,

    /// Internal network in CIDR notation (repeatable)
    #[arg(long = "internal-range", value_name = "CIDR")]
    pub internal_ranges: Vec<IpNet>,

    /// Log file name prefix to ingest (repeatable)
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub prefixes: Vec<String>,

    /// JSON configuration file (default: ~/.flow-quota/config.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Do not print the per-host usage table
    #[arg(long)]
    pub quiet: bool,
}

// ── FileConfig ────────────────────────────────────────────────────────────────

/// Optional settings read from `~/.flow-quota/config.json`.
///
/// Every field may be omitted; command-line flags take precedence.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ranges: Option<Vec<IpNet>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_prefixes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl FileConfig {
    /// Return the default path to the config file.
    /// Uses `~/.flow-quota/config.json`.
    pub fn config_path() -> PathBuf {
        Self::config_path_in(&dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
    }

    /// Return the config path rooted at `base_dir` (used for testing).
    pub fn config_path_in(base_dir: &Path) -> PathBuf {
        base_dir.join(".flow-quota").join("config.json")
    }

    /// Strictly read a config file; any I/O or parse failure is an error.
    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| QuotaError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content)
            .map_err(|e| QuotaError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Leniently read a config file.
    ///
    /// Returns `Default` when the file is absent, and also when it cannot be
    /// parsed (with a warning).
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        Self::read_from(path).unwrap_or_else(|e| {
            warn!("Ignoring config file: {}", e);
            Self::default()
        })
    }
}

// ── EngineConfig ──────────────────────────────────────────────────────────────

/// Fully resolved configuration handed to the accrual engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Root directory for log discovery.
    pub root: PathBuf,
    /// Persisted ledger location.
    pub ledger_path: PathBuf,
    /// Blocks whose members are billed.
    pub internal_ranges: Vec<IpNet>,
    /// Recognised log file name prefixes.
    pub log_prefixes: Vec<String>,
    /// Directory levels below `root` to search.
    pub max_depth: usize,
    /// Size of the decompression worker pool.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            ledger_path: PathBuf::from(DEFAULT_LEDGER_FILE),
            internal_ranges: DEFAULT_INTERNAL_RANGES
                .iter()
                .filter_map(|cidr| cidr.parse().ok())
                .collect(),
            log_prefixes: DEFAULT_LOG_PREFIXES.iter().map(|p| p.to_string()).collect(),
            max_depth: DEFAULT_MAX_DEPTH,
            workers: num_cpus::get().clamp(1, MAX_WORKERS),
        }
    }
}

impl EngineConfig {
    /// Build the classifier for this configuration's internal ranges.
    pub fn classifier(&self) -> NetworkClassifier {
        NetworkClassifier::new(self.internal_ranges.clone())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(QuotaError::Config(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.workers > MAX_WORKERS {
            return Err(QuotaError::Config(format!(
                "workers must be at most {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.log_prefixes.is_empty() {
            return Err(QuotaError::Config(
                "at least one log prefix is required".to_string(),
            ));
        }
        if self.log_prefixes.iter().any(|p| p.is_empty()) {
            return Err(QuotaError::Config(
                "log prefixes must not be empty strings".to_string(),
            ));
        }
        if self.internal_ranges.is_empty() {
            return Err(QuotaError::Config(
                "at least one internal range is required".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Log level after applying `--debug`.
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "DEBUG"
        } else {
            &self.log_level
        }
    }

    /// Load the config file and merge it with the command line.
    ///
    /// An explicit `--config` must be readable; the default location is
    /// optional.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let file = match &self.config {
            Some(path) => FileConfig::read_from(path)?,
            None => FileConfig::load_from(&FileConfig::config_path()),
        };
        self.merge_with(file)
    }

    /// Merge `file` into the built-in defaults, then apply command-line
    /// overrides. CLI always wins.
    pub fn merge_with(&self, file: FileConfig) -> Result<EngineConfig> {
        let mut config = EngineConfig {
            root: self.root.clone(),
            ..EngineConfig::default()
        };

        if let Some(v) = file.internal_ranges {
            config.internal_ranges = v;
        }
        if let Some(v) = file.log_prefixes {
            config.log_prefixes = v;
        }
        if let Some(v) = file.ledger_path {
            config.ledger_path = v;
        }
        if let Some(v) = file.max_depth {
            config.max_depth = v;
        }
        if let Some(v) = file.workers {
            config.workers = v;
        }

        if !self.internal_ranges.is_empty() {
            config.internal_ranges = self.internal_ranges.clone();
        }
        if !self.prefixes.is_empty() {
            config.log_prefixes = self.prefixes.clone();
        }
        if let Some(v) = &self.ledger {
            config.ledger_path = v.clone();
        }
        if let Some(v) = self.max_depth {
            config.max_depth = v;
        }
        if let Some(v) = self.workers {
            config.workers = v as usize;
        }

        config.validate()?;
        Ok(config)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Settings {
        let mut full = vec!["flow-quota"];
        full.extend_from_slice(args);
        Settings::parse_from(full)
    }

    #[test]
    fn test_settings_default_values() {
        let settings = parse(&[]);

        assert_eq!(settings.root, PathBuf::from("."));
        assert!(settings.ledger.is_none());
        assert!(settings.max_depth.is_none());
        assert!(settings.workers.is_none());
        assert!(settings.internal_ranges.is_empty());
        assert!(settings.prefixes.is_empty());
        assert!(settings.config.is_none());
        assert_eq!(settings.log_level, "INFO");
        assert!(settings.log_file.is_none());
        assert!(!settings.debug);
        assert!(!settings.quiet);
    }

    #[test]
    fn test_settings_repeatable_ranges_and_prefixes() {
        let settings = parse(&[
            "--internal-range",
            "10.0.0.0/8",
            "--internal-range",
            "fd00::/8",
            "--prefix",
            "conn",
        ]);
        assert_eq!(settings.internal_ranges.len(), 2);
        assert_eq!(settings.prefixes, vec!["conn".to_string()]);
    }

    #[test]
    fn test_settings_rejects_bad_cidr() {
        let result = Settings::try_parse_from(["flow-quota", "--internal-range", "10.0.0.0/33"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_rejects_zero_workers() {
        let result = Settings::try_parse_from(["flow-quota", "--workers", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_overrides_log_level() {
        assert_eq!(parse(&["--debug"]).effective_log_level(), "DEBUG");
        assert_eq!(
            parse(&["--log-level", "WARNING"]).effective_log_level(),
            "WARNING"
        );
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = parse(&[]).merge_with(FileConfig::default()).unwrap();

        assert_eq!(config.ledger_path, PathBuf::from("data_usage.csv"));
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.log_prefixes, vec!["conn", "dns", "http", "ssl"]);
        assert_eq!(config.internal_ranges.len(), 3);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_file_config_applies_when_cli_silent() {
        let file = FileConfig {
            internal_ranges: Some(vec!["100.64.0.0/10".parse().unwrap()]),
            log_prefixes: Some(vec!["conn".to_string()]),
            ledger_path: Some(PathBuf::from("/var/lib/quota.csv")),
            max_depth: Some(2),
            workers: Some(3),
        };
        let config = parse(&[]).merge_with(file).unwrap();

        assert_eq!(config.internal_ranges, vec!["100.64.0.0/10".parse::<IpNet>().unwrap()]);
        assert_eq!(config.log_prefixes, vec!["conn"]);
        assert_eq!(config.ledger_path, PathBuf::from("/var/lib/quota.csv"));
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.workers, 3);
    }

    #[test]
    fn test_cli_overrides_file_config() {
        let file = FileConfig {
            max_depth: Some(2),
            workers: Some(3),
            ledger_path: Some(PathBuf::from("from-file.csv")),
            ..Default::default()
        };
        let config = parse(&["--max-depth", "7", "--workers", "1", "--ledger", "cli.csv"])
            .merge_with(file)
            .unwrap();

        assert_eq!(config.max_depth, 7);
        assert_eq!(config.workers, 1);
        assert_eq!(config.ledger_path, PathBuf::from("cli.csv"));
    }

    #[test]
    fn test_empty_prefix_list_rejected() {
        let file = FileConfig {
            log_prefixes: Some(Vec::new()),
            ..Default::default()
        };
        let err = parse(&[]).merge_with(file).unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }

    #[test]
    fn test_zero_workers_in_file_rejected() {
        let file = FileConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert!(parse(&[]).merge_with(file).is_err());
    }

    #[test]
    fn test_huge_workers_in_file_rejected() {
        let file = FileConfig {
            workers: Some(usize::MAX),
            ..Default::default()
        };
        let err = parse(&[]).merge_with(file).unwrap_err();
        assert!(matches!(err, QuotaError::Config(ref m) if m.contains("at most 1024")));

        let file = FileConfig {
            workers: Some(MAX_WORKERS),
            ..Default::default()
        };
        assert_eq!(parse(&[]).merge_with(file).unwrap().workers, MAX_WORKERS);
    }

    #[test]
    fn test_settings_rejects_workers_above_limit() {
        assert!(Settings::try_parse_from(["flow-quota", "--workers", "1025"]).is_err());
        assert!(Settings::try_parse_from(["flow-quota", "--workers", "1024"]).is_ok());
    }

    #[test]
    fn test_file_config_read_round_trip() {
        let tmp = TempDir::new().expect("tempdir");
        let path = FileConfig::config_path_in(tmp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{ "internal_ranges": ["10.0.0.0/8"], "max_depth": 3 }"#,
        )
        .unwrap();

        let loaded = FileConfig::read_from(&path).unwrap();
        assert_eq!(loaded.max_depth, Some(3));
        assert_eq!(loaded.internal_ranges.unwrap().len(), 1);
        assert!(loaded.log_prefixes.is_none());
    }

    #[test]
    fn test_file_config_missing_is_default() {
        let tmp = TempDir::new().expect("tempdir");
        let loaded = FileConfig::load_from(&FileConfig::config_path_in(tmp.path()));
        assert_eq!(loaded, FileConfig::default());
    }

    #[test]
    fn test_file_config_invalid_lenient_and_strict() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{ "max_depth": "deep" }"#).unwrap();

        assert_eq!(FileConfig::load_from(&path), FileConfig::default());
        assert!(matches!(
            FileConfig::read_from(&path),
            Err(QuotaError::Config(_))
        ));
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let tmp = TempDir::new().expect("tempdir");
        let missing = tmp.path().join("nope.json");
        let settings = parse(&["--config", missing.to_str().unwrap()]);
        assert!(matches!(
            settings.engine_config(),
            Err(QuotaError::FileRead { .. })
        ));
    }
}
