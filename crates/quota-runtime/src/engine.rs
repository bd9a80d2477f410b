//! The usage accrual engine.
//!
//! One [`AccrualEngine::run`] walks a fixed sequence of steps: apply the
//! monthly rollover, load the ledger, discover flow logs, expand archives in
//! parallel, parse every plain log sequentially while merging attributed
//! bytes, and finally persist the ledger. The ledger file is only written in
//! the last step, so a failure anywhere earlier leaves it untouched.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use quota_core::error::Result;
use quota_core::models::Ledger;
use quota_core::network::NetworkClassifier;
use quota_core::settings::EngineConfig;
use quota_core::time_utils::billing_period_label;
use quota_data::ledger::LedgerStore;
use quota_data::reader::{find_log_sources, parse_log_file, FileStats};
use tracing::{debug, error, info, warn};

use crate::decompression::DecompressionPool;

// ── Public types ──────────────────────────────────────────────────────────────

/// Steps of a run, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Idle,
    RolloverCheck,
    LedgerLoaded,
    SourcesDiscovered,
    Decompressing,
    Parsing,
    Persisted,
    Done,
}

/// Counters describing one completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Billing period the run accrued into, e.g. `"2024-05"`.
    pub billing_period: String,
    /// Whether the previous ledger was discarded by the rollover rule.
    pub rolled_over: bool,
    /// Plain `*.log` files found by discovery.
    pub plain_files: usize,
    /// `*.log.gz` archives found by discovery.
    pub archives: usize,
    /// Archives successfully expanded.
    pub archives_extracted: usize,
    /// Archives that failed to expand.
    pub archives_failed: usize,
    /// Plain files read to the end (or to their first read error).
    pub files_parsed: usize,
    /// Plain files that could not be opened.
    pub files_unreadable: usize,
    /// Line counts summed over every parsed file.
    pub lines: FileStats,
    /// Records billed to an internal host.
    pub records_attributed: u64,
    /// Hosts in the ledger after the run.
    pub hosts: usize,
    /// Every state entered, in order.
    pub states: Vec<RunState>,
}

/// The persisted ledger together with the run's report.
#[derive(Debug, Clone)]
pub struct AccrualRun {
    pub ledger: Ledger,
    pub report: RunReport,
}

// ── AccrualEngine ─────────────────────────────────────────────────────────────

/// Single-use orchestrator for one accrual run.
pub struct AccrualEngine {
    config: EngineConfig,
    classifier: NetworkClassifier,
    store: LedgerStore,
    pool: DecompressionPool,
    state: RunState,
    report: RunReport,
}

impl AccrualEngine {
    pub fn new(config: EngineConfig) -> Self {
        let classifier = config.classifier();
        let store = LedgerStore::new(config.ledger_path.clone());
        let pool = DecompressionPool::new(config.workers);
        Self {
            config,
            classifier,
            store,
            pool,
            state: RunState::Idle,
            report: RunReport {
                states: vec![RunState::Idle],
                ..RunReport::default()
            },
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute the run. `now` decides the billing period.
    ///
    /// Consumes the engine; a run is never repeated or resumed.
    pub async fn run(mut self, now: DateTime<Local>) -> Result<AccrualRun> {
        match self.run_steps(now).await {
            Ok(ledger) => {
                self.enter(RunState::Done);
                info!(
                    period = %self.report.billing_period,
                    hosts = self.report.hosts,
                    files = self.report.files_parsed,
                    records = self.report.lines.records_parsed,
                    attributed = self.report.records_attributed,
                    malformed = self.report.lines.malformed,
                    "accrual run complete"
                );
                Ok(AccrualRun {
                    ledger,
                    report: self.report,
                })
            }
            Err(e) => {
                error!(state = ?self.state, "accrual run failed: {}", e);
                Err(e)
            }
        }
    }

    // ── Private implementation ────────────────────────────────────────────

    async fn run_steps(&mut self, now: DateTime<Local>) -> Result<Ledger> {
        self.report.billing_period = billing_period_label(now);

        self.enter(RunState::RolloverCheck);
        self.report.rolled_over = self.store.reset_if_stale(now)?;

        let mut ledger = self.store.read()?;
        self.enter(RunState::LedgerLoaded);
        info!(hosts = ledger.len(), "ledger loaded");

        let sources = find_log_sources(
            &self.config.root,
            self.config.max_depth,
            &self.config.log_prefixes,
        );
        self.enter(RunState::SourcesDiscovered);
        self.report.plain_files = sources.plain.len();
        self.report.archives = sources.archives.len();

        self.enter(RunState::Decompressing);
        let outcome = self.pool.decompress_all(sources.archives).await;
        self.report.archives_extracted = outcome.extracted.len();
        self.report.archives_failed = outcome.failed.len();

        self.enter(RunState::Parsing);
        let mut plain = sources.plain;
        plain.extend(outcome.extracted);
        self.accrue_files(&plain, &mut ledger);
        self.report.hosts = ledger.len();

        self.store.save(&ledger)?;
        self.enter(RunState::Persisted);

        Ok(ledger)
    }

    /// Parse `files` one after another, merging attributed bytes into `ledger`.
    ///
    /// A file already extracted by an earlier run is found both as a plain
    /// file and as the output of its archive; it is only read once.
    fn accrue_files(&mut self, files: &[PathBuf], ledger: &mut Ledger) {
        let mut ordered: Vec<&PathBuf> = files.iter().collect();
        ordered.sort();
        ordered.dedup();

        let classifier = &self.classifier;
        let mut attributed = 0u64;

        for path in ordered {
            let result = parse_log_file(path, |record| {
                if let Some(host) = classifier.classify(&record).host() {
                    ledger.merge(host, record.total_bytes() as f64, &record.timestamp);
                    attributed += 1;
                }
            });

            match result {
                Ok(stats) => {
                    self.report.files_parsed += 1;
                    self.report.lines.absorb(stats);
                }
                Err(e) => {
                    warn!("{}", e);
                    self.report.files_unreadable += 1;
                }
            }
        }

        self.report.records_attributed = attributed;
    }

    fn enter(&mut self, next: RunState) {
        debug_assert!(next > self.state, "{:?} after {:?}", next, self.state);
        debug!(from = ?self.state, to = ?next, "accrual state change");
        self.state = next;
        self.report.states.push(next);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
