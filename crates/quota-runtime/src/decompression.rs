//! Bounded-parallel gzip expansion.
//!
//! Archives are expanded on tokio's blocking thread pool, gated by a
//! semaphore sized to the configured worker count. A new archive is only
//! handed out once a worker slot is free, so a directory with thousands of
//! archives never has more than `workers` expansions in flight.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quota_core::error::{QuotaError, Result};
use quota_core::settings::MAX_WORKERS;
use quota_data::archive::decompress_archive;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// ── Public types ──────────────────────────────────────────────────────────────

/// Result of one decompression batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecompressionOutcome {
    /// Plain files produced, sorted by path.
    pub extracted: Vec<PathBuf>,
    /// Archives that could not be expanded, sorted by path.
    pub failed: Vec<PathBuf>,
}

// ── DecompressionPool ─────────────────────────────────────────────────────────

/// Fixed-size worker pool for archive expansion.
#[derive(Debug, Clone)]
pub struct DecompressionPool {
    workers: usize,
}

impl DecompressionPool {
    /// Create a pool with `workers` slots, clamped to `1..=MAX_WORKERS`.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.clamp(1, MAX_WORKERS),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Expand every archive, waiting for all of them to finish.
    ///
    /// Each archive succeeds or fails on its own; a failure is logged and
    /// recorded, never propagated to its siblings.
    pub async fn decompress_all(&self, archives: Vec<PathBuf>) -> DecompressionOutcome {
        self.run_bounded(archives, decompress_archive).await
    }

    /// Run `job` over every archive with at most `workers` jobs in flight.
    async fn run_bounded<F>(&self, archives: Vec<PathBuf>, job: F) -> DecompressionOutcome
    where
        F: Fn(&Path) -> Result<PathBuf> + Send + Sync + 'static,
    {
        let mut outcome = DecompressionOutcome::default();
        if archives.is_empty() {
            info!("No gzip files found for extraction.");
            return outcome;
        }

        info!(
            archives = archives.len(),
            workers = self.workers,
            "extracting gzip files"
        );

        let job = Arc::new(job);
        let slots = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<(PathBuf, Result<PathBuf>)> = JoinSet::new();

        for archive in archives {
            // Backpressure: wait for a free worker before submitting more work.
            let Ok(permit) = slots.clone().acquire_owned().await else {
                error!("decompression slots closed; remaining archives skipped");
                break;
            };
            let job = Arc::clone(&job);
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| job(&archive)))
                    .unwrap_or_else(|_| {
                        Err(QuotaError::Decompression {
                            path: archive.clone(),
                            source: std::io::Error::other("decompression worker panicked"),
                        })
                    });
                (archive, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(plain))) => {
                    debug!("extracted {}", plain.display());
                    outcome.extracted.push(plain);
                }
                Ok((archive, Err(e))) => {
                    warn!("Failed to extract {}: {}", archive.display(), e);
                    outcome.failed.push(archive);
                }
                Err(e) => error!(error = %e, "decompression task did not complete"),
            }
        }

        outcome.extracted.sort();
        outcome.failed.sort();

        info!(
            extracted = outcome.extracted.len(),
            failed = outcome.failed.len(),
            "gzip extraction finished"
        );
        outcome
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
