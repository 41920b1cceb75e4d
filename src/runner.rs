//! Batch and online orchestration
//!
//! A unit of work is one (user, game) pair. Units are chunked and spread over
//! a fixed-size rayon pool; inside a chunk they run one after the other. A unit
//! that fails is logged and counted, its siblings keep going.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::{EngineSettings, QoeConfig};
use crate::models::{BacklogEntry, SampleKey, WorkItem};
use crate::qoe::{prepare_samples, CarriedOverKeys, GateDecision, QoePipeline, QualityGate, UnitInput};
use crate::storage::QoeStore;

/// Counters shared by the workers of one run
#[derive(Debug, Default)]
pub struct RunStats {
    pub processed: AtomicU64,
    pub committed: AtomicU64,
    pub discarded: AtomicU64,
    /// Units without any stable period, or without samples
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
    /// Raw rows dropped while loading samples
    pub malformed: AtomicU64,
}

/// Point-in-time copy of [`RunStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub committed: u64,
    pub discarded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub malformed: u64,
}

impl RunStats {
    #[inline]
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            processed: self.processed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// How a single unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Committed,
    Discarded,
    Skipped,
}

/// Collapse backlog entries to one work item per pair, keeping the earliest
/// `since`. Excluded games are dropped.
pub fn dedupe_backlog(entries: Vec<BacklogEntry>, config: &QoeConfig) -> Vec<WorkItem> {
    let mut earliest: BTreeMap<(String, String), chrono::DateTime<chrono::Utc>> = BTreeMap::new();

    for entry in entries {
        if config.is_excluded(&entry.game_id) {
            continue;
        }
        earliest
            .entry((entry.user_id, entry.game_id))
            .and_modify(|since| *since = (*since).min(entry.since))
            .or_insert(entry.since);
    }

    earliest
        .into_iter()
        .map(|((user_id, game_id), since)| WorkItem { user_id, game_id, since })
        .collect()
}

pub struct QoeRunner<S: QoeStore> {
    store: Arc<S>,
    config: QoeConfig,
    settings: EngineSettings,
}

impl<S: QoeStore> QoeRunner<S> {
    pub fn new(store: Arc<S>, config: QoeConfig, settings: EngineSettings) -> Self {
        Self {
            store,
            config,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Rebuild every processed collection from the raw samples.
    pub fn run_batch(&self) -> Result<RunSummary> {
        self.store.reset().context("Failed to reset processed state")?;

        let pairs = self.store.pairs().context("Failed to list (user, game) pairs")?;
        let total = pairs.len();
        let items: Vec<WorkItem> = pairs
            .into_iter()
            .filter(|(_, game_id)| !self.config.is_excluded(game_id))
            .map(|(user_id, game_id)| WorkItem {
                user_id,
                game_id,
                since: self.config.history_start,
            })
            .collect();

        info!(
            "🚀 Batch run: {} pairs ({} excluded), {} workers",
            items.len(),
            total - items.len(),
            self.settings.batch_workers
        );
        self.run_items(&items, self.settings.batch_workers, "batch")
    }

    /// Process whatever the ingestion side queued since the last run.
    pub fn run_online(&self) -> Result<RunSummary> {
        let entries = self.store.drain().context("Failed to drain backlog")?;
        let drained = entries.len();
        let items = dedupe_backlog(entries, &self.config);

        info!(
            "🚀 Online run: {} backlog entries -> {} units, {} workers",
            drained,
            items.len(),
            self.settings.online_workers
        );
        self.run_items(&items, self.settings.online_workers, "online")
    }

    fn run_items(&self, items: &[WorkItem], workers: usize, mode: &str) -> Result<RunSummary> {
        let stats = RunStats::default();
        let started = Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("qoe-worker-{}", i))
            .build()
            .context("Failed to build worker pool")?;

        pool.install(|| {
            items
                .par_chunks(self.settings.chunk_size.max(1))
                .for_each(|chunk| {
                    for item in chunk {
                        self.process_guarded(item, &stats);
                    }
                })
        });

        let summary = stats.snapshot();
        info!(
            mode,
            processed = summary.processed,
            committed = summary.committed,
            discarded = summary.discarded,
            skipped = summary.skipped,
            failed = summary.failed,
            malformed = summary.malformed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "✅ Run finished"
        );
        Ok(summary)
    }

    fn process_guarded(&self, item: &WorkItem, stats: &RunStats) {
        RunStats::bump(&stats.processed, 1);

        match self.process_unit(item, stats) {
            Ok(UnitOutcome::Committed) => RunStats::bump(&stats.committed, 1),
            Ok(UnitOutcome::Discarded) => RunStats::bump(&stats.discarded, 1),
            Ok(UnitOutcome::Skipped) => RunStats::bump(&stats.skipped, 1),
            Err(e) => {
                error!(user = %item.user_id, game = %item.game_id, "unit failed: {:#}", e);
                RunStats::bump(&stats.failed, 1);
            }
        }
    }

    /// Load, process and persist one unit.
    pub fn process_unit(&self, item: &WorkItem, stats: &RunStats) -> Result<UnitOutcome> {
        let (user_id, game_id) = (item.user_id.as_str(), item.game_id.as_str());
        let game_config = self.config.games.for_game(game_id);

        // Reprocess from the start of the open period, if any
        let last = self.store.last_period(user_id, game_id, item.since)?;
        let (carried, init_idx, old_periods, from) = match &last {
            Some(last) => {
                let (carried, first_idx) = self.store.carried_over(user_id, game_id, last.start)?;
                let old_periods = self.store.old_periods(user_id, game_id, item.since)?;
                (carried, first_idx.unwrap_or(0), old_periods, last.start)
            }
            None => (CarriedOverKeys::new(), 0, Vec::new(), item.since),
        };

        let accumulator = self.store.accumulator(user_id, game_id)?;
        let old_spikes = self.store.spike_keys(user_id, game_id, from)?;
        let alternatives = self.store.alternatives(user_id, game_id, from)?;

        let loaded = self.store.samples_since(user_id, game_id, from)?;
        RunStats::bump(&stats.malformed, loaded.malformed as u64);

        let samples = prepare_samples(loaded.samples, game_config, init_idx, &carried);
        if samples.is_empty() {
            debug!(user = %user_id, game = %game_id, "no samples to process");
            return Ok(UnitOutcome::Skipped);
        }

        let input = UnitInput {
            user_id: user_id.to_string(),
            game_id: game_id.to_string(),
            initial_seq_idx: old_periods.last().map_or(0, |p| p.seq_idx + 1),
            samples,
            old_periods,
            alternatives,
            accumulator,
        };

        let Some(result) = QoePipeline::new(game_config, self.settings.max_iterations).run(&input)? else {
            return Ok(UnitOutcome::Skipped);
        };

        match QualityGate::for_game(game_config).evaluate(user_id, game_id, &result.periods) {
            GateDecision::Commit => {
                let plan = result.commit_plan(&input.accumulator, self.config.reference_date);
                let current: HashSet<SampleKey> = result.spikes.iter().map(|s| s.key()).collect();
                let stale: HashSet<SampleKey> = old_spikes.difference(&current).cloned().collect();

                self.store.commit(user_id, game_id, &plan, &result.spikes, &stale)?;
                debug!(
                    user = %user_id,
                    game = %game_id,
                    periods = plan.periods.len(),
                    glitches = plan.glitches.len(),
                    removed = result.removed.len(),
                    spikes = result.spikes.len(),
                    iterations = result.iterations,
                    "unit committed"
                );
                Ok(UnitOutcome::Committed)
            }
            GateDecision::Discard => {
                // Glitches are evicted whatever the gate decides
                self.store.store_glitches(&result.glitches)?;
                self.store.discard(&result.new_points(), &result.spikes)?;
                Ok(UnitOutcome::Discarded)
            }
        }
    }
}
