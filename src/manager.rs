//! The Lookup Manager (spec §4.3).
//!
//! Maintains the sliding coverage window by spawning and killing
//! [`LookupWorker`] tasks, publishing `META:expected_interval`, and pruning
//! the cached-dates index. Ported from `bin/lookup_manager.py` in
//! `examples/original_source`, with one OS process per worker in the
//! original replaced by one Tokio task per worker (spec §9: "Per-worker
//! trie memory as process isolation... keep this model" — isolation here
//! comes from the worker owning no shared mutable state with its siblings,
//! not from OS process boundaries, since a systems-language task is already
//! cheap to kill and leaks nothing on exit).

use crate::config::Config;
use crate::key::{cached_dates_key, AddressFamily, META_EXPECTED_INTERVAL_KEY, META_SOURCES_KEY};
use crate::store::{CacheStore, StorageStore};
use crate::worker::LookupWorker;
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const ISO_DATE_FMT: &str = "%Y-%m-%dT00:00:00";

struct WorkerHandle {
    source: String,
    first: NaiveDate,
    last: NaiveDate,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct LookupManager<C: CacheStore + 'static, S: StorageStore + 'static> {
    days_in_memory: i64,
    floating_window_days: i64,
    sources: Vec<String>,
    cache: Arc<C>,
    storage: Arc<S>,
    workers: Vec<WorkerHandle>,
}

impl<C: CacheStore + 'static, S: StorageStore + 'static> LookupManager<C, S> {
    pub fn new(config: &Config, cache: Arc<C>, storage: Arc<S>) -> Self {
        LookupManager {
            days_in_memory: config.days_in_memory,
            floating_window_days: config.floating_window_days,
            sources: config.sources.clone(),
            cache,
            storage,
            workers: Vec::new(),
        }
    }

    /// Startup: wipes the stale cached-dates index, publishes `META:sources`,
    /// and spawns the initial fleet so every day in
    /// `[today - days_in_memory, today + floating_window_days]` is covered
    /// by at least two workers where possible (spec §4.3).
    pub async fn bootstrap(&mut self, today: NaiveDate) -> anyhow::Result<()> {
        for source in self.sources.clone() {
            for family in [AddressFamily::V4, AddressFamily::V6] {
                let key = cached_dates_key(&source, family);
                let stale = self.cache.smembers(&key).await?;
                self.cache.srem(&key, &stale).await?;
            }
        }

        self.cache.sadd(META_SOURCES_KEY, &self.sources).await?;

        for (first, last) in initial_schedule(today, self.days_in_memory, self.floating_window_days)
        {
            for source in self.sources.clone() {
                self.spawn_worker(source, first, last).await?;
            }
        }

        self.publish_expected_interval(today).await?;
        Ok(())
    }

    async fn spawn_worker(
        &mut self,
        source: String,
        first: NaiveDate,
        last: NaiveDate,
    ) -> anyhow::Result<()> {
        let first_s = first.format(ISO_DATE_FMT).to_string();
        let last_s = last.format(ISO_DATE_FMT).to_string();
        info!(%source, first = %first_s, last = %last_s, "spawning lookup worker");

        let mut worker = LookupWorker::new(
            source.clone(),
            first_s,
            last_s,
            self.cache.clone(),
            self.storage.clone(),
        );
        worker.start().await?;

        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = worker.serve(worker_cancel).await {
                warn!(error = %e, "lookup worker exited with error");
            }
        });

        self.workers.push(WorkerHandle {
            source,
            first,
            last,
            cancel,
            join,
        });
        Ok(())
    }

    /// Steady-state `tick` (spec §4.3), called on a real clock by
    /// [`LookupManager::run`] and directly in tests.
    pub async fn tick(&mut self, today: NaiveDate) -> anyhow::Result<()> {
        let half_window = self.floating_window_days / 2;

        for source in self.sources.clone() {
            // 1. newest-first; spawn a new head if the current head doesn't
            // reach far enough forward.
            let newest_last = self
                .workers
                .iter()
                .filter(|w| w.source == source)
                .map(|w| w.last)
                .max();
            let needs_head = match newest_last {
                Some(last) => last < today + ChronoDuration::days(half_window),
                None => true,
            };
            if needs_head {
                let first = today;
                let last = today + ChronoDuration::days(self.floating_window_days);
                self.spawn_worker(source.clone(), first, last).await?;
            }
        }

        // 2. kill aged-out workers; drop self-exited ones with a warning.
        let cutoff = today - ChronoDuration::days(self.days_in_memory);
        let mut still_alive = Vec::new();
        for handle in self.workers.drain(..) {
            if handle.join.is_finished() {
                warn!(source = %handle.source, first = %handle.first, last = %handle.last, "lookup worker died");
                continue;
            }
            if handle.last < cutoff {
                info!(source = %handle.source, first = %handle.first, last = %handle.last, "retiring aged-out lookup worker");
                handle.cancel.cancel();
                continue;
            }
            still_alive.push(handle);
        }
        self.workers = still_alive;

        // 3. publish the expected interval.
        self.publish_expected_interval(today).await?;

        // 4. prune cached-dates entries older than the cutoff.
        self.prune_cached_dates(cutoff).await?;

        Ok(())
    }

    async fn publish_expected_interval(&self, today: NaiveDate) -> anyhow::Result<()> {
        let first = today - ChronoDuration::days(self.days_in_memory);
        self.cache
            .hset_meta(
                META_EXPECTED_INTERVAL_KEY,
                &[
                    ("first".to_string(), first.format(ISO_DATE_FMT).to_string()),
                    ("last".to_string(), today.format(ISO_DATE_FMT).to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn prune_cached_dates(&self, cutoff: NaiveDate) -> anyhow::Result<()> {
        let cutoff_s = cutoff.format("%Y-%m-%d").to_string();
        for source in &self.sources {
            for family in [AddressFamily::V4, AddressFamily::V6] {
                let key = cached_dates_key(source, family);
                let dates = self.cache.smembers(&key).await?;
                let stale: Vec<String> = dates
                    .into_iter()
                    .filter(|d| d.get(..10).unwrap_or("") < cutoff_s.as_str())
                    .collect();
                self.cache.srem(&key, &stale).await?;
            }
        }
        Ok(())
    }

    /// Live worker count, for liveness diagnostics / the sliding-window
    /// invariant check in tests.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn covers(&self, source: &str, day: NaiveDate) -> bool {
        self.workers
            .iter()
            .any(|w| w.source == source && w.first <= day && day <= w.last)
    }

    /// Runs the manager forever with the given tick interval, honoring the
    /// cooperative `shutdown` sentinel (spec §5, §9).
    pub async fn run(&mut self, tick_interval: std::time::Duration, cancel: CancellationToken) {
        self.cache
            .set_running("manager")
            .await
            .unwrap_or_else(|e| warn!(error = %e, "failed to mark manager running"));
        loop {
            if cancel.is_cancelled() || self.cache.is_shutdown_requested().await.unwrap_or(false) {
                break;
            }
            let today = chrono::Utc::now().date_naive();
            if let Err(e) = self.tick(today).await {
                warn!(error = %e, "manager tick failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick_interval) => {}
            }
        }
        self.cache
            .unset_running("manager")
            .await
            .unwrap_or_else(|e| warn!(error = %e, "failed to clear manager running flag"));
    }
}

/// Computes the bootstrap spawn schedule (spec §4.3 table): a head worker
/// `[today, today+W]`, a half-overlap worker `[today-W/2, today+W/2]`, then
/// workers stepping back by `W/2` each time until the window no longer
/// reaches into `[today - days_in_memory, today]`.
fn initial_schedule(
    today: NaiveDate,
    days_in_memory: i64,
    floating_window_days: i64,
) -> Vec<(NaiveDate, NaiveDate)> {
    let w = floating_window_days;
    let half = w / 2;
    let mut schedule = vec![
        (today, today + ChronoDuration::days(w)),
        (
            today - ChronoDuration::days(half),
            today + ChronoDuration::days(half),
        ),
    ];

    let mut current = today - ChronoDuration::days(1);
    let horizon = today - ChronoDuration::days(days_in_memory);
    while current > horizon {
        let begin = current - ChronoDuration::days(w);
        schedule.push((begin, current));
        current = current - ChronoDuration::days(half);
    }
    schedule
}
