//! The historical registry: live counters in memory, decaying history on disk.
//!
//! # Locking
//! Two independent mutexes guard the two halves:
//! - **memory**: live window, write queue, current parameters
//! - **disk**: the snapshot store
//!
//! Recording takes the memory lock alone and never blocks on I/O. Anything
//! touching both takes the disk lock first, through a [`DiskSession`], and
//! only reaches memory from inside that session, so memory-then-disk
//! acquisition cannot be written. The memory lock is held just long enough to
//! copy or drain state; disk work then continues under the disk lock alone.

use crate::accumulator::{Accumulator, PendingBatch};
use crate::config::{HistoricalMode, PersistenceParams, RegistryConfig};
use crate::dump;
use crate::snapshot::{HistoricalOps, OpFilter};
use crate::storage::{Geometry, SnapshotStore, StoreError, StoreStats};
use crate::types::{Clock, OpCode, Uid, UidState};
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// ================================================================================================
// STATE
// ================================================================================================

/// Everything behind the memory lock.
#[derive(Debug)]
pub struct MemoryState {
    params: PersistenceParams,
    accumulator: Accumulator,
}

impl MemoryState {
    pub fn params(&self) -> PersistenceParams {
        self.params
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }
}

/// Holds the disk lock. The only way to reach memory while disk is held.
pub struct DiskSession<'a> {
    store: MutexGuard<'a, SnapshotStore>,
    memory: &'a Mutex<MemoryState>,
}

impl<'a> DiskSession<'a> {
    pub fn store(&mut self) -> &mut SnapshotStore {
        &mut *self.store
    }

    /// Take the memory lock for a short extraction step.
    pub fn memory(&self) -> MutexGuard<'_, MemoryState> {
        self.memory.lock()
    }

    /// Run `f` with both halves locked.
    pub fn with_both<R>(&mut self, f: impl FnOnce(&mut SnapshotStore, &mut MemoryState) -> R) -> R {
        let mut memory = self.memory.lock();
        f(&mut *self.store, &mut *memory)
    }

    /// Write a drained batch.
    ///
    /// On failure the batch goes back to the front of the queue, its
    /// snapshots first moved by `requeue_offset_ms`, so it stays visible to
    /// queries and is retried by the next flush. The error carries how far
    /// the disk now lags the live frame.
    fn persist_batch(&mut self, mut batch: PendingBatch, requeue_offset_ms: i64) -> Result<(), i64> {
        if self.store.persist(&batch.snapshots, batch.shift_ms).is_ok() {
            return Ok(());
        }
        let lag = batch.shift_ms;
        for snapshot in &mut batch.snapshots {
            snapshot.offset_begin_and_end_time(requeue_offset_ms);
        }
        warn!(
            "Requeueing {} history windows after a failed write",
            batch.snapshots.len()
        );
        self.memory().accumulator.restage(batch);
        Err(lag)
    }
}

/// Snapshot of registry counters for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryStats {
    pub mode: HistoricalMode,
    pub base_interval_ms: i64,
    pub multiplier: i64,
    pub pending_writes: usize,
    pub staged_shift_ms: i64,
    pub recorded_events: u64,
    pub store: StoreStats,
}

// ================================================================================================
// REGISTRY
// ================================================================================================

pub struct HistoricalRegistry {
    disk: Mutex<SnapshotStore>,
    memory: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    /// Coalescing wake-up for the flush worker
    flush_signal: Arc<Notify>,
    max_depth: usize,
    recorded_events: AtomicU64,
}

impl std::fmt::Debug for HistoricalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalRegistry")
            .field(
                "path",
                &self.disk.try_lock().map(|store| store.path().to_path_buf()),
            )
            .field("recorded_events", &self.recorded_events.load(Ordering::Relaxed))
            .finish()
    }
}

impl HistoricalRegistry {
    /// Opens the history directory and starts a live window at "now".
    ///
    /// History that survived a restart is aged by the time since it was last
    /// persisted. Invalid parameters fall back to the defaults (keeping the
    /// requested mode); a disabled registry deletes whatever is stored.
    ///
    /// # Arguments
    /// - `config`: history directory, persistence parameters and depth cap
    /// - `clock`: source of "now" for every recording and query
    ///
    /// # Returns
    /// The registry, or the I/O error that kept the directory from being
    /// recovered.
    ///
    /// # Example
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use op_history::{HistoricalRegistry, RegistryConfig, SystemClock, UidState};
    ///
    /// let registry = HistoricalRegistry::open(RegistryConfig::default(), Arc::new(SystemClock))?;
    /// registry.record_access(42, 1000, "com.example", UidState::Foreground);
    /// # Ok::<(), op_history::StoreError>(())
    /// ```
    pub fn open(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let params = match config.params.validate() {
            Ok(()) => config.params,
            Err(e) => {
                warn!("Invalid history parameters ({}), using defaults", e);
                PersistenceParams {
                    mode: config.params.mode,
                    ..PersistenceParams::default()
                }
            }
        };

        let geometry = Geometry::from_params(&params, config.max_depth);
        let mut store = SnapshotStore::open(&config.history_dir, geometry)?;
        let now = clock.now_ms();
        let mut accumulator = Accumulator::new(now, params.base_interval_ms);

        if params.mode == HistoricalMode::Disabled {
            store.clear();
        } else if store.has_history() {
            let last_persist = store.last_persist_time_ms();
            if last_persist > 0 && now > last_persist {
                debug!("Aging stored history by {}ms of downtime", now - last_persist);
                accumulator.stage_shift(now - last_persist);
            }
        }

        info!(
            "Historical registry open: mode={} base={}ms multiplier={}",
            params.mode, params.base_interval_ms, params.multiplier
        );

        Ok(Self {
            disk: Mutex::new(store),
            memory: Mutex::new(MemoryState {
                params,
                accumulator,
            }),
            clock,
            flush_signal: Arc::new(Notify::new()),
            max_depth: config.max_depth,
            recorded_events: AtomicU64::new(0),
        })
    }

    fn disk_session(&self) -> DiskSession<'_> {
        DiskSession {
            store: self.disk.lock(),
            memory: &self.memory,
        }
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn params(&self) -> PersistenceParams {
        self.memory.lock().params
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Signalled whenever a closed window is waiting to be written.
    pub fn flush_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.flush_signal)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut session = self.disk_session();
        let store = session.store().stats();
        let memory = session.memory();
        RegistryStats {
            mode: memory.params.mode,
            base_interval_ms: memory.params.base_interval_ms,
            multiplier: memory.params.multiplier,
            pending_writes: memory.accumulator.pending_len(),
            staged_shift_ms: memory.accumulator.staged_shift_ms(),
            recorded_events: self.recorded_events.load(Ordering::Relaxed),
            store,
        }
    }

    // ============================================================================================
    // RECORDING (memory lock only)
    // ============================================================================================

    pub fn record_access(&self, op: OpCode, uid: Uid, package: &str, state: UidState) {
        self.record(|acc, now| acc.record_access(now, op, uid, package, state));
    }

    pub fn record_reject(&self, op: OpCode, uid: Uid, package: &str, state: UidState) {
        self.record(|acc, now| acc.record_reject(now, op, uid, package, state));
    }

    pub fn record_duration(
        &self,
        op: OpCode,
        uid: Uid,
        package: &str,
        state: UidState,
        delta_ms: u64,
    ) {
        self.record(|acc, now| acc.record_duration(now, op, uid, package, state, delta_ms));
    }

    fn record(&self, apply: impl FnOnce(&mut Accumulator, i64) -> bool) {
        let queued = {
            let mut memory = self.memory.lock();
            if memory.params.mode != HistoricalMode::EnabledActive {
                return;
            }
            // Read under the lock so the window never sees time go backwards
            // because of a racing caller.
            let now = self.clock.now_ms();
            apply(&mut memory.accumulator, now)
        };
        self.recorded_events.fetch_add(1, Ordering::Relaxed);
        if queued {
            self.flush_signal.notify_one();
        }
    }

    /// Advance the live window without recording. Returns true when a closed
    /// window was queued.
    pub fn roll_over(&self) -> bool {
        let queued = {
            let mut memory = self.memory.lock();
            if !memory.params.mode.is_enabled() {
                return false;
            }
            let now = self.clock.now_ms();
            memory.accumulator.roll_over(now)
        };
        if queued {
            self.flush_signal.notify_one();
        }
        queued
    }

    // ============================================================================================
    // PERSISTENCE (disk, then memory)
    // ============================================================================================

    /// Write every queued window and the staged frame shift to disk.
    ///
    /// # Returns
    /// The number of windows written. A failed write returns 0 and keeps the
    /// windows queued for the next call.
    pub fn persist_pending_history(&self) -> usize {
        let mut session = self.disk_session();
        let batch = session.memory().accumulator.take_pending();
        let Some(batch) = batch else {
            return 0;
        };
        let windows = batch.snapshots.len();
        debug!(
            "Flushing {} pending windows (shift {}ms)",
            windows, batch.shift_ms
        );
        match session.persist_batch(batch, 0) {
            Ok(()) => windows,
            Err(_) => 0,
        }
    }

    /// Queue an externally built snapshot and write it.
    ///
    /// `ops` times are history ages: 0 is the youngest point stored on disk,
    /// right behind the live window.
    pub fn add_external_snapshot(&self, mut ops: HistoricalOps) {
        let mut session = self.disk_session();
        let batch = {
            let mut memory = session.memory();
            if !memory.params.mode.is_enabled() {
                return;
            }
            ops.offset_begin_and_end_time(memory.accumulator.base_interval_ms());
            memory.accumulator.queue_external(ops);
            memory.accumulator.take_pending()
        };
        if let Some(batch) = batch {
            // A failed write stays queued for the next flush.
            let _ = session.persist_batch(batch, 0);
        }
    }

    /// Shift all stored history by `delta_ms` (positive makes it older).
    /// History pushed into the live window region is dropped. Nothing moves
    /// when queued windows cannot be written first.
    pub fn offset_history(&self, delta_ms: i64) {
        let mut session = self.disk_session();
        let batch = session.memory().accumulator.take_pending();
        if let Some(batch) = batch {
            if session.persist_batch(batch, 0).is_err() {
                warn!("Not offsetting history by {}ms, the store is not writable", delta_ms);
                return;
            }
        }
        let geometry = session.store().geometry();
        info!("Offsetting history by {}ms", delta_ms);
        if let Err(e) = session.store().resample(geometry, delta_ms) {
            warn!("Offsetting history failed: {}", e);
        }
    }

    // ============================================================================================
    // CONFIGURATION
    // ============================================================================================

    /// Apply a settings string; malformed settings are logged and ignored.
    pub fn configuration_changed(&self, settings: &str) {
        match PersistenceParams::parse(settings) {
            Ok(params) => self.set_parameters(params),
            Err(e) => warn!("Ignoring malformed history settings {:?}: {}", settings, e),
        }
    }

    /// Switch to new persistence parameters.
    ///
    /// - Disabling drops the live window, the queue and everything stored.
    /// - Enabling a disabled registry starts a fresh window.
    /// - A new base interval or multiplier flushes the queue and resamples
    ///   the stored history into the new depth layout; totals are kept.
    ///
    /// # Arguments
    /// - `params`: the new parameters; invalid ones are logged and ignored
    ///
    /// # Example
    /// ```rust,no_run
    /// # use op_history::{HistoricalMode, HistoricalRegistry, PersistenceParams};
    /// # fn apply(registry: &HistoricalRegistry) {
    /// registry.set_parameters(PersistenceParams::new(
    ///     HistoricalMode::EnabledActive,
    ///     60_000,
    ///     4,
    /// ));
    /// # }
    /// ```
    pub fn set_parameters(&self, params: PersistenceParams) {
        if let Err(e) = params.validate() {
            warn!("Ignoring invalid history parameters: {}", e);
            return;
        }
        let mut session = self.disk_session();

        let (old, batch, base_delta) = {
            let mut memory = session.memory();
            let now = self.clock.now_ms();
            let old = memory.params;
            if old == params {
                return;
            }
            memory.params = params;

            if params.mode == HistoricalMode::Disabled {
                memory.accumulator = Accumulator::new(now, params.base_interval_ms);
                (old, None, 0)
            } else if old.mode == HistoricalMode::Disabled {
                memory.accumulator = Accumulator::new(now, params.base_interval_ms);
                (old, None, 0)
            } else if old.geometry_differs(&params) {
                let batch = memory.accumulator.take_pending();
                let delta = memory
                    .accumulator
                    .set_base_interval(params.base_interval_ms);
                (old, batch, delta)
            } else {
                (old, None, 0)
            }
        };

        info!("History parameters changed: {:?} -> {:?}", old, params);

        if params.mode == HistoricalMode::Disabled {
            if old.mode.is_enabled() {
                info!("History disabled, purging stored history");
            }
            session
                .store()
                .reset(Geometry::from_params(&params, self.max_depth));
            return;
        }

        if old.geometry_differs(&params) {
            if let Some(batch) = batch {
                // Queued in the old frame; a failed write requeues it in the new one.
                let _ = session.persist_batch(batch, base_delta);
            }
            let geometry = Geometry::from_params(&params, self.max_depth);
            if let Err(e) = session.store().resample(geometry, base_delta) {
                warn!("Resampling history failed: {}", e);
            }
        }
    }

    // ============================================================================================
    // QUERIES
    // ============================================================================================

    /// Counters noted during `[begin_ms, end_ms)`, merged into one snapshot.
    ///
    /// Stored intervals that only partly overlap the range contribute
    /// counters scaled by the overlapping share.
    ///
    /// # Arguments
    /// - `filter`: uid, package and op selection
    /// - `begin_ms`: range start in epoch ms
    /// - `end_ms`: range end in epoch ms; `i64::MAX` means "now"
    ///
    /// # Returns
    /// One snapshot spanning `[begin_ms, end)`. Empty, never an error, when
    /// nothing matches or history is disabled.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use op_history::{HistoricalRegistry, OpFilter};
    /// # fn last_hour(registry: &HistoricalRegistry, now_ms: i64) {
    /// let ops = registry.query(&OpFilter::all().uid(1000), now_ms - 3_600_000, i64::MAX);
    /// println!("accesses: {}", ops.totals().access_count);
    /// # }
    /// ```
    pub fn query(&self, filter: &OpFilter, begin_ms: i64, end_ms: i64) -> HistoricalOps {
        let end_ms = self.resolve_end(end_ms);
        let mut merged = HistoricalOps::new(begin_ms, end_ms);
        for interval in self.query_intervals(filter, begin_ms, end_ms) {
            merged.merge(&interval);
        }
        merged.set_begin_and_end_time(begin_ms, end_ms);
        merged
    }

    /// Like [`query`](Self::query) but keeps every stored interval apart,
    /// oldest first, in epoch ms.
    pub fn query_intervals(
        &self,
        filter: &OpFilter,
        begin_ms: i64,
        end_ms: i64,
    ) -> Vec<HistoricalOps> {
        let mut session = self.disk_session();
        let (now, age_begin, age_end, live, batch, frame_offset) = {
            let mut memory = session.memory();
            if !memory.params.mode.is_enabled() {
                return Vec::new();
            }
            let now = self.clock.now_ms();
            let end_ms = if end_ms == i64::MAX { now } else { end_ms };
            if begin_ms >= end_ms {
                return Vec::new();
            }

            // Now-relative ages, youngest edge first.
            let age_begin = now.saturating_sub(end_ms).max(0);
            let age_end = now.saturating_sub(begin_ms).max(0);
            if age_end <= age_begin {
                return Vec::new();
            }

            let accumulator = &mut memory.accumulator;
            let live = accumulator.current_snapshot(now).clone();
            let elapsed = live.end_ms();
            let live = (age_begin < elapsed || age_begin == 0).then(|| {
                let mut live = live;
                live.filter(filter);
                live.filter_time(age_begin, age_end);
                live
            });
            let batch = if age_end > elapsed {
                Some(accumulator.take_pending())
            } else {
                None
            };
            (now, age_begin, age_end, live, batch, accumulator.frame_offset_ms(now))
        };

        let to_epoch = |mut snapshot: HistoricalOps, offset: i64| {
            let begin = now.saturating_sub(snapshot.end_ms().saturating_sub(offset));
            let end = now.saturating_sub(snapshot.begin_ms().saturating_sub(offset));
            snapshot.set_begin_and_end_time(begin, end);
            snapshot
        };

        let mut result = Vec::new();
        if let Some(batch) = batch {
            let (lag, unwritten) = match batch {
                Some(batch) => {
                    let snapshots = batch.snapshots.clone();
                    match session.persist_batch(batch, 0) {
                        Ok(()) => (0, Vec::new()),
                        Err(lag) => (lag, snapshots),
                    }
                }
                None => (0, Vec::new()),
            };

            let offset = frame_offset.saturating_sub(lag);
            let stored = session.store().collect(
                filter,
                age_begin.saturating_add(offset),
                age_end.saturating_add(offset),
            );
            result.extend(stored.into_iter().rev().map(|s| to_epoch(s, offset)));

            // Windows the failed write put back are still part of history.
            for mut snapshot in unwritten {
                snapshot.filter(filter);
                snapshot.filter_time(
                    age_begin.saturating_add(frame_offset),
                    age_end.saturating_add(frame_offset),
                );
                if !snapshot.is_empty() {
                    result.push(to_epoch(snapshot, frame_offset));
                }
            }
            result.sort_by_key(|s| (s.begin_ms(), s.end_ms()));
        }

        if let Some(live) = live.filter(|live| !live.is_empty()) {
            result.push(to_epoch(live, 0));
        }
        result
    }

    fn resolve_end(&self, end_ms: i64) -> i64 {
        if end_ms == i64::MAX {
            self.clock.now_ms()
        } else {
            end_ms
        }
    }

    /// Human-readable report of everything matching `filter`.
    pub fn dump(&self, filter: &OpFilter) -> String {
        let now = self.clock.now_ms();
        let intervals = self.query_intervals(filter, i64::MIN, now);
        dump::format_history(&intervals, now, &self.params())
    }

    // ============================================================================================
    // CLEARING
    // ============================================================================================

    /// Drop all history, stored and live.
    pub fn clear_history(&self) {
        let clock = Arc::clone(&self.clock);
        let mut session = self.disk_session();
        session.with_both(|store, memory| {
            let now = clock.now_ms();
            memory.accumulator = Accumulator::new(now, memory.params.base_interval_ms);
            store.clear();
        });
    }

    /// Drop one package's history (or a whole uid's when `package` is `None`).
    pub fn clear_package_history(&self, uid: Uid, package: Option<&str>) {
        let mut session = self.disk_session();
        session.memory().accumulator.clear_package(uid, package);
        if let Err(e) = session.store().clear_package(uid, package) {
            warn!("Clearing history for uid {} failed: {}", uid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualClock;
    use tempfile::TempDir;

    const BASE: i64 = 1_000;
    const START: i64 = 1_000_000;

    fn setup(mode: HistoricalMode) -> (TempDir, Arc<ManualClock>, HistoricalRegistry) {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let config = RegistryConfig::new(
            temp.path().join("history"),
            PersistenceParams::new(mode, BASE, 4),
        );
        let registry = HistoricalRegistry::open(config, clock.clone()).unwrap();
        (temp, clock, registry)
    }

    #[test]
    fn test_passive_mode_records_nothing() {
        let (_temp, _clock, registry) = setup(HistoricalMode::EnabledPassive);
        registry.record_access(1, 10, "com.example", UidState::Top);
        assert_eq!(registry.stats().recorded_events, 0);
        assert!(registry.query(&OpFilter::all(), 0, i64::MAX).is_empty());
    }

    #[test]
    fn test_live_window_is_visible_without_flush() {
        let (_temp, clock, registry) = setup(HistoricalMode::EnabledActive);
        registry.record_access(1, 10, "com.example", UidState::Top);
        clock.advance(300);
        let result = registry.query(&OpFilter::all(), 0, i64::MAX);
        assert_eq!(result.totals().access_count, 1);
        assert_eq!(result.end_ms(), START + 300);
    }

    #[test]
    fn test_roll_over_signals_flush() {
        let (_temp, clock, registry) = setup(HistoricalMode::EnabledActive);
        registry.record_access(1, 10, "com.example", UidState::Top);
        clock.advance(BASE);
        assert!(registry.roll_over());
        assert_eq!(registry.stats().pending_writes, 1);
        registry.persist_pending_history();
        let stats = registry.stats();
        assert_eq!(stats.pending_writes, 0);
        assert_eq!(stats.store.depth_files, 1);
    }

    #[test]
    fn test_malformed_settings_keep_parameters() {
        let (_temp, _clock, registry) = setup(HistoricalMode::EnabledActive);
        let before = registry.params();
        registry.configuration_changed("baseIntervalMillis=-5");
        registry.configuration_changed("nonsense");
        assert_eq!(registry.params(), before);

        registry.configuration_changed("mode=HISTORICAL_MODE_ENABLED_PASSIVE,baseIntervalMillis=1000,intervalMultiplier=4");
        assert_eq!(registry.params().mode, HistoricalMode::EnabledPassive);
    }

    #[test]
    fn test_disk_session_reaches_memory() {
        let (_temp, _clock, registry) = setup(HistoricalMode::EnabledActive);
        let mut session = registry.disk_session();
        let base = session.with_both(|store, memory| {
            assert_eq!(store.geometry().base_interval_ms, memory.params().base_interval_ms);
            memory.accumulator().base_interval_ms()
        });
        assert_eq!(base, BASE);
    }
}
