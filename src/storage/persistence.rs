//! Leveled, decaying snapshot store.
//!
//! Every depth is one [`DepthFile`]. Depth `d` keeps snapshots that are
//! between `b·m^d` and `b·m^(d+1)` old (see [`Geometry`]), merged down to
//! slots of `b·m^d`, so resolution drops by `m` with every depth.
//!
//! # Write path
//! A write drains closed windows into depth 0 and pushes whatever no longer
//! fits one depth down, merging it with what that depth already holds. Depths
//! nothing flows into are hard-linked into the new set unchanged. Ages move
//! forward by the frame shift of the write; linked depths pick it up through
//! the overflow recorded at the last rewritten depth.
//!
//! # Overflow
//! A snapshot crossing a depth's end by at most one slot stays whole and the
//! depth records how far it reaches as `overflow_ms`. The next depth then
//! starts that much later. Readers add up the overflow of shallower depths
//! to place deeper entries.
//!
//! # Failure policy
//! - Committed data that cannot be read or parsed is corruption: the store is
//!   wiped and starts empty.
//! - A write that fails part way is abandoned and the last committed set stays.

use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::config::DEFAULT_MAX_DEPTH;
use crate::snapshot::{HistoricalOps, OpFilter};
use crate::storage::atomic_dir::{link_or_copy, AtomicDirectory};
use crate::storage::depth_file::{DepthFile, Layout, LAYOUT_FILE};
use crate::storage::geometry::Geometry;
use crate::storage::types::{StoreError, StoreStats};
use crate::types::Uid;

/// Disk half of the registry. Not synchronized; the registry's disk lock
/// serializes every call.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: AtomicDirectory,
    geometry: Geometry,
}

impl SnapshotStore {
    /// Open the store at `dir`, recovering from an interrupted write and
    /// resampling history written under a different geometry.
    pub fn open(dir: impl Into<PathBuf>, geometry: Geometry) -> Result<Self, StoreError> {
        let mut store = Self {
            dir: AtomicDirectory::new(dir),
            geometry,
        };
        store.dir.recover()?;

        match Layout::read(store.dir.read_path()) {
            Ok(Some(layout))
                if layout.base_interval_ms != geometry.base_interval_ms
                    || layout.multiplier != geometry.multiplier =>
            {
                info!(
                    "History written with base={}ms multiplier={}, resampling to base={}ms multiplier={}",
                    layout.base_interval_ms,
                    layout.multiplier,
                    geometry.base_interval_ms,
                    geometry.multiplier
                );
                store.geometry = Geometry::new(
                    layout.base_interval_ms,
                    layout.multiplier,
                    DEFAULT_MAX_DEPTH.max(geometry.max_depth),
                );
                // The window end moves with the base interval, and stored ages with it.
                let offset = geometry.base_interval_ms - layout.base_interval_ms;
                if let Err(e) = store.resample(geometry, offset) {
                    error!("Resampling history on open failed: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("History layout unreadable, wiping store: {}", e);
                store.wipe();
            }
        }

        info!(
            "Opened history store at {} (base={}ms multiplier={})",
            store.dir.read_path().display(),
            store.geometry.base_interval_ms,
            store.geometry.multiplier
        );
        Ok(store)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn path(&self) -> &Path {
        self.dir.read_path()
    }

    /// Modification time of the layout header, 0 when nothing was persisted.
    pub fn last_persist_time_ms(&self) -> i64 {
        fs::metadata(self.dir.read_path().join(LAYOUT_FILE))
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }

    pub fn has_history(&self) -> bool {
        self.present_depths(&self.geometry)
            .map(|depths| !depths.is_empty())
            .unwrap_or(false)
    }

    // ============================================================================================
    // READ PATH
    // ============================================================================================

    /// Stored snapshots overlapping `[begin_ms, end_ms)` (window-end frame
    /// ages), filtered and scaled to the overlap, youngest first.
    ///
    /// Unreadable data wipes the store and yields nothing.
    pub fn collect(&self, filter: &OpFilter, begin_ms: i64, end_ms: i64) -> Vec<HistoricalOps> {
        match self.collect_with(&self.geometry, filter, begin_ms, end_ms) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!("History store corrupt, wiping: {}", e);
                self.wipe();
                Vec::new()
            }
        }
    }

    /// Everything stored, unfiltered.
    pub fn read_history(&self) -> Vec<HistoricalOps> {
        self.collect(&OpFilter::all(), i64::MIN, i64::MAX)
    }

    fn collect_with(
        &self,
        geometry: &Geometry,
        filter: &OpFilter,
        begin_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<HistoricalOps>, StoreError> {
        let mut result = Vec::new();
        let depths = self.present_depths(geometry)?;
        let Some(&deepest) = depths.last() else {
            return Ok(result);
        };

        let committed = self.dir.read_path();
        let mut cumulative_overflow = 0i64;
        for depth in 0..=deepest {
            let start = geometry
                .depth_start_ms(depth)
                .saturating_add(cumulative_overflow);
            if end_ms <= start {
                break;
            }
            let path = committed.join(geometry.file_name(depth));
            if !path.exists() {
                continue;
            }
            let file = DepthFile::read(&path).map_err(|e| e.into_corruption(&path))?;

            for mut snapshot in file.snapshots {
                snapshot.offset_begin_and_end_time(start);
                if snapshot.end_ms() <= begin_ms {
                    continue;
                }
                if snapshot.begin_ms() >= end_ms {
                    break;
                }
                snapshot.filter(filter);
                snapshot.filter_time(begin_ms, end_ms);
                if !snapshot.is_empty() {
                    result.push(snapshot);
                }
            }
            cumulative_overflow = cumulative_overflow.saturating_add(file.overflow_ms);
        }
        Ok(result)
    }

    /// Depths that have a file in the committed set, ascending.
    fn present_depths(&self, geometry: &Geometry) -> Result<Vec<usize>, StoreError> {
        let committed = self.dir.read_path();
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut depths = Vec::new();
        for entry in fs::read_dir(committed)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == LAYOUT_FILE {
                continue;
            }
            match geometry.depth_for_file_name(name) {
                Some(depth) => depths.push(depth),
                None => warn!("Ignoring unexpected file in history dir: {}", name),
            }
        }
        depths.sort_unstable();
        Ok(depths)
    }

    // ============================================================================================
    // WRITE PATH
    // ============================================================================================

    /// Fold `snapshots` into the store after aging everything already stored
    /// by `shift_ms`.
    ///
    /// # Arguments
    /// - `snapshots`: closed windows in window-end frame ages, oldest first;
    ///   empty ones are skipped
    /// - `shift_ms`: how far the frame moved since the last write
    ///
    /// # Returns
    /// - `Ok(())`: the new set is committed
    /// - `Err(StoreError)`: nothing changed on disk, unless the store was
    ///   corrupt, in which case it has been wiped
    ///
    /// # Example
    /// ```rust,no_run
    /// use op_history::storage::{Geometry, SnapshotStore};
    /// use op_history::HistoricalOps;
    ///
    /// let mut store = SnapshotStore::open("/tmp/history", Geometry::new(1_000, 4, 32))?;
    /// let window = HistoricalOps::new(1_000, 2_000);
    /// store.persist(&[window], 1_000)?;
    /// # Ok::<(), op_history::StoreError>(())
    /// ```
    pub fn persist(&mut self, snapshots: &[HistoricalOps], shift_ms: i64) -> Result<(), StoreError> {
        let snapshots: Vec<HistoricalOps> = snapshots
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        if snapshots.is_empty() && shift_ms == 0 {
            return Ok(());
        }
        debug!(
            "Persisting {} snapshots with shift {}ms",
            snapshots.len(),
            shift_ms
        );
        self.commit(snapshots, shift_ms, true)
    }

    /// Replace the whole committed set with `history`.
    fn rewrite(&mut self, history: Vec<HistoricalOps>) -> Result<(), StoreError> {
        self.commit(history, 0, false)
    }

    fn commit(
        &mut self,
        snapshots: Vec<HistoricalOps>,
        shift_ms: i64,
        merge_existing: bool,
    ) -> Result<(), StoreError> {
        let result = self.dir.start_write().map_err(StoreError::from).and_then(|staging| {
            self.write_depths(&staging, snapshots, shift_ms, merge_existing)?;
            Layout::new(self.geometry.base_interval_ms, self.geometry.multiplier).write(&staging)?;
            self.dir.finish_write()?;
            Ok(())
        });

        if let Err(e) = &result {
            if e.is_corruption() {
                error!("History store corrupt, wiping: {}", e);
                self.wipe();
            } else {
                error!("Failed to persist history, keeping previous state: {}", e);
                if let Err(cleanup) = self.dir.fail_write() {
                    warn!("Failed to abandon history staging dir: {}", cleanup);
                }
            }
        }
        result
    }

    fn write_depths(
        &self,
        staging: &Path,
        incoming: Vec<HistoricalOps>,
        shift_ms: i64,
        merge_existing: bool,
    ) -> Result<(), StoreError> {
        let geometry = self.geometry;
        let committed = self.dir.read_path();
        let old_depths = if merge_existing {
            self.present_depths(&geometry)?
        } else {
            Vec::new()
        };
        let deepest_old = old_depths.last().copied();

        let mut incoming = chain(incoming, geometry.depth_start_ms(0));
        let mut old_cumulative = 0i64;
        let mut new_cumulative = 0i64;

        for depth in 0..geometry.max_depth {
            if incoming.is_empty() && (depth > 0 || shift_ms == 0) {
                for old_depth in old_depths.iter().filter(|d| **d >= depth) {
                    let name = geometry.file_name(*old_depth);
                    link_or_copy(&committed.join(&name), &staging.join(&name))?;
                }
                return Ok(());
            }

            let mut candidates = incoming;
            let mut old_overflow = 0i64;
            if old_depths.binary_search(&depth).is_ok() {
                let path = committed.join(geometry.file_name(depth));
                let file = DepthFile::read(&path).map_err(|e| e.into_corruption(&path))?;
                let old_start = geometry
                    .depth_start_ms(depth)
                    .saturating_add(old_cumulative)
                    .saturating_add(shift_ms);
                old_overflow = file.overflow_ms;
                candidates.extend(file.snapshots.into_iter().map(|mut snapshot| {
                    snapshot.offset_begin_and_end_time(old_start);
                    snapshot
                }));
            }
            old_cumulative = old_cumulative.saturating_add(old_overflow);

            let start = geometry
                .depth_start_ms(depth)
                .saturating_add(new_cumulative);
            let window_end = geometry.depth_end_ms(depth).saturating_add(new_cumulative);
            let slot = geometry.slot_ms(depth);

            let (kept, overflow) = split_at(chain(candidates, start), window_end, slot);
            let kept = normalize(kept, slot);

            let mut overflow_ms = kept
                .last()
                .map(|last| (last.end_ms() - window_end).max(0))
                .unwrap_or(0);
            if overflow.is_empty() && deepest_old.map_or(false, |deepest| deepest > depth) {
                // Untouched deeper depths get linked; land them exactly shift_ms older.
                let exact = old_cumulative
                    .saturating_add(shift_ms)
                    .saturating_sub(new_cumulative);
                overflow_ms = overflow_ms.max(exact);
            }

            if !kept.is_empty() || overflow_ms > 0 {
                let relative = kept
                    .into_iter()
                    .map(|mut snapshot| {
                        snapshot.offset_begin_and_end_time(-start);
                        snapshot
                    })
                    .collect();
                let name = geometry.file_name(depth);
                DepthFile::new(overflow_ms, relative).write(&staging.join(name))?;
            }

            new_cumulative = new_cumulative.saturating_add(overflow_ms);
            incoming = overflow;
        }

        if !incoming.is_empty() {
            warn!(
                "Dropping {} snapshots older than depth {}",
                incoming.len(),
                geometry.max_depth
            );
        }
        Ok(())
    }

    // ============================================================================================
    // MAINTENANCE
    // ============================================================================================

    /// Re-derive every depth under `geometry` after moving all history by
    /// `offset_ms`. History that would move into the live window is dropped.
    pub fn resample(&mut self, geometry: Geometry, offset_ms: i64) -> Result<(), StoreError> {
        let history = self.collect_with(&self.geometry, &OpFilter::all(), i64::MIN, i64::MAX);
        self.geometry = geometry;
        let mut history = match history {
            Ok(history) => history,
            Err(e) => {
                error!("History store corrupt, wiping: {}", e);
                self.wipe();
                return Err(e);
            }
        };

        let live_end = geometry.base_interval_ms;
        for snapshot in &mut history {
            snapshot.offset_begin_and_end_time(offset_ms);
            if snapshot.begin_ms() < live_end && snapshot.end_ms() > live_end {
                let fraction =
                    (live_end - snapshot.begin_ms()) as f64 / snapshot.duration_ms() as f64;
                snapshot.splice_from_beginning(fraction);
                snapshot.set_begin_time(live_end);
            }
        }
        history.retain(|snapshot| snapshot.begin_ms() >= live_end && !snapshot.is_empty());

        info!(
            "Resampling {} snapshots (offset {}ms) into base={}ms multiplier={}",
            history.len(),
            offset_ms,
            geometry.base_interval_ms,
            geometry.multiplier
        );
        self.rewrite(history)
    }

    /// Delete every stored snapshot.
    pub fn clear(&mut self) {
        info!("Clearing history at {}", self.dir.read_path().display());
        self.wipe();
    }

    /// Delete every stored snapshot and switch to `geometry`.
    pub fn reset(&mut self, geometry: Geometry) {
        self.clear();
        self.geometry = geometry;
    }

    /// Forget one package (or a whole uid) in every depth.
    pub fn clear_package(&mut self, uid: Uid, package: Option<&str>) -> Result<(), StoreError> {
        let history = self.collect_with(&self.geometry, &OpFilter::all(), i64::MIN, i64::MAX);
        let history = match history {
            Ok(history) => history,
            Err(e) => {
                error!("History store corrupt, wiping: {}", e);
                self.wipe();
                return Err(e);
            }
        };
        let before = history.len();
        let history: Vec<HistoricalOps> = history
            .into_iter()
            .map(|mut snapshot| {
                snapshot.clear_history(uid, package);
                snapshot
            })
            .filter(|snapshot| !snapshot.is_empty())
            .collect();
        debug!(
            "Clearing uid {} package {:?}: {} of {} snapshots remain",
            uid,
            package,
            history.len(),
            before
        );
        self.rewrite(history)
    }

    fn wipe(&self) {
        if let Err(e) = self.dir.delete() {
            error!(
                "Failed to delete history at {}: {}",
                self.dir.read_path().display(),
                e
            );
        }
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        let depths = match self.present_depths(&self.geometry) {
            Ok(depths) => depths,
            Err(e) => {
                warn!("Failed to list history dir: {}", e);
                return stats;
            }
        };
        for depth in &depths {
            let path = self.dir.read_path().join(self.geometry.file_name(*depth));
            stats.depth_files += 1;
            stats.bytes += fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            if let Ok(file) = DepthFile::read(&path) {
                stats.snapshots += file.snapshots.len();
            }
        }
        stats.deepest = depths.last().copied();
        stats
    }
}

/// Sort by begin and push each snapshot back until it starts at or after
/// both `floor` and the end of its predecessor.
fn chain(mut snapshots: Vec<HistoricalOps>, floor: i64) -> Vec<HistoricalOps> {
    snapshots.sort_by_key(|s| (s.begin_ms(), s.end_ms()));
    let mut cursor = floor;
    for snapshot in &mut snapshots {
        if snapshot.begin_ms() < cursor {
            snapshot.offset_begin_and_end_time(cursor - snapshot.begin_ms());
        }
        cursor = cursor.max(snapshot.end_ms());
    }
    snapshots
}

/// Split a chained list at `window_end`.
///
/// A snapshot crossing the end stays whole when it reaches at most one slot
/// past it; otherwise its tail is spliced off and moved down.
fn split_at(
    snapshots: Vec<HistoricalOps>,
    window_end: i64,
    slot_ms: i64,
) -> (Vec<HistoricalOps>, Vec<HistoricalOps>) {
    let mut kept = Vec::new();
    let mut overflow = Vec::new();
    for mut snapshot in snapshots {
        if snapshot.end_ms() <= window_end {
            kept.push(snapshot);
        } else if snapshot.begin_ms() >= window_end {
            overflow.push(snapshot);
        } else {
            let tail = snapshot.end_ms() - window_end;
            if tail > slot_ms {
                let fraction = tail as f64 / snapshot.duration_ms() as f64;
                if let Some(spliced) = snapshot.splice_from_end(fraction) {
                    overflow.push(spliced);
                }
            }
            if !snapshot.is_empty() {
                kept.push(snapshot);
            }
        }
    }
    (kept, overflow)
}

/// Merge a chained list down to `slot_ms` resolution.
///
/// Walking from the oldest entry, each entry absorbs the younger entries that
/// fall within one slot of its old edge; a younger entry straddling the slot
/// start is spliced and only its older part absorbed.
fn normalize(mut snapshots: Vec<HistoricalOps>, slot_ms: i64) -> Vec<HistoricalOps> {
    let mut merged = Vec::with_capacity(snapshots.len());
    while let Some(mut anchor) = snapshots.pop() {
        let slot_begin = anchor.end_ms().saturating_sub(slot_ms);
        while let Some(younger) = snapshots.last_mut() {
            let remaining = younger.end_ms() - slot_begin;
            if remaining <= 0 {
                break;
            }
            let duration = younger.duration_ms();
            if duration == 0 || remaining >= duration {
                if let Some(younger) = snapshots.pop() {
                    anchor.merge(&younger);
                }
            } else {
                if let Some(older_part) = younger.splice_from_end(remaining as f64 / duration as f64)
                {
                    anchor.merge(&older_part);
                }
                break;
            }
        }
        if !anchor.is_empty() {
            merged.push(anchor);
        }
    }
    merged.reverse();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UidState;
    use tempfile::TempDir;

    const BASE: i64 = 1_000;
    const OP: u32 = 42;
    const UID: u32 = 1000;
    const PKG: &str = "com.example";

    fn geometry() -> Geometry {
        Geometry::new(BASE, 4, 8)
    }

    fn open(temp: &TempDir) -> SnapshotStore {
        SnapshotStore::open(temp.path().join("history"), geometry()).unwrap()
    }

    fn window(begin: i64, accesses: u64) -> HistoricalOps {
        let mut ops = HistoricalOps::new(begin, begin + BASE);
        ops.increase_access_count(OP, UID, PKG, UidState::Foreground, accesses);
        ops
    }

    fn total(snapshots: &[HistoricalOps]) -> u64 {
        snapshots.iter().map(|s| s.totals().access_count).sum()
    }

    fn assert_monotonic(snapshots: &[HistoricalOps]) {
        for pair in snapshots.windows(2) {
            assert!(
                pair[0].end_ms() <= pair[1].begin_ms(),
                "overlap: [{}, {}) then [{}, {})",
                pair[0].begin_ms(),
                pair[0].end_ms(),
                pair[1].begin_ms(),
                pair[1].end_ms()
            );
        }
    }

    #[test]
    fn test_chain_pushes_overlaps_back() {
        let chained = chain(vec![window(1_500, 1), window(1_000, 1), window(0, 1)], BASE);
        let ranges: Vec<_> = chained.iter().map(|s| (s.begin_ms(), s.end_ms())).collect();
        assert_eq!(ranges, vec![(1_000, 2_000), (2_000, 3_000), (3_000, 4_000)]);
    }

    #[test]
    fn test_split_keeps_short_tail_and_splices_long_tail() {
        let mut long = HistoricalOps::new(3_000, 6_000);
        long.increase_access_count(OP, UID, PKG, UidState::Top, 30);

        let (kept, overflow) = split_at(vec![window(3_500, 1)], 4_000, BASE);
        assert_eq!(kept.len(), 1);
        assert!(overflow.is_empty());

        let (kept, overflow) = split_at(vec![long], 4_000, BASE);
        assert_eq!((kept[0].begin_ms(), kept[0].end_ms()), (3_000, 4_000));
        assert_eq!((overflow[0].begin_ms(), overflow[0].end_ms()), (4_000, 6_000));
        assert_eq!(kept[0].totals().access_count, 10);
        assert_eq!(overflow[0].totals().access_count, 20);
    }

    #[test]
    fn test_normalize_merges_within_slot() {
        let merged = normalize(
            vec![window(4_000, 1), window(5_000, 2), window(6_000, 3), window(7_000, 4)],
            4 * BASE,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!((merged[0].begin_ms(), merged[0].end_ms()), (4_000, 8_000));
        assert_eq!(merged[0].totals().access_count, 10);
    }

    #[test]
    fn test_normalize_splices_partial_intersection() {
        // Slot anchored at the oldest end (9000) reaches back to 5000 and
        // takes the older half of [4500, 5500).
        let mut younger = HistoricalOps::new(4_500, 5_500);
        younger.increase_access_count(OP, UID, PKG, UidState::Top, 10);
        let mut older = HistoricalOps::new(5_500, 9_000);
        older.increase_access_count(OP, UID, PKG, UidState::Top, 1);

        let merged = normalize(vec![younger, older], 4 * BASE);
        assert_eq!(merged.len(), 2);
        assert_eq!((merged[0].begin_ms(), merged[0].end_ms()), (4_500, 5_000));
        assert_eq!((merged[1].begin_ms(), merged[1].end_ms()), (5_000, 9_000));
        assert_eq!(total(&merged), 11);
    }

    #[test]
    fn test_persist_then_collect_single_depth() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        store.persist(&[window(BASE, 3)], 0).unwrap();

        let history = store.read_history();
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].begin_ms(), history[0].end_ms()), (BASE, 2 * BASE));
        assert_eq!(
            history[0].counters(UID, PKG, OP, UidState::Foreground).access_count,
            3
        );
    }

    #[test]
    fn test_collect_scales_partial_overlap() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        let mut ops = HistoricalOps::new(BASE, 2 * BASE);
        ops.increase_access_count(OP, UID, PKG, UidState::Top, 100);
        store.persist(&[ops], 0).unwrap();

        let half = store.collect(&OpFilter::all(), BASE, BASE + 500);
        assert_eq!(half.len(), 1);
        let count = half[0].totals().access_count;
        assert!((49..=51).contains(&count), "got {}", count);
    }

    #[test]
    fn test_shift_ages_history_into_deeper_depths() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        store.persist(&[window(BASE, 5)], 0).unwrap();

        // Depth 0 spans [1000, 4000); after 3000ms the window sits at [4000, 5000).
        store.persist(&[], 3 * BASE).unwrap();
        let history = store.read_history();
        assert_eq!(total(&history), 5);
        assert_eq!(history[0].begin_ms(), 4 * BASE);
        assert_eq!(store.stats().deepest, Some(1));
    }

    #[test]
    fn test_untouched_depths_are_linked_and_aged() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        store.persist(&[window(5 * BASE, 7)], 0).unwrap();
        let before = store.read_history();
        assert_eq!(before[0].begin_ms(), 5 * BASE);

        store.persist(&[window(BASE, 1)], BASE).unwrap();
        let after = store.read_history();
        assert_monotonic(&after);
        assert_eq!(total(&after), 8);
        let deep = after.last().unwrap();
        assert_eq!(deep.begin_ms(), 6 * BASE);
        assert_eq!(deep.totals().access_count, 7);
    }

    #[test]
    fn test_shift_alone_without_history_writes_nothing_harmful() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        store.persist(&[], 0).unwrap();
        assert!(!store.path().exists());
        store.persist(&[], 5 * BASE).unwrap();
        assert!(store.read_history().is_empty());
    }

    #[test]
    fn test_many_windows_decay_and_keep_totals() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        for _ in 0..40 {
            store.persist(&[window(BASE, 2)], BASE).unwrap();
        }
        let history = store.read_history();
        assert_monotonic(&history);
        assert_eq!(total(&history), 80);
        assert!(history.len() < 40, "expected merged slots, got {}", history.len());
        assert!(store.stats().depth_files >= 2);
    }

    #[test]
    fn test_corrupt_depth_file_wipes_store() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        store.persist(&[window(BASE, 3)], 0).unwrap();

        let file = store.path().join(geometry().file_name(0));
        let bytes = fs::read(&file).unwrap();
        fs::write(&file, &bytes[..bytes.len() / 2]).unwrap();

        assert!(store.read_history().is_empty());
        assert!(!store.path().exists());
        assert!(store.read_history().is_empty());
    }

    #[test]
    fn test_resample_preserves_totals() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        for _ in 0..12 {
            store.persist(&[window(BASE, 3)], BASE).unwrap();
        }
        let before = total(&store.read_history());

        store.resample(Geometry::new(500, 3, 8), 0).unwrap();
        let after = store.read_history();
        assert_monotonic(&after);
        assert_eq!(total(&after), before);
        assert_eq!(store.geometry().base_interval_ms, 500);
    }

    #[test]
    fn test_resample_with_negative_offset_prunes_live_region() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        let mut ops = HistoricalOps::new(BASE, 3 * BASE);
        ops.increase_access_count(OP, UID, PKG, UidState::Top, 10);
        store.persist(&[ops], 0).unwrap();

        store.resample(geometry(), -BASE).unwrap();
        let history = store.read_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].begin_ms(), BASE);
        assert_eq!(history[0].totals().access_count, 5);
    }

    #[test]
    fn test_reopen_with_new_geometry_resamples() {
        let temp = TempDir::new().unwrap();
        {
            let mut store = open(&temp);
            store.persist(&[window(BASE, 4), window(2 * BASE, 6)], 0).unwrap();
        }
        let store = SnapshotStore::open(temp.path().join("history"), Geometry::new(2 * BASE, 5, 8))
            .unwrap();
        assert_eq!(store.geometry().base_interval_ms, 2 * BASE);
        let history = store.read_history();
        assert_eq!(total(&history), 10);
        let layout = Layout::read(store.path()).unwrap().unwrap();
        assert_eq!(layout.base_interval_ms, 2 * BASE);
    }

    #[test]
    fn test_clear_package() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp);
        let mut ops = window(BASE, 2);
        ops.increase_access_count(OP, UID, "com.other", UidState::Top, 5);
        store.persist(&[ops], 0).unwrap();

        store.clear_package(UID, Some(PKG)).unwrap();
        let history = store.read_history();
        assert_eq!(total(&history), 5);

        store.clear();
        assert!(store.read_history().is_empty());
    }
}
