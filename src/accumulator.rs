//! In-memory accumulation of live events.
//!
//! The open window is a plain value. [`Window::advance`] maps `(window, now)`
//! to the next window plus a [`Transition`] describing what happened, so the
//! roll-over rules can be tested without a clock.
//!
//! Times handed out of this module use the window-end frame: an age of `0` is
//! the moment the open window is due to close. The live window itself sits at
//! `[0, base)` in that frame, so a window that closes on time lands at
//! `[base, 2·base)`, right behind the next one.

use crate::snapshot::HistoricalOps;
use crate::types::{OpCode, Uid, UidState};

/// The currently open window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Window {
    started_at_ms: i64,
    /// Counters noted so far, `[0, elapsed)` in now-relative ages
    ops: HistoricalOps,
}

/// Outcome of advancing a window to a new "now".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Still inside the window.
    Open,
    /// The window was due but empty; the frame moved by `span_ms`.
    Reset { span_ms: i64 },
    /// The window was due and is handed off, already placed in the new
    /// window-end frame. The frame moved by `span_ms`.
    Closed { snapshot: HistoricalOps, span_ms: i64 },
    /// The clock went backwards past the window start.
    ClockRewound { shift_ms: i64 },
}

impl Window {
    pub fn new(started_at_ms: i64) -> Self {
        Self {
            started_at_ms,
            ops: HistoricalOps::new(0, 0),
        }
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn ops(&self) -> &HistoricalOps {
        &self.ops
    }

    pub fn advance(mut self, now_ms: i64, base_interval_ms: i64) -> (Window, Transition) {
        let elapsed = now_ms.saturating_sub(self.started_at_ms);

        if elapsed < 0 {
            self.started_at_ms = now_ms;
            self.ops.set_begin_and_end_time(0, 0);
            return (
                self,
                Transition::ClockRewound {
                    shift_ms: elapsed.saturating_neg(),
                },
            );
        }

        if elapsed < base_interval_ms {
            self.ops.set_begin_and_end_time(0, elapsed);
            return (self, Transition::Open);
        }

        let fresh = Window::new(now_ms);
        if self.ops.is_empty() {
            return (fresh, Transition::Reset { span_ms: elapsed });
        }

        let overdue = elapsed - base_interval_ms;
        let mut snapshot = self.ops;
        snapshot.set_begin_and_end_time(0, base_interval_ms);
        snapshot.offset_begin_and_end_time(base_interval_ms.saturating_add(overdue));
        (
            fresh,
            Transition::Closed {
                snapshot,
                span_ms: elapsed,
            },
        )
    }
}

/// Closed windows drained for one disk write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingBatch {
    /// Window-end frame ages, oldest first
    pub snapshots: Vec<HistoricalOps>,
    /// How far the frame moved since the last successful write
    pub shift_ms: i64,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.shift_ms == 0
    }
}

/// Live window, write queue and the not yet persisted frame shift.
#[derive(Debug)]
pub struct Accumulator {
    base_interval_ms: i64,
    window: Window,
    pending: Vec<HistoricalOps>,
    staged_shift_ms: i64,
}

impl Accumulator {
    pub fn new(now_ms: i64, base_interval_ms: i64) -> Self {
        Self {
            base_interval_ms,
            window: Window::new(now_ms),
            pending: Vec::new(),
            staged_shift_ms: 0,
        }
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn base_interval_ms(&self) -> i64 {
        self.base_interval_ms
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn staged_shift_ms(&self) -> i64 {
        self.staged_shift_ms
    }

    /// Distance from `now` to the end of the open window.
    ///
    /// Adding it to a now-relative age yields a window-end frame age.
    pub fn frame_offset_ms(&self, now_ms: i64) -> i64 {
        self.window
            .started_at_ms
            .saturating_add(self.base_interval_ms)
            .saturating_sub(now_ms)
    }

    // ============================================================================================
    // RECORDING
    // ============================================================================================

    /// Advance the live window to `now`. Returns true when a closed window was
    /// queued.
    pub fn roll_over(&mut self, now_ms: i64) -> bool {
        let window = std::mem::replace(&mut self.window, Window::new(now_ms));
        let (next, transition) = window.advance(now_ms, self.base_interval_ms);
        self.window = next;

        match transition {
            Transition::Open => false,
            Transition::Reset { span_ms } => {
                self.move_frame(span_ms);
                false
            }
            Transition::Closed { snapshot, span_ms } => {
                self.move_frame(span_ms);
                self.pending.push(snapshot);
                true
            }
            Transition::ClockRewound { shift_ms } => {
                self.stage_shift(shift_ms);
                false
            }
        }
    }

    fn move_frame(&mut self, span_ms: i64) {
        for snapshot in &mut self.pending {
            snapshot.offset_begin_and_end_time(span_ms);
        }
        self.stage_shift(span_ms);
    }

    pub fn record_access(
        &mut self,
        now_ms: i64,
        op: OpCode,
        uid: Uid,
        package: &str,
        state: UidState,
    ) -> bool {
        let queued = self.roll_over(now_ms);
        self.window
            .ops
            .increase_access_count(op, uid, package, state, 1);
        queued
    }

    pub fn record_reject(
        &mut self,
        now_ms: i64,
        op: OpCode,
        uid: Uid,
        package: &str,
        state: UidState,
    ) -> bool {
        let queued = self.roll_over(now_ms);
        self.window
            .ops
            .increase_reject_count(op, uid, package, state, 1);
        queued
    }

    pub fn record_duration(
        &mut self,
        now_ms: i64,
        op: OpCode,
        uid: Uid,
        package: &str,
        state: UidState,
        delta_ms: u64,
    ) -> bool {
        let queued = self.roll_over(now_ms);
        self.window
            .ops
            .increase_access_duration(op, uid, package, state, delta_ms);
        queued
    }

    /// Advance and return the live window, `[0, elapsed)` in now-relative ages.
    pub fn current_snapshot(&mut self, now_ms: i64) -> &HistoricalOps {
        self.roll_over(now_ms);
        &self.window.ops
    }

    // ============================================================================================
    // WRITE QUEUE
    // ============================================================================================

    /// Queue a snapshot that is already expressed in window-end frame ages.
    pub fn queue_external(&mut self, snapshot: HistoricalOps) {
        self.pending.push(snapshot);
    }

    pub fn take_pending(&mut self) -> Option<PendingBatch> {
        if self.pending.is_empty() && self.staged_shift_ms == 0 {
            return None;
        }
        Some(PendingBatch {
            snapshots: std::mem::take(&mut self.pending),
            shift_ms: std::mem::replace(&mut self.staged_shift_ms, 0),
        })
    }

    /// Age everything already on disk by `shift_ms` at the next write.
    pub fn stage_shift(&mut self, shift_ms: i64) {
        self.staged_shift_ms = self.staged_shift_ms.saturating_add(shift_ms);
    }

    /// Put back a batch whose write failed, ahead of anything queued since.
    ///
    /// The batch was taken in an older frame. Its snapshots follow the frame
    /// movement staged since then, so the next write places them exactly
    /// where the failed one would have.
    pub fn restage(&mut self, batch: PendingBatch) {
        let moved = self.staged_shift_ms;
        let mut snapshots = batch.snapshots;
        for snapshot in &mut snapshots {
            snapshot.offset_begin_and_end_time(moved);
        }
        snapshots.append(&mut self.pending);
        self.pending = snapshots;
        self.stage_shift(batch.shift_ms);
    }

    /// Change the window width. Returns how far the window-end frame moved,
    /// which every stored age has to follow.
    pub fn set_base_interval(&mut self, base_interval_ms: i64) -> i64 {
        let delta = base_interval_ms.saturating_sub(self.base_interval_ms);
        self.base_interval_ms = base_interval_ms;
        for snapshot in &mut self.pending {
            snapshot.offset_begin_and_end_time(delta);
        }
        delta
    }

    /// Drop everything and start a fresh window at `now`.
    pub fn reset(&mut self, now_ms: i64) {
        self.window = Window::new(now_ms);
        self.pending.clear();
        self.staged_shift_ms = 0;
    }

    pub fn clear_package(&mut self, uid: Uid, package: Option<&str>) {
        self.window.ops.clear_history(uid, package);
        for snapshot in &mut self.pending {
            snapshot.clear_history(uid, package);
        }
        self.pending.retain(|snapshot| !snapshot.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: i64 = 1_000;
    const OP: OpCode = 42;
    const UID: Uid = 1000;
    const PKG: &str = "com.example";

    fn window_with_access(started_at: i64) -> Window {
        let mut window = Window::new(started_at);
        window
            .ops
            .increase_access_count(OP, UID, PKG, UidState::Foreground, 1);
        window
    }

    #[test]
    fn test_open_window_extends_end() {
        let (window, transition) = Window::new(0).advance(250, BASE);
        assert_eq!(transition, Transition::Open);
        assert_eq!(window.ops().end_ms(), 250);

        let (window, _) = window.advance(900, BASE);
        assert_eq!(window.ops().end_ms(), 900);
        assert_eq!(window.started_at_ms(), 0);
    }

    #[test]
    fn test_due_empty_window_resets() {
        let (window, transition) = Window::new(0).advance(1_500, BASE);
        assert_eq!(transition, Transition::Reset { span_ms: 1_500 });
        assert_eq!(window.started_at_ms(), 1_500);
        assert!(window.ops().is_empty());
    }

    #[test]
    fn test_due_window_closes_on_time() {
        let (window, transition) = window_with_access(0).advance(BASE, BASE);
        match transition {
            Transition::Closed { snapshot, span_ms } => {
                assert_eq!(span_ms, BASE);
                assert_eq!((snapshot.begin_ms(), snapshot.end_ms()), (BASE, 2 * BASE));
                assert_eq!(snapshot.totals().access_count, 1);
            }
            other => panic!("expected Closed, got {:?}", other),
        }
        assert_eq!(window.started_at_ms(), BASE);
        assert!(window.ops().is_empty());
    }

    #[test]
    fn test_overdue_window_keeps_true_close_time() {
        // Closed 400ms late: the snapshot sits 400ms further back.
        let (_, transition) = window_with_access(0).advance(BASE + 400, BASE);
        match transition {
            Transition::Closed { snapshot, span_ms } => {
                assert_eq!(span_ms, BASE + 400);
                assert_eq!(snapshot.begin_ms(), BASE + 400);
                assert_eq!(snapshot.end_ms(), 2 * BASE + 400);
            }
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn test_clock_rewind_restarts_window_and_keeps_counts() {
        let (window, transition) = window_with_access(10_000).advance(9_000, BASE);
        assert_eq!(transition, Transition::ClockRewound { shift_ms: 1_000 });
        assert_eq!(window.started_at_ms(), 9_000);
        assert_eq!(window.ops().totals().access_count, 1);
    }

    #[test]
    fn test_pending_snapshots_follow_the_frame() {
        let mut acc = Accumulator::new(0, BASE);
        assert!(!acc.record_access(100, OP, UID, PKG, UidState::Top));
        assert!(acc.record_access(BASE + 100, OP, UID, PKG, UidState::Top));
        assert!(acc.record_access(2 * BASE + 200, OP, UID, PKG, UidState::Top));

        let batch = acc.take_pending().expect("pending writes");
        assert_eq!(batch.shift_ms, 2 * BASE + 200);
        assert_eq!(batch.snapshots.len(), 2);

        // First window [0, 1000) epoch; frame end is now 2200 + 1000 = 3200.
        assert_eq!(batch.snapshots[0].begin_ms(), 2 * BASE + 200);
        assert_eq!(batch.snapshots[0].end_ms(), 3 * BASE + 200);
        // Second window [1100, 2100) epoch.
        assert_eq!(batch.snapshots[1].begin_ms(), BASE + 100);
        assert_eq!(batch.snapshots[1].end_ms(), 2 * BASE + 100);

        assert!(acc.take_pending().is_none());
    }

    #[test]
    fn test_quiet_windows_still_stage_shift() {
        let mut acc = Accumulator::new(0, BASE);
        assert!(!acc.roll_over(5 * BASE));
        let batch = acc.take_pending().expect("staged shift");
        assert!(batch.snapshots.is_empty());
        assert_eq!(batch.shift_ms, 5 * BASE);
    }

    #[test]
    fn test_restage_after_failed_write() {
        let mut acc = Accumulator::new(0, BASE);
        acc.record_access(10, OP, UID, PKG, UidState::Top);
        acc.roll_over(BASE);
        let batch = acc.take_pending().unwrap();

        // Another window closes while the write is failing.
        acc.record_access(BASE + 10, OP, UID, PKG, UidState::Top);
        acc.roll_over(2 * BASE);
        acc.restage(batch);

        assert_eq!(acc.staged_shift_ms(), 2 * BASE);
        let batch = acc.take_pending().unwrap();
        assert_eq!(batch.shift_ms, 2 * BASE);
        let ranges: Vec<_> = batch
            .snapshots
            .iter()
            .map(|s| (s.begin_ms(), s.end_ms()))
            .collect();
        // The failed window moved one frame back; the newer one is behind it.
        assert_eq!(ranges, vec![(2 * BASE, 3 * BASE), (BASE, 2 * BASE)]);
    }

    #[test]
    fn test_huge_base_interval_saturates() {
        let mut acc = Accumulator::new(1_000_000, i64::MAX);
        acc.record_access(1_000_500, OP, UID, PKG, UidState::Top);
        assert_eq!(acc.frame_offset_ms(1_000_500), i64::MAX - 1_000_500);
        assert_eq!(acc.current_snapshot(1_000_600).totals().access_count, 1);
    }

    #[test]
    fn test_frame_offset() {
        let mut acc = Accumulator::new(1_000, BASE);
        assert_eq!(acc.frame_offset_ms(1_250), 750);
        acc.roll_over(2_300);
        assert_eq!(acc.window().started_at_ms(), 2_300);
        assert_eq!(acc.frame_offset_ms(2_300), BASE);
    }

    #[test]
    fn test_current_snapshot_reports_elapsed() {
        let mut acc = Accumulator::new(0, BASE);
        acc.record_duration(10, OP, UID, PKG, UidState::Background, 50);
        let live = acc.current_snapshot(400);
        assert_eq!((live.begin_ms(), live.end_ms()), (0, 400));
        assert_eq!(live.totals().access_duration_ms, 50);
    }

    #[test]
    fn test_set_base_interval_moves_pending() {
        let mut acc = Accumulator::new(0, BASE);
        acc.record_reject(10, OP, UID, PKG, UidState::Top);
        acc.roll_over(BASE);
        assert_eq!(acc.set_base_interval(2 * BASE), BASE);
        let batch = acc.take_pending().unwrap();
        assert_eq!(batch.snapshots[0].begin_ms(), 2 * BASE);
    }

    #[test]
    fn test_clear_package_drops_empty_pending() {
        let mut acc = Accumulator::new(0, BASE);
        acc.record_access(10, OP, UID, PKG, UidState::Top);
        acc.roll_over(BASE);
        acc.record_access(BASE + 10, OP, UID, "com.other", UidState::Top);
        acc.clear_package(UID, Some(PKG));
        assert_eq!(acc.pending_len(), 0);
        assert_eq!(acc.window().ops().totals().access_count, 1);
    }
}
