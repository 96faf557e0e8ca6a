//! Aggregated op counters bound to a time interval.
//!
//! A [`HistoricalOps`] is the unit everything else moves around: the live
//! window is one, every queued write is one, and every entry of a depth file
//! decodes into one. The tree below it is `uid → package → op → state →
//! counters`; nodes are created on demand and pruned as soon as they hold
//! nothing but zeros.
//!
//! Scaling and splicing are approximations. A counter scaled by `f` becomes
//! `round_half_up(value × f)`. A splice moves `round_half_up(value × f)` into
//! the spliced part and leaves the remainder behind, so a single split never
//! gains or loses a count, but repeated scaling of the same data may drift by
//! one per step.

use crate::types::{OpCode, Uid, UidState};
use std::collections::BTreeMap;

/// Round-half-up for non-negative products.
#[inline]
pub fn round_half_up(value: f64) -> u64 {
    if value <= 0.0 || value.is_nan() {
        return 0;
    }
    (value + 0.5).floor() as u64
}

/// Counters for one (op, uid, package, state) key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpCounters {
    pub access_count: u64,
    pub reject_count: u64,
    pub access_duration_ms: u64,
}

impl OpCounters {
    pub fn new(access_count: u64, reject_count: u64, access_duration_ms: u64) -> Self {
        Self {
            access_count,
            reject_count,
            access_duration_ms,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.access_count == 0 && self.reject_count == 0 && self.access_duration_ms == 0
    }

    pub fn add(&mut self, other: &OpCounters) {
        self.access_count = self.access_count.saturating_add(other.access_count);
        self.reject_count = self.reject_count.saturating_add(other.reject_count);
        self.access_duration_ms = self
            .access_duration_ms
            .saturating_add(other.access_duration_ms);
    }

    pub fn scaled(&self, factor: f64) -> OpCounters {
        if factor >= 1.0 {
            return *self;
        }
        OpCounters {
            access_count: round_half_up(self.access_count as f64 * factor),
            reject_count: round_half_up(self.reject_count as f64 * factor),
            access_duration_ms: round_half_up(self.access_duration_ms as f64 * factor),
        }
    }

    /// Move `fraction` of every counter out of `self`.
    fn splice(&mut self, fraction: f64) -> OpCounters {
        let removed = self.scaled(fraction);
        self.access_count -= removed.access_count;
        self.reject_count -= removed.reject_count;
        self.access_duration_ms -= removed.access_duration_ms;
        removed
    }
}

/// Per-state counters of one op.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpEntry {
    states: BTreeMap<UidState, OpCounters>,
}

impl OpEntry {
    pub fn states(&self) -> impl Iterator<Item = (UidState, &OpCounters)> {
        self.states.iter().map(|(state, counters)| (*state, counters))
    }

    pub fn counters(&self, state: UidState) -> OpCounters {
        self.states.get(&state).copied().unwrap_or_default()
    }

    pub fn counters_mut(&mut self, state: UidState) -> &mut OpCounters {
        self.states.entry(state).or_default()
    }

    pub fn totals(&self) -> OpCounters {
        let mut totals = OpCounters::default();
        for counters in self.states.values() {
            totals.add(counters);
        }
        totals
    }

    pub fn is_empty(&self) -> bool {
        self.states.values().all(OpCounters::is_empty)
    }

    fn merge(&mut self, other: &OpEntry) {
        for (state, counters) in &other.states {
            self.counters_mut(*state).add(counters);
        }
    }

    fn scale(&mut self, factor: f64) {
        for counters in self.states.values_mut() {
            *counters = counters.scaled(factor);
        }
        self.states.retain(|_, counters| !counters.is_empty());
    }

    fn splice(&mut self, fraction: f64) -> Option<OpEntry> {
        let mut spliced = OpEntry::default();
        for (state, counters) in self.states.iter_mut() {
            let removed = counters.splice(fraction);
            if !removed.is_empty() {
                spliced.states.insert(*state, removed);
            }
        }
        self.states.retain(|_, counters| !counters.is_empty());
        (!spliced.states.is_empty()).then_some(spliced)
    }
}

/// Ops noted for one package.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageOps {
    ops: BTreeMap<OpCode, OpEntry>,
}

impl PackageOps {
    pub fn ops(&self) -> impl Iterator<Item = (OpCode, &OpEntry)> {
        self.ops.iter().map(|(op, entry)| (*op, entry))
    }

    pub fn op(&self, op: OpCode) -> Option<&OpEntry> {
        self.ops.get(&op)
    }

    pub fn op_mut(&mut self, op: OpCode) -> &mut OpEntry {
        self.ops.entry(op).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.values().all(OpEntry::is_empty)
    }

    fn totals(&self) -> OpCounters {
        let mut totals = OpCounters::default();
        for entry in self.ops.values() {
            totals.add(&entry.totals());
        }
        totals
    }

    fn merge(&mut self, other: &PackageOps) {
        for (op, entry) in &other.ops {
            self.op_mut(*op).merge(entry);
        }
    }

    fn filter_ops(&mut self, ops: &[OpCode]) {
        self.ops.retain(|op, _| ops.contains(op));
    }

    fn scale(&mut self, factor: f64) {
        for entry in self.ops.values_mut() {
            entry.scale(factor);
        }
        self.ops.retain(|_, entry| !entry.is_empty());
    }

    fn splice(&mut self, fraction: f64) -> Option<PackageOps> {
        let mut spliced = PackageOps::default();
        for (op, entry) in self.ops.iter_mut() {
            if let Some(removed) = entry.splice(fraction) {
                spliced.ops.insert(*op, removed);
            }
        }
        self.ops.retain(|_, entry| !entry.is_empty());
        (!spliced.ops.is_empty()).then_some(spliced)
    }
}

/// Packages noted for one uid.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UidOps {
    packages: BTreeMap<String, PackageOps>,
}

impl UidOps {
    pub fn packages(&self) -> impl Iterator<Item = (&str, &PackageOps)> {
        self.packages.iter().map(|(name, ops)| (name.as_str(), ops))
    }

    pub fn package(&self, package: &str) -> Option<&PackageOps> {
        self.packages.get(package)
    }

    pub fn package_mut(&mut self, package: &str) -> &mut PackageOps {
        self.packages.entry(package.to_string()).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.values().all(PackageOps::is_empty)
    }

    fn totals(&self) -> OpCounters {
        let mut totals = OpCounters::default();
        for package in self.packages.values() {
            totals.add(&package.totals());
        }
        totals
    }

    fn merge(&mut self, other: &UidOps) {
        for (name, package) in &other.packages {
            self.package_mut(name).merge(package);
        }
    }

    fn filter(&mut self, filter: &OpFilter) {
        if let Some(package) = filter.package.as_deref() {
            self.packages.retain(|name, _| name == package);
        }
        if let Some(ops) = filter.ops.as_deref() {
            for package in self.packages.values_mut() {
                package.filter_ops(ops);
            }
        }
        self.packages.retain(|_, package| !package.is_empty());
    }

    fn scale(&mut self, factor: f64) {
        for package in self.packages.values_mut() {
            package.scale(factor);
        }
        self.packages.retain(|_, package| !package.is_empty());
    }

    fn splice(&mut self, fraction: f64) -> Option<UidOps> {
        let mut spliced = UidOps::default();
        for (name, package) in self.packages.iter_mut() {
            if let Some(removed) = package.splice(fraction) {
                spliced.packages.insert(name.clone(), removed);
            }
        }
        self.packages.retain(|_, package| !package.is_empty());
        (!spliced.packages.is_empty()).then_some(spliced)
    }
}

/// Which part of the history a caller is interested in. `None` matches all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpFilter {
    pub uid: Option<Uid>,
    pub package: Option<String>,
    pub ops: Option<Vec<OpCode>>,
}

impl OpFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn ops(mut self, ops: impl Into<Vec<OpCode>>) -> Self {
        self.ops = Some(ops.into());
        self
    }
}

/// Counters of every uid/package/op/state noted during `[begin_ms, end_ms)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistoricalOps {
    begin_ms: i64,
    end_ms: i64,
    uids: BTreeMap<Uid, UidOps>,
}

impl HistoricalOps {
    pub fn new(begin_ms: i64, end_ms: i64) -> Self {
        Self {
            begin_ms,
            end_ms,
            uids: BTreeMap::new(),
        }
    }

    // ============================================================================================
    // TIME
    // ============================================================================================

    pub fn begin_ms(&self) -> i64 {
        self.begin_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms.saturating_sub(self.begin_ms).max(0)
    }

    pub fn set_begin_and_end_time(&mut self, begin_ms: i64, end_ms: i64) {
        self.begin_ms = begin_ms;
        self.end_ms = end_ms;
    }

    pub fn set_begin_time(&mut self, begin_ms: i64) {
        self.begin_ms = begin_ms;
    }

    pub fn offset_begin_and_end_time(&mut self, delta_ms: i64) {
        self.begin_ms = self.begin_ms.saturating_add(delta_ms);
        self.end_ms = self.end_ms.saturating_add(delta_ms);
    }

    // ============================================================================================
    // COUNTERS
    // ============================================================================================

    pub fn uids(&self) -> impl Iterator<Item = (Uid, &UidOps)> {
        self.uids.iter().map(|(uid, ops)| (*uid, ops))
    }

    pub fn uid_ops(&self, uid: Uid) -> Option<&UidOps> {
        self.uids.get(&uid)
    }

    pub fn uid_count(&self) -> usize {
        self.uids.len()
    }

    pub fn counters_mut(
        &mut self,
        op: OpCode,
        uid: Uid,
        package: &str,
        state: UidState,
    ) -> &mut OpCounters {
        self.uids
            .entry(uid)
            .or_default()
            .package_mut(package)
            .op_mut(op)
            .counters_mut(state)
    }

    pub fn increase_access_count(
        &mut self,
        op: OpCode,
        uid: Uid,
        package: &str,
        state: UidState,
        increment: u64,
    ) {
        let counters = self.counters_mut(op, uid, package, state);
        counters.access_count = counters.access_count.saturating_add(increment);
    }

    pub fn increase_reject_count(
        &mut self,
        op: OpCode,
        uid: Uid,
        package: &str,
        state: UidState,
        increment: u64,
    ) {
        let counters = self.counters_mut(op, uid, package, state);
        counters.reject_count = counters.reject_count.saturating_add(increment);
    }

    pub fn increase_access_duration(
        &mut self,
        op: OpCode,
        uid: Uid,
        package: &str,
        state: UidState,
        increment_ms: u64,
    ) {
        let counters = self.counters_mut(op, uid, package, state);
        counters.access_duration_ms = counters.access_duration_ms.saturating_add(increment_ms);
    }

    /// Counters for one key, zero when nothing was noted.
    pub fn counters(&self, uid: Uid, package: &str, op: OpCode, state: UidState) -> OpCounters {
        self.uids
            .get(&uid)
            .and_then(|uid_ops| uid_ops.package(package))
            .and_then(|package_ops| package_ops.op(op))
            .map(|entry| entry.counters(state))
            .unwrap_or_default()
    }

    /// Sum over every key.
    pub fn totals(&self) -> OpCounters {
        let mut totals = OpCounters::default();
        for uid_ops in self.uids.values() {
            totals.add(&uid_ops.totals());
        }
        totals
    }

    pub fn is_empty(&self) -> bool {
        self.uids.values().all(UidOps::is_empty)
    }

    // ============================================================================================
    // TRANSFORMS
    // ============================================================================================

    /// Add `other`'s counters and widen the interval to cover both.
    pub fn merge(&mut self, other: &HistoricalOps) {
        self.begin_ms = self.begin_ms.min(other.begin_ms);
        self.end_ms = self.end_ms.max(other.end_ms);
        for (uid, uid_ops) in &other.uids {
            self.uids.entry(*uid).or_default().merge(uid_ops);
        }
    }

    /// Drop everything `filter` does not select.
    pub fn filter(&mut self, filter: &OpFilter) {
        if let Some(uid) = filter.uid {
            self.uids.retain(|candidate, _| *candidate == uid);
        }
        for uid_ops in self.uids.values_mut() {
            uid_ops.filter(filter);
        }
        self.uids.retain(|_, uid_ops| !uid_ops.is_empty());
    }

    /// Clamp to `[begin_ms, end_ms)` and scale counters by the share of this
    /// interval that survives.
    ///
    /// A zero-length snapshot is an instant: it is kept whole when it falls
    /// inside the range and emptied otherwise.
    pub fn filter_time(&mut self, begin_ms: i64, end_ms: i64) {
        let duration = self.duration_ms();
        let clamped_begin = self.begin_ms.max(begin_ms);
        let clamped_end = self.end_ms.min(end_ms);
        if duration == 0 {
            if !(begin_ms <= self.begin_ms && self.begin_ms < end_ms) {
                self.uids.clear();
            }
            return;
        }
        let overlap = clamped_end - clamped_begin;
        if overlap <= 0 {
            self.uids.clear();
            self.set_begin_and_end_time(clamped_begin, clamped_begin);
            return;
        }
        if overlap < duration {
            self.scale(overlap as f64 / duration as f64);
        }
        self.set_begin_and_end_time(clamped_begin, clamped_end);
    }

    pub fn scale(&mut self, factor: f64) {
        for uid_ops in self.uids.values_mut() {
            uid_ops.scale(factor);
        }
        self.uids.retain(|_, uid_ops| !uid_ops.is_empty());
    }

    /// Cut the trailing `fraction` of this interval (and of every counter)
    /// off into a new snapshot.
    pub fn splice_from_end(&mut self, fraction: f64) -> Option<HistoricalOps> {
        self.splice(fraction, false)
    }

    /// Cut the leading `fraction` of this interval (and of every counter)
    /// off into a new snapshot.
    pub fn splice_from_beginning(&mut self, fraction: f64) -> Option<HistoricalOps> {
        self.splice(fraction, true)
    }

    fn splice(&mut self, fraction: f64, beginning: bool) -> Option<HistoricalOps> {
        let fraction = fraction.clamp(0.0, 1.0);
        let removed_ms = (self.duration_ms() as f64 * fraction).round() as i64;
        let (splice_begin, splice_end) = if beginning {
            let split = self.begin_ms + removed_ms;
            let range = (self.begin_ms, split);
            self.begin_ms = split;
            range
        } else {
            let split = self.end_ms - removed_ms;
            let range = (split, self.end_ms);
            self.end_ms = split;
            range
        };

        let mut spliced = HistoricalOps::new(splice_begin, splice_end);
        for (uid, uid_ops) in self.uids.iter_mut() {
            if let Some(removed) = uid_ops.splice(fraction) {
                spliced.uids.insert(*uid, removed);
            }
        }
        self.uids.retain(|_, uid_ops| !uid_ops.is_empty());
        (!spliced.uids.is_empty()).then_some(spliced)
    }

    /// Forget a package, or a whole uid when `package` is `None`.
    pub fn clear_history(&mut self, uid: Uid, package: Option<&str>) {
        match package {
            None => {
                self.uids.remove(&uid);
            }
            Some(package) => {
                if let Some(uid_ops) = self.uids.get_mut(&uid) {
                    uid_ops.packages.remove(package);
                    if uid_ops.is_empty() {
                        self.uids.remove(&uid);
                    }
                }
            }
        }
    }

    /// Remove every node that holds only zeros.
    pub fn prune_empty(&mut self) {
        self.scale(1.0);
    }
}
