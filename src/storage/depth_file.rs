//! On-disk format of one depth and of the layout header.
//!
//! # Depth file
//! ```json
//! {
//!   "version": 1,
//!   "overflow_ms": 0,
//!   "snapshots": [
//!     { "begin_ms": 0, "end_ms": 900000, "uids": [
//!       { "uid": 1000, "packages": [
//!         { "name": "com.example", "ops": [
//!           { "op": 42, "states": [
//!             { "state": "foreground", "access_count": 3 }
//!           ] }
//!         ] }
//!       ] }
//!     ] }
//!   ]
//! }
//! ```
//!
//! Snapshot times are relative to where the depth starts. Zero counters and
//! empty nodes are never written.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::snapshot::HistoricalOps;
use crate::storage::types::StoreError;
use crate::types::{OpCode, Uid, UidState};

pub const DEPTH_FILE_VERSION: u32 = 1;
pub const LAYOUT_VERSION: u32 = 1;
pub const LAYOUT_FILE: &str = "layout.json";

#[derive(Debug, Serialize, Deserialize)]
struct DepthDocument {
    version: u32,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    overflow_ms: i64,
    #[serde(default)]
    snapshots: Vec<SnapshotRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    begin_ms: i64,
    end_ms: i64,
    #[serde(default)]
    uids: Vec<UidRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UidRecord {
    uid: Uid,
    packages: Vec<PackageRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PackageRecord {
    name: String,
    ops: Vec<OpRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpRecord {
    op: OpCode,
    states: Vec<StateRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    state: UidState,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    access_count: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    reject_count: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    access_duration_ms: u64,
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

impl SnapshotRecord {
    fn from_ops(ops: &HistoricalOps) -> Self {
        let uids = ops
            .uids()
            .map(|(uid, uid_ops)| UidRecord {
                uid,
                packages: uid_ops
                    .packages()
                    .map(|(name, package)| PackageRecord {
                        name: name.to_string(),
                        ops: package
                            .ops()
                            .map(|(op, entry)| OpRecord {
                                op,
                                states: entry
                                    .states()
                                    .filter(|(_, counters)| !counters.is_empty())
                                    .map(|(state, counters)| StateRecord {
                                        state,
                                        access_count: counters.access_count,
                                        reject_count: counters.reject_count,
                                        access_duration_ms: counters.access_duration_ms,
                                    })
                                    .collect(),
                            })
                            .filter(|op: &OpRecord| !op.states.is_empty())
                            .collect(),
                    })
                    .filter(|package: &PackageRecord| !package.ops.is_empty())
                    .collect(),
            })
            .filter(|uid: &UidRecord| !uid.packages.is_empty())
            .collect();
        Self {
            begin_ms: ops.begin_ms(),
            end_ms: ops.end_ms(),
            uids,
        }
    }

    fn into_ops(self) -> HistoricalOps {
        let mut ops = HistoricalOps::new(self.begin_ms, self.end_ms);
        for uid in self.uids {
            for package in uid.packages {
                for op in package.ops {
                    for state in op.states {
                        let counters = ops.counters_mut(op.op, uid.uid, &package.name, state.state);
                        counters.access_count = counters.access_count.saturating_add(state.access_count);
                        counters.reject_count = counters.reject_count.saturating_add(state.reject_count);
                        counters.access_duration_ms = counters
                            .access_duration_ms
                            .saturating_add(state.access_duration_ms);
                    }
                }
            }
        }
        ops.prune_empty();
        ops
    }
}

/// Decoded contents of one depth file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DepthFile {
    /// How far past its nominal end this depth's data reaches
    pub overflow_ms: i64,
    /// Depth-relative snapshots, ascending and non-overlapping
    pub snapshots: Vec<HistoricalOps>,
}

impl DepthFile {
    pub fn new(overflow_ms: i64, snapshots: Vec<HistoricalOps>) -> Self {
        Self {
            overflow_ms,
            snapshots,
        }
    }

    pub fn read(path: &Path) -> Result<Self, StoreError> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes, path)
    }

    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self, StoreError> {
        let document: DepthDocument = serde_json::from_slice(bytes)?;
        if document.version != DEPTH_FILE_VERSION {
            return Err(StoreError::corrupt(
                path,
                format!("unsupported version {}", document.version),
            ));
        }
        if document.overflow_ms < 0 {
            return Err(StoreError::corrupt(
                path,
                format!("negative overflow {}", document.overflow_ms),
            ));
        }

        let mut previous_end = 0i64;
        for record in &document.snapshots {
            if record.begin_ms < 0 || record.end_ms < record.begin_ms {
                return Err(StoreError::corrupt(
                    path,
                    format!("invalid interval [{}, {})", record.begin_ms, record.end_ms),
                ));
            }
            if record.begin_ms < previous_end {
                return Err(StoreError::corrupt(
                    path,
                    format!(
                        "snapshot at {} overlaps previous ending at {}",
                        record.begin_ms, previous_end
                    ),
                ));
            }
            previous_end = record.end_ms;
        }

        Ok(Self {
            overflow_ms: document.overflow_ms,
            snapshots: document
                .snapshots
                .into_iter()
                .map(SnapshotRecord::into_ops)
                .collect(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let document = DepthDocument {
            version: DEPTH_FILE_VERSION,
            overflow_ms: self.overflow_ms,
            snapshots: self
                .snapshots
                .iter()
                .filter(|ops| !ops.is_empty())
                .map(SnapshotRecord::from_ops)
                .collect(),
        };
        Ok(serde_json::to_vec(&document)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = self.encode()?;
        write_synced(path, &bytes)
    }
}

/// Geometry the committed set was written with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub version: u32,
    pub base_interval_ms: i64,
    pub multiplier: i64,
}

impl Layout {
    pub fn new(base_interval_ms: i64, multiplier: i64) -> Self {
        Self {
            version: LAYOUT_VERSION,
            base_interval_ms,
            multiplier,
        }
    }

    /// `Ok(None)` when the directory has no layout header.
    pub fn read(dir: &Path) -> Result<Option<Self>, StoreError> {
        let path = dir.join(LAYOUT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let layout: Layout = serde_json::from_slice(&bytes)?;
        if layout.version != LAYOUT_VERSION {
            return Err(StoreError::corrupt(
                &path,
                format!("unsupported layout version {}", layout.version),
            ));
        }
        if layout.base_interval_ms < 1 || layout.multiplier < 2 {
            return Err(StoreError::corrupt(
                &path,
                format!(
                    "invalid geometry base={} multiplier={}",
                    layout.base_interval_ms, layout.multiplier
                ),
            ));
        }
        Ok(Some(layout))
    }

    pub fn write(&self, dir: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_synced(&dir.join(LAYOUT_FILE), &bytes)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}
