//! Historical op accounting.
//!
//! Counts accesses, rejections and access durations per (op, uid, package,
//! state), keeps the newest window in memory and folds closed windows into a
//! leveled on-disk time series whose resolution decays with age.
//!
//! - [`snapshot`]: the counter tree bound to a time interval
//! - [`accumulator`]: the live window and the write queue
//! - [`storage`]: depth files, atomic directory swaps, the decaying store
//! - [`registry`]: the two-lock orchestrator callers talk to
//! - [`flush`]: background writer

pub mod accumulator;
pub mod config;
pub mod dump;
pub mod flush;
pub mod registry;
pub mod snapshot;
pub mod storage;
pub mod types;

pub use accumulator::{Accumulator, PendingBatch, Transition, Window};
pub use config::{HistoricalMode, PersistenceParams, RegistryConfig};
pub use flush::{FlushScheduler, FlushStats, SchedulerConfig};
pub use registry::{DiskSession, HistoricalRegistry, MemoryState, RegistryStats};
pub use snapshot::{HistoricalOps, OpCounters, OpFilter};
pub use storage::{Geometry, SnapshotStore, StoreError, StoreStats};
pub use types::{now_ms, Clock, ManualClock, OpCode, SystemClock, Uid, UidState};
