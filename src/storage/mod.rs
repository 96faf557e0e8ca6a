//! Disk side of the history.
//!
//! One directory, one file per decay depth:
//! - **Depth 0**: closed windows at full resolution
//! - **Depth d**: snapshots `m^d` times coarser, `m^d` times older
//!
//! Every write replaces the whole set atomically ([`AtomicDirectory`]);
//! depths a write does not touch are hard-linked forward.

pub mod atomic_dir;
pub mod depth_file;
pub mod geometry;
pub mod persistence;
pub mod types;

pub use atomic_dir::{link_or_copy, AtomicDirectory};
pub use depth_file::{DepthFile, Layout};
pub use geometry::Geometry;
pub use persistence::SnapshotStore;
pub use types::{StoreError, StoreStats};
