//! Depth boundaries of the decaying store.
//!
//! Ages are measured back from the end of the open window. With base `b` and
//! multiplier `m`:
//!
//! ```text
//!   live window   [0, b)
//!   depth 0       [b, b·m)          slots of b
//!   depth 1       [b·m, b·m²)       slots of b·m
//!   depth d       [b·m^d, b·m^(d+1)) slots of b·m^d
//! ```
//!
//! These are nominal positions. Depth `d` actually starts `C(d)` later, where
//! `C(d)` is the sum of the overflow recorded in the files of depths `< d`.

use crate::config::{PersistenceParams, DEFAULT_MAX_DEPTH};

const FILE_SUFFIX: &str = ".json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub base_interval_ms: i64,
    pub multiplier: i64,
    pub max_depth: usize,
}

impl Geometry {
    /// Clamps degenerate values and caps `max_depth` below the first depth
    /// whose cumulative boundary saturates, so every depth keeps its own
    /// file name.
    pub fn new(base_interval_ms: i64, multiplier: i64, max_depth: usize) -> Self {
        let mut geometry = Self {
            base_interval_ms: base_interval_ms.max(1),
            multiplier: multiplier.max(2),
            max_depth: max_depth.max(1),
        };
        let distinct = (0..geometry.max_depth)
            .position(|depth| geometry.cumulative_boundary_ms(depth) == i64::MAX)
            .unwrap_or(geometry.max_depth);
        geometry.max_depth = distinct.max(1);
        geometry
    }

    pub fn from_params(params: &PersistenceParams, max_depth: usize) -> Self {
        Self::new(params.base_interval_ms, params.multiplier, max_depth)
    }

    /// `b · m^depth`, saturating.
    pub fn slot_ms(&self, depth: usize) -> i64 {
        let exponent = u32::try_from(depth).unwrap_or(u32::MAX);
        self.base_interval_ms
            .saturating_mul(self.multiplier.saturating_pow(exponent))
    }

    /// Nominal age at which `depth` starts.
    #[inline]
    pub fn depth_start_ms(&self, depth: usize) -> i64 {
        self.slot_ms(depth)
    }

    /// Nominal age at which `depth` ends.
    #[inline]
    pub fn depth_end_ms(&self, depth: usize) -> i64 {
        self.slot_ms(depth.saturating_add(1))
    }

    /// `b · (1 + m + … + m^depth)`; strictly increasing until it saturates.
    pub fn cumulative_boundary_ms(&self, depth: usize) -> i64 {
        (0..=depth).fold(0i64, |sum, d| sum.saturating_add(self.slot_ms(d)))
    }

    pub fn file_name(&self, depth: usize) -> String {
        format!("{}{}", self.cumulative_boundary_ms(depth), FILE_SUFFIX)
    }

    /// Depth whose file is called `name`, if any.
    pub fn depth_for_file_name(&self, name: &str) -> Option<usize> {
        let boundary: i64 = name.strip_suffix(FILE_SUFFIX)?.parse().ok()?;
        (0..self.max_depth).find(|depth| self.cumulative_boundary_ms(*depth) == boundary)
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::from_params(&PersistenceParams::default(), DEFAULT_MAX_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_boundaries() {
        let geometry = Geometry::new(1_000, 10, 8);
        assert_eq!(geometry.slot_ms(0), 1_000);
        assert_eq!(geometry.slot_ms(2), 100_000);
        assert_eq!(geometry.depth_start_ms(1), 10_000);
        assert_eq!(geometry.depth_end_ms(1), 100_000);
    }

    #[test]
    fn test_file_names_follow_cumulative_boundary() {
        let geometry = Geometry::new(1_000, 10, 8);
        assert_eq!(geometry.file_name(0), "1000.json");
        assert_eq!(geometry.file_name(1), "11000.json");
        assert_eq!(geometry.file_name(2), "111000.json");

        assert_eq!(geometry.depth_for_file_name("11000.json"), Some(1));
        assert_eq!(geometry.depth_for_file_name("12000.json"), None);
        assert_eq!(geometry.depth_for_file_name("layout.json"), None);
        assert_eq!(geometry.depth_for_file_name("1000.xml"), None);
    }

    #[test]
    fn test_boundaries_saturate() {
        let geometry = Geometry::new(900_000, 10, 32);
        assert_eq!(geometry.slot_ms(31), i64::MAX);
        assert_eq!(geometry.cumulative_boundary_ms(31), i64::MAX);
        let mut previous = 0;
        for depth in 0..14 {
            let boundary = geometry.cumulative_boundary_ms(depth);
            assert!(boundary > previous);
            previous = boundary;
        }
    }

    #[test]
    fn test_depth_cap_stops_before_names_collide() {
        let geometry = Geometry::new(900_000, 10, 32);
        assert_eq!(geometry.max_depth, 13);
        assert!(geometry.cumulative_boundary_ms(geometry.max_depth - 1) < i64::MAX);
        for depth in 0..geometry.max_depth {
            let name = geometry.file_name(depth);
            assert_eq!(geometry.depth_for_file_name(&name), Some(depth));
        }
        assert_eq!(geometry.depth_for_file_name(&format!("{}.json", i64::MAX)), None);

        // Small layouts keep the requested cap.
        assert_eq!(Geometry::new(1_000, 4, 32).max_depth, 27);
        assert_eq!(Geometry::new(1_000, 2, 32).max_depth, 32);
    }

    #[test]
    fn test_degenerate_parameters_are_clamped() {
        let geometry = Geometry::new(0, 1, 0);
        assert_eq!(geometry.base_interval_ms, 1);
        assert_eq!(geometry.multiplier, 2);
        assert_eq!(geometry.max_depth, 1);
    }
}
