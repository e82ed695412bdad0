// SPDX-License-Identifier: AGPL-3.0-only

//! Core topology and contiguous-window ("shape") arithmetic.
//!
//! Cores sit on a line. A multi-core task always runs on a run of adjacent
//! cores, so for `C` cores there are `C·(C+1)/2` distinct windows. The driver
//! keeps one dispatch lane per window and indexes lanes with
//! [`CoreTopology::shape_index`].
//!
//! Shape indices are grouped by window length, then by start core:
//!
//! ```text
//! C = 3
//! index  0    1    2    3      4      5
//! shape  [0]  [1]  [2]  [0,1]  [1,2]  [0,1,2]
//! ```

/// Upper bound on cores per device (core masks are `u32`, shape bitmaps `u64`).
pub const MAX_CORES: u8 = 8;

/// A contiguous run of cores `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape {
    /// First core of the window.
    pub start: u8,
    /// Number of cores in the window (>= 1).
    pub len: u8,
}

impl Shape {
    /// Window `[start, start + len)`.
    #[must_use]
    pub const fn new(start: u8, len: u8) -> Self {
        Self { start, len }
    }

    /// One past the last core.
    #[must_use]
    pub const fn end(&self) -> u8 {
        self.start + self.len
    }

    /// Bitmask with one bit per core in the window.
    #[must_use]
    pub const fn mask(&self) -> u32 {
        if self.len == 0 {
            return 0;
        }
        (u32::MAX >> (32 - self.len as u32)) << self.start
    }

    /// Whether `core` lies inside the window.
    #[must_use]
    pub const fn contains(&self, core: u8) -> bool {
        core >= self.start && core < self.end()
    }

    /// Iterator over the cores in the window.
    pub fn cores(&self) -> impl Iterator<Item = u8> {
        self.start..self.end()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{})", self.start, self.end())
    }
}

/// Linear core topology of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreTopology {
    cores: u8,
}

impl CoreTopology {
    /// Topology with `cores` cores. `None` if `cores` is zero or above [`MAX_CORES`].
    #[must_use]
    pub const fn new(cores: u8) -> Option<Self> {
        if cores == 0 || cores > MAX_CORES {
            None
        } else {
            Some(Self { cores })
        }
    }

    /// Number of cores.
    #[must_use]
    pub const fn cores(&self) -> u8 {
        self.cores
    }

    /// Number of distinct windows, `C·(C+1)/2`.
    #[must_use]
    pub const fn shape_count(&self) -> usize {
        let c = self.cores as usize;
        c * (c + 1) / 2
    }

    /// Mask covering every core.
    #[must_use]
    pub const fn full_mask(&self) -> u32 {
        Shape::new(0, self.cores).mask()
    }

    /// Whether `shape` fits on this device.
    #[must_use]
    pub const fn is_valid(&self, shape: Shape) -> bool {
        shape.len >= 1 && shape.len <= self.cores && shape.start <= self.cores - shape.len
    }

    /// First lane index used by windows of length `len`.
    const fn len_offset(&self, len: u8) -> usize {
        let c = self.cores as usize;
        let l = len as usize - 1;
        l * c - l * l.saturating_sub(1) / 2
    }

    /// Lane index of `shape`, or `None` if it does not fit.
    #[must_use]
    pub const fn shape_index(&self, shape: Shape) -> Option<usize> {
        if !self.is_valid(shape) {
            return None;
        }
        Some(self.len_offset(shape.len) + shape.start as usize)
    }

    /// Window stored at lane `index`.
    #[must_use]
    pub fn shape_at(&self, index: usize) -> Option<Shape> {
        (1..=self.cores).find_map(|len| {
            let base = self.len_offset(len);
            let count = (self.cores - len + 1) as usize;
            (index >= base && index < base + count)
                .then(|| Shape::new(u8::try_from(index - base).unwrap_or(0), len))
        })
    }

    /// Every window, in lane order.
    pub fn shapes(&self) -> impl Iterator<Item = Shape> + '_ {
        (1..=self.cores).flat_map(move |len| (0..=self.cores - len).map(move |s| Shape::new(s, len)))
    }

    /// Every window of length `len`, by start core.
    pub fn windows(&self, len: u8) -> impl Iterator<Item = Shape> {
        let last = if len == 0 || len > self.cores { None } else { Some(self.cores - len) };
        last.into_iter().flat_map(move |l| (0..=l).map(move |s| Shape::new(s, len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_count_is_triangular() {
        for c in 1..=MAX_CORES {
            let t = CoreTopology::new(c).unwrap();
            assert_eq!(t.shape_count(), t.shapes().count());
            assert_eq!(t.shape_count(), usize::from(c) * (usize::from(c) + 1) / 2);
        }
    }

    #[test]
    fn shape_index_matches_lane_order() {
        for c in 1..=MAX_CORES {
            let t = CoreTopology::new(c).unwrap();
            for (i, s) in t.shapes().enumerate() {
                assert_eq!(t.shape_index(s), Some(i), "{s} on {c} cores");
                assert_eq!(t.shape_at(i), Some(s));
            }
            assert_eq!(t.shape_at(t.shape_count()), None);
        }
    }

    #[test]
    fn three_core_layout() {
        let t = CoreTopology::new(3).unwrap();
        let shapes: Vec<_> = t.shapes().collect();
        assert_eq!(
            shapes,
            vec![
                Shape::new(0, 1),
                Shape::new(1, 1),
                Shape::new(2, 1),
                Shape::new(0, 2),
                Shape::new(1, 2),
                Shape::new(0, 3),
            ]
        );
    }

    #[test]
    fn invalid_shapes_rejected() {
        let t = CoreTopology::new(4).unwrap();
        assert_eq!(t.shape_index(Shape::new(3, 2)), None);
        assert_eq!(t.shape_index(Shape::new(0, 0)), None);
        assert_eq!(t.shape_index(Shape::new(0, 5)), None);
        assert!(CoreTopology::new(0).is_none());
        assert!(CoreTopology::new(MAX_CORES + 1).is_none());
    }

    #[test]
    fn masks() {
        assert_eq!(Shape::new(0, 1).mask(), 0b1);
        assert_eq!(Shape::new(1, 2).mask(), 0b110);
        assert_eq!(CoreTopology::new(4).unwrap().full_mask(), 0b1111);
        assert!(Shape::new(1, 2).contains(2));
        assert!(!Shape::new(1, 2).contains(3));
    }

    #[test]
    fn windows_by_length() {
        let t = CoreTopology::new(4).unwrap();
        assert_eq!(t.windows(2).count(), 3);
        assert_eq!(t.windows(4).collect::<Vec<_>>(), vec![Shape::new(0, 4)]);
        assert_eq!(t.windows(5).count(), 0);
    }
}
