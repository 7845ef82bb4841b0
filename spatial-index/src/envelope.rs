use smallvec::SmallVec;

use crate::rtree::rtree_constants::MAX_DIMENSION;
use crate::rtree::rtree_types::{SpatialError, SpatialResult};

/// Per-axis coordinate storage, inline for the common 1-3 dimensional cases.
pub type Coords = SmallVec<[f64; 3]>;

/// An axis-aligned box in N dimensions.
///
/// `Envelope` stores the minimum and maximum coordinate of every axis, in the
/// axis order of the tree's coordinate reference system. An envelope whose
/// minimum exceeds its maximum on any axis is *empty*; the empty envelope is
/// the identity of [`Envelope::expand`].
///
/// # Examples
///
/// ```rust
/// use spatial_index::Envelope;
///
/// let a = Envelope::rect(0.0, 0.0, 10.0, 10.0);
/// let b = Envelope::rect(5.0, 5.0, 15.0, 15.0);
///
/// assert!(a.intersects(&b));
/// assert_eq!(a.overlap(&b), 25.0);
/// assert_eq!(a.union(&b), Envelope::rect(0.0, 0.0, 15.0, 15.0));
/// ```
#[derive(Clone, PartialEq, Debug, serde::Deserialize, serde::Serialize)]
pub struct Envelope {
    min: Coords,
    max: Coords,
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope(")?;
        for axis in 0..self.dimension() {
            if axis > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{}, {}]", self.min[axis], self.max[axis])?;
        }
        write!(f, ")")
    }
}

impl Envelope {
    /// Creates a 2D envelope from its corners.
    pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope {
            min: SmallVec::from_slice(&[min_x, min_y]),
            max: SmallVec::from_slice(&[max_x, max_y]),
        }
    }

    /// Creates a 3D envelope from its corners.
    pub fn cube(min: [f64; 3], max: [f64; 3]) -> Envelope {
        Envelope {
            min: SmallVec::from_slice(&min),
            max: SmallVec::from_slice(&max),
        }
    }

    /// Creates a degenerate envelope covering a single point.
    pub fn point(coords: &[f64]) -> Envelope {
        Envelope {
            min: SmallVec::from_slice(coords),
            max: SmallVec::from_slice(coords),
        }
    }

    /// Creates an envelope from per-axis bounds, validating them.
    ///
    /// Fails with `InvalidOperation` when the slices differ in length, the
    /// dimension is outside 1..=4, a coordinate is NaN or a minimum exceeds
    /// its maximum.
    pub fn from_bounds(min: &[f64], max: &[f64]) -> SpatialResult<Envelope> {
        let envelope = Envelope {
            min: SmallVec::from_slice(min),
            max: SmallVec::from_slice(max),
        };
        if min.len() != max.len() {
            return Err(SpatialError::InvalidOperation(format!(
                "envelope bounds differ in length: {} minimums, {} maximums",
                min.len(),
                max.len()
            )));
        }
        envelope.validate(min.len())?;
        Ok(envelope)
    }

    /// The empty envelope of the given dimension.
    pub fn empty(dimension: usize) -> Envelope {
        Envelope {
            min: SmallVec::from_elem(f64::INFINITY, dimension),
            max: SmallVec::from_elem(f64::NEG_INFINITY, dimension),
        }
    }

    /// Builds an envelope without validation. Used by the codec, which
    /// reproduces whatever was stored.
    pub(crate) fn from_coords(min: Coords, max: Coords) -> Envelope {
        Envelope { min, max }
    }

    /// Checks that this envelope is a well-formed, non-empty box of the given
    /// dimension.
    pub fn validate(&self, dimension: usize) -> SpatialResult<()> {
        if self.dimension() != dimension {
            return Err(SpatialError::InvalidOperation(format!(
                "envelope has {} dimensions, expected {}",
                self.dimension(),
                dimension
            )));
        }
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(SpatialError::InvalidOperation(format!(
                "unsupported envelope dimension {}",
                dimension
            )));
        }
        for axis in 0..dimension {
            let (lo, hi) = (self.min[axis], self.max[axis]);
            if lo.is_nan() || hi.is_nan() {
                return Err(SpatialError::InvalidOperation(format!(
                    "NaN coordinate on axis {}",
                    axis
                )));
            }
            if lo > hi {
                return Err(SpatialError::InvalidOperation(format!(
                    "minimum {} exceeds maximum {} on axis {}",
                    lo, hi, axis
                )));
            }
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self, axis: usize) -> f64 {
        self.min[axis]
    }

    pub fn max(&self, axis: usize) -> f64 {
        self.max[axis]
    }

    pub fn mins(&self) -> &[f64] {
        &self.min
    }

    pub fn maxs(&self) -> &[f64] {
        &self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min.iter().zip(self.max.iter()).any(|(lo, hi)| lo > hi)
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        (0..self.dimension()).all(|a| self.min[a] <= other.max[a] && other.min[a] <= self.max[a])
    }

    /// True if `other` lies entirely inside this envelope (boundaries included).
    pub fn contains(&self, other: &Envelope) -> bool {
        if other.is_empty() {
            return true;
        }
        if self.is_empty() {
            return false;
        }
        (0..self.dimension()).all(|a| self.min[a] <= other.min[a] && other.max[a] <= self.max[a])
    }

    /// N-dimensional volume; zero for empty envelopes.
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (0..self.dimension())
            .map(|a| self.max[a] - self.min[a])
            .product()
    }

    /// Sum of the extents over all axes.
    pub fn margin(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (0..self.dimension())
            .map(|a| self.max[a] - self.min[a])
            .sum()
    }

    /// Area increase needed for this envelope to also cover `other`.
    pub fn enlargement(&self, other: &Envelope) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Volume of the intersection with `other`.
    pub fn overlap(&self, other: &Envelope) -> f64 {
        if !self.intersects(other) {
            return 0.0;
        }
        (0..self.dimension())
            .map(|a| self.max[a].min(other.max[a]) - self.min[a].max(other.min[a]))
            .product()
    }

    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut merged = self.clone();
        merged.expand(other);
        merged
    }

    /// Grows this envelope in place to also cover `other`.
    pub fn expand(&mut self, other: &Envelope) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }
        for a in 0..self.dimension() {
            self.min[a] = self.min[a].min(other.min[a]);
            self.max[a] = self.max[a].max(other.max[a]);
        }
    }

    pub fn center(&self) -> Coords {
        (0..self.dimension())
            .map(|a| (self.min[a] + self.max[a]) / 2.0)
            .collect()
    }

    /// Euclidean distance from `point` to the nearest point of this envelope,
    /// zero when the point is inside.
    pub fn min_distance(&self, point: &[f64]) -> f64 {
        if self.is_empty() {
            return f64::INFINITY;
        }
        (0..self.dimension())
            .map(|a| {
                let p = point.get(a).copied().unwrap_or(0.0);
                let d = if p < self.min[a] {
                    self.min[a] - p
                } else if p > self.max[a] {
                    p - self.max[a]
                } else {
                    0.0
                };
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Squared distance between the centres of two envelopes.
    pub(crate) fn center_distance_sq(&self, other: &Envelope) -> f64 {
        (0..self.dimension())
            .map(|a| {
                let d = (self.min[a] + self.max[a]) / 2.0 - (other.min[a] + other.max[a]) / 2.0;
                d * d
            })
            .sum()
    }
}
