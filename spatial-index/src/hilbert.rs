//! Hilbert curve utilities for spatial locality.
//!
//! The Hilbert curve is a continuous fractal space-filling curve that maps
//! N-dimensional coordinates to a 1D index while preserving spatial locality.
//! Hilbert R-Trees order their entries by this index, and bulk loading sorts
//! by it before packing leaves.
//!
//! ## Precision
//! Keys are 64 bits wide, so the number of bits per axis shrinks with the
//! dimension: 32 bits for 1D and 2D, 21 bits for 3D and 16 bits for 4D.

use smallvec::SmallVec;

use crate::envelope::Envelope;

/// Maximum order for Hilbert curve encoding (determines precision)
const MAX_HILBERT_ORDER: u32 = 32;

/// Encodes 2D coordinates to a Hilbert curve index.
///
/// # Arguments
/// * `x` - X coordinate (normalized to [0, 1])
/// * `y` - Y coordinate (normalized to [0, 1])
/// * `order` - Hilbert curve order (1-32, higher = more precision)
///
/// # Example
/// ```
/// use spatial_index::hilbert::hilbert_index;
///
/// let index = hilbert_index(0.5, 0.5, 16);
/// assert!(index < (1u64 << 32)); // At order 16, max index is 2^32-1
/// ```
pub fn hilbert_index(x: f64, y: f64, order: u32) -> u64 {
    debug_assert!((0.0..=1.0).contains(&x), "x must be in [0,1]");
    debug_assert!((0.0..=1.0).contains(&y), "y must be in [0,1]");
    debug_assert!(order > 0 && order <= MAX_HILBERT_ORDER, "order must be 1-32");

    let n = 1u64 << order;
    xy2d(n, quantize(x, order), quantize(y, order))
}

/// Encodes N-dimensional normalized coordinates to a Hilbert curve index.
///
/// Uses Skilling's transpose algorithm. `order * coords.len()` must not
/// exceed 64.
pub fn hilbert_index_nd(coords: &[f64], order: u32) -> u64 {
    debug_assert!(order > 0 && order <= MAX_HILBERT_ORDER, "order must be 1-32");
    debug_assert!(order as usize * coords.len() <= 64, "key does not fit in 64 bits");

    let mut axes: SmallVec<[u32; 4]> = coords.iter().map(|c| quantize(*c, order) as u32).collect();
    axes_to_transpose(&mut axes, order);

    let mut index = 0u64;
    for bit in (0..order).rev() {
        for axis in axes.iter() {
            index = (index << 1) | u64::from((axis >> bit) & 1);
        }
    }
    index
}

/// Maps a normalized coordinate onto the `2^order` grid.
fn quantize(v: f64, order: u32) -> u64 {
    let n = 1u64 << order;
    let cell = (v * (n as f64 - 0.5)) as u64;
    cell.min(n - 1)
}

/// Converts (x, y) coordinates on the Hilbert curve to a 1D distance.
///
/// This is the core Hilbert curve algorithm using rotation and reflection.
fn xy2d(n: u64, x: u64, y: u64) -> u64 {
    let mut d = 0u64;
    let mut x = x;
    let mut y = y;
    let mut s = n / 2;

    while s > 0 {
        let rx = ((x & s) > 0) as u64;
        let ry = ((y & s) > 0) as u64;
        d += s * s * ((3 * rx) ^ ry);
        rotate(s, &mut x, &mut y, rx, ry);
        s /= 2;
    }

    d
}

/// Rotates and reflects the coordinate system appropriately for Hilbert curve.
fn rotate(n: u64, x: &mut u64, y: &mut u64, rx: u64, ry: u64) {
    if ry == 0 {
        if rx == 1 {
            *x = n.wrapping_sub(1).wrapping_sub(*x);
            *y = n.wrapping_sub(1).wrapping_sub(*y);
        }
        std::mem::swap(x, y);
    }
}

/// In-place conversion of grid coordinates to the transposed Hilbert index.
fn axes_to_transpose(x: &mut [u32], order: u32) {
    let n = x.len();
    if n == 0 {
        return;
    }
    let m = 1u32 << (order - 1);

    // Inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u32;
    q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }
}

/// Bits per axis used for a key of the given dimension.
pub fn order_for_dimension(dimension: usize) -> u32 {
    match dimension {
        0..=2 => 32,
        3 => 21,
        _ => 16,
    }
}

/// A bounded coordinate space in which envelope centres are mapped to
/// Hilbert keys.
#[derive(Debug, Clone)]
pub struct HilbertSpace {
    domain: Envelope,
    order: u32,
}

impl HilbertSpace {
    pub fn new(domain: Envelope) -> Self {
        let order = order_for_dimension(domain.dimension());
        HilbertSpace { domain, order }
    }

    pub fn domain(&self) -> &Envelope {
        &self.domain
    }

    /// Hilbert key of the centre of `envelope`. Centres outside the domain
    /// are clamped onto its boundary.
    pub fn key(&self, envelope: &Envelope) -> u64 {
        let center = envelope.center();
        let normalized: SmallVec<[f64; 4]> = (0..self.domain.dimension())
            .map(|axis| self.normalize(axis, center.get(axis).copied().unwrap_or(0.0)))
            .collect();

        match normalized.len() {
            1 => quantize(normalized[0], self.order),
            2 => hilbert_index(normalized[0], normalized[1], self.order),
            _ => hilbert_index_nd(&normalized, self.order),
        }
    }

    fn normalize(&self, axis: usize, v: f64) -> f64 {
        let lo = self.domain.min(axis);
        let range = self.domain.max(axis) - lo;
        if range > 0.0 && range.is_finite() {
            let n = (v - lo) / range;
            if n.is_nan() {
                0.5
            } else {
                n.clamp(0.0, 1.0)
            }
        } else {
            0.5
        }
    }
}
