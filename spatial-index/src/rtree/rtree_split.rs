//! Node split strategies.
//!
//! All strategies take the `max_elements + 1` entries of an overflowing node
//! and return two groups, each holding at least `min_elements` entries.

use crate::envelope::Envelope;

use super::rtree_constants::{MAGIC_BASIC, MAGIC_HILBERT, MAGIC_STAR};
use super::rtree_types::SpatialEntry;

/// How an overflowing node is divided, which also fixes the tree variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitPolicy {
    /// Guttman's linear split
    Linear,
    /// Guttman's quadratic split
    Quadratic,
    /// R*-Tree topological split with forced reinsertion
    RStar,
    /// Hilbert R-Tree: entries kept in Hilbert key order
    Hilbert,
}

impl SplitPolicy {
    pub fn family(self) -> TreeFamily {
        match self {
            SplitPolicy::Linear | SplitPolicy::Quadratic => TreeFamily::Basic,
            SplitPolicy::RStar => TreeFamily::Star,
            SplitPolicy::Hilbert => TreeFamily::Hilbert,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SplitPolicy::Linear => 0,
            SplitPolicy::Quadratic => 1,
            SplitPolicy::RStar => 2,
            SplitPolicy::Hilbert => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SplitPolicy::Linear),
            1 => Some(SplitPolicy::Quadratic),
            2 => Some(SplitPolicy::RStar),
            3 => Some(SplitPolicy::Hilbert),
            _ => None,
        }
    }
}

/// Tree variants that share an on-disk format. Stores of one family cannot be
/// opened as another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeFamily {
    Basic,
    Star,
    Hilbert,
}

impl TreeFamily {
    pub fn magic(self) -> u32 {
        match self {
            TreeFamily::Basic => MAGIC_BASIC,
            TreeFamily::Star => MAGIC_STAR,
            TreeFamily::Hilbert => MAGIC_HILBERT,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            MAGIC_BASIC => Some(TreeFamily::Basic),
            MAGIC_STAR => Some(TreeFamily::Star),
            MAGIC_HILBERT => Some(TreeFamily::Hilbert),
            _ => None,
        }
    }
}

/// Splits `entries` into two groups according to `policy`.
pub fn split_entries<E: SpatialEntry>(
    entries: Vec<E>,
    policy: SplitPolicy,
    min_elements: usize,
    dimension: usize,
) -> (Vec<E>, Vec<E>) {
    debug_assert!(entries.len() >= 2 * min_elements.max(1));
    match policy {
        SplitPolicy::Linear => {
            let seeds = linear_seeds(&entries, dimension);
            distribute(entries, seeds, min_elements, dimension, false)
        }
        SplitPolicy::Quadratic => {
            let seeds = quadratic_seeds(&entries, dimension);
            distribute(entries, seeds, min_elements, dimension, true)
        }
        SplitPolicy::RStar => rstar_split(entries, min_elements, dimension),
        SplitPolicy::Hilbert => hilbert_split(entries),
    }
}

fn bounds<E: SpatialEntry>(entries: &[E], dimension: usize) -> Envelope {
    let mut env = Envelope::empty(dimension);
    for e in entries {
        env.expand(e.envelope());
    }
    env
}

/// Pair with the greatest separation along any axis, normalized by the extent
/// of all entries on that axis.
fn linear_seeds<E: SpatialEntry>(entries: &[E], dimension: usize) -> (usize, usize) {
    let mut best = (0, 1);
    let mut best_separation = f64::NEG_INFINITY;

    for axis in 0..dimension {
        let mut highest_low = 0;
        let mut lowest_high = 0;
        let mut min_low = f64::INFINITY;
        let mut max_high = f64::NEG_INFINITY;

        for (i, e) in entries.iter().enumerate() {
            let env = e.envelope();
            if env.min(axis) > entries[highest_low].envelope().min(axis) {
                highest_low = i;
            }
            if env.max(axis) < entries[lowest_high].envelope().max(axis) {
                lowest_high = i;
            }
            min_low = min_low.min(env.min(axis));
            max_high = max_high.max(env.max(axis));
        }

        if highest_low == lowest_high {
            // Same entry on both sides: pair it with any other one
            lowest_high = if highest_low == 0 { 1 } else { 0 };
        }

        let width = max_high - min_low;
        let gap = entries[highest_low].envelope().min(axis)
            - entries[lowest_high].envelope().max(axis);
        let separation = if width > 0.0 { gap / width } else { 0.0 };

        if separation > best_separation {
            best_separation = separation;
            best = (lowest_high, highest_low);
        }
    }
    best
}

/// Pair that would waste the most area if put in the same node.
fn quadratic_seeds<E: SpatialEntry>(entries: &[E], _dimension: usize) -> (usize, usize) {
    let mut best = (0, 1);
    let mut worst_waste = f64::NEG_INFINITY;
    for i in 0..entries.len() {
        for j in (i + 1)..entries.len() {
            let a = entries[i].envelope();
            let b = entries[j].envelope();
            let waste = a.union(b).area() - a.area() - b.area();
            if waste > worst_waste {
                worst_waste = waste;
                best = (i, j);
            }
        }
    }
    best
}

/// Assigns the remaining entries to the two seed groups by least enlargement.
/// With `pick_next` the entry with the strongest preference goes first;
/// otherwise entries are taken in order.
fn distribute<E: SpatialEntry>(
    entries: Vec<E>,
    seeds: (usize, usize),
    min_elements: usize,
    dimension: usize,
    pick_next: bool,
) -> (Vec<E>, Vec<E>) {
    let (s1, s2) = seeds;
    let mut group1 = Vec::with_capacity(entries.len());
    let mut group2 = Vec::with_capacity(entries.len());
    let mut rest = Vec::with_capacity(entries.len());

    for (i, e) in entries.into_iter().enumerate() {
        if i == s1 {
            group1.push(e);
        } else if i == s2 {
            group2.push(e);
        } else {
            rest.push(e);
        }
    }

    let mut env1 = bounds(&group1, dimension);
    let mut env2 = bounds(&group2, dimension);

    while !rest.is_empty() {
        if group1.len() + rest.len() <= min_elements {
            group1.append(&mut rest);
            break;
        }
        if group2.len() + rest.len() <= min_elements {
            group2.append(&mut rest);
            break;
        }

        let idx = if pick_next {
            let mut best = 0;
            let mut best_diff = f64::NEG_INFINITY;
            for (i, e) in rest.iter().enumerate() {
                let d1 = env1.enlargement(e.envelope());
                let d2 = env2.enlargement(e.envelope());
                let diff = (d1 - d2).abs();
                if diff > best_diff {
                    best_diff = diff;
                    best = i;
                }
            }
            best
        } else {
            rest.len() - 1
        };

        let e = rest.swap_remove(idx);
        let d1 = env1.enlargement(e.envelope());
        let d2 = env2.enlargement(e.envelope());
        let to_first = if d1 != d2 {
            d1 < d2
        } else if env1.area() != env2.area() {
            env1.area() < env2.area()
        } else {
            group1.len() <= group2.len()
        };

        if to_first {
            env1.expand(e.envelope());
            group1.push(e);
        } else {
            env2.expand(e.envelope());
            group2.push(e);
        }
    }

    (group1, group2)
}

fn sort_by_axis<E: SpatialEntry>(entries: &mut [E], axis: usize, by_max: bool) {
    entries.sort_by(|a, b| {
        let (a, b) = (a.envelope(), b.envelope());
        if by_max {
            a.max(axis)
                .total_cmp(&b.max(axis))
                .then(a.min(axis).total_cmp(&b.min(axis)))
        } else {
            a.min(axis)
                .total_cmp(&b.min(axis))
                .then(a.max(axis).total_cmp(&b.max(axis)))
        }
    });
}

/// Envelopes of every prefix and every suffix of `entries`.
fn prefix_suffix<E: SpatialEntry>(
    entries: &[E],
    dimension: usize,
) -> (Vec<Envelope>, Vec<Envelope>) {
    let n = entries.len();
    let mut prefix = Vec::with_capacity(n + 1);
    let mut acc = Envelope::empty(dimension);
    prefix.push(acc.clone());
    for e in entries {
        acc.expand(e.envelope());
        prefix.push(acc.clone());
    }

    let mut suffix = vec![Envelope::empty(dimension); n + 1];
    let mut acc = Envelope::empty(dimension);
    for i in (0..n).rev() {
        acc.expand(entries[i].envelope());
        suffix[i] = acc.clone();
    }
    (prefix, suffix)
}

fn rstar_split<E: SpatialEntry>(
    entries: Vec<E>,
    min_elements: usize,
    dimension: usize,
) -> (Vec<E>, Vec<E>) {
    let n = entries.len();
    let min = min_elements.max(1);

    // Choose the split axis: least total margin over all distributions
    let mut best_axis = 0;
    let mut best_margin = f64::INFINITY;
    for axis in 0..dimension {
        let mut margin = 0.0;
        for by_max in [false, true] {
            let mut sorted = entries.clone();
            sort_by_axis(&mut sorted, axis, by_max);
            let (prefix, suffix) = prefix_suffix(&sorted, dimension);
            for k in min..=(n - min) {
                margin += prefix[k].margin() + suffix[k].margin();
            }
        }
        if margin < best_margin {
            best_margin = margin;
            best_axis = axis;
        }
    }

    // Choose the distribution on that axis: least overlap, then least area
    let mut best: Option<(bool, usize)> = None;
    let mut best_overlap = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for by_max in [false, true] {
        let mut sorted = entries.clone();
        sort_by_axis(&mut sorted, best_axis, by_max);
        let (prefix, suffix) = prefix_suffix(&sorted, dimension);
        for k in min..=(n - min) {
            let overlap = prefix[k].overlap(&suffix[k]);
            let area = prefix[k].area() + suffix[k].area();
            if overlap < best_overlap || (overlap == best_overlap && area < best_area) {
                best_overlap = overlap;
                best_area = area;
                best = Some((by_max, k));
            }
        }
    }

    let (by_max, k) = best.unwrap_or((false, n / 2));
    let mut sorted = entries;
    sort_by_axis(&mut sorted, best_axis, by_max);
    let second = sorted.split_off(k);
    (sorted, second)
}

fn hilbert_split<E: SpatialEntry>(mut entries: Vec<E>) -> (Vec<E>, Vec<E>) {
    entries.sort_by_key(|e| e.key());
    let second = entries.split_off(entries.len() / 2);
    (entries, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtree::rtree_types::LeafEntry;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn entry(min_x: f64, min_y: f64, max_x: f64, max_y: f64, id: u64) -> LeafEntry {
        LeafEntry {
            envelope: Envelope::rect(min_x, min_y, max_x, max_y),
            id,
            hilbert: id,
        }
    }

    fn random_entries(n: usize, seed: u64) -> Vec<LeafEntry> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n as u64)
            .map(|id| {
                let x = rng.gen_range(0.0..100.0);
                let y = rng.gen_range(0.0..100.0);
                LeafEntry {
                    envelope: Envelope::rect(x, y, x + rng.gen_range(0.0..5.0), y + 1.0),
                    id,
                    hilbert: rng.gen_range(0..1_000_000),
                }
            })
            .collect()
    }

    fn ids(group: &[LeafEntry]) -> Vec<u64> {
        let mut v: Vec<u64> = group.iter().map(|e| e.id).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn test_policy_codes() {
        for policy in [
            SplitPolicy::Linear,
            SplitPolicy::Quadratic,
            SplitPolicy::RStar,
            SplitPolicy::Hilbert,
        ] {
            assert_eq!(SplitPolicy::from_u8(policy.as_u8()), Some(policy));
            assert_eq!(TreeFamily::from_magic(policy.family().magic()), Some(policy.family()));
        }
        assert_eq!(SplitPolicy::from_u8(9), None);
        assert_eq!(SplitPolicy::Linear.family(), SplitPolicy::Quadratic.family());
    }

    #[test]
    fn test_all_policies_respect_min_fill() {
        for policy in [
            SplitPolicy::Linear,
            SplitPolicy::Quadratic,
            SplitPolicy::RStar,
            SplitPolicy::Hilbert,
        ] {
            for seed in 0..20 {
                let max = 4 + (seed as usize % 30);
                let min = (max * 2 / 5).clamp(1, max / 2);
                let entries = random_entries(max + 1, seed);
                let (a, b) = split_entries(entries, policy, min, 2);
                assert!(a.len() >= min, "{:?} left {} < {}", policy, a.len(), min);
                assert!(b.len() >= min, "{:?} right {} < {}", policy, b.len(), min);
                assert_eq!(a.len() + b.len(), max + 1);

                let mut all = ids(&a);
                all.extend(ids(&b));
                all.sort_unstable();
                assert_eq!(all, (0..=max as u64).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_linear_separates_clusters() {
        let entries = vec![
            entry(0.0, 0.0, 1.0, 1.0, 1),
            entry(0.5, 0.5, 1.5, 1.5, 2),
            entry(100.0, 100.0, 101.0, 101.0, 3),
            entry(100.5, 100.5, 101.5, 101.5, 4),
            entry(1.0, 1.0, 2.0, 2.0, 5),
        ];
        let (a, b) = split_entries(entries, SplitPolicy::Linear, 2, 2);
        let (a, b) = (ids(&a), ids(&b));
        let (near, far) = if a.contains(&3) { (b, a) } else { (a, b) };
        assert_eq!(far, vec![3, 4]);
        assert_eq!(near, vec![1, 2, 5]);
    }

    #[test]
    fn test_quadratic_separates_clusters() {
        let entries = vec![
            entry(0.0, 0.0, 1.0, 1.0, 1),
            entry(50.0, 50.0, 51.0, 51.0, 2),
            entry(0.5, 0.0, 1.5, 1.0, 3),
            entry(50.5, 50.0, 51.5, 51.0, 4),
        ];
        let (a, b) = split_entries(entries, SplitPolicy::Quadratic, 2, 2);
        let (a, b) = (ids(&a), ids(&b));
        assert!(a == vec![1, 3] || a == vec![2, 4]);
        assert!(b == vec![1, 3] || b == vec![2, 4]);
    }

    #[test]
    fn test_rstar_prefers_no_overlap() {
        // Two columns: splitting along x gives zero overlap
        let mut entries = Vec::new();
        for i in 0..3 {
            entries.push(entry(0.0, i as f64 * 10.0, 1.0, i as f64 * 10.0 + 1.0, i));
            entries.push(entry(20.0, i as f64 * 10.0, 21.0, i as f64 * 10.0 + 1.0, 10 + i));
        }
        let (a, b) = split_entries(entries, SplitPolicy::RStar, 2, 2);
        let ea = bounds(&a, 2);
        let eb = bounds(&b, 2);
        assert_eq!(ea.overlap(&eb), 0.0);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_hilbert_split_is_ordered() {
        let entries = random_entries(9, 42);
        let (a, b) = split_entries(entries, SplitPolicy::Hilbert, 3, 2);
        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 5);
        let max_a = a.iter().map(|e| e.hilbert).max().unwrap();
        let min_b = b.iter().map(|e| e.hilbert).min().unwrap();
        assert!(max_a <= min_b);
        assert!(a.windows(2).all(|w| w[0].hilbert <= w[1].hilbert));
    }

    #[test]
    fn test_identical_entries_still_split() {
        let entries: Vec<LeafEntry> = (0..5).map(|id| entry(1.0, 1.0, 2.0, 2.0, id)).collect();
        for policy in [SplitPolicy::Linear, SplitPolicy::Quadratic, SplitPolicy::RStar] {
            let (a, b) = split_entries(entries.clone(), policy, 2, 2);
            assert!(a.len() >= 2 && b.len() >= 2);
        }
    }
}
