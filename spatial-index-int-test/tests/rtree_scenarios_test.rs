//! Structural scenarios across every tree variant.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spatial_index::{Envelope, SpatialResult, SplitPolicy};
use spatial_index_int_test::test_util::{
    assert_integrity, brute_force_search, cleanup, memory_context, random_envelope, run_test,
    test_config, ALL_POLICIES,
};

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_five_unit_squares_split_once() {
    run_test(
        memory_context,
        |ctx| {
            let mut tree = ctx.create_tree(test_config(SplitPolicy::Quadratic, 4)?)?;
            for i in 0..5u64 {
                let x = i as f64 * 2.0;
                tree.insert(i, Envelope::rect(x, 0.0, x + 1.0, 1.0))?;
            }

            assert_eq!(tree.stats().splits, 1);
            assert_eq!(tree.height(), 2);
            assert_eq!(tree.len(), 5);
            assert_eq!(
                tree.search_ids(&Envelope::rect(0.0, 0.0, 9.0, 1.0))?,
                vec![0, 1, 2, 3, 4]
            );

            // Root plus its two leaves
            let report = tree.check_integrity()?;
            assert!(report.is_valid, "integrity errors: {:?}", report.errors);
            assert_eq!(report.pages_checked, 3);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_random_inserts_and_deletes() {
    run_test(
        memory_context,
        |ctx| {
            for policy in ALL_POLICIES {
                let mut rng = StdRng::seed_from_u64(42);
                let mut tree = ctx.create_tree(test_config(policy, 8)?)?;
                let elements: Vec<(u64, Envelope)> =
                    (0..1000u64).map(|id| (id, random_envelope(&mut rng))).collect();
                for (id, envelope) in &elements {
                    tree.insert(*id, envelope.clone())?;
                }
                assert_eq!(tree.len(), 1000);
                assert_integrity(&mut tree)?;

                for (id, _) in elements.iter().filter(|(id, _)| id % 2 == 1) {
                    assert!(tree.remove_element(*id)?, "{:?} failed to remove {}", policy, id);
                }
                assert_eq!(tree.len(), 500);
                assert_integrity(&mut tree)?;

                let mut everything = tree
                    .search(&Envelope::rect(0.0, 0.0, 1000.0, 1000.0))?
                    .collect::<SpatialResult<Vec<u64>>>()?;
                assert_eq!(everything.len(), 500, "{:?}", policy);
                everything.sort_unstable();
                everything.dedup();
                assert_eq!(everything, (0..1000u64).step_by(2).collect::<Vec<_>>());

                let remaining: Vec<(u64, Envelope)> =
                    elements.into_iter().filter(|(id, _)| id % 2 == 0).collect();
                for _ in 0..50 {
                    let query = random_envelope(&mut rng);
                    let query = Envelope::rect(
                        query.min(0),
                        query.min(1),
                        query.max(0) + rng.random_range(0.0..100.0),
                        query.max(1) + rng.random_range(0.0..100.0),
                    );
                    assert_eq!(
                        tree.search_ids(&query)?,
                        brute_force_search(&remaining, &query),
                        "{:?}",
                        policy
                    );
                }
                tree.close()?;
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_every_node_respects_fill_bounds() {
    run_test(
        memory_context,
        |ctx| {
            for policy in ALL_POLICIES {
                let mut rng = StdRng::seed_from_u64(7);
                let config = test_config(policy, 10)?;
                let mut tree = ctx.create_tree(config)?;
                for id in 0..600u64 {
                    tree.insert(id, random_envelope(&mut rng))?;
                }
                // Fill, balance and containment are all part of the report
                let report = tree.check_integrity()?;
                assert!(report.is_valid, "{:?}: {:?}", policy, report.errors);
                assert_eq!(report.entries_checked, 600);
                assert!(report.duplicate_ids.is_empty());
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_hilbert_reverse_insertion_keeps_leaf_order() {
    run_test(
        memory_context,
        |ctx| {
            let mut tree = ctx.create_tree(test_config(SplitPolicy::Hilbert, 4)?)?;
            for i in (0..200u64).rev() {
                let x = (i % 20) as f64 * 45.0;
                let y = (i / 20) as f64 * 90.0;
                tree.insert(i, Envelope::rect(x, y, x + 5.0, y + 5.0))?;
            }
            // The integrity check walks leaves left to right and verifies
            // ascending Hilbert keys
            assert_integrity(&mut tree)?;
            assert!(tree.height() >= 3);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_delete_to_empty_and_reuse() {
    run_test(
        memory_context,
        |ctx| {
            for policy in ALL_POLICIES {
                let mut rng = StdRng::seed_from_u64(3);
                let mut tree = ctx.create_tree(test_config(policy, 5)?)?;
                for id in 0..300u64 {
                    tree.insert(id, random_envelope(&mut rng))?;
                }
                for id in 0..300u64 {
                    assert!(tree.remove_element(id)?);
                }
                assert!(tree.is_empty());
                assert_eq!(tree.height(), 1);
                assert_integrity(&mut tree)?;

                let free = tree.stats().free_pages;
                assert!(free > 0);
                for id in 0..300u64 {
                    tree.insert(id, random_envelope(&mut rng))?;
                }
                assert!(tree.stats().free_pages < free, "{:?}", policy);
                assert_integrity(&mut tree)?;
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_moving_elements() {
    run_test(
        memory_context,
        |ctx| {
            let mut rng = StdRng::seed_from_u64(11);
            let mut tree = ctx.create_tree(test_config(SplitPolicy::RStar, 6)?)?;
            for id in 0..200u64 {
                tree.insert(id, random_envelope(&mut rng))?;
            }
            for _ in 0..3 {
                for id in 0..200u64 {
                    tree.insert(id, random_envelope(&mut rng))?;
                }
            }
            assert_eq!(tree.len(), 200);
            assert_integrity(&mut tree)
        },
        cleanup,
    )
}

#[test]
fn test_nearest_matches_brute_force() {
    run_test(
        memory_context,
        |ctx| {
            let mut rng = StdRng::seed_from_u64(5);
            for policy in ALL_POLICIES {
                let mut tree = ctx.create_tree(test_config(policy, 8)?)?;
                let elements: Vec<(u64, Envelope)> =
                    (0..400u64).map(|id| (id, random_envelope(&mut rng))).collect();
                tree.bulk_load(elements.clone())?;
                assert_integrity(&mut tree)?;

                for _ in 0..20 {
                    let point = [rng.random_range(0.0..1000.0), rng.random_range(0.0..1000.0)];
                    let found = tree.find_nearest(&point, 5, None)?;

                    let mut expected: Vec<f64> =
                        elements.iter().map(|(_, e)| e.min_distance(&point)).collect();
                    expected.sort_by(f64::total_cmp);
                    let distances: Vec<f64> = found.iter().map(|(_, d)| *d).collect();
                    assert_eq!(distances, expected[..5].to_vec(), "{:?}", policy);
                }
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_three_dimensional_tree() {
    run_test(
        memory_context,
        |ctx| {
            use spatial_index::{CrsDescriptor, RTreeConfig};

            let config = RTreeConfig::builder()
                .split_policy(SplitPolicy::Hilbert)
                .max_elements(6)
                .page_size(2048)
                .crs(CrsDescriptor::cartesian(3).with_domain(Envelope::cube([0.0; 3], [100.0; 3])))
                .build()?;
            let mut tree = ctx.create_tree(config)?;
            for i in 0..500u64 {
                let c = [
                    (i % 10) as f64 * 10.0,
                    ((i / 10) % 10) as f64 * 10.0,
                    (i / 100) as f64 * 10.0,
                ];
                tree.insert(i, Envelope::cube(c, [c[0] + 1.0, c[1] + 1.0, c[2] + 1.0]))?;
            }
            assert_integrity(&mut tree)?;
            let hits = tree.search_ids(&Envelope::cube([0.0; 3], [5.0, 5.0, 45.0]))?;
            assert_eq!(hits, vec![0, 100, 200, 300, 400]);
            Ok(())
        },
        cleanup,
    )
}
