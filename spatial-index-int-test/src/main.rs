use rand::rngs::StdRng;
use rand::SeedableRng;
use spatial_index::{Envelope, SpatialResult, SplitPolicy};
use spatial_index_int_test::test_util::{
    cleanup, create_test_context, random_envelope, test_config, BackendKind,
};

fn main() -> SpatialResult<()> {
    colog::init();
    println!("Starting stress test...");
    let ctx = create_test_context(BackendKind::File)?;

    let count = 200_000u64;
    let mut rng = StdRng::seed_from_u64(1);
    let mut tree = ctx.create_tree(test_config(SplitPolicy::RStar, 32)?)?;

    let start = std::time::Instant::now();
    for id in 0..count {
        tree.insert(id, random_envelope(&mut rng))?;
    }
    println!("Inserted {} elements in {:?}", count, start.elapsed());

    let start = std::time::Instant::now();
    let mut hits = 0;
    for _ in 0..1000 {
        let query = random_envelope(&mut rng);
        hits += tree.search_ids(&query.union(&Envelope::rect(
            query.min(0),
            query.min(1),
            query.min(0) + 50.0,
            query.min(1) + 50.0,
        )))?
        .len();
    }
    println!("Ran 1000 searches ({} hits) in {:?}", hits, start.elapsed());

    let start = std::time::Instant::now();
    for id in (0..count).step_by(2) {
        tree.remove_element(id)?;
    }
    println!("Removed {} elements in {:?}", count / 2, start.elapsed());

    let report = tree.check_integrity()?;
    println!("Integrity valid: {} ({} pages)", report.is_valid, report.pages_checked);
    println!("{:?}", tree.stats());
    tree.close()?;

    cleanup(ctx)
}
