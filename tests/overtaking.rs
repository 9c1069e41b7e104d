//! Dynamic algorithm overtaking: only the broadcast root knows the payload
//! size, so receivers accept speculatively and must converge to the root's
//! choice when the first inbound frame advertises a different class.

mod common;

use anyhow::Result;
use common::run_cohort;
use mpi_runtime::{Settings, Value};

/// With 16 ranks the flat-tree window admits everyone, so non-roots
/// speculatively accept the flat tree. The root's payload crosses the
/// large-payload threshold, making it pick the binomial tree instead; each
/// non-root observes the class in the first incoming frame, overtakes, and
/// still completes with the root's exact payload.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn broadcast_overtakes_to_binomial() -> Result<()> {
    let mut settings = Settings::default();
    settings.flat_tree_max = 16;
    settings.large_payload_threshold = 1024;

    run_cohort(16, settings, |world| async move {
        let root = 5;
        let payload = Value::Bytes((0..8192u32).map(|i| (i % 251) as u8).collect());
        let input = (world.rank() == root).then(|| payload.clone());
        let received = world.bcast(input, root).await?;
        assert_eq!(received, payload);
        Ok(())
    })
    .await
}

/// After an overtaken broadcast, the next collective on the same tag runs
/// on fresh state: a small payload goes back to the flat tree and still
/// reaches everyone.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn overtaken_broadcast_leaves_clean_state() -> Result<()> {
    let mut settings = Settings::default();
    settings.flat_tree_max = 16;
    settings.large_payload_threshold = 1024;

    run_cohort(16, settings, |world| async move {
        let root = 0;

        let big = Value::Bytes(vec![0xAB; 4096]);
        let input = (world.rank() == root).then(|| big.clone());
        assert_eq!(world.bcast(input, root).await?, big);

        // Small payload: no overtaking this time around.
        let small = Value::Int(13);
        let input = (world.rank() == root).then(|| small.clone());
        assert_eq!(world.bcast(input, root).await?, small);

        world.barrier().await?;
        Ok(())
    })
    .await
}
