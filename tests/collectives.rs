//! Collective operations across live cohorts: broadcast sequences, barrier
//! waves, reductions (including non-commutative operators and non-zero
//! roots), prefix scans, scatter/gather inversion, allgather, and the
//! all-to-all exchange.

mod common;

use anyhow::Result;
use common::run_cohort;
use mpi_runtime::{Op, Settings, Value};

/// Root 3 broadcasts four values in sequence to a cohort of 11; every rank
/// observes exactly those values in that order.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn bcast_sequence_with_offset_root() -> Result<()> {
    run_cohort(11, Settings::default(), |world| async move {
        let root = 3;
        let sequence = vec![
            Value::Text("hello".to_string()),
            Value::None,
            Value::Text(String::new()),
            Value::Int(-1),
        ];
        for expected in sequence {
            let input = (world.rank() == root).then(|| expected.clone());
            let received = world.bcast(input, root).await?;
            assert_eq!(received, expected);
        }
        Ok(())
    })
    .await
}

/// Back-to-back barriers complete on every rank; a counter smuggled
/// through allreduce confirms all ranks passed each wave.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn repeated_barriers() -> Result<()> {
    run_cohort(6, Settings::default(), |world| async move {
        for round in 0..4i64 {
            world.barrier().await?;
            let total = world.allreduce(Value::Int(round), Op::Sum).await?;
            assert_eq!(total, Value::Int(round * world.size() as i64));
        }
        Ok(())
    })
    .await
}

/// Reduce delivers the folded value to the root only.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn reduce_sum_to_root() -> Result<()> {
    run_cohort(7, Settings::default(), |world| async move {
        let contribution = Value::Int(world.rank() as i64 + 1);
        let result = world.reduce(contribution, Op::Sum, 0).await?;
        if world.rank() == 0 {
            // 1 + 2 + ... + 7
            assert_eq!(result, Some(Value::Int(28)));
        } else {
            assert_eq!(result, None);
        }
        Ok(())
    })
    .await
}

/// A non-commutative operator with a non-zero root still folds in
/// ascending rank order.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn reduce_non_commutative_ordering() -> Result<()> {
    fn concat(a: &Value, b: &Value) -> Value {
        Value::Text(format!(
            "{}{}",
            a.as_text().unwrap_or_default(),
            b.as_text().unwrap_or_default()
        ))
    }

    run_cohort(6, Settings::default(), |world| async move {
        let root = 4;
        let contribution = Value::Text(format!("r{}", world.rank()));
        let result = world.reduce(contribution, Op::Custom(concat), root).await?;
        if world.rank() == root {
            assert_eq!(result, Some(Value::Text("r0r1r2r3r4r5".to_string())));
        } else {
            assert_eq!(result, None);
        }
        Ok(())
    })
    .await
}

/// Allreduce hands the same folded value to every rank.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn allreduce_on_every_rank() -> Result<()> {
    run_cohort(5, Settings::default(), |world| async move {
        let product = world
            .allreduce(Value::Int(world.rank() as i64 + 1), Op::Prod)
            .await?;
        // 5!
        assert_eq!(product, Value::Int(120));

        let maximum = world
            .allreduce(Value::Int(-(world.rank() as i64)), Op::Max)
            .await?;
        assert_eq!(maximum, Value::Int(0));
        Ok(())
    })
    .await
}

/// Scan gives rank `r` the inclusive prefix over ranks `0..=r`.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scan_prefix_sums() -> Result<()> {
    run_cohort(8, Settings::default(), |world| async move {
        let r = world.rank() as i64;
        let prefix = world.scan(Value::Int(r + 1), Op::Sum).await?;
        assert_eq!(prefix, Value::Int((r + 1) * (r + 2) / 2));
        Ok(())
    })
    .await
}

/// Gathering scattered chunks reproduces the root's input when the length
/// divides evenly.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scatter_gather_inverse() -> Result<()> {
    run_cohort(4, Settings::default(), |world| async move {
        let root = 1;
        let input: Vec<Value> = (0..12).map(Value::Int).collect();
        let to_scatter = (world.rank() == root).then(|| Value::List(input.clone()));

        let chunk = world.scatter(to_scatter, root).await?;
        let items = chunk.as_list().expect("chunk is a list");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Value::Int(world.rank() as i64 * 3));

        let gathered = world.gather(chunk, root).await?;
        if world.rank() == root {
            assert_eq!(gathered, Some(Value::List(input)));
        } else {
            assert_eq!(gathered, None);
        }
        Ok(())
    })
    .await
}

/// When the input length does not divide the cohort size, the trailing
/// remainder is dropped.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scatter_drops_remainder() -> Result<()> {
    run_cohort(3, Settings::default(), |world| async move {
        let input: Vec<Value> = (0..8).map(Value::Int).collect();
        let to_scatter = (world.rank() == 0).then(|| Value::List(input));

        let chunk = world.scatter(to_scatter, 0).await?;
        let expected: Vec<Value> = (world.rank() as i64 * 2..world.rank() as i64 * 2 + 2)
            .map(Value::Int)
            .collect();
        assert_eq!(chunk, Value::List(expected));
        Ok(())
    })
    .await
}

/// Allgather assembles every contribution in rank order on every rank,
/// including awkward cohort sizes for the dissemination rounds.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn allgather_rank_order() -> Result<()> {
    for size in [2usize, 3, 5, 8] {
        run_cohort(size, Settings::default(), |world| async move {
            let mine = Value::Text(format!("r{}", world.rank()));
            let all = world.allgather(mine).await?;
            let expected: Vec<Value> = (0..world.size())
                .map(|r| Value::Text(format!("r{r}")))
                .collect();
            assert_eq!(all, Value::List(expected));
            Ok(())
        })
        .await?;
    }
    Ok(())
}

/// Each rank addresses one entry to every peer; afterwards it holds the
/// entries addressed to it, in sender order.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn alltoall_exchange() -> Result<()> {
    run_cohort(4, Settings::default(), |world| async move {
        let rank = world.rank() as i64;
        let outgoing: Vec<Value> = (0..world.size() as i64)
            .map(|dest| Value::Int(rank * 100 + dest))
            .collect();

        let incoming = world.alltoall(Value::List(outgoing)).await?;
        let expected: Vec<Value> = (0..world.size() as i64)
            .map(|sender| Value::Int(sender * 100 + rank))
            .collect();
        assert_eq!(incoming, Value::List(expected));
        Ok(())
    })
    .await
}

/// Bound overrides steer selection: with the flat and binomial windows
/// closed for BCAST, the static-fanout tree carries the broadcast.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn bound_overrides_select_static_tree() -> Result<()> {
    let mut settings = Settings::default();
    settings.static_tree_fanout = 3;
    settings.overrides.insert("BCAST_FLAT_TREE_MAX".into(), 0);
    settings
        .overrides
        .insert("BCAST_BINOMIAL_TREE_MAX".into(), 0);

    run_cohort(9, settings, |world| async move {
        let payload = Value::List((0..50).map(Value::Int).collect());
        let input = (world.rank() == 0).then(|| payload.clone());
        assert_eq!(world.bcast(input, 0).await?, payload);
        Ok(())
    })
    .await
}

/// Collectives pipeline cleanly: consecutive operations of several kinds
/// on the same communicator never cross-contaminate.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn mixed_collective_sequence() -> Result<()> {
    run_cohort(5, Settings::default(), |world| async move {
        let rank = world.rank() as i64;

        let sum = world.allreduce(Value::Int(rank), Op::Sum).await?;
        assert_eq!(sum, Value::Int(10));

        let hello = world.bcast(
            (world.rank() == 2).then(|| Value::Text("go".into())),
            2,
        )
        .await?;
        assert_eq!(hello, Value::Text("go".into()));

        world.barrier().await?;

        let everyone = world.allgather(Value::Int(rank)).await?;
        assert_eq!(
            everyone,
            Value::List((0..5).map(Value::Int).collect::<Vec<_>>())
        );
        Ok(())
    })
    .await
}
