//! Point-to-point semantics across a live cohort: round trips, FIFO
//! ordering, wildcards, inbox buffering, waitany, and cancellation.

mod common;

use anyhow::Result;
use common::run_cohort;
use mpi_runtime::{waitany, MpiError, Settings, Value, ANY_SOURCE, ANY_TAG};

/// Every rank sees a rank in `0..size` and the cohort covers each exactly
/// once.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ranks_are_distinct() -> Result<()> {
    run_cohort(5, Settings::default(), |world| async move {
        let rank = world.rank();
        assert!(rank >= 0 && (rank as usize) < world.size());

        let everyone = world.allgather(Value::Int(rank as i64)).await?;
        let expected: Vec<Value> = (0..world.size() as i64).map(Value::Int).collect();
        assert_eq!(everyone, Value::List(expected));
        Ok(())
    })
    .await
}

/// Each rank exchanges an integer with both neighbours; after one round
/// every rank holds its left neighbour's value.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn sendrecv_ring() -> Result<()> {
    run_cohort(4, Settings::default(), |world| async move {
        let rank = world.rank();
        let size = world.size() as i32;
        let right = (rank + 1) % size;
        let left = (rank - 1 + size) % size;

        let received = world
            .sendrecv(Value::Int(rank as i64 * 10), right, 5, left, 5)
            .await?;
        assert_eq!(received, Value::Int(left as i64 * 10));
        Ok(())
    })
    .await
}

/// Messages with the same `(sender, tag)` arrive in send order.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn same_sender_same_tag_is_fifo() -> Result<()> {
    run_cohort(2, Settings::default(), |world| async move {
        if world.rank() == 0 {
            for i in 0..20i64 {
                world.send(Value::Int(i), 1, 3).await?;
            }
        } else {
            for i in 0..20i64 {
                assert_eq!(world.recv(0, 3).await?, Value::Int(i));
            }
        }
        Ok(())
    })
    .await
}

/// Two ranks ping-pong formatted strings for 500 iterations; all 1000
/// receives match.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_ping_pong() -> Result<()> {
    run_cohort(2, Settings::default(), |world| async move {
        const ITERATIONS: usize = 500;
        let rank = world.rank();
        let peer = 1 - rank;
        for i in 0..ITERATIONS {
            let outgoing = Value::Text(format!("rank{rank},iterations{i}"));
            let expected = Value::Text(format!("rank{peer},iterations{i}"));
            if rank == 0 {
                world.send(outgoing, peer, 11).await?;
                assert_eq!(world.recv(peer, 11).await?, expected);
            } else {
                assert_eq!(world.recv(peer, 11).await?, expected);
                world.send(outgoing, peer, 11).await?;
            }
        }
        Ok(())
    })
    .await
}

/// Rank 0 posts ten non-blocking receives per peer and drains them with
/// `waitany`, collecting every message exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn waitany_collects_everything() -> Result<()> {
    run_cohort(3, Settings::default(), |world| async move {
        const PER_PEER: usize = 10;
        if world.rank() == 0 {
            let mut pending = Vec::new();
            for peer in 1..world.size() as i32 {
                for _ in 0..PER_PEER {
                    pending.push(world.irecv(peer, 1)?);
                }
            }
            let mut collected = 0;
            while !pending.is_empty() {
                let (index, value) = waitany(&pending).await?;
                assert_eq!(value, Value::Text("Message".to_string()));
                pending.remove(index);
                collected += 1;
            }
            assert_eq!(collected, PER_PEER * (world.size() - 1));
        } else {
            for _ in 0..PER_PEER {
                world.send(Value::Text("Message".to_string()), 0, 1).await?;
            }
        }
        Ok(())
    })
    .await
}

/// Wildcard receives match any sender and any tag.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn wildcard_source_and_tag() -> Result<()> {
    run_cohort(4, Settings::default(), |world| async move {
        if world.rank() == 0 {
            let mut seen = Vec::new();
            for _ in 1..world.size() {
                let value = world.recv(ANY_SOURCE, ANY_TAG).await?;
                seen.push(value.as_int().expect("integer payload"));
            }
            seen.sort_unstable();
            assert_eq!(seen, vec![1, 2, 3]);
        } else {
            let rank = world.rank();
            // Distinct tags per sender; the wildcard must not care.
            world.send(Value::Int(rank as i64), 0, rank * 7).await?;
        }
        Ok(())
    })
    .await
}

/// An arrival with no posted receive parks in the inbox and is claimed by
/// a receive posted later.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn unmatched_arrival_is_buffered() -> Result<()> {
    run_cohort(2, Settings::default(), |world| async move {
        if world.rank() == 0 {
            world.send(Value::Text("early".into()), 1, 2).await?;
            world.barrier().await?;
        } else {
            // Let the message arrive before any receive exists.
            world.barrier().await?;
            assert_eq!(world.recv(0, 2).await?, Value::Text("early".into()));
        }
        Ok(())
    })
    .await
}

/// A synchronous send completes only after the receiver matched it, and
/// round-trips the payload intact.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ssend_requires_matching_receive() -> Result<()> {
    run_cohort(2, Settings::default(), |world| async move {
        if world.rank() == 0 {
            let request = world.issend(Value::Int(42), 1, 4)?;
            // Receiver only posts after the barrier, so the ack cannot have
            // arrived yet.
            assert!(!request.test());
            world.barrier().await?;
            request.wait().await?;
        } else {
            world.barrier().await?;
            assert_eq!(world.recv(0, 4).await?, Value::Int(42));
        }
        Ok(())
    })
    .await
}

/// Waiting on a cancelled request fails, and cancellation is idempotent.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn cancelled_receive_fails_wait() -> Result<()> {
    run_cohort(2, Settings::default(), |world| async move {
        if world.rank() == 0 {
            let request = world.irecv(1, 9)?;
            request.cancel();
            request.cancel();
            match request.wait().await {
                Err(MpiError::Cancelled) => {}
                other => panic!("expected cancellation error, got {other:?}"),
            }
        }
        world.barrier().await?;
        Ok(())
    })
    .await
}

/// Mixed payload shapes survive the trip: byte strings, dense arrays, and
/// nested object graphs each use their own encoding.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn payload_encodings_round_trip() -> Result<()> {
    run_cohort(2, Settings::default(), |world| async move {
        let values = vec![
            Value::Bytes(vec![0, 255, 7]),
            Value::Array(mpi_runtime::DenseArray::from_i64(&[-1, 0, 1 << 40])),
            Value::List(vec![Value::None, Value::Float(2.5), Value::Text("x".into())]),
        ];
        if world.rank() == 0 {
            for value in values {
                world.send(value, 1, 0).await?;
            }
        } else {
            for value in values {
                assert_eq!(world.recv(0, 0).await?, value);
            }
        }
        Ok(())
    })
    .await
}
