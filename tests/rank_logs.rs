//! Per-rank log files: each engine writes its own
//! `mpi.<name>.rank<R>.log` under the configured directory.

mod common;

use anyhow::Result;
use common::run_cohort;
use mpi_runtime::{Settings, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_rank_writes_its_own_log_file() -> Result<()> {
    let logdir = tempfile::tempdir()?;
    let mut settings = Settings::default();
    settings.logdir = Some(logdir.path().to_path_buf());

    run_cohort(3, settings, |world| async move {
        // Generate some traffic so the engines have something to log.
        let total = world
            .allreduce(Value::Int(world.rank() as i64), mpi_runtime::Op::Sum)
            .await?;
        assert_eq!(total, Value::Int(3));
        Ok(())
    })
    .await?;

    for rank in 0..3 {
        let path = logdir.path().join(format!("mpi.cohort-test.rank{rank}.log"));
        assert!(path.exists(), "missing log file for rank {rank}");
        assert!(std::fs::metadata(&path)?.len() > 0);
    }
    Ok(())
}
