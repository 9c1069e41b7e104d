//! In-process cohort harness for integration tests.
//!
//! Spawns `size` engines inside one process, each on its own loopback
//! listener, runs the supplied body on every rank's world communicator,
//! and finalizes the whole cohort. Listeners are pre-bound so every rank
//! knows the full peer map before any engine starts.

use anyhow::Result;
use mpi_runtime::{Communicator, Mpi, PeerAddr, ProcessConfig, Settings};
use std::future::Future;

pub async fn run_cohort<F, Fut>(size: usize, settings: Settings, body: F) -> Result<()>
where
    F: Fn(Communicator) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut listeners = Vec::with_capacity(size);
    let mut peers = Vec::with_capacity(size);
    for rank in 0..size {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        peers.push(PeerAddr {
            rank: rank as i32,
            host: "127.0.0.1".to_string(),
            port: listener.local_addr()?.port(),
        });
        listeners.push(listener);
    }

    let mut workers = Vec::with_capacity(size);
    for (rank, listener) in listeners.into_iter().enumerate() {
        let peers = peers.clone();
        let settings = settings.clone();
        let body = body.clone();
        workers.push(tokio::spawn(async move {
            let mpi = Mpi::init(ProcessConfig {
                rank: rank as i32,
                size,
                name: "cohort-test".to_string(),
                peers,
                settings,
                listener: Some(listener),
            })
            .await?;
            let world = mpi.world().clone();
            body(world).await?;
            mpi.finalize().await?;
            Ok::<(), anyhow::Error>(())
        }));
    }

    for worker in workers {
        worker.await??;
    }
    Ok(())
}
