//! Per-rank log files.
//!
//! Each rank writes one line-oriented log file named
//! `mpi.<name>.rank<R>.log` under the configured log directory, through a
//! non-blocking appender. The returned guard must be kept alive for the
//! engine's lifetime or buffered lines are lost.
//!
//! Installing the subscriber is best-effort: when several engines share a
//! process (in-process test cohorts) only the first installation wins.
//! The startup banner is written straight through the appender, so every
//! rank's file exists regardless of which engine owns the subscriber.

use crate::settings::Settings;
use crate::wire::Rank;
use std::io::Write;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

pub(crate) fn init_rank_logging(
    settings: &Settings,
    name: &str,
    rank: Rank,
) -> Option<WorkerGuard> {
    let logdir = settings.logdir.as_ref()?;
    let filename = format!("mpi.{name}.rank{rank}.log");
    let appender = tracing_appender::rolling::never(logdir, filename);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let mut banner = writer.clone();
    let _ = writeln!(banner, "communication engine starting: name={name} rank={rank}");

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);
    let _ = tracing_subscriber::registry().with(layer).try_init();

    Some(guard)
}
