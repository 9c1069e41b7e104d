//! # Runtime Settings Module
//!
//! A read-only bag of tunables handed to the engine at launch. The launcher
//! typically materializes it from a JSON document (`serde_json`), but all
//! fields have workable defaults so embedded cohorts can run with
//! `Settings::default()`.
//!
//! ## Algorithm bounds
//!
//! Every topology-based collective algorithm accepts a communicator only
//! when its size falls inside a `[min, max]` window. The generic windows
//! live in named fields (`flat_tree_min`, ...); per-collective overrides go
//! into the `overrides` map under keys like `BCAST_FLAT_TREE_MAX`. Bound
//! resolution looks up the most specific key first, then the generic key,
//! then the field default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Tunables controlling algorithm selection, sockets, and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Smallest cohort the flat tree accepts.
    pub flat_tree_min: usize,
    /// Largest cohort the flat tree accepts. Flat trees put every rank
    /// directly under the root, so this stays small.
    pub flat_tree_max: usize,
    pub binomial_tree_min: usize,
    pub binomial_tree_max: usize,
    pub static_fanout_min: usize,
    pub static_fanout_max: usize,

    /// Children per interior node in static-fanout trees.
    pub static_tree_fanout: usize,

    /// Encoded payload size, in bytes, at which a broadcast root switches
    /// to the binomial tree regardless of candidate order.
    pub large_payload_threshold: usize,

    /// Socket send/receive buffer size for peer connections.
    pub socket_buffer_size: usize,

    /// How many times to retry dialing a peer during mesh establishment.
    pub connect_attempts: usize,
    /// Delay between dial attempts, in milliseconds.
    pub connect_retry_ms: u64,

    /// Directory for per-rank log files. `None` disables file logging.
    pub logdir: Option<PathBuf>,

    /// Per-collective bound overrides, e.g. `"REDUCE_FLAT_TREE_MAX": 4`.
    pub overrides: HashMap<String, usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            flat_tree_min: 1,
            flat_tree_max: 10,
            binomial_tree_min: 0,
            binomial_tree_max: usize::MAX,
            static_fanout_min: 0,
            static_fanout_max: usize::MAX,
            static_tree_fanout: 2,
            large_payload_threshold: 64 * 1024,
            socket_buffer_size: 64 * 1024,
            connect_attempts: 100,
            connect_retry_ms: 50,
            logdir: None,
            overrides: HashMap::new(),
        }
    }
}

impl Settings {
    /// Resolve the acceptance window for one `(collective, tree)` pair.
    ///
    /// `collective` and `tree` are the upper-case setting prefixes, e.g.
    /// `("BCAST", "FLAT_TREE")`. The most specific override wins, then the
    /// generic override, then the built-in field.
    pub fn accept_range(&self, collective: &str, tree: &str) -> (usize, usize) {
        let (generic_min, generic_max) = match tree {
            "FLAT_TREE" => (self.flat_tree_min, self.flat_tree_max),
            "BINOMIAL_TREE" => (self.binomial_tree_min, self.binomial_tree_max),
            "STATIC_FANOUT" => (self.static_fanout_min, self.static_fanout_max),
            // A tree with no configured bounds accepts every size.
            _ => (0, usize::MAX),
        };

        let lookup = |suffix: &str, fallback: usize| {
            self.overrides
                .get(&format!("{collective}_{tree}_{suffix}"))
                .or_else(|| self.overrides.get(&format!("{tree}_{suffix}")))
                .copied()
                .unwrap_or(fallback)
        };

        (lookup("MIN", generic_min), lookup("MAX", generic_max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_bounds() {
        let settings = Settings::default();
        assert_eq!(settings.accept_range("BCAST", "FLAT_TREE"), (1, 10));
        assert_eq!(
            settings.accept_range("BCAST", "BINOMIAL_TREE"),
            (0, usize::MAX)
        );
    }

    #[test]
    fn test_specific_override_beats_generic() {
        let mut settings = Settings::default();
        settings.overrides.insert("FLAT_TREE_MAX".into(), 20);
        settings.overrides.insert("REDUCE_FLAT_TREE_MAX".into(), 4);

        // Generic override applies to collectives without a specific one.
        assert_eq!(settings.accept_range("BCAST", "FLAT_TREE"), (1, 20));
        // The specific key shadows both the generic key and the field.
        assert_eq!(settings.accept_range("REDUCE", "FLAT_TREE"), (1, 4));
    }

    #[test]
    fn test_unknown_tree_accepts_everything() {
        let settings = Settings::default();
        assert_eq!(
            settings.accept_range("ALLGATHER", "DISSEMINATION"),
            (0, usize::MAX)
        );
    }

    #[test]
    fn test_json_round_trip() {
        let mut settings = Settings::default();
        settings.static_tree_fanout = 4;
        settings.overrides.insert("FLAT_TREE_MAX".into(), 16);

        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.static_tree_fanout, 4);
        assert_eq!(back.accept_range("BCAST", "FLAT_TREE"), (1, 16));
    }
}
