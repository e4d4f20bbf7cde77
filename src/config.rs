//! Runtime configuration: concurrency ceilings and batching defaults.
//!
//! Follows the teacher's layered-config idiom (`LlmBackend::from_env` in
//! the original `src/agent/provider.rs`): environment variables override a
//! handful of hardcoded defaults, with an optional TOML file read at
//! startup for persistent overrides.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Global ceiling on concurrent cell tasks across an entire batch,
    /// independent of `row_batch_size * col_batch_size` (§5).
    pub global_cell_ceiling: usize,
    /// Floor/ceiling inputs to the write-batch-size formula (§4.4).
    pub max_write_batch: usize,
    pub min_write_batch: usize,
    /// Cap on rows in a single add/regen request (§6.1).
    pub max_rows_per_request: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            global_cell_ceiling: 64,
            max_write_batch: 100,
            min_write_batch: 10,
            max_rows_per_request: 100,
        }
    }
}

impl ExecutionConfig {
    /// Loads defaults, then a TOML file (if present), then environment
    /// variable overrides, matching the precedence the teacher's provider
    /// selection uses (explicit env var wins over file wins over default).
    pub fn load(toml_path: Option<&Path>) -> Self {
        let mut cfg = toml_path
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| toml::from_str(&s).ok())
            .unwrap_or_default();
        Self::apply_env(&mut cfg);
        cfg
    }

    fn apply_env(cfg: &mut Self) {
        if let Ok(v) = std::env::var("GENTABLE_GLOBAL_CELL_CEILING") {
            if let Ok(n) = v.parse() {
                cfg.global_cell_ceiling = n;
            }
        }
        if let Ok(v) = std::env::var("GENTABLE_MAX_WRITE_BATCH") {
            if let Ok(n) = v.parse() {
                cfg.max_write_batch = n;
            }
        }
    }

    /// `write_batch_size := max(min_write_batch, min(N/10, max_write_batch))`
    /// (§4.4 sizing decision).
    pub fn write_batch_size(&self, n_rows: usize) -> usize {
        (n_rows / 10).clamp(self.min_write_batch, self.max_write_batch).max(1)
    }
}
