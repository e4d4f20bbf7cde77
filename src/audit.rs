//! Structured JSON-line logging for row/cell lifecycle events.
//!
//! spec.md is silent on logging; this mirrors the teacher's own
//! `AuditLogger` (`consensus/audit.rs`): append-only JSONL, one record per
//! lifecycle event, with a run id and truncated free-text fields so a
//! runaway error message can't blow up the log file.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Local;
use serde_json::json;

const SUMMARY_LIMIT_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    RowDispatched,
    CellDispatched,
    CellCompleted,
    CellErrored,
    RowFinalized,
    PersistenceFailed,
}

impl AuditEvent {
    fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::RowDispatched => "row_dispatched",
            AuditEvent::CellDispatched => "cell_dispatched",
            AuditEvent::CellCompleted => "cell_completed",
            AuditEvent::CellErrored => "cell_errored",
            AuditEvent::RowFinalized => "row_finalized",
            AuditEvent::PersistenceFailed => "persistence_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecord<'a> {
    pub event: AuditEvent,
    pub table_id: &'a str,
    pub row_id: Option<&'a str>,
    pub column_id: Option<&'a str>,
    pub summary: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct AuditLogger {
    path: PathBuf,
    run_id: String,
}

impl AuditLogger {
    pub fn new(log_dir: &Path) -> Self {
        let path = log_dir.join("gen_table_exec.jsonl");
        let run_id = format!("exec-{}", Local::now().format("%Y%m%d-%H%M%S%.3f"));
        Self { path, run_id }
    }

    pub fn write(&self, rec: AuditRecord<'_>) {
        if let Err(err) = self.write_inner(rec) {
            eprintln!("audit log write failed: {err}");
        }
    }

    fn write_inner(&self, rec: AuditRecord<'_>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = json!({
            "ts": Local::now().to_rfc3339(),
            "run_id": self.run_id,
            "event": rec.event.as_str(),
            "table_id": rec.table_id,
            "row_id": rec.row_id,
            "column_id": rec.column_id,
            "summary": rec.summary.map(|s| truncate_chars(s, SUMMARY_LIMIT_CHARS)),
        });
        writeln!(file, "{line}")
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(1);
    let mut out: String = s.chars().take(keep).collect();
    out.push('…');
    out
}
