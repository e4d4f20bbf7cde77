//! Batch Orchestrator (C4, spec §4.4).
//!
//! Drives N rows with bounded row concurrency, funnels their streamed
//! events into a single output stream, and batches finalized rows into
//! durable writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::capabilities::{BillingCollector, CodeExecutor, FileLoader, KnowledgeSearch, LmRouter, Persistence};
use crate::cell::CellEvent;
use crate::config::ExecutionConfig;
use crate::deps;
use crate::error::{CoreError, CoreResult};
use crate::events::{self, CellReferences, MultiRowCompletionResponse, RowCompletionResponse};
use crate::row_exec::{ExecContextOwned, RegenStrategy, RowExecutor, RowOutputEvent, RowRequest};
use crate::schema::ColumnMeta;

pub struct Capabilities {
    pub router: Arc<dyn LmRouter>,
    pub search: Arc<dyn KnowledgeSearch>,
    pub files: Arc<dyn FileLoader>,
    pub code: Arc<dyn CodeExecutor>,
    pub persistence: Arc<dyn Persistence>,
    pub billing: Option<Arc<dyn BillingCollector>>,
}

pub struct AddRowsRequest {
    pub table_id: String,
    pub data: Vec<BTreeMap<String, Value>>,
    pub stream: bool,
}

pub struct RegenRowsRequest {
    pub table_id: String,
    pub row_ids: Vec<String>,
    pub regen_strategy: RegenStrategy,
    pub output_column_id: Option<String>,
    pub stream: bool,
}

pub enum BatchOutcome {
    Streamed { event_count: usize, egress_bytes: u64 },
    Aggregated(MultiRowCompletionResponse),
}

fn validate_row_count(n: usize, cfg: &ExecutionConfig) -> CoreResult<()> {
    if n == 0 || n > cfg.max_rows_per_request {
        return Err(CoreError::BadInput(format!(
            "row count must be between 1 and {}, got {n}",
            cfg.max_rows_per_request
        )));
    }
    Ok(())
}

/// Sizing decision (§4.4): multi-turn columns force serial rows and
/// single-row write batches so chat history reads stay consistent.
fn sizing(
    columns: &[ColumnMeta],
    n_rows: usize,
    cfg: &ExecutionConfig,
) -> (usize, usize, usize) {
    let has_multi_turn = columns.iter().any(|c| {
        matches!(&c.gen_config, Some(crate::schema::GenConfig::Llm(l)) if l.multi_turn)
    });
    if has_multi_turn {
        return (1, 1, 1);
    }
    let max_width = deps::max_width(columns).max(1);
    // Keep concurrent-cell product under the global ceiling while bounding
    // col_batch_size by max_width (§4.4 sizing decision).
    let col_batch_size = max_width.min(cfg.global_cell_ceiling.max(1));
    let row_batch_size = (cfg.global_cell_ceiling / col_batch_size).max(1).min(n_rows.max(1));
    let write_batch_size = cfg.write_batch_size(n_rows);
    (row_batch_size, col_batch_size, write_batch_size)
}

pub struct BatchOrchestrator {
    caps: Capabilities,
    config: ExecutionConfig,
    audit: crate::audit::AuditLogger,
}

impl BatchOrchestrator {
    pub fn new(caps: Capabilities, config: ExecutionConfig, audit: crate::audit::AuditLogger) -> Self {
        Self { caps, config, audit }
    }

    pub async fn add_rows(
        &self,
        req: AddRowsRequest,
        columns: Vec<ColumnMeta>,
        project_id: &str,
        on_stream_event: impl FnMut(String) + Send + 'static,
    ) -> CoreResult<BatchOutcome> {
        validate_row_count(req.data.len(), &self.config)?;
        let col_map: Arc<BTreeMap<String, ColumnMeta>> =
            Arc::new(columns.iter().map(|c| (c.id.clone(), c.clone())).collect());
        let deps_map = Arc::new(deps::dependencies(&columns));
        let (row_batch_size, col_batch_size, write_batch_size) =
            sizing(&columns, req.data.len(), &self.config);

        let requests: Vec<RowRequest> = req
            .data
            .into_iter()
            .map(|data| RowRequest::Add { data })
            .collect();

        self.run_batch(
            &req.table_id,
            project_id,
            requests,
            col_map,
            deps_map,
            row_batch_size,
            col_batch_size,
            write_batch_size,
            req.stream,
            on_stream_event,
            WriteMode::Add,
        )
        .await
    }

    pub async fn regen_rows(
        &self,
        req: RegenRowsRequest,
        columns: Vec<ColumnMeta>,
        project_id: &str,
        on_stream_event: impl FnMut(String) + Send + 'static,
    ) -> CoreResult<BatchOutcome> {
        validate_row_count(req.row_ids.len(), &self.config)?;
        if req.regen_strategy != RegenStrategy::RunAll {
            let ok = req
                .output_column_id
                .as_deref()
                .and_then(|id| columns.iter().find(|c| c.id == id))
                .map(|c| c.is_output())
                .unwrap_or(false);
            if !ok {
                return Err(CoreError::BadInput(
                    "output_column_id is required and must be an output column for this regen_strategy".into(),
                ));
            }
        }

        let col_map: Arc<BTreeMap<String, ColumnMeta>> =
            Arc::new(columns.iter().map(|c| (c.id.clone(), c.clone())).collect());
        let deps_map = Arc::new(deps::dependencies(&columns));
        let (row_batch_size, col_batch_size, write_batch_size) =
            sizing(&columns, req.row_ids.len(), &self.config);

        let mut requests = Vec::with_capacity(req.row_ids.len());
        for row_id in &req.row_ids {
            let existing = self.caps.persistence.get_row(&req.table_id, row_id).await?;
            requests.push(RowRequest::Regen {
                existing,
                strategy: req.regen_strategy,
                output_column_id: req.output_column_id.clone(),
            });
        }

        self.run_batch(
            &req.table_id,
            project_id,
            requests,
            col_map,
            deps_map,
            row_batch_size,
            col_batch_size,
            write_batch_size,
            req.stream,
            on_stream_event,
            WriteMode::Update,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        table_id: &str,
        project_id: &str,
        requests: Vec<RowRequest>,
        col_map: Arc<BTreeMap<String, ColumnMeta>>,
        deps_map: Arc<std::collections::HashMap<String, std::collections::BTreeSet<String>>>,
        row_batch_size: usize,
        col_batch_size: usize,
        write_batch_size: usize,
        stream: bool,
        mut on_stream_event: impl FnMut(String) + Send + 'static,
        write_mode: WriteMode,
    ) -> CoreResult<BatchOutcome> {
        let now = chrono::Local::now().to_rfc3339();
        let exec_ctx = Arc::new(ExecContextOwned {
            router: self.caps.router.clone(),
            search: self.caps.search.clone(),
            files: self.caps.files.clone(),
            code: self.caps.code.clone(),
            persistence: self.caps.persistence.clone(),
            project_id: project_id.to_string(),
            table_id: table_id.to_string(),
            col_map: col_map.clone(),
            now_rfc3339: now,
        });

        let mut aggregate: BTreeMap<String, RowCompletionResponse> = BTreeMap::new();
        let mut write_buffer: BTreeMap<String, crate::schema::Row> = BTreeMap::new();
        let mut egress_bytes: u64 = 0;
        let mut event_count = 0usize;

        for window in requests.chunks(row_batch_size.max(1)) {
            let (out_tx, mut out_rx) = mpsc::channel::<RowOutputEvent>(256);
            let mut handles = Vec::with_capacity(window.len());

            for req in window {
                let row_exec = RowExecutor::new(
                    req.clone(),
                    col_map.clone(),
                    deps_map.clone(),
                    col_batch_size,
                )?;
                let ctx = exec_ctx.clone();
                let out_tx = out_tx.clone();
                self.audit.write(crate::audit::AuditRecord {
                    event: crate::audit::AuditEvent::RowDispatched,
                    table_id,
                    row_id: Some(&row_exec.row_id),
                    column_id: None,
                    summary: None,
                });
                handles.push(tokio::spawn(row_exec.run(ctx, stream, out_tx)));
            }
            drop(out_tx);

            while let Some(evt) = out_rx.recv().await {
                match evt {
                    RowOutputEvent::Cell { row_id, output_column_id, event } => {
                        event_count += 1;
                        if stream {
                            let line = render_stream_event(&row_id, &output_column_id, event);
                            egress_bytes += line.len() as u64;
                            on_stream_event(line);
                        } else {
                            accumulate(&mut aggregate, &row_id, &output_column_id, event);
                        }
                    }
                    RowOutputEvent::RowFinal { row } => {
                        self.audit.write(crate::audit::AuditRecord {
                            event: crate::audit::AuditEvent::RowFinalized,
                            table_id,
                            row_id: Some(&row.id),
                            column_id: None,
                            summary: None,
                        });
                        write_buffer.insert(row.id.clone(), row);
                        if write_buffer.len() >= write_batch_size {
                            self.flush_writes(table_id, &mut write_buffer, write_mode).await;
                        }
                    }
                }
            }

            for h in handles {
                let _ = h.await;
            }
        }

        if !write_buffer.is_empty() {
            self.flush_writes(table_id, &mut write_buffer, write_mode).await;
        }

        if stream {
            on_stream_event(events::SSE_DONE.to_string());
            egress_bytes += events::SSE_DONE.len() as u64;
            if let Some(billing) = &self.caps.billing {
                billing.create_egress_events(egress_bytes).await;
            }
            Ok(BatchOutcome::Streamed { event_count, egress_bytes })
        } else {
            Ok(BatchOutcome::Aggregated(MultiRowCompletionResponse {
                rows: aggregate.into_values().collect(),
            }))
        }
    }

    async fn flush_writes(
        &self,
        table_id: &str,
        buffer: &mut BTreeMap<String, crate::schema::Row>,
        mode: WriteMode,
    ) {
        let rows: Vec<crate::schema::Row> = buffer.values().cloned().collect();
        let result = match mode {
            WriteMode::Add => self.caps.persistence.add_rows(table_id, &rows).await,
            WriteMode::Update => self.caps.persistence.update_rows(table_id, buffer).await,
        };
        // Persistence failures are logged and the batch continues (§4.4,
        // §7): the caller is never notified through the stream.
        if let Err(err) = result {
            self.audit.write(crate::audit::AuditRecord {
                event: crate::audit::AuditEvent::PersistenceFailed,
                table_id,
                row_id: None,
                column_id: None,
                summary: Some(&err.to_string()),
            });
        }
        buffer.clear();
    }
}

#[derive(Clone, Copy)]
enum WriteMode {
    Add,
    Update,
}

fn render_stream_event(row_id: &str, output_column_id: &str, event: CellEvent) -> String {
    match event {
        CellEvent::Delta(delta) => {
            let chunk = crate::cell::delta_to_wire(
                row_id,
                output_column_id,
                "model",
                chrono::Local::now().timestamp(),
                &delta,
            );
            events::CellEvent::Chunk(chunk).to_sse()
        }
        CellEvent::References(refs) => {
            let wire = crate::rag::to_wire(row_id, output_column_id, &refs);
            events::CellEvent::References(wire).to_sse()
        }
        CellEvent::Final { content, finish_reason, usage } => {
            let mut chunk = crate::cell::delta_to_wire(
                row_id,
                output_column_id,
                "model",
                chrono::Local::now().timestamp(),
                &crate::capabilities::ChatDelta {
                    content: Some(content),
                    reasoning_content: None,
                    usage: usage.clone(),
                    finish_reason: Some(finish_reason.clone()),
                },
            );
            chunk.finish_reason = Some(finish_reason);
            events::CellEvent::Chunk(chunk).to_sse()
        }
    }
}

fn accumulate(
    aggregate: &mut BTreeMap<String, RowCompletionResponse>,
    row_id: &str,
    output_column_id: &str,
    event: CellEvent,
) {
    let row_entry = aggregate
        .entry(row_id.to_string())
        .or_insert_with(|| RowCompletionResponse { row_id: row_id.to_string(), columns: BTreeMap::new() });
    match event {
        CellEvent::Delta(_) => {}
        CellEvent::References(refs) => {
            let entry = row_entry
                .columns
                .entry(output_column_id.to_string())
                .or_insert_with(|| empty_cell_response(output_column_id));
            entry.references = Some(CellReferences {
                row_id: row_entry.row_id.clone(),
                output_column_name: output_column_id.to_string(),
                search_query: refs.search_query,
                chunks: refs.chunks,
            });
        }
        CellEvent::Final { content, finish_reason, usage } => {
            let entry = row_entry
                .columns
                .entry(output_column_id.to_string())
                .or_insert_with(|| empty_cell_response(output_column_id));
            entry.content = content;
            entry.finish_reason = finish_reason;
            entry.usage = usage.map(|u| events::Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            });
        }
    }
}

fn empty_cell_response(output_column_id: &str) -> crate::events::CellCompletionResponse {
    crate::events::CellCompletionResponse {
        output_column_name: output_column_id.to_string(),
        content: String::new(),
        reasoning_content: None,
        finish_reason: String::new(),
        usage: None,
        references: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDtype;

    #[test]
    fn write_batch_size_is_max_10_or_n_over_10() {
        let cfg = ExecutionConfig::default();
        assert_eq!(cfg.write_batch_size(5), 10);
        assert_eq!(cfg.write_batch_size(1000), 100);
        assert_eq!(cfg.write_batch_size(500), 50);
    }

    #[test]
    fn multi_turn_forces_serial_sizing() {
        let cfg = ExecutionConfig::default();
        let cols = vec![ColumnMeta {
            id: "a".into(),
            dtype: ColumnDtype::Str,
            column_order: 0,
            gen_config: Some(crate::schema::GenConfig::Llm(crate::schema::LlmGenConfig {
                model: "m".into(),
                system_prompt: String::new(),
                user_prompt: String::new(),
                hyperparameters: Default::default(),
                multi_turn: true,
                rag_params: None,
                tools: None,
                reasoning_effort: None,
            })),
        }];
        let (row_batch, col_batch, write_batch) = sizing(&cols, 10, &cfg);
        assert_eq!((row_batch, col_batch, write_batch), (1, 1, 1));
    }
}
