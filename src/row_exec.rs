//! Row Executor (C3, spec §4.3).
//!
//! Holds the state of one row, schedules ready cell tasks with bounded
//! column concurrency, propagates upstream errors, and emits results onto
//! the shared output queue.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use crate::cell::{self, CellEvent, ExecContext};
use crate::error::{CoreError, CoreResult};
use crate::schema::{ColumnMeta, Row, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenStrategy {
    RunAll,
    RunSelected,
    RunBefore,
    RunAfter,
}

#[derive(Clone)]
pub enum RowRequest {
    Add { data: BTreeMap<String, Value> },
    Regen {
        existing: Row,
        strategy: RegenStrategy,
        output_column_id: Option<String>,
    },
}

/// One output event tagged with its row/column, pushed onto the
/// orchestrator's shared queue (§4.3 "Output").
pub enum RowOutputEvent {
    Cell { row_id: String, output_column_id: String, event: CellEvent },
    RowFinal { row: Row },
}

pub struct RowExecutor {
    pub row_id: String,
    col_map: Arc<BTreeMap<String, ColumnMeta>>,
    dependencies: Arc<HashMap<String, BTreeSet<String>>>,
    row: Row,
    tasks: Vec<Task>,
    errored: BTreeSet<String>,
    col_batch_size: usize,
}

fn next_row_id() -> String {
    // Sortable, monotonically increasing with creation time (§3.2): a
    // millisecond timestamp plus a counter disambiguates same-millisecond
    // rows within a process.
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("row_{millis:020}_{seq:08}")
}

impl RowExecutor {
    pub fn new(
        request: RowRequest,
        col_map: Arc<BTreeMap<String, ColumnMeta>>,
        dependencies: Arc<HashMap<String, BTreeSet<String>>>,
        col_batch_size: usize,
    ) -> CoreResult<Self> {
        let row = match request {
            RowRequest::Add { data } => {
                let mut row = Row::default();
                for (k, v) in data {
                    if col_map.contains_key(&k) && k != "Updated at" {
                        row.set(k, v);
                    }
                }
                row.id = next_row_id();
                row.cells.insert("ID".to_string(), Value::String(row.id.clone()));
                row
            }
            RowRequest::Regen { existing, strategy, output_column_id } => {
                Self::apply_regen_strategy(existing, &col_map, strategy, output_column_id.as_deref())?
            }
        };

        let tasks = col_map
            .values()
            .filter(|c| c.is_output())
            .filter(|c| !row.has(&c.id))
            .filter_map(Task::new)
            .collect();

        Ok(Self {
            row_id: row.id.clone(),
            col_map,
            dependencies,
            row,
            tasks,
            errored: BTreeSet::new(),
            col_batch_size: col_batch_size.max(1),
        })
    }

    fn apply_regen_strategy(
        mut row: Row,
        col_map: &BTreeMap<String, ColumnMeta>,
        strategy: RegenStrategy,
        output_column_id: Option<&str>,
    ) -> CoreResult<Row> {
        if strategy != RegenStrategy::RunAll {
            let target = output_column_id
                .ok_or_else(|| CoreError::BadInput("output_column_id is required".into()))?;
            let target_col = col_map
                .get(target)
                .filter(|c| c.is_output())
                .ok_or_else(|| CoreError::BadInput(format!("`{target}` is not an output column")))?;

            match strategy {
                RegenStrategy::RunAll => unreachable!(),
                RegenStrategy::RunSelected => {
                    row.cells.remove(target);
                    row.cells.remove(&format!("{target}_"));
                }
                RegenStrategy::RunBefore => {
                    // Regenerate the target and everything strictly before
                    // it among outputs; preserve outputs at or after it.
                    for c in col_map.values().filter(|c| c.is_output()) {
                        if c.column_order <= target_col.column_order {
                            row.cells.remove(&c.id);
                            row.cells.remove(&format!("{}_", c.id));
                        }
                    }
                }
                RegenStrategy::RunAfter => {
                    // Regenerate everything strictly after the target;
                    // preserve the target and everything at or before it.
                    //
                    // The original `gen_executor.py`'s RUN_AFTER drops the
                    // target too (`_cols[:idx]` keeps only what's strictly
                    // before it). This implementation follows spec §4.3's
                    // prose instead, which is explicit that RUN_AFTER keeps
                    // inputs "+ all output columns *at or before* the
                    // target" — i.e. the target itself survives. Pinned by
                    // `run_after_preserves_target_and_before` below.
                    for c in col_map.values().filter(|c| c.is_output()) {
                        if c.column_order > target_col.column_order {
                            row.cells.remove(&c.id);
                            row.cells.remove(&format!("{}_", c.id));
                        }
                    }
                }
            }
        } else {
            // RUN_ALL: keep only input columns, drop every output cell.
            for c in col_map.values().filter(|c| c.is_output()) {
                row.cells.remove(&c.id);
                row.cells.remove(&format!("{}_", c.id));
            }
        }
        Ok(row)
    }

    fn is_ready(&self, task: &Task) -> bool {
        // A dependency is satisfied once its key exists in the row dict at
        // all (`contains`, not `has`): a failed upstream cell still writes
        // `None` into its slot, and that must unblock dependents so they can
        // reach the upstream-error gate in `cell::execute` rather than
        // stalling forever waiting for a value that will never be produced.
        self.dependencies
            .get(&task.output_column_id)
            .map(|deps| deps.iter().all(|d| self.row.contains(d) || !self.col_map.contains_key(d)))
            .unwrap_or(true)
    }

    /// Drives the scheduling loop to completion, pushing every event onto
    /// `out`. Bounded by `col_batch_size` concurrently-running tasks within
    /// this row (§4.3 scheduling loop, §5 concurrency bounds).
    pub async fn run(mut self, ctx: Arc<ExecContextOwned>, is_stream: bool, out: mpsc::Sender<RowOutputEvent>) -> Row {
        let semaphore = Arc::new(Semaphore::new(self.col_batch_size));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, cell::CellOutcome)>();

        loop {
            let ready_idxs: Vec<usize> = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status == TaskStatus::Pending && self.is_ready(t))
                .map(|(i, _)| i)
                .collect();

            for idx in ready_idxs {
                self.tasks[idx].status = TaskStatus::Running;
                let task = self.tasks[idx].clone();
                let row_snapshot = self.row.clone();
                let errored_snapshot = self.errored.clone();
                let row_id = self.row_id.clone();
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let owned_ctx = ctx.clone();
                let done_tx = done_tx.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let exec_ctx = owned_ctx.as_exec_context();
                    let output_col = task.output_column_id.clone();
                    let out_for_events = out.clone();
                    let row_id_for_events = row_id.clone();
                    // `.send(...).await` rather than `try_send`: a slow
                    // streaming consumer must make producers wait, not
                    // silently drop deltas, once the shared channel fills
                    // (§5 Backpressure). Each invocation clones its own
                    // handles into a boxed future so the `FnMut` signature
                    // `cell::execute` expects can still be awaited from
                    // inside the router's sync polling loop (see
                    // `cell::execute_chat`'s streaming branch).
                    let outcome = cell::execute(
                        &exec_ctx,
                        &task,
                        &row_snapshot,
                        &row_id,
                        &errored_snapshot,
                        is_stream,
                        move |event| {
                            let out_for_events = out_for_events.clone();
                            let row_id_for_events = row_id_for_events.clone();
                            let output_col = output_col.clone();
                            Box::pin(async move {
                                let _ = out_for_events
                                    .send(RowOutputEvent::Cell {
                                        row_id: row_id_for_events,
                                        output_column_id: output_col,
                                        event,
                                    })
                                    .await;
                            })
                        },
                    )
                    .await;
                    let _ = done_tx.send((task.output_column_id.clone(), outcome));
                });
            }

            if self.tasks.iter().all(|t| t.status == TaskStatus::Done) {
                break;
            }

            // Nothing further to dispatch this pass; wait for an in-flight
            // completion signal to unblock the remaining tasks (§4.3 step 3).
            match done_rx.recv().await {
                Some((col_id, outcome)) => {
                    if outcome.errored {
                        self.errored.insert(col_id.clone());
                    }
                    self.row.set(col_id.clone(), outcome.value);
                    if let Some(state) = outcome.state {
                        self.row.set_state(&col_id, state);
                    }
                    if let Some(t) = self.tasks.iter_mut().find(|t| t.output_column_id == col_id) {
                        t.status = TaskStatus::Done;
                    }
                }
                None => break,
            }
        }

        let _ = out.send(RowOutputEvent::RowFinal { row: self.row.clone() }).await;
        self.row
    }
}

/// Owned bundle of capability handles a spawned task needs; `ExecContext`
/// itself borrows, so each spawn builds one of these from shared `Arc`s and
/// re-derives a borrowing `ExecContext` for the duration of the call.
pub struct ExecContextOwned {
    pub router: Arc<dyn crate::capabilities::LmRouter>,
    pub search: Arc<dyn crate::capabilities::KnowledgeSearch>,
    pub files: Arc<dyn crate::capabilities::FileLoader>,
    pub code: Arc<dyn crate::capabilities::CodeExecutor>,
    pub persistence: Arc<dyn crate::capabilities::Persistence>,
    pub project_id: String,
    pub table_id: String,
    pub col_map: Arc<BTreeMap<String, ColumnMeta>>,
    pub now_rfc3339: String,
}

impl ExecContextOwned {
    pub fn as_exec_context(&self) -> ExecContext<'_> {
        ExecContext {
            router: self.router.as_ref(),
            search: self.search.as_ref(),
            files: self.files.as_ref(),
            code: self.code.as_ref(),
            persistence: self.persistence.as_ref(),
            project_id: &self.project_id,
            table_id: &self.table_id,
            col_map: &self.col_map,
            now_rfc3339: &self.now_rfc3339,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDtype;

    fn col(id: &str, order: u32, gen: Option<crate::schema::GenConfig>) -> ColumnMeta {
        ColumnMeta { id: id.to_string(), dtype: ColumnDtype::Str, column_order: order, gen_config: gen }
    }

    fn llm(prompt: &str) -> crate::schema::GenConfig {
        crate::schema::GenConfig::Llm(crate::schema::LlmGenConfig {
            model: "m".into(),
            system_prompt: String::new(),
            user_prompt: prompt.to_string(),
            hyperparameters: Default::default(),
            multi_turn: false,
            rag_params: None,
            tools: None,
            reasoning_effort: None,
        })
    }

    struct FailingRouter;

    #[async_trait::async_trait]
    impl crate::capabilities::LmRouter for FailingRouter {
        async fn chat(
            &self,
            _model: &str,
            messages: &[crate::capabilities::ChatMessage],
        ) -> CoreResult<crate::capabilities::ChatResponse> {
            let last = messages.last().map(|m| m.text_content()).unwrap_or_default();
            if last.contains("FAIL") {
                return Err(CoreError::ProviderError("boom".into()));
            }
            Ok(crate::capabilities::ChatResponse {
                content: last.to_uppercase(),
                reasoning_content: None,
                usage: None,
                finish_reason: "stop".to_string(),
            })
        }

        async fn chat_stream(
            &self,
            model: &str,
            messages: &[crate::capabilities::ChatMessage],
            _on_delta: &mut (dyn FnMut(crate::capabilities::ChatDelta) -> crate::capabilities::BoxFuture + Send),
        ) -> CoreResult<crate::capabilities::ChatResponse> {
            self.chat(model, messages).await
        }

        async fn embed(
            &self,
            _model: &str,
            texts: &[String],
        ) -> CoreResult<Vec<crate::capabilities::EmbeddingResponse>> {
            Ok(texts.iter().map(|_| crate::capabilities::EmbeddingResponse { vector: vec![] }).collect())
        }

        async fn rerank(
            &self,
            _model: &str,
            _query: &str,
            _docs: &[String],
        ) -> CoreResult<Vec<crate::capabilities::RerankedDoc>> {
            Ok(vec![])
        }
    }

    struct NoopSearch;
    #[async_trait::async_trait]
    impl crate::capabilities::KnowledgeSearch for NoopSearch {
        async fn knowledge_table_exists(&self, _table_id: &str) -> CoreResult<bool> {
            Ok(true)
        }
        async fn hybrid_search(
            &self,
            _table_id: &str,
            _fts_query: &str,
            _vs_query: &str,
            _limit: usize,
        ) -> CoreResult<Vec<crate::capabilities::KnowledgeRow>> {
            Ok(vec![])
        }
    }

    struct NoopFiles;
    #[async_trait::async_trait]
    impl crate::capabilities::FileLoader for NoopFiles {
        async fn load_document(&self, _name: &str, _bytes: &[u8]) -> CoreResult<String> {
            Ok(String::new())
        }
        async fn open_uri(&self, _uri: &str) -> CoreResult<Vec<u8>> {
            Ok(vec![])
        }
    }

    struct NoopCode;
    #[async_trait::async_trait]
    impl crate::capabilities::CodeExecutor for NoopCode {
        async fn run(
            &self,
            _source_code: &str,
            _row_data: &BTreeMap<String, Value>,
            _output_column: &str,
        ) -> CoreResult<Value> {
            Ok(Value::Null)
        }
    }

    struct NoopPersistence;
    #[async_trait::async_trait]
    impl crate::capabilities::Persistence for NoopPersistence {
        async fn add_rows(&self, _table_id: &str, _rows: &[Row]) -> CoreResult<()> {
            Ok(())
        }
        async fn update_rows(&self, _table_id: &str, _rows: &BTreeMap<String, Row>) -> CoreResult<()> {
            Ok(())
        }
        async fn get_row(&self, _table_id: &str, _row_id: &str) -> CoreResult<Row> {
            Err(CoreError::ResourceNotFound("n/a".into()))
        }
        async fn get_conversation_thread(
            &self,
            _table_id: &str,
            _column_id: &str,
            _row_id: &str,
        ) -> CoreResult<Vec<crate::capabilities::ChatMessage>> {
            Ok(vec![])
        }
    }

    /// Regression test: a cell that errors writes `Null` into the row dict,
    /// not nothing. `is_ready` must treat that as "present" (via
    /// `Row::contains`, not `Row::has`) so the dependent still reaches the
    /// upstream-error gate instead of the scheduler stalling forever waiting
    /// for a completion signal that will never come.
    #[tokio::test]
    async fn downstream_of_errored_column_completes_instead_of_hanging() {
        let cols: BTreeMap<String, ColumnMeta> = [
            ("inp".to_string(), col("inp", 0, None)),
            ("a".to_string(), col("a", 1, Some(llm("FAIL:${inp}")))),
            ("b".to_string(), col("b", 2, Some(llm("B:${a}")))),
        ]
        .into_iter()
        .collect();
        let col_map = Arc::new(cols.clone());
        let deps = Arc::new(crate::deps::dependencies(&cols.values().cloned().collect::<Vec<_>>()));

        let mut data = BTreeMap::new();
        data.insert("inp".to_string(), Value::String("x".into()));
        let row_exec = RowExecutor::new(RowRequest::Add { data }, col_map.clone(), deps, 4).unwrap();

        let ctx = Arc::new(ExecContextOwned {
            router: Arc::new(FailingRouter),
            search: Arc::new(NoopSearch),
            files: Arc::new(NoopFiles),
            code: Arc::new(NoopCode),
            persistence: Arc::new(NoopPersistence),
            project_id: "p".into(),
            table_id: "t".into(),
            col_map,
            now_rfc3339: "2026-01-01T00:00:00Z".into(),
        });

        let (tx, mut rx) = mpsc::channel(64);
        let final_row = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            row_exec.run(ctx, false, tx),
        )
        .await
        .expect("row executor hung instead of completing");
        while rx.recv().await.is_some() {}

        assert_eq!(final_row.get("a"), Some(&Value::Null));
        assert!(
            final_row.contains("b"),
            "dependent column should still run to completion (fail-fast on upstream error) rather than stall"
        );
    }

    #[test]
    fn run_selected_preserves_other_outputs() {
        let cols: BTreeMap<String, ColumnMeta> = [
            ("inp".to_string(), col("inp", 0, None)),
            ("o1".to_string(), col("o1", 1, Some(llm("${inp}")))),
            ("o2".to_string(), col("o2", 2, Some(llm("${inp}")))),
        ]
        .into_iter()
        .collect();

        let mut row = Row::default();
        row.set("inp", Value::String("x".into()));
        row.set("o1", Value::String("X".into()));
        row.set("o2", Value::String("Y".into()));

        let out = RowExecutor::apply_regen_strategy(row, &cols, RegenStrategy::RunSelected, Some("o1")).unwrap();
        assert!(!out.has("o1"));
        assert_eq!(out.get("o2").unwrap(), &Value::String("Y".into()));
    }

    #[test]
    fn run_before_preserves_strictly_after() {
        let cols: BTreeMap<String, ColumnMeta> = [
            ("inp".to_string(), col("inp", 0, None)),
            ("o1".to_string(), col("o1", 1, Some(llm("${inp}")))),
            ("o2".to_string(), col("o2", 2, Some(llm("${inp}")))),
            ("o3".to_string(), col("o3", 3, Some(llm("${inp}")))),
        ]
        .into_iter()
        .collect();

        let mut row = Row::default();
        row.set("inp", Value::String("x".into()));
        row.set("o1", Value::String("X".into()));
        row.set("o2", Value::String("Y".into()));
        row.set("o3", Value::String("Z".into()));

        let out = RowExecutor::apply_regen_strategy(row, &cols, RegenStrategy::RunBefore, Some("o2")).unwrap();
        assert!(!out.has("o1"));
        assert!(!out.has("o2"));
        assert_eq!(out.get("o3").unwrap(), &Value::String("Z".into()));
    }

    #[test]
    fn run_after_preserves_target_and_before() {
        let cols: BTreeMap<String, ColumnMeta> = [
            ("inp".to_string(), col("inp", 0, None)),
            ("o1".to_string(), col("o1", 1, Some(llm("${inp}")))),
            ("o2".to_string(), col("o2", 2, Some(llm("${inp}")))),
            ("o3".to_string(), col("o3", 3, Some(llm("${inp}")))),
        ]
        .into_iter()
        .collect();

        let mut row = Row::default();
        row.set("inp", Value::String("x".into()));
        row.set("o1", Value::String("X".into()));
        row.set("o2", Value::String("Y".into()));
        row.set("o3", Value::String("Z".into()));

        let out = RowExecutor::apply_regen_strategy(row, &cols, RegenStrategy::RunAfter, Some("o2")).unwrap();
        assert_eq!(out.get("o1").unwrap(), &Value::String("X".into()));
        assert_eq!(out.get("o2").unwrap(), &Value::String("Y".into()));
        assert!(!out.has("o3"));
    }
}
