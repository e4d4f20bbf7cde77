//! Demo harness for the generative table execution core.
//!
//! Loads `.env` (teacher idiom, see the original `dotenvy::dotenv()` call
//! in `src/main.rs`), builds an in-memory schema and capability stubs, and
//! runs one add-rows batch end to end so the pipeline can be inspected
//! without a surrounding HTTP service.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use gentable_core::audit::AuditLogger;
use gentable_core::batch::{AddRowsRequest, BatchOrchestrator, BatchOutcome, Capabilities};
use gentable_core::capabilities::{
    ChatDelta, ChatMessage, ChatResponse, CodeExecutor, EmbeddingResponse, FileLoader,
    KnowledgeRow, KnowledgeSearch, LmRouter, RerankedDoc,
};
use gentable_core::config::ExecutionConfig;
use gentable_core::error::{CoreError, CoreResult};
use gentable_core::schema::{ColumnDtype, ColumnMeta, GenConfig, LlmGenConfig};

/// Echoes the spec's own test stub: `"[uc(prompt)]"`, the uppercased
/// prompt after substitution.
struct DemoRouter;

#[async_trait]
impl LmRouter for DemoRouter {
    async fn chat(&self, _model: &str, messages: &[ChatMessage]) -> CoreResult<ChatResponse> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == gentable_core::capabilities::ChatRole::User)
            .map(|m| m.text_content())
            .unwrap_or_default();
        Ok(ChatResponse {
            content: format!("[{}]", last_user.to_uppercase()),
            reasoning_content: None,
            usage: None,
            finish_reason: "stop".to_string(),
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        on_delta: &mut (dyn FnMut(ChatDelta) -> gentable_core::capabilities::BoxFuture + Send),
    ) -> CoreResult<ChatResponse> {
        let resp = self.chat(model, messages).await?;
        on_delta(ChatDelta {
            content: Some(resp.content.clone()),
            reasoning_content: None,
            usage: None,
            finish_reason: Some(resp.finish_reason.clone()),
        })
        .await;
        Ok(resp)
    }

    async fn embed(&self, _model: &str, texts: &[String]) -> CoreResult<Vec<EmbeddingResponse>> {
        Ok(texts.iter().map(|_| EmbeddingResponse { vector: vec![1.0, 0.0] }).collect())
    }

    async fn rerank(&self, _model: &str, _query: &str, docs: &[String]) -> CoreResult<Vec<RerankedDoc>> {
        Ok((0..docs.len()).map(|i| RerankedDoc { index: i, score: 1.0 }).collect())
    }
}

struct DemoSearch;

#[async_trait]
impl KnowledgeSearch for DemoSearch {
    async fn knowledge_table_exists(&self, _table_id: &str) -> CoreResult<bool> {
        Ok(true)
    }

    async fn hybrid_search(
        &self,
        _table_id: &str,
        _fts_query: &str,
        _vs_query: &str,
        limit: usize,
    ) -> CoreResult<Vec<KnowledgeRow>> {
        Ok((0..limit.min(2))
            .map(|i| KnowledgeRow {
                text: format!("chunk {i} text"),
                title: Some(format!("doc-{i}")),
                page: Some(1),
                document_id: format!("doc-{i}"),
                chunk_id: i.to_string(),
                context: None,
                metadata: BTreeMap::new(),
            })
            .collect())
    }
}

struct DemoFiles;

#[async_trait]
impl FileLoader for DemoFiles {
    async fn load_document(&self, _name: &str, bytes: &[u8]) -> CoreResult<String> {
        Ok(String::from_utf8_lossy(bytes).to_string())
    }

    async fn open_uri(&self, _uri: &str) -> CoreResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

struct DemoCode;

#[async_trait]
impl CodeExecutor for DemoCode {
    async fn run(
        &self,
        source_code: &str,
        _row_data: &BTreeMap<String, Value>,
        _output_column: &str,
    ) -> CoreResult<Value> {
        Ok(Value::String(source_code.len().to_string()))
    }
}

#[derive(Default)]
struct DemoPersistence {
    rows: Mutex<BTreeMap<String, gentable_core::schema::Row>>,
}

#[async_trait]
impl gentable_core::capabilities::Persistence for DemoPersistence {
    async fn add_rows(&self, _table_id: &str, rows: &[gentable_core::schema::Row]) -> CoreResult<()> {
        let mut store = self.rows.lock().unwrap();
        for row in rows {
            store.insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    async fn update_rows(
        &self,
        _table_id: &str,
        rows: &BTreeMap<String, gentable_core::schema::Row>,
    ) -> CoreResult<()> {
        let mut store = self.rows.lock().unwrap();
        for (id, row) in rows {
            store.insert(id.clone(), row.clone());
        }
        Ok(())
    }

    async fn get_row(&self, _table_id: &str, row_id: &str) -> CoreResult<gentable_core::schema::Row> {
        self.rows
            .lock()
            .unwrap()
            .get(row_id)
            .cloned()
            .ok_or_else(|| CoreError::ResourceNotFound(format!("row `{row_id}`")))
    }

    async fn get_conversation_thread(
        &self,
        _table_id: &str,
        _column_id: &str,
        _row_id: &str,
    ) -> CoreResult<Vec<ChatMessage>> {
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let columns = vec![
        ColumnMeta { id: "ID".into(), dtype: ColumnDtype::Str, column_order: 0, gen_config: None },
        ColumnMeta { id: "input".into(), dtype: ColumnDtype::Str, column_order: 1, gen_config: None },
        ColumnMeta {
            id: "summary".into(),
            dtype: ColumnDtype::Str,
            column_order: 2,
            gen_config: Some(GenConfig::Llm(LlmGenConfig {
                model: "demo-model".into(),
                system_prompt: String::new(),
                user_prompt: "S:${input}".into(),
                hyperparameters: Default::default(),
                multi_turn: false,
                rag_params: None,
                tools: None,
                reasoning_effort: None,
            })),
        },
    ];

    let caps = Capabilities {
        router: Arc::new(DemoRouter),
        search: Arc::new(DemoSearch),
        files: Arc::new(DemoFiles),
        code: Arc::new(DemoCode),
        persistence: Arc::new(DemoPersistence::default()),
        billing: None,
    };

    let audit = AuditLogger::new(std::path::Path::new("./target/demo-logs"));
    let orchestrator = BatchOrchestrator::new(caps, ExecutionConfig::default(), audit);

    let mut data = BTreeMap::new();
    data.insert("input".to_string(), Value::String("hi".to_string()));

    let req = AddRowsRequest { table_id: "demo".into(), data: vec![data], stream: false };
    let outcome = orchestrator.add_rows(req, columns, "demo-project", |_line| {}).await?;

    match outcome {
        BatchOutcome::Aggregated(resp) => {
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        BatchOutcome::Streamed { event_count, egress_bytes } => {
            println!("streamed {event_count} events, {egress_bytes} bytes");
        }
    }

    Ok(())
}
