//! Contracts for the external collaborators the core depends on but does
//! not implement (§6.4). Everything here is a capability: the surrounding
//! HTTP surface, persistent store, LM provider router, knowledge-table
//! search, file parsers, and billing collector are out of scope per §1 and
//! are reached only through these traits.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::CoreResult;
use crate::schema::Row;

/// A boxed, owned future returned by an async event sink. Used in place of
/// a plain `FnMut` callback wherever the callback must be able to `.await`
/// (e.g. to respect a bounded channel's backpressure) without requiring
/// unstable async closures or a new `futures`-crate dependency.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One role-tagged chat message, as passed to the LM router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    Image { base64: String, mime: String },
    Audio { base64: String, format: String },
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(text.into())],
        }
    }

    /// Concatenation of all text parts, used for places that need a plain
    /// string view (e.g. RAG's fallback-to-last-user-message rule).
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Request passed into the RAG assembler (§4.5 inputs) and, after
/// rewriting, back out to the chat call in §4.2.1.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub rag_params: Option<crate::schema::RagParams>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One streamed token-level delta from the LM router (§4.2's `CellEvent`
/// token-delta variant, stripped of row/column framing which belongs to C2).
#[derive(Debug, Clone, Default)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RerankedDoc {
    pub index: usize,
    pub score: f32,
}

/// The language-model provider router (§6.4). Retries, backoff, and
/// deployment cooldowns live inside implementations of this trait, never
/// in the core (§5, §7).
#[async_trait]
pub trait LmRouter: Send + Sync {
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> CoreResult<ChatResponse>;

    /// Streams deltas to `on_delta`, returning the final response once the
    /// stream completes. `on_delta` returns a future so implementations can
    /// await it per chunk — the core's own callers use this to push each
    /// delta through a bounded channel with backpressure rather than
    /// dropping it (§5 Backpressure).
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        on_delta: &mut (dyn FnMut(ChatDelta) -> BoxFuture + Send),
    ) -> CoreResult<ChatResponse>;

    async fn embed(&self, model: &str, texts: &[String]) -> CoreResult<Vec<EmbeddingResponse>>;

    async fn rerank(
        &self,
        model: &str,
        query: &str,
        docs: &[String],
    ) -> CoreResult<Vec<RerankedDoc>>;
}

/// One row retrieved from the knowledge table's hybrid index (§4.5 step 4).
#[derive(Debug, Clone)]
pub struct KnowledgeRow {
    pub text: String,
    pub title: Option<String>,
    pub page: Option<u32>,
    pub document_id: String,
    pub chunk_id: String,
    pub context: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

/// Hybrid FTS + vector search over a knowledge table's indexed columns
/// (§4.5 step 3, §6.4).
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn knowledge_table_exists(&self, table_id: &str) -> CoreResult<bool>;

    async fn hybrid_search(
        &self,
        table_id: &str,
        fts_query: &str,
        vs_query: &str,
        limit: usize,
    ) -> CoreResult<Vec<KnowledgeRow>>;
}

/// Loads a chat thread (multi-turn) and performs atomic row writes (§6.4).
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn add_rows(&self, table_id: &str, rows: &[Row]) -> CoreResult<()>;

    async fn update_rows(&self, table_id: &str, rows: &BTreeMap<String, Row>) -> CoreResult<()>;

    async fn get_row(&self, table_id: &str, row_id: &str) -> CoreResult<Row>;

    /// Preceding (system, user, assistant) thread for a multi-turn column,
    /// up to but excluding `row_id` (§4.2.1 step 3).
    async fn get_conversation_thread(
        &self,
        table_id: &str,
        column_id: &str,
        row_id: &str,
    ) -> CoreResult<Vec<ChatMessage>>;
}

/// Parses a document's bytes into text (§6.4, used by §4.2 step 4).
#[async_trait]
pub trait FileLoader: Send + Sync {
    async fn load_document(&self, name: &str, bytes: &[u8]) -> CoreResult<String>;

    async fn open_uri(&self, uri: &str) -> CoreResult<Vec<u8>>;
}

/// Runs a Code or PythonFixed cell's program text against a byte-keyed row
/// snapshot (§4.2 "Code"/"PythonFixed").
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn run(
        &self,
        source_code: &str,
        row_data: &BTreeMap<String, Value>,
        output_column: &str,
    ) -> CoreResult<Value>;
}

/// Optional egress-billing sink (§6.4, §4.4 step 4).
#[async_trait]
pub trait BillingCollector: Send + Sync {
    async fn create_egress_events(&self, bytes: u64);
}
