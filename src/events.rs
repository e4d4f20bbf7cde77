//! Streamed/aggregate wire types (§6.2, §6.3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChoiceDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub delta: ChoiceDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One token-level streaming event for a single (row, column) (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellCompletionChunk {
    pub row_id: String,
    pub output_column_name: String,
    pub id: String,
    pub created: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One chunk rendered for the `<up-to-date-context>` block (§4.5 step 4/7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub title: Option<String>,
    pub page: Option<u32>,
    pub document_id: String,
    pub chunk_id: String,
    pub context: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

/// References event, populated once per RAG-enabled chat cell (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellReferences {
    pub row_id: String,
    pub output_column_name: String,
    pub search_query: String,
    pub chunks: Vec<Chunk>,
}

/// Either wire event a streaming client can receive for one cell (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellEvent {
    Chunk(CellCompletionChunk),
    References(CellReferences),
}

impl CellEvent {
    /// Renders `data: <json>\n\n` per §6.2.
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", serde_json::to_string(self).unwrap_or_default())
    }
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Non-streaming per-cell response (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellCompletionResponse {
    pub output_column_name: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    pub finish_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<CellReferences>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowCompletionResponse {
    pub row_id: String,
    pub columns: BTreeMap<String, CellCompletionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRowCompletionResponse {
    pub rows: Vec<RowCompletionResponse>,
}
