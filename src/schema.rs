//! Column schema and row/task types (spec §3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Element type of a `Vector` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorElem {
    F32,
    F16,
}

/// Data type of a column (§3.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnDtype {
    Int,
    Float,
    Bool,
    Str,
    Image,
    Audio,
    Document,
    Vector { elem: VectorElem, len: usize },
}

impl ColumnDtype {
    pub fn is_file_like(&self) -> bool {
        matches!(
            self,
            ColumnDtype::Image | ColumnDtype::Audio | ColumnDtype::Document
        )
    }
}

/// Chat hyperparameters passed through to the LM router untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

/// Retrieval configuration attached to an `Llm` generation config (§4.5 inputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagParams {
    pub knowledge_table_id: String,
    pub k: usize,
    pub reranking_model: Option<String>,
    #[serde(default)]
    pub inline_citations: bool,
    #[serde(default)]
    pub fts_query: Option<String>,
    #[serde(default)]
    pub vs_query: Option<String>,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmGenConfig {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub multi_turn: bool,
    #[serde(default)]
    pub rag_params: Option<RagParams>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedGenConfig {
    pub embedding_model: String,
    pub source_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeGenConfig {
    pub source_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonFixedGenConfig {
    pub code: String,
}

/// Tagged union of generation configurations (§3.1). Each variant is a
/// concrete struct; dispatch on this enum is exhaustive everywhere it's
/// matched (§9 "dynamic polymorphism of generation configs").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum GenConfig {
    Llm(LlmGenConfig),
    Embed(EmbedGenConfig),
    Code(CodeGenConfig),
    PythonFixed(PythonFixedGenConfig),
}

/// A column definition, read-only during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub id: String,
    pub dtype: ColumnDtype,
    pub column_order: u32,
    pub gen_config: Option<GenConfig>,
}

impl ColumnMeta {
    /// `ID` or `Updated at`: never generated.
    pub fn is_info(&self) -> bool {
        self.id == "ID" || self.id == "Updated at"
    }

    /// State columns carry the `_` suffix on their data column's id.
    pub fn is_state(&self) -> bool {
        self.id.ends_with('_') && self.id.len() > 1
    }

    pub fn is_vector(&self) -> bool {
        matches!(self.dtype, ColumnDtype::Vector { .. })
    }

    pub fn is_output(&self) -> bool {
        self.gen_config.is_some()
    }

    pub fn is_document(&self) -> bool {
        matches!(self.dtype, ColumnDtype::Document)
    }
}

/// State column payload (§3.2): auxiliary JSON stored alongside a data
/// column's cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A row under construction, owned exclusively by its `RowExecutor` (§3.2).
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub id: String,
    pub updated_at: Option<String>,
    pub cells: BTreeMap<String, Value>,
}

impl Row {
    pub fn get(&self, col: &str) -> Option<&Value> {
        self.cells.get(col)
    }

    pub fn has(&self, col: &str) -> bool {
        self.cells
            .get(col)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    /// True once `col` has an entry in the row dict at all, including an
    /// explicit `None`/`Null` left behind by a failed cell. Dependency
    /// readiness (§4.3) keys off this rather than `has`: an errored upstream
    /// column still counts as "present" so its dependents can reach the
    /// upstream-error gate instead of waiting forever for a value that will
    /// never arrive.
    pub fn contains(&self, col: &str) -> bool {
        self.cells.contains_key(col)
    }

    pub fn set(&mut self, col: impl Into<String>, value: Value) {
        self.cells.insert(col.into(), value);
    }

    pub fn set_state(&mut self, col: &str, state: CellState) {
        self.cells
            .insert(format!("{col}_"), serde_json::to_value(state).unwrap_or(Value::Null));
    }
}

/// Task status (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
}

/// One cell task, owned by the `RowExecutor` that scheduled it (§3.3).
#[derive(Debug, Clone)]
pub struct Task {
    pub output_column_id: String,
    pub dtype: ColumnDtype,
    pub config: GenConfig,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(col: &ColumnMeta) -> Option<Self> {
        let config = col.gen_config.clone()?;
        Some(Task {
            output_column_id: col.id.clone(),
            dtype: col.dtype.clone(),
            config,
            status: TaskStatus::Pending,
        })
    }
}
