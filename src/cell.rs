//! Cell Task Executor (C2, spec §4.2).
//!
//! Executes exactly one cell task against external capabilities and emits
//! a stream of `CellEvent`s plus a final typed value.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use base64::Engine as _;
use serde_json::Value;

use crate::capabilities::{
    BoxFuture, ChatDelta, ChatMessage, ChatRequest, ChatRole, CodeExecutor, ContentPart,
    FileLoader, KnowledgeSearch, LmRouter, Persistence,
};
use crate::deps::extract_vars;
use crate::error::{CoreError, CoreResult};
use crate::events::{CellCompletionChunk, Choice, ChoiceDelta, Usage};
use crate::rag;
use crate::schema::{CellState, ColumnDtype, ColumnMeta, GenConfig, Row, Task};

/// Non-wire event emitted during a single cell's execution; the caller
/// (Row Executor / Batch Orchestrator) tags these with row/column and
/// forwards them onto the shared output queue or converts to wire format.
pub enum CellEvent {
    Delta(ChatDelta),
    References(rag::References),
    Final { content: String, finish_reason: String, usage: Option<crate::capabilities::TokenUsage> },
}

pub struct ExecContext<'a> {
    pub router: &'a dyn LmRouter,
    pub search: &'a dyn KnowledgeSearch,
    pub files: &'a dyn FileLoader,
    pub code: &'a dyn CodeExecutor,
    pub persistence: &'a dyn Persistence,
    pub project_id: &'a str,
    pub table_id: &'a str,
    pub col_map: &'a BTreeMap<String, ColumnMeta>,
    pub now_rfc3339: &'a str,
}

/// Outcome of executing one task: the value to write into `row_dict`, the
/// state (if any), and whether the column should be added to `errored`.
pub struct CellOutcome {
    pub value: Value,
    pub state: Option<CellState>,
    pub errored: bool,
}

fn guess_mime(uri: &str) -> &'static str {
    let lower = uri.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".mp3") {
        "audio/mpeg"
    } else if lower.ends_with(".wav") {
        "audio/wav"
    } else {
        "application/octet-stream"
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitutes `${col}` references in `template` per §4.2.2: file-typed
/// values are replaced by parsed text (documents) or empty string
/// (image/audio), with the original content appended as a multimodal part;
/// other values are stringified in place. Leading/trailing whitespace is
/// stripped afterward, and an empty result becomes `"."`.
pub async fn substitute(
    template: &str,
    row: &Row,
    col_map: &BTreeMap<String, ColumnMeta>,
    files: &dyn FileLoader,
) -> CoreResult<(String, Vec<ContentPart>)> {
    let mut text = String::new();
    let mut last = 0usize;
    let mut parts = Vec::new();

    // Re-scan rather than reuse `extract_vars` output directly so we can
    // rebuild the string with exact escape handling in one pass.
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    for m in re.find_iter(template) {
        let escaped = m.start() > 0 && template.as_bytes()[m.start() - 1] == b'\\';
        if escaped {
            // Keep everything up to and including the backslash, then drop
            // the backslash itself and emit the literal `${name}`.
            text.push_str(&template[last..m.start() - 1]);
            text.push_str(&template[m.start()..m.end()]);
            last = m.end();
            continue;
        }
        text.push_str(&template[last..m.start()]);
        last = m.end();

        let name = &template[m.start() + 2..m.end() - 1];
        let value = row.get(name).cloned().unwrap_or(Value::Null);
        let col = col_map.get(name);

        match col.map(|c| &c.dtype) {
            Some(ColumnDtype::Image) | Some(ColumnDtype::Audio) | Some(ColumnDtype::Document)
                if !stringify(&value).is_empty() =>
            {
                let uri = stringify(&value);
                let bytes = files.open_uri(&uri).await?;
                match col.unwrap().dtype {
                    ColumnDtype::Document => {
                        let parsed = files.load_document(&uri, &bytes).await?;
                        text.push_str(&parsed);
                    }
                    ColumnDtype::Image => {
                        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                        parts.push(ContentPart::Image { base64: b64, mime: guess_mime(&uri).to_string() });
                    }
                    ColumnDtype::Audio => {
                        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                        parts.push(ContentPart::Audio { base64: b64, format: guess_mime(&uri).to_string() });
                    }
                    _ => unreachable!(),
                }
            }
            _ => {
                text.push_str(&stringify(&value));
            }
        }
    }
    text.push_str(&template[last..]);

    let trimmed = text.trim().to_string();
    let trimmed = if trimmed.is_empty() { ".".to_string() } else { trimmed };
    Ok((trimmed, parts))
}

fn left_of_self_non_info(col: &ColumnMeta, col_map: &BTreeMap<String, ColumnMeta>) -> Vec<String> {
    col_map
        .values()
        .filter(|c| {
            c.column_order < col.column_order && !c.is_info() && !c.is_state() && !c.is_vector()
        })
        .map(|c| c.id.clone())
        .collect()
}

fn upstream_columns(task: &Task, col_map: &BTreeMap<String, ColumnMeta>) -> Vec<String> {
    match &task.config {
        GenConfig::Llm(c) => {
            let mut v = extract_vars(&c.system_prompt);
            v.extend(extract_vars(&c.user_prompt));
            v
        }
        GenConfig::Embed(c) => vec![c.source_column.clone()],
        GenConfig::Code(c) => vec![c.source_column.clone()],
        GenConfig::PythonFixed(_) => {
            let col = col_map.get(&task.output_column_id).expect("task column must exist");
            left_of_self_non_info(col, col_map)
        }
    }
}

fn check_upstream_error(upstream_cols: &[String], errored: &BTreeSet<String>) -> CoreResult<()> {
    let offending: Vec<String> = upstream_cols.iter().filter(|c| errored.contains(*c)).cloned().collect();
    if offending.is_empty() {
        Ok(())
    } else {
        Err(CoreError::UpstreamError { columns: offending })
    }
}

/// Executes one cell task. Returns the outcome along with every event
/// emitted along the way, via `on_event`.
pub async fn execute(
    ctx: &ExecContext<'_>,
    task: &Task,
    row: &Row,
    row_id: &str,
    errored: &BTreeSet<String>,
    is_stream: bool,
    mut on_event: impl FnMut(CellEvent) -> BoxFuture + Send,
) -> CellOutcome {
    // Pre-filled cells bypass generation entirely (§4.2.1 step 1 / §9 open
    // question: no event, just the value).
    if row.has(&task.output_column_id) {
        return CellOutcome {
            value: row.get(&task.output_column_id).cloned().unwrap_or(Value::Null),
            state: None,
            errored: false,
        };
    }

    let upstream = upstream_columns(task, ctx.col_map);
    if let Err(e) = check_upstream_error(&upstream, errored) {
        let content = e.as_cell_content();
        on_event(CellEvent::Final {
            content: content.clone(),
            finish_reason: "error".to_string(),
            usage: None,
        })
        .await;
        return CellOutcome {
            value: Value::Null,
            state: Some(CellState { error: Some(content), ..Default::default() }),
            errored: true,
        };
    }

    let result = match &task.config {
        GenConfig::Llm(cfg) => {
            execute_chat(ctx, task, cfg, row, row_id, is_stream, &mut on_event).await
        }
        GenConfig::Embed(cfg) => execute_embed(ctx, cfg, row, &task.output_column_id).await,
        GenConfig::Code(cfg) => execute_code(ctx, cfg, row, &task.output_column_id).await,
        GenConfig::PythonFixed(cfg) => {
            execute_python_fixed(ctx, cfg, row, &task.output_column_id).await
        }
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            let content = e.as_cell_content();
            on_event(CellEvent::Final {
                content: content.clone(),
                finish_reason: "error".to_string(),
                usage: None,
            })
            .await;
            CellOutcome {
                value: Value::Null,
                state: Some(CellState { error: Some(content), ..Default::default() }),
                errored: true,
            }
        }
    }
}

async fn execute_chat(
    ctx: &ExecContext<'_>,
    task: &Task,
    cfg: &crate::schema::LlmGenConfig,
    row: &Row,
    row_id: &str,
    is_stream: bool,
    on_event: &mut (impl FnMut(CellEvent) -> BoxFuture + Send),
) -> CoreResult<CellOutcome> {
    let mut messages = if cfg.multi_turn {
        ctx.persistence
            .get_conversation_thread(ctx.table_id, &task.output_column_id, row_id)
            .await?
    } else {
        vec![ChatMessage::text(ChatRole::System, cfg.system_prompt.clone())]
    };

    let (user_text, extra_parts) = substitute(&cfg.user_prompt, row, ctx.col_map, ctx.files).await?;
    let mut parts = vec![ContentPart::Text(user_text)];
    parts.extend(extra_parts);
    messages.push(ChatMessage { role: ChatRole::User, parts });

    let mut refs = None;
    if let Some(rag_params) = &cfg.rag_params {
        let request = ChatRequest { messages, rag_params: Some(rag_params.clone()) };
        let (rewritten, r) = rag::assemble(
            ctx.router,
            ctx.search,
            ctx.project_id,
            ctx.table_id,
            rag_params,
            request,
            ctx.now_rfc3339,
        )
        .await?;
        messages = rewritten.messages;
        refs = Some(r);
    }

    if let Some(r) = &refs {
        on_event(CellEvent::References(rag::References {
            chunks: r.chunks.clone(),
            search_query: r.search_query.clone(),
        }))
        .await;
    }

    let model = &cfg.model;
    let t0 = Instant::now();
    let mut first_content_at: Option<std::time::Duration> = None;
    let (content, reasoning_content, usage, finish_reason) = if is_stream {
        let mut acc_content = String::new();
        let mut acc_reasoning = String::new();
        let mut acc_usage = None;
        let resp = ctx
            .router
            .chat_stream(model, &messages, &mut |delta: ChatDelta| {
                if let Some(c) = &delta.content {
                    if first_content_at.is_none() && !c.is_empty() {
                        first_content_at = Some(t0.elapsed());
                    }
                    acc_content.push_str(c);
                }
                if let Some(r) = &delta.reasoning_content {
                    acc_reasoning.push_str(r);
                }
                if delta.usage.is_some() {
                    acc_usage = delta.usage.clone();
                }
                // Return the sink's own future rather than awaiting it here:
                // this closure is sync (it's called from inside the
                // router's stream-polling loop), but the future it hands
                // back still lets the router await per-delta backpressure
                // before pulling the next chunk (§5 Backpressure).
                on_event(CellEvent::Delta(delta))
            })
            .await?;
        let content = if acc_content.is_empty() { resp.content } else { acc_content };
        let reasoning = if acc_reasoning.is_empty() { resp.reasoning_content } else { Some(acc_reasoning) };
        (content, reasoning, acc_usage.or(resp.usage), resp.finish_reason)
    } else {
        let resp = ctx.router.chat(model, &messages).await?;
        (resp.content, resp.reasoning_content, resp.usage, resp.finish_reason)
    };

    on_event(CellEvent::Final {
        content: content.clone(),
        finish_reason: finish_reason.clone(),
        usage: usage.clone(),
    })
    .await;

    let state = CellState {
        references: refs.as_ref().map(|r| {
            serde_json::to_value(rag::to_wire(row_id, &task.output_column_id, r)).unwrap_or(Value::Null)
        }),
        reasoning_content,
        reasoning_time: first_content_at.map(|d| d.as_secs_f64()),
        error: None,
    };

    Ok(CellOutcome { value: Value::String(content), state: Some(state), errored: false })
}

/// Rounds `x` through an IEEE 754 half-precision round-trip, the precision
/// loss a `np.float16` cast would incur. Hand-rolled rather than pulling in
/// the `half` crate for a single conversion (no pack example reaches for
/// `half`, and the bit-twiddling is the standard textbook algorithm).
fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32 - 127 + 15;
    let mantissa = bits & 0x7f_ffff;
    if exp <= 0 {
        if exp < -10 {
            return sign;
        }
        let mantissa = (mantissa | 0x80_0000) >> (14 - exp);
        sign | (mantissa as u16)
    } else if exp >= 0x1f {
        sign | 0x7c00
    } else {
        sign | ((exp as u16) << 10) | ((mantissa >> 13) as u16)
    }
}

fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = (bits & 0x8000) as u32;
    let exp = (bits & 0x7c00) as u32;
    let mantissa = (bits & 0x03ff) as u32;
    if exp == 0 {
        if mantissa == 0 {
            return f32::from_bits(sign << 16);
        }
        let mut e: i32 = -1;
        let mut m = mantissa;
        while m & 0x0400 == 0 {
            m <<= 1;
            e += 1;
        }
        m &= 0x03ff;
        let exp32 = (127 - 15 - e) as u32;
        f32::from_bits((sign << 16) | (exp32 << 23) | (m << 13))
    } else if exp == 0x7c00 {
        f32::from_bits((sign << 16) | 0x7f80_0000 | (mantissa << 13))
    } else {
        let exp32 = ((exp >> 10) as i32 - 15 + 127) as u32;
        f32::from_bits((sign << 16) | (exp32 << 23) | (mantissa << 13))
    }
}

fn round_trip_f16(x: f32) -> f32 {
    f16_bits_to_f32(f32_to_f16_bits(x))
}

async fn execute_embed(
    ctx: &ExecContext<'_>,
    cfg: &crate::schema::EmbedGenConfig,
    row: &Row,
    output_column: &str,
) -> CoreResult<CellOutcome> {
    let source = row.get(&cfg.source_column).cloned().unwrap_or(Value::Null);
    let text = match &source {
        Value::Null => ".".to_string(),
        Value::String(s) if s.is_empty() => ".".to_string(),
        other => stringify(other),
    };
    let mut resp = ctx.router.embed(&cfg.embedding_model, &[text]).await?;
    let mut vector = resp.pop().map(|r| r.vector).unwrap_or_default();

    // Pad/truncate to the column's configured length and apply its element
    // precision (§4.2 "unit-norm f32/f16 vector of configured length")
    // before normalizing, so the stored vector's norm reflects exactly what
    // gets written back.
    if let Some(ColumnDtype::Vector { elem, len }) = ctx.col_map.get(output_column).map(|c| &c.dtype) {
        vector.resize(*len, 0.0);
        if *elem == crate::schema::VectorElem::F16 {
            for v in vector.iter_mut() {
                *v = round_trip_f16(*v);
            }
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    let value = serde_json::to_value(&vector).unwrap_or(Value::Null);
    Ok(CellOutcome { value, state: None, errored: false })
}

/// Builds the byte-keyed row snapshot the code executor capability expects:
/// image/audio cells are read into bytes, documents remain URIs (§4.2
/// "Code").
async fn build_code_snapshot(
    ctx: &ExecContext<'_>,
    row: &Row,
) -> CoreResult<BTreeMap<String, Value>> {
    let mut snapshot = BTreeMap::new();
    for (id, value) in &row.cells {
        let dtype = ctx.col_map.get(id).map(|c| &c.dtype);
        match dtype {
            Some(ColumnDtype::Image) | Some(ColumnDtype::Audio) => {
                let uri = stringify(value);
                if uri.is_empty() {
                    snapshot.insert(id.clone(), Value::Null);
                } else {
                    let bytes = ctx.files.open_uri(&uri).await?;
                    let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    snapshot.insert(id.clone(), Value::String(b64));
                }
            }
            _ => {
                snapshot.insert(id.clone(), value.clone());
            }
        }
    }
    Ok(snapshot)
}

async fn execute_code(
    ctx: &ExecContext<'_>,
    cfg: &crate::schema::CodeGenConfig,
    row: &Row,
    output_column: &str,
) -> CoreResult<CellOutcome> {
    let source_code = stringify(&row.get(&cfg.source_column).cloned().unwrap_or(Value::Null));
    let snapshot = build_code_snapshot(ctx, row).await?;
    let value = ctx.code.run(&source_code, &snapshot, output_column).await?;
    Ok(CellOutcome { value, state: None, errored: false })
}

async fn execute_python_fixed(
    ctx: &ExecContext<'_>,
    cfg: &crate::schema::PythonFixedGenConfig,
    row: &Row,
    output_column: &str,
) -> CoreResult<CellOutcome> {
    let snapshot = build_code_snapshot(ctx, row).await?;
    let value = ctx.code.run(&cfg.code, &snapshot, output_column).await?;
    Ok(CellOutcome { value, state: None, errored: false })
}

/// Converts a raw delta + row/column framing into the wire `CellCompletionChunk`.
pub fn delta_to_wire(
    row_id: &str,
    output_column_name: &str,
    model: &str,
    created: i64,
    delta: &ChatDelta,
) -> CellCompletionChunk {
    CellCompletionChunk {
        row_id: row_id.to_string(),
        output_column_name: output_column_name.to_string(),
        id: format!("{row_id}-{output_column_name}"),
        created,
        model: model.to_string(),
        usage: delta.usage.clone().map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
        choices: vec![Choice {
            index: 0,
            delta: ChoiceDelta {
                content: delta.content.clone(),
                reasoning_content: delta.reasoning_content.clone(),
            },
            finish_reason: delta.finish_reason.clone(),
        }],
        finish_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_upstream_error_reports_offenders() {
        let mut errored = BTreeSet::new();
        errored.insert("a".to_string());
        let err = check_upstream_error(&["a".to_string(), "b".to_string()], &errored);
        assert!(err.is_err());
    }

    #[test]
    fn f16_round_trip_is_close_but_lossy() {
        let x = 0.123_456_78_f32;
        let rounded = round_trip_f16(x);
        assert!((rounded - x).abs() < 1e-3);
        assert_ne!(rounded.to_bits(), x.to_bits(), "f16 round-trip should actually lose precision");
        assert_eq!(round_trip_f16(0.0), 0.0);
    }

    #[tokio::test]
    async fn execute_embed_pads_to_configured_length_and_stays_unit_norm() {
        struct OnesRouter;
        #[async_trait::async_trait]
        impl LmRouter for OnesRouter {
            async fn chat(&self, _m: &str, _msgs: &[ChatMessage]) -> CoreResult<crate::capabilities::ChatResponse> {
                unimplemented!()
            }
            async fn chat_stream(
                &self,
                _m: &str,
                _msgs: &[ChatMessage],
                _on_delta: &mut (dyn FnMut(ChatDelta) -> BoxFuture + Send),
            ) -> CoreResult<crate::capabilities::ChatResponse> {
                unimplemented!()
            }
            async fn embed(
                &self,
                _model: &str,
                texts: &[String],
            ) -> CoreResult<Vec<crate::capabilities::EmbeddingResponse>> {
                Ok(texts.iter().map(|_| crate::capabilities::EmbeddingResponse { vector: vec![1.0, 1.0] }).collect())
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

        struct NoopFiles2;
        #[async_trait::async_trait]
        impl FileLoader for NoopFiles2 {
            async fn load_document(&self, _name: &str, _bytes: &[u8]) -> CoreResult<String> {
                Ok(String::new())
            }
            async fn open_uri(&self, _uri: &str) -> CoreResult<Vec<u8>> {
                Ok(Vec::new())
            }
        }
        struct NoopSearch2;
        #[async_trait::async_trait]
        impl KnowledgeSearch for NoopSearch2 {
            async fn knowledge_table_exists(&self, _t: &str) -> CoreResult<bool> {
                Ok(true)
            }
            async fn hybrid_search(
                &self,
                _t: &str,
                _f: &str,
                _v: &str,
                _limit: usize,
            ) -> CoreResult<Vec<crate::capabilities::KnowledgeRow>> {
                Ok(vec![])
            }
        }
        struct NoopCode2;
        #[async_trait::async_trait]
        impl CodeExecutor for NoopCode2 {
            async fn run(&self, _s: &str, _r: &BTreeMap<String, Value>, _o: &str) -> CoreResult<Value> {
                Ok(Value::Null)
            }
        }
        struct NoopPersistence2;
        #[async_trait::async_trait]
        impl Persistence for NoopPersistence2 {
            async fn add_rows(&self, _t: &str, _rows: &[Row]) -> CoreResult<()> {
                Ok(())
            }
            async fn update_rows(&self, _t: &str, _rows: &BTreeMap<String, Row>) -> CoreResult<()> {
                Ok(())
            }
            async fn get_row(&self, _t: &str, _id: &str) -> CoreResult<Row> {
                Err(CoreError::ResourceNotFound("n/a".into()))
            }
            async fn get_conversation_thread(&self, _t: &str, _c: &str, _r: &str) -> CoreResult<Vec<ChatMessage>> {
                Ok(vec![])
            }
        }

        let mut col_map = BTreeMap::new();
        col_map.insert(
            "src".to_string(),
            ColumnMeta { id: "src".into(), dtype: ColumnDtype::Str, column_order: 0, gen_config: None },
        );
        col_map.insert(
            "vec".to_string(),
            ColumnMeta {
                id: "vec".into(),
                dtype: ColumnDtype::Vector { elem: crate::schema::VectorElem::F16, len: 4 },
                column_order: 1,
                gen_config: None,
            },
        );

        let ctx = ExecContext {
            router: &OnesRouter,
            search: &NoopSearch2,
            files: &NoopFiles2,
            code: &NoopCode2,
            persistence: &NoopPersistence2,
            project_id: "p",
            table_id: "t",
            col_map: &col_map,
            now_rfc3339: "2026-01-01T00:00:00Z",
        };

        let mut row = Row::default();
        row.set("src", Value::String("hello".into()));
        let cfg = crate::schema::EmbedGenConfig { embedding_model: "m".into(), source_column: "src".into() };

        let outcome = execute_embed(&ctx, &cfg, &row, "vec").await.unwrap();
        let vector: Vec<f32> = serde_json::from_value(outcome.value).unwrap();
        assert_eq!(vector.len(), 4, "vector should be padded to the column's configured length");
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "padded/rounded vector should still be unit-norm");
    }

    #[tokio::test]
    async fn substitute_preserves_escaped_refs_and_defaults_to_period() {
        use crate::schema::ColumnDtype;

        struct NoopFiles;
        #[async_trait::async_trait]
        impl FileLoader for NoopFiles {
            async fn load_document(&self, _name: &str, _bytes: &[u8]) -> CoreResult<String> {
                Ok(String::new())
            }
            async fn open_uri(&self, _uri: &str) -> CoreResult<Vec<u8>> {
                Ok(Vec::new())
            }
        }

        let mut col_map = BTreeMap::new();
        col_map.insert(
            "input".to_string(),
            ColumnMeta { id: "input".into(), dtype: ColumnDtype::Str, column_order: 0, gen_config: None },
        );
        let mut row = Row::default();
        row.set("input", Value::String("hi".into()));

        let (text, parts) = substitute(r"S:${input} \${literal}", &row, &col_map, &NoopFiles).await.unwrap();
        assert_eq!(text, "S:hi ${literal}");
        assert!(parts.is_empty());

        let (empty, _) = substitute("", &row, &col_map, &NoopFiles).await.unwrap();
        assert_eq!(empty, ".");
    }
}
