//! RAG Prompt Assembler (C5, spec §4.5).
//!
//! For chat cells configured with retrieval: rewrites the user turn into
//! FTS and vector queries, runs hybrid search against a knowledge table,
//! optionally reranks, and splices a grounded `<up-to-date-context>` block
//! into the prompt in place of the original user message.

use crate::capabilities::{
    ChatMessage, ChatRequest, ChatRole, ContentPart, KnowledgeSearch, LmRouter,
};
use crate::error::{CoreError, CoreResult};
use crate::events::{CellReferences, Chunk};
use crate::schema::RagParams;

pub struct References {
    pub chunks: Vec<Chunk>,
    pub search_query: String,
}

/// Model used for the two query-rewrite calls. The spec leaves this
/// unspecified; a fixed lightweight model keeps rewriting cheap relative to
/// the main chat call.
const REWRITE_MODEL: &str = "query-rewrite-default";

fn rewrite_fts_prompt(current_time_rfc3339: &str, last_user_text: &str) -> String {
    format!(
        "Rewrite the user's message into a full-text search query. Preserve named \
         entities exactly. Quote multi-word phrases. Resolve relative dates against \
         the current timestamp {current_time_rfc3339}. Return only the query.\n\nMessage: {last_user_text}"
    )
}

fn rewrite_vs_prompt(current_time_rfc3339: &str, last_user_text: &str) -> String {
    format!(
        "Rewrite the user's message as a single natural-language paraphrase suitable \
         for semantic search. Preserve named entities. Resolve relative dates against \
         the current timestamp {current_time_rfc3339}.\n\nMessage: {last_user_text}"
    )
}

fn citation_instruction(ids: &[String]) -> String {
    let example = ids
        .iter()
        .map(|id| format!("@{id}"))
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "\n\nWhen you use information from the context above, cite it inline using \
         the format [{example}], referencing the chunk id(s) you drew from."
    )
}

fn render_context_block(chunks: &[Chunk]) -> String {
    let mut out = String::from("<up-to-date-context>\n");
    for (id, c) in chunks.iter().enumerate() {
        out.push_str(&format!(
            "[{id}] title={} page={} \n{}\n\n",
            c.title.clone().unwrap_or_default(),
            c.page.map(|p| p.to_string()).unwrap_or_default(),
            c.text
        ));
    }
    out.push_str("</up-to-date-context>");
    out
}

/// Assembles a grounded prompt for a RAG-enabled chat cell.
///
/// `now_rfc3339` is threaded in by the caller (C2) rather than read from the
/// system clock here, so this function stays deterministic and testable.
pub async fn assemble(
    router: &dyn LmRouter,
    search: &dyn KnowledgeSearch,
    project_id: &str,
    table_id_for_metadata: &str,
    params: &RagParams,
    mut request: ChatRequest,
    now_rfc3339: &str,
) -> CoreResult<(ChatRequest, References)> {
    if !search.knowledge_table_exists(&params.knowledge_table_id).await? {
        return Err(CoreError::ResourceNotFound(format!(
            "knowledge table `{}`",
            params.knowledge_table_id
        )));
    }

    let last_user_text = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.text_content())
        .unwrap_or_default();

    let (fts_query, vs_query) = match (&params.fts_query, &params.vs_query) {
        (Some(f), Some(v)) if !f.is_empty() && !v.is_empty() => (f.clone(), v.clone()),
        _ => {
            let fts_prompt = rewrite_fts_prompt(now_rfc3339, &last_user_text);
            let vs_prompt = rewrite_vs_prompt(now_rfc3339, &last_user_text);
            let (fts_res, vs_res) = tokio::join!(
                router.chat(REWRITE_MODEL, &[ChatMessage::text(ChatRole::User, fts_prompt)]),
                router.chat(REWRITE_MODEL, &[ChatMessage::text(ChatRole::User, vs_prompt)]),
            );
            let fts = fts_res.map(|r| r.content).unwrap_or_else(|_| last_user_text.clone());
            let vs = vs_res.map(|r| r.content).unwrap_or_else(|_| last_user_text.clone());
            (
                params.fts_query.clone().filter(|s| !s.is_empty()).unwrap_or(fts),
                params.vs_query.clone().filter(|s| !s.is_empty()).unwrap_or(vs),
            )
        }
    };

    let rows = search
        .hybrid_search(&params.knowledge_table_id, &fts_query, &vs_query, params.k)
        .await?;

    let mut chunks: Vec<Chunk> = rows
        .into_iter()
        .map(|r| {
            let mut metadata = r.metadata;
            metadata.insert("project_id".to_string(), serde_json::Value::String(project_id.to_string()));
            metadata.insert("table_id".to_string(), serde_json::Value::String(table_id_for_metadata.to_string()));
            Chunk {
                text: r.text,
                title: r.title,
                page: r.page,
                document_id: r.document_id,
                chunk_id: r.chunk_id,
                context: r.context,
                metadata,
            }
        })
        .collect();

    if let Some(rerank_model) = &params.reranking_model {
        let docs: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        if let Ok(ordered) = router.rerank(rerank_model, &last_user_text, &docs).await {
            let mut reordered: Vec<Chunk> = Vec::with_capacity(ordered.len());
            for entry in ordered {
                if let Some(c) = chunks.get(entry.index) {
                    reordered.push(c.clone());
                }
            }
            chunks = reordered;
        }
        // On rerank failure: keep the fused order (§4.5 step 5).
    }
    chunks.truncate(params.k);

    // Choose replacement index: last USER message, or the message before a
    // trailing non-user message, else fail (§4.5 step 6).
    let len = request.messages.len();
    let replace_idx = if len >= 1 && request.messages[len - 1].role == ChatRole::User {
        Some(len - 1)
    } else if len >= 2 && request.messages[len - 2].role == ChatRole::User {
        Some(len - 2)
    } else {
        None
    };
    let replace_idx = replace_idx.ok_or_else(|| {
        CoreError::BadInput("RAG requires a user message to ground (last, or second-to-last)".into())
    })?;

    let context_block = render_context_block(&chunks);
    let original = &request.messages[replace_idx];
    let original_text = original.text_content();
    let non_text_parts: Vec<ContentPart> = original
        .parts
        .iter()
        .filter(|p| !matches!(p, ContentPart::Text(_)))
        .cloned()
        .collect();

    let mut new_text = format!("{context_block}\n\n{original_text}");
    if params.inline_citations {
        let ids: Vec<String> = (0..chunks.len()).map(|i| i.to_string()).collect();
        new_text.push_str(&citation_instruction(&ids));
    }

    let mut new_parts = vec![ContentPart::Text(new_text)];
    new_parts.extend(non_text_parts);
    request.messages[replace_idx] = ChatMessage {
        role: ChatRole::User,
        parts: new_parts,
    };

    Ok((
        request,
        References {
            chunks,
            search_query: vs_query,
        },
    ))
}

pub fn to_wire(row_id: &str, output_column_name: &str, refs: &References) -> CellReferences {
    CellReferences {
        row_id: row_id.to_string(),
        output_column_name: output_column_name.to_string(),
        search_query: refs.search_query.clone(),
        chunks: refs.chunks.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_instruction_mentions_ids() {
        let msg = citation_instruction(&["0".into(), "1".into()]);
        assert!(msg.contains("@0"));
        assert!(msg.contains("@1"));
    }
}
