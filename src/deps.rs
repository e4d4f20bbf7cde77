//! Dependency Analyzer (C1, spec §4.1).
//!
//! Parses each output column's generation config, extracts its upstream
//! column references, and builds the per-table dependency DAG plus a
//! Kahn-style topological level partition.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use regex::Regex;
use std::sync::OnceLock;

use crate::schema::{ColumnMeta, GenConfig};

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Matches `${col}` not preceded by a backslash; the backslash-escape is
    // handled by the caller scanning for `\$` directly, see `extract_vars`.
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").unwrap())
}

/// Extracts `${col}` references from `text`, skipping any occurrence whose
/// `$` is immediately preceded by a backslash (spec §4.1 extraction rules,
/// §4.2.2 substitution rules).
pub fn extract_vars(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for m in var_pattern().find_iter(text) {
        let escaped = m.start() > 0 && text.as_bytes()[m.start() - 1] == b'\\';
        if escaped {
            continue;
        }
        let inner = &text[m.start() + 2..m.end() - 1];
        out.push(inner.to_string());
    }
    out
}

/// Dependencies of every output column in `columns`, restricted to columns
/// actually present in the table (unresolved references are dropped here —
/// §4.1 "Failure").
pub fn dependencies(columns: &[ColumnMeta]) -> HashMap<String, BTreeSet<String>> {
    let present: HashSet<&str> = columns.iter().map(|c| c.id.as_str()).collect();
    let mut out = HashMap::new();
    for col in columns {
        let Some(cfg) = &col.gen_config else { continue };
        let raw: Vec<String> = match cfg {
            GenConfig::Llm(c) => {
                let mut v = extract_vars(&c.system_prompt);
                v.extend(extract_vars(&c.user_prompt));
                v
            }
            GenConfig::Embed(c) => vec![c.source_column.clone()],
            GenConfig::Code(c) => vec![c.source_column.clone()],
            GenConfig::PythonFixed(_) => columns
                .iter()
                .filter(|other| {
                    other.column_order < col.column_order
                        && !other.is_info()
                        && !other.is_state()
                        && !other.is_vector()
                })
                .map(|other| other.id.clone())
                .collect(),
        };
        let deps: BTreeSet<String> = raw.into_iter().filter(|d| present.contains(d.as_str())).collect();
        out.insert(col.id.clone(), deps);
    }
    out
}

/// Topological level partition (Kahn BFS): all columns in level `k` depend
/// only on columns in levels `< k`.
pub fn build_levels(columns: &[ColumnMeta]) -> Vec<Vec<String>> {
    let deps = dependencies(columns);
    let output_ids: Vec<&str> = columns
        .iter()
        .filter(|c| c.is_output())
        .map(|c| c.id.as_str())
        .collect();

    let mut indegree: HashMap<&str, usize> = HashMap::new();
    // Only edges between two output columns gate readiness for level
    // assignment; dependencies on plain input columns are always already
    // satisfied and don't block level 0.
    let output_set: HashSet<&str> = output_ids.iter().copied().collect();
    for id in &output_ids {
        let count = deps
            .get(*id)
            .map(|set| set.iter().filter(|d| output_set.contains(d.as_str())).count())
            .unwrap_or(0);
        indegree.insert(id, count);
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut remaining: HashSet<&str> = output_ids.iter().copied().collect();
    // Bounded loop count equal to the number of output columns (§9 defensive
    // note); the graph is acyclic by construction so this never triggers.
    for _ in 0..=output_ids.len() {
        if remaining.is_empty() {
            break;
        }
        let mut frontier: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| indegree.get(id).copied().unwrap_or(0) == 0)
            .collect();
        if frontier.is_empty() {
            // Defensive: would indicate a cycle, which schema validation
            // upstream is responsible for preventing (§4.1).
            break;
        }
        frontier.sort();
        for id in &frontier {
            remaining.remove(id);
        }
        for id in &output_ids {
            if !remaining.contains(id) {
                continue;
            }
            let downstream_dep_on_frontier = deps
                .get(*id)
                .map(|set| frontier.iter().any(|f| set.contains(*f)))
                .unwrap_or(false);
            if downstream_dep_on_frontier {
                if let Some(d) = indegree.get_mut(id) {
                    *d = d.saturating_sub(
                        deps.get(*id)
                            .map(|set| frontier.iter().filter(|f| set.contains(**f)).count())
                            .unwrap_or(0),
                    );
                }
            }
        }
        levels.push(frontier.into_iter().map(|s| s.to_string()).collect());
    }

    levels
}

/// Maximum level cardinality; used to size column concurrency (§4.1, §4.4).
pub fn max_width(columns: &[ColumnMeta]) -> usize {
    build_levels(columns)
        .iter()
        .map(|l| l.len())
        .max()
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDtype;

    fn input_col(id: &str, order: u32) -> ColumnMeta {
        ColumnMeta {
            id: id.to_string(),
            dtype: ColumnDtype::Str,
            column_order: order,
            gen_config: None,
        }
    }

    fn llm_col(id: &str, order: u32, prompt: &str) -> ColumnMeta {
        ColumnMeta {
            id: id.to_string(),
            dtype: ColumnDtype::Str,
            column_order: order,
            gen_config: Some(GenConfig::Llm(crate::schema::LlmGenConfig {
                model: "m".into(),
                system_prompt: String::new(),
                user_prompt: prompt.to_string(),
                hyperparameters: Default::default(),
                multi_turn: false,
                rag_params: None,
                tools: None,
                reasoning_effort: None,
            })),
        }
    }

    #[test]
    fn extracts_vars_and_respects_escape() {
        let vars = extract_vars(r"S:${a} and \${b} and ${c}");
        assert_eq!(vars, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn diamond_levels_are_topological() {
        let cols = vec![
            input_col("x", 0),
            llm_col("a", 1, "A:${x}"),
            llm_col("b", 2, "B:${x}"),
            llm_col("c", 3, "C:${a}|${b}"),
        ];
        let levels = build_levels(&cols);
        let total: usize = levels.iter().map(|l| l.len()).sum();
        assert_eq!(total, 3);
        assert_eq!(levels[0].iter().collect::<BTreeSet<_>>(), BTreeSet::from([&"a".to_string(), &"b".to_string()]));
        assert_eq!(levels[1], vec!["c".to_string()]);
        assert_eq!(max_width(&cols), 2);
    }

    #[test]
    fn missing_reference_is_ignored() {
        let cols = vec![llm_col("a", 0, "${nonexistent}")];
        let deps = dependencies(&cols);
        assert!(deps["a"].is_empty());
    }
}
