//! History curation and consolidation
//!
//! The comprehensive history records everything; the curated view is what
//! gets resent to the model. Both helpers here are pure functions over turn
//! slices so the engine can apply them under its own lock.

use std::collections::HashSet;

use serde_json::Value;

use crate::core::{Content, Part, Role, ToolDefinition};

/// Derive the curated view of a comprehensive history.
///
/// Every user turn is kept. A run of consecutive model turns is kept only if
/// each turn in it is valid, and is merged into one turn. Leading model turns
/// are dropped and adjacent user turns are merged, so the result starts with
/// a user turn and alternates strictly.
pub fn extract_curated_history(history: &[Content]) -> Vec<Content> {
    let mut curated: Vec<Content> = Vec::with_capacity(history.len());
    let mut i = 0;

    while i < history.len() {
        if history[i].role == Role::User {
            match curated.last_mut() {
                Some(last) if last.role == Role::User => {
                    last.parts.extend(history[i].parts.iter().cloned())
                }
                _ => curated.push(history[i].clone()),
            }
            i += 1;
            continue;
        }

        let run_start = i;
        let mut run_valid = true;
        while i < history.len() && history[i].role == Role::Model {
            run_valid &= history[i].is_valid();
            i += 1;
        }

        // a model run with nothing before it has no request to answer
        if !run_valid || curated.is_empty() {
            continue;
        }

        let parts = history[run_start..i]
            .iter()
            .flat_map(|turn| turn.parts.iter().cloned())
            .collect();
        curated.push(Content::new(Role::Model, parts));
    }

    curated
}

/// Drop thoughts and merge adjacent text parts within one turn
fn consolidate_parts(parts: Vec<Part>) -> Vec<Part> {
    let mut merged: Vec<Part> = Vec::with_capacity(parts.len());
    for part in parts {
        match (merged.last_mut(), part) {
            (_, Part::Thought(_)) => {}
            (Some(Part::Text(previous)), Part::Text(text)) => previous.push_str(&text),
            (_, part) => merged.push(part),
        }
    }
    merged
}

/// Model turn that is nothing but text
fn is_pure_text(content: &Content) -> bool {
    content.role == Role::Model
        && !content.parts.is_empty()
        && content.parts.iter().all(|part| matches!(part, Part::Text(_)))
}

fn append_text(target: &mut Content, source: Content) {
    for part in source.parts {
        match (target.parts.last_mut(), part) {
            (Some(Part::Text(previous)), Part::Text(text)) => previous.push_str(&text),
            (_, part) => target.parts.push(part),
        }
    }
}

/// Append one finished exchange to the comprehensive history.
///
/// `curated_len` is the length of the curated history the request was built
/// from; a backend-supplied function calling trace is sliced past that point
/// and spliced in place of `user_input`.
///
/// Adjacent text turns are merged within the exchange only; the recorded
/// output never joins a turn from an earlier exchange.
pub fn record_history(
    history: &mut Vec<Content>,
    user_input: Content,
    model_output: Vec<Content>,
    afc_history: Option<Vec<Content>>,
    curated_len: usize,
) {
    let user_is_function_response = user_input.is_function_response();

    let spliced = afc_history
        .filter(|afc| !afc.is_empty())
        .map(|afc| extract_curated_history(&afc[curated_len.min(afc.len())..]))
        .filter(|entries| !entries.is_empty());

    let mut outputs: Vec<Content> = Vec::new();
    for content in model_output {
        let content = Content::new(content.role, consolidate_parts(content.parts));
        if content.parts.is_empty() {
            continue;
        }
        match outputs.last_mut() {
            Some(last) if is_pure_text(last) && is_pure_text(&content) => append_text(last, content),
            _ => outputs.push(content),
        }
    }

    match spliced {
        Some(entries) => history.extend(entries),
        None => history.push(user_input),
    }

    if outputs.is_empty() {
        if !user_is_function_response {
            history.push(Content::new(Role::Model, Vec::new()));
        }
        return;
    }

    history.extend(outputs);
}

/// Whether a JSON schema reaches itself through local `$ref` pointers
pub fn has_cycle_in_schema(schema: &Value) -> bool {
    fn traverse(node: &Value, root: &Value, path: &mut HashSet<String>) -> bool {
        match node {
            Value::Object(map) => {
                if let Some(Value::String(reference)) = map.get("$ref") {
                    if path.contains(reference) {
                        return true;
                    }
                    if let Some(target) = reference.strip_prefix('#').and_then(|p| root.pointer(p)) {
                        path.insert(reference.clone());
                        let cyclic = traverse(target, root, path);
                        path.remove(reference);
                        if cyclic {
                            return true;
                        }
                    }
                }
                map.iter()
                    .filter(|(key, _)| key.as_str() != "$ref")
                    .any(|(_, value)| traverse(value, root, path))
            }
            Value::Array(items) => items.iter().any(|item| traverse(item, root, path)),
            _ => false,
        }
    }

    traverse(schema, schema, &mut HashSet::new())
}

/// Names of the tools whose parameter schemas are cyclic
pub fn cyclic_schema_tools(tools: &[ToolDefinition]) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| has_cycle_in_schema(&tool.function.parameters))
        .map(|tool| tool.name().to_string())
        .collect()
}
