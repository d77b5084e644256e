//! Command templates.
//!
//! Two passes run over a task's command. [`render`] fills `{key}` keyword
//! slots from a typed substitution map when the task is materialized;
//! [`resolve_outputs`] swaps `$OUT.<name>` markers for concrete output paths
//! right before submission. Literal braces are written `{{` and `}}`.

use crate::errors::TemplateError;
use std::collections::{BTreeMap, BTreeSet};

const OUT_MARKER: &str = "$OUT.";

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn is_output_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-')
}

/// Byte spans `(start, end, name)` of every `$OUT.<name>` marker.
fn scan_output_markers(command: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(idx) = command[offset..].find(OUT_MARKER) {
        let start = offset + idx;
        let name_start = start + OUT_MARKER.len();
        let name_len = command[name_start..]
            .find(|c: char| !is_output_name_char(c))
            .unwrap_or(command.len() - name_start);
        if name_len > 0 {
            let end = name_start + name_len;
            found.push((start, end, &command[name_start..end]));
            offset = end;
        } else {
            offset = name_start;
        }
    }
    found
}

/// Substitutes every `{key}` slot. All missing keys are reported at once.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut missing = BTreeSet::new();
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut key = String::new();
                let mut closed = false;
                for (_, k) in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    if !is_key_char(k) {
                        break;
                    }
                    key.push(k);
                }
                if !closed || key.is_empty() {
                    return Err(TemplateError::UnbalancedBrace {
                        template: template.to_string(),
                        position: pos,
                    });
                }
                match vars.get(&key) {
                    Some(value) => out.push_str(value),
                    None => {
                        missing.insert(key);
                    }
                }
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(TemplateError::UnbalancedBrace {
                        template: template.to_string(),
                        position: pos,
                    });
                }
            }
            other => out.push(other),
        }
    }

    if !missing.is_empty() {
        return Err(TemplateError::MissingKeys {
            template: template.to_string(),
            missing: missing.into_iter().collect(),
            available: vars.clone(),
        });
    }
    Ok(out)
}

/// Names referenced by `$OUT.<name>` markers, in order of first use.
pub fn output_markers(command: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    scan_output_markers(command)
        .into_iter()
        .map(|(_, _, name)| name.to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Replaces `$OUT.<name>` markers with output paths keyed by name.
pub fn resolve_outputs(
    command: &str,
    outputs: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let markers = scan_output_markers(command);
    let mut missing: Vec<String> = Vec::new();
    let mut resolved = String::with_capacity(command.len());
    let mut last = 0;
    for (start, end, name) in markers {
        resolved.push_str(&command[last..start]);
        match outputs.get(name) {
            Some(path) => resolved.push_str(path),
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
            }
        }
        last = end;
    }
    resolved.push_str(&command[last..]);

    if !missing.is_empty() {
        return Err(TemplateError::MissingOutputs {
            template: command.to_string(),
            missing,
            available: outputs.clone(),
        });
    }
    Ok(resolved)
}
