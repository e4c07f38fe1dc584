use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::constants::{MAX_RESOLVE_ROUNDS, PATH_SEPARATOR};
use crate::error::{ApiTestError, Result};
use crate::functions::FunctionRegistry;
use crate::variables::VariableStore;

const FUNCTION_MACRO_PATTERN: &str = r#"\$\{([A-Za-z_]\w*)\(([\w\s,.\-:/+@%'"]*)\)\}"#;
const BRACED_VARIABLE_PATTERN: &str = r"\$\{(\w+)\}";
const BARE_VARIABLE_PATTERN: &str = r"\$([A-Za-z_]\w*)";
const BRACED_RELATION_PATTERN: &str = r"\^\{(\w+)\}";
const BARE_RELATION_PATTERN: &str = r"\^([A-Za-z_]\w*)";

/// A step in a document path, rendered as `request:headers` or `setup[1]`
#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(usize),
}

fn render_path(location: &str, path: &[Segment]) -> String {
    let mut rendered = location.to_string();
    for segment in path {
        match segment {
            Segment::Key(key) => {
                rendered.push_str(PATH_SEPARATOR);
                rendered.push_str(key);
            }
            Segment::Index(index) => rendered.push_str(&format!("[{index}]")),
        }
    }
    rendered
}

/// Visit every string leaf of a document tree. Object keys are never rewritten.
/// With `skip_hooks`, the payloads of `setup[*].hook` / `teardown[*].hook` are left alone.
fn visit_strings<F>(value: &mut Value, path: &mut Vec<Segment>, skip_hooks: bool, visit: &mut F) -> Result<()>
where
    F: FnMut(&mut String, &[Segment]) -> Result<()>,
{
    match value {
        Value::String(text) => visit(text, path),
        Value::Array(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                path.push(Segment::Index(index));
                visit_strings(item, path, skip_hooks, visit)?;
                path.pop();
            }
            Ok(())
        }
        Value::Object(fields) => {
            let in_action = is_action(path);
            for (key, item) in fields.iter_mut() {
                if skip_hooks && in_action && key == "hook" {
                    continue;
                }
                path.push(Segment::Key(key.clone()));
                visit_strings(item, path, skip_hooks, visit)?;
                path.pop();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn is_action(path: &[Segment]) -> bool {
    matches!(path, [.., Segment::Key(parent), Segment::Index(_)] if parent == "setup" || parent == "teardown")
}

/// Resolve function macros and substitution variables over a whole document.
/// Relation variables are left for `replace_relations`, which runs once setup has populated them.
pub fn replace_placeholders(
    document: &mut Value,
    registry: &FunctionRegistry,
    store: &VariableStore,
    location: &str,
) -> Result<()> {
    replace_functions(document, registry, location)?;
    replace_variables(document, store, location)?;
    Ok(())
}

/// Replace every `${name(args)}` outside hook payloads with the registry's result
pub fn replace_functions(document: &mut Value, registry: &FunctionRegistry, location: &str) -> Result<()> {
    let pattern = Regex::new(FUNCTION_MACRO_PATTERN)?;
    visit_strings(document, &mut Vec::new(), true, &mut |text, path| {
        if let Some(replaced) = expand_functions(text, &pattern, registry, &render_path(location, path))? {
            *text = replaced;
        }
        Ok(())
    })
}

/// Evaluate the function macros of a hook payload, at the point the hook runs
pub fn evaluate_hook(hook: &str, registry: &FunctionRegistry, location: &str) -> Result<String> {
    let pattern = Regex::new(FUNCTION_MACRO_PATTERN)?;
    if !pattern.is_match(hook) {
        return Err(ApiTestError::RequestDataParse(format!(
            "{location}: hook '{hook}' must call a registered function as ${{name(args)}}"
        )));
    }
    Ok(expand_functions(hook, &pattern, registry, location)?.unwrap_or_else(|| hook.to_string()))
}

fn expand_functions(
    text: &str,
    pattern: &Regex,
    registry: &FunctionRegistry,
    location: &str,
) -> Result<Option<String>> {
    if !pattern.is_match(text) {
        return Ok(None);
    }

    let mut result = text.to_string();
    let mut rounds = 0;

    // each round replaces every macro once, only text inserted by a previous round is scanned again
    while pattern.is_match(&result) {
        rounds += 1;
        if rounds > MAX_RESOLVE_ROUNDS {
            return Err(ApiTestError::Function(format!(
                "{location}: function macros kept expanding after {MAX_RESOLVE_ROUNDS} rounds in '{text}'"
            )));
        }

        let mut expanded = String::with_capacity(result.len());
        let mut last = 0;
        for capture in pattern.captures_iter(&result) {
            let Some(full_match) = capture.get(0) else { continue };
            let name = &capture[1];
            let macro_text = full_match.as_str();

            if !registry.contains(name) {
                return Err(ApiTestError::Function(format!(
                    "{location}: cannot resolve macro '{macro_text}': function '{name}' is not registered"
                )));
            }

            let value = registry.call(name, &split_arguments(&capture[2])).map_err(|e| {
                let reason = match e {
                    ApiTestError::Function(message) => message,
                    other => other.to_string(),
                };
                ApiTestError::Function(format!("{location}: macro '{macro_text}' failed: {reason}"))
            })?;

            log::debug!("{location}: {macro_text} -> {value}");
            expanded.push_str(&result[last..full_match.start()]);
            expanded.push_str(&value);
            last = full_match.end();
        }
        expanded.push_str(&result[last..]);
        result = expanded;
    }

    Ok(Some(result))
}

/// Split a macro argument list on commas, trimming blanks and one pair of outer quotes
fn split_arguments(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .map(|arg| {
            let arg = arg.trim();
            arg.strip_prefix('\'')
                .and_then(|a| a.strip_suffix('\''))
                .or_else(|| arg.strip_prefix('"').and_then(|a| a.strip_suffix('"')))
                .unwrap_or(arg)
                .to_string()
        })
        .collect()
}

/// Replace `${name}` and free-standing `$name` with values from the variable store
pub fn replace_variables(document: &mut Value, store: &VariableStore, location: &str) -> Result<()> {
    let braced = Regex::new(BRACED_VARIABLE_PATTERN)?;
    let bare = Regex::new(BARE_VARIABLE_PATTERN)?;

    visit_strings(document, &mut Vec::new(), false, &mut |text, path| {
        let mut rounds = 0;
        while next_placeholder(text, 0, &braced, &bare, true).is_some() {
            rounds += 1;
            if rounds > MAX_RESOLVE_ROUNDS {
                return Err(ApiTestError::Variable(format!(
                    "{}: variables kept expanding after {MAX_RESOLVE_ROUNDS} rounds",
                    render_path(location, path)
                )));
            }
            *text = substitute(text, &braced, &bare, true, &mut |name| {
                store.get(name, None).map_err(|e| {
                    ApiTestError::Variable(format!("{}: {}", render_path(location, path), inner_message(e)))
                })
            })?;
        }
        Ok(())
    })
}

/// Replace `^{name}` and `^name` with relation entries, consuming each entry afterwards.
/// A bare relation ends at the end of its name and may sit inside other text, as in `/users/^uid`.
pub fn replace_relations(document: &mut Value, store: &mut VariableStore, location: &str) -> Result<()> {
    let braced = Regex::new(BRACED_RELATION_PATTERN)?;
    let bare = Regex::new(BARE_RELATION_PATTERN)?;
    let mut consumed: BTreeMap<String, String> = BTreeMap::new();

    {
        let store: &VariableStore = store;
        visit_strings(document, &mut Vec::new(), false, &mut |text, path| {
            if next_placeholder(text, 0, &braced, &bare, false).is_none() {
                return Ok(());
            }
            // single pass, relation values are substituted verbatim
            *text = substitute(text, &braced, &bare, false, &mut |name| {
                if let Some(value) = consumed.get(name) {
                    return Ok(value.clone());
                }
                let value = store.get_relation(name).map_err(|e| {
                    ApiTestError::Variable(format!("{}: {}", render_path(location, path), inner_message(e)))
                })?;
                consumed.insert(name.to_string(), value.clone());
                Ok(value)
            })?;
            Ok(())
        })?;
    }

    for name in consumed.keys() {
        log::debug!("{location}: consumed relation variable ^{name}");
        store.delete_relation(name);
    }
    Ok(())
}

/// One left-to-right pass replacing every placeholder of `text`. Inserted values are not rescanned.
fn substitute<F>(text: &str, braced: &Regex, bare: &Regex, standalone: bool, resolve: &mut F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    while let Some((range, name)) = next_placeholder(text, last, braced, bare, standalone) {
        result.push_str(&text[last..range.start]);
        result.push_str(&resolve(&name)?);
        last = range.end;
    }
    result.push_str(&text[last..]);
    Ok(result)
}

/// Find the leftmost placeholder starting at or after `from`, braced or bare.
/// With `standalone`, a bare placeholder must not touch other non-whitespace text.
fn next_placeholder(
    text: &str,
    from: usize,
    braced: &Regex,
    bare: &Regex,
    standalone: bool,
) -> Option<(std::ops::Range<usize>, String)> {
    let braced_match = braced
        .captures_iter(text)
        .find_map(|c| Some((c.get(0)?.range(), c[1].to_string())).filter(|(range, _)| range.start >= from));

    let bare_match = bare.captures_iter(text).find_map(|c| {
        let range = c.get(0)?.range();
        if range.start < from {
            return None;
        }
        let before_ok = text[..range.start].chars().next_back().map_or(true, char::is_whitespace);
        let after_ok = text[range.end..].chars().next().map_or(true, char::is_whitespace);
        (!standalone || (before_ok && after_ok)).then(|| (range, c[1].to_string()))
    });

    match (braced_match, bare_match) {
        (Some(b), Some(f)) => Some(if b.0.start <= f.0.start { b } else { f }),
        (b, f) => b.or(f),
    }
}

fn inner_message(error: ApiTestError) -> String {
    match error {
        ApiTestError::Variable(message) => message,
        other => other.to_string(),
    }
}
