use anyhow::{Result, bail};
use rmcp::model::{CallToolResult, Content};
use serde_json::Value;

use crate::config::MiddlewareEntry;

/// A named response transform. `response` receives the tool name and the
/// result and must return a result; transforms that cannot apply pass the
/// input through unchanged.
pub struct Middleware {
    pub name: &'static str,
    pub response: Option<fn(&str, CallToolResult) -> CallToolResult>,
}

static BUILTINS: &[Middleware] = &[
    Middleware {
        name: "strip-json-keys",
        response: Some(strip_json_keys),
    },
    Middleware {
        name: "strip-result-wrapper",
        response: Some(strip_result_wrapper),
    },
    Middleware {
        name: "extract-json-results",
        response: Some(extract_json_results),
    },
    Middleware {
        name: "json5",
        response: Some(json5_reserialize),
    },
    Middleware {
        name: "toon",
        response: Some(toon_reserialize),
    },
];

/// Look up a built-in middleware by name.
pub fn builtin(name: &str) -> Option<&'static Middleware> {
    BUILTINS.iter().find(|m| m.name == name)
}

/// Resolve a configured chain to middleware references. Unknown names are a
/// config error.
pub fn resolve_chain(entries: &[MiddlewareEntry]) -> Result<Vec<&'static Middleware>> {
    let mut chain = Vec::with_capacity(entries.len());
    for entry in entries {
        match builtin(&entry.name) {
            Some(mw) => chain.push(mw),
            None => bail!("unknown middleware '{}'", entry.name),
        }
    }
    Ok(chain)
}

/// Fold a result through each middleware's `response` in declared order.
pub fn apply(
    chain: &[&'static Middleware],
    tool_name: &str,
    result: CallToolResult,
) -> CallToolResult {
    chain.iter().fold(result, |acc, mw| match mw.response {
        Some(f) => f(tool_name, acc),
        None => acc,
    })
}

// --- Shared helpers ---

/// Map a transform over the text blocks of a result. Non-text blocks pass
/// through untouched; a transform returning None leaves the block as-is.
fn map_text_blocks(
    mut result: CallToolResult,
    f: impl Fn(&str) -> Option<String>,
) -> CallToolResult {
    result.content = result
        .content
        .into_iter()
        .map(|block| match block.as_text() {
            Some(t) => match f(&t.text) {
                Some(replaced) => Content::text(replaced),
                None => block,
            },
            None => block,
        })
        .collect();
    result
}

/// Parse text as JSON and run a transformer over the value. Unparsable text
/// or a None from the transformer keeps the original text.
fn transform_parsed(text: &str, f: impl Fn(&Value) -> Option<String>) -> Option<String> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    f(&parsed)
}

/// Strings pass through verbatim; anything else is JSON-encoded.
fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// --- Built-ins ---

/// Replace `"word":` with `word:` in raw text. Operates on the text itself,
/// so it also applies to near-JSON output that would not parse.
fn strip_json_keys(_tool: &str, result: CallToolResult) -> CallToolResult {
    use regex::Regex;
    use std::sync::OnceLock;

    static QUOTED_KEY: OnceLock<Regex> = OnceLock::new();
    let re = QUOTED_KEY.get_or_init(|| Regex::new(r#""(\w+)":"#).unwrap());

    map_text_blocks(result, |text| Some(re.replace_all(text, "$1:").into_owned()))
}

/// Unwrap `{"result": …}` objects: the wrapped string verbatim, anything
/// else JSON-encoded.
fn strip_result_wrapper(_tool: &str, result: CallToolResult) -> CallToolResult {
    map_text_blocks(result, |text| {
        transform_parsed(text, |parsed| {
            let obj = parsed.as_object()?;
            if obj.len() != 1 {
                return None;
            }
            obj.get("result").map(value_as_text)
        })
    })
}

/// Replace the text with the `results` value of a parsed object.
fn extract_json_results(_tool: &str, result: CallToolResult) -> CallToolResult {
    map_text_blocks(result, |text| {
        transform_parsed(text, |parsed| {
            parsed.as_object()?.get("results").map(value_as_text)
        })
    })
}

/// Re-serialize parsed JSON as JSON5, dropping quotes around identifier keys.
fn json5_reserialize(_tool: &str, result: CallToolResult) -> CallToolResult {
    map_text_blocks(result, |text| transform_parsed(text, |parsed| Some(to_json5(parsed))))
}

/// Re-serialize parsed objects/arrays in the compact TOON layout.
fn toon_reserialize(_tool: &str, result: CallToolResult) -> CallToolResult {
    map_text_blocks(result, |text| {
        transform_parsed(text, |parsed| {
            if parsed.is_object() || parsed.is_array() {
                Some(to_toon(parsed))
            } else {
                None
            }
        })
    })
}

// --- JSON5 writer ---

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Compact JSON5: identifier keys unquoted, everything else standard JSON.
fn to_json5(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(to_json5).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| {
                    let key = if is_identifier(k) {
                        k.clone()
                    } else {
                        Value::String(k.clone()).to_string()
                    };
                    format!("{key}:{}", to_json5(v))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        scalar => scalar.to_string(),
    }
}

// --- TOON writer ---
//
// Indentation layout: `key: value` lines, `key[N]: a,b,c` for scalar arrays,
// and `key[N]{f1,f2}:` with one comma-joined row per element for arrays of
// uniform flat objects.

fn toon_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => {
            let needs_quoting = s.is_empty()
                || s != s.trim()
                || s.contains([',', ':', '"', '\n', '[', ']', '{', '}'])
                || s.parse::<f64>().is_ok()
                || matches!(s.as_str(), "true" | "false" | "null");
            if needs_quoting {
                Value::String(s.clone()).to_string()
            } else {
                s.clone()
            }
        }
        other => other.to_string(),
    }
}

fn toon_key(key: &str) -> String {
    if is_identifier(key) {
        key.to_string()
    } else {
        Value::String(key.to_string()).to_string()
    }
}

/// Field set shared by every element, if all elements are objects with
/// identical keys and scalar values.
fn tabular_fields(items: &[Value]) -> Option<Vec<String>> {
    let first = items.first()?.as_object()?;
    let fields: Vec<String> = first.keys().cloned().collect();
    for item in items {
        let obj = item.as_object()?;
        if obj.len() != fields.len() {
            return None;
        }
        for field in &fields {
            let v = obj.get(field)?;
            if v.is_object() || v.is_array() {
                return None;
            }
        }
    }
    Some(fields)
}

fn write_toon_array(key: Option<&str>, items: &[Value], indent: usize, out: &mut String) {
    let pad = " ".repeat(indent);
    let label = key.map(toon_key).unwrap_or_default();

    if items.iter().all(|v| !v.is_object() && !v.is_array()) {
        let row: Vec<String> = items.iter().map(toon_scalar).collect();
        out.push_str(&format!("{pad}{label}[{}]: {}\n", items.len(), row.join(",")));
        return;
    }

    if let Some(fields) = tabular_fields(items) {
        out.push_str(&format!(
            "{pad}{label}[{}]{{{}}}:\n",
            items.len(),
            fields.join(",")
        ));
        let row_pad = " ".repeat(indent + 2);
        for item in items {
            let obj = item.as_object().unwrap();
            let row: Vec<String> = fields.iter().map(|f| toon_scalar(&obj[f])).collect();
            out.push_str(&format!("{row_pad}{}\n", row.join(",")));
        }
        return;
    }

    // Mixed or nested arrays fall back to one JSON-encoded element per line.
    out.push_str(&format!("{pad}{label}[{}]:\n", items.len()));
    let row_pad = " ".repeat(indent + 2);
    for item in items {
        out.push_str(&format!("{row_pad}{item}\n"));
    }
}

fn write_toon_object(map: &serde_json::Map<String, Value>, indent: usize, out: &mut String) {
    let pad = " ".repeat(indent);
    for (key, value) in map {
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                out.push_str(&format!("{pad}{}:\n", toon_key(key)));
                write_toon_object(inner, indent + 2, out);
            }
            Value::Object(_) => {
                out.push_str(&format!("{pad}{}:\n", toon_key(key)));
            }
            Value::Array(items) => write_toon_array(Some(key), items, indent, out),
            scalar => {
                out.push_str(&format!("{pad}{}: {}\n", toon_key(key), toon_scalar(scalar)));
            }
        }
    }
}

fn to_toon(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(map) => write_toon_object(map, 0, &mut out),
        Value::Array(items) => write_toon_array(None, items, 0, &mut out),
        scalar => out.push_str(&toon_scalar(scalar)),
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_result(text: &str) -> CallToolResult {
        CallToolResult::success(vec![Content::text(text)])
    }

    fn first_text(result: &CallToolResult) -> String {
        result
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap()
    }

    fn chain(names: &[&str]) -> Vec<&'static Middleware> {
        names.iter().map(|n| builtin(n).unwrap()).collect()
    }

    #[test]
    fn builtin_lookup() {
        assert!(builtin("strip-json-keys").is_some());
        assert!(builtin("toon").is_some());
        assert!(builtin("gzip").is_none());
    }

    #[test]
    fn resolve_chain_rejects_unknown() {
        let entries = vec![MiddlewareEntry {
            name: "gzip".to_string(),
            config: Value::Null,
        }];
        assert!(resolve_chain(&entries).is_err());
    }

    #[test]
    fn strip_json_keys_on_raw_text() {
        let out = apply(&chain(&["strip-json-keys"]), "t", text_result(r#"{"a":1,"b c":2}"#));
        // Only \w+ keys lose their quotes.
        assert_eq!(first_text(&out), r#"{a:1,"b c":2}"#);
    }

    #[test]
    fn strip_result_wrapper_unwraps_string() {
        let out = apply(
            &chain(&["strip-result-wrapper"]),
            "t",
            text_result(r#"{"result":"plain text"}"#),
        );
        assert_eq!(first_text(&out), "plain text");
    }

    #[test]
    fn strip_result_wrapper_encodes_non_string() {
        let out = apply(
            &chain(&["strip-result-wrapper"]),
            "t",
            text_result(r#"{"result":{"name":"test"}}"#),
        );
        assert_eq!(first_text(&out), r#"{"name":"test"}"#);
    }

    #[test]
    fn strip_result_wrapper_requires_single_key() {
        let input = r#"{"result":1,"extra":2}"#;
        let out = apply(&chain(&["strip-result-wrapper"]), "t", text_result(input));
        assert_eq!(first_text(&out), input);
    }

    #[test]
    fn extract_json_results_tolerates_extra_keys() {
        let out = apply(
            &chain(&["extract-json-results"]),
            "t",
            text_result(r#"{"results":[1,2],"took_ms":3}"#),
        );
        assert_eq!(first_text(&out), "[1,2]");
    }

    #[test]
    fn unparsable_text_passes_through() {
        let input = "not json at all";
        for name in ["strip-result-wrapper", "extract-json-results", "json5", "toon"] {
            let out = apply(&chain(&[name]), "t", text_result(input));
            assert_eq!(first_text(&out), input, "middleware {name}");
        }
    }

    #[test]
    fn wrapper_then_strip_keys_composition() {
        let out = apply(
            &chain(&["strip-result-wrapper", "strip-json-keys"]),
            "t",
            text_result(r#"{"result":{"name":"test"}}"#),
        );
        assert_eq!(first_text(&out), r#"{name:"test"}"#);
    }

    #[test]
    fn non_text_blocks_untouched() {
        let mut result = text_result(r#"{"result":"x"}"#);
        result
            .content
            .push(Content::image("aGVsbG8=".to_string(), "image/png".to_string()));
        let out = apply(&chain(&["strip-result-wrapper"]), "t", result);
        assert_eq!(first_text(&out), "x");
        assert_eq!(out.content.len(), 2);
        assert!(out.content[1].as_text().is_none());
    }

    #[test]
    fn json5_drops_identifier_key_quotes() {
        // serde_json maps iterate in key order.
        assert_eq!(
            to_json5(&json!({"name": "test", "n": 1, "non ident": true})),
            r#"{n:1,name:"test","non ident":true}"#
        );
        assert_eq!(to_json5(&json!([1, "a", null])), r#"[1,"a",null]"#);
    }

    #[test]
    fn json5_middleware_applies_to_parsed_text() {
        let out = apply(&chain(&["json5"]), "t", text_result(r#"{"a": 1}"#));
        assert_eq!(first_text(&out), "{a:1}");
    }

    #[test]
    fn toon_flat_object() {
        let v = json!({"name": "test", "count": 2, "ok": true});
        // serde_json maps iterate in key order.
        assert_eq!(to_toon(&v), "count: 2\nname: test\nok: true");
    }

    #[test]
    fn toon_nested_object_indents() {
        let v = json!({"outer": {"inner": 1}});
        assert_eq!(to_toon(&v), "outer:\n  inner: 1");
    }

    #[test]
    fn toon_scalar_array_inline() {
        let v = json!({"tags": ["a", "b", "c"]});
        assert_eq!(to_toon(&v), "tags[3]: a,b,c");
    }

    #[test]
    fn toon_uniform_objects_tabular() {
        let v = json!({"items": [{"id": 1, "name": "foo"}, {"id": 2, "name": "bar"}]});
        assert_eq!(to_toon(&v), "items[2]{id,name}:\n  1,foo\n  2,bar");
    }

    #[test]
    fn toon_quotes_ambiguous_strings() {
        let v = json!({"a": "1,2", "b": "true", "c": "plain"});
        assert_eq!(to_toon(&v), "a: \"1,2\"\nb: \"true\"\nc: plain");
    }

    #[test]
    fn toon_middleware_skips_scalars() {
        let out = apply(&chain(&["toon"]), "t", text_result("42"));
        assert_eq!(first_text(&out), "42");

        let out = apply(&chain(&["toon"]), "t", text_result(r#"{"a":1}"#));
        assert_eq!(first_text(&out), "a: 1");
    }
}
