//! Recognizes the inline directives a template cell can carry.
//!
//! Three forms exist: a `[foreach] ... [endforeach]` block, a simple binding
//! such as `{id: 12, field: form}`, and plain static text. The binding syntax is
//! hand-written and rarely valid JSON, so extraction tries strict JSON first and
//! falls back to capturing `id` and `field` independently.

use crate::markup;
use crate::template::{self, Binding, CellContent, FieldRef};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::trace;

static FOREACH_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\s*foreach\s*\]").expect("valid foreach start pattern"));
static FOREACH_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\s*endforeach\s*\]").expect("valid foreach end pattern"));
static OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("valid object pattern"));
static ID_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bid["']?\s*:"#).expect("valid id key pattern"));
static FIELD_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bfield["']?\s*:"#).expect("valid field key pattern"));
static BARE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").expect("valid bare key pattern")
});
static ID_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bid["']?\s*:\s*["']?(\d+)"#).expect("valid id value pattern"));
static FIELD_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bfield["']?\s*:\s*["']?([^"',}]+)"#).expect("valid field value pattern")
});

/// Result of interpreting one cell's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpreted {
    pub content: CellContent,
    pub binding: Binding,
}

impl Interpreted {
    fn text(text: impl Into<String>) -> Self {
        Self {
            content: CellContent::StaticText(text.into()),
            binding: Binding::Static,
        }
    }
}

/// True when the text carries any directive. Used to tell headerless tables
/// apart from tables whose first row is a real header.
pub fn is_directive(text: &str) -> bool {
    has_foreach(text) || find_binding_object(text).is_some()
}

pub fn has_foreach(text: &str) -> bool {
    foreach_body(text).is_some()
}

/// Interprets a cell. The first matching form wins: foreach, then simple
/// binding, then static text.
pub fn interpret(text: &str) -> Interpreted {
    if let Some(body) = foreach_body(text) {
        return interpret_foreach(text, body);
    }
    if let Some(field) = extract_binding(text) {
        return Interpreted {
            content: CellContent::BoundValue(String::new()),
            binding: Binding::Simple(field),
        };
    }
    Interpreted::text(text)
}

fn foreach_body(text: &str) -> Option<&str> {
    let start = FOREACH_START.find(text)?;
    let end = FOREACH_END.find_at(text, start.end())?;
    Some(&text[start.end()..end.start()])
}

fn interpret_foreach(text: &str, body: &str) -> Interpreted {
    match markup::parse_fragment(body) {
        Ok(fragment) => {
            if let Some(table) = fragment.root().find("table") {
                return Interpreted {
                    content: CellContent::NestedTable(Box::new(template::parse_table_element(
                        table,
                    ))),
                    binding: Binding::Foreach,
                };
            }
            let bound_div = fragment
                .root()
                .find_all("div")
                .into_iter()
                .find_map(|div| extract_binding(&div.text_content()));
            if let Some(field) = bound_div {
                return Interpreted {
                    content: CellContent::HtmlFragment(String::new()),
                    binding: Binding::ForeachDiv(field),
                };
            }
            Interpreted::text(residual_text(text).trim())
        }
        Err(err) => {
            trace!(error = %err, "foreach body is not markup; keeping residual text");
            Interpreted::text(strip_markers(text).trim())
        }
    }
}

/// Cell text with every foreach marker removed and any markup flattened.
fn residual_text(text: &str) -> String {
    let stripped = strip_markers(text);
    markup::parse_fragment(&stripped)
        .map(|fragment| fragment.root().text_content())
        .unwrap_or(stripped)
}

fn strip_markers(text: &str) -> String {
    let without_start = FOREACH_START.replace_all(text, "");
    FOREACH_END.replace_all(&without_start, "").into_owned()
}

/// Finds the first `{...}` object in the text that names both an `id` and a
/// `field` key.
pub fn find_binding_object(text: &str) -> Option<&str> {
    OBJECT
        .find_iter(text)
        .map(|found| found.as_str())
        .find(|object| ID_KEY.is_match(object) && FIELD_KEY.is_match(object))
}

/// Extracts `{id, field}` from a binding, strict JSON first, then per-key
/// capture. Returns `None` when either half is missing.
pub fn extract_binding(text: &str) -> Option<FieldRef> {
    let object = find_binding_object(text)?;
    strict_binding(object).or_else(|| loose_binding(object))
}

fn strict_binding(object: &str) -> Option<FieldRef> {
    let quoted = BARE_KEY.replace_all(object, r#"$1"$2":"#);
    let value: Value = serde_json::from_str(&quoted).ok()?;
    let id = match value.get("id")? {
        Value::Number(number) => u32::try_from(number.as_u64()?).ok()?,
        Value::String(text) => text.trim().parse().ok()?,
        _ => return None,
    };
    let field = value.get("field")?.as_str()?.trim();
    if field.is_empty() {
        return None;
    }
    Some(FieldRef::new(id, field))
}

fn loose_binding(object: &str) -> Option<FieldRef> {
    let id = ID_VALUE
        .captures(object)?
        .get(1)?
        .as_str()
        .parse::<u32>()
        .ok()?;
    let field = FIELD_VALUE.captures(object)?.get(1)?.as_str().trim();
    if field.is_empty() {
        return None;
    }
    Some(FieldRef::new(id, field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_and_loose_extraction_agree() {
        let strict = extract_binding(r#"{"id": 12, "field": "form"}"#).unwrap();
        let unquoted_keys = extract_binding(r#"{id: 12, field: "form"}"#).unwrap();
        let bare = extract_binding("{id: 12, field: form}").unwrap();
        assert_eq!(strict, FieldRef::new(12, "form"));
        assert_eq!(unquoted_keys, strict);
        assert_eq!(bare, strict);
    }

    #[test]
    fn accepts_string_ids_and_alternate_fields() {
        let field = extract_binding(r#"{"id": "7", "field": "gloss|translation"}"#).unwrap();
        assert_eq!(field.id, 7);
        assert_eq!(field.alternates().collect::<Vec<_>>(), vec!["gloss", "translation"]);

        let loose = extract_binding("{ id:7 , field: gloss|translation }").unwrap();
        assert_eq!(loose, field);
    }

    #[test]
    fn ignores_objects_missing_a_key() {
        assert!(extract_binding("{id: 12}").is_none());
        assert!(extract_binding("{field: form}").is_none());
        assert!(extract_binding("{question_id: 3, field: form}").is_none());
        assert!(!is_directive("Plural forms {see notes}"));
    }

    #[test]
    fn simple_binding_inside_prose() {
        let interpreted = interpret("Form: {id: 4, field: form} (attested)");
        assert_eq!(interpreted.binding, Binding::Simple(FieldRef::new(4, "form")));
        assert_eq!(interpreted.content, CellContent::BoundValue(String::new()));
    }

    #[test]
    fn half_matching_binding_stays_static() {
        let interpreted = interpret("{id: abc, field: form}");
        assert_eq!(interpreted.binding, Binding::Static);
        assert_eq!(
            interpreted.content,
            CellContent::StaticText("{id: abc, field: form}".to_string())
        );
    }

    #[test]
    fn foreach_with_divs_binds_vertically() {
        let interpreted =
            interpret("[foreach]<div>{id: 9, field: form}</div><div>extra</div>[endforeach]");
        assert_eq!(interpreted.binding, Binding::ForeachDiv(FieldRef::new(9, "form")));
        assert_eq!(interpreted.content, CellContent::HtmlFragment(String::new()));
    }

    #[test]
    fn foreach_with_nested_table() {
        let interpreted = interpret(
            "[foreach]<table><tr><td>{id: 3, field: question}</td><td>{id: 3, field: form}</td></tr></table>[endforeach]",
        );
        assert_eq!(interpreted.binding, Binding::Foreach);
        let CellContent::NestedTable(table) = interpreted.content else {
            panic!("expected nested table");
        };
        assert!(table.headers.is_empty());
        assert_eq!(table.rows.len(), 1);
        assert_eq!(
            table.rows[0].cells[1].binding,
            Binding::Simple(FieldRef::new(3, "form"))
        );
    }

    #[test]
    fn foreach_without_bindings_leaves_residual_text() {
        let interpreted = interpret("[FOREACH] just words [endforeach]");
        assert_eq!(interpreted.binding, Binding::Static);
        assert_eq!(interpreted.content, CellContent::StaticText("just words".to_string()));
    }

    #[test]
    fn first_end_marker_closes_the_block() {
        let interpreted = interpret(
            "[foreach]<div>{id: 4, field: form}</div>[endforeach] and [foreach]<div>{id: 5, field: gloss}</div>[endforeach]",
        );
        assert_eq!(interpreted.binding, Binding::ForeachDiv(FieldRef::new(4, "form")));

        let residual = interpret("[foreach] one [endforeach] two [foreach] three [endforeach]");
        assert_eq!(
            residual.content,
            CellContent::StaticText("one  two  three".to_string())
        );
    }

    #[test]
    fn unmatched_foreach_marker_is_not_a_block() {
        assert!(!has_foreach("[foreach] never closed"));
        assert!(!has_foreach("[endforeach] before [foreach]"));
    }

    #[test]
    fn static_text_is_kept_verbatim() {
        let interpreted = interpret("  Singular  ");
        assert_eq!(interpreted, Interpreted::text("  Singular  "));
    }
}
