//! Template and expression evaluation.
//!
//! Strings in playbooks may embed `{{ expr }}` placeholders. Conditionals
//! (`when`, `changed_when`, `failed_when`) are bare expressions. Both are
//! handled by a small interpreter over tagged [`Value`]s:
//!
//! - identifiers resolve against a flat variable map; dotted paths and
//!   `[index]` walk into mappings and lists
//! - a name that does not resolve yields [`Value::Undefined`], which
//!   propagates through every operator except the `defined`/`undefined`
//!   tests and the `default` filter
//! - `lookup(kind, ...)` is the only operation that reads outside the
//!   variable map
//!
//! A conditional that evaluates to undefined is false. A placeholder that
//! renders to undefined is an [`TemplateError::UndefinedVariable`] error.
//!
//! ```rust
//! use converge::template::{TemplateEngine, Vars};
//! use serde_json::json;
//!
//! let engine = TemplateEngine::new();
//! let mut vars = Vars::new();
//! vars.insert("pkg".into(), json!("nginx"));
//!
//! assert_eq!(engine.render_str("install {{ pkg | upper }}", &vars).unwrap(), json!("install NGINX"));
//! assert!(!engine.evaluate_condition("missing == 'x'", &vars).unwrap());
//! ```

mod eval;
pub mod parser;
pub mod value;

pub use parser::{parse, Expr};
pub use value::Value;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;

use crate::lookup::{LookupContext, LookupError, LookupRegistry};
use eval::Evaluator;

/// Flat variable map an expression is evaluated against.
pub type Vars = IndexMap<String, JsonValue>;

/// Errors raised while parsing or evaluating templates.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// The expression could not be parsed.
    #[error("Syntax error in '{expression}': {message}")]
    Syntax {
        /// Offending expression source
        expression: String,
        /// What went wrong
        message: String,
    },

    /// A placeholder rendered to an undefined value.
    #[error("'{0}' is undefined")]
    UndefinedVariable(String),

    #[error("Unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("Unknown test '{0}'")]
    UnknownTest(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    /// Operands of the wrong type.
    #[error("Type error: {0}")]
    Type(String),

    /// Variables refer to each other without end.
    #[error("Recursive template loop while resolving '{0}'")]
    Recursion(String),

    /// A lookup failed.
    #[error("Lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

/// Sole key of the object [`TemplateEngine::literal`] wraps strings in.
const LITERAL_KEY: &str = "__converge_literal__";

/// Result type for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Evaluates expressions and renders templated values.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    lookups: Arc<LookupRegistry>,
    lookup_context: LookupContext,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Engine with the built-in lookups and no base directory.
    pub fn new() -> Self {
        Self::with_lookups(Arc::new(LookupRegistry::with_builtins()), LookupContext::new())
    }

    /// Engine with a specific lookup registry and context.
    pub fn with_lookups(lookups: Arc<LookupRegistry>, lookup_context: LookupContext) -> Self {
        Self {
            lookups,
            lookup_context,
        }
    }

    pub(crate) fn lookups(&self) -> (&LookupRegistry, &LookupContext) {
        (&self.lookups, &self.lookup_context)
    }

    /// Whether a string contains a placeholder.
    pub fn is_template(s: &str) -> bool {
        s.contains("{{")
    }

    /// Mark a value as data. A string holding a placeholder is wrapped so
    /// that referring to the variable yields the string verbatim instead of
    /// rendering it again. Other values pass through unchanged.
    pub fn literal(value: JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) if Self::is_template(&s) => {
                let mut wrapped = serde_json::Map::with_capacity(1);
                wrapped.insert(LITERAL_KEY.to_string(), JsonValue::String(s));
                JsonValue::Object(wrapped)
            }
            other => other,
        }
    }

    /// The string inside a value wrapped by [`TemplateEngine::literal`].
    pub fn as_literal(value: &JsonValue) -> Option<&str> {
        match value {
            JsonValue::Object(map) if map.len() == 1 => map.get(LITERAL_KEY)?.as_str(),
            _ => None,
        }
    }

    /// Evaluate a bare expression.
    pub fn evaluate(&self, expression: &str, vars: &Vars) -> TemplateResult<Value> {
        let expr = parse(strip_braces(expression))?;
        Evaluator::new(self, vars, 0).eval(&expr)
    }

    /// Evaluate a conditional. Undefined is false; it never raises.
    pub fn evaluate_condition(&self, condition: &str, vars: &Vars) -> TemplateResult<bool> {
        Ok(self.evaluate(condition, vars)?.is_truthy())
    }

    /// Render a string. A string that is exactly one placeholder keeps the
    /// native type of its value; anything else renders to a string.
    pub fn render_str(&self, template: &str, vars: &Vars) -> TemplateResult<JsonValue> {
        let value = self.render_at_depth(template, vars, 0)?;
        value
            .to_json()
            .ok_or_else(|| TemplateError::UndefinedVariable(undefined_name(&value)))
    }

    /// Render every string inside a JSON value.
    pub fn render_value(&self, value: &JsonValue, vars: &Vars) -> TemplateResult<JsonValue> {
        match value {
            JsonValue::String(s) if Self::is_template(s) => self.render_str(s, vars),
            JsonValue::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, vars))
                .collect::<TemplateResult<Vec<_>>>()
                .map(JsonValue::Array),
            JsonValue::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v, vars)?);
                }
                Ok(JsonValue::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    pub(crate) fn render_at_depth(
        &self,
        template: &str,
        vars: &Vars,
        depth: usize,
    ) -> TemplateResult<Value> {
        let segments = split_segments(template)?;
        let evaluator = Evaluator::new(self, vars, depth);

        if let [Segment::Expr(src)] = segments.as_slice() {
            let value = evaluator.eval(&parse(src)?)?;
            return match value {
                Value::Undefined(name) => Err(TemplateError::UndefinedVariable(name)),
                other => Ok(other),
            };
        }

        let mut out = String::with_capacity(template.len());
        for segment in segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(src) => match evaluator.eval(&parse(src)?)? {
                    Value::Undefined(name) => return Err(TemplateError::UndefinedVariable(name)),
                    value => out.push_str(&value.to_string()),
                },
            }
        }
        Ok(Value::Str(out))
    }
}

fn undefined_name(value: &Value) -> String {
    match value {
        Value::Undefined(name) => name.clone(),
        Value::List(items) => items
            .iter()
            .find(|v| v.to_json().is_none())
            .map(undefined_name)
            .unwrap_or_default(),
        Value::Map(map) => map
            .values()
            .find(|v| v.to_json().is_none())
            .map(undefined_name)
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// Conditionals may be written with or without surrounding braces.
fn strip_braces(expression: &str) -> &str {
    let trimmed = expression.trim();
    match trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        Some(inner) if !inner.contains("{{") => inner.trim(),
        _ => trimmed,
    }
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

fn split_segments(template: &str) -> TemplateResult<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let body = &rest[start + 2..];
        let end = find_close(body).ok_or_else(|| TemplateError::Syntax {
            expression: template.to_string(),
            message: "unclosed '{{'".to_string(),
        })?;
        segments.push(Segment::Expr(body[..end].trim()));
        rest = &body[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    // Surrounding whitespace does not demote a lone placeholder to a string.
    if segments.len() > 1
        && segments
            .iter()
            .filter(|s| matches!(s, Segment::Expr(_)))
            .count()
            == 1
        && segments
            .iter()
            .all(|s| matches!(s, Segment::Expr(_)) || matches!(s, Segment::Text(t) if t.trim().is_empty()))
    {
        segments.retain(|s| matches!(s, Segment::Expr(_)));
    }

    Ok(segments)
}

/// Offset of the closing `}}`, skipping over quoted strings.
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'}' && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}
