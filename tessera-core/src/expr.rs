//! Expression Evaluator boundary
//!
//! The engine does not own an expression language. It asks an [`Evaluator`]
//! which root names an expression reads, resolves those names in the scope
//! chain (tracked), and hands the evaluator the resulting [`Bindings`]. An
//! evaluator walking into nested values through the `Tracked` handles is
//! tracked at exactly the paths it reads.
//!
//! [`PathEvaluator`] is a deliberately small default: JSON literals, single
//! quoted strings, dotted or indexed paths, `!`, `==` and `!=`.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::reactive::Tracked;
use crate::scope::Scope;

/// Root names of an expression, resolved against a scope.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: IndexMap<String, Tracked>,
}

impl Bindings {
    /// Resolve each root name in `scope`. Names no scope defines are left
    /// out, which evaluators treat as undefined.
    pub fn capture(scope: &Scope, roots: &[String]) -> Self {
        let entries = roots
            .iter()
            .filter_map(|name| scope.lookup(name).map(|tracked| (name.clone(), tracked)))
            .collect();
        Self { entries }
    }

    /// The handle bound to `name`.
    pub fn get(&self, name: &str) -> Option<&Tracked> {
        self.entries.get(name)
    }

    /// Bound names in resolution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// The expression collaborator.
pub trait Evaluator: Send + Sync {
    /// Root variable names `expression` reads.
    fn roots(&self, expression: &str) -> Result<Vec<String>>;

    /// Evaluate `expression` against `bindings`.
    fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value>;
}

/// Evaluate `expression` in `scope`: resolve its roots, then evaluate.
pub fn evaluate_in(evaluator: &dyn Evaluator, expression: &str, scope: &Scope) -> Result<Value> {
    let roots = evaluator.roots(expression)?;
    let bindings = Bindings::capture(scope, &roots);
    evaluator.evaluate(expression, &bindings)
}

/// Loose truthiness: `null`, `false`, `0`, `""` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form used for text content and attribute values.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path { root: String, segments: Vec<String> },
    Not(Box<Expr>),
    Compare {
        left: Box<Expr>,
        right: Box<Expr>,
        negate: bool,
    },
}

impl Expr {
    fn collect_roots(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path { root, .. } => {
                if !out.contains(root) {
                    out.push(root.clone());
                }
            }
            Expr::Not(inner) => inner.collect_roots(out),
            Expr::Compare { left, right, .. } => {
                left.collect_roots(out);
                right.collect_roots(out);
            }
        }
    }

    fn eval(&self, bindings: &Bindings) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Path { root, segments } => {
                let Some(mut current) = bindings.get(root).cloned() else {
                    return Value::Null;
                };
                for segment in segments {
                    if segment == "length" {
                        match current.peek() {
                            Value::Array(_) => return Value::from(current.len()),
                            Value::String(s) => return Value::from(s.chars().count()),
                            _ => {}
                        }
                    }
                    current = current.get(segment);
                }
                current.value()
            }
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(bindings))),
            Expr::Compare {
                left,
                right,
                negate,
            } => Value::Bool((left.eval(bindings) == right.eval(bindings)) != *negate),
        }
    }
}

/// Minimal evaluator for paths, literals and equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

impl PathEvaluator {
    fn parse(&self, expression: &str) -> Result<Expr> {
        let source = expression.trim();
        if source.is_empty() {
            return Err(EngineError::expression(expression, "empty expression"));
        }

        if let Some((at, negate)) = find_comparison(source) {
            let left = self.parse(&source[..at])?;
            let right = self.parse(&source[at + 2..])?;
            return Ok(Expr::Compare {
                left: Box::new(left),
                right: Box::new(right),
                negate,
            });
        }

        if let Some(rest) = source.strip_prefix('!') {
            return Ok(Expr::Not(Box::new(self.parse(rest)?)));
        }

        if let Some(inner) = source
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return Ok(Expr::Literal(Value::String(inner.to_string())));
        }

        if let Ok(value) = serde_json::from_str::<Value>(source) {
            return Ok(Expr::Literal(value));
        }

        parse_path(source).ok_or_else(|| EngineError::expression(expression, "unsupported syntax"))
    }
}

impl Evaluator for PathEvaluator {
    fn roots(&self, expression: &str) -> Result<Vec<String>> {
        let mut roots = Vec::new();
        self.parse(expression)?.collect_roots(&mut roots);
        Ok(roots)
    }

    fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value> {
        Ok(self.parse(expression)?.eval(bindings))
    }
}

/// Position of a top-level `==` or `!=`, outside quotes and brackets.
fn find_comparison(source: &str) -> Option<(usize, bool)> {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i + 1 < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'[' | b'{' | b'(' => depth += 1,
                b']' | b'}' | b')' => depth = depth.saturating_sub(1),
                b'=' | b'!' if depth == 0 && bytes[i + 1] == b'=' => {
                    return Some((i, b == b'!'));
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn parse_path(source: &str) -> Option<Expr> {
    let first = source.chars().next()?;
    if !is_identifier_start(first) {
        return None;
    }

    let root_end = source
        .find(|c: char| !is_identifier_char(c))
        .unwrap_or(source.len());
    let root = source[..root_end].to_string();
    let mut rest = &source[root_end..];
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(|c: char| !is_identifier_char(c))
                .unwrap_or(after.len());
            if end == 0 {
                return None;
            }
            segments.push(after[..end].to_string());
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']')?;
            let key = after[..end].trim();
            let key = key
                .strip_prefix('\'')
                .and_then(|k| k.strip_suffix('\''))
                .or_else(|| key.strip_prefix('"').and_then(|k| k.strip_suffix('"')))
                .unwrap_or(key);
            if key.is_empty() {
                return None;
            }
            segments.push(key.to_string());
            rest = &after[end + 1..];
        } else {
            return None;
        }
    }

    Some(Expr::Path { root, segments })
}
