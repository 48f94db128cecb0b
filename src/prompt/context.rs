//! Free-form prompt context with dot-path lookup.

use serde_json::Value;
use std::collections::BTreeMap;

/// Context values injected into prompt templates.
///
/// Keys map to strings, numbers, or nested objects; templates dereference
/// nested fields with dot notation (`nodeA.title`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptContext {
    values: BTreeMap<String, Value>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value under a key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Top-level keys present in the context.
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Resolve a dot-path (`nodeA.title`) against the context.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Whether a dot-path resolves to a truthy value.
    ///
    /// Null and missing are falsy; booleans are themselves; numbers are truthy
    /// when non-zero; strings when non-empty; arrays and objects always.
    pub fn is_truthy(&self, path: &str) -> bool {
        match self.lookup(path) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        }
    }

    /// Render a resolved value for substitution: strings inline verbatim,
    /// numbers and booleans stringify, everything else pretty JSON.
    pub fn render(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }

    /// Borrow the underlying map (sorted by key).
    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Shortcut for string values.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.lookup(key).and_then(|v| v.as_str())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for PromptContext {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_dot_path_lookup() {
        let ctx = PromptContext::new()
            .with("nodeA", json!({"title": "Machine Learning", "depth": 2}))
            .with("documentText", "some text");

        assert_eq!(
            ctx.lookup("nodeA.title"),
            Some(&json!("Machine Learning"))
        );
        assert_eq!(ctx.lookup("nodeA.depth"), Some(&json!(2)));
        assert_eq!(ctx.lookup("nodeA.missing"), None);
        assert_eq!(ctx.lookup("missing.title"), None);
    }

    #[test]
    fn test_truthiness() {
        let ctx = PromptContext::new()
            .with("empty", "")
            .with("text", "hi")
            .with("zero", 0)
            .with("one", 1)
            .with("flag", false)
            .with("null", Value::Null)
            .with("obj", json!({}));

        assert!(!ctx.is_truthy("empty"));
        assert!(ctx.is_truthy("text"));
        assert!(!ctx.is_truthy("zero"));
        assert!(ctx.is_truthy("one"));
        assert!(!ctx.is_truthy("flag"));
        assert!(!ctx.is_truthy("null"));
        assert!(!ctx.is_truthy("absent"));
        assert!(ctx.is_truthy("obj"));
    }

    #[test]
    fn test_render_rules() {
        assert_eq!(PromptContext::render(&json!("verbatim")), "verbatim");
        assert_eq!(PromptContext::render(&json!(42)), "42");
        assert_eq!(PromptContext::render(&json!(true)), "true");
        let rendered = PromptContext::render(&json!({"a": 1}));
        assert_eq!(rendered, "{\n  \"a\": 1\n}");
    }
}
