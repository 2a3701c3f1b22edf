//! Match-rule evaluators and the registry that dispatches to them by kind.
//!
//! Handler rules name an evaluator kind (`equals`, `contains`, ...). The
//! registry resolves the kind to an evaluator; unknown or missing kinds fall
//! back to the registry default instead of failing.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// Kind name of the built-in equality evaluator.
pub const EQUALS: &str = "equals";
/// Kind name of the built-in containment evaluator.
pub const CONTAINS: &str = "contains";

/// Strategy deciding whether a record value satisfies a rule.
pub trait Evaluator: Send + Sync {
    /// `actual` is the resolved record value, `expected` the configured rule value.
    fn matches(&self, actual: &Value, expected: &Value) -> bool;
}

/// Closures work as evaluators.
impl<F> Evaluator for F
where
    F: Fn(&Value, &Value) -> bool + Send + Sync,
{
    fn matches(&self, actual: &Value, expected: &Value) -> bool {
        self(actual, expected)
    }
}

/// Exact equality. Scalars compare by their textual form, so a YAML rule
/// value `42` matches a record value `"42"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EqualsEvaluator;

impl Evaluator for EqualsEvaluator {
    fn matches(&self, actual: &Value, expected: &Value) -> bool {
        if actual == expected {
            return true;
        }

        match (scalar_text(actual), scalar_text(expected)) {
            (Some(a), Some(e)) => a == e,
            _ => false,
        }
    }
}

/// Substring test for strings, membership for arrays, key presence for maps.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainsEvaluator;

impl Evaluator for ContainsEvaluator {
    fn matches(&self, actual: &Value, expected: &Value) -> bool {
        match actual {
            Value::String(text) => scalar_text(expected)
                .map(|needle| text.contains(needle.as_str()))
                .unwrap_or(false),
            Value::Array(items) => items
                .iter()
                .any(|item| EqualsEvaluator.matches(item, expected)),
            Value::Object(map) => scalar_text(expected)
                .map(|key| map.contains_key(&key))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Text form of a scalar value; `None` for null, arrays and maps.
pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Registry of evaluators keyed by rule kind.
pub struct EvaluatorRegistry {
    evaluators: HashMap<String, Box<dyn Evaluator>>,
    default: Box<dyn Evaluator>,
}

impl EvaluatorRegistry {
    /// Create an empty registry with an explicit default evaluator.
    pub fn new(default: Box<dyn Evaluator>) -> Self {
        Self {
            evaluators: HashMap::new(),
            default,
        }
    }

    /// Registry with `equals` (also the default) and `contains` registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new(Box::new(EqualsEvaluator));
        registry.register(EQUALS, Box::new(EqualsEvaluator));
        registry.register(CONTAINS, Box::new(ContainsEvaluator));
        registry
    }

    /// Register an evaluator; an existing registration for `kind` is replaced.
    pub fn register(&mut self, kind: impl Into<String>, evaluator: Box<dyn Evaluator>) {
        self.evaluators.insert(kind.into(), evaluator);
    }

    /// Evaluator for `kind`, or the default when the kind is absent or unknown.
    pub fn lookup(&self, kind: Option<&str>) -> &dyn Evaluator {
        kind.and_then(|k| self.evaluators.get(k))
            .map(|e| e.as_ref())
            .unwrap_or(self.default.as_ref())
    }

    pub fn has_evaluator(&self, kind: &str) -> bool {
        self.evaluators.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.evaluators.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equals_scalars() {
        let eq = EqualsEvaluator;

        assert!(eq.matches(&json!("sales"), &json!("sales")));
        assert!(eq.matches(&json!("42"), &json!(42)));
        assert!(eq.matches(&json!(true), &json!("true")));
        assert!(!eq.matches(&json!("sales"), &json!("ops")));
        assert!(!eq.matches(&Value::Null, &json!("null")));
    }

    #[test]
    fn test_contains_variants() {
        let contains = ContainsEvaluator;

        assert!(contains.matches(&json!("/app:company_home/sites"), &json!("company_home")));
        assert!(contains.matches(&json!(["a", "b"]), &json!("b")));
        assert!(contains.matches(&json!([1, 2]), &json!("2")));
        assert!(contains.matches(&json!({"cm:name": "x"}), &json!("cm:name")));
        assert!(!contains.matches(&json!("abc"), &json!("z")));
        assert!(!contains.matches(&json!(12), &json!("1")));
    }

    #[test]
    fn test_lookup_falls_back_to_default() {
        let registry = EvaluatorRegistry::with_builtins();

        // "contains" semantics would match, equals does not
        assert!(registry.lookup(Some(CONTAINS)).matches(&json!("abc"), &json!("b")));
        assert!(!registry.lookup(Some("regex")).matches(&json!("abc"), &json!("b")));
        assert!(!registry.lookup(None).matches(&json!("abc"), &json!("b")));
        assert!(registry.lookup(None).matches(&json!("abc"), &json!("abc")));
    }

    #[test]
    fn test_register_overwrites_silently() {
        let mut registry = EvaluatorRegistry::with_builtins();
        registry.register(EQUALS, Box::new(|_: &Value, _: &Value| true));

        assert!(registry.lookup(Some(EQUALS)).matches(&json!(1), &json!(2)));
        assert_eq!(registry.kinds(), vec![CONTAINS, EQUALS]);
    }

    #[test]
    fn test_custom_evaluator() {
        let mut registry = EvaluatorRegistry::default();
        registry.register(
            "prefix",
            Box::new(|actual: &Value, expected: &Value| {
                match (actual.as_str(), expected.as_str()) {
                    (Some(a), Some(e)) => a.starts_with(e),
                    _ => false,
                }
            }),
        );

        assert!(registry.has_evaluator("prefix"));
        assert!(registry.lookup(Some("prefix")).matches(&json!("/sites/x"), &json!("/sites")));
    }
}
