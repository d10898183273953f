//! Builder fluente de expectativas (`ctx.expect(...)`).
//!
//! Cada matcher produz exatamente uma assertion soft, roteada pela mesma
//! pipeline de `ctx.assert` (mesmos contadores, mesmo formato de evento).
//! `.not()` inverte o matcher seguinte:
//!
//! ```ignore
//! ctx.expect(response.status()).to_be(200);
//! ctx.expect(body["items"].clone()).not().to_have_length(0);
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Mutex;

use super::Ctx;

// Cache de regexes já compiladas para `to_match` repetido em loops.
static REGEX_CACHE: Lazy<Mutex<Vec<(String, Regex)>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn cached_regex(pattern: &str) -> Option<Regex> {
    let mut cache = REGEX_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some((_, re)) = cache.iter().find(|(p, _)| p == pattern) {
        return Some(re.clone());
    }
    match Regex::new(pattern) {
        Ok(re) => {
            cache.push((pattern.to_string(), re.clone()));
            Some(re)
        }
        Err(_) => None,
    }
}

/// Renderização curta de um valor para mensagens de assertion.
fn short(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.len() > 120 {
        let mut cut = 117;
        while cut > 0 && !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &rendered[..cut])
    } else {
        rendered
    }
}

/// Truthiness no modelo JSON: `null`, `false`, `0` e `""` são falsos.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Uma expectativa pendente sobre um valor.
pub struct Expectation {
    ctx: Ctx,
    actual: Value,
    negated: bool,
}

impl Expectation {
    pub(crate) fn new(ctx: Ctx, actual: Value) -> Self {
        Self {
            ctx,
            actual,
            negated: false,
        }
    }

    /// Inverte o matcher seguinte.
    pub fn not(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    fn record(self, passed: bool, description: &str, expected: Option<Value>) {
        let passed = passed != self.negated;
        let message = if self.negated {
            format!("expected {} not {}", short(&self.actual), description)
        } else {
            format!("expected {} {}", short(&self.actual), description)
        };
        self.ctx
            .record_assertion(passed, Some(message), Some(self.actual), expected);
    }

    /// Igualdade estrita de valor.
    pub fn to_be(self, expected: impl Into<Value>) {
        let expected = expected.into();
        let passed = self.actual == expected;
        let description = format!("to be {}", short(&expected));
        self.record(passed, &description, Some(expected));
    }

    /// Igualdade estrutural profunda (alias de valor para JSON).
    pub fn to_equal(self, expected: impl Into<Value>) {
        let expected = expected.into();
        let passed = self.actual == expected;
        let description = format!("to equal {}", short(&expected));
        self.record(passed, &description, Some(expected));
    }

    /// String contém substring, array contém o elemento, objeto contém a
    /// chave.
    pub fn to_contain(self, needle: impl Into<Value>) {
        let needle = needle.into();
        let passed = match (&self.actual, &needle) {
            (Value::String(haystack), Value::String(n)) => haystack.contains(n.as_str()),
            (Value::Array(items), n) => items.contains(n),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        };
        let description = format!("to contain {}", short(&needle));
        self.record(passed, &description, Some(needle));
    }

    /// Valor string casa com a regex.
    pub fn to_match(self, pattern: &str) {
        let passed = match (self.actual.as_str(), cached_regex(pattern)) {
            (Some(s), Some(re)) => re.is_match(s),
            _ => false,
        };
        let description = format!("to match /{}/", pattern);
        self.record(passed, &description, Some(Value::String(pattern.to_string())));
    }

    pub fn to_be_greater_than(self, expected: f64) {
        let passed = self.actual.as_f64().map(|a| a > expected).unwrap_or(false);
        let description = format!("to be greater than {}", expected);
        self.record(passed, &description, Some(Value::from(expected)));
    }

    pub fn to_be_less_than(self, expected: f64) {
        let passed = self.actual.as_f64().map(|a| a < expected).unwrap_or(false);
        let description = format!("to be less than {}", expected);
        self.record(passed, &description, Some(Value::from(expected)));
    }

    /// Comprimento de string (chars), array ou objeto.
    pub fn to_have_length(self, expected: usize) {
        let length = match &self.actual {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            Value::Object(map) => Some(map.len()),
            _ => None,
        };
        let passed = length == Some(expected);
        let description = format!("to have length {}", expected);
        self.record(passed, &description, Some(Value::from(expected as u64)));
    }

    pub fn to_be_truthy(self) {
        let passed = is_truthy(&self.actual);
        self.record(passed, "to be truthy", None);
    }

    pub fn to_be_null(self) {
        let passed = self.actual.is_null();
        self.record(passed, "to be null", None);
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::protocol::TimelineEvent;
    use crate::runtime::testutil::ctx_with_sink;
    use serde_json::json;

    fn last_assertion(sink: &crate::runtime::MemorySink) -> (bool, String) {
        match sink.events().last().cloned() {
            Some(TimelineEvent::Assertion {
                passed, message, ..
            }) => (passed, message.unwrap_or_default()),
            other => panic!("expected assertion event, got {other:?}"),
        }
    }

    #[test]
    fn test_to_be_pass_and_fail() {
        let (ctx, sink) = ctx_with_sink();
        ctx.expect(200).to_be(200);
        assert!(last_assertion(&sink).0);

        ctx.expect(404).to_be(200);
        let (passed, message) = last_assertion(&sink);
        assert!(!passed);
        assert_eq!(message, "expected 404 to be 200");
        assert_eq!(ctx.summary_data().assertion_total, 2);
        assert_eq!(ctx.summary_data().assertion_failed, 1);
    }

    #[test]
    fn test_negation() {
        let (ctx, sink) = ctx_with_sink();
        ctx.expect(404).not().to_be(200);
        let (passed, message) = last_assertion(&sink);
        assert!(passed);
        assert!(message.starts_with("expected 404 not to be"));
    }

    #[test]
    fn test_to_equal_deep() {
        let (ctx, sink) = ctx_with_sink();
        ctx.expect(json!({"a": [1, 2]})).to_equal(json!({"a": [1, 2]}));
        assert!(last_assertion(&sink).0);

        ctx.expect(json!({"a": [1, 2]})).to_equal(json!({"a": [2, 1]}));
        assert!(!last_assertion(&sink).0);
    }

    #[test]
    fn test_to_contain_variants() {
        let (ctx, sink) = ctx_with_sink();
        ctx.expect("hello world").to_contain("world");
        assert!(last_assertion(&sink).0);

        ctx.expect(json!([1, 2, 3])).to_contain(2);
        assert!(last_assertion(&sink).0);

        ctx.expect(json!({"token": "x"})).to_contain("token");
        assert!(last_assertion(&sink).0);

        ctx.expect(json!(42)).to_contain(4);
        assert!(!last_assertion(&sink).0, "number has no containment");
    }

    #[test]
    fn test_to_match_regex() {
        let (ctx, sink) = ctx_with_sink();
        ctx.expect("user-123").to_match(r"^user-\d+$");
        assert!(last_assertion(&sink).0);

        ctx.expect("user-abc").to_match(r"^user-\d+$");
        assert!(!last_assertion(&sink).0);

        // Regex inválida nunca passa (e nunca derruba o teste).
        ctx.expect("anything").to_match("(unclosed");
        assert!(!last_assertion(&sink).0);
    }

    #[test]
    fn test_numeric_comparisons() {
        let (ctx, sink) = ctx_with_sink();
        ctx.expect(10).to_be_greater_than(5.0);
        assert!(last_assertion(&sink).0);

        ctx.expect(10).to_be_less_than(5.0);
        assert!(!last_assertion(&sink).0);

        ctx.expect("not a number").to_be_greater_than(0.0);
        assert!(!last_assertion(&sink).0);
    }

    #[test]
    fn test_to_have_length() {
        let (ctx, sink) = ctx_with_sink();
        ctx.expect(json!([1, 2, 3])).to_have_length(3);
        assert!(last_assertion(&sink).0);

        ctx.expect("abc").to_have_length(3);
        assert!(last_assertion(&sink).0);

        ctx.expect(json!({"a": 1})).to_have_length(2);
        assert!(!last_assertion(&sink).0);
    }

    #[test]
    fn test_truthiness() {
        let (ctx, sink) = ctx_with_sink();
        for value in [json!(0), json!(""), json!(false), json!(null)] {
            ctx.expect(value.clone()).to_be_truthy();
            assert!(!last_assertion(&sink).0, "{value} should be falsy");
        }
        for value in [json!(1), json!("x"), json!(true), json!([]), json!({})] {
            ctx.expect(value.clone()).to_be_truthy();
            assert!(last_assertion(&sink).0, "{value} should be truthy");
        }
    }

    #[test]
    fn test_to_be_null() {
        let (ctx, sink) = ctx_with_sink();
        ctx.expect(json!(null)).to_be_null();
        assert!(last_assertion(&sink).0);

        ctx.expect(json!(0)).not().to_be_null();
        assert!(last_assertion(&sink).0);
    }
}
