use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

const REDACTED: &str = "[REDACTED]";

/// Ordered: JWTs before bearer tokens, `sk-ant-` before `sk-`.
static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
            "[REDACTED_JWT]",
        ),
        (r"sk-ant-[A-Za-z0-9_-]{16,}", "[REDACTED_API_KEY]"),
        (r"sk-[A-Za-z0-9_-]{16,}", "[REDACTED_API_KEY]"),
        (r"gh[pousr]_[A-Za-z0-9]{20,}", "[REDACTED_API_KEY]"),
        (r"AKIA[0-9A-Z]{16}", "[REDACTED_API_KEY]"),
        (r"xox[baprs]-[A-Za-z0-9-]{10,}", "[REDACTED_TOKEN]"),
        (
            r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}",
            "Bearer [REDACTED_TOKEN]",
        ),
        (
            r#"(?i)\b(api[_-]?key|access[_-]?token|token|secret|password)(\s*[:=]\s*)["']?[^\s"',;]{6,}["']?"#,
            "${1}${2}[REDACTED]",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

const SECRET_KEY_SUFFIXES: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "private_key",
    "access_key",
];

/// Pattern-based secret redaction for ledger text and JSON payloads.
///
/// Also strips control characters (except newline, tab and carriage return)
/// so that redacted text cannot poison line-oriented logs.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    extra_keys: Vec<String>,
}

impl Redactor {
    /// Create a redactor with the built-in rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally treat JSON object keys ending in `key` as secrets.
    pub fn with_secret_key(mut self, key: impl Into<String>) -> Self {
        self.extra_keys.push(key.into().to_ascii_lowercase());
        self
    }

    /// Redact secrets from free text.
    pub fn redact_text(&self, input: &str) -> String {
        let mut out: String = input
            .chars()
            .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
            .collect();
        for (re, replacement) in SECRET_PATTERNS.iter() {
            if re.is_match(&out) {
                out = re.replace_all(&out, *replacement).into_owned();
            }
        }
        out
    }

    /// Redact secrets from a JSON value, recursively.
    ///
    /// Values stored under secret-looking keys are replaced wholesale; every
    /// other string is passed through [`Redactor::redact_text`].
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_text(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let redacted = if self.is_secret_key(k) && !v.is_null() {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.redact_value(v)
                        };
                        (k.clone(), redacted)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn is_secret_key(&self, key: &str) -> bool {
        let normalized = key.to_ascii_lowercase().replace('-', "_");
        SECRET_KEY_SUFFIXES
            .iter()
            .any(|suffix| normalized.ends_with(suffix))
            || self.extra_keys.iter().any(|k| normalized.ends_with(k.as_str()))
    }
}
