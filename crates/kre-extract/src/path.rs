use std::fmt;

use serde_json::Value;
use serde_json_path::JsonPath;

/// A path compiled once at startup and evaluated against every document.
#[derive(Debug, Clone)]
pub struct PathExpression {
    raw: String,
    compiled: JsonPath,
}

/// Cardinality of a path evaluation. Only [`Match::One`] is usable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Match<'a> {
    None,
    One(&'a Value),
    Many(usize),
}

impl<'a> Match<'a> {
    pub fn single(self) -> Option<&'a Value> {
        match self {
            Self::One(value) => Some(value),
            Self::None | Self::Many(_) => None,
        }
    }
}

/// A matched value reduced to the scalar kinds metrics understand.
#[derive(Debug, Clone, PartialEq)]
pub enum RawScalar {
    Float(f64),
    Integer(i64),
    String(String),
    Bool(bool),
    Absent,
}

impl PathExpression {
    /// Compiles a path in either JSONPath or the relaxed kubectl form
    /// (`{.status.phase}`, `.status.phase`, `status.phase`).
    pub fn compile(raw: &str) -> Result<Self, String> {
        let normalized = normalize_relaxed(raw)?;
        let compiled = JsonPath::parse(&normalized).map_err(|err| err.to_string())?;
        Ok(Self {
            raw: raw.trim().to_string(),
            compiled,
        })
    }

    pub fn evaluate<'a>(&self, document: &'a Value) -> Match<'a> {
        let nodes = self.compiled.query(document);
        match nodes.len() {
            0 => Match::None,
            1 => nodes.first().map_or(Match::None, Match::One),
            count => Match::Many(count),
        }
    }

    pub fn scalar(&self, document: &Value) -> RawScalar {
        self.evaluate(document)
            .single()
            .map_or(RawScalar::Absent, RawScalar::from_value)
    }
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl RawScalar {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(number) => {
                if let Some(integer) = number.as_i64() {
                    Self::Integer(integer)
                } else {
                    number.as_f64().map_or(Self::Absent, Self::Float)
                }
            }
            Value::String(text) => Self::String(text.clone()),
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Null | Value::Array(_) | Value::Object(_) => Self::Absent,
        }
    }

    /// Text form used for label values: floats keep six fraction digits.
    pub fn label_text(&self) -> Option<String> {
        match self {
            Self::Float(value) => Some(format!("{value:.6}")),
            Self::Integer(value) => Some(value.to_string()),
            Self::String(text) => Some(text.clone()),
            Self::Bool(flag) => Some(flag.to_string()),
            Self::Absent => None,
        }
    }

    /// Numeric candidate plus the text the time parsers see.
    pub fn value_parts(&self) -> Option<(Option<f64>, String)> {
        match self {
            Self::Float(value) => Some((Some(*value), value.to_string())),
            Self::Integer(value) => Some((Some(*value as f64), value.to_string())),
            Self::String(text) => Some((text.parse::<f64>().ok(), text.clone())),
            Self::Bool(flag) => {
                let numeric = if *flag { 1.0 } else { 0.0 };
                Some((Some(numeric), numeric.to_string()))
            }
            Self::Absent => None,
        }
    }
}

fn normalize_relaxed(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let inner = match (trimmed.strip_prefix('{'), trimmed.ends_with('}')) {
        (Some(rest), true) => rest.strip_suffix('}').unwrap_or(rest).trim(),
        (None, false) => trimmed,
        _ => return Err("unbalanced braces".to_string()),
    };

    if inner.is_empty() {
        return Err("path is empty".to_string());
    }
    if inner.contains('{') || inner.contains('}') {
        return Err("templates with multiple expressions are not supported".to_string());
    }

    let normalized = if inner.starts_with('$') {
        inner.to_string()
    } else if inner.starts_with('.') || inner.starts_with('[') {
        format!("${inner}")
    } else {
        format!("$.{inner}")
    };
    Ok(bracket_escaped_members(&normalized))
}

/// Rewrites kubectl-style escaped members (`.app\.kubernetes\.io/name`) into
/// bracket notation (`['app.kubernetes.io/name']`). Quoted literals are kept.
fn bracket_escaped_members(path: &str) -> String {
    if !path.contains('\\') {
        return path.to_string();
    }

    let mut out = String::with_capacity(path.len() + 4);
    let mut chars = path.chars().peekable();
    let mut quote = None;
    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            out.push(ch);
            if ch == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if ch == open {
                quote = None;
            }
            continue;
        }

        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                out.push(ch);
            }
            '.' => {
                let descendant = chars.next_if_eq(&'.').is_some();
                let mut name = String::new();
                let mut escaped = false;
                while let Some(&next) = chars.peek() {
                    if next == '\\' {
                        chars.next();
                        if let Some(literal) = chars.next() {
                            name.push(literal);
                            escaped = true;
                        }
                    } else if is_member_end(next) {
                        break;
                    } else {
                        name.push(next);
                        chars.next();
                    }
                }

                if descendant {
                    out.push_str("..");
                } else if !escaped {
                    out.push('.');
                }
                if escaped {
                    out.push_str("['");
                    out.push_str(&name.replace('\\', "\\\\").replace('\'', "\\'"));
                    out.push_str("']");
                } else {
                    out.push_str(&name);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

fn is_member_end(ch: char) -> bool {
    matches!(
        ch,
        '.' | '[' | ']' | '(' | ')' | ' ' | '=' | '!' | '<' | '>' | '&' | '|' | ','
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Match, PathExpression, RawScalar, normalize_relaxed};

    #[test]
    fn relaxed_forms_normalize_to_rooted_paths() {
        assert_eq!(normalize_relaxed("{.status.phase}").unwrap(), "$.status.phase");
        assert_eq!(normalize_relaxed(" .status.phase ").unwrap(), "$.status.phase");
        assert_eq!(normalize_relaxed("status.phase").unwrap(), "$.status.phase");
        assert_eq!(normalize_relaxed("$.status").unwrap(), "$.status");
        assert_eq!(normalize_relaxed("[0]").unwrap(), "$[0]");
        assert!(normalize_relaxed("{.status").is_err());
        assert!(normalize_relaxed("{}").is_err());
        assert!(normalize_relaxed("").is_err());
    }

    #[test]
    fn escaped_dots_become_bracketed_members() {
        assert_eq!(
            normalize_relaxed(r"{.metadata.labels.app\.kubernetes\.io/name}").unwrap(),
            "$.metadata.labels['app.kubernetes.io/name']"
        );
        assert_eq!(
            normalize_relaxed(r"..annotations.example\.com/owner").unwrap(),
            "$..annotations['example.com/owner']"
        );
        assert_eq!(
            normalize_relaxed(r"$.spec[?(@.name=='a\.b')].value").unwrap(),
            r"$.spec[?(@.name=='a\.b')].value"
        );
    }

    #[test]
    fn escaped_label_key_resolves() {
        let path =
            PathExpression::compile(r"{.metadata.labels.app\.kubernetes\.io/name}").unwrap();
        let document = json!({
            "metadata": {"labels": {"app.kubernetes.io/name": "web", "app": "other"}}
        });
        assert_eq!(path.scalar(&document), RawScalar::String("web".to_string()));
    }

    #[test]
    fn invalid_syntax_fails_to_compile() {
        assert!(PathExpression::compile("$.status[").is_err());
    }

    #[test]
    fn missing_keys_yield_no_match() {
        let path = PathExpression::compile(".status.missing.deeper").unwrap();
        let document = json!({"status": {"phase": "Running"}});
        assert_eq!(path.evaluate(&document), Match::None);
        assert_eq!(path.scalar(&document), RawScalar::Absent);
    }

    #[test]
    fn filter_expression_selects_condition() {
        let path =
            PathExpression::compile("$.status.conditions[?(@.type=='Ready')].status").unwrap();
        let document = json!({
            "status": {"conditions": [
                {"type": "Scheduled", "status": "True"},
                {"type": "Ready", "status": "False"}
            ]}
        });
        assert_eq!(path.scalar(&document), RawScalar::String("False".to_string()));
    }

    #[test]
    fn multiple_matches_are_not_usable() {
        let path = PathExpression::compile("$.items[*].value").unwrap();
        let document = json!({"items": [{"value": 1}, {"value": 2}]});
        assert_eq!(path.evaluate(&document), Match::Many(2));
        assert_eq!(path.scalar(&document), RawScalar::Absent);
    }

    #[test]
    fn scalars_are_classified() {
        assert_eq!(RawScalar::from_value(&json!(3)), RawScalar::Integer(3));
        assert_eq!(RawScalar::from_value(&json!(1.5)), RawScalar::Float(1.5));
        assert_eq!(RawScalar::from_value(&json!(true)), RawScalar::Bool(true));
        assert_eq!(RawScalar::from_value(&json!(null)), RawScalar::Absent);
        assert_eq!(RawScalar::from_value(&json!({"a": 1})), RawScalar::Absent);
    }

    #[test]
    fn label_text_uses_fixed_precision_for_floats() {
        assert_eq!(RawScalar::Float(3.5).label_text().as_deref(), Some("3.500000"));
        assert_eq!(RawScalar::Integer(3).label_text().as_deref(), Some("3"));
        assert_eq!(RawScalar::Bool(false).label_text().as_deref(), Some("false"));
        assert_eq!(RawScalar::Absent.label_text(), None);
    }
}
