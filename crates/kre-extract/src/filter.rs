use regex::Regex;
use serde_json::Value;

use crate::path::PathExpression;

/// Inclusion predicate on one document.
#[derive(Debug, Clone)]
pub struct FilterRule {
    path: PathExpression,
    pattern: Option<Regex>,
}

impl FilterRule {
    pub fn new(path: PathExpression, pattern: Option<Regex>) -> Self {
        Self { path, pattern }
    }

    pub fn matches(&self, document: &Value) -> bool {
        let Some(value) = self.path.evaluate(document).single() else {
            return false;
        };

        let Some(text) = stringify(value) else {
            return false;
        };
        if text.is_empty() {
            return false;
        }

        self.pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(&text))
    }
}

/// Every rule must pass; no rules means the document is always included.
pub fn is_included(document: &Value, rules: &[FilterRule]) -> bool {
    rules.iter().all(|rule| rule.matches(document))
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) if number.is_f64() => number.as_f64().map(format_float),
        other => Some(other.to_string()),
    }
}

/// Shortest `%g`-style text: `1.0` is `1`, large or tiny magnitudes use an
/// exponent with at least two digits (`1e+06`, `2.5e-05`).
fn format_float(value: f64) -> String {
    let scientific = format!("{value:e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return value.to_string();
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return value.to_string();
    };

    let digits = mantissa.chars().filter(char::is_ascii_digit).count() as i32;
    let precision = if digits < 6 && digits > exponent {
        digits
    } else {
        6
    };
    if exponent < -4 || exponent >= precision {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        value.to_string()
    }
}
