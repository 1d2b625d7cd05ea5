//! Renders a `metav1.LabelSelector` into the query-string form accepted by
//! the `labelSelector` list parameter.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::{RawLabelSelector, RawLabelSelectorRequirement};

static NAME_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("label name pattern")
});

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("dns subdomain pattern")
});

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// `Ok(None)` for a selector that selects everything.
pub fn compile_label_selector(selector: &RawLabelSelector) -> Result<Option<String>, String> {
    let mut requirements: Vec<(String, String)> = Vec::new();

    for (key, value) in &selector.match_labels {
        validate_key(key)?;
        validate_value(key, value)?;
        requirements.push((key.clone(), format!("{key}={value}")));
    }

    for requirement in &selector.match_expressions {
        requirements.push((requirement.key.clone(), render_requirement(requirement)?));
    }

    if requirements.is_empty() {
        return Ok(None);
    }

    requirements.sort_by(|left, right| left.0.cmp(&right.0));
    let rendered = requirements
        .into_iter()
        .map(|(_, rendered)| rendered)
        .collect::<Vec<_>>()
        .join(",");
    Ok(Some(rendered))
}

fn render_requirement(requirement: &RawLabelSelectorRequirement) -> Result<String, String> {
    let key = requirement.key.as_str();
    validate_key(key)?;

    match requirement.operator.as_str() {
        "In" | "NotIn" => {
            if requirement.values.is_empty() {
                return Err(format!(
                    "operator {} on key \"{key}\" requires at least one value",
                    requirement.operator
                ));
            }
            let mut values = requirement.values.clone();
            for value in &values {
                validate_value(key, value)?;
            }
            values.sort();
            values.dedup();
            let keyword = if requirement.operator == "In" {
                "in"
            } else {
                "notin"
            };
            Ok(format!("{key} {keyword} ({})", values.join(",")))
        }
        "Exists" | "DoesNotExist" => {
            if !requirement.values.is_empty() {
                return Err(format!(
                    "operator {} on key \"{key}\" must not have values",
                    requirement.operator
                ));
            }
            if requirement.operator == "Exists" {
                Ok(key.to_string())
            } else {
                Ok(format!("!{key}"))
            }
        }
        other => Err(format!("\"{other}\" is not a valid label selector operator")),
    }
}

fn validate_key(key: &str) -> Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix
        && (prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN || !DNS_SUBDOMAIN.is_match(prefix))
    {
        return Err(format!("invalid label key prefix in \"{key}\""));
    }

    if name.is_empty() || name.len() > MAX_NAME_LEN || !NAME_PART.is_match(name) {
        return Err(format!("invalid label key \"{key}\""));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LEN || !NAME_PART.is_match(value) {
        return Err(format!("invalid value \"{value}\" for label key \"{key}\""));
    }
    Ok(())
}
