use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    convert::ConversionChain,
    filter::{FilterRule, is_included},
    path::PathExpression,
};

/// Where a metric value or label value comes from.
#[derive(Debug, Clone)]
pub enum Extractor<T> {
    Literal(T),
    Derived {
        path: PathExpression,
        chain: ConversionChain,
        fallback: Option<T>,
    },
}

pub type ValueExtractor = Extractor<f64>;
pub type LabelExtractor = Extractor<String>;

impl ValueExtractor {
    pub fn extract(&self, document: &Value) -> Option<f64> {
        match self {
            Self::Literal(value) => Some(*value),
            Self::Derived {
                path,
                chain,
                fallback,
            } => path
                .scalar(document)
                .value_parts()
                .and_then(|(candidate, text)| chain.apply_value(candidate, &text))
                .or(*fallback),
        }
    }
}

impl LabelExtractor {
    /// A path that matches nothing keeps the default; a chain that fails
    /// yields an empty label value.
    pub fn extract(&self, document: &Value) -> String {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Derived {
                path,
                chain,
                fallback,
            } => match path.scalar(document).label_text() {
                Some(text) => chain.apply_label(text).unwrap_or_default(),
                None => fallback.clone().unwrap_or_default(),
            },
        }
    }
}

/// Label names attached to every metric, each omitted when empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseLabels {
    pub gvr: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl BaseLabels {
    pub fn new(gvr: &str, namespace: &str, name: &str) -> Self {
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        Self {
            gvr: non_empty(gvr),
            namespace: non_empty(namespace),
            name: non_empty(name),
        }
    }

    pub fn names(&self) -> Vec<String> {
        [&self.gvr, &self.namespace, &self.name]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn values(&self, document: &Value) -> Vec<String> {
        let mut values = Vec::with_capacity(3);
        if self.gvr.is_some() {
            values.push(document_gvk(document));
        }
        if self.namespace.is_some() {
            values.push(metadata_field(document, "namespace"));
        }
        if self.name.is_some() {
            values.push(metadata_field(document, "name"));
        }
        values
    }
}

/// Outcome of evaluating one metric against one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Excluded,
    NoValue,
    Sample { label_values: Vec<String>, value: f64 },
}

#[derive(Debug, Clone)]
pub struct MetricDefinition {
    pub name: String,
    pub help: String,
    pub value: ValueExtractor,
    /// Sorted by label name; the order matches [`MetricDefinition::label_names`].
    pub labels: Vec<(String, LabelExtractor)>,
    pub filters: Vec<FilterRule>,
}

impl MetricDefinition {
    pub fn label_names(&self, base: &BaseLabels) -> Vec<String> {
        let mut names = base.names();
        names.extend(self.labels.iter().map(|(name, _)| name.clone()));
        names
    }

    pub fn evaluate(&self, document: &Value, base: &BaseLabels) -> Evaluation {
        if !is_included(document, &self.filters) {
            return Evaluation::Excluded;
        }

        let Some(value) = self.value.extract(document) else {
            return Evaluation::NoValue;
        };

        let mut label_values = base.values(document);
        label_values.extend(self.labels.iter().map(|(_, label)| label.extract(document)));

        Evaluation::Sample {
            label_values,
            value,
        }
    }
}

fn metadata_field(document: &Value, field: &str) -> String {
    document
        .get("metadata")
        .and_then(|metadata| metadata.get(field))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// `group/version/Kind` read from the document's own `apiVersion` and `kind`.
fn document_gvk(document: &Value) -> String {
    let api_version = document
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let kind = document
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
    format!("{group}/{version}/{kind}")
}
