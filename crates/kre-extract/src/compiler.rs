use std::{
    collections::{BTreeMap, HashSet},
    sync::LazyLock,
};

use kre_common::{
    error::{ExporterError, Result},
    types::GroupVersionResource,
};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::{
    config::{RawConfig, RawFilter, RawLabel, RawMetric, RawResource, RawValue},
    convert::ConversionChain,
    filter::FilterRule,
    metric::{BaseLabels, Extractor, LabelExtractor, MetricDefinition, ValueExtractor},
    path::PathExpression,
    selector::compile_label_selector,
};

static METRIC_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("metric name pattern")
});

static LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name pattern"));

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub base_labels: BaseLabels,
}

/// One resource kind to list, with the metrics derived from it.
#[derive(Debug, Clone)]
pub struct ResourceSelector {
    pub gvr: GroupVersionResource,
    pub label_selector: Option<String>,
    pub metrics: Vec<MetricDefinition>,
}

/// Immutable result of a successful compile, shared by every collection task.
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub resources: Vec<ResourceSelector>,
    pub base_labels: BaseLabels,
    canonical: String,
}

impl CompiledConfig {
    /// Canonical JSON of the effective configuration, the input of the cache tag.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn metrics(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.resources
            .iter()
            .flat_map(|resource| resource.metrics.iter())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalForm<'a> {
    base_labels: &'a BaseLabels,
    config: &'a RawConfig,
}

/// Compiles every resource and metric in declaration order. The first
/// error aborts the whole compile.
pub fn compile(raw: &RawConfig, options: &CompileOptions) -> Result<CompiledConfig> {
    let base_label_names = options.base_labels.names();
    for name in &base_label_names {
        if !LABEL_NAME.is_match(name) {
            return Err(ExporterError::config(
                "base labels",
                format!("\"{name}\" is not a valid label name"),
            ));
        }
    }
    if has_duplicates(&base_label_names) {
        return Err(ExporterError::config(
            "base labels",
            "gvr, namespace and name labels must be distinct",
        ));
    }

    let mut seen_metrics = HashSet::new();
    let mut resources = Vec::with_capacity(raw.resources.len());
    for resource in &raw.resources {
        resources.push(compile_resource(
            resource,
            &base_label_names,
            &mut seen_metrics,
        )?);
    }

    let canonical = serde_json::to_string(&CanonicalForm {
        base_labels: &options.base_labels,
        config: raw,
    })
    .map_err(|err| ExporterError::InternalError(format!("failed to encode configuration: {err}")))?;

    Ok(CompiledConfig {
        resources,
        base_labels: options.base_labels.clone(),
        canonical,
    })
}

fn compile_resource(
    raw: &RawResource,
    base_label_names: &[String],
    seen_metrics: &mut HashSet<String>,
) -> Result<ResourceSelector> {
    let gvr = GroupVersionResource::new(
        raw.group.trim(),
        raw.version.trim(),
        raw.resource.trim(),
    );
    let context = format!("resource \"{gvr}\"");

    if gvr.version.is_empty() {
        return Err(ExporterError::config(&context, "version must be set"));
    }
    if gvr.resource.is_empty() {
        return Err(ExporterError::config(&context, "resource must be set"));
    }

    let label_selector = match &raw.selector {
        Some(selector) => compile_label_selector(selector).map_err(|message| {
            ExporterError::InvalidSelector {
                context: context.clone(),
                message,
            }
        })?,
        None => None,
    };

    let mut metrics = Vec::with_capacity(raw.metrics.len());
    for metric in &raw.metrics {
        let compiled = compile_metric(metric, &gvr, base_label_names)?;
        if !seen_metrics.insert(compiled.name.clone()) {
            return Err(ExporterError::DuplicateMetric(compiled.name));
        }
        metrics.push(compiled);
    }

    debug!(
        gvr = %gvr,
        selector = label_selector.as_deref().unwrap_or("<none>"),
        metrics = metrics.len(),
        "compiled resource"
    );

    Ok(ResourceSelector {
        gvr,
        label_selector,
        metrics,
    })
}

fn compile_metric(
    raw: &RawMetric,
    gvr: &GroupVersionResource,
    base_label_names: &[String],
) -> Result<MetricDefinition> {
    let name = raw.name.trim();
    if name.is_empty() {
        return Err(ExporterError::config(
            format!("resource \"{gvr}\""),
            "metric name must be set",
        ));
    }

    let context = format!("metric \"{name}\" (resource \"{gvr}\")");
    if !METRIC_NAME.is_match(name) {
        return Err(ExporterError::config(&context, "metric name is not a valid Prometheus name"));
    }

    let value = compile_value(&raw.value, &context)?;

    let mut labels = Vec::with_capacity(raw.labels.len());
    for (label_name, label) in &raw.labels {
        let label_context = format!("label \"{label_name}\" of {context}");
        if !LABEL_NAME.is_match(label_name) || label_name.starts_with("__") {
            return Err(ExporterError::config(&label_context, "invalid label name"));
        }
        if base_label_names.iter().any(|base| base == label_name) {
            return Err(ExporterError::config(
                &label_context,
                "label name collides with a base label",
            ));
        }
        labels.push((label_name.clone(), compile_label(label, &label_context)?));
    }

    let filters = raw
        .filters
        .iter()
        .enumerate()
        .map(|(index, filter)| {
            compile_filter(filter, &format!("filter #{} of {context}", index + 1))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(MetricDefinition {
        name: name.to_string(),
        help: raw.help.clone(),
        value,
        labels,
        filters,
    })
}

fn compile_value(raw: &RawValue, context: &str) -> Result<ValueExtractor> {
    let chain = ConversionChain::compile_value(&raw.convert, context)?;
    match non_empty(raw.json_path.as_deref()) {
        Some(path) => Ok(Extractor::Derived {
            path: compile_path(path, context)?,
            chain,
            fallback: raw.value,
        }),
        None => raw.value.map(Extractor::Literal).ok_or_else(|| {
            ExporterError::config(context, "value needs either jsonPath or a literal value")
        }),
    }
}

fn compile_label(raw: &RawLabel, context: &str) -> Result<LabelExtractor> {
    let chain = ConversionChain::compile_label(&raw.convert, context)?;
    match non_empty(raw.json_path.as_deref()) {
        Some(path) => Ok(Extractor::Derived {
            path: compile_path(path, context)?,
            chain,
            fallback: raw.value.clone(),
        }),
        None => Ok(Extractor::Literal(raw.value.clone().unwrap_or_default())),
    }
}

fn compile_filter(raw: &RawFilter, context: &str) -> Result<FilterRule> {
    let Some(path) = non_empty(Some(raw.json_path.as_str())) else {
        return Err(ExporterError::config(context, "jsonPath must be set for filters"));
    };
    let path = compile_path(path, context)?;

    let pattern = match non_empty(raw.regex.as_deref()) {
        Some(pattern) => Some(Regex::new(pattern).map_err(|err| ExporterError::InvalidPattern {
            context: context.to_string(),
            pattern: pattern.to_string(),
            message: err.to_string(),
        })?),
        None => None,
    };

    Ok(FilterRule::new(path, pattern))
}

fn compile_path(path: &str, context: &str) -> Result<PathExpression> {
    PathExpression::compile(path).map_err(|message| ExporterError::InvalidPath {
        context: context.to_string(),
        path: path.to_string(),
        message,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn has_duplicates(names: &[String]) -> bool {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for name in names {
        *counts.entry(name.as_str()).or_default() += 1;
    }
    counts.values().any(|count| *count > 1)
}
