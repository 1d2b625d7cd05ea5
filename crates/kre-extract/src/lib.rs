pub mod compiler;
pub mod config;
pub mod convert;
pub mod filter;
pub mod metric;
pub mod path;
pub mod selector;

pub use compiler::{CompileOptions, CompiledConfig, ResourceSelector, compile};
pub use config::RawConfig;
pub use convert::{ConversionChain, Converter};
pub use filter::{FilterRule, is_included};
pub use metric::{BaseLabels, Evaluation, Extractor, MetricDefinition};
pub use path::{Match, PathExpression, RawScalar};
