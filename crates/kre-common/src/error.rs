use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("invalid configuration for {context}: {message}")]
    InvalidConfig { context: String, message: String },
    #[error("unable to compile jsonPath \"{path}\" for {context}: {message}")]
    InvalidPath {
        context: String,
        path: String,
        message: String,
    },
    #[error("unknown converter \"{name}\" for {context}")]
    UnknownConverter { context: String, name: String },
    #[error("converter \"{name}\" cannot be used for metric values ({context})")]
    UnsupportedValueConverter { context: String, name: String },
    #[error("invalid filter regex \"{pattern}\" for {context}: {message}")]
    InvalidPattern {
        context: String,
        pattern: String,
        message: String,
    },
    #[error("unable to compile Kubernetes selector for {context}: {message}")]
    InvalidSelector { context: String, message: String },
    #[error("list request for {gvr} failed: {message}")]
    List { gvr: String, message: String },
    #[error("metric already registered: {0}")]
    DuplicateMetric(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExporterError {
    pub fn config(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            context: context.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
