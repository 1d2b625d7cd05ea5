pub mod error;
pub mod types;
pub mod version;

pub use error::{ExporterError, Result};
pub use types::GroupVersionResource;
pub use version::{APP_NAME, APP_VERSION, CACHE_VERSION, USER_AGENT};
