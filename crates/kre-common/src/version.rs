pub const APP_NAME: &str = "kube-resource-exporter";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const USER_AGENT: &str = concat!("kube-resource-exporter/", env!("CARGO_PKG_VERSION"));

/// Bumped whenever the cached sample layout or extraction semantics change,
/// so caches written by older builds are never restored.
pub const CACHE_VERSION: &str = "v2";
