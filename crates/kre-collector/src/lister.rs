use async_trait::async_trait;
use kre_common::{error::Result, types::GroupVersionResource};
use serde_json::Value;

/// Query parameters for one page of a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub limit: Option<u64>,
    pub continue_token: Option<String>,
}

/// One page of documents. An absent or empty continuation token ends paging.
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub items: Vec<Value>,
    pub continue_token: Option<String>,
}

impl ResourceList {
    pub fn next_token(&self) -> Option<&str> {
        self.continue_token
            .as_deref()
            .filter(|token| !token.is_empty())
    }
}

#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list(&self, gvr: &GroupVersionResource, options: &ListOptions)
    -> Result<ResourceList>;
}
