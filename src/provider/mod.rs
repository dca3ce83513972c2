//! Provider abstraction: the cloud API the executor drives.
//!
//! Every call is given fully resolved attributes; providers never see
//! references.

pub mod memory;

use crate::core::types::{AttrValue, ResourceKind};
use async_trait::async_trait;
use indexmap::IndexMap;

pub use memory::InMemoryProvider;

/// Result of creating a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    /// Physical identifier assigned by the provider
    pub instance_id: String,
    /// Values other nodes may reference, keyed by output name
    pub outputs: IndexMap<String, AttrValue>,
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create(
        &self,
        node_id: &str,
        kind: ResourceKind,
        attributes: &IndexMap<String, AttrValue>,
    ) -> Result<Provisioned, String>;

    /// Update in place. Returns the resource's outputs afterwards.
    async fn update(
        &self,
        node_id: &str,
        kind: ResourceKind,
        instance_id: &str,
        attributes: &IndexMap<String, AttrValue>,
    ) -> Result<IndexMap<String, AttrValue>, String>;

    async fn destroy(&self, node_id: &str, kind: ResourceKind, instance_id: &str) -> Result<(), String>;
}
