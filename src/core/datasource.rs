//! Data source resolution: read-only external lookups.
//!
//! Lookups run once, before the resource graph is built, against an injected
//! [`DataSourceBackend`]. The resulting [`DataSourceResult`] is immutable and shared
//! for the lifetime of one plan.

use super::error::ResolveError;
use super::types::AttrValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Locator of another stack's published outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteStateRef {
    pub bucket: String,
    pub key: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-east-2".to_string()
}

impl RemoteStateRef {
    /// Stable lookup key, `bucket/key`.
    pub fn locator(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

impl fmt::Display for RemoteStateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{} ({})", self.bucket, self.key, self.region)
    }
}

/// Which network a subnet lookup targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkSelector {
    /// Result key of an earlier `default_network` lookup
    Lookup(String),
    /// Literal network id
    Id(String),
}

/// One read-only lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "lookup", rename_all = "snake_case")]
pub enum LookupRequest {
    DefaultNetwork {
        key: String,
    },
    SubnetsForNetwork {
        key: String,
        network: NetworkSelector,
    },
    CrossStackOutput {
        /// Outputs land under `<prefix>_<output>`
        prefix: String,
        remote: RemoteStateRef,
        #[serde(default = "default_required_outputs")]
        required: Vec<String>,
    },
}

fn default_required_outputs() -> Vec<String> {
    vec!["address".to_string(), "port".to_string()]
}

impl LookupRequest {
    /// Result keys this lookup is expected to produce (before cross-stack expansion).
    pub fn name(&self) -> String {
        match self {
            Self::DefaultNetwork { key } | Self::SubnetsForNetwork { key, .. } => key.clone(),
            Self::CrossStackOutput { prefix, .. } => format!("{}_*", prefix),
        }
    }
}

/// A network as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub id: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Read-only view of the provider's network inventory and remote state storage.
pub trait DataSourceBackend: Send + Sync {
    fn networks(&self) -> Result<Vec<NetworkInfo>, String>;

    fn subnets(&self, network_id: &str) -> Result<Vec<String>, String>;

    fn remote_outputs(&self, remote: &RemoteStateRef) -> Result<IndexMap<String, AttrValue>, String>;
}

/// Resolved lookups for one plan. Cloning shares the same immutable map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSourceResult {
    values: Arc<IndexMap<String, AttrValue>>,
}

impl DataSourceResult {
    pub fn new(values: IndexMap<String, AttrValue>) -> Self {
        Self {
            values: Arc::new(values),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Resolve every lookup, in declaration order. Any failure aborts the whole set.
pub fn resolve_all(
    requests: &[LookupRequest],
    backend: &dyn DataSourceBackend,
) -> Result<DataSourceResult, ResolveError> {
    let mut values: IndexMap<String, AttrValue> = IndexMap::new();

    for request in requests {
        match request {
            LookupRequest::DefaultNetwork { key } => {
                let id = resolve_default_network(key, backend)?;
                debug!(lookup = %key, network = %id, "resolved default network");
                insert_unique(&mut values, key, AttrValue::Str(id))?;
            }
            LookupRequest::SubnetsForNetwork { key, network } => {
                let network_id = match network {
                    NetworkSelector::Id(id) => id.clone(),
                    NetworkSelector::Lookup(from) => values
                        .get(from)
                        .and_then(AttrValue::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| ResolveError::LookupNotFound {
                            lookup: key.clone(),
                            detail: format!("network lookup '{}' has not been resolved", from),
                        })?,
                };
                let mut subnets =
                    backend
                        .subnets(&network_id)
                        .map_err(|e| ResolveError::LookupNotFound {
                            lookup: key.clone(),
                            detail: format!("backend error: {}", e),
                        })?;
                if subnets.is_empty() {
                    return Err(ResolveError::LookupNotFound {
                        lookup: key.clone(),
                        detail: format!("network {} has no subnets", network_id),
                    });
                }
                subnets.sort();
                subnets.dedup();
                debug!(lookup = %key, network = %network_id, count = subnets.len(), "resolved subnets");
                insert_unique(&mut values, key, AttrValue::list(subnets))?;
            }
            LookupRequest::CrossStackOutput {
                prefix,
                remote,
                required,
            } => {
                let outputs = backend.remote_outputs(remote).map_err(|e| {
                    ResolveError::RemoteStateUnavailable {
                        remote: remote.to_string(),
                        reason: e,
                    }
                })?;
                for name in required {
                    if !outputs.contains_key(name) {
                        return Err(ResolveError::RemoteStateUnavailable {
                            remote: remote.to_string(),
                            reason: format!("missing output '{}'", name),
                        });
                    }
                }
                debug!(remote = %remote, outputs = outputs.len(), "resolved cross-stack outputs");
                for (name, value) in outputs {
                    insert_unique(&mut values, &format!("{}_{}", prefix, name), value)?;
                }
            }
        }
    }

    Ok(DataSourceResult::new(values))
}

fn resolve_default_network(
    key: &str,
    backend: &dyn DataSourceBackend,
) -> Result<String, ResolveError> {
    let networks = backend
        .networks()
        .map_err(|e| ResolveError::LookupNotFound {
            lookup: key.to_string(),
            detail: format!("backend error: {}", e),
        })?;
    let mut defaults: Vec<String> = networks
        .into_iter()
        .filter(|n| n.is_default)
        .map(|n| n.id)
        .collect();
    match defaults.len() {
        0 => Err(ResolveError::LookupNotFound {
            lookup: key.to_string(),
            detail: "no default network".to_string(),
        }),
        1 => Ok(defaults.remove(0)),
        _ => Err(ResolveError::AmbiguousLookup {
            lookup: key.to_string(),
            candidates: defaults,
        }),
    }
}

fn insert_unique(
    values: &mut IndexMap<String, AttrValue>,
    key: &str,
    value: AttrValue,
) -> Result<(), ResolveError> {
    if let Some(existing) = values.get(key) {
        return Err(ResolveError::AmbiguousLookup {
            lookup: key.to_string(),
            candidates: vec![
                existing.render_scalar().unwrap_or_else(|| "<list>".to_string()),
                value.render_scalar().unwrap_or_else(|| "<list>".to_string()),
            ],
        });
    }
    values.insert(key.to_string(), value);
    Ok(())
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Backend over fixed inventory, used for dry runs and tests. Published outputs
/// become readable as remote state, which is how one stack consumes another's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticBackend {
    #[serde(default)]
    pub networks: Vec<NetworkInfo>,

    /// Network id -> subnet ids
    #[serde(default)]
    pub subnets: IndexMap<String, Vec<String>>,

    /// Remote locator (`bucket/key`) -> outputs
    #[serde(default)]
    pub remote_states: IndexMap<String, IndexMap<String, AttrValue>>,
}

impl StaticBackend {
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml_ng::from_str(yaml).map_err(|e| format!("invalid backend fixture: {}", e))
    }

    /// One default network with the given subnets.
    pub fn with_default_network(network_id: &str, subnets: &[&str]) -> Self {
        let mut backend = Self::default();
        backend.networks.push(NetworkInfo {
            id: network_id.to_string(),
            is_default: true,
        });
        backend.subnets.insert(
            network_id.to_string(),
            subnets.iter().map(|s| s.to_string()).collect(),
        );
        backend
    }

    pub fn publish_outputs(&mut self, remote: &RemoteStateRef, outputs: IndexMap<String, AttrValue>) {
        self.remote_states.insert(remote.locator(), outputs);
    }
}

impl DataSourceBackend for StaticBackend {
    fn networks(&self) -> Result<Vec<NetworkInfo>, String> {
        Ok(self.networks.clone())
    }

    fn subnets(&self, network_id: &str) -> Result<Vec<String>, String> {
        Ok(self.subnets.get(network_id).cloned().unwrap_or_default())
    }

    fn remote_outputs(&self, remote: &RemoteStateRef) -> Result<IndexMap<String, AttrValue>, String> {
        self.remote_states
            .get(&remote.locator())
            .cloned()
            .ok_or_else(|| format!("no state object at {}", remote.locator()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_remote() -> RemoteStateRef {
        RemoteStateRef {
            bucket: "tf-state".to_string(),
            key: "stage/data-stores/mysql/terraform.tfstate".to_string(),
            region: "us-east-2".to_string(),
        }
    }

    fn web_requests() -> Vec<LookupRequest> {
        vec![
            LookupRequest::DefaultNetwork {
                key: "default_vpc_id".to_string(),
            },
            LookupRequest::SubnetsForNetwork {
                key: "default_subnet_ids".to_string(),
                network: NetworkSelector::Lookup("default_vpc_id".to_string()),
            },
            LookupRequest::CrossStackOutput {
                prefix: "db".to_string(),
                remote: db_remote(),
                required: default_required_outputs(),
            },
        ]
    }

    fn backend() -> StaticBackend {
        let mut b = StaticBackend::with_default_network("vpc-1", &["subnet-b", "subnet-a"]);
        b.networks.push(NetworkInfo {
            id: "vpc-2".to_string(),
            is_default: false,
        });
        b.publish_outputs(
            &db_remote(),
            IndexMap::from([
                ("address".to_string(), AttrValue::from("10.0.0.5")),
                ("port".to_string(), AttrValue::Int(5432)),
            ]),
        );
        b
    }

    #[test]
    fn test_datasource_resolve_all() {
        let result = resolve_all(&web_requests(), &backend()).unwrap();
        assert_eq!(result.get("default_vpc_id"), Some(&AttrValue::from("vpc-1")));
        assert_eq!(
            result.get("default_subnet_ids"),
            Some(&AttrValue::list(["subnet-a", "subnet-b"]))
        );
        assert_eq!(result.get("db_address"), Some(&AttrValue::from("10.0.0.5")));
        assert_eq!(result.get("db_port"), Some(&AttrValue::Int(5432)));
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_datasource_no_default_network() {
        let mut b = backend();
        b.networks.retain(|n| !n.is_default);
        let err = resolve_all(&web_requests(), &b).unwrap_err();
        assert!(matches!(err, ResolveError::LookupNotFound { ref lookup, .. } if lookup == "default_vpc_id"));
    }

    #[test]
    fn test_datasource_ambiguous_default_network() {
        let mut b = backend();
        b.networks.push(NetworkInfo {
            id: "vpc-9".to_string(),
            is_default: true,
        });
        let err = resolve_all(&web_requests(), &b).unwrap_err();
        match err {
            ResolveError::AmbiguousLookup { candidates, .. } => {
                assert_eq!(candidates, vec!["vpc-1", "vpc-9"]);
            }
            other => panic!("expected AmbiguousLookup, got {:?}", other),
        }
    }

    #[test]
    fn test_datasource_remote_state_missing() {
        let mut b = backend();
        b.remote_states.clear();
        let err = resolve_all(&web_requests(), &b).unwrap_err();
        assert!(matches!(err, ResolveError::RemoteStateUnavailable { .. }));
    }

    #[test]
    fn test_datasource_remote_state_missing_port() {
        let mut b = backend();
        b.publish_outputs(
            &db_remote(),
            IndexMap::from([("address".to_string(), AttrValue::from("10.0.0.5"))]),
        );
        let err = resolve_all(&web_requests(), &b).unwrap_err();
        assert!(err.to_string().contains("missing output 'port'"));
    }

    #[test]
    fn test_datasource_subnets_before_network() {
        let requests = vec![LookupRequest::SubnetsForNetwork {
            key: "subnets".to_string(),
            network: NetworkSelector::Lookup("vpc".to_string()),
        }];
        let err = resolve_all(&requests, &backend()).unwrap_err();
        assert!(err.to_string().contains("has not been resolved"));
    }

    #[test]
    fn test_datasource_empty_subnets() {
        let requests = vec![LookupRequest::SubnetsForNetwork {
            key: "subnets".to_string(),
            network: NetworkSelector::Id("vpc-2".to_string()),
        }];
        let err = resolve_all(&requests, &backend()).unwrap_err();
        assert!(matches!(err, ResolveError::LookupNotFound { .. }));
    }

    #[test]
    fn test_datasource_duplicate_key() {
        let requests = vec![
            LookupRequest::DefaultNetwork { key: "vpc".to_string() },
            LookupRequest::DefaultNetwork { key: "vpc".to_string() },
        ];
        let err = resolve_all(&requests, &backend()).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousLookup { .. }));
    }

    #[test]
    fn test_datasource_lookup_yaml() {
        let yaml = r#"
- lookup: default_network
  key: default_vpc_id
- lookup: subnets_for_network
  key: default_subnet_ids
  network:
    lookup: default_vpc_id
- lookup: cross_stack_output
  prefix: db
  remote:
    bucket: tf-state
    key: stage/data-stores/mysql/terraform.tfstate
"#;
        let requests: Vec<LookupRequest> = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(requests, web_requests());
    }

    #[test]
    fn test_datasource_backend_fixture() {
        let yaml = r#"
networks:
  - id: vpc-1
    is_default: true
subnets:
  vpc-1: [subnet-a]
remote_states:
  tf-state/stage/data-stores/mysql/terraform.tfstate:
    address: db.internal
    port: 3306
"#;
        let b = StaticBackend::from_yaml(yaml).unwrap();
        let result = resolve_all(&web_requests(), &b).unwrap();
        assert_eq!(result.get("db_port"), Some(&AttrValue::Int(3306)));
    }

    #[test]
    fn test_datasource_result_shared() {
        let result = resolve_all(&web_requests(), &backend()).unwrap();
        let copy = result.clone();
        assert_eq!(copy, result);
        assert!(Arc::ptr_eq(&copy.values, &result.values));
    }
}
