//! Stack document parsing and validation.
//!
//! Parses a stack YAML file and validates structural constraints:
//! - Version must be "1.0"
//! - Resource ids must not collide with each other or the web-tier preset
//! - depends_on and attribute references must point at declared nodes
//! - Data references must name a lookup result
//! - Web-tier ports, sizes, health checks and template variables must be sane

use super::datasource::LookupRequest;
use super::stack::{self, WebTierConfig};
use super::template;
use super::types::*;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Variables the web-tier bootstrap template may use.
pub const TEMPLATE_VARIABLES: [&str; 3] = ["server_port", "db_address", "db_port"];

/// Parse a stack file from disk.
pub fn parse_config_file(path: &Path) -> Result<StackConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a stack document from a string.
pub fn parse_config(yaml: &str) -> Result<StackConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &StackConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        push(format!("version must be \"1.0\", got \"{}\"", config.version));
    }

    if config.name.is_empty() {
        push("name must not be empty".to_string());
    }

    let preset: &[&str] = if config.web_tier.is_some() {
        &stack::NODE_IDS
    } else {
        &[]
    };
    let declared = |id: &str| config.resources.contains_key(id) || preset.contains(&id);
    let data_keys = DataKeys::new(config);

    for (id, resource) in &config.resources {
        if id == "data" {
            push("resource id 'data' is reserved for lookups".to_string());
        }
        if id.contains('.') {
            push(format!("resource id '{}' must not contain '.'", id));
        }
        if preset.contains(&id.as_str()) {
            push(format!("resource '{}' collides with a web_tier resource", id));
        }

        for dep in &resource.depends_on {
            if !declared(dep) {
                push(format!("resource '{}' depends on unknown resource '{}'", id, dep));
            }
            if dep == id {
                push(format!("resource '{}' depends on itself", id));
            }
        }

        for (attribute, value) in &resource.attributes {
            if has_malformed_ref(value) {
                push(format!(
                    "resource '{}' attribute '{}' has a malformed reference (expected <id>.<output> or data.<key>)",
                    id, attribute
                ));
            }
            for reference in value.references() {
                match reference {
                    Reference::Node { id: target, .. } if !declared(target) => push(format!(
                        "resource '{}' attribute '{}' references unknown resource '{}'",
                        id, attribute, target
                    )),
                    Reference::Data { key } if !data_keys.covers(key) => push(format!(
                        "resource '{}' attribute '{}' references unknown lookup '{}'",
                        id, attribute, key
                    )),
                    _ => {}
                }
            }
        }
    }

    for (name, reference) in &config.outputs {
        match reference {
            Reference::Node { id, .. } if !declared(id) => {
                push(format!("output '{}' references unknown resource '{}'", name, id))
            }
            Reference::Data { key } if !data_keys.covers(key) => {
                push(format!("output '{}' references unknown lookup '{}'", name, key))
            }
            _ => {}
        }
    }

    if config.policy.max_parallel == 0 {
        push("policy.max_parallel must be at least 1".to_string());
    }

    if let Some(tier) = &config.web_tier {
        validate_web_tier(tier, &mut push);
    }

    errors
}

fn validate_web_tier(tier: &WebTierConfig, push: &mut impl FnMut(String)) {
    if tier.cluster_name.is_empty() {
        push("web_tier.cluster_name must not be empty".to_string());
    }
    for (field, port) in [("server_port", tier.server_port), ("http_port", tier.http_port)] {
        if !(1..=65535).contains(&port) {
            push(format!("web_tier.{} must be between 1 and 65535, got {}", field, port));
        }
    }
    if tier.min_size > tier.max_size {
        push(format!(
            "web_tier.min_size ({}) exceeds max_size ({})",
            tier.min_size, tier.max_size
        ));
    }
    for problem in tier.health_check.problems() {
        push(format!("web_tier.health_check: {}", problem));
    }
    for name in template::placeholders(tier.template()) {
        if !template::is_identifier(&name) {
            push(format!(
                "web_tier.user_data_template has malformed placeholder '${{{}}}'",
                name
            ));
        } else if !TEMPLATE_VARIABLES.contains(&name.as_str()) {
            push(format!(
                "web_tier.user_data_template uses unknown variable '{}' (available: {})",
                name,
                TEMPLATE_VARIABLES.join(", ")
            ));
        }
    }
}

/// A lone `{ref: <string>}` map is a reference that failed to parse. A `ref`
/// key alongside others is ordinary data, such as a tag.
fn has_malformed_ref(value: &AttrValue) -> bool {
    match value {
        AttrValue::Map(entries) => {
            let lone_ref = entries.len() == 1 && matches!(entries.get("ref"), Some(AttrValue::Str(_)));
            lone_ref || entries.values().any(has_malformed_ref)
        }
        AttrValue::List(items) => items.iter().any(has_malformed_ref),
        _ => false,
    }
}

/// Lookup result keys known before resolution.
struct DataKeys {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl DataKeys {
    fn new(config: &StackConfig) -> Self {
        let mut keys = DataKeys {
            exact: Vec::new(),
            prefixes: Vec::new(),
        };
        let preset = config.web_tier.as_ref().map(stack::lookup_requests);
        for request in config.lookups.iter().chain(preset.iter().flatten()) {
            match request {
                LookupRequest::DefaultNetwork { key } | LookupRequest::SubnetsForNetwork { key, .. } => {
                    keys.exact.push(key.clone())
                }
                LookupRequest::CrossStackOutput { prefix, .. } => {
                    keys.prefixes.push(format!("{}_", prefix))
                }
            }
        }
        keys
    }

    /// Cross-stack outputs are only known at resolve time, so any key under a
    /// declared prefix passes.
    fn covers(&self, key: &str) -> bool {
        self.exact.iter().any(|k| k == key) || self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }
}
