//! Web-tier preset.
//!
//! Expands a [`WebTierConfig`] into the lookups, resource nodes and module
//! outputs of a load-balanced autoscaling web tier:
//!
//! ```text
//! instance_sg ─▶ launch_template ─▶ asg ◀─ target_group ◀─ forward_rule
//! alb_sg ─▶ alb ─▶ http_listener ─▶ forward_rule
//! ```

use super::datasource::{DataSourceResult, LookupRequest, NetworkSelector, RemoteStateRef};
use super::error::RenderError;
use super::template;
use super::types::{AttrValue, Reference, ResourceKind, ResourceNode};
use crate::health::machine::HealthCheckConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const VPC_KEY: &str = "default_vpc_id";
pub const SUBNETS_KEY: &str = "default_subnet_ids";
pub const DB_PREFIX: &str = "db";

/// Ids of the nodes [`declare`] produces, in declaration order.
pub const NODE_IDS: [&str; 8] = [
    "instance_sg",
    "alb_sg",
    "launch_template",
    "target_group",
    "asg",
    "alb",
    "http_listener",
    "forward_rule",
];

pub const DEFAULT_USER_DATA: &str = r#"#!/bin/bash
cat > index.html <<EOF
<h1>Hello, World</h1>
<p>DB address: ${db_address}</p>
<p>DB port: ${db_port}</p>
EOF
nohup busybox httpd -f -p ${server_port} &
"#;

/// One security group rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    /// `tcp`, `udp`, or `-1` for all
    pub protocol: String,
    pub from_port: u32,
    pub to_port: u32,
    pub cidr_blocks: Vec<String>,
}

impl SecurityRule {
    pub fn tcp(port: u32, cidr_blocks: &[String]) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: port,
            to_port: port,
            cidr_blocks: cidr_blocks.to_vec(),
        }
    }

    /// Everything, everywhere.
    pub fn allow_all() -> Self {
        Self {
            protocol: "-1".to_string(),
            from_port: 0,
            to_port: 0,
            cidr_blocks: vec!["0.0.0.0/0".to_string()],
        }
    }

    fn to_attr(&self) -> AttrValue {
        AttrValue::map([
            ("protocol", AttrValue::from(self.protocol.as_str())),
            ("from_port", AttrValue::from(self.from_port)),
            ("to_port", AttrValue::from(self.to_port)),
            (
                "cidr_blocks",
                AttrValue::list(self.cidr_blocks.iter().map(String::as_str)),
            ),
        ])
    }
}

/// Declared shape of the web tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebTierConfig {
    /// Prefix for every named resource
    pub cluster_name: String,

    #[serde(default = "default_image_id")]
    pub image_id: String,

    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    /// Port the instances serve on
    pub server_port: u32,

    /// Port the load balancer listens on
    #[serde(default = "default_http_port")]
    pub http_port: u32,

    pub min_size: u32,
    pub max_size: u32,

    /// Where the database stack publishes `address` and `port`
    pub db_remote_state: RemoteStateRef,

    /// Bootstrap script; `${server_port}`, `${db_address}`, `${db_port}` are available
    #[serde(default)]
    pub user_data_template: Option<String>,

    pub health_check: HealthCheckConfig,

    #[serde(default = "default_ingress_cidrs")]
    pub ingress_cidrs: Vec<String>,
}

fn default_image_id() -> String {
    "ami-0fb653ca2d3203ac1".to_string()
}

fn default_instance_type() -> String {
    "t2.micro".to_string()
}

fn default_http_port() -> u32 {
    80
}

fn default_ingress_cidrs() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

impl WebTierConfig {
    pub fn template(&self) -> &str {
        self.user_data_template
            .as_deref()
            .unwrap_or(DEFAULT_USER_DATA)
    }

    fn named(&self, suffix: &str) -> String {
        format!("{}-{}", self.cluster_name, suffix)
    }
}

/// Lookups the web tier needs: default network, its subnets, the database stack.
pub fn lookup_requests(config: &WebTierConfig) -> Vec<LookupRequest> {
    vec![
        LookupRequest::DefaultNetwork {
            key: VPC_KEY.to_string(),
        },
        LookupRequest::SubnetsForNetwork {
            key: SUBNETS_KEY.to_string(),
            network: NetworkSelector::Lookup(VPC_KEY.to_string()),
        },
        LookupRequest::CrossStackOutput {
            prefix: DB_PREFIX.to_string(),
            remote: config.db_remote_state.clone(),
            required: vec!["address".to_string(), "port".to_string()],
        },
    ]
}

/// Variables available to the bootstrap template.
pub fn template_vars(config: &WebTierConfig, data: &DataSourceResult) -> IndexMap<String, AttrValue> {
    let mut vars = IndexMap::new();
    vars.insert("server_port".to_string(), AttrValue::from(config.server_port));
    for name in ["address", "port"] {
        let key = format!("{}_{}", DB_PREFIX, name);
        if let Some(value) = data.get(&key) {
            vars.insert(key, value.clone());
        }
    }
    vars
}

/// Seconds as an attribute. Values past `i64::MAX` are rejected by
/// validation, so saturating here never changes a valid config.
fn seconds(secs: u64) -> AttrValue {
    AttrValue::Int(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Declare the web tier's nodes and module outputs.
pub fn declare(
    config: &WebTierConfig,
    data: &DataSourceResult,
) -> Result<(Vec<ResourceNode>, IndexMap<String, Reference>), RenderError> {
    let rendered = template::render(config.template(), &template_vars(config, data))?;
    let user_data = template::encode_user_data(&rendered);
    let vpc = || Reference::data(VPC_KEY);
    let subnets = || Reference::data(SUBNETS_KEY);
    let hc = &config.health_check;

    let instance_sg = ResourceNode::new("instance_sg", ResourceKind::SecurityGroup)
        .attr("name", config.named("instance"))
        .attr("description", "web instances: service port only")
        .attr("vpc_id", vpc())
        .attr(
            "ingress",
            AttrValue::list([SecurityRule::tcp(config.server_port, &config.ingress_cidrs).to_attr()]),
        );

    let alb_sg = ResourceNode::new("alb_sg", ResourceKind::SecurityGroup)
        .attr("name", config.named("alb"))
        .attr("description", "load balancer: http in, all out")
        .attr("vpc_id", vpc())
        .attr(
            "ingress",
            AttrValue::list([SecurityRule::tcp(config.http_port, &config.ingress_cidrs).to_attr()]),
        )
        .attr("egress", AttrValue::list([SecurityRule::allow_all().to_attr()]));

    let launch_template = ResourceNode::new("launch_template", ResourceKind::LaunchTemplate)
        .attr("name_prefix", config.named(""))
        .attr("image_id", config.image_id.as_str())
        .attr("instance_type", config.instance_type.as_str())
        .attr(
            "security_group_ids",
            AttrValue::list([Reference::node("instance_sg", "id")]),
        )
        .attr("user_data", user_data)
        .create_before_destroy();

    let target_group = ResourceNode::new("target_group", ResourceKind::TargetGroup)
        .attr("name", config.named("tg"))
        .attr("port", config.server_port)
        .attr("protocol", "HTTP")
        .attr("vpc_id", vpc())
        .attr("deregistration_delay", seconds(hc.drain_timeout_secs))
        .attr(
            "health_check",
            AttrValue::map([
                ("path", AttrValue::from(hc.path.as_str())),
                ("protocol", AttrValue::from(hc.protocol.as_str())),
                ("matcher", AttrValue::from(hc.matcher.to_string())),
                ("interval", seconds(hc.interval_secs)),
                ("timeout", seconds(hc.timeout_secs)),
                ("healthy_threshold", AttrValue::from(hc.healthy_threshold)),
                ("unhealthy_threshold", AttrValue::from(hc.unhealthy_threshold)),
            ]),
        );

    let asg = ResourceNode::new("asg", ResourceKind::AutoscalingGroup)
        .attr("name", config.named("asg"))
        .attr("launch_template_id", Reference::node("launch_template", "id"))
        .attr(
            "launch_template_version",
            Reference::node("launch_template", "latest_version"),
        )
        .attr("vpc_zone_identifier", subnets())
        .attr(
            "target_group_arns",
            AttrValue::list([Reference::node("target_group", "arn")]),
        )
        .attr("health_check_type", "ELB")
        .attr("min_size", config.min_size)
        .attr("max_size", config.max_size)
        .attr("tags", AttrValue::map([("Name", config.cluster_name.as_str())]))
        .create_before_destroy();

    let alb = ResourceNode::new("alb", ResourceKind::LoadBalancer)
        .attr("name", config.named("alb"))
        .attr("load_balancer_type", "application")
        .attr("internal", false)
        .attr("subnets", subnets())
        .attr("security_groups", AttrValue::list([Reference::node("alb_sg", "id")]));

    let http_listener = ResourceNode::new("http_listener", ResourceKind::Listener)
        .attr("load_balancer_arn", Reference::node("alb", "arn"))
        .attr("port", config.http_port)
        .attr("protocol", "HTTP")
        .attr(
            "default_action",
            AttrValue::map([
                ("type", AttrValue::from("fixed_response")),
                ("content_type", AttrValue::from("text/plain")),
                ("message_body", AttrValue::from(crate::health::routing::NOT_FOUND_BODY)),
                ("status_code", AttrValue::Int(404)),
            ]),
        );

    let forward_rule = ResourceNode::new("forward_rule", ResourceKind::ListenerRule)
        .attr("listener_arn", Reference::node("http_listener", "arn"))
        .attr("priority", 100i64)
        .attr("path_patterns", AttrValue::list(["*"]))
        .attr(
            "action",
            AttrValue::map([
                ("type", AttrValue::from("forward")),
                ("target_group_arn", AttrValue::from(Reference::node("target_group", "arn"))),
            ]),
        );

    let outputs = IndexMap::from([
        ("alb_dns_name".to_string(), Reference::node("alb", "dns_name")),
        ("asg_name".to_string(), Reference::node("asg", "name")),
    ]);

    Ok((
        vec![
            instance_sg,
            alb_sg,
            launch_template,
            target_group,
            asg,
            alb,
            http_listener,
            forward_rule,
        ],
        outputs,
    ))
}
