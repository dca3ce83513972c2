//! Listener rule evaluation.
//!
//! Rules are tried lowest priority first; the first whose path pattern matches
//! forwards to its target group's in-service members. No match falls through to
//! the listener's fixed 404. A match with nobody in service answers 503.

use super::machine::MemberSnapshot;
use glob::Pattern;
use indexmap::IndexMap;
use serde::Serialize;

pub const NOT_FOUND_BODY: &str = "404: page not found";
pub const UNAVAILABLE_BODY: &str = "503: no healthy targets";

#[derive(Debug, Clone)]
pub struct ListenerRule {
    pub priority: u32,
    pub path_patterns: Vec<Pattern>,
    pub target_group: String,
}

impl ListenerRule {
    pub fn new(priority: u32, patterns: &[&str], target_group: impl Into<String>) -> Result<Self, String> {
        let path_patterns = patterns
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| format!("invalid path pattern '{}': {}", p, e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            priority,
            path_patterns,
            target_group: target_group.into(),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.path_patterns.iter().any(|p| p.matches(path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteDecision {
    Forward {
        target_group: String,
        targets: Vec<String>,
    },
    FixedResponse {
        status: u16,
        body: String,
    },
}

/// HTTP listener: ordered rules plus the default fixed response.
#[derive(Debug, Clone, Default)]
pub struct Router {
    rules: Vec<ListenerRule>,
    /// target group name -> membership group that backs it
    attachments: IndexMap<String, String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: ListenerRule) {
        let at = self.rules.partition_point(|r| r.priority <= rule.priority);
        self.rules.insert(at, rule);
    }

    /// Back `target_group` with the members of `group`.
    pub fn attach(&mut self, target_group: impl Into<String>, group: impl Into<String>) {
        self.attachments.insert(target_group.into(), group.into());
    }

    pub fn route(&self, path: &str, members: &[MemberSnapshot]) -> RouteDecision {
        let Some(rule) = self.rules.iter().find(|r| r.matches(path)) else {
            return RouteDecision::FixedResponse {
                status: 404,
                body: NOT_FOUND_BODY.to_string(),
            };
        };

        let group = self.attachments.get(&rule.target_group);
        let targets: Vec<String> = members
            .iter()
            .filter(|m| Some(&m.group) == group && m.state.receives_traffic())
            .map(|m| m.instance_id.clone())
            .collect();

        if targets.is_empty() {
            tracing::warn!(path, target_group = %rule.target_group, "no in-service targets");
            return RouteDecision::FixedResponse {
                status: 503,
                body: UNAVAILABLE_BODY.to_string(),
            };
        }

        RouteDecision::Forward {
            target_group: rule.target_group.clone(),
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::machine::MemberState;

    fn member(id: &str, group: &str, state: MemberState) -> MemberSnapshot {
        MemberSnapshot {
            instance_id: id.to_string(),
            group: group.to_string(),
            state,
            consecutive_successes: 0,
            consecutive_failures: 0,
            in_flight: 0,
        }
    }

    fn router() -> Router {
        let mut r = Router::new();
        r.add_rule(ListenerRule::new(100, &["*"], "web-tg").unwrap());
        r.attach("web-tg", "asg-1");
        r
    }

    #[test]
    fn test_routing_forwards_to_in_service_only() {
        let members = vec![
            member("i-1", "asg-1", MemberState::InService),
            member("i-2", "asg-1", MemberState::Unhealthy),
            member("i-3", "asg-1", MemberState::Draining),
            member("i-4", "asg-1", MemberState::Initializing),
            member("i-5", "asg-1", MemberState::InService),
            member("i-6", "asg-2", MemberState::InService),
        ];
        assert_eq!(
            router().route("/index.html", &members),
            RouteDecision::Forward {
                target_group: "web-tg".into(),
                targets: vec!["i-1".into(), "i-5".into()],
            }
        );
    }

    #[test]
    fn test_routing_no_match_is_404() {
        let mut r = Router::new();
        r.add_rule(ListenerRule::new(10, &["/api/*"], "api-tg").unwrap());
        r.attach("api-tg", "asg-1");
        let members = vec![member("i-1", "asg-1", MemberState::InService)];
        assert_eq!(
            r.route("/home", &members),
            RouteDecision::FixedResponse {
                status: 404,
                body: "404: page not found".into(),
            }
        );
        assert!(matches!(r.route("/api/users", &members), RouteDecision::Forward { .. }));
    }

    #[test]
    fn test_routing_404_independent_of_health() {
        let r = Router::new();
        assert!(matches!(
            r.route("/", &[]),
            RouteDecision::FixedResponse { status: 404, .. }
        ));
    }

    #[test]
    fn test_routing_no_healthy_targets_is_503() {
        let members = vec![member("i-1", "asg-1", MemberState::Unhealthy)];
        assert_eq!(
            router().route("/", &members),
            RouteDecision::FixedResponse {
                status: 503,
                body: UNAVAILABLE_BODY.into(),
            }
        );
    }

    #[test]
    fn test_routing_priority_order() {
        let mut r = Router::new();
        r.add_rule(ListenerRule::new(200, &["*"], "web-tg").unwrap());
        r.add_rule(ListenerRule::new(10, &["/api/*"], "api-tg").unwrap());
        r.attach("web-tg", "asg-web");
        r.attach("api-tg", "asg-api");
        let members = vec![
            member("i-web", "asg-web", MemberState::InService),
            member("i-api", "asg-api", MemberState::InService),
        ];
        assert_eq!(
            r.route("/api/v1", &members),
            RouteDecision::Forward {
                target_group: "api-tg".into(),
                targets: vec!["i-api".into()],
            }
        );
        assert!(matches!(
            r.route("/about", &members),
            RouteDecision::Forward { ref target_group, .. } if target_group == "web-tg"
        ));
    }

    #[test]
    fn test_routing_invalid_pattern() {
        assert!(ListenerRule::new(1, &["/[unclosed"], "tg").is_err());
    }
}
