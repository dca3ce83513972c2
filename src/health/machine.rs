//! Per-member health state machine.
//!
//! Pure: a [`HealthRecord`] consumes check outcomes and drain signals and
//! reports the transitions it made. Timing lives in the monitor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Membership state of one autoscaling-group instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Initializing,
    InService,
    Unhealthy,
    Draining,
    Terminated,
}

impl MemberState {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Initializing => "INITIALIZING",
            MemberState::InService => "IN_SERVICE",
            MemberState::Unhealthy => "UNHEALTHY",
            MemberState::Draining => "DRAINING",
            MemberState::Terminated => "TERMINATED",
        }
    }

    /// Only in-service members receive forwarded traffic.
    pub fn receives_traffic(self) -> bool {
        self == MemberState::InService
    }

    /// Still counted toward group capacity.
    pub fn is_active(self) -> bool {
        !matches!(self, MemberState::Draining | MemberState::Terminated)
    }

    pub fn is_valid_transition(from: MemberState, to: MemberState) -> bool {
        use MemberState::*;
        matches!(
            (from, to),
            (Initializing, InService)
                | (InService, Unhealthy)
                | (Unhealthy, InService)
                | (InService, Draining)
                | (Unhealthy, Draining)
                | (Draining, Terminated)
                | (Initializing, Terminated)
        )
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Fail,
}

/// Accepted HTTP status codes: `"200"`, `"200-299"`, `"200,302"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatusMatcher {
    ranges: Vec<(u16, u16)>,
}

impl StatusMatcher {
    pub fn matches(&self, code: u16) -> bool {
        self.ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&code))
    }
}

impl Default for StatusMatcher {
    fn default() -> Self {
        Self {
            ranges: vec![(200, 200)],
        }
    }
}

impl FromStr for StatusMatcher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = |part: &str| -> Result<u16, String> {
            let code: u16 = part
                .trim()
                .parse()
                .map_err(|_| format!("invalid status code '{}' in matcher '{}'", part.trim(), s))?;
            if !(100..=599).contains(&code) {
                return Err(format!("status code {} out of range in matcher '{}'", code, s));
            }
            Ok(code)
        };

        let mut ranges = Vec::new();
        for part in s.split(',') {
            let range = match part.split_once('-') {
                Some((lo, hi)) => (code(lo)?, code(hi)?),
                None => {
                    let c = code(part)?;
                    (c, c)
                }
            };
            if range.0 > range.1 {
                return Err(format!("empty status range '{}' in matcher '{}'", part.trim(), s));
            }
            ranges.push(range);
        }
        Ok(Self { ranges })
    }
}

impl TryFrom<String> for StatusMatcher {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for StatusMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{}-{}", lo, hi)
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

impl From<StatusMatcher> for String {
    fn from(m: StatusMatcher) -> Self {
        m.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckProtocol {
    #[default]
    Http,
    Https,
}

impl CheckProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
        }
    }
}

/// Target group health check settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub protocol: CheckProtocol,

    #[serde(default)]
    pub matcher: StatusMatcher,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,

    /// How long a draining member may keep connections open. Required.
    pub drain_timeout_secs: u64,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_interval() -> u64 {
    15
}

fn default_timeout() -> u64 {
    3
}

fn default_threshold() -> u32 {
    2
}

impl HealthCheckConfig {
    /// Defaults for everything except the drain timeout.
    pub fn new(drain_timeout_secs: u64) -> Self {
        Self {
            path: default_path(),
            protocol: CheckProtocol::default(),
            matcher: StatusMatcher::default(),
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            healthy_threshold: default_threshold(),
            unhealthy_threshold: default_threshold(),
            drain_timeout_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Problems with these settings, empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.path.starts_with('/') {
            problems.push(format!("health check path '{}' must start with '/'", self.path));
        }
        if self.healthy_threshold == 0 {
            problems.push("healthy_threshold must be at least 1".to_string());
        }
        if self.unhealthy_threshold == 0 {
            problems.push("unhealthy_threshold must be at least 1".to_string());
        }
        if self.interval_secs == 0 {
            problems.push("interval_secs must be at least 1".to_string());
        }
        for (field, secs) in [
            ("interval_secs", self.interval_secs),
            ("timeout_secs", self.timeout_secs),
            ("drain_timeout_secs", self.drain_timeout_secs),
        ] {
            if i64::try_from(secs).is_err() {
                problems.push(format!("{} ({}) exceeds {}", field, secs, i64::MAX));
            }
        }
        if self.timeout_secs >= self.interval_secs {
            problems.push(format!(
                "timeout_secs ({}) must be less than interval_secs ({})",
                self.timeout_secs, self.interval_secs
            ));
        }
        problems
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{instance}: cannot move from {from} to {to}")]
    InvalidTransition {
        instance: String,
        from: MemberState,
        to: MemberState,
    },
}

/// A state change made by a [`HealthRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub instance_id: String,
    pub from: MemberState,
    pub to: MemberState,
}

/// Read-only copy of a health record, published by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSnapshot {
    pub instance_id: String,
    pub group: String,
    pub state: MemberState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub in_flight: u32,
}

#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub instance_id: String,
    pub group: String,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub in_flight: u32,
    state: MemberState,
}

impl HealthRecord {
    pub fn new(instance_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            group: group.into(),
            consecutive_successes: 0,
            consecutive_failures: 0,
            in_flight: 0,
            state: MemberState::Initializing,
        }
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn receives_traffic(&self) -> bool {
        self.state.receives_traffic()
    }

    fn invalid(&self, to: MemberState) -> TransitionError {
        TransitionError::InvalidTransition {
            instance: self.instance_id.clone(),
            from: self.state,
            to,
        }
    }

    fn transition(&mut self, to: MemberState) -> Result<Transition, TransitionError> {
        let from = self.state;
        if !MemberState::is_valid_transition(from, to) {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(Transition {
            instance_id: self.instance_id.clone(),
            from,
            to,
        })
    }

    /// Feed one check result. Draining and terminated members ignore checks.
    pub fn observe(&mut self, outcome: CheckOutcome, cfg: &HealthCheckConfig) -> Option<Transition> {
        if !self.state.is_active() {
            return None;
        }
        match outcome {
            CheckOutcome::Pass => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
                let recovering = matches!(self.state, MemberState::Initializing | MemberState::Unhealthy);
                if recovering && self.consecutive_successes >= cfg.healthy_threshold {
                    return self.transition(MemberState::InService).ok();
                }
            }
            CheckOutcome::Fail => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                if self.state == MemberState::InService
                    && self.consecutive_failures >= cfg.unhealthy_threshold
                {
                    return self.transition(MemberState::Unhealthy).ok();
                }
            }
        }
        None
    }

    /// Scale-in or replacement: stop routing and let connections finish.
    pub fn begin_drain(&mut self) -> Result<Transition, TransitionError> {
        self.transition(MemberState::Draining)
    }

    /// Drain finished (zero in-flight or timeout elapsed).
    pub fn complete_drain(&mut self) -> Result<Transition, TransitionError> {
        if self.state != MemberState::Draining {
            return Err(self.invalid(MemberState::Terminated));
        }
        self.transition(MemberState::Terminated)
    }

    /// Remove a member that never entered service; nothing to drain.
    pub fn terminate_initializing(&mut self) -> Result<Transition, TransitionError> {
        if self.state != MemberState::Initializing {
            return Err(self.invalid(MemberState::Terminated));
        }
        self.transition(MemberState::Terminated)
    }

    pub fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            instance_id: self.instance_id.clone(),
            group: self.group.clone(),
            state: self.state,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            in_flight: self.in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> HealthCheckConfig {
        HealthCheckConfig::new(30)
    }

    fn in_service() -> HealthRecord {
        let mut r = HealthRecord::new("i-1", "asg-1");
        r.observe(CheckOutcome::Pass, &cfg());
        r.observe(CheckOutcome::Pass, &cfg());
        assert_eq!(r.state(), MemberState::InService);
        r
    }

    #[test]
    fn test_machine_two_passes_enter_service() {
        let mut r = HealthRecord::new("i-1", "asg-1");
        assert_eq!(r.state(), MemberState::Initializing);
        assert!(r.observe(CheckOutcome::Pass, &cfg()).is_none());
        let t = r.observe(CheckOutcome::Pass, &cfg()).unwrap();
        assert_eq!(t.from, MemberState::Initializing);
        assert_eq!(t.to, MemberState::InService);
        assert!(r.receives_traffic());
    }

    #[test]
    fn test_machine_two_failures_unhealthy() {
        let mut r = in_service();
        assert!(r.observe(CheckOutcome::Fail, &cfg()).is_none());
        let t = r.observe(CheckOutcome::Fail, &cfg()).unwrap();
        assert_eq!(t.to, MemberState::Unhealthy);
        assert!(!r.receives_traffic());
    }

    #[test]
    fn test_machine_intervening_pass_resets() {
        let mut r = in_service();
        r.observe(CheckOutcome::Fail, &cfg());
        r.observe(CheckOutcome::Pass, &cfg());
        assert!(r.observe(CheckOutcome::Fail, &cfg()).is_none());
        assert_eq!(r.state(), MemberState::InService);
        assert_eq!(r.consecutive_failures, 1);
    }

    #[test]
    fn test_machine_recovers_from_unhealthy() {
        let mut r = in_service();
        r.observe(CheckOutcome::Fail, &cfg());
        r.observe(CheckOutcome::Fail, &cfg());
        r.observe(CheckOutcome::Pass, &cfg());
        let t = r.observe(CheckOutcome::Pass, &cfg()).unwrap();
        assert_eq!((t.from, t.to), (MemberState::Unhealthy, MemberState::InService));
    }

    #[test]
    fn test_machine_initializing_failures_stay() {
        let mut r = HealthRecord::new("i-1", "asg-1");
        for _ in 0..5 {
            assert!(r.observe(CheckOutcome::Fail, &cfg()).is_none());
        }
        assert_eq!(r.state(), MemberState::Initializing);
    }

    #[test]
    fn test_machine_drain_flow() {
        let mut r = in_service();
        let t = r.begin_drain().unwrap();
        assert_eq!(t.to, MemberState::Draining);
        // checks are ignored while draining
        assert!(r.observe(CheckOutcome::Pass, &cfg()).is_none());
        assert!(r.observe(CheckOutcome::Fail, &cfg()).is_none());
        assert_eq!(r.complete_drain().unwrap().to, MemberState::Terminated);
        assert!(r.observe(CheckOutcome::Pass, &cfg()).is_none());
    }

    #[test]
    fn test_machine_invalid_transitions() {
        let mut r = HealthRecord::new("i-1", "asg-1");
        let err = r.begin_drain().unwrap_err();
        assert_eq!(
            err,
            TransitionError::InvalidTransition {
                instance: "i-1".into(),
                from: MemberState::Initializing,
                to: MemberState::Draining,
            }
        );
        assert!(r.complete_drain().is_err());

        let mut r = in_service();
        assert!(r.complete_drain().is_err());
        assert!(r.terminate_initializing().is_err());
    }

    #[test]
    fn test_machine_terminate_initializing() {
        let mut r = HealthRecord::new("i-1", "asg-1");
        assert_eq!(r.terminate_initializing().unwrap().to, MemberState::Terminated);
    }

    #[test]
    fn test_machine_custom_thresholds() {
        let mut c = cfg();
        c.healthy_threshold = 3;
        let mut r = HealthRecord::new("i-1", "asg-1");
        r.observe(CheckOutcome::Pass, &c);
        r.observe(CheckOutcome::Pass, &c);
        assert_eq!(r.state(), MemberState::Initializing);
        r.observe(CheckOutcome::Pass, &c);
        assert_eq!(r.state(), MemberState::InService);
    }

    #[test]
    fn test_machine_status_matcher() {
        let single: StatusMatcher = "200".parse().unwrap();
        assert!(single.matches(200));
        assert!(!single.matches(204));

        let range: StatusMatcher = "200-299".parse().unwrap();
        assert!(range.matches(204));
        assert!(!range.matches(302));

        let list: StatusMatcher = "200, 302".parse().unwrap();
        assert!(list.matches(302));
        assert_eq!(list.to_string(), "200,302");

        assert!("abc".parse::<StatusMatcher>().is_err());
        assert!("299-200".parse::<StatusMatcher>().is_err());
        assert!("700".parse::<StatusMatcher>().is_err());
    }

    #[test]
    fn test_machine_config_defaults_from_yaml() {
        let cfg: HealthCheckConfig =
            serde_yaml_ng::from_str("drain_timeout_secs: 45\nmatcher: \"200-399\"\n").unwrap();
        assert_eq!(cfg.path, "/");
        assert_eq!(cfg.protocol, CheckProtocol::Http);
        assert_eq!(cfg.interval_secs, 15);
        assert_eq!(cfg.timeout_secs, 3);
        assert_eq!(cfg.healthy_threshold, 2);
        assert_eq!(cfg.unhealthy_threshold, 2);
        assert_eq!(cfg.drain_timeout(), Duration::from_secs(45));
        assert!(cfg.matcher.matches(301));
        assert!(cfg.problems().is_empty());
    }

    #[test]
    fn test_machine_drain_timeout_required() {
        let result: Result<HealthCheckConfig, _> = serde_yaml_ng::from_str("path: /health\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_machine_config_problems() {
        let mut c = cfg();
        c.timeout_secs = 20;
        c.unhealthy_threshold = 0;
        let problems = c.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("unhealthy_threshold"));
        assert!(problems[1].contains("timeout_secs (20)"));
    }

    #[test]
    fn test_machine_config_seconds_fit_attribute_range() {
        let mut c = cfg();
        c.drain_timeout_secs = u64::MAX;
        assert_eq!(
            c.problems(),
            vec![format!("drain_timeout_secs ({}) exceeds {}", u64::MAX, i64::MAX)]
        );
        c.drain_timeout_secs = i64::MAX as u64;
        assert!(c.problems().is_empty());
    }
}
