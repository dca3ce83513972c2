//! Membership monitor.
//!
//! Owns every [`HealthRecord`]. One background loop per instance probes its
//! health endpoint on the configured interval; drains run as their own tasks
//! and finish on zero in-flight connections or the drain timeout, whichever
//! comes first. Callers only ever see [`MemberSnapshot`]s.

use super::machine::{
    CheckOutcome, HealthCheckConfig, HealthRecord, MemberSnapshot, MemberState, Transition,
    TransitionError,
};
use crate::core::planner::plan_scale_in;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Issues one health check against a member.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// HTTP status the member answered with.
    async fn check(&self, instance_id: &str, cfg: &HealthCheckConfig) -> Result<u16, String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("unknown member '{instance}'")]
    UnknownMember { instance: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

fn unknown(instance: &str) -> MonitorError {
    MonitorError::UnknownMember {
        instance: instance.to_string(),
    }
}

struct Member {
    record: HealthRecord,
    cfg: Arc<HealthCheckConfig>,
    state: watch::Sender<MemberState>,
    drained: Arc<Notify>,
    checker: Option<JoinHandle<()>>,
}

impl Member {
    fn publish(&self, transition: &Transition) {
        info!(
            instance = %transition.instance_id,
            group = %self.record.group,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            "membership transition"
        );
        self.state.send_replace(transition.to);
    }

    fn stop_checks(&mut self) {
        if let Some(handle) = self.checker.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Shared {
    members: RwLock<IndexMap<String, Member>>,
}

impl Shared {
    async fn apply_outcome(
        &self,
        instance_id: &str,
        outcome: CheckOutcome,
    ) -> Result<Option<Transition>, MonitorError> {
        let mut members = self.members.write().await;
        let member = members.get_mut(instance_id).ok_or_else(|| unknown(instance_id))?;
        let transition = member.record.observe(outcome, &member.cfg);
        if let Some(t) = &transition {
            member.publish(t);
        }
        Ok(transition)
    }

    async fn finish_drain(&self, instance_id: &str, forced: bool) {
        let mut members = self.members.write().await;
        let Some(member) = members.get_mut(instance_id) else {
            return;
        };
        match member.record.complete_drain() {
            Ok(t) => {
                debug!(instance = instance_id, forced, in_flight = member.record.in_flight, "drain finished");
                member.publish(&t);
                member.stop_checks();
                members.shift_remove(instance_id);
            }
            Err(e) => warn!(error = %e, "drain completion rejected"),
        }
    }
}

/// Tracks membership of every registered instance.
#[derive(Clone)]
pub struct MembershipMonitor {
    shared: Arc<Shared>,
    probe: Arc<dyn HealthProbe>,
}

impl MembershipMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            probe,
        }
    }

    /// Start tracking an instance in `Initializing`. Returns false if it is
    /// already tracked.
    pub async fn register(
        &self,
        instance_id: impl Into<String>,
        group: impl Into<String>,
        cfg: HealthCheckConfig,
    ) -> bool {
        let instance_id = instance_id.into();
        let group = group.into();
        let mut members = self.shared.members.write().await;
        if members.contains_key(&instance_id) {
            return false;
        }

        let cfg = Arc::new(cfg);
        let (state, _) = watch::channel(MemberState::Initializing);
        let checker = tokio::spawn(check_loop(
            self.shared.clone(),
            self.probe.clone(),
            instance_id.clone(),
            cfg.clone(),
        ));
        info!(instance = %instance_id, group = %group, "member registered");
        members.insert(
            instance_id.clone(),
            Member {
                record: HealthRecord::new(instance_id, group),
                cfg,
                state,
                drained: Arc::new(Notify::new()),
                checker: Some(checker),
            },
        );
        true
    }

    /// Feed a check result from outside the probe loop.
    pub async fn record_outcome(
        &self,
        instance_id: &str,
        outcome: CheckOutcome,
    ) -> Result<Option<Transition>, MonitorError> {
        self.shared.apply_outcome(instance_id, outcome).await
    }

    /// Report the member's current open connection count.
    pub async fn set_in_flight(&self, instance_id: &str, in_flight: u32) -> Result<(), MonitorError> {
        let mut members = self.shared.members.write().await;
        let member = members.get_mut(instance_id).ok_or_else(|| unknown(instance_id))?;
        member.record.in_flight = in_flight;
        if in_flight == 0 && member.record.state() == MemberState::Draining {
            member.drained.notify_one();
        }
        Ok(())
    }

    /// Move an in-service or unhealthy member to `Draining` and start its drain
    /// clock. Does not wait for termination.
    pub async fn begin_drain(&self, instance_id: &str) -> Result<(), MonitorError> {
        let mut members = self.shared.members.write().await;
        let member = members.get_mut(instance_id).ok_or_else(|| unknown(instance_id))?;
        self.drain_member(member)?;
        Ok(())
    }

    fn drain_member(&self, member: &mut Member) -> Result<(), TransitionError> {
        let t = member.record.begin_drain()?;
        member.publish(&t);
        if member.record.in_flight == 0 {
            member.drained.notify_one();
        }
        tokio::spawn(watch_drain(
            self.shared.clone(),
            member.record.instance_id.clone(),
            member.cfg.drain_timeout(),
            member.drained.clone(),
        ));
        Ok(())
    }

    /// Begin removing a member: drain it, or terminate it directly if it never
    /// entered service. Returns a receiver that sees `Terminated`.
    async fn start_removal(
        &self,
        instance_id: &str,
    ) -> Result<watch::Receiver<MemberState>, MonitorError> {
        let mut members = self.shared.members.write().await;
        let member = members.get_mut(instance_id).ok_or_else(|| unknown(instance_id))?;
        let receiver = member.state.subscribe();
        match member.record.state() {
            MemberState::Initializing => {
                let t = member.record.terminate_initializing()?;
                member.publish(&t);
                member.stop_checks();
                members.shift_remove(instance_id);
            }
            MemberState::InService | MemberState::Unhealthy => self.drain_member(member)?,
            MemberState::Draining | MemberState::Terminated => {}
        }
        Ok(receiver)
    }

    /// Remove a member and wait until it is terminated.
    pub async fn terminate(&self, instance_id: &str) -> Result<(), MonitorError> {
        let receiver = self.start_removal(instance_id).await?;
        await_terminated(receiver).await;
        Ok(())
    }

    /// Remove every member of `group`, draining concurrently. Returns the
    /// removed instance ids.
    pub async fn terminate_group(&self, group: &str) -> Result<Vec<String>, MonitorError> {
        let ids: Vec<String> = self
            .group_snapshot(group)
            .await
            .into_iter()
            .map(|m| m.instance_id)
            .collect();
        self.remove_all(&ids).await
    }

    /// Shrink `group` to `desired_capacity` active members.
    pub async fn scale_in(
        &self,
        group: &str,
        desired_capacity: usize,
    ) -> Result<Vec<String>, MonitorError> {
        let members = self.group_snapshot(group).await;
        let chosen = plan_scale_in(&members, desired_capacity);
        info!(group, desired_capacity, removing = chosen.len(), "scale in");
        self.remove_all(&chosen).await
    }

    /// Start every removal, then wait for all of them. A member that is
    /// already gone counts as terminated. Returns the ids that were removed,
    /// or the first error once every started removal has finished.
    async fn remove_all(&self, ids: &[String]) -> Result<Vec<String>, MonitorError> {
        let mut started = Vec::with_capacity(ids.len());
        let mut first_error = None;
        for id in ids {
            match self.start_removal(id).await {
                Ok(receiver) => started.push((id.clone(), receiver)),
                Err(MonitorError::UnknownMember { .. }) => {
                    debug!(instance = %id, "member already gone");
                }
                Err(e) => {
                    warn!(instance = %id, error = %e, "member removal failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        let mut removed = Vec::with_capacity(started.len());
        for (id, receiver) in started {
            await_terminated(receiver).await;
            removed.push(id);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    pub async fn state(&self, instance_id: &str) -> Option<MemberState> {
        self.shared
            .members
            .read()
            .await
            .get(instance_id)
            .map(|m| m.record.state())
    }

    /// Every tracked member, in registration order.
    pub async fn snapshot(&self) -> Vec<MemberSnapshot> {
        self.shared
            .members
            .read()
            .await
            .values()
            .map(|m| m.record.snapshot())
            .collect()
    }

    pub async fn group_snapshot(&self, group: &str) -> Vec<MemberSnapshot> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|m| m.group == group)
            .collect()
    }

    /// Number of members in each state.
    pub async fn state_counts(&self) -> IndexMap<MemberState, usize> {
        let mut counts = IndexMap::new();
        for member in self.shared.members.read().await.values() {
            *counts.entry(member.record.state()).or_insert(0) += 1;
        }
        counts
    }

    /// Stop every probe loop. Records are kept.
    pub async fn shutdown(&self) {
        for member in self.shared.members.write().await.values_mut() {
            member.stop_checks();
        }
    }
}

async fn await_terminated(mut receiver: watch::Receiver<MemberState>) {
    let _ = receiver.wait_for(|s| *s == MemberState::Terminated).await;
}

async fn check_loop(
    shared: Arc<Shared>,
    probe: Arc<dyn HealthProbe>,
    instance_id: String,
    cfg: Arc<HealthCheckConfig>,
) {
    let mut ticker = tokio::time::interval(cfg.interval().max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let outcome = probe_once(probe.as_ref(), &instance_id, &cfg).await;
        if shared.apply_outcome(&instance_id, outcome).await.is_err() {
            break;
        }
    }
}

async fn probe_once(probe: &dyn HealthProbe, instance_id: &str, cfg: &HealthCheckConfig) -> CheckOutcome {
    match tokio::time::timeout(cfg.timeout(), probe.check(instance_id, cfg)).await {
        Ok(Ok(code)) if cfg.matcher.matches(code) => CheckOutcome::Pass,
        Ok(Ok(code)) => {
            debug!(instance = instance_id, code, matcher = %cfg.matcher, "status not accepted");
            CheckOutcome::Fail
        }
        Ok(Err(e)) => {
            debug!(instance = instance_id, error = %e, "health check failed");
            CheckOutcome::Fail
        }
        Err(_) => {
            debug!(instance = instance_id, timeout_secs = cfg.timeout_secs, "health check timed out");
            CheckOutcome::Fail
        }
    }
}

async fn watch_drain(shared: Arc<Shared>, instance_id: String, timeout: Duration, drained: Arc<Notify>) {
    let forced = tokio::select! {
        _ = drained.notified() => false,
        _ = tokio::time::sleep(timeout) => true,
    };
    shared.finish_drain(&instance_id, forced).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Clone, Copy)]
    enum Behavior {
        Status(u16),
        Hang,
        Refused,
    }

    #[derive(Default)]
    struct ScriptedProbe {
        behavior: Mutex<HashMap<String, Behavior>>,
    }

    impl ScriptedProbe {
        fn set(&self, instance_id: &str, behavior: Behavior) {
            self.behavior
                .lock()
                .unwrap()
                .insert(instance_id.to_string(), behavior);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self, instance_id: &str, _cfg: &HealthCheckConfig) -> Result<u16, String> {
            let behavior = self
                .behavior
                .lock()
                .unwrap()
                .get(instance_id)
                .copied()
                .unwrap_or(Behavior::Status(200));
            match behavior {
                Behavior::Status(code) => Ok(code),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(200)
                }
                Behavior::Refused => Err("connection refused".to_string()),
            }
        }
    }

    fn setup() -> (Arc<ScriptedProbe>, MembershipMonitor) {
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = MembershipMonitor::new(probe.clone());
        (probe, monitor)
    }

    fn cfg() -> HealthCheckConfig {
        HealthCheckConfig::new(30)
    }

    async fn in_service(monitor: &MembershipMonitor, ids: &[&str], group: &str) {
        for id in ids {
            monitor.register(*id, group, cfg()).await;
        }
        // checks at t=0 and t=15
        tokio::time::sleep(Duration::from_secs(16)).await;
        for id in ids {
            assert_eq!(monitor.state(id).await, Some(MemberState::InService));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_enters_service_after_two_checks() {
        let (_, monitor) = setup();
        assert!(monitor.register("i-1", "asg-1", cfg()).await);
        assert!(!monitor.register("i-1", "asg-1", cfg()).await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.state("i-1").await, Some(MemberState::Initializing));
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(monitor.state("i-1").await, Some(MemberState::InService));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_bad_status_marks_unhealthy() {
        let (probe, monitor) = setup();
        in_service(&monitor, &["i-1"], "asg-1").await;
        probe.set("i-1", Behavior::Status(503));
        // checks at t=30 and t=45
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(monitor.state("i-1").await, Some(MemberState::Unhealthy));

        probe.set("i-1", Behavior::Status(200));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(monitor.state("i-1").await, Some(MemberState::InService));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_probe_timeout_counts_as_failure() {
        let (probe, monitor) = setup();
        in_service(&monitor, &["i-1"], "asg-1").await;
        probe.set("i-1", Behavior::Hang);
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(monitor.state("i-1").await, Some(MemberState::Unhealthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_initializing_failures_stay_initializing() {
        let (probe, monitor) = setup();
        probe.set("i-1", Behavior::Refused);
        monitor.register("i-1", "asg-1", cfg()).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        let snap = monitor.snapshot().await;
        assert_eq!(snap[0].state, MemberState::Initializing);
        assert!(snap[0].consecutive_failures >= 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_drain_waits_for_timeout() {
        let (_, monitor) = setup();
        in_service(&monitor, &["i-1"], "asg-1").await;
        monitor.set_in_flight("i-1", 3).await.unwrap();

        let start = Instant::now();
        monitor.terminate("i-1").await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
        assert_eq!(monitor.state("i-1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_drain_ends_at_zero_in_flight() {
        let (_, monitor) = setup();
        in_service(&monitor, &["i-1"], "asg-1").await;
        monitor.set_in_flight("i-1", 2).await.unwrap();

        let start = Instant::now();
        let m = monitor.clone();
        let handle = tokio::spawn(async move { m.terminate("i-1").await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.state("i-1").await, Some(MemberState::Draining));
        monitor.set_in_flight("i-1", 0).await.unwrap();
        handle.await.unwrap().unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_drain_idle_member_immediate() {
        let (_, monitor) = setup();
        in_service(&monitor, &["i-1"], "asg-1").await;
        let start = Instant::now();
        monitor.terminate("i-1").await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_initializing_terminates_directly() {
        let (probe, monitor) = setup();
        probe.set("i-1", Behavior::Refused);
        monitor.register("i-1", "asg-1", cfg()).await;
        monitor.terminate("i-1").await.unwrap();
        assert!(monitor.snapshot().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_begin_drain_rejects_initializing() {
        let (probe, monitor) = setup();
        probe.set("i-1", Behavior::Refused);
        monitor.register("i-1", "asg-1", cfg()).await;
        let err = monitor.begin_drain("i-1").await.unwrap_err();
        assert!(matches!(err, MonitorError::Transition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_terminate_group() {
        let (_, monitor) = setup();
        in_service(&monitor, &["i-1", "i-2"], "asg-1").await;
        monitor.register("i-9", "asg-2", cfg()).await;
        monitor.set_in_flight("i-1", 1).await.unwrap();
        monitor.set_in_flight("i-2", 1).await.unwrap();

        let start = Instant::now();
        let removed = monitor.terminate_group("asg-1").await.unwrap();
        assert_eq!(removed, vec!["i-1", "i-2"]);
        // drains overlap
        assert!(start.elapsed() < Duration::from_secs(31));
        let left = monitor.snapshot().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].instance_id, "i-9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_group_removal_skips_vanished_members() {
        let (_, monitor) = setup();
        in_service(&monitor, &["i-1", "i-2"], "asg-1").await;
        monitor.set_in_flight("i-2", 1).await.unwrap();
        // i-gone left between the group snapshot and its removal
        let ids: Vec<String> = ["i-1", "i-gone", "i-2"].iter().map(|s| s.to_string()).collect();

        let start = Instant::now();
        let removed = monitor.remove_all(&ids).await.unwrap();
        assert_eq!(removed, vec!["i-1", "i-2"]);
        // i-2 drained to its timeout even though i-gone was unknown
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(monitor.snapshot().await.is_empty());
        assert!(monitor.terminate_group("asg-1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_scale_in_prefers_not_in_service() {
        let (probe, monitor) = setup();
        probe.set("i-2", Behavior::Status(500));
        for id in ["i-1", "i-2", "i-3"] {
            monitor.register(id, "asg-1", cfg()).await;
        }
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(monitor.state("i-2").await, Some(MemberState::Initializing));

        let removed = monitor.scale_in("asg-1", 2).await.unwrap();
        assert_eq!(removed, vec!["i-2"]);
        let counts = monitor.state_counts().await;
        assert_eq!(counts.get(&MemberState::InService), Some(&2));
        assert_eq!(counts.get(&MemberState::Initializing), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_unknown_member() {
        let (_, monitor) = setup();
        assert_eq!(
            monitor.terminate("i-404").await.unwrap_err(),
            MonitorError::UnknownMember {
                instance: "i-404".into()
            }
        );
        assert!(monitor.set_in_flight("i-404", 0).await.is_err());
        assert!(monitor
            .record_outcome("i-404", CheckOutcome::Pass)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_external_outcomes() {
        let (probe, monitor) = setup();
        probe.set("i-1", Behavior::Refused);
        monitor.register("i-1", "asg-1", cfg()).await;
        monitor.shutdown().await;
        assert!(monitor
            .record_outcome("i-1", CheckOutcome::Pass)
            .await
            .unwrap()
            .is_none());
        let t = monitor
            .record_outcome("i-1", CheckOutcome::Pass)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.to, MemberState::InService);
    }
}
