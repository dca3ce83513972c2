//! In-memory provider for dry runs and tests.
//!
//! Assigns deterministic ids (`sg-00000001`, `lt-00000002`, ...), publishes the
//! outputs each kind declares, and can be told to fail specific nodes.

use super::{Provisioned, ResourceProvider};
use crate::core::types::{AttrValue, ResourceKind};
use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Update,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub kind: CallKind,
    pub node_id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone)]
pub struct LiveResource {
    pub node_id: String,
    pub kind: ResourceKind,
    pub attributes: IndexMap<String, AttrValue>,
    pub outputs: IndexMap<String, AttrValue>,
}

#[derive(Default)]
struct Inner {
    counter: u32,
    live: IndexMap<String, LiveResource>,
    failures: FxHashMap<String, String>,
    calls: Vec<ProviderCall>,
}

#[derive(Default)]
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
    /// Refuse to destroy resources other live resources still reference
    strict: bool,
    latency: Option<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

fn id_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::SecurityGroup => "sg",
        ResourceKind::LaunchTemplate => "lt",
        ResourceKind::AutoscalingGroup => "asg",
        ResourceKind::LoadBalancer => "lb",
        ResourceKind::Listener => "lsn",
        ResourceKind::ListenerRule => "rule",
        ResourceKind::TargetGroup => "tg",
    }
}

fn mentions(value: &AttrValue, needle: &str) -> bool {
    match value {
        AttrValue::Str(s) => s == needle,
        AttrValue::List(items) => items.iter().any(|v| mentions(v, needle)),
        AttrValue::Map(entries) => entries.values().any(|v| mentions(v, needle)),
        _ => false,
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call for `node_id` fail with `message` until cleared.
    pub fn fail_on(&self, node_id: &str, message: &str) {
        self.lock()
            .failures
            .insert(node_id.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Live resources keyed by instance id, in creation order.
    pub fn live(&self) -> IndexMap<String, LiveResource> {
        self.lock().live.clone()
    }

    /// Most calls that were ever in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn record(&self, inner: &mut Inner, kind: CallKind, node_id: &str, instance_id: &str) -> Result<(), String> {
        inner.calls.push(ProviderCall {
            kind,
            node_id: node_id.to_string(),
            instance_id: instance_id.to_string(),
        });
        match inner.failures.get(node_id) {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    fn outputs_for(
        kind: ResourceKind,
        instance_id: &str,
        node_id: &str,
        serial: u32,
        attributes: &IndexMap<String, AttrValue>,
        version: i64,
    ) -> IndexMap<String, AttrValue> {
        let name = attributes
            .get("name")
            .and_then(AttrValue::as_str)
            .unwrap_or(node_id)
            .to_string();
        let mut outputs = IndexMap::new();
        for output in kind.outputs() {
            let value = match *output {
                "id" => AttrValue::from(instance_id),
                "arn" => AttrValue::from(format!("arn:sim:{}:{}", kind, instance_id)),
                "name" => AttrValue::from(name.clone()),
                "dns_name" => AttrValue::from(format!("{}-{}.elb.sim.internal", name, serial)),
                "latest_version" => AttrValue::Int(version),
                other => AttrValue::from(format!("{}-{}", instance_id, other)),
            };
            outputs.insert(output.to_string(), value);
        }
        outputs
    }
}

#[async_trait]
impl ResourceProvider for InMemoryProvider {
    async fn create(
        &self,
        node_id: &str,
        kind: ResourceKind,
        attributes: &IndexMap<String, AttrValue>,
    ) -> Result<Provisioned, String> {
        self.enter().await;
        let result = {
            let mut inner = self.lock();
            inner.counter += 1;
            let serial = inner.counter;
            let instance_id = format!("{}-{:08x}", id_prefix(kind), serial);
            self.record(&mut inner, CallKind::Create, node_id, &instance_id)
                .map(|()| {
                    let outputs = Self::outputs_for(kind, &instance_id, node_id, serial, attributes, 1);
                    inner.live.insert(
                        instance_id.clone(),
                        LiveResource {
                            node_id: node_id.to_string(),
                            kind,
                            attributes: attributes.clone(),
                            outputs: outputs.clone(),
                        },
                    );
                    Provisioned { instance_id, outputs }
                })
        };
        self.leave();
        result
    }

    async fn update(
        &self,
        node_id: &str,
        kind: ResourceKind,
        instance_id: &str,
        attributes: &IndexMap<String, AttrValue>,
    ) -> Result<IndexMap<String, AttrValue>, String> {
        self.enter().await;
        let result = {
            let mut inner = self.lock();
            self.record(&mut inner, CallKind::Update, node_id, instance_id)
                .and_then(|()| {
                    let live = inner
                        .live
                        .get_mut(instance_id)
                        .ok_or_else(|| format!("{} not found", instance_id))?;
                    let version = live
                        .outputs
                        .get("latest_version")
                        .and_then(AttrValue::as_int)
                        .map_or(1, |v| v + 1);
                    let serial = instance_id
                        .rsplit('-')
                        .next()
                        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                        .unwrap_or(0);
                    live.outputs = Self::outputs_for(kind, instance_id, node_id, serial, attributes, version);
                    live.attributes = attributes.clone();
                    Ok(live.outputs.clone())
                })
        };
        self.leave();
        result
    }

    async fn destroy(&self, node_id: &str, _kind: ResourceKind, instance_id: &str) -> Result<(), String> {
        self.enter().await;
        let result = {
            let mut inner = self.lock();
            self.record(&mut inner, CallKind::Destroy, node_id, instance_id)
                .and_then(|()| {
                    let Some(target) = inner.live.get(instance_id) else {
                        // already gone
                        return Ok(());
                    };
                    if self.strict {
                        // names are not unique, so only identifiers count as a hold
                        let needles: Vec<&str> = ["id", "arn"]
                            .iter()
                            .filter_map(|k| target.outputs.get(*k).and_then(AttrValue::as_str))
                            .collect();
                        let holder = inner.live.iter().find(|(id, r)| {
                            id.as_str() != instance_id
                                && r.attributes.values().any(|v| needles.iter().any(|n| mentions(v, n)))
                        });
                        if let Some((holder_id, holder)) = holder {
                            return Err(format!(
                                "{} is in use by {} ({})",
                                instance_id, holder_id, holder.node_id
                            ));
                        }
                    }
                    inner.live.shift_remove(instance_id);
                    Ok(())
                })
        };
        self.leave();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, AttrValue)]) -> IndexMap<String, AttrValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_memory_create_outputs() {
        let p = InMemoryProvider::new();
        let sg = p
            .create("instance_sg", ResourceKind::SecurityGroup, &IndexMap::new())
            .await
            .unwrap();
        assert_eq!(sg.instance_id, "sg-00000001");
        assert_eq!(sg.outputs["arn"], AttrValue::from("arn:sim:security_group:sg-00000001"));

        let lb = p
            .create(
                "alb",
                ResourceKind::LoadBalancer,
                &attrs(&[("name", AttrValue::from("web"))]),
            )
            .await
            .unwrap();
        assert_eq!(lb.outputs["dns_name"], AttrValue::from("web-2.elb.sim.internal"));

        let asg = p
            .create("asg", ResourceKind::AutoscalingGroup, &IndexMap::new())
            .await
            .unwrap();
        assert_eq!(asg.outputs["name"], AttrValue::from("asg"));
        assert_eq!(p.live().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_update_bumps_template_version() {
        let p = InMemoryProvider::new();
        let lt = p
            .create("lt", ResourceKind::LaunchTemplate, &IndexMap::new())
            .await
            .unwrap();
        assert_eq!(lt.outputs["latest_version"], AttrValue::Int(1));
        let outputs = p
            .update(
                "lt",
                ResourceKind::LaunchTemplate,
                &lt.instance_id,
                &attrs(&[("instance_type", AttrValue::from("t3.micro"))]),
            )
            .await
            .unwrap();
        assert_eq!(outputs["latest_version"], AttrValue::Int(2));
        assert_eq!(outputs["id"], AttrValue::from(lt.instance_id.as_str()));
    }

    #[tokio::test]
    async fn test_memory_fail_on() {
        let p = InMemoryProvider::new();
        p.fail_on("alb", "quota exceeded");
        let err = p
            .create("alb", ResourceKind::LoadBalancer, &IndexMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, "quota exceeded");
        assert!(p.live().is_empty());
        assert_eq!(p.calls().len(), 1);

        p.clear_failures();
        assert!(p
            .create("alb", ResourceKind::LoadBalancer, &IndexMap::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_memory_strict_destroy_in_use() {
        let p = InMemoryProvider::new().strict();
        let lt = p
            .create("lt", ResourceKind::LaunchTemplate, &IndexMap::new())
            .await
            .unwrap();
        let asg = p
            .create(
                "asg",
                ResourceKind::AutoscalingGroup,
                &attrs(&[("launch_template_id", AttrValue::from(lt.instance_id.as_str()))]),
            )
            .await
            .unwrap();

        let err = p
            .destroy("lt", ResourceKind::LaunchTemplate, &lt.instance_id)
            .await
            .unwrap_err();
        assert!(err.contains("in use by"));

        p.destroy("asg", ResourceKind::AutoscalingGroup, &asg.instance_id)
            .await
            .unwrap();
        p.destroy("lt", ResourceKind::LaunchTemplate, &lt.instance_id)
            .await
            .unwrap();
        assert!(p.live().is_empty());
    }

    #[tokio::test]
    async fn test_memory_destroy_missing_is_ok() {
        let p = InMemoryProvider::new();
        assert!(p
            .destroy("gone", ResourceKind::TargetGroup, "tg-deadbeef")
            .await
            .is_ok());
        assert_eq!(p.calls()[0].kind, CallKind::Destroy);
    }
}
