//! In-memory stand-ins for the cluster, used by the tests of every crate
use crate::{Error, EventSink, OperatorEvent, PvcPhase, Reason, ResourceClient, Result};
use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::ObjectReference,
};
use kube::{api::ObjectMeta, runtime::events::EventType};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct MockState {
    deployments: BTreeMap<Key, Deployment>,
    // `None` entries answer "not found"
    phases: BTreeMap<Key, VecDeque<Option<PvcPhase>>>,
    fail_reads: bool,
    fail_patches: bool,
    pvc_read_errors: usize,
    pvc_reads: usize,
    patches: Vec<(String, String, i32)>,
}

#[derive(Clone, Default)]
pub struct MockResources {
    state: Arc<Mutex<MockState>>,
}

impl MockResources {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_deployment(&self, namespace: &str, name: &str, replicas: i32) {
        let deploy = Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };
        self.state().deployments.insert(key(namespace, name), deploy);
    }

    pub fn replicas(&self, namespace: &str, name: &str) -> Option<i32> {
        self.state()
            .deployments
            .get(&key(namespace, name))
            .and_then(|d| d.spec.as_ref())
            .and_then(|s| s.replicas)
    }

    /// Phases returned by successive reads; the last one sticks
    pub fn script_pvc(&self, namespace: &str, name: &str, phases: &[PvcPhase]) {
        let queue = phases.iter().cloned().map(Some).collect();
        self.state().phases.insert(key(namespace, name), queue);
    }

    pub fn remove_pvc(&self, namespace: &str, name: &str) {
        self.state().phases.insert(key(namespace, name), VecDeque::from([None]));
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn fail_patches(&self, fail: bool) {
        self.state().fail_patches = fail;
    }

    /// The next `count` PVC reads fail
    pub fn fail_pvc_reads(&self, count: usize) {
        self.state().pvc_read_errors = count;
    }

    pub fn patches(&self) -> Vec<(String, String, i32)> {
        self.state().patches.clone()
    }

    pub fn pvc_reads(&self) -> usize {
        self.state().pvc_reads
    }
}

#[async_trait]
impl ResourceClient for MockResources {
    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Option<Deployment>> {
        let state = self.state();
        if state.fail_reads {
            return Err(Error::Other(format!("injected read failure for {namespace}/{name}")));
        }
        Ok(state.deployments.get(&key(namespace, name)).cloned())
    }

    async fn patch_deployment_replicas(&self, name: &str, namespace: &str, replicas: i32) -> Result<i32> {
        let mut state = self.state();
        state.patches.push((namespace.to_string(), name.to_string(), replicas));
        if state.fail_patches {
            return Err(Error::Other(format!("injected patch failure for {namespace}/{name}")));
        }
        match state.deployments.get_mut(&key(namespace, name)) {
            Some(d) => {
                d.spec.get_or_insert_with(DeploymentSpec::default).replicas = Some(replicas);
                Ok(replicas)
            }
            None => Err(Error::NotFound("Deployment".to_string(), namespace.to_string(), name.to_string())),
        }
    }

    async fn get_pvc_phase(&self, name: &str, namespace: &str) -> Result<PvcPhase> {
        let mut state = self.state();
        state.pvc_reads += 1;
        if state.pvc_read_errors > 0 {
            state.pvc_read_errors -= 1;
            return Err(Error::Other(format!("injected read failure for {namespace}/{name}")));
        }
        let not_found = || {
            Error::NotFound(
                "PersistentVolumeClaim".to_string(),
                namespace.to_string(),
                name.to_string(),
            )
        };
        let queue = state.phases.get_mut(&key(namespace, name)).ok_or_else(not_found)?;
        let current = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
        current.flatten().ok_or_else(not_found)
    }
}

/// An event as seen by [`MemorySink`]
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub target: Option<ObjectReference>,
    pub type_: EventType,
    pub reason: Reason,
    pub message: String,
}

impl RecordedEvent {
    pub fn is_warning(&self) -> bool {
        self.type_ == EventType::Warning
    }
}

#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reasons(&self) -> Vec<Reason> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, target: Option<&ObjectReference>, ev: OperatorEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedEvent {
                target: target.cloned(),
                type_: ev.type_,
                reason: ev.reason,
                message: ev.message,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_phases_last_one_sticks() {
        let m = MockResources::default();
        m.script_pvc("apps", "data-pvc", &[PvcPhase::Failed, PvcPhase::Bound]);
        assert_eq!(m.get_pvc_phase("data-pvc", "apps").await.unwrap(), PvcPhase::Failed);
        assert_eq!(m.get_pvc_phase("data-pvc", "apps").await.unwrap(), PvcPhase::Bound);
        assert_eq!(m.get_pvc_phase("data-pvc", "apps").await.unwrap(), PvcPhase::Bound);
        assert_eq!(m.pvc_reads(), 3);
    }

    #[tokio::test]
    async fn test_removed_pvc_is_not_found() {
        let m = MockResources::default();
        m.remove_pvc("apps", "data-pvc");
        assert!(m.get_pvc_phase("data-pvc", "apps").await.unwrap_err().is_not_found());
        assert!(m.get_pvc_phase("other-pvc", "apps").await.unwrap_err().is_not_found());
    }
}
