use crate::metrics::IncidentMetrics;
use chrono::{DateTime, Utc};
use common::{NameResolver, OperatorEvent, PvcKey, PvcObservation, Reason, Workloads};
use k8s_openapi::api::core::v1::ObjectReference;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    task::{AbortHandle, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

/// A degraded claim whose Deployment has been scaled down
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    #[serde(skip)]
    pub id: u64,
    pub pvc: PvcKey,
    pub deployment: String,
    pub namespace: String,
    /// Replica count observed before the scale-down
    pub original_replicas: i32,
    pub opened_at: DateTime<Utc>,
}

/// Result of one observation of a claim
#[derive(Debug)]
pub enum Outcome {
    /// Phase is not degraded, nothing to do
    Healthy,
    /// An incident is already open for this claim
    AlreadyHandling,
    /// The claim is degraded but its Deployment could not be read
    DeploymentMissing,
    /// The Deployment was scaled down, the handle resolves once it is restored
    IncidentOpened(JoinHandle<()>),
}

enum Slot {
    Opening,
    Active { incident: Incident, abort: AbortHandle },
}

/// Owns the incidents, one per claim at most, and their recovery workers
#[derive(Clone)]
pub struct ReplicaGuard {
    workloads: Workloads,
    resolver: NameResolver,
    interval: Duration,
    metrics: IncidentMetrics,
    slots: Arc<Mutex<HashMap<PvcKey, Slot>>>,
    next_id: Arc<AtomicU64>,
}

/// Releases an `Opening` slot unless the incident got registered
struct Claim<'a> {
    guard: &'a ReplicaGuard,
    key: PvcKey,
    armed: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.guard.slots();
            if matches!(slots.get(&self.key), Some(Slot::Opening)) {
                slots.remove(&self.key);
            }
        }
    }
}

impl ReplicaGuard {
    pub fn new(
        workloads: Workloads,
        resolver: NameResolver,
        interval: Duration,
        metrics: IncidentMetrics,
    ) -> Self {
        Self {
            workloads,
            resolver,
            interval,
            metrics,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PvcKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, key: &PvcKey) -> Option<Claim<'_>> {
        let mut slots = self.slots();
        if slots.contains_key(key) {
            return None;
        }
        slots.insert(key.clone(), Slot::Opening);
        Some(Claim {
            guard: self,
            key: key.clone(),
            armed: true,
        })
    }

    pub fn is_handling(&self, key: &PvcKey) -> bool {
        self.slots().contains_key(key)
    }

    /// Open incidents, sorted by claim
    pub fn incidents(&self) -> Vec<Incident> {
        let mut list: Vec<Incident> = self
            .slots()
            .values()
            .filter_map(|s| match s {
                Slot::Active { incident, .. } => Some(incident.clone()),
                Slot::Opening => None,
            })
            .collect();
        list.sort_by(|a, b| a.pvc.cmp(&b.pvc));
        list
    }

    /// Reacts to the phase of a claim.
    ///
    /// A degraded claim without an incident gets its Deployment scaled to zero and a
    /// recovery worker that restores the replica count once the claim is healthy again.
    pub async fn observe(&self, obs: &PvcObservation) -> Outcome {
        if !obs.phase.is_degraded() {
            return Outcome::Healthy;
        }
        let key = obs.key();
        let Some(mut claim) = self.claim(&key) else {
            debug!("Incident already open for PersistentVolumeClaim {key}");
            return Outcome::AlreadyHandling;
        };

        self.workloads
            .events()
            .publish(
                Some(&obs.reference),
                OperatorEvent::warning(
                    Reason::PVCReadOnly,
                    format!(
                        "PVC {} is in {} state. Scaling down associated deployment.",
                        obs.name, obs.phase
                    ),
                ),
            )
            .await;

        let deployment = self.resolver.deployment_name_for(&obs.name);
        let Some(handle) = self.workloads.get_deployment(&deployment, &obs.namespace).await else {
            info!(
                "No deployment {}/{} to protect for PersistentVolumeClaim {key}",
                obs.namespace, deployment
            );
            return Outcome::DeploymentMissing;
        };

        let incident = Incident {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pvc: key.clone(),
            deployment: handle.name.clone(),
            namespace: handle.namespace.clone(),
            original_replicas: handle.replicas,
            opened_at: Utc::now(),
        };
        let scaled = self
            .workloads
            .scale_deployment(
                &incident.deployment,
                &incident.namespace,
                0,
                Some(format!(
                    "Scaling deployment {} to 0 replicas due to PVC being in read-only state.",
                    incident.deployment
                )),
            )
            .await;
        self.metrics.scaled("down", scaled);
        self.metrics.opened.inc();
        self.metrics.active.inc();
        info!(
            "Opened incident for PersistentVolumeClaim {key}: deployment {} had {} replicas",
            incident.deployment, incident.original_replicas
        );

        // the worker needs the lock to unregister, so it cannot finish before being registered
        let mut slots = self.slots();
        let worker = tokio::spawn(self.clone().recover(incident.clone(), obs.reference.clone()));
        slots.insert(
            key,
            Slot::Active {
                incident,
                abort: worker.abort_handle(),
            },
        );
        claim.armed = false;
        drop(slots);
        Outcome::IncidentOpened(worker)
    }

    /// Recovery worker: polls the claim until it leaves the degraded phases.
    ///
    /// There is no deadline, the Deployment stays down for as long as the storage does.
    async fn recover(self, incident: Incident, pvc_ref: ObjectReference) {
        let pvc = &incident.pvc;
        let recovered = loop {
            tokio::time::sleep(self.interval).await;
            match self.workloads.pvc_phase(&pvc.name, &pvc.namespace).await {
                Ok(phase) if phase.is_degraded() => {
                    debug!("PersistentVolumeClaim {pvc} still {phase}");
                }
                Ok(phase) => break Some(phase),
                Err(e) if e.is_not_found() => {
                    warn!("PersistentVolumeClaim {pvc} no longer exists, ending its incident");
                    break None;
                }
                Err(e) => warn!("While reading PersistentVolumeClaim {pvc}: {e}"),
            }
        };

        let message = match recovered {
            Some(phase) => {
                info!("PersistentVolumeClaim {pvc} is {phase} again");
                self.workloads
                    .events()
                    .publish(
                        Some(&pvc_ref),
                        OperatorEvent::normal(
                            Reason::PVCBackToNormal,
                            format!(
                                "PVC {} is back to normal state. Scaling up deployment {}.",
                                pvc.name, incident.deployment
                            ),
                        ),
                    )
                    .await;
                format!(
                    "Scaling deployment {} back to {} replicas as PVC is back to normal.",
                    incident.deployment, incident.original_replicas
                )
            }
            None => format!(
                "Scaling deployment {} back to {} replicas as PVC {} no longer exists.",
                incident.deployment, incident.original_replicas, pvc.name
            ),
        };
        self.restore(&incident, message).await;
        self.unregister(&incident);
    }

    async fn restore(&self, incident: &Incident, message: String) {
        let scaled = self
            .workloads
            .scale_deployment(
                &incident.deployment,
                &incident.namespace,
                incident.original_replicas,
                Some(message),
            )
            .await;
        self.metrics.scaled("up", scaled);
    }

    fn unregister(&self, incident: &Incident) {
        let mut slots = self.slots();
        if matches!(slots.get(&incident.pvc), Some(Slot::Active { incident: i, .. }) if i.id == incident.id) {
            slots.remove(&incident.pvc);
            self.metrics.active.dec();
        }
    }

    /// Stops the recovery worker of a claim and restores its Deployment right away.
    ///
    /// Returns the cancelled incident, if one was open.
    pub async fn cancel(&self, key: &PvcKey) -> Option<Incident> {
        let incident = {
            let mut slots = self.slots();
            match slots.remove(key) {
                Some(Slot::Active { incident, abort }) => {
                    abort.abort();
                    self.metrics.active.dec();
                    incident
                }
                Some(Slot::Opening) => {
                    // detection is still running, let it finish
                    slots.insert(key.clone(), Slot::Opening);
                    return None;
                }
                None => return None,
            }
        };
        info!("Cancelling incident for PersistentVolumeClaim {key}");
        let message = format!(
            "Scaling deployment {} back to {} replicas as the watch on PVC {} was cancelled.",
            incident.deployment, incident.original_replicas, key.name
        );
        self.restore(&incident, message).await;
        Some(incident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        EventSink, PvcPhase,
        mock::{MemorySink, MockResources},
    };

    const NS: &str = "apps";

    fn setup() -> (Arc<MockResources>, Arc<MemorySink>, ReplicaGuard, IncidentMetrics) {
        let client = Arc::new(MockResources::default());
        let sink = Arc::new(MemorySink::default());
        let metrics = IncidentMetrics::default();
        let guard = ReplicaGuard::new(
            Workloads::new(client.clone(), sink.clone()),
            NameResolver::default(),
            Duration::from_secs(30),
            metrics.clone(),
        );
        (client, sink, guard, metrics)
    }

    /// Gives the runtime a turn before recording, as an apiserver round trip would
    struct YieldingSink(Arc<MemorySink>);

    #[async_trait::async_trait]
    impl EventSink for YieldingSink {
        async fn publish(&self, target: Option<&ObjectReference>, ev: OperatorEvent) {
            tokio::task::yield_now().await;
            self.0.publish(target, ev).await;
        }
    }

    fn yielding_setup() -> (Arc<MockResources>, Arc<MemorySink>, ReplicaGuard) {
        let client = Arc::new(MockResources::default());
        let sink = Arc::new(MemorySink::default());
        let guard = ReplicaGuard::new(
            Workloads::new(client.clone(), Arc::new(YieldingSink(sink.clone()))),
            NameResolver::default(),
            Duration::from_secs(30),
            IncidentMetrics::default(),
        );
        (client, sink, guard)
    }

    fn obs(name: &str, phase: PvcPhase) -> PvcObservation {
        PvcObservation::new(NS, name, phase)
    }

    fn opened(outcome: Outcome) -> JoinHandle<()> {
        match outcome {
            Outcome::IncidentOpened(h) => h,
            other => panic!("expected an incident, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_phases_do_nothing() {
        let (client, sink, guard, _) = setup();
        client.add_deployment(NS, "data", 3);
        for phase in [
            PvcPhase::Pending,
            PvcPhase::Bound,
            PvcPhase::Lost,
            PvcPhase::Unknown(String::new()),
        ] {
            assert!(matches!(guard.observe(&obs("data-pvc", phase)).await, Outcome::Healthy));
        }
        assert!(sink.events().is_empty());
        assert!(client.patches().is_empty());
        assert!(guard.incidents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_claim_scales_down_then_restores() {
        let (client, sink, guard, metrics) = setup();
        client.add_deployment(NS, "data", 3);
        client.script_pvc(NS, "data-pvc", &[
            PvcPhase::Failed,
            PvcPhase::Failed,
            PvcPhase::Failed,
            PvcPhase::Bound,
        ]);

        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::Failed)).await);
        assert_eq!(client.replicas(NS, "data"), Some(0));
        let incidents = guard.incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].original_replicas, 3);
        assert_eq!(incidents[0].deployment, "data");
        assert_eq!(metrics.active.get(), 1);

        worker.await.unwrap();
        assert_eq!(client.pvc_reads(), 4);
        assert_eq!(client.replicas(NS, "data"), Some(3));
        assert_eq!(client.patches(), vec![
            (NS.to_string(), "data".to_string(), 0),
            (NS.to_string(), "data".to_string(), 3),
        ]);
        assert_eq!(sink.reasons(), vec![
            Reason::PVCReadOnly,
            Reason::DeploymentScaled,
            Reason::PVCBackToNormal,
            Reason::DeploymentScaled,
        ]);
        let events = sink.events();
        assert!(events[0].is_warning());
        assert_eq!(events[0].message, "PVC data-pvc is in Failed state. Scaling down associated deployment.");
        assert_eq!(events[0].target.as_ref().and_then(|t| t.name.as_deref()), Some("data-pvc"));
        assert_eq!(
            events[3].message,
            "Scaling deployment data back to 3 replicas as PVC is back to normal."
        );
        assert!(guard.incidents().is_empty());
        assert_eq!(metrics.active.get(), 0);
        assert_eq!(metrics.opened.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_waits_one_interval_per_poll() {
        let (client, _sink, guard, _) = setup();
        client.add_deployment(NS, "data", 2);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::ReadOnly, PvcPhase::ReadOnly, PvcPhase::Bound]);
        let start = tokio::time::Instant::now();
        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::ReadOnly)).await);
        worker.await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_deployment_opens_nothing() {
        let (client, sink, guard, _) = setup();
        let outcome = guard.observe(&obs("orphan-pvc", PvcPhase::ReadOnly)).await;
        assert!(matches!(outcome, Outcome::DeploymentMissing));
        assert_eq!(sink.reasons(), vec![Reason::PVCReadOnly, Reason::DeploymentReadError]);
        assert!(client.patches().is_empty());
        assert!(guard.incidents().is_empty());
        assert!(!guard.is_handling(&PvcKey::new(NS, "orphan-pvc")));

        // next tick starts detection from scratch
        client.add_deployment(NS, "orphan", 1);
        client.script_pvc(NS, "orphan-pvc", &[PvcPhase::Bound]);
        let worker = opened(guard.observe(&obs("orphan-pvc", PvcPhase::ReadOnly)).await);
        worker.await.unwrap();
        assert_eq!(client.replicas(NS, "orphan"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_observation_while_waiting_is_ignored() {
        let (client, sink, guard, metrics) = setup();
        client.add_deployment(NS, "data", 3);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Failed]);

        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::Failed)).await);
        for _ in 0..3 {
            assert!(matches!(
                guard.observe(&obs("data-pvc", PvcPhase::Failed)).await,
                Outcome::AlreadyHandling
            ));
        }
        assert_eq!(client.patches().len(), 1);
        assert_eq!(guard.incidents().len(), 1);
        assert_eq!(metrics.opened.get(), 1);
        assert_eq!(sink.reasons(), vec![Reason::PVCReadOnly, Reason::DeploymentScaled]);

        client.script_pvc(NS, "data-pvc", &[PvcPhase::Bound]);
        worker.await.unwrap();
        assert_eq!(client.replicas(NS, "data"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_failure_still_waits_with_recorded_count() {
        let (client, sink, guard, _) = setup();
        client.add_deployment(NS, "data", 3);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Failed]);
        client.fail_patches(true);

        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::Failed)).await);
        assert_eq!(sink.reasons(), vec![Reason::PVCReadOnly, Reason::DeploymentScaleError]);
        let events = sink.events();
        assert!(events[1].is_warning());
        assert_eq!(events[1].target.as_ref().and_then(|t| t.name.as_deref()), Some("data"));
        assert_eq!(guard.incidents()[0].original_replicas, 3);

        client.fail_patches(false);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Bound]);
        worker.await.unwrap();
        assert_eq!(client.patches().last(), Some(&(NS.to_string(), "data".to_string(), 3)));
        assert_eq!(sink.reasons().last(), Some(&Reason::DeploymentScaled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_failure_is_reported_once() {
        let (client, sink, guard, _) = setup();
        client.add_deployment(NS, "data", 3);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Bound]);
        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::Failed)).await);
        client.fail_patches(true);
        worker.await.unwrap();
        let reasons = sink.reasons();
        assert_eq!(reasons.iter().filter(|r| **r == Reason::DeploymentScaleError).count(), 1);
        assert_eq!(reasons.last(), Some(&Reason::DeploymentScaleError));
        assert_eq!(client.replicas(NS, "data"), Some(0));
        assert!(guard.incidents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_errors_keep_the_worker_waiting() {
        let (client, _sink, guard, _) = setup();
        client.add_deployment(NS, "data", 4);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Bound]);
        client.fail_pvc_reads(2);
        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::ReadOnly)).await);
        worker.await.unwrap();
        assert_eq!(client.pvc_reads(), 3);
        assert_eq!(client.replicas(NS, "data"), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_claim_restores_without_back_to_normal() {
        let (client, sink, guard, _) = setup();
        client.add_deployment(NS, "data", 2);
        client.remove_pvc(NS, "data-pvc");
        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::Failed)).await);
        worker.await.unwrap();
        assert_eq!(client.replicas(NS, "data"), Some(2));
        assert!(!sink.reasons().contains(&Reason::PVCBackToNormal));
        assert!(sink.events().last().unwrap().message.contains("no longer exists"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_restores_and_stops_worker() {
        let (client, _sink, guard, metrics) = setup();
        client.add_deployment(NS, "data", 3);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Failed]);
        let key = PvcKey::new(NS, "data-pvc");

        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::Failed)).await);
        let cancelled = guard.cancel(&key).await.unwrap();
        assert_eq!(cancelled.original_replicas, 3);
        assert_eq!(client.replicas(NS, "data"), Some(3));
        assert!(worker.await.unwrap_err().is_cancelled());
        assert!(guard.incidents().is_empty());
        assert_eq!(metrics.active.get(), 0);
        assert!(guard.cancel(&key).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_replicas_are_restored_to_zero() {
        let (client, _sink, guard, _) = setup();
        client.add_deployment(NS, "data", 0);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Bound]);
        let worker = opened(guard.observe(&obs("data-pvc", PvcPhase::Failed)).await);
        worker.await.unwrap();
        assert_eq!(client.replicas(NS, "data"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_are_independent() {
        let (client, _sink, guard, _) = setup();
        client.add_deployment(NS, "a", 1);
        client.add_deployment(NS, "b", 5);
        client.script_pvc(NS, "a-pvc", &[PvcPhase::Failed, PvcPhase::Bound]);
        client.script_pvc(NS, "b-pvc", &[PvcPhase::Bound]);
        let wa = opened(guard.observe(&obs("a-pvc", PvcPhase::Failed)).await);
        let wb = opened(guard.observe(&obs("b-pvc", PvcPhase::ReadOnly)).await);
        assert_eq!(guard.incidents().len(), 2);
        wa.await.unwrap();
        wb.await.unwrap();
        assert_eq!(client.replicas(NS, "a"), Some(1));
        assert_eq!(client.replicas(NS, "b"), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_observations_open_one_incident() {
        let (client, sink, guard) = yielding_setup();
        client.add_deployment(NS, "data", 3);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Failed]);
        let o = obs("data-pvc", PvcPhase::Failed);

        let (worker, other) = match tokio::join!(guard.observe(&o), guard.observe(&o)) {
            (Outcome::IncidentOpened(w), other) | (other, Outcome::IncidentOpened(w)) => (w, other),
            outcomes => panic!("expected one incident, got {outcomes:?}"),
        };
        assert!(matches!(other, Outcome::AlreadyHandling));
        assert_eq!(client.patches().len(), 1);
        assert_eq!(guard.incidents().len(), 1);
        assert_eq!(sink.reasons(), vec![Reason::PVCReadOnly, Reason::DeploymentScaled]);

        client.script_pvc(NS, "data-pvc", &[PvcPhase::Bound]);
        worker.await.unwrap();
        assert_eq!(client.replicas(NS, "data"), Some(3));
        assert_eq!(client.patches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_detection_is_a_noop() {
        let (client, _sink, guard) = yielding_setup();
        client.add_deployment(NS, "data", 3);
        client.script_pvc(NS, "data-pvc", &[PvcPhase::Failed]);
        let key = PvcKey::new(NS, "data-pvc");
        let o = obs("data-pvc", PvcPhase::Failed);

        let (outcome, cancelled) = tokio::join!(guard.observe(&o), async {
            while !guard.is_handling(&key) {
                tokio::task::yield_now().await;
            }
            // claimed but not registered yet
            assert!(guard.incidents().is_empty());
            let cancelled = guard.cancel(&key).await;
            assert!(guard.is_handling(&key));
            cancelled
        });
        assert!(cancelled.is_none());
        let worker = opened(outcome);
        assert_eq!(client.replicas(NS, "data"), Some(0));
        assert_eq!(guard.incidents().len(), 1);

        client.script_pvc(NS, "data-pvc", &[PvcPhase::Bound]);
        worker.await.unwrap();
        assert_eq!(client.replicas(NS, "data"), Some(3));
        assert!(!guard.is_handling(&key));
    }
}
