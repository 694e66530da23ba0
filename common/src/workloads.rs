use crate::{EventSink, OperatorEvent, PvcPhase, Reason, ResourceClient, Result};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ObjectReference};
use kube::{Resource, ResourceExt};
use std::sync::Arc;

/// What the guard needs to know about a Deployment
#[derive(Clone, Debug)]
pub struct DeploymentHandle {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub reference: ObjectReference,
}

impl From<&Deployment> for DeploymentHandle {
    fn from(d: &Deployment) -> Self {
        Self {
            name: d.name_any(),
            namespace: d.namespace().unwrap_or_default(),
            // the apiserver defaults an unset replica count to 1
            replicas: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1).max(0),
            reference: d.object_ref(&()),
        }
    }
}

/// Deployment and PVC access that reports every outcome through an [`EventSink`]
#[derive(Clone)]
pub struct Workloads {
    client: Arc<dyn ResourceClient>,
    events: Arc<dyn EventSink>,
}

impl Workloads {
    pub fn new(client: Arc<dyn ResourceClient>, events: Arc<dyn EventSink>) -> Self {
        Self { client, events }
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Returns `None` (after a `DeploymentReadError` warning) when nothing can be acted upon
    pub async fn get_deployment(&self, name: &str, namespace: &str) -> Option<DeploymentHandle> {
        let message = match self.client.get_deployment(name, namespace).await {
            Ok(Some(d)) => return Some(DeploymentHandle::from(&d)),
            Ok(None) => format!("Deployment {namespace}/{name} not found."),
            Err(e) => format!("Exception when reading deployment: {e}"),
        };
        self.events
            .publish(None, OperatorEvent::warning(Reason::DeploymentReadError, message))
            .await;
        None
    }

    /// Scales a Deployment, emitting exactly one event. Returns whether the patch went through.
    pub async fn scale_deployment(
        &self,
        name: &str,
        namespace: &str,
        replicas: i32,
        message: Option<String>,
    ) -> bool {
        match self.client.patch_deployment_replicas(name, namespace, replicas).await {
            Ok(acked) => {
                let message =
                    message.unwrap_or_else(|| format!("Scaled deployment {name} to {acked} replicas."));
                let target = deployment_ref(name, namespace);
                self.events
                    .publish(Some(&target), OperatorEvent::normal(Reason::DeploymentScaled, message))
                    .await;
                true
            }
            Err(e) => {
                // best effort: attach the event to the current state of the Deployment
                let target = match self.client.get_deployment(name, namespace).await {
                    Ok(Some(d)) => Some(d.object_ref(&())),
                    _ => None,
                };
                self.events
                    .publish(
                        target.as_ref(),
                        OperatorEvent::warning(
                            Reason::DeploymentScaleError,
                            format!("Exception when scaling deployment: {e}"),
                        ),
                    )
                    .await;
                false
            }
        }
    }

    pub async fn pvc_phase(&self, name: &str, namespace: &str) -> Result<PvcPhase> {
        self.client.get_pvc_phase(name, namespace).await
    }
}

fn deployment_ref(name: &str, namespace: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("apps/v1".to_string()),
        kind: Some("Deployment".to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..ObjectReference::default()
    }
}
