use crate::{Error, PvcPhase, Result};
use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::PersistentVolumeClaim};
use kube::{
    Client,
    api::{Api, Patch, PatchParams},
};

/// Read/patch access to the objects the guard acts on
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// `Ok(None)` when the Deployment does not exist
    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Option<Deployment>>;

    /// Patches the scale subresource, returns the replica count acknowledged by the apiserver
    async fn patch_deployment_replicas(&self, name: &str, namespace: &str, replicas: i32) -> Result<i32>;

    async fn get_pvc_phase(&self, name: &str, namespace: &str) -> Result<PvcPhase>;
}

#[derive(Clone)]
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceClient for KubeResources {
    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn patch_deployment_replicas(&self, name: &str, namespace: &str, replicas: i32) -> Result<i32> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = Patch::Merge(serde_json::json!({
            "spec": {
                "replicas": replicas
            }
        }));
        let scale = api
            .patch_scale(name, &PatchParams::default(), &patch)
            .await
            .map_err(Error::KubeError)?;
        Ok(scale.spec.and_then(|s| s.replicas).unwrap_or(replicas))
    }

    async fn get_pvc_phase(&self, name: &str, namespace: &str) -> Result<PvcPhase> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await.map_err(Error::KubeError)? {
            Some(pvc) => Ok(PvcPhase::from_pvc(&pvc)),
            None => Err(Error::NotFound(
                "PersistentVolumeClaim".to_string(),
                namespace.to_string(),
                name.to_string(),
            )),
        }
    }
}
