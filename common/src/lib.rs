use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("K8s error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0} {1}/{2} not found")]
    NotFound(String, String, String),

    #[error("Kubernetes service host or port environment variables are not set ({0})")]
    EnvVarsMissing(String),

    #[error("Failed to load in-cluster configuration: {0}")]
    InClusterConfig(#[source] kube::config::InClusterError),

    #[error("Failed to infer configuration: {0}")]
    Kubeconfig(#[source] kube::config::InferConfigError),

    #[error("Error: {0}")]
    Other(String),
}
impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::SerializationError(_) => "serializationerror".to_string(),
            Error::KubeError(_) => "kubeerror".to_string(),
            Error::NotFound(kind, _, _) => format!("notfound_{}", kind.to_lowercase()),
            Error::EnvVarsMissing(_) => "envvarsmissing".to_string(),
            Error::InClusterConfig(_) => "inclusterconfig".to_string(),
            Error::Kubeconfig(_) => "kubeconfig".to_string(),
            Error::Other(_) => "other".to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(..) => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod context;
pub mod events;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod naming;
pub mod phase;
pub mod resources;
pub mod workloads;

pub use context::get_client_name;
pub use events::{EventSink, OperatorEvent, Reason};
pub use naming::NameResolver;
pub use phase::{PvcKey, PvcObservation, PvcPhase};
pub use resources::{KubeResources, ResourceClient};
pub use workloads::{DeploymentHandle, Workloads};
