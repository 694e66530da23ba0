use crate::{Error, Result};
use kube::{Config, runtime::events::Reporter};

pub static CLIENT_NAME: &str = "pvc-scaler.solidite.fr";
const SERVICE_HOST: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT: &str = "KUBERNETES_SERVICE_PORT";

pub fn get_client_name() -> String {
    CLIENT_NAME.to_string()
}

pub fn get_short_name() -> String {
    let long = get_client_name();
    long.split('.').next().unwrap_or("pvc-scaler").to_string()
}

pub fn get_reporter() -> Reporter {
    Reporter {
        controller: get_short_name(),
        instance: Some(std::env::var("POD_NAME").unwrap_or_else(|_| "unknown".to_string())),
    }
}

/// Checks the markers the kubelet sets in every pod.
///
/// The lookup is injected so the check does not depend on the process environment.
pub fn check_environment<F>(lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let missing: Vec<&str> = [SERVICE_HOST, SERVICE_PORT]
        .into_iter()
        .filter(|var| lookup(var).is_none_or(|v| v.is_empty()))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::EnvVarsMissing(missing.join(", ")))
    }
}

/// Startup validation: in-cluster markers then in-cluster credentials
pub fn incluster_config() -> Result<Config> {
    check_environment(|v| std::env::var(v).ok())?;
    Config::incluster().map_err(Error::InClusterConfig)
}

/// Local kubeconfig (or whatever `kube` can infer), for running outside a pod
pub async fn inferred_config() -> Result<Config> {
    Config::infer().await.map_err(Error::Kubeconfig)
}
