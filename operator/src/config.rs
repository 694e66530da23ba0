use clap::Parser;
use tokio::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Parameters {
    /// Seconds between two checks of a PersistentVolumeClaim
    #[arg(
        short,
        long,
        env = "CHECK_INTERVAL",
        value_name = "SECONDS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval: u64,

    /// Suffix removed from a PersistentVolumeClaim name to get its Deployment name
    #[arg(long, env = "PVC_SUFFIX", default_value = "-pvc")]
    pub pvc_suffix: String,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(short, long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Address of the health/metrics server
    #[arg(short, long, env = "LISTEN_ADDR", default_value = "0.0.0.0:9000")]
    pub listen: String,

    /// Fall back to the local kubeconfig when not running in a pod
    #[arg(long, env = "ALLOW_OUT_OF_CLUSTER", default_value_t = false)]
    pub allow_out_of_cluster: bool,

    /// Log as json lines
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub json: bool,
}

impl Parameters {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}
