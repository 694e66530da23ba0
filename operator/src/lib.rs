pub use common::{Error, Result};

/// Command line and environment settings
pub mod config;
pub use config::Parameters;

/// Incident bookkeeping and the recovery workers
pub mod guard;
pub use guard::{Incident, Outcome, ReplicaGuard};

/// Reconcile entry point for PersistentVolumeClaims
pub mod pvc;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::{Context, Diagnostics, Manager};

/// Metrics
pub mod metrics;
pub use metrics::Metrics;
