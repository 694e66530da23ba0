use crate::{Error, Incident, Metrics, Parameters, ReplicaGuard, Result, pvc};
use chrono::{DateTime, Utc};
use common::{KubeResources, NameResolver, Workloads, events::KubeEventSink};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{controller::Controller, watcher::Config},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Incident owner
    pub guard: ReplicaGuard,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Delay between two checks of the same claim
    pub interval: Duration,
}

impl Context {
    pub fn new(guard: ReplicaGuard, metrics: Metrics, interval: Duration) -> Self {
        Self {
            guard,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics,
            interval,
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub incidents: Vec<Incident>,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            incidents: Vec::new(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone)]
pub struct Manager {
    context: Arc<Context>,
}

/// Manager that owns a Controller for PersistentVolumeClaims
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(params: &Parameters, config: kube::Config) -> Result<(Self, BoxFuture<'static, ()>)> {
        let client = Client::try_from(config).map_err(Error::KubeError)?;
        let metrics = Metrics::default();
        let workloads = Workloads::new(
            Arc::new(KubeResources::new(client.clone())),
            Arc::new(KubeEventSink::new(client.clone())),
        );
        let guard = ReplicaGuard::new(
            workloads,
            NameResolver::new(&params.pvc_suffix),
            params.interval(),
            metrics.incidents.clone(),
        );
        let context = Arc::new(Context::new(guard, metrics, params.interval()));

        let pvcs: Api<PersistentVolumeClaim> = match &params.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        // Ensure we are allowed to watch before loop-watching
        pvcs.list(&ListParams::default().limit(1))
            .await
            .map_err(Error::KubeError)?;

        // All good. Start controller and return its future.
        let controller = Controller::new(pvcs, Config::default().any_semantic())
            .shutdown_on_signal()
            .run(pvc::reconcile, pvc::error_policy, context.clone())
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        Ok((Self { context }, controller))
    }

    /// Metrics getter
    #[must_use]
    pub fn metrics(&self) -> String {
        self.context.metrics.encode()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = self.context.diagnostics.read().await.clone();
        diagnostics.incidents = self.context.guard.incidents();
        diagnostics
    }
}
