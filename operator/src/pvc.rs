use crate::{Error, Outcome, Result, manager::Context};
use chrono::Utc;
use common::PvcObservation;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{ResourceExt, runtime::controller::Action};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Called for every PersistentVolumeClaim on changes and once per interval
#[instrument(skip(ctx, pvc), fields(pvc = %pvc.name_any()))]
pub async fn reconcile(pvc: Arc<PersistentVolumeClaim>, ctx: Arc<Context>) -> Result<Action> {
    let _mes = ctx.metrics.reconcile.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    if pvc.namespace().is_none() {
        return Err(Error::Other(format!("PersistentVolumeClaim {} has no namespace", pvc.name_any())));
    }
    let obs = PvcObservation::from_pvc(&pvc);

    if pvc.metadata.deletion_timestamp.is_some() {
        if let Some(incident) = ctx.guard.cancel(&obs.key()).await {
            info!(
                "PersistentVolumeClaim {} is being deleted, restored deployment {} to {} replicas",
                incident.pvc, incident.deployment, incident.original_replicas
            );
        }
        return Ok(Action::await_change());
    }

    match ctx.guard.observe(&obs).await {
        Outcome::Healthy => debug!("PersistentVolumeClaim {} is {}", obs.key(), obs.phase),
        Outcome::AlreadyHandling => {
            debug!("PersistentVolumeClaim {} is {}, recovery in progress", obs.key(), obs.phase)
        }
        Outcome::DeploymentMissing => {
            warn!("PersistentVolumeClaim {} is {}, nothing to scale down", obs.key(), obs.phase)
        }
        // the worker runs on its own, its handle is not needed here
        Outcome::IncidentOpened(_worker) => {
            info!("PersistentVolumeClaim {} is {}, waiting for recovery", obs.key(), obs.phase)
        }
    }
    Ok(Action::requeue(ctx.interval))
}

#[must_use]
pub fn error_policy(pvc: Arc<PersistentVolumeClaim>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed for '{:?}.{:?}': {:?}", pvc.metadata.namespace, pvc.metadata.name, error);
    ctx.metrics.reconcile.reconcile_failure(&pvc, error);
    Action::requeue(ctx.interval)
}
