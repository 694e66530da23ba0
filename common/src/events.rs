use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client,
    runtime::events::{Event, EventType, Recorder},
};
use std::fmt;

use crate::context::get_reporter;

/// Reason codes carried by every event this operator emits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    EnvVarsMissing,
    InClusterConfigError,
    DeploymentReadError,
    DeploymentScaled,
    DeploymentScaleError,
    PVCReadOnly,
    PVCBackToNormal,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::EnvVarsMissing => "EnvVarsMissing",
            Reason::InClusterConfigError => "InClusterConfigError",
            Reason::DeploymentReadError => "DeploymentReadError",
            Reason::DeploymentScaled => "DeploymentScaled",
            Reason::DeploymentScaleError => "DeploymentScaleError",
            Reason::PVCReadOnly => "PVCReadOnly",
            Reason::PVCBackToNormal => "PVCBackToNormal",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Reason::EnvVarsMissing | Reason::InClusterConfigError => "Starting",
            Reason::DeploymentReadError => "Reading",
            Reason::DeploymentScaled | Reason::DeploymentScaleError => "Scaling",
            Reason::PVCReadOnly | Reason::PVCBackToNormal => "Monitoring",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct OperatorEvent {
    pub type_: EventType,
    pub reason: Reason,
    pub message: String,
}

impl OperatorEvent {
    pub fn normal(reason: Reason, message: String) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            message,
        }
    }

    pub fn warning(reason: Reason, message: String) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            message,
        }
    }

    pub fn is_warning(&self) -> bool {
        self.type_ == EventType::Warning
    }

    pub fn to_kube(&self) -> Event {
        Event {
            type_: self.type_,
            reason: self.reason.to_string(),
            note: Some(self.message.clone()),
            action: self.reason.action().to_string(),
            secondary: None,
        }
    }
}

/// Fire-and-forget sink for operational events.
///
/// Implementations must never fail the caller: delivery problems are logged
/// and dropped.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, target: Option<&ObjectReference>, ev: OperatorEvent);
}

/// Publishes events to the cluster through a kube `Recorder`
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self {
            recorder: Recorder::new(client, get_reporter()),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, target: Option<&ObjectReference>, ev: OperatorEvent) {
        let Some(oref) = target else {
            // An event needs an involved object to be stored by the apiserver
            log_event(None, &ev);
            return;
        };
        log_event(Some(oref), &ev);
        if let Err(e) = self.recorder.publish(&ev.to_kube(), oref).await {
            tracing::warn!("Ignoring {:?} while sending a {} event", e, ev.reason);
        }
    }
}

fn log_event(target: Option<&ObjectReference>, ev: &OperatorEvent) {
    let object = target
        .map(|o| {
            format!(
                "{}/{}",
                o.namespace.clone().unwrap_or_default(),
                o.name.clone().unwrap_or_default()
            )
        })
        .unwrap_or_else(|| "-".to_string());
    if ev.is_warning() {
        tracing::warn!(reason = %ev.reason, object = %object, "{}", ev.message);
    } else {
        tracing::info!(reason = %ev.reason, object = %object, "{}", ev.message);
    }
}
