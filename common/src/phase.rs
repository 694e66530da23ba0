use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use std::fmt;

/// Phase of a PersistentVolumeClaim as reported in `status.phase`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PvcPhase {
    Pending,
    Bound,
    Lost,
    Failed,
    ReadOnly,
    Unknown(String),
}

impl PvcPhase {
    /// Failed and ReadOnly are the only phases that trigger a scale-down
    pub fn is_degraded(&self) -> bool {
        matches!(self, PvcPhase::Failed | PvcPhase::ReadOnly)
    }

    pub fn from_pvc(pvc: &PersistentVolumeClaim) -> PvcPhase {
        pvc.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(PvcPhase::from)
            .unwrap_or_else(|| PvcPhase::Unknown(String::new()))
    }
}

impl From<&str> for PvcPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => PvcPhase::Pending,
            "Bound" => PvcPhase::Bound,
            "Lost" => PvcPhase::Lost,
            "Failed" => PvcPhase::Failed,
            "ReadOnly" => PvcPhase::ReadOnly,
            other => PvcPhase::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for PvcPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvcPhase::Pending => write!(f, "Pending"),
            PvcPhase::Bound => write!(f, "Bound"),
            PvcPhase::Lost => write!(f, "Lost"),
            PvcPhase::Failed => write!(f, "Failed"),
            PvcPhase::ReadOnly => write!(f, "ReadOnly"),
            PvcPhase::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Identity of a watched PVC
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PvcKey {
    pub namespace: String,
    pub name: String,
}

impl PvcKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PvcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What a single reconcile saw of a PVC
#[derive(Clone, Debug)]
pub struct PvcObservation {
    pub name: String,
    pub namespace: String,
    pub phase: PvcPhase,
    /// Target of the events about this claim
    pub reference: ObjectReference,
}

impl PvcObservation {
    pub fn new(namespace: &str, name: &str, phase: PvcPhase) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            phase,
            reference: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectReference::default()
            },
        }
    }

    pub fn from_pvc(pvc: &PersistentVolumeClaim) -> Self {
        Self {
            name: pvc.name_any(),
            namespace: pvc.namespace().unwrap_or_default(),
            phase: PvcPhase::from_pvc(pvc),
            reference: pvc.object_ref(&()),
        }
    }

    pub fn key(&self) -> PvcKey {
        PvcKey::new(&self.namespace, &self.name)
    }
}
