use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Io Error: {0}")]
    Io(#[source] std::io::Error),

    #[error("K8s Invariant Error: {0}")]
    KubeInvariant(String),

    #[error("Invalid charm version: {0}")]
    InvalidVersion(String),

    #[error("Manifest Error: {0}")]
    Manifest(String),

    #[error("Invalid charm spec: {0}")]
    CharmSpec(String),

    #[error("refresh peer relation is not yet available")]
    PeerRelationMissing,

    #[error("app {app} is not trusted; run `juju trust {app} --scope=cluster`")]
    NotTrusted { app: String },

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("pre-refresh check failed: {0}")]
    Precheck(#[from] PrecheckFailed),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::KubeInvariant($msg.to_string()))
    };
}

impl Error {
    /// Status the charm should publish when this error aborts an invocation
    ///
    /// Only the not-trusted condition carries one; everything else is surfaced
    /// by the framework (retry on next event, or plain failure output).
    pub fn user_status(&self) -> Option<Status> {
        match self {
            Error::NotTrusted { app } => Some(status::trust_missing(app)),
            _ => None,
        }
    }
}

/// Pre-refresh health check or preparation failure
///
/// Carries a short, descriptive operator-facing message, e.g. "Backup in
/// progress". The message is shown in `juju status` and in action output;
/// messages longer than 64 characters will be truncated there.
///
/// Do not mention "pre-refresh check" or prompt the user to rollback in the
/// message; that context is added alongside it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PrecheckFailed(String);

impl PrecheckFailed {
    /// Panics if `message` is empty
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        assert!(!message.is_empty(), "PrecheckFailed message must be longer than 0 characters");
        Self(message)
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// A unit of the application: app name plus ordinal
///
/// Ordered by ordinal; the refresh order is highest ordinal first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnitId {
    pub app: String,
    pub number: u32,
}

impl UnitId {
    pub fn new(app: impl Into<String>, number: u32) -> Self {
        Self { app: app.into(), number }
    }

    /// Parse from a statefulset pod name, e.g. "postgresql-k8s-0"
    pub fn from_pod_name(name: &str) -> Result<Self> {
        let Some((app, number)) = name.rsplit_once('-') else {
            return Err(Error::KubeInvariant(format!("pod name {name:?} has no ordinal suffix")));
        };
        let number = number
            .parse()
            .map_err(|_| Error::KubeInvariant(format!("pod name {name:?} has a non-numeric ordinal")))?;
        Ok(Self { app: app.to_string(), number })
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.number)
    }
}

impl Ord for UnitId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.number.cmp(&other.number).then_with(|| self.app.cmp(&other.app))
    }
}
impl PartialOrd for UnitId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

mod action;
pub use action::{Action, ActionOutcome, ForceChecks};
mod controller;
pub use controller::{CharmHooks, CharmSpec, Cloud, Context, Event, KubernetesRefresh, Refresh};
mod detect;
pub use detect::{ClusterView, PauseAfter};
mod gate;
mod manifest;
pub use manifest::{CharmManifests, RefreshVersions, SnapVersions, WorkloadContainer};
mod partition;
mod probe;
pub use probe::{ClusterProbe, ContainerImage, StatefulSetState, UnitSnapshot};
mod status;
pub use status::{Status, StatusSet};
mod store;
pub use store::{Databag, InMemoryRelation, LocalState, OriginalVersions, PeerRelation};
#[cfg(feature = "term")]
pub mod term;
mod version;
pub use version::{charm_version_compatible, CharmVersion};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_id_parses_pod_names() {
        let unit = UnitId::from_pod_name("postgresql-k8s-12").unwrap();
        assert_eq!(unit, UnitId::new("postgresql-k8s", 12));
        assert_eq!(unit.to_string(), "postgresql-k8s/12");
        assert!(UnitId::from_pod_name("nodash").is_err());
        assert!(UnitId::from_pod_name("app-one").is_err());
    }

    #[test]
    fn unit_id_orders_by_ordinal() {
        let mut units = vec![UnitId::new("app", 0), UnitId::new("app", 2), UnitId::new("app", 1)];
        units.sort_by(|a, b| b.cmp(a));
        assert_eq!(units.iter().map(|u| u.number).collect::<Vec<_>>(), vec![2, 1, 0]);
    }

    #[test]
    #[should_panic]
    fn precheck_failed_rejects_empty_message() {
        PrecheckFailed::new("");
    }

    #[test]
    fn not_trusted_carries_the_leader_app_status() {
        let err = Error::NotTrusted { app: "postgresql-k8s".to_string() };
        let Some(Status::Blocked(message)) = err.user_status() else {
            panic!("expected blocked status");
        };
        assert!(message.contains("juju trust postgresql-k8s --scope=cluster"), "{message}");
        assert_eq!(Error::PeerRelationMissing.user_status(), None);
    }
}
