//! Operator actions: parameters, validation, structured outcomes
//!
//! Validation only looks at cluster state; the consumers live elsewhere
//! (`force-refresh-start` in the gate, `resume-refresh` in the partition
//! planner, `pre-refresh-check` in the controller).

use crate::detect::PauseAfter;
use crate::{Error, Result, UnitId};

/// `force-refresh-start` parameters: which automatic checks still run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceChecks {
    pub check_workload_container: bool,
    pub check_compatibility: bool,
    pub run_pre_refresh_checks: bool,
}

impl ForceChecks {
    pub(crate) fn skips_anything(&self) -> bool {
        !(self.check_workload_container && self.check_compatibility && self.run_pre_refresh_checks)
    }
}

/// An operator-initiated action dispatched to this unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the pre-refresh checks before `juju refresh` (leader, idle only)
    PreRefreshCheck,
    /// Skip selected first-unit gates (first unit, mid-refresh only)
    ForceRefreshStart(ForceChecks),
    /// Let the rollout continue past a pause or failing health checks
    ResumeRefresh { check_health_of_refreshed_units: bool },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::PreRefreshCheck => "pre-refresh-check",
            Action::ForceRefreshStart(_) => "force-refresh-start",
            Action::ResumeRefresh { .. } => "resume-refresh",
        }
    }
}

/// What the framework reports back for the triggering action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Structured result message on success
    pub result: Option<String>,
    /// Failure message when the action failed
    pub failure: Option<String>,
    /// Free-form log lines attached to the action
    pub logs: Vec<String>,
}

impl ActionOutcome {
    pub(crate) fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    pub(crate) fn succeed(&mut self, message: impl Into<String>) {
        self.result = Some(message.into());
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Cluster state an action is validated against
pub(crate) struct ActionContext<'a> {
    pub app: &'a str,
    pub unit: &'a UnitId,
    pub leader: bool,
    pub first_unit: Option<&'a UnitId>,
    pub in_progress: bool,
    pub pause_after: PauseAfter,
}

pub(crate) fn validate(action: &Action, ctx: &ActionContext<'_>) -> Result<()> {
    match action {
        Action::PreRefreshCheck => {
            if !ctx.leader {
                return Err(Error::InvalidAction(format!(
                    "Must run on the leader unit. Try: `juju run {}/leader pre-refresh-check`",
                    ctx.app
                )));
            }
            if ctx.in_progress {
                return Err(Error::InvalidAction("Refresh already in progress".to_string()));
            }
        }
        Action::ForceRefreshStart(checks) => {
            if !ctx.in_progress {
                return Err(Error::InvalidAction("No refresh in progress".to_string()));
            }
            match ctx.first_unit {
                Some(first) if first == ctx.unit => {}
                Some(first) => {
                    return Err(Error::InvalidAction(format!("Must run on unit {}", first.number)));
                }
                None => {
                    return Err(Error::InvalidAction("No units found".to_string()));
                }
            }
            if !checks.skips_anything() {
                return Err(Error::InvalidAction(
                    "At least one of `check-workload-container`, `check-compatibility` or \
                     `run-pre-refresh-checks` must be `false`"
                        .to_string(),
                ));
            }
        }
        Action::ResumeRefresh { check_health_of_refreshed_units } => {
            if !ctx.leader {
                return Err(Error::InvalidAction(format!(
                    "Must run on the leader unit. Try: `juju run {}/leader resume-refresh`",
                    ctx.app
                )));
            }
            if !ctx.in_progress {
                return Err(Error::InvalidAction("No refresh in progress".to_string()));
            }
            if ctx.pause_after == PauseAfter::None && *check_health_of_refreshed_units {
                return Err(Error::InvalidAction(
                    "pause_after_unit_refresh is `none`, action not applicable".to_string(),
                ));
            }
        }
    }
    Ok(())
}
