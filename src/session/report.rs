//! Outcome of every teardown step, in execution order.

use std::fmt;

use camino::Utf8PathBuf;

/// Steps performed by teardown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeardownStep {
    /// Saving the tail of the device log.
    Logcat,
    /// Clearing the device log buffers.
    ClearLogcat,
    /// Bugreport for a bring-up that did not succeed.
    Bugreport,
    /// Serial console output.
    SerialLog,
    /// Known remote log files.
    RemoteLogs,
    /// Crash dumps from the nested runtime.
    Tombstones,
    /// Stopping the tunnel monitor.
    TunnelStop,
    /// Deleting the instance.
    Delete,
    /// Dropping cached session state.
    Clear,
}

impl TeardownStep {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logcat => "logcat",
            Self::ClearLogcat => "clear-logcat",
            Self::Bugreport => "bugreport",
            Self::SerialLog => "serial-log",
            Self::RemoteLogs => "remote-logs",
            Self::Tombstones => "tombstones",
            Self::TunnelStop => "tunnel-stop",
            Self::Delete => "delete",
            Self::Clear => "clear",
        }
    }
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened in one step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// Completed; carries the artifacts it saved.
    Done {
        /// Files written by the step.
        artifacts: Vec<Utf8PathBuf>,
    },
    /// Not applicable to this session.
    Skipped {
        /// Why the step did not run.
        reason: String,
    },
    /// Ran and failed; teardown continued.
    Failed {
        /// Error description.
        error: String,
    },
}

impl StepOutcome {
    pub(crate) const fn done() -> Self {
        Self::Done {
            artifacts: Vec::new(),
        }
    }

    pub(crate) fn saved(artifacts: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        Self::Done {
            artifacts: artifacts.into_iter().collect(),
        }
    }

    pub(crate) fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub(crate) fn failed(error: impl fmt::Display) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }

    /// Returns `true` for [`StepOutcome::Failed`].
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Ordered record of a teardown.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownReport {
    original_failure: Option<String>,
    steps: Vec<(TeardownStep, StepOutcome)>,
}

impl TeardownReport {
    pub(crate) fn new(original_failure: Option<&str>) -> Self {
        Self {
            original_failure: original_failure.map(str::to_owned),
            steps: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, step: TeardownStep, outcome: StepOutcome) {
        match &outcome {
            StepOutcome::Failed { error } => {
                tracing::warn!(step = %step, error = %error, "teardown step failed");
            }
            StepOutcome::Skipped { reason } => {
                tracing::debug!(step = %step, reason = %reason, "teardown step skipped");
            }
            StepOutcome::Done { .. } => tracing::debug!(step = %step, "teardown step done"),
        }
        self.steps.push((step, outcome));
    }

    /// The failure teardown was called with, unchanged.
    #[must_use]
    pub fn original_failure(&self) -> Option<&str> {
        self.original_failure.as_deref()
    }

    /// Steps in the order they ran.
    #[must_use]
    pub fn steps(&self) -> &[(TeardownStep, StepOutcome)] {
        &self.steps
    }

    /// Outcome of `step`, if it was recorded.
    #[must_use]
    pub fn outcome(&self, step: TeardownStep) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(recorded, _)| *recorded == step)
            .map(|(_, outcome)| outcome)
    }

    /// Position of `step` in the execution order.
    #[must_use]
    pub fn position(&self, step: TeardownStep) -> Option<usize> {
        self.steps.iter().position(|(recorded, _)| *recorded == step)
    }

    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &(TeardownStep, StepOutcome)> {
        self.steps.iter().filter(|(_, outcome)| outcome.is_failure())
    }

    /// Returns `true` when no step failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Every artifact saved during teardown.
    #[must_use]
    pub fn artifacts(&self) -> Vec<&Utf8PathBuf> {
        self.steps
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                StepOutcome::Done { artifacts } => Some(artifacts),
                _ => None,
            })
            .flatten()
            .collect()
    }
}
