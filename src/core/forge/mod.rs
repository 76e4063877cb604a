mod context;
pub mod decision;
mod error;
pub mod history;
pub mod masking;
pub mod patch;
pub mod rubric;
mod runner;
mod scheduler;
pub mod selftest;
pub mod types;

pub use context::RunContext;
pub use error::{ForgeError, ForgeResult};
pub use runner::{ForgeRunner, RunnerSettings, StartedRun};
pub use scheduler::{ForgeScheduler, SchedulerSettings, StartedEntry, TickReport};
pub use types::{Decision, Phase, RunStatus, RunType, StartRunOptions};

/// Allowed run status transitions. Terminal states never move again.
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    if from == to {
        return !from.is_terminal();
    }
    match from {
        RunStatus::Queued => matches!(
            to,
            RunStatus::Running | RunStatus::RejectedConcurrent | RunStatus::Stopped | RunStatus::Failed
        ),
        RunStatus::Running => matches!(
            to,
            RunStatus::Completed
                | RunStatus::CompletedDryRun
                | RunStatus::CompletedNoPublish
                | RunStatus::NeedsReview
                | RunStatus::RejectedConcurrent
                | RunStatus::Stopped
                | RunStatus::Failed
        ),
        RunStatus::Completed
        | RunStatus::CompletedDryRun
        | RunStatus::CompletedNoPublish
        | RunStatus::NeedsReview
        | RunStatus::RejectedConcurrent
        | RunStatus::Stopped
        | RunStatus::Failed => false,
    }
}

#[cfg(test)]
mod tests;
