use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    CompletedDryRun,
    CompletedNoPublish,
    NeedsReview,
    RejectedConcurrent,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedDryRun => "completed_dry_run",
            RunStatus::CompletedNoPublish => "completed_no_publish",
            RunStatus::NeedsReview => "needs_review",
            RunStatus::RejectedConcurrent => "rejected_concurrent",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "completed_dry_run" => Some(RunStatus::CompletedDryRun),
            "completed_no_publish" => Some(RunStatus::CompletedNoPublish),
            "needs_review" => Some(RunStatus::NeedsReview),
            "rejected_concurrent" => Some(RunStatus::RejectedConcurrent),
            "stopped" => Some(RunStatus::Stopped),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Manual,
    Scheduled,
    Replay,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunType::Manual => "manual",
            RunType::Scheduled => "scheduled",
            RunType::Replay => "replay",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(RunType::Manual),
            "scheduled" => Some(RunType::Scheduled),
            "replay" => Some(RunType::Replay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    HumanOnly,
    AiLiveReply,
}

impl AgentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::HumanOnly => "human-only",
            AgentMode::AiLiveReply => "ai-live-reply",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "human-only" => Some(AgentMode::HumanOnly),
            "ai-live-reply" => Some(AgentMode::AiLiveReply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Running,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Running => "running",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AgentStatus::Active),
            "inactive" => Some(AgentStatus::Inactive),
            "running" => Some(AgentStatus::Running),
            _ => None,
        }
    }
}

/// Phase tag carried by every run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Runtime,
    History,
    Tools,
    Decision,
    SelfTest,
    Patch,
    Compaction,
    Publish,
    Openai,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Runtime => "runtime",
            Phase::History => "history",
            Phase::Tools => "tools",
            Phase::Decision => "decision",
            Phase::SelfTest => "self_test",
            Phase::Patch => "patch",
            Phase::Compaction => "compaction",
            Phase::Publish => "publish",
            Phase::Openai => "openai",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Continue,
    StopPass,
    StopFail,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Continue => "continue",
            Decision::StopPass => "stop_pass",
            Decision::StopFail => "stop_fail",
        }
    }
}

/// A scripted scenario used to simulate and score a candidate patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTestCase {
    pub id: String,
    pub category: String,
    pub script: String,
}

/// Options accepted when starting a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub run_type: Option<RunType>,
    pub max_iterations: Option<u32>,
    pub batch_size: Option<usize>,
    pub max_messages: Option<usize>,
    #[serde(default)]
    pub requested_by: Option<String>,
}
