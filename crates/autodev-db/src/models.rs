use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task as it moves through the issue-to-PR pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Planning,
    PlanningDone,
    BreakingDown,
    BreakdownDone,
    Orchestrating,
    Coding,
    CodingDone,
    Testing,
    TestsPassed,
    TestsFailed,
    Fixing,
    Reflecting,
    Replanning,
    Reviewing,
    ReviewApproved,
    ReviewRejected,
    PrCreated,
    WaitingHuman,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Every status variant, in pipeline order. Used by the transition
    /// closure tests and the status listing endpoints.
    pub const ALL: [TaskStatus; 21] = [
        Self::New,
        Self::Planning,
        Self::PlanningDone,
        Self::BreakingDown,
        Self::BreakdownDone,
        Self::Orchestrating,
        Self::Coding,
        Self::CodingDone,
        Self::Testing,
        Self::TestsPassed,
        Self::TestsFailed,
        Self::Fixing,
        Self::Reflecting,
        Self::Replanning,
        Self::Reviewing,
        Self::ReviewApproved,
        Self::ReviewRejected,
        Self::PrCreated,
        Self::WaitingHuman,
        Self::Completed,
        Self::Failed,
    ];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Planning => "planning",
            Self::PlanningDone => "planning_done",
            Self::BreakingDown => "breaking_down",
            Self::BreakdownDone => "breakdown_done",
            Self::Orchestrating => "orchestrating",
            Self::Coding => "coding",
            Self::CodingDone => "coding_done",
            Self::Testing => "testing",
            Self::TestsPassed => "tests_passed",
            Self::TestsFailed => "tests_failed",
            Self::Fixing => "fixing",
            Self::Reflecting => "reflecting",
            Self::Replanning => "replanning",
            Self::Reviewing => "reviewing",
            Self::ReviewApproved => "review_approved",
            Self::ReviewRejected => "review_rejected",
            Self::PrCreated => "pr_created",
            Self::WaitingHuman => "waiting_human",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "planning" => Ok(Self::Planning),
            "planning_done" => Ok(Self::PlanningDone),
            "breaking_down" => Ok(Self::BreakingDown),
            "breakdown_done" => Ok(Self::BreakdownDone),
            "orchestrating" => Ok(Self::Orchestrating),
            "coding" => Ok(Self::Coding),
            "coding_done" => Ok(Self::CodingDone),
            "testing" => Ok(Self::Testing),
            "tests_passed" => Ok(Self::TestsPassed),
            "tests_failed" => Ok(Self::TestsFailed),
            "fixing" => Ok(Self::Fixing),
            "reflecting" => Ok(Self::Reflecting),
            "replanning" => Ok(Self::Replanning),
            "reviewing" => Ok(Self::Reviewing),
            "review_approved" => Ok(Self::ReviewApproved),
            "review_rejected" => Ok(Self::ReviewRejected),
            "pr_created" => Ok(Self::PrCreated),
            "waiting_human" => Ok(Self::WaitingHuman),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Planner-estimated complexity of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    Xs,
    S,
    M,
    L,
    Xl,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Xs => "XS",
            Self::S => "S",
            Self::M => "M",
            Self::L => "L",
            Self::Xl => "XL",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = ComplexityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "XS" => Ok(Self::Xs),
            "S" => Ok(Self::S),
            "M" => Ok(Self::M),
            "L" => Ok(Self::L),
            "XL" => Ok(Self::Xl),
            other => Err(ComplexityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Complexity`] string.
#[derive(Debug, Clone)]
pub struct ComplexityParseError(pub String);

impl fmt::Display for ComplexityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid complexity: {:?}", self.0)
    }
}

impl std::error::Error for ComplexityParseError {}

// ---------------------------------------------------------------------------

/// Kind of audit event appended to the task event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Planned,
    Coded,
    Tested,
    Fixed,
    Reviewed,
    PrOpened,
    Failed,
    Completed,
    ConsensusDecision,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Planned => "planned",
            Self::Coded => "coded",
            Self::Tested => "tested",
            Self::Fixed => "fixed",
            Self::Reviewed => "reviewed",
            Self::PrOpened => "pr_opened",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::ConsensusDecision => "consensus_decision",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = EventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "planned" => Ok(Self::Planned),
            "coded" => Ok(Self::Coded),
            "tested" => Ok(Self::Tested),
            "fixed" => Ok(Self::Fixed),
            "reviewed" => Ok(Self::Reviewed),
            "pr_opened" => Ok(Self::PrOpened),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "consensus_decision" => Ok(Self::ConsensusDecision),
            other => Err(EventTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventType`] string.
#[derive(Debug, Clone)]
pub struct EventTypeParseError(pub String);

impl fmt::Display for EventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event type: {:?}", self.0)
    }
}

impl std::error::Error for EventTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl JobStatus {
    /// Whether the job can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Partial | Self::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// When the planner's project commands run relative to the diff application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommandOrder {
    BeforeDiff,
    AfterDiff,
}

impl fmt::Display for CommandOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BeforeDiff => "before_diff",
            Self::AfterDiff => "after_diff",
        };
        f.write_str(s)
    }
}

impl FromStr for CommandOrder {
    type Err = CommandOrderParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before_diff" => Ok(Self::BeforeDiff),
            "after_diff" => Ok(Self::AfterDiff),
            other => Err(CommandOrderParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CommandOrder`] string.
#[derive(Debug, Clone)]
pub struct CommandOrderParseError(pub String);

impl fmt::Display for CommandOrderParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid command order: {:?}", self.0)
    }
}

impl std::error::Error for CommandOrderParseError {}

// ---------------------------------------------------------------------------

/// Status of one subtask inside an orchestrated parent task. JSON-only
/// (lives inside the `orchestration_state` jsonb column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// JSON payload structs
// ---------------------------------------------------------------------------

/// One entry of the planner's optional multi-file plan. Wire format is
/// camelCase because it comes straight out of the planner agent's JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePlan {
    pub path: String,
    pub action: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Subtask definition produced by the breakdown agent (camelCase wire form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskDef {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub complexity: Complexity,
}

/// Tracked execution state of one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskState {
    #[serde(flatten)]
    pub def: SubtaskDef,
    pub status: SubtaskStatus,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Orchestration state stored on a parent task while its subtasks execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub subtasks: Vec<SubtaskState>,
    pub execution_order: Vec<String>,
    #[serde(default)]
    pub parallel_groups: Option<Vec<Vec<String>>>,
}

impl OrchestrationState {
    /// Whether every subtask has completed.
    pub fn all_completed(&self) -> bool {
        self.subtasks
            .iter()
            .all(|s| s.status == SubtaskStatus::Completed)
    }

    /// Look up a subtask by its breakdown id.
    pub fn subtask(&self, id: &str) -> Option<&SubtaskState> {
        self.subtasks.iter().find(|s| s.def.id == id)
    }
}

/// Aggregate outcome of a batch job, updated after every batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub in_progress: i64,
    #[serde(default)]
    pub prs_created: Vec<String>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one GitHub issue tracked through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub repo: String,
    pub issue_number: i64,
    pub title: String,
    pub body: String,
    pub status: TaskStatus,
    pub definition_of_done: Option<Json<Vec<String>>>,
    pub plan: Option<Json<Vec<String>>>,
    pub target_files: Option<Vec<String>>,
    pub multi_file_plan: Option<Json<Vec<FilePlan>>>,
    pub estimated_complexity: Option<Complexity>,
    pub commands: Option<Json<Vec<String>>>,
    pub command_order: Option<CommandOrder>,
    pub branch_name: Option<String>,
    pub current_diff: Option<String>,
    pub commit_message: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub pr_title: Option<String>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub error_before_fix: Option<String>,
    pub linear_issue_id: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub subtask_index: Option<i32>,
    pub is_orchestrated: bool,
    pub orchestration_state: Option<Json<OrchestrationState>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Planner-produced definition of done, empty when not yet planned.
    pub fn definition_of_done(&self) -> &[String] {
        self.definition_of_done.as_ref().map_or(&[], |j| &j.0)
    }

    /// Planner-produced step list, empty when not yet planned.
    pub fn plan_steps(&self) -> &[String] {
        self.plan.as_ref().map_or(&[], |j| &j.0)
    }

    /// Target files, empty when not yet planned.
    pub fn target_files(&self) -> &[String] {
        self.target_files.as_deref().unwrap_or(&[])
    }

    /// Whether this task is a subtask of an orchestrated parent.
    pub fn is_subtask(&self) -> bool {
        self.parent_task_id.is_some()
    }

    /// Whether the attempt budget is exhausted.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// An append-only audit record emitted whenever a phase completes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: Uuid,
    pub event_type: EventType,
    pub agent: String,
    pub input_summary: Option<String>,
    pub output_summary: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A batch of tasks for one repository.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub repo: String,
    pub task_ids: Vec<Uuid>,
    pub summary: Option<Json<JobSummary>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An applied-diff audit row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Patch {
    pub id: Uuid,
    pub task_id: Uuid,
    pub diff: String,
    pub commit_sha: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        for v in &TaskStatus::ALL {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn task_status_serde_matches_display() {
        for v in &TaskStatus::ALL {
            let json = serde_json::to_string(v).unwrap();
            assert_eq!(json, format!("\"{v}\""));
        }
    }

    #[test]
    fn complexity_display_roundtrip() {
        let variants = [
            Complexity::Xs,
            Complexity::S,
            Complexity::M,
            Complexity::L,
            Complexity::Xl,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Complexity = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn complexity_ordering() {
        assert!(Complexity::Xs < Complexity::S);
        assert!(Complexity::M < Complexity::L);
        assert!(Complexity::L < Complexity::Xl);
    }

    #[test]
    fn complexity_invalid() {
        let result = "XXL".parse::<Complexity>();
        assert!(result.is_err());
    }

    #[test]
    fn event_type_display_roundtrip() {
        let variants = [
            EventType::Created,
            EventType::Planned,
            EventType::Coded,
            EventType::Tested,
            EventType::Fixed,
            EventType::Reviewed,
            EventType::PrOpened,
            EventType::Failed,
            EventType::Completed,
            EventType::ConsensusDecision,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: EventType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn job_status_display_roundtrip() {
        let variants = [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Partial,
            JobStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: JobStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn job_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Partial.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn command_order_roundtrip() {
        for v in &[CommandOrder::BeforeDiff, CommandOrder::AfterDiff] {
            let s = v.to_string();
            let parsed: CommandOrder = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn subtask_def_wire_format_is_camel_case() {
        let def = SubtaskDef {
            id: "sub-1".into(),
            title: "Add parser".into(),
            description: "Parse the thing".into(),
            target_files: vec!["src/parser.ts".into()],
            depends_on: vec![],
            acceptance_criteria: vec!["parses".into()],
            complexity: Complexity::S,
        };
        let json = serde_json::to_value(&def).unwrap();
        assert!(json.get("targetFiles").is_some());
        assert!(json.get("dependsOn").is_some());
        assert!(json.get("acceptanceCriteria").is_some());
        assert_eq!(json["complexity"], "S");
    }

    #[test]
    fn orchestration_state_all_completed() {
        let def = SubtaskDef {
            id: "sub-1".into(),
            title: "t".into(),
            description: "d".into(),
            target_files: vec![],
            depends_on: vec![],
            acceptance_criteria: vec![],
            complexity: Complexity::Xs,
        };
        let mut state = OrchestrationState {
            subtasks: vec![SubtaskState {
                def,
                status: SubtaskStatus::Pending,
                diff: None,
                error: None,
            }],
            execution_order: vec!["sub-1".into()],
            parallel_groups: None,
        };
        assert!(!state.all_completed());
        state.subtasks[0].status = SubtaskStatus::Completed;
        assert!(state.all_completed());
        assert!(state.subtask("sub-1").is_some());
        assert!(state.subtask("sub-2").is_none());
    }

    #[test]
    fn job_summary_serde_is_snake_case() {
        let summary = JobSummary {
            total: 3,
            completed: 2,
            failed: 1,
            in_progress: 0,
            prs_created: vec!["https://github.com/acme/web/pull/1".into()],
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["in_progress"], 0);
        assert_eq!(json["prs_created"].as_array().unwrap().len(), 1);
    }
}
