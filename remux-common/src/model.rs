use poem_openapi::{Enum, Object};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Lifecycle state of a transcoding task.
///
/// The only legal forward path is
/// `creating -> pending -> in_progress -> processed -> complete`.
/// `failed` is a terminal state reachable only through the distributed
/// worker status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum TaskStatus {
    Creating,
    Pending,
    InProgress,
    Processed,
    Complete,
    Failed,
}

impl TaskStatus {
    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Creating, TaskStatus::Pending)
                | (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Processed)
                | (TaskStatus::Processed, TaskStatus::Complete)
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Creating => "creating",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Processed => "processed",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(TaskStatus::Creating),
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "processed" => Ok(TaskStatus::Processed),
            "complete" => Ok(TaskStatus::Complete),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Where a task was created, not where it runs. Tasks received from a peer
/// installation are `remote` and are never handed back out to another peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum TaskType {
    Local,
    Remote,
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Local => write!(f, "local"),
            TaskType::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(TaskType::Local),
            "remote" => Ok(TaskType::Remote),
            _ => Err(format!("Invalid task type: {s}")),
        }
    }
}

/// Permission role carried by distributed worker tokens.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum WorkerRole {
    Worker,
    Admin,
    Readonly,
}

impl Display for WorkerRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Worker => write!(f, "worker"),
            WorkerRole::Admin => write!(f, "admin"),
            WorkerRole::Readonly => write!(f, "readonly"),
        }
    }
}

impl FromStr for WorkerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(WorkerRole::Worker),
            "admin" => Ok(WorkerRole::Admin),
            "readonly" => Ok(WorkerRole::Readonly),
            _ => Err(format!("Invalid worker role: {s}")),
        }
    }
}

/// A registered distributed worker, as persisted in the worker registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub name: String,
    pub hostname: String,
    pub roles: Vec<WorkerRole>,
    pub capabilities: Vec<String>,
    pub registered_at: f64,
    pub last_seen: f64,
    pub active: bool,
}

impl WorkerInfo {
    pub fn has_any_role(&self, roles: &[WorkerRole]) -> bool {
        self.roles.iter().any(|r| roles.contains(r))
    }
}

/// Claims carried in a signed worker token. Field names follow the standard
/// JWT claim set so off-the-shelf clients can decode the payload segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Worker id.
    pub sub: String,
    pub roles: Vec<WorkerRole>,
    pub capabilities: Vec<String>,
    /// Issued at, unix seconds.
    pub iat: f64,
    /// Expiry, unix seconds.
    pub exp: f64,
    /// Unique token id; the unit of revocation.
    pub jti: String,
}

/// When a worker-group schedule event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum ScheduleRepetition {
    Daily,
    Weekday,
    Weekend,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl ScheduleRepetition {
    /// `day` is chrono's weekday numbering, Monday = 0.
    pub fn matches_day(&self, day: u32) -> bool {
        match self {
            ScheduleRepetition::Daily => true,
            ScheduleRepetition::Weekday => day < 5,
            ScheduleRepetition::Weekend => day >= 5,
            ScheduleRepetition::Monday => day == 0,
            ScheduleRepetition::Tuesday => day == 1,
            ScheduleRepetition::Wednesday => day == 2,
            ScheduleRepetition::Thursday => day == 3,
            ScheduleRepetition::Friday => day == 4,
            ScheduleRepetition::Saturday => day == 5,
            ScheduleRepetition::Sunday => day == 6,
        }
    }
}

impl Display for ScheduleRepetition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleRepetition::Daily => "daily",
            ScheduleRepetition::Weekday => "weekday",
            ScheduleRepetition::Weekend => "weekend",
            ScheduleRepetition::Monday => "monday",
            ScheduleRepetition::Tuesday => "tuesday",
            ScheduleRepetition::Wednesday => "wednesday",
            ScheduleRepetition::Thursday => "thursday",
            ScheduleRepetition::Friday => "friday",
            ScheduleRepetition::Saturday => "saturday",
            ScheduleRepetition::Sunday => "sunday",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ScheduleRepetition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(ScheduleRepetition::Daily),
            "weekday" => Ok(ScheduleRepetition::Weekday),
            "weekend" => Ok(ScheduleRepetition::Weekend),
            "monday" => Ok(ScheduleRepetition::Monday),
            "tuesday" => Ok(ScheduleRepetition::Tuesday),
            "wednesday" => Ok(ScheduleRepetition::Wednesday),
            "thursday" => Ok(ScheduleRepetition::Thursday),
            "friday" => Ok(ScheduleRepetition::Friday),
            "saturday" => Ok(ScheduleRepetition::Saturday),
            "sunday" => Ok(ScheduleRepetition::Sunday),
            _ => Err(format!("Invalid schedule repetition: {s}")),
        }
    }
}

/// What a worker-group schedule event does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum ScheduleAction {
    Pause,
    Resume,
    Count,
}

impl Display for ScheduleAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleAction::Pause => write!(f, "pause"),
            ScheduleAction::Resume => write!(f, "resume"),
            ScheduleAction::Count => write!(f, "count"),
        }
    }
}

impl FromStr for ScheduleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(ScheduleAction::Pause),
            "resume" => Ok(ScheduleAction::Resume),
            "count" => Ok(ScheduleAction::Count),
            _ => Err(format!("Invalid schedule action: {s}")),
        }
    }
}

/// A single recurring pause/resume/count event configured on a worker group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct WorkerScheduleEvent {
    pub repetition: ScheduleRepetition,
    /// "HH:MM", local time.
    pub schedule_time: String,
    pub schedule_task: ScheduleAction,
    pub schedule_worker_count: Option<i64>,
}

/// Severity of a frontend push message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum PushMessageType {
    Error,
    Warning,
    Success,
    Info,
    Status,
}

/// One entry on the frontend push-message bus. `timeout = 0` means the
/// message persists until explicitly removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct PushMessage {
    pub id: String,
    #[serde(rename = "type")]
    #[oai(rename = "type")]
    pub message_type: PushMessageType,
    pub code: String,
    pub message: String,
    pub timeout: i64,
}

/// Hardware acceleration family of a GPU device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum GpuKind {
    Cuda,
    Vaapi,
    Unknown,
}

/// How GPUs are assigned to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum GpuAllocationStrategy {
    RoundRobin,
    LeastUsed,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn task_status_transitions_are_linear() {
        use TaskStatus::*;
        let all = [Creating, Pending, InProgress, Processed, Complete, Failed];
        for from in all {
            for to in all {
                let legal = matches!(
                    (from, to),
                    (Creating, Pending)
                        | (Pending, InProgress)
                        | (InProgress, Processed)
                        | (Processed, Complete)
                );
                assert_eq!(from.can_transition_to(to), legal, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn task_status_round_trips_through_strings() {
        for status in [
            TaskStatus::Creating,
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Processed,
            TaskStatus::Complete,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>(), Ok(status));
        }
    }

    #[test]
    fn repetition_day_matching() {
        assert!(ScheduleRepetition::Daily.matches_day(3));
        assert!(ScheduleRepetition::Weekday.matches_day(4));
        assert!(!ScheduleRepetition::Weekday.matches_day(5));
        assert!(ScheduleRepetition::Weekend.matches_day(6));
        assert!(!ScheduleRepetition::Weekend.matches_day(0));
        assert!(ScheduleRepetition::Tuesday.matches_day(1));
        assert!(!ScheduleRepetition::Tuesday.matches_day(2));
    }

    #[test]
    fn push_message_serializes_type_field() {
        let message = PushMessage {
            id: "pluginSettingsChangeWorkersStopped".to_string(),
            message_type: PushMessageType::Warning,
            code: "pluginSettingsChangeWorkersStopped".to_string(),
            message: "".to_string(),
            timeout: 0,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "warning");
        assert_eq!(json["timeout"], 0);
    }
}
