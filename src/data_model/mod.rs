#[cfg(test)]
pub mod test_objects;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::utils::get_epoch_time_in_ms;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TaskId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadId(String);

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WorkloadId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkloadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeployId(String);

impl fmt::Display for DeployId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeployId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One launched, physically placed instance of a deploy. Immutable once
/// created; the checker only reads it. Carries a snapshot of the deploy
/// configuration it was launched with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workload_id: WorkloadId,
    pub deploy_id: DeployId,
    /// Epoch ms at which the scheduler launched the task.
    pub started_at: u64,
    pub host: String,
    pub rack: Option<String>,
    /// Allocated port resources, in allocation order.
    pub ports: Vec<u16>,
    pub labels: HashMap<String, String>,
    /// Per-launch healthcheck opt-out carried over from the pending task.
    pub skip_healthchecks: Option<bool>,
    pub deploy: Deploy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub owners: Vec<String>,
    pub load_balanced: bool,
    pub skip_healthchecks: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum WorkloadState {
    Active,
    Paused,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadWithState {
    pub workload: Workload,
    pub state: WorkloadState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deploy {
    pub id: DeployId,
    pub healthcheck: Option<HealthcheckOptions>,
    pub load_balancer: Option<LoadBalancerOptions>,
    /// How long the deploy as a whole is given to become healthy.
    pub deploy_health_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckOptions {
    pub uri: String,
    /// Index into the task's allocated ports used for probing.
    pub port_index: usize,
    pub startup_delay_secs: Option<u64>,
    /// Failed probes tolerated before the task is definitively unhealthy.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerOptions {
    pub service_base_path: String,
    pub additional_routes: Vec<String>,
    pub groups: HashSet<String>,
    pub domains: HashSet<String>,
    pub template: Option<String>,
    pub options: Option<serde_json::Value>,
    /// Index into the task's allocated ports used as the routable port.
    pub port_index: Option<usize>,
    pub upstream_group: Option<String>,
    pub service_id_override: Option<String>,
}

/// Full lifecycle states reported by the executor protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum TaskState {
    Launched,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryUpdate {
    pub state: TaskState,
    pub timestamp_ms: u64,
}

/// Collapsed view of a task's lifecycle history, the only granularity the
/// checker's state machine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SimplifiedTaskState {
    Unknown,
    Waiting,
    Running,
    Done,
}

impl SimplifiedTaskState {
    pub fn from_history(updates: &[TaskHistoryUpdate]) -> Self {
        if updates.is_empty() {
            return SimplifiedTaskState::Unknown;
        }
        let mut reached_running = false;
        for update in updates {
            if update.state.is_done() {
                return SimplifiedTaskState::Done;
            }
            if update.state == TaskState::Running {
                reached_running = true;
            }
        }
        if reached_running {
            SimplifiedTaskState::Running
        } else {
            SimplifiedTaskState::Waiting
        }
    }
}

/// Outcome of one healthcheck probe. Absence in the store means no probe has
/// completed yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckResult {
    pub task_id: TaskId,
    pub timestamp_ms: u64,
    pub duration_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub failure_message: Option<String>,
    /// Zero-based count of failed probes preceding this one.
    pub attempt: u32,
    /// Whether the probe ran inside the configured startup window.
    pub startup: bool,
}

impl HealthcheckResult {
    pub fn failed(&self) -> bool {
        if self.failure_message.is_some() {
            return true;
        }
        !matches!(self.status_code, Some(code) if (200..300).contains(&code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerRequestState {
    Waiting,
    Success,
    Failed,
    Canceled,
    Canceling,
    Unknown,
    InvalidRequestNoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerMethod {
    PreEnqueue,
    Enqueue,
    CheckState,
    Cancel,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerRequestType {
    Add,
    Remove,
    Deploy,
}

/// Deterministic idempotency key for one external balancer exchange.
/// Re-derived on every check so retries address the same remote request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadBalancerRequestId {
    pub id: String,
    pub request_type: LoadBalancerRequestType,
    pub attempt: Option<u32>,
}

impl LoadBalancerRequestId {
    pub fn new(id: impl Into<String>, request_type: LoadBalancerRequestType) -> Self {
        Self {
            id: id.into(),
            request_type,
            attempt: None,
        }
    }

    pub fn with_attempt(
        id: impl Into<String>,
        request_type: LoadBalancerRequestType,
        attempt: u32,
    ) -> Self {
        Self {
            id: id.into(),
            request_type,
            attempt: Some(attempt),
        }
    }
}

impl fmt::Display for LoadBalancerRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attempt {
            Some(attempt) => write!(f, "{}-{}-{}", self.id, self.request_type, attempt),
            None => write!(f, "{}-{}", self.id, self.request_type),
        }
    }
}

/// One normalized reply from (or placeholder for) the external balancer,
/// persisted per (task, request-type) pair so re-checks resume the exchange
/// instead of restarting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerUpdate {
    pub state: LoadBalancerRequestState,
    pub request_id: LoadBalancerRequestId,
    pub message: Option<String>,
    pub timestamp_ms: u64,
    pub method: LoadBalancerMethod,
    pub uri: Option<String>,
}

impl LoadBalancerUpdate {
    /// Placeholder written before the first enqueue attempt so a crash
    /// between save and send is indistinguishable from an in-flight exchange.
    pub fn pre_enqueue(request_id: LoadBalancerRequestId) -> Self {
        Self {
            state: LoadBalancerRequestState::Unknown,
            request_id,
            message: None,
            timestamp_ms: get_epoch_time_in_ms(),
            method: LoadBalancerMethod::PreEnqueue,
            uri: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCleanupType {
    OverdueNewTask,
    UnhealthyNewTask,
    UserRequested,
    Deleting,
}

/// A kill intent appended to the cleanup queue. The checker never kills a
/// task directly; a separate consumer acts on these records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCleanup {
    pub cleanup_type: TaskCleanupType,
    pub task_id: TaskId,
    pub timestamp_ms: u64,
    pub message: Option<String>,
    pub user: Option<String>,
}

impl TaskCleanup {
    pub fn new(cleanup_type: TaskCleanupType, task_id: TaskId, message: Option<String>) -> Self {
        Self {
            cleanup_type,
            task_id,
            timestamp_ms: get_epoch_time_in_ms(),
            message,
            user: None,
        }
    }
}
