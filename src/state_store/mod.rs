use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::data_model::{
    HealthcheckResult, LoadBalancerRequestState, LoadBalancerRequestType, LoadBalancerUpdate,
    Task, TaskCleanup, TaskHistoryUpdate, TaskId, TaskState, WorkloadId, WorkloadWithState,
};
use crate::utils::get_epoch_time_in_ms;

#[derive(Default)]
struct InMemoryState {
    workloads: HashMap<WorkloadId, WorkloadWithState>,
    active_tasks: HashSet<TaskId>,
    task_history: HashMap<TaskId, Vec<TaskHistoryUpdate>>,
    healthchecks: HashMap<TaskId, HealthcheckResult>,
    startup_healthchecks: HashMap<TaskId, Vec<HealthcheckResult>>,
    cleanups: Vec<TaskCleanup>,
    lb_updates: HashMap<(TaskId, LoadBalancerRequestType), LoadBalancerUpdate>,
    unhealthy_kills: HashMap<WorkloadId, Vec<TaskId>>,
}

/// The storage surface the reconciliation core reads and writes. Persistence
/// engines live behind this in a full deployment; here state is held in
/// memory, mirroring what an external key-value store would hold.
pub struct StateStore {
    state: RwLock<InMemoryState>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(InMemoryState::default()),
        }
    }

    // Workloads

    pub async fn upsert_workload(&self, workload: WorkloadWithState) {
        let mut state = self.state.write().await;
        state
            .workloads
            .insert(workload.workload.id.clone(), workload);
    }

    pub async fn remove_workload(&self, workload_id: &WorkloadId) {
        let mut state = self.state.write().await;
        state.workloads.remove(workload_id);
    }

    pub async fn get_workload(&self, workload_id: &WorkloadId) -> Option<WorkloadWithState> {
        self.state.read().await.workloads.get(workload_id).cloned()
    }

    // Tasks and lifecycle history

    /// Registers a freshly launched task as active with its initial history
    /// entry.
    pub async fn add_task(&self, task: &Task) {
        let mut state = self.state.write().await;
        state.active_tasks.insert(task.id.clone());
        state.task_history.entry(task.id.clone()).or_default().push(
            TaskHistoryUpdate {
                state: TaskState::Launched,
                timestamp_ms: task.started_at,
            },
        );
    }

    pub async fn is_active_task(&self, task_id: &TaskId) -> bool {
        self.state.read().await.active_tasks.contains(task_id)
    }

    pub async fn remove_active_task(&self, task_id: &TaskId) {
        let mut state = self.state.write().await;
        state.active_tasks.remove(task_id);
    }

    pub async fn record_task_update(&self, task_id: &TaskId, task_state: TaskState) {
        self.record_task_update_at(task_id, task_state, get_epoch_time_in_ms())
            .await;
    }

    /// Lifecycle updates from the agent feed carry their own timestamps.
    pub async fn record_task_update_at(
        &self,
        task_id: &TaskId,
        task_state: TaskState,
        timestamp_ms: u64,
    ) {
        let mut state = self.state.write().await;
        state
            .task_history
            .entry(task_id.clone())
            .or_default()
            .push(TaskHistoryUpdate {
                state: task_state,
                timestamp_ms,
            });
    }

    pub async fn task_history(&self, task_id: &TaskId) -> Vec<TaskHistoryUpdate> {
        self.state
            .read()
            .await
            .task_history
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    // Healthchecks

    pub async fn save_healthcheck(&self, result: HealthcheckResult) {
        let mut state = self.state.write().await;
        if result.startup {
            state
                .startup_healthchecks
                .entry(result.task_id.clone())
                .or_default()
                .push(result.clone());
        }
        state.healthchecks.insert(result.task_id.clone(), result);
    }

    pub async fn last_healthcheck(&self, task_id: &TaskId) -> Option<HealthcheckResult> {
        self.state.read().await.healthchecks.get(task_id).cloned()
    }

    pub async fn clear_startup_healthchecks(&self, task_id: &TaskId) {
        let mut state = self.state.write().await;
        state.startup_healthchecks.remove(task_id);
    }

    // Cleanup queue

    pub async fn create_task_cleanup(&self, cleanup: TaskCleanup) {
        debug!(
            task_id = %cleanup.task_id,
            cleanup_type = %cleanup.cleanup_type,
            "Creating task cleanup"
        );
        let mut state = self.state.write().await;
        state.cleanups.push(cleanup);
    }

    pub async fn cleanup_task_ids(&self) -> HashSet<TaskId> {
        self.state
            .read()
            .await
            .cleanups
            .iter()
            .map(|cleanup| cleanup.task_id.clone())
            .collect()
    }

    pub async fn task_cleanups(&self) -> Vec<TaskCleanup> {
        self.state.read().await.cleanups.clone()
    }

    // Load balancer exchange state

    /// Persists the latest balancer exchange state for a (task, request-type)
    /// pair. An ADD exchange that already reached Success is never
    /// overwritten by a less-final state.
    pub async fn save_load_balancer_state(
        &self,
        task_id: &TaskId,
        request_type: LoadBalancerRequestType,
        update: LoadBalancerUpdate,
    ) {
        let mut state = self.state.write().await;
        let key = (task_id.clone(), request_type);
        if request_type == LoadBalancerRequestType::Add &&
            update.state != LoadBalancerRequestState::Success
        {
            if let Some(existing) = state.lb_updates.get(&key) {
                if existing.state == LoadBalancerRequestState::Success {
                    warn!(
                        task_id = %task_id,
                        new_state = %update.state,
                        "Refusing to overwrite successful ADD exchange with a less final state"
                    );
                    return;
                }
            }
        }
        state.lb_updates.insert(key, update);
    }

    pub async fn load_balancer_state(
        &self,
        task_id: &TaskId,
        request_type: LoadBalancerRequestType,
    ) -> Option<LoadBalancerUpdate> {
        self.state
            .read()
            .await
            .lb_updates
            .get(&(task_id.clone(), request_type))
            .cloned()
    }

    // Unhealthy-kill strike counters

    pub async fn mark_unhealthy_kill(&self, workload_id: &WorkloadId, task_id: &TaskId) {
        let mut state = self.state.write().await;
        state
            .unhealthy_kills
            .entry(workload_id.clone())
            .or_default()
            .push(task_id.clone());
    }

    pub async fn num_unhealthy_kills(&self, workload_id: &WorkloadId) -> usize {
        self.state
            .read()
            .await
            .unhealthy_kills
            .get(workload_id)
            .map(|kills| kills.len())
            .unwrap_or(0)
    }

    pub async fn clear_unhealthy_kills(&self, workload_id: &WorkloadId) {
        let mut state = self.state.write().await;
        state.unhealthy_kills.remove(workload_id);
    }
}
