use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use dashmap::DashMap;
use strum::Display;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::{
    abort::{AbortReason, SystemAbort},
    config::NewTaskCheckerConfig,
    data_model::{
        LoadBalancerRequestId, LoadBalancerRequestState, LoadBalancerRequestType,
        LoadBalancerUpdate, SimplifiedTaskState, Task, TaskCleanup, TaskCleanupType,
        TaskHistoryUpdate, TaskId, TaskState, WorkloadWithState,
    },
    health::{task_health, Healthchecker, TaskHealth},
    load_balancer::LoadBalancerClient,
    notifier::Notifier,
    state_store::StateStore,
    utils::{format_duration, get_epoch_time_in_ms},
};

const PHASE_PENDING: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_CANCELED: u8 = 2;

/// One scheduled (or running) check. The phase word makes cancellation
/// linearizable with respect to the timer firing: a pending check moves
/// PENDING -> RUNNING exactly once, and a cancel that loses that race
/// observes RUNNING and reports it.
struct CheckHandle {
    phase: Arc<AtomicU8>,
    join: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CancelState {
    NotPresent,
    Canceled,
    NotCanceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CheckTaskState {
    Obsolete,
    CheckIfTaskOverdue,
    CheckIfHealthcheckOverdue,
    LbInProgressCheckAgain,
    UnhealthyKillTask,
    Healthy,
}

/// Decides, per launched task and on an independent timer, whether the task
/// should be killed, re-checked later, or left alone. Tasks under an active
/// deploy are not handled here; this covers new replacement tasks. Kills go
/// through the cleanup queue, never directly.
pub struct NewTaskChecker {
    config: NewTaskCheckerConfig,
    state_store: Arc<StateStore>,
    lb_client: Arc<dyn LoadBalancerClient>,
    healthchecker: Arc<dyn Healthchecker>,
    notifier: Arc<dyn Notifier>,
    abort: Arc<SystemAbort>,
    task_checks: DashMap<TaskId, CheckHandle>,
    /// Bounds concurrently executing checks; a worker blocked on a balancer
    /// call holds its permit, so this also bounds balancer concurrency.
    check_permits: Arc<Semaphore>,
}

impl NewTaskChecker {
    pub fn new(
        config: NewTaskCheckerConfig,
        state_store: Arc<StateStore>,
        lb_client: Arc<dyn LoadBalancerClient>,
        healthchecker: Arc<dyn Healthchecker>,
        notifier: Arc<dyn Notifier>,
        abort: Arc<SystemAbort>,
    ) -> Self {
        let check_permits = Arc::new(Semaphore::new(config.max_concurrent_checks));
        Self {
            config,
            state_store,
            lb_client,
            healthchecker,
            notifier,
            abort,
            task_checks: DashMap::new(),
            check_permits,
        }
    }

    /// Stops accepting new checks. Pending timers that fire afterwards bail
    /// out when they fail to acquire a permit.
    pub fn shutdown(&self) {
        self.check_permits.close();
    }

    pub fn num_scheduled_checks(&self) -> usize {
        self.task_checks.len()
    }

    pub fn has_scheduled_check(&self, task_id: &TaskId) -> bool {
        self.task_checks.contains_key(task_id)
    }

    fn has_healthcheck(&self, task: &Task, workload: Option<&WorkloadWithState>) -> bool {
        if task.deploy.healthcheck.is_none() {
            return false;
        }
        if task.skip_healthchecks.unwrap_or(false) {
            return false;
        }
        if let Some(workload) = workload {
            if workload.workload.skip_healthchecks.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    fn initial_delay(&self, task: &Task, workload: Option<&WorkloadWithState>) -> Duration {
        if self.has_healthcheck(task, workload) {
            if let Some(healthcheck) = &task.deploy.healthcheck {
                let startup_delay = healthcheck
                    .startup_delay_secs
                    .or(self.config.startup_delay_secs);
                if let Some(startup_delay) = startup_delay {
                    // First probe can happen right after the startup window,
                    // no need to wait out the whole deploy health timeout.
                    return Duration::from_secs(startup_delay);
                }
            }
        } else if workload.map(|w| w.workload.load_balanced).unwrap_or(false) {
            // Nothing to probe; start the balancer exchange quickly.
            return Duration::from_secs(self.config.base_delay_secs);
        }

        let health_timeout = task
            .deploy
            .deploy_health_timeout_secs
            .unwrap_or(self.config.deploy_healthy_by_secs);
        Duration::from_secs(self.config.base_delay_secs + health_timeout)
    }

    /// Registers a freshly launched task for checking. Idempotent: a task
    /// that already has a live registration is left alone.
    pub fn enqueue_new_task_check(
        self: &Arc<Self>,
        task: Task,
        workload: Option<&WorkloadWithState>,
    ) {
        if self.task_checks.contains_key(&task.id) {
            trace!(task_id = %task.id, "Already have a new task check for task");
            return;
        }

        let delay = self.initial_delay(&task, workload);
        if let Err(err) = self.schedule_check(task, delay) {
            warn!("Checker is shutting down, not scheduling new task check: {err:#}");
        }
    }

    /// Revokes a task's registration. The three-way result lets callers
    /// distinguish "never registered" from "raced with an in-flight run".
    pub fn cancel_new_task_check(&self, task_id: &TaskId) -> CancelState {
        let Some((_, handle)) = self.task_checks.remove(task_id) else {
            return CancelState::NotPresent;
        };

        let canceled = handle
            .phase
            .compare_exchange(
                PHASE_PENDING,
                PHASE_CANCELED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        trace!(task_id = %task_id, canceled = canceled, "Canceling new task check");

        if canceled {
            handle.join.abort();
            CancelState::Canceled
        } else {
            CancelState::NotCanceled
        }
    }

    /// Collapses a pending timer into an immediate run. A check that already
    /// started keeps going; one that never existed is presumed owned by an
    /// active deploy and is left alone.
    pub fn run_new_task_check_immediately(self: &Arc<Self>, task: Task) {
        info!(task_id = %task.id, "Requested immediate task check");

        match self.cancel_new_task_check(&task.id) {
            CancelState::NotCanceled => {
                debug!(task_id = %task.id, "Task check already started, not running again");
            }
            CancelState::NotPresent => {
                trace!(
                    task_id = %task.id,
                    "Task check not present, assumed to be part of an active deploy"
                );
            }
            CancelState::Canceled => {
                if let Err(err) = self.schedule_check(task, Duration::ZERO) {
                    warn!("Checker is shutting down, not scheduling immediate check: {err:#}");
                }
            }
        }
    }

    fn schedule_check(self: &Arc<Self>, task: Task, delay: Duration) -> Result<()> {
        if self.check_permits.is_closed() {
            anyhow::bail!("new task check worker pool is closed");
        }

        trace!(
            task_id = %task.id,
            delay = %format_duration(delay),
            "Enqueuing a new task check"
        );

        let phase = Arc::new(AtomicU8::new(PHASE_PENDING));
        let run_phase = phase.clone();
        let checker = Arc::clone(self);
        let task_id = task.id.clone();

        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if run_phase
                .compare_exchange(
                    PHASE_PENDING,
                    PHASE_RUNNING,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                return;
            }

            let _permit = match checker.check_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(task_id = %task.id, "Worker pool closed, dropping task check");
                    return;
                }
            };

            checker.run_check(task).await;
        });

        self.task_checks.insert(task_id, CheckHandle { phase, join });
        Ok(())
    }

    fn re_enqueue(self: &Arc<Self>, task: Task) -> Result<()> {
        self.schedule_check(task, Duration::from_secs(self.config.check_every_secs))
    }

    async fn re_enqueue_or_abort(self: &Arc<Self>, task: Task) {
        if let Err(err) = self.re_enqueue(task.clone()) {
            error!(
                task_id = %task.id,
                "Failed to re-enqueue task check, aborting: {err:#}"
            );
            self.notifier
                .notify(
                    &format!("Error re-enqueuing task check ({err:#})"),
                    HashMap::from([("taskId".to_string(), task.id.to_string())]),
                )
                .await;
            self.abort.abort(AbortReason::UnrecoverableError, &err);
        }
    }

    async fn run_check(self: &Arc<Self>, task: Task) {
        let Some(workload) = self.state_store.get_workload(&task.workload_id).await else {
            info!(
                task_id = %task.id,
                workload_id = %task.workload_id,
                "Ignoring task check, workload is gone"
            );
            self.task_checks.remove(&task.id);
            return;
        };

        match self.check_task(&task, &workload).await {
            Ok(true) => {
                if let Err(err) = self.re_enqueue(task.clone()) {
                    error!(task_id = %task.id, "Failed to re-enqueue task check: {err:#}");
                    self.notifier
                        .notify(
                            &format!("Error re-enqueuing task check ({err:#})"),
                            HashMap::from([("taskId".to_string(), task.id.to_string())]),
                        )
                        .await;
                    self.re_enqueue_or_abort(task).await;
                }
            }
            Ok(false) => {
                self.task_checks.remove(&task.id);
            }
            Err(err) => {
                // A transient internal error must never kill a healthy task;
                // report it and keep the task covered.
                error!(
                    task_id = %task.id,
                    "Uncaught error in task check, re-enqueuing: {err:#}"
                );
                self.notifier
                    .notify(
                        &format!("Error in task check ({err:#})"),
                        HashMap::from([("taskId".to_string(), task.id.to_string())]),
                    )
                    .await;
                self.re_enqueue_or_abort(task).await;
            }
        }
    }

    /// Applies the transition effects for one evaluated state. Returns
    /// whether the check should fire again.
    async fn check_task(&self, task: &Task, workload: &WorkloadWithState) -> Result<bool> {
        let start = std::time::Instant::now();
        let state = self.task_state(task, workload).await?;

        debug!(
            task_id = %task.id,
            state = %state,
            duration_ms = start.elapsed().as_millis() as u64,
            "Evaluated task check state"
        );

        match state {
            CheckTaskState::CheckIfHealthcheckOverdue => {
                let deadline =
                    Duration::from_secs(self.config.kill_if_not_healthy_after_secs);
                if self.is_healthcheck_overdue(task).await {
                    info!(
                        task_id = %task.id,
                        "Killing task because it did not become healthy after {}",
                        format_duration(deadline)
                    );
                    self.state_store
                        .create_task_cleanup(TaskCleanup::new(
                            TaskCleanupType::OverdueNewTask,
                            task.id.clone(),
                            Some(format!(
                                "Task did not become healthy after {}",
                                format_duration(deadline)
                            )),
                        ))
                        .await;
                    self.check_for_repeated_failures(task, workload).await;
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            CheckTaskState::CheckIfTaskOverdue => {
                let deadline =
                    Duration::from_secs(self.config.kill_after_task_not_running_secs);
                if self.is_task_overdue(task) {
                    info!(
                        task_id = %task.id,
                        "Killing task because it did not reach the running state after {}",
                        format_duration(deadline)
                    );
                    self.state_store
                        .create_task_cleanup(TaskCleanup::new(
                            TaskCleanupType::OverdueNewTask,
                            task.id.clone(),
                            Some(format!(
                                "Task did not reach the running state after {}",
                                format_duration(deadline)
                            )),
                        ))
                        .await;
                    self.check_for_repeated_failures(task, workload).await;
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            CheckTaskState::LbInProgressCheckAgain => Ok(true),
            CheckTaskState::UnhealthyKillTask => {
                info!(task_id = %task.id, "Killing task because it failed healthchecks");
                self.state_store
                    .create_task_cleanup(TaskCleanup::new(
                        TaskCleanupType::UnhealthyNewTask,
                        task.id.clone(),
                        Some("Task is not healthy".to_string()),
                    ))
                    .await;
                self.check_for_repeated_failures(task, workload).await;
                Ok(false)
            }
            CheckTaskState::Healthy | CheckTaskState::Obsolete => {
                self.state_store
                    .clear_unhealthy_kills(&workload.workload.id)
                    .await;
                Ok(false)
            }
        }
    }

    async fn check_for_repeated_failures(&self, task: &Task, workload: &WorkloadWithState) {
        self.state_store
            .mark_unhealthy_kill(&task.workload_id, &task.id)
            .await;

        let strikes = self.state_store.num_unhealthy_kills(&task.workload_id).await;
        // Notify exactly once per threshold crossing; clearing the counter
        // on a healthy task re-arms it.
        if strikes == self.config.slow_failure_cooldown_count + 1 {
            self.notifier
                .send_replacement_tasks_failing(&workload.workload)
                .await;
        }
    }

    async fn task_state(
        &self,
        task: &Task,
        workload: &WorkloadWithState,
    ) -> Result<CheckTaskState> {
        if !self.state_store.is_active_task(&task.id).await {
            return Ok(CheckTaskState::Obsolete);
        }

        let history = self.state_store.task_history(&task.id).await;
        match SimplifiedTaskState::from_history(&history) {
            SimplifiedTaskState::Done => return Ok(CheckTaskState::Obsolete),
            SimplifiedTaskState::Waiting | SimplifiedTaskState::Unknown => {
                return Ok(CheckTaskState::CheckIfTaskOverdue);
            }
            SimplifiedTaskState::Running => {}
        }

        if self.has_healthcheck(task, Some(workload)) {
            let last_healthcheck = self.state_store.last_healthcheck(&task.id).await;
            match task_health(&task.deploy, last_healthcheck.as_ref()) {
                TaskHealth::Waiting => {
                    self.healthchecker.enqueue_probe(task).await;
                    return Ok(CheckTaskState::CheckIfHealthcheckOverdue);
                }
                TaskHealth::Unhealthy => {
                    self.state_store.clear_startup_healthchecks(&task.id).await;
                    return Ok(CheckTaskState::UnhealthyKillTask);
                }
                TaskHealth::Healthy => {
                    self.state_store.clear_startup_healthchecks(&task.id).await;
                }
            }
        }

        // Task is running and has passed its healthcheck if it has one.
        if !workload.workload.load_balanced {
            return Ok(CheckTaskState::Healthy);
        }

        self.check_load_balancer(task, workload).await
    }

    /// Drives the idempotent ADD exchange with the balancer: start it if no
    /// exchange is on record, otherwise resume from the persisted state.
    async fn check_load_balancer(
        &self,
        task: &Task,
        workload: &WorkloadWithState,
    ) -> Result<CheckTaskState> {
        let request_id =
            LoadBalancerRequestId::new(task.id.get(), LoadBalancerRequestType::Add);
        let stored = self
            .state_store
            .load_balancer_state(&task.id, LoadBalancerRequestType::Add)
            .await;
        let task_cleaning = self
            .state_store
            .cleanup_task_ids()
            .await
            .contains(&task.id);

        let should_enqueue = stored
            .as_ref()
            .map(unknown_not_removing)
            .unwrap_or(true);

        let fresh = if should_enqueue && !task_cleaning {
            self.state_store
                .save_load_balancer_state(
                    &task.id,
                    LoadBalancerRequestType::Add,
                    LoadBalancerUpdate::pre_enqueue(request_id.clone()),
                )
                .await;

            self.lb_client
                .enqueue(
                    &request_id,
                    &workload.workload,
                    &task.deploy,
                    std::slice::from_ref(task),
                    &[],
                )
                .await
        } else {
            let Some(stored) = stored else {
                debug!(
                    task_id = %task.id,
                    "Task queued for cleanup with no balancer exchange on record, checking again later"
                );
                return Ok(CheckTaskState::LbInProgressCheckAgain);
            };
            if let Some(state) = terminal_check_state(stored.state) {
                return Ok(state);
            }
            self.lb_client.get_state(&request_id).await
        };

        self.state_store
            .save_load_balancer_state(&task.id, LoadBalancerRequestType::Add, fresh.clone())
            .await;

        if let Some(state) = terminal_check_state(fresh.state) {
            return Ok(state);
        }
        Ok(CheckTaskState::LbInProgressCheckAgain)
    }

    async fn is_healthcheck_overdue(&self, task: &Task) -> bool {
        // Measured against the moment the task reached running, not against
        // launch; the two clocks kill at different times and both are load
        // bearing.
        let running_start = self.task_running_start_time(&task.id).await;
        let elapsed_ms = get_epoch_time_in_ms().saturating_sub(running_start);
        let allowed_ms = self.config.kill_if_not_healthy_after_secs * 1000;

        let overdue = elapsed_ms > allowed_ms;
        if overdue {
            debug!(
                task_id = %task.id,
                elapsed_ms = elapsed_ms,
                allowed_ms = allowed_ms,
                "Task healthcheck is overdue"
            );
        }
        overdue
    }

    fn is_task_overdue(&self, task: &Task) -> bool {
        let elapsed_ms = get_epoch_time_in_ms().saturating_sub(task.started_at);
        let allowed_ms = self.config.kill_after_task_not_running_secs * 1000;

        let overdue = elapsed_ms > allowed_ms;
        if overdue {
            debug!(
                task_id = %task.id,
                elapsed_ms = elapsed_ms,
                allowed_ms = allowed_ms,
                "Task is overdue to reach the running state"
            );
        }
        overdue
    }

    async fn task_running_start_time(&self, task_id: &TaskId) -> u64 {
        let history = self.state_store.task_history(task_id).await;
        let running = history
            .iter()
            .find(|update: &&TaskHistoryUpdate| update.state == TaskState::Running);

        match running {
            Some(update) => update.timestamp_ms,
            None => {
                error!(task_id = %task_id, "Could not find time when task reached running");
                get_epoch_time_in_ms()
            }
        }
    }
}

fn unknown_not_removing(update: &LoadBalancerUpdate) -> bool {
    update.state == LoadBalancerRequestState::Unknown &&
        update.request_id.request_type != LoadBalancerRequestType::Remove
}

fn terminal_check_state(state: LoadBalancerRequestState) -> Option<CheckTaskState> {
    match state {
        LoadBalancerRequestState::Success => Some(CheckTaskState::Healthy),
        LoadBalancerRequestState::Canceled |
        LoadBalancerRequestState::Failed |
        LoadBalancerRequestState::InvalidRequestNoop => {
            Some(CheckTaskState::UnhealthyKillTask)
        }
        LoadBalancerRequestState::Canceling |
        LoadBalancerRequestState::Unknown |
        LoadBalancerRequestState::Waiting => None,
    }
}
