use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    data_model::{Deploy, HealthcheckResult, Task},
    state_store::StateStore,
    utils::get_epoch_time_in_ms,
};

/// Health verdict for one task given its deploy's healthcheck options and the
/// most recent probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHealth {
    Waiting,
    Healthy,
    Unhealthy,
}

/// No result yet means the probe pipeline is still warming up. A failed
/// result only becomes definitive once the deploy's retry budget is spent.
pub fn task_health(deploy: &Deploy, last_result: Option<&HealthcheckResult>) -> TaskHealth {
    let Some(healthcheck) = &deploy.healthcheck else {
        return TaskHealth::Healthy;
    };

    match last_result {
        None => TaskHealth::Waiting,
        Some(result) if !result.failed() => TaskHealth::Healthy,
        Some(result) => {
            if result.attempt >= healthcheck.max_retries {
                TaskHealth::Unhealthy
            } else {
                TaskHealth::Waiting
            }
        }
    }
}

/// Collaborator that performs one HTTP health probe for a task. Fire and
/// forget; the outcome becomes observable through the state store.
#[async_trait]
pub trait Healthchecker: Send + Sync {
    async fn enqueue_probe(&self, task: &Task);
}

/// Default prober: a single GET against the task's healthcheck endpoint,
/// result saved to the store.
pub struct HttpProber {
    client: reqwest::Client,
    state_store: Arc<StateStore>,
}

impl HttpProber {
    pub fn new(state_store: Arc<StateStore>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            state_store,
        })
    }

    async fn probe(&self, task: &Task) {
        let Some(healthcheck) = &task.deploy.healthcheck else {
            return;
        };
        let Some(port) = task.ports.get(healthcheck.port_index).copied() else {
            warn!(
                task_id = %task.id,
                port_index = healthcheck.port_index,
                "Task has no allocated port at the healthcheck port index, skipping probe"
            );
            return;
        };

        let url = format!("http://{}:{}{}", task.host, port, healthcheck.uri);
        let attempt = match self.state_store.last_healthcheck(&task.id).await {
            Some(prior) if prior.failed() => prior.attempt + 1,
            _ => 0,
        };
        let startup_window_ms = healthcheck.startup_delay_secs.unwrap_or(0) * 1000;
        let startup = get_epoch_time_in_ms() < task.started_at + startup_window_ms;

        let started = std::time::Instant::now();
        let (status_code, failure_message) = match self.client.get(&url).send().await {
            Ok(response) => (Some(response.status().as_u16()), None),
            Err(err) => (None, Some(err.to_string())),
        };

        debug!(
            task_id = %task.id,
            url = url,
            status_code = status_code.unwrap_or(0),
            attempt = attempt,
            "Healthcheck probe finished"
        );

        self.state_store
            .save_healthcheck(HealthcheckResult {
                task_id: task.id.clone(),
                timestamp_ms: get_epoch_time_in_ms(),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                status_code,
                failure_message,
                attempt,
                startup,
            })
            .await;
    }
}

#[async_trait]
impl Healthchecker for HttpProber {
    async fn enqueue_probe(&self, task: &Task) {
        self.probe(task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::test_objects::tests::{mock_deploy, mock_healthcheck_deploy};

    fn result(status_code: Option<u16>, attempt: u32) -> HealthcheckResult {
        HealthcheckResult {
            task_id: "task-1".into(),
            timestamp_ms: 0,
            duration_ms: None,
            status_code,
            failure_message: None,
            attempt,
            startup: false,
        }
    }

    #[test]
    fn test_no_healthcheck_is_healthy() {
        assert_eq!(task_health(&mock_deploy(), None), TaskHealth::Healthy);
    }

    #[test]
    fn test_no_result_is_waiting() {
        assert_eq!(
            task_health(&mock_healthcheck_deploy(), None),
            TaskHealth::Waiting
        );
    }

    #[test]
    fn test_passing_result_is_healthy() {
        assert_eq!(
            task_health(&mock_healthcheck_deploy(), Some(&result(Some(200), 0))),
            TaskHealth::Healthy
        );
    }

    #[test]
    fn test_failure_within_retry_budget_is_waiting() {
        // mock_healthcheck_deploy allows one retry.
        assert_eq!(
            task_health(&mock_healthcheck_deploy(), Some(&result(Some(500), 0))),
            TaskHealth::Waiting
        );
    }

    #[test]
    fn test_failure_past_retry_budget_is_unhealthy() {
        assert_eq!(
            task_health(&mock_healthcheck_deploy(), Some(&result(Some(500), 1))),
            TaskHealth::Unhealthy
        );
    }
}
