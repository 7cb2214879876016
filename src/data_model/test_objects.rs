pub mod tests {
    use std::collections::{HashMap, HashSet};

    use crate::{
        data_model::{
            Deploy, HealthcheckOptions, LoadBalancerOptions, Task, Workload, WorkloadId,
            WorkloadState, WorkloadWithState,
        },
        utils::get_epoch_time_in_ms,
    };

    pub const TEST_WORKLOAD_ID: &str = "web-service";
    pub const TEST_DEPLOY_ID: &str = "deploy-1";
    pub const TEST_HOST: &str = "agent-1.example.com";

    pub fn mock_workload(load_balanced: bool) -> WorkloadWithState {
        WorkloadWithState {
            workload: Workload {
                id: WorkloadId::from(TEST_WORKLOAD_ID),
                owners: vec!["ops@example.com".to_string()],
                load_balanced,
                skip_healthchecks: None,
            },
            state: WorkloadState::Active,
        }
    }

    pub fn mock_deploy() -> Deploy {
        Deploy {
            id: TEST_DEPLOY_ID.into(),
            healthcheck: None,
            load_balancer: None,
            deploy_health_timeout_secs: Some(120),
        }
    }

    pub fn mock_healthcheck_deploy() -> Deploy {
        Deploy {
            healthcheck: Some(HealthcheckOptions {
                uri: "/health".to_string(),
                port_index: 0,
                startup_delay_secs: Some(2),
                max_retries: 1,
            }),
            ..mock_deploy()
        }
    }

    pub fn mock_load_balanced_deploy() -> Deploy {
        Deploy {
            load_balancer: Some(LoadBalancerOptions {
                service_base_path: "/web-service".to_string(),
                additional_routes: vec!["/web-service-beta".to_string()],
                groups: HashSet::from(["default".to_string()]),
                domains: HashSet::from(["example.com".to_string()]),
                template: None,
                options: None,
                port_index: Some(0),
                upstream_group: None,
                service_id_override: None,
            }),
            ..mock_deploy()
        }
    }

    pub fn mock_task(id: &str, deploy: Deploy) -> Task {
        Task {
            id: id.into(),
            workload_id: WorkloadId::from(TEST_WORKLOAD_ID),
            deploy_id: deploy.id.clone(),
            started_at: get_epoch_time_in_ms(),
            host: TEST_HOST.to_string(),
            rack: Some("rack-1".to_string()),
            ports: vec![31000, 31001],
            labels: HashMap::new(),
            skip_healthchecks: None,
            deploy,
        }
    }
}
