use std::collections::{HashMap, HashSet};

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub structured_logging: bool,
    pub new_task_checker: NewTaskCheckerConfig,
    pub load_balancer: LoadBalancerConfig,
    /// Per-probe timeout for the built-in HTTP healthcheck prober.
    pub healthcheck_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            structured_logging: false,
            new_task_checker: NewTaskCheckerConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            healthcheck_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.new_task_checker.max_concurrent_checks == 0 {
            return Err(anyhow::anyhow!("max_concurrent_checks must be at least 1"));
        }
        if self.new_task_checker.check_every_secs == 0 {
            return Err(anyhow::anyhow!("check_every_secs must be at least 1"));
        }
        if self.load_balancer.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "load balancer request_timeout_ms must be positive"
            ));
        }
        if Url::parse(&self.load_balancer.uri).is_err() {
            return Err(anyhow::anyhow!(
                "invalid load balancer uri: {}",
                self.load_balancer.uri
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTaskCheckerConfig {
    /// Delay before the first check of a freshly launched, load balanced
    /// task without a healthcheck.
    pub base_delay_secs: u64,
    /// Standard re-check interval once a task is under observation.
    pub check_every_secs: u64,
    /// Size of the shared worker pool; also bounds concurrent balancer
    /// calls, since a worker blocks on its call.
    pub max_concurrent_checks: usize,
    /// Global default startup delay applied when a deploy's healthcheck does
    /// not set its own.
    pub startup_delay_secs: Option<u64>,
    /// Kill a task that never reaches the running state after this long,
    /// measured from launch.
    pub kill_after_task_not_running_secs: u64,
    /// Kill a task that never becomes healthy after this long, measured from
    /// the moment it reached the running state.
    pub kill_if_not_healthy_after_secs: u64,
    /// Fallback deploy-health timeout when the deploy does not set one.
    pub deploy_healthy_by_secs: u64,
    /// Unhealthy-kill strikes tolerated per workload before operators are
    /// notified.
    pub slow_failure_cooldown_count: usize,
}

impl Default for NewTaskCheckerConfig {
    fn default() -> Self {
        NewTaskCheckerConfig {
            base_delay_secs: 1,
            check_every_secs: 5,
            max_concurrent_checks: 3,
            startup_delay_secs: None,
            kill_after_task_not_running_secs: 600,
            kill_if_not_healthy_after_secs: 600,
            deploy_healthy_by_secs: 120,
            slow_failure_cooldown_count: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Request endpoint of the balancer control plane.
    pub uri: String,
    pub request_timeout_ms: u64,
    /// Static query parameters applied to every call.
    pub query_params: Option<HashMap<String, String>>,
    /// Task label whose value, when present, overrides the upstream group.
    pub task_label_for_upstream_group: Option<String>,
    pub pre_resolve_upstream_dns: bool,
    /// Workloads for which DNS pre-resolution is force-disabled.
    pub skip_dns_pre_resolution_for_workloads: HashSet<String>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        LoadBalancerConfig {
            uri: "http://127.0.0.1:8080/load-balancer/request".to_string(),
            request_timeout_ms: 2000,
            query_params: None,
            task_label_for_upstream_group: None,
            pre_resolve_upstream_dns: false,
            skip_dns_pre_resolution_for_workloads: HashSet::new(),
        }
    }
}
