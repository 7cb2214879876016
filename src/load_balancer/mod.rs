pub mod upstreams;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    config::LoadBalancerConfig,
    data_model::{
        Deploy, LoadBalancerMethod, LoadBalancerRequestId, LoadBalancerRequestState,
        LoadBalancerUpdate, Task, Workload, WorkloadId,
    },
    load_balancer::upstreams::upstreams_for_tasks,
    utils::{format_duration_ms, get_epoch_time_in_ms},
};

/// One routable endpoint as the balancer control plane sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamInfo {
    pub upstream: String,
    pub request_id: Option<String>,
    pub rack_id: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerAction {
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub service_id: String,
    pub owners: Vec<String>,
    pub service_base_path: String,
    pub additional_routes: Vec<String>,
    pub load_balancer_groups: HashSet<String>,
    pub options: Option<serde_json::Value>,
    pub template_name: Option<String>,
    pub domains: HashSet<String>,
    pub pre_resolve_upstream_dns: bool,
}

/// Request envelope for enqueue/delete operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRequest {
    pub load_balancer_request_id: String,
    pub load_balancer_service: ServiceDescriptor,
    pub add_upstreams: Vec<UpstreamInfo>,
    pub remove_upstreams: Vec<UpstreamInfo>,
    pub replace_upstreams: Vec<UpstreamInfo>,
    pub action: LoadBalancerAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerResponse {
    pub load_balancer_state: LoadBalancerRequestState,
    pub message: Option<String>,
}

/// The balancer's current view of a whole service, for deploy tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerServiceState {
    pub service: ServiceDescriptor,
    pub upstreams: Vec<UpstreamInfo>,
}

#[derive(Debug, Clone)]
pub struct CheckedUpstreamsUpdate {
    pub workload_id: WorkloadId,
    pub service_state: Option<LoadBalancerServiceState>,
}

/// Protocol client for the external load balancer control plane. Every
/// operation normalizes all outcomes (success, non-2xx, timeout, transport
/// error) into a `LoadBalancerUpdate`; none of them surface errors to the
/// caller.
#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    async fn enqueue(
        &self,
        request_id: &LoadBalancerRequestId,
        workload: &Workload,
        deploy: &Deploy,
        add: &[Task],
        remove: &[Task],
    ) -> LoadBalancerUpdate;

    async fn get_state(&self, request_id: &LoadBalancerRequestId) -> LoadBalancerUpdate;

    async fn cancel(&self, request_id: &LoadBalancerRequestId) -> LoadBalancerUpdate;

    async fn delete(
        &self,
        request_id: &LoadBalancerRequestId,
        workload_id: &WorkloadId,
        groups: &HashSet<String>,
        service_base_path: &str,
    ) -> LoadBalancerUpdate;

    async fn service_state(&self, workload_id: &WorkloadId) -> CheckedUpstreamsUpdate;
}

pub struct HttpLoadBalancerClient {
    client: reqwest::Client,
    config: LoadBalancerConfig,
}

impl HttpLoadBalancerClient {
    pub fn new(config: LoadBalancerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    fn operation_uri(&self, request_id: &LoadBalancerRequestId) -> String {
        format!("{}/{}", self.config.uri, request_id)
    }

    /// The control plane exposes per-service state under the sibling "state"
    /// path of the request endpoint.
    fn state_uri(&self, workload_id: &WorkloadId) -> String {
        format!("{}/{}", self.config.uri.replace("request", "state"), workload_id)
    }

    fn with_query_params(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.query_params {
            Some(params) => request.query(params),
            None => request,
        }
    }

    fn service_descriptor(&self, workload: &Workload, deploy: &Deploy) -> ServiceDescriptor {
        let lb_options = deploy.load_balancer.clone().unwrap_or_default();

        let pre_resolve_upstream_dns = if self
            .config
            .skip_dns_pre_resolution_for_workloads
            .contains(workload.id.get())
        {
            false
        } else {
            self.config.pre_resolve_upstream_dns
        };

        ServiceDescriptor {
            service_id: lb_options
                .service_id_override
                .unwrap_or_else(|| workload.id.get().to_string()),
            owners: workload.owners.clone(),
            service_base_path: lb_options.service_base_path,
            additional_routes: lb_options.additional_routes,
            load_balancer_groups: lb_options.groups,
            options: lb_options.options,
            template_name: lb_options.template,
            domains: lb_options.domains,
            pre_resolve_upstream_dns,
        }
    }

    async fn send_wrapped(
        &self,
        request_id: &LoadBalancerRequestId,
        method: LoadBalancerMethod,
        request: reqwest::RequestBuilder,
        uri: String,
        on_failure: LoadBalancerRequestState,
    ) -> LoadBalancerUpdate {
        let start = get_epoch_time_in_ms();
        let (state, message) = self.send(request_id, method, request, on_failure).await;

        debug!(
            request_id = %request_id,
            method = %method,
            state = %state,
            duration_ms = get_epoch_time_in_ms().saturating_sub(start),
            "Load balancer request finished"
        );

        LoadBalancerUpdate {
            state,
            request_id: request_id.clone(),
            message,
            timestamp_ms: start,
            method,
            uri: Some(uri),
        }
    }

    async fn send(
        &self,
        request_id: &LoadBalancerRequestId,
        method: LoadBalancerMethod,
        request: reqwest::RequestBuilder,
        on_failure: LoadBalancerRequestState,
    ) -> (LoadBalancerRequestState, Option<String>) {
        trace!(request_id = %request_id, method = %method, "Sending load balancer request");

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                trace!(
                    request_id = %request_id,
                    method = %method,
                    status = status.as_u16(),
                    "Load balancer request returned"
                );

                if status == StatusCode::GATEWAY_TIMEOUT {
                    return (
                        LoadBalancerRequestState::Unknown,
                        Some(format!(
                            "Load balancer {method} request {request_id} timed out"
                        )),
                    );
                }
                if !status.is_success() {
                    return (
                        on_failure,
                        Some(format!("Response status code {}", status.as_u16())),
                    );
                }

                match response.json::<LoadBalancerResponse>().await {
                    Ok(body) => (body.load_balancer_state, body.message),
                    Err(err) => (
                        LoadBalancerRequestState::Unknown,
                        Some(format!("Error reading load balancer response: {err}")),
                    ),
                }
            }
            Err(err) if err.is_timeout() => (
                LoadBalancerRequestState::Unknown,
                Some(format!(
                    "Timed out after {}",
                    format_duration_ms(self.config.request_timeout_ms)
                )),
            ),
            Err(err) => (
                LoadBalancerRequestState::Unknown,
                Some(format!("Request error: {err}")),
            ),
        }
    }

    async fn send_envelope(
        &self,
        request_id: &LoadBalancerRequestId,
        method: LoadBalancerMethod,
        envelope: LoadBalancerRequest,
    ) -> LoadBalancerUpdate {
        let request = self
            .with_query_params(self.client.post(&self.config.uri))
            .json(&envelope);

        self.send_wrapped(
            request_id,
            method,
            request,
            self.config.uri.clone(),
            LoadBalancerRequestState::Failed,
        )
        .await
    }
}

#[async_trait]
impl LoadBalancerClient for HttpLoadBalancerClient {
    async fn enqueue(
        &self,
        request_id: &LoadBalancerRequestId,
        workload: &Workload,
        deploy: &Deploy,
        add: &[Task],
        remove: &[Task],
    ) -> LoadBalancerUpdate {
        let upstream_group = deploy
            .load_balancer
            .as_ref()
            .and_then(|options| options.upstream_group.as_deref());
        let group_label_key = self.config.task_label_for_upstream_group.as_deref();

        let envelope = LoadBalancerRequest {
            load_balancer_request_id: request_id.to_string(),
            load_balancer_service: self.service_descriptor(workload, deploy),
            add_upstreams: upstreams_for_tasks(
                add,
                &request_id.to_string(),
                upstream_group,
                group_label_key,
            ),
            remove_upstreams: upstreams_for_tasks(
                remove,
                &request_id.to_string(),
                upstream_group,
                group_label_key,
            ),
            replace_upstreams: Vec::new(),
            action: LoadBalancerAction::Update,
        };

        self.send_envelope(request_id, LoadBalancerMethod::Enqueue, envelope)
            .await
    }

    async fn get_state(&self, request_id: &LoadBalancerRequestId) -> LoadBalancerUpdate {
        let uri = self.operation_uri(request_id);
        let request = self.with_query_params(self.client.get(&uri));

        self.send_wrapped(
            request_id,
            LoadBalancerMethod::CheckState,
            request,
            uri,
            LoadBalancerRequestState::Unknown,
        )
        .await
    }

    async fn cancel(&self, request_id: &LoadBalancerRequestId) -> LoadBalancerUpdate {
        let uri = self.operation_uri(request_id);
        let request = self.with_query_params(self.client.delete(&uri));

        self.send_wrapped(
            request_id,
            LoadBalancerMethod::Cancel,
            request,
            uri,
            LoadBalancerRequestState::Unknown,
        )
        .await
    }

    async fn delete(
        &self,
        request_id: &LoadBalancerRequestId,
        workload_id: &WorkloadId,
        groups: &HashSet<String>,
        service_base_path: &str,
    ) -> LoadBalancerUpdate {
        let envelope = LoadBalancerRequest {
            load_balancer_request_id: request_id.to_string(),
            load_balancer_service: ServiceDescriptor {
                service_id: workload_id.get().to_string(),
                owners: Vec::new(),
                service_base_path: service_base_path.to_string(),
                additional_routes: Vec::new(),
                load_balancer_groups: groups.clone(),
                options: None,
                template_name: None,
                domains: HashSet::new(),
                pre_resolve_upstream_dns: false,
            },
            add_upstreams: Vec::new(),
            remove_upstreams: Vec::new(),
            replace_upstreams: Vec::new(),
            action: LoadBalancerAction::Delete,
        };

        self.send_envelope(request_id, LoadBalancerMethod::Delete, envelope)
            .await
    }

    async fn service_state(&self, workload_id: &WorkloadId) -> CheckedUpstreamsUpdate {
        let uri = self.state_uri(workload_id);
        let request = self.with_query_params(self.client.get(&uri));

        let service_state = match request.send().await {
            Ok(response) if response.status().is_success() => {
                response.json::<LoadBalancerServiceState>().await.ok()
            }
            Ok(response) => {
                debug!(
                    workload_id = %workload_id,
                    status = response.status().as_u16(),
                    "Load balancer service state query failed"
                );
                None
            }
            Err(err) => {
                debug!(
                    workload_id = %workload_id,
                    "Load balancer service state query errored: {err}"
                );
                None
            }
        };

        CheckedUpstreamsUpdate {
            workload_id: workload_id.clone(),
            service_state,
        }
    }
}
