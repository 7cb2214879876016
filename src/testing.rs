use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    abort::SystemAbort,
    checker::NewTaskChecker,
    config::NewTaskCheckerConfig,
    data_model::{
        Deploy,
        LoadBalancerMethod,
        LoadBalancerRequestId,
        LoadBalancerRequestState,
        LoadBalancerUpdate,
        Task,
        TaskId,
        Workload,
        WorkloadId,
    },
    health::Healthchecker,
    load_balancer::{CheckedUpstreamsUpdate, LoadBalancerClient},
    notifier::Notifier,
    state_store::StateStore,
    utils::get_epoch_time_in_ms,
};

/// Wires a checker to in-memory collaborators so tests can drive the state
/// machine with paused time and inspect every side effect.
pub struct TestService {
    pub state_store: Arc<StateStore>,
    pub checker: Arc<NewTaskChecker>,
    pub lb: Arc<MockLoadBalancerClient>,
    pub prober: Arc<RecordingHealthchecker>,
    pub notifier: Arc<RecordingNotifier>,
    pub abort: Arc<SystemAbort>,
    pub shutdown_rx: watch::Receiver<()>,
}

impl TestService {
    pub fn new(config: NewTaskCheckerConfig) -> Self {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let state_store = Arc::new(StateStore::new());
        let abort = Arc::new(SystemAbort::new(shutdown_tx));
        let lb = Arc::new(MockLoadBalancerClient::default());
        let prober = Arc::new(RecordingHealthchecker::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let checker = Arc::new(NewTaskChecker::new(
            config,
            state_store.clone(),
            lb.clone(),
            prober.clone(),
            notifier.clone(),
            abort.clone(),
        ));

        Self {
            state_store,
            checker,
            lb,
            prober,
            notifier,
            abort,
            shutdown_rx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LbCall {
    Enqueue(LoadBalancerRequestId),
    GetState(LoadBalancerRequestId),
    Cancel(LoadBalancerRequestId),
    Delete(LoadBalancerRequestId),
    ServiceState(WorkloadId),
}

/// Scripted gateway: each operation pops its next programmed state, or
/// answers Waiting when nothing is queued. Every call is recorded.
#[derive(Default)]
pub struct MockLoadBalancerClient {
    enqueue_states: Mutex<VecDeque<LoadBalancerRequestState>>,
    get_state_states: Mutex<VecDeque<LoadBalancerRequestState>>,
    enqueue_gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<LbCall>>,
}

impl MockLoadBalancerClient {
    pub async fn program_enqueue(&self, state: LoadBalancerRequestState) {
        self.enqueue_states.lock().await.push_back(state);
    }

    pub async fn program_get_state(&self, state: LoadBalancerRequestState) {
        self.get_state_states.lock().await.push_back(state);
    }

    /// Makes the next enqueue block until the returned handle is notified,
    /// holding the calling check in its running phase.
    pub async fn gate_next_enqueue(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.enqueue_gate.lock().await = Some(gate.clone());
        gate
    }

    pub async fn recorded_calls(&self) -> Vec<LbCall> {
        self.calls.lock().await.clone()
    }

    fn update(
        request_id: &LoadBalancerRequestId,
        state: LoadBalancerRequestState,
        method: LoadBalancerMethod,
    ) -> LoadBalancerUpdate {
        LoadBalancerUpdate {
            state,
            request_id: request_id.clone(),
            message: None,
            timestamp_ms: get_epoch_time_in_ms(),
            method,
            uri: None,
        }
    }
}

#[async_trait]
impl LoadBalancerClient for MockLoadBalancerClient {
    async fn enqueue(
        &self,
        request_id: &LoadBalancerRequestId,
        _workload: &Workload,
        _deploy: &Deploy,
        _add: &[Task],
        _remove: &[Task],
    ) -> LoadBalancerUpdate {
        let gate = self.enqueue_gate.lock().await.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.calls
            .lock()
            .await
            .push(LbCall::Enqueue(request_id.clone()));
        let state = self
            .enqueue_states
            .lock()
            .await
            .pop_front()
            .unwrap_or(LoadBalancerRequestState::Waiting);
        Self::update(request_id, state, LoadBalancerMethod::Enqueue)
    }

    async fn get_state(&self, request_id: &LoadBalancerRequestId) -> LoadBalancerUpdate {
        self.calls
            .lock()
            .await
            .push(LbCall::GetState(request_id.clone()));
        let state = self
            .get_state_states
            .lock()
            .await
            .pop_front()
            .unwrap_or(LoadBalancerRequestState::Waiting);
        Self::update(request_id, state, LoadBalancerMethod::CheckState)
    }

    async fn cancel(&self, request_id: &LoadBalancerRequestId) -> LoadBalancerUpdate {
        self.calls
            .lock()
            .await
            .push(LbCall::Cancel(request_id.clone()));
        Self::update(
            request_id,
            LoadBalancerRequestState::Canceling,
            LoadBalancerMethod::Cancel,
        )
    }

    async fn delete(
        &self,
        request_id: &LoadBalancerRequestId,
        _workload_id: &WorkloadId,
        _groups: &HashSet<String>,
        _service_base_path: &str,
    ) -> LoadBalancerUpdate {
        self.calls
            .lock()
            .await
            .push(LbCall::Delete(request_id.clone()));
        Self::update(
            request_id,
            LoadBalancerRequestState::Success,
            LoadBalancerMethod::Delete,
        )
    }

    async fn service_state(&self, workload_id: &WorkloadId) -> CheckedUpstreamsUpdate {
        self.calls
            .lock()
            .await
            .push(LbCall::ServiceState(workload_id.clone()));
        CheckedUpstreamsUpdate {
            workload_id: workload_id.clone(),
            service_state: None,
        }
    }
}

/// Records which tasks were asked for a probe without performing any IO.
/// Tests write healthcheck results to the store directly.
#[derive(Default)]
pub struct RecordingHealthchecker {
    probed: Mutex<Vec<TaskId>>,
}

impl RecordingHealthchecker {
    pub async fn probed_tasks(&self) -> Vec<TaskId> {
        self.probed.lock().await.clone()
    }
}

#[async_trait]
impl Healthchecker for RecordingHealthchecker {
    async fn enqueue_probe(&self, task: &Task) {
        self.probed.lock().await.push(task.id.clone());
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<String>>,
    failing_workloads: Mutex<Vec<WorkloadId>>,
}

impl RecordingNotifier {
    pub async fn notifications(&self) -> Vec<String> {
        self.notifications.lock().await.clone()
    }

    pub async fn num_failing_notifications(&self, workload_id: &WorkloadId) -> usize {
        self.failing_workloads
            .lock()
            .await
            .iter()
            .filter(|id| *id == workload_id)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, _context: HashMap<String, String>) {
        self.notifications.lock().await.push(message.to_string());
    }

    async fn send_replacement_tasks_failing(&self, workload: &Workload) {
        self.failing_workloads.lock().await.push(workload.id.clone());
    }
}
