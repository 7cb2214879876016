use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    signal,
    sync::watch,
};
use tracing::info;

use crate::{
    abort::SystemAbort,
    checker::NewTaskChecker,
    config::ServerConfig,
    health::HttpProber,
    load_balancer::HttpLoadBalancerClient,
    notifier::LogNotifier,
    state_store::StateStore,
};

#[derive(Clone)]
#[allow(dead_code)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state_store: Arc<StateStore>,
    pub abort: Arc<SystemAbort>,
    pub new_task_checker: Arc<NewTaskChecker>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let state_store = Arc::new(StateStore::new());
        let abort = Arc::new(SystemAbort::new(shutdown_tx.clone()));

        let lb_client = Arc::new(
            HttpLoadBalancerClient::new(config.load_balancer.clone())
                .context("error initializing load balancer client")?,
        );
        let healthchecker = Arc::new(
            HttpProber::new(
                state_store.clone(),
                Duration::from_secs(config.healthcheck_timeout_secs),
            )
            .context("error initializing healthcheck prober")?,
        );

        let new_task_checker = Arc::new(NewTaskChecker::new(
            config.new_task_checker.clone(),
            state_store.clone(),
            lb_client,
            healthchecker,
            Arc::new(LogNotifier),
            abort.clone(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state_store,
            abort,
            new_task_checker,
        })
    }

    /// Runs until a shutdown signal arrives or the checker aborts the
    /// process. Returns an error in the abort case so the binary can exit
    /// non-zero.
    pub async fn start(&mut self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        shutdown_rx.changed().await.ok();

        self.new_task_checker.shutdown();
        if self.abort.is_aborted() {
            anyhow::bail!("service aborted, task coverage can no longer be guaranteed");
        }
        info!("shutting down");
        Ok(())
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down gracefully");
}
