use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::ServerConfig;
use crate::registry::WorkerRegistry;
use crate::scheduler::{Dispatcher, JobStore, WorkerSelector};
use crate::store::SqliteStore;
use crate::worker::{HealthProber, HttpWorkerRpc, WorkerRpc};

/// Main node that wires the store, prober, dispatcher and API together
pub struct Node {
    pub config: ServerConfig,
    pub store: SqliteStore,
    pub rpc: Arc<dyn WorkerRpc>,
    pub dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl Node {
    /// Open the store and build every component. Nothing is spawned yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or bootstrapped.
    pub async fn new(config: ServerConfig, shutdown: CancellationToken) -> crate::Result<Self> {
        let store = SqliteStore::open(&config.store).await?;
        let rpc: Arc<dyn WorkerRpc> =
            Arc::new(HttpWorkerRpc::new(config.rpc.clone(), shutdown.clone()));

        let registry: Arc<dyn WorkerRegistry> = Arc::new(store.clone());
        let jobs: Arc<dyn JobStore> = Arc::new(store.clone());
        let selector = WorkerSelector::new(Arc::clone(&registry), config.selection_check_timeout());
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            jobs,
            Arc::clone(&rpc),
            selector,
            config.default_worker_class,
        ));

        Ok(Self {
            config,
            store,
            rpc,
            dispatcher,
            shutdown,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::new(self.store.clone()),
            jobs: Arc::new(self.store.clone()),
        }
    }

    /// Run the node until the shutdown token fires.
    ///
    /// 1. Spawns the health prober (returns at once when probing is disabled)
    /// 2. Serves the HTTP API with graceful shutdown (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if the API listener cannot bind or the server fails.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let prober = HealthProber::new(
            Arc::new(self.store.clone()),
            Arc::clone(&self.rpc),
            self.config.probe.clone(),
        );
        let prober_shutdown = self.shutdown.clone();
        let prober_task = tokio::spawn(async move {
            prober.run(prober_shutdown).await;
        });

        let state = self.api_state();
        let served = api::serve(self.config.listen_addr, state, self.shutdown.clone()).await;

        // Stop the prober if the server exited on its own
        self.shutdown.cancel();
        if let Err(e) = prober_task.await {
            tracing::error!(error = %e, "Health prober task failed");
        }
        self.store.pool().close().await;

        served?;
        tracing::info!("Node stopped");
        Ok(())
    }
}
