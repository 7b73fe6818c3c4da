// swarmnet: onion-routed requests to snode swarms
//
// Everything is built and wired in `SwarmNetwork::new`; there is no global
// state. Request layering, outermost first:
//
//   swarm calls:  batch -> retry -> swarm -> snode -> onion rpc
//   server calls: retry -> onion server client

pub mod api;
pub mod clock;
pub mod config;
pub mod config_sync;
pub mod crypto;
pub mod onion;
pub mod snode;
pub mod store;

use serde_json::Value;
use std::path::Path as FsPath;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use api::{
    ApiError, ApiExecutor, BatchExecutor, ExecutorContext, OnionServerClient, RetryExecutor,
    ServerRequest, ServerResponse, SnodeApiExecutor, SnodeApiRequest, SnodeBatcher, SnodeRequest,
    SnodeRpc, SwarmApiExecutor, SwarmRequest,
};
use clock::{ClockSync, SnodeClock};
use crypto::XChaChaLayerCipher;
use onion::{HttpClient, HttpOnionTransport, OnionTransport, Path, PathError, PathManager, ReqwestHttpClient};
use snode::{DirectoryError, Snode, SnodeDirectory, SwarmDirectory};
use store::snode_store::Snapshot;

pub use api::OnionSnodeRpc;
pub use config::{ConfigError, NetworkConfig, NetworkEnvironment};
pub use config_sync::{ConfigSync, ConfigStore, MutableConfig};
pub use crypto::SwarmAuth;
pub use store::{MemoryStorage, SledStorage, SnodeStore, StorageBackend};

/// On-disk layout version of the persistent store
const STORAGE_SCHEMA_VERSION: u32 = 1;

/// Pending change notifications for a background config sync
const CONFIG_CHANGE_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum SwarmNetworkError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("HTTP client setup failed: {0}")]
    Http(String),
}

pub struct SwarmNetwork {
    config: NetworkConfig,
    store: Arc<SnodeStore>,
    pool: Arc<SnodeDirectory>,
    paths: Arc<PathManager>,
    swarms: Arc<SwarmDirectory>,
    clock: Arc<SnodeClock>,
    snode_api: Arc<dyn ApiExecutor<SnodeApiRequest, Value>>,
    swarm_api: Arc<dyn ApiExecutor<SwarmRequest, Value>>,
    server_api: Arc<dyn ApiExecutor<ServerRequest, ServerResponse>>,
}

impl SwarmNetwork {
    /// Network over real HTTP clients. Must be called inside a tokio runtime.
    pub fn new(config: NetworkConfig, backend: Arc<dyn StorageBackend>) -> Result<Self, SwarmNetworkError> {
        let timeout = config.http_timeout();
        let seed_http =
            ReqwestHttpClient::new(timeout).map_err(|e| SwarmNetworkError::Http(e.to_string()))?;
        let onion_http = ReqwestHttpClient::for_snodes(timeout)
            .map_err(|e| SwarmNetworkError::Http(e.to_string()))?;
        Self::with_http(config, backend, Arc::new(seed_http), Arc::new(onion_http))
    }

    /// Network persisted in a sled database under `storage_path`
    pub fn open(config: NetworkConfig, storage_path: &FsPath) -> Result<Self, SwarmNetworkError> {
        ensure_storage_layout(storage_path)?;
        let db_path = storage_path.join("snodes");
        let backend = SledStorage::new(&db_path.to_string_lossy()).map_err(SwarmNetworkError::Storage)?;
        Self::new(config, Arc::new(backend))
    }

    /// Wire every component over the given HTTP seams
    pub fn with_http(
        config: NetworkConfig,
        backend: Arc<dyn StorageBackend>,
        seed_http: Arc<dyn HttpClient>,
        onion_http: Arc<dyn HttpClient>,
    ) -> Result<Self, SwarmNetworkError> {
        config.validate()?;

        let store = Arc::new(SnodeStore::new(backend));
        let pool = Arc::new(SnodeDirectory::new(
            store.clone(),
            seed_http,
            config.environment.seed_urls(),
            config.min_pool_size,
        ));
        let paths = Arc::new(PathManager::new(pool.clone(), config.path_size, config.guard_count));
        let transport: Arc<dyn OnionTransport> =
            Arc::new(HttpOnionTransport::new(onion_http, Arc::new(XChaChaLayerCipher)));

        let rpc: Arc<dyn SnodeRpc> = Arc::new(OnionSnodeRpc::new(paths.clone(), transport.clone()));
        let clock = Arc::new(
            SnodeClock::new(pool.clone(), rpc.clone()).with_min_interval(config.clock_resync_interval()),
        );
        let snode_api: Arc<dyn ApiExecutor<SnodeApiRequest, Value>> = Arc::new(
            SnodeApiExecutor::new(rpc, clock.clone()).with_path_manager(paths.clone()),
        );
        let retrying_snode_api: Arc<dyn ApiExecutor<SnodeApiRequest, Value>> =
            Arc::new(RetryExecutor::new(snode_api.clone(), config.retry));

        let swarms = Arc::new(SwarmDirectory::new(
            store.clone(),
            pool.clone(),
            retrying_snode_api.clone(),
            config.min_swarm_size,
        ));
        let swarm_executor: Arc<dyn ApiExecutor<SwarmRequest, Value>> =
            Arc::new(SwarmApiExecutor::new(snode_api, swarms.clone()));
        let retrying_swarm: Arc<dyn ApiExecutor<SwarmRequest, Value>> =
            Arc::new(RetryExecutor::new(swarm_executor, config.retry));
        let swarm_api: Arc<dyn ApiExecutor<SwarmRequest, Value>> = Arc::new(BatchExecutor::new(
            SnodeBatcher,
            retrying_swarm,
            config.batch_window(),
        ));

        let server_client: Arc<dyn ApiExecutor<ServerRequest, ServerResponse>> =
            Arc::new(OnionServerClient::new(paths.clone(), transport));
        let server_api: Arc<dyn ApiExecutor<ServerRequest, ServerResponse>> =
            Arc::new(RetryExecutor::new(server_client, config.retry));

        tracing::info!(
            "Swarm network ready ({} seeds, {} hop paths)",
            config.environment.seed_urls().len(),
            config.path_size
        );

        Ok(Self {
            config,
            store,
            pool,
            paths,
            swarms,
            clock,
            snode_api: retrying_snode_api,
            swarm_api,
            server_api,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SnodeStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<SnodeDirectory> {
        &self.pool
    }

    pub fn paths(&self) -> &Arc<PathManager> {
        &self.paths
    }

    pub fn swarms(&self) -> &Arc<SwarmDirectory> {
        &self.swarms
    }

    pub fn clock(&self) -> &Arc<SnodeClock> {
        &self.clock
    }

    /// Batched, retried swarm executor for callers composing their own requests
    pub fn swarm_executor(&self) -> Arc<dyn ApiExecutor<SwarmRequest, Value>> {
        self.swarm_api.clone()
    }

    pub async fn refresh_pool(&self) -> Result<Snapshot, DirectoryError> {
        self.pool.refresh().await
    }

    pub async fn build_path(&self) -> Result<Path, PathError> {
        self.paths.get_path(None).await
    }

    pub async fn get_swarm(&self, account_id: &str) -> Result<Snapshot, DirectoryError> {
        self.swarms.get_swarm(account_id).await
    }

    pub async fn send_to_swarm(&self, account_id: &str, request: SnodeRequest) -> Result<Value, ApiError> {
        self.swarm_api
            .send(&mut ExecutorContext::new(), SwarmRequest::new(account_id, request))
            .await
    }

    pub async fn send_to_snode(&self, snode: Snode, request: SnodeRequest) -> Result<Value, ApiError> {
        self.snode_api
            .send(&mut ExecutorContext::new(), SnodeApiRequest { snode, request })
            .await
    }

    pub async fn send_to_server(&self, request: ServerRequest) -> Result<ServerResponse, ApiError> {
        self.server_api.send(&mut ExecutorContext::new(), request).await
    }

    pub async fn resync_clock(&self) -> bool {
        self.clock.resync().await
    }

    /// Network time in ms, system time until the first resync
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Config sync for `auth`'s own swarm, sharing this network's executors
    pub fn config_sync(&self, auth: SwarmAuth, configs: Arc<dyn ConfigStore>) -> ConfigSync {
        ConfigSync::new(
            auth,
            configs,
            self.swarms.clone(),
            self.swarm_api.clone(),
            self.clock.clone(),
        )
    }

    /// Run config sync in the background. Every message on the returned
    /// sender schedules a push round; dropping it stops the task.
    pub fn spawn_config_sync(
        &self,
        auth: SwarmAuth,
        configs: Arc<dyn ConfigStore>,
    ) -> (mpsc::Sender<()>, JoinHandle<()>) {
        let (changes, receiver) = mpsc::channel(CONFIG_CHANGE_BUFFER);
        let sync = Arc::new(self.config_sync(auth, configs));
        (changes, tokio::spawn(sync.run(receiver)))
    }
}

fn ensure_storage_layout(base: &FsPath) -> Result<(), SwarmNetworkError> {
    let storage = |e: std::io::Error| SwarmNetworkError::Storage(e.to_string());
    std::fs::create_dir_all(base).map_err(storage)?;

    let version_file = base.join("SCHEMA_VERSION");
    let current = if version_file.exists() {
        std::fs::read_to_string(&version_file)
            .map_err(storage)?
            .trim()
            .parse::<u32>()
            .map_err(|e| SwarmNetworkError::Storage(format!("bad schema version: {}", e)))?
    } else {
        0
    };

    if current > STORAGE_SCHEMA_VERSION {
        return Err(SwarmNetworkError::Storage(format!(
            "store schema {} is newer than supported {}",
            current, STORAGE_SCHEMA_VERSION
        )));
    }
    if current != STORAGE_SCHEMA_VERSION {
        std::fs::write(&version_file, STORAGE_SCHEMA_VERSION.to_string()).map_err(storage)?;
    }
    Ok(())
}
