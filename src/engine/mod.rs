//! Engine lifecycle: owns every store, brings listeners up in a fixed
//! order with rollback on partial failure, and applies config reloads as
//! single registry transactions.

pub mod body;
pub mod handler;
pub mod server;

use crate::chaos::ChaosInjector;
use crate::config::{ConfigDocument, ServerOptions};
use crate::mock::{validate_mock, Mock, MockSpec, MockType};
use crate::oauth::IssuedTokens;
use crate::registry::{ImportOutcome, MockRegistry, RegistryError};
use crate::requestlog::RequestLog;
use crate::stateful::StateStore;
use crate::template::SequenceStore;
use crate::verify::VerificationStore;
use crate::{metrics, mqtt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything protocol handlers and the admin surface share. All stores are
/// individually synchronized; no lock is held across an await.
pub struct AppState {
    pub options: ServerOptions,
    pub registry: MockRegistry,
    pub state: StateStore,
    pub request_log: RequestLog,
    pub verification: VerificationStore,
    pub chaos: ChaosInjector,
    pub sequences: SequenceStore,
    pub oauth_tokens: IssuedTokens,
    /// Empty when admin auth is disabled.
    pub admin_key: RwLock<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub in_flight: AtomicUsize,
}

impl AppState {
    fn new(options: ServerOptions) -> Self {
        let capacity = options.max_log_entries;
        Self {
            options,
            registry: MockRegistry::new(),
            state: StateStore::new(),
            request_log: RequestLog::new(capacity),
            verification: VerificationStore::new(),
            chaos: ChaosInjector::new(),
            sequences: SequenceStore::new(),
            oauth_tokens: IssuedTokens::default(),
            admin_key: RwLock::new(String::new()),
            started_at: chrono::Utc::now(),
            in_flight: AtomicUsize::new(0),
        }
    }
}

struct ListenerHandle {
    name: String,
    port: u16,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Ports surfaced on `GET /ports`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port: u16,
    pub protocol: String,
    pub description: String,
}

/// The running engine.
pub struct Engine {
    pub state: Arc<AppState>,
    handles: Mutex<Vec<ListenerHandle>>,
    /// Per-mock listeners keyed by port; merged mocks share one entry.
    grpc_listeners: Mutex<HashMap<u16, ListenerHandle>>,
    mqtt_brokers: Mutex<HashMap<u16, (Arc<mqtt::Broker>, ListenerHandle)>>,
    running: AtomicBool,
}

impl Engine {
    pub fn new(options: ServerOptions) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(AppState::new(options)),
            handles: Mutex::new(Vec::new()),
            grpc_listeners: Mutex::new(HashMap::new()),
            mqtt_brokers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Load a config document into the stores. Called before `start` and by
    /// `reload`.
    pub fn load_document(&self, doc: &ConfigDocument) -> anyhow::Result<()> {
        for resource in &doc.stateful_resources {
            self.state
                .state
                .register(resource.clone())
                .map_err(|e| anyhow::anyhow!("resource {}: {e}", resource.name))?;
        }
        for op in &doc.custom_operations {
            self.state.state.register_operation(op.clone());
        }
        if let Some(chaos) = &doc.chaos {
            self.state
                .chaos
                .set_config(chaos.clone())
                .map_err(|e| anyhow::anyhow!("chaos config: {e}"))?;
        }
        for mock in &doc.mocks {
            validate_mock(mock)?;
            self.state
                .registry
                .insert(mock.clone())
                .map_err(|e| anyhow::anyhow!("mock {}: {e}", mock.id))?;
        }
        metrics::MOCKS_REGISTERED.set(self.state.registry.len() as i64);
        Ok(())
    }

    /// Bring up all listeners: HTTP, then HTTPS, then admin, then per-mock
    /// gRPC, then per-mock MQTT. Any bind failure tears down the listeners
    /// already started, in reverse order, and returns the error.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("engine is already running");
        }

        let result = self.start_inner().await;
        if let Err(e) = &result {
            error!("startup failed, rolling back listeners: {e}");
            self.stop(Duration::from_secs(1)).await;
        }
        result
    }

    async fn start_inner(self: &Arc<Self>) -> anyhow::Result<()> {
        let options = &self.state.options;

        // Primary HTTP listener.
        let listener = bind(options.port).await?;
        self.track("http", options.port, |shutdown| {
            server::serve_plain(listener, Arc::clone(&self.state), shutdown)
        });
        info!("mock HTTP listener on :{}", options.port);

        // Optional HTTPS listener.
        if options.https_port > 0 {
            let acceptor = crate::listener::tls_acceptor(options)?;
            let listener = bind(options.https_port).await?;
            self.track("https", options.https_port, |shutdown| {
                server::serve_tls(listener, Arc::clone(&self.state), acceptor, shutdown)
            });
            info!("mock HTTPS listener on :{}", options.https_port);
        }

        // Admin API.
        let listener = bind(options.admin_port).await?;
        self.track("admin", options.admin_port, |shutdown| {
            crate::admin::serve(listener, Arc::clone(self), shutdown)
        });
        info!("admin API on :{}", options.admin_port);

        // Per-mock listeners.
        self.ensure_protocol_listeners().await?;
        Ok(())
    }

    fn track<F, Fut>(&self, name: &str, port: u16, spawn: F)
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(spawn(rx));
        self.handles.lock().push(ListenerHandle {
            name: name.to_string(),
            port,
            shutdown,
            task,
        });
    }

    /// Bind listeners for every gRPC/MQTT mock whose port is not served yet.
    /// Already-bound ports merge: their listeners consult the registry per
    /// request, so new services/topics appear without a rebind.
    pub async fn ensure_protocol_listeners(self: &Arc<Self>) -> anyhow::Result<()> {
        for mock in self.state.registry.snapshot(MockType::Grpc) {
            let MockSpec::Grpc(spec) = &mock.spec else {
                continue;
            };
            let mut listeners = self.grpc_listeners.lock();
            if listeners.contains_key(&spec.port) {
                continue;
            }
            let listener = bind_std(spec.port)?;
            let (shutdown, rx) = broadcast::channel(1);
            let task = tokio::spawn(crate::grpc::serve(
                listener,
                spec.port,
                Arc::clone(&self.state),
                rx,
            ));
            listeners.insert(
                spec.port,
                ListenerHandle {
                    name: "grpc".to_string(),
                    port: spec.port,
                    shutdown,
                    task,
                },
            );
            info!("gRPC listener on :{}", spec.port);
        }

        for mock in self.state.registry.snapshot(MockType::Mqtt) {
            let MockSpec::Mqtt(spec) = &mock.spec else {
                continue;
            };
            let mut brokers = self.mqtt_brokers.lock();
            if brokers.contains_key(&spec.port) {
                continue;
            }
            let listener = bind_std(spec.port)?;
            let broker = Arc::new(mqtt::Broker::new(spec.port, Arc::clone(&self.state)));
            let (shutdown, rx) = broadcast::channel(1);
            let task = tokio::spawn(mqtt::serve(listener, Arc::clone(&broker), rx));
            broker.start_topic_scripts();
            brokers.insert(
                spec.port,
                (
                    broker,
                    ListenerHandle {
                        name: "mqtt".to_string(),
                        port: spec.port,
                        shutdown,
                        task,
                    },
                ),
            );
            info!("MQTT broker on :{}", spec.port);
        }

        Ok(())
    }

    /// Stop per-mock listeners whose last mock is gone.
    pub async fn prune_protocol_listeners(&self) {
        let grpc_ports: std::collections::HashSet<u16> = self
            .state
            .registry
            .snapshot(MockType::Grpc)
            .iter()
            .filter_map(|m| match &m.spec {
                MockSpec::Grpc(s) => Some(s.port),
                _ => None,
            })
            .collect();
        let stale: Vec<ListenerHandle> = {
            let mut listeners = self.grpc_listeners.lock();
            let ports: Vec<u16> = listeners
                .keys()
                .filter(|p| !grpc_ports.contains(p))
                .copied()
                .collect();
            ports
                .into_iter()
                .filter_map(|p| listeners.remove(&p))
                .collect()
        };
        for handle in stale {
            stop_handle(handle, Duration::from_secs(2)).await;
        }

        let mqtt_ports: std::collections::HashSet<u16> = self
            .state
            .registry
            .snapshot(MockType::Mqtt)
            .iter()
            .filter_map(|m| match &m.spec {
                MockSpec::Mqtt(s) => Some(s.port),
                _ => None,
            })
            .collect();
        let stale: Vec<(Arc<mqtt::Broker>, ListenerHandle)> = {
            let mut brokers = self.mqtt_brokers.lock();
            let ports: Vec<u16> = brokers
                .keys()
                .filter(|p| !mqtt_ports.contains(p))
                .copied()
                .collect();
            ports
                .into_iter()
                .filter_map(|p| brokers.remove(&p))
                .collect()
        };
        for (broker, handle) in stale {
            // Broker shutdown runs outside its own locks; the topic script
            // tasks re-enter the broker to publish.
            broker.stop();
            stop_handle(handle, Duration::from_secs(2)).await;
        }
    }

    /// Signal all listeners to stop, wait for in-flight handlers to drain up
    /// to the deadline, then abort whatever is left. Close order is the
    /// reverse of bring-up.
    pub async fn stop(&self, drain: Duration) {
        self.running.store(false, Ordering::SeqCst);

        // Per-mock listeners first (reverse of start order).
        let brokers: Vec<(Arc<mqtt::Broker>, ListenerHandle)> =
            self.mqtt_brokers.lock().drain().map(|(_, v)| v).collect();
        for (broker, handle) in brokers {
            broker.stop();
            stop_handle(handle, drain).await;
        }
        let grpc: Vec<ListenerHandle> = self
            .grpc_listeners
            .lock()
            .drain()
            .map(|(_, v)| v)
            .collect();
        for handle in grpc {
            stop_handle(handle, drain).await;
        }

        let handles: Vec<ListenerHandle> = {
            let mut guard = self.handles.lock();
            guard.drain(..).rev().collect()
        };
        for handle in handles {
            stop_handle(handle, drain).await;
        }

        // Drain in-flight request handlers.
        let deadline = tokio::time::Instant::now() + drain;
        while self.state.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let leftover = self.state.in_flight.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!("{leftover} in-flight handler(s) did not drain before the deadline");
        }

        self.state.sequences.reset();
    }

    // ========================================================================
    // Mock CRUD (admin facade)
    // ========================================================================

    pub async fn add_mock(
        self: &Arc<Self>,
        mut mock: Mock,
    ) -> Result<(Arc<Mock>, Option<MergeInfo>), EngineError> {
        mock.normalize();
        validate_mock(&mock).map_err(EngineError::Validation)?;
        let merge_target = self.state.registry.merge_target(&mock);
        let stored = self.state.registry.insert(mock)?;
        if let Err(e) = self.ensure_protocol_listeners().await {
            // Bind failed: roll the registry entry back so no half-applied
            // mock remains.
            let _ = self.state.registry.remove(&stored.id);
            return Err(EngineError::Bind(e.to_string()));
        }
        metrics::MOCKS_REGISTERED.set(self.state.registry.len() as i64);
        let merged = merge_target.map(|merged_into| MergeInfo {
            merged_into,
            total: self.state.registry.port_peer_count(&stored),
        });
        Ok((stored, merged))
    }

    pub async fn update_mock(self: &Arc<Self>, mut mock: Mock) -> Result<Arc<Mock>, EngineError> {
        mock.normalize();
        validate_mock(&mock).map_err(EngineError::Validation)?;
        let stored = self.state.registry.update(mock)?;
        self.ensure_protocol_listeners()
            .await
            .map_err(|e| EngineError::Bind(e.to_string()))?;
        self.prune_protocol_listeners().await;
        Ok(stored)
    }

    pub async fn delete_mock(&self, id: &str) -> Result<Arc<Mock>, EngineError> {
        let removed = self.state.registry.remove(id)?;
        self.prune_protocol_listeners().await;
        metrics::MOCKS_REGISTERED.set(self.state.registry.len() as i64);
        Ok(removed)
    }

    /// Bulk import; all-or-nothing is per mock, merge/conflict per entry.
    pub async fn import_mocks(self: &Arc<Self>, mocks: Vec<Mock>) -> Result<ImportOutcome, EngineError> {
        let mut prepared = Vec::with_capacity(mocks.len());
        for mut mock in mocks {
            mock.normalize();
            validate_mock(&mock).map_err(EngineError::Validation)?;
            prepared.push(mock);
        }
        let outcome = self.state.registry.import(prepared);
        self.ensure_protocol_listeners()
            .await
            .map_err(|e| EngineError::Bind(e.to_string()))?;
        metrics::MOCKS_REGISTERED.set(self.state.registry.len() as i64);
        Ok(outcome)
    }

    /// Compute the diff between running and desired mocks and apply it.
    pub async fn reload(self: &Arc<Self>, doc: &ConfigDocument) -> Result<(), EngineError> {
        for mock in &doc.mocks {
            validate_mock(mock).map_err(EngineError::Validation)?;
        }

        let current = self.state.registry.all();
        let desired: HashMap<&str, &Mock> = doc.mocks.iter().map(|m| (m.id.as_str(), m)).collect();

        for mock in &current {
            if !desired.contains_key(mock.id.as_str()) {
                let _ = self.state.registry.remove(&mock.id);
            }
        }
        for mock in &doc.mocks {
            let mut mock = mock.clone();
            mock.normalize();
            if self.state.registry.get(&mock.id).is_some() {
                self.state.registry.update(mock)?;
            } else {
                self.state.registry.insert(mock)?;
            }
        }

        for resource in &doc.stateful_resources {
            if self.state.state.get(&resource.name).is_none() {
                self.state
                    .state
                    .register(resource.clone())
                    .map_err(|e| EngineError::Bind(e.to_string()))?;
            }
        }
        for op in &doc.custom_operations {
            self.state.state.register_operation(op.clone());
        }
        if let Some(chaos) = &doc.chaos {
            self.state
                .chaos
                .set_config(chaos.clone())
                .map_err(EngineError::Bind)?;
        }

        self.ensure_protocol_listeners()
            .await
            .map_err(|e| EngineError::Bind(e.to_string()))?;
        self.prune_protocol_listeners().await;
        metrics::MOCKS_REGISTERED.set(self.state.registry.len() as i64);
        Ok(())
    }

    /// Ports currently served, for `GET /ports`.
    pub fn ports(&self) -> Vec<PortInfo> {
        let mut ports = vec![PortInfo {
            port: self.state.options.port,
            protocol: "http".to_string(),
            description: "mock HTTP/WebSocket/SSE/GraphQL/SOAP listener".to_string(),
        }];
        if self.state.options.https_port > 0 {
            ports.push(PortInfo {
                port: self.state.options.https_port,
                protocol: "https".to_string(),
                description: "mock HTTPS listener".to_string(),
            });
        }
        ports.push(PortInfo {
            port: self.state.options.admin_port,
            protocol: "http".to_string(),
            description: "admin REST API".to_string(),
        });
        for port in self.grpc_listeners.lock().keys() {
            ports.push(PortInfo {
                port: *port,
                protocol: "grpc".to_string(),
                description: "per-mock gRPC listener".to_string(),
            });
        }
        for port in self.mqtt_brokers.lock().keys() {
            ports.push(PortInfo {
                port: *port,
                protocol: "mqtt".to_string(),
                description: "per-mock MQTT broker".to_string(),
            });
        }
        ports.sort_by_key(|p| p.port);
        ports
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Port-merge outcome for a newly created gRPC/MQTT mock: the mock whose
/// listener absorbed it, and how many mocks now share that port.
#[derive(Debug, Clone)]
pub struct MergeInfo {
    pub merged_into: String,
    pub total: usize,
}

/// Errors from engine-level mutations, mapped by the admin surface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(crate::mock::ValidationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("listener error: {0}")]
    Bind(String),
}

async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| anyhow::anyhow!("bind port {port}: {e}"))
}

/// Synchronous bind used under sync locks; converted to tokio inside the
/// serving task.
fn bind_std(port: u16) -> anyhow::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", port))
        .map_err(|e| anyhow::anyhow!("bind port {port}: {e}"))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| anyhow::anyhow!("port {port}: {e}"))?;
    Ok(listener)
}

async fn stop_handle(handle: ListenerHandle, drain: Duration) {
    let _ = handle.shutdown.send(());
    let mut task = handle.task;
    match tokio::time::timeout(drain, &mut task).await {
        Ok(_) => info!("{} listener on :{} stopped", handle.name, handle.port),
        Err(_) => {
            warn!(
                "{} listener on :{} did not stop in time, aborting",
                handle.name, handle.port
            );
            task.abort();
        }
    }
}
