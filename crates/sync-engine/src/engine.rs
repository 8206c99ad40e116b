//! Engine assembly and the public submission API.

use crate::handle::{EngineSink, OperationHandle};
use crate::worker;
use crate::{EngineError, EngineResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use sync_auth::{Authenticator, Session, SessionManager, SessionState};
use sync_core::{
    InstanceId, OperationDescriptor, OperationId, SyncConfig, SyncEvent, SyncEventSink,
};
use sync_durable_store::{DurableQueueStore, SqliteBackend, StorageBackend};
use sync_outbox::{QueueStatus, SyncQueue};
use sync_transport::{
    ChannelCorrelator, ChannelReply, Dispatcher, PersistentChannel, ReqwestClient, RequestResponse,
};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 256;

/// Collaborators supplied by the embedding application.
pub struct EngineDeps {
    /// `None` runs memory-only.
    pub storage: Option<Arc<dyn StorageBackend>>,
    pub http: Arc<dyn RequestResponse>,
    pub channel: Option<Arc<dyn PersistentChannel>>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Online/offline as reported by the platform.
    pub connectivity: watch::Receiver<bool>,
}

impl EngineDeps {
    /// Default collaborators for `config`: SQLite at `database_path` and a
    /// reqwest client. A store that fails to open degrades to memory-only.
    pub async fn from_config(
        config: &SyncConfig,
        authenticator: Arc<dyn Authenticator>,
        connectivity: watch::Receiver<bool>,
    ) -> EngineResult<Self> {
        let storage: Option<Arc<dyn StorageBackend>> = match &config.database_path {
            Some(path) => match SqliteBackend::open(path).await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Durable store unavailable, running memory-only"
                    );
                    None
                }
            },
            None => None,
        };
        let http = Arc::new(ReqwestClient::new(config.request_timeout())?);
        Ok(Self {
            storage,
            http,
            channel: None,
            authenticator,
            connectivity,
        })
    }

    pub fn with_channel(mut self, channel: Arc<dyn PersistentChannel>) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub instance_id: InstanceId,
    pub session: SessionState,
    pub online: bool,
    pub channel_open: bool,
    pub queue: QueueStatus,
}

/// State shared with the background tasks.
pub(crate) struct EngineInner {
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<DurableQueueStore>,
    pub(crate) queue: Arc<SyncQueue>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) session: Arc<SessionManager>,
    pub(crate) sink: Arc<EngineSink>,
    pub(crate) correlator: Arc<ChannelCorrelator>,
    pub(crate) channel: Option<Arc<dyn PersistentChannel>>,
    pub(crate) online: AtomicBool,
    pub(crate) wake: Notify,
}

impl EngineInner {
    pub(crate) fn can_dispatch(&self) -> bool {
        self.online.load(Ordering::SeqCst) && self.session.is_ready()
    }

    pub(crate) fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        info!(online, "Connectivity changed");
        self.sink.emit(SyncEvent::ConnectivityChanged { is_online: online });
        self.wake.notify_one();
    }
}

/// One running instance of the sync core.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Recover persisted work, then start the dispatch loop, the heartbeat,
    /// the orphan sweep and the connectivity watcher.
    ///
    /// Nothing is dispatched until [`SyncEngine::login`] reaches `Ready`.
    pub async fn start(config: SyncConfig, deps: EngineDeps) -> EngineResult<Self> {
        let base_url = config.service_url()?;
        let instance_id = config
            .instance_id
            .clone()
            .map(InstanceId::from_string)
            .unwrap_or_default();

        let store = Arc::new(DurableQueueStore::new(
            deps.storage,
            instance_id.clone(),
            config.orphan_after(),
        ));
        store.heartbeat().await;

        let sink = Arc::new(EngineSink::new(EVENT_CAPACITY));
        let event_sink: Arc<dyn SyncEventSink> = sink.clone();
        let queue = Arc::new(SyncQueue::new(
            store.clone(),
            event_sink.clone(),
            config.retry.clone(),
        ));

        let correlator = Arc::new(ChannelCorrelator::new());
        let mut dispatcher = Dispatcher::new(base_url, deps.http, config.gateway.clone());
        if let Some(channel) = deps.channel.clone() {
            dispatcher = dispatcher.with_channel(channel, correlator.clone());
        }

        let session = Arc::new(SessionManager::new(
            deps.authenticator,
            store.clone(),
            config.entity_tables.clone(),
            event_sink,
        ));

        let recovered = queue.recover().await;
        let online = *deps.connectivity.borrow();

        let inner = Arc::new(EngineInner {
            config,
            store,
            queue,
            dispatcher: Arc::new(dispatcher),
            session,
            sink,
            correlator,
            channel: deps.channel,
            online: AtomicBool::new(online),
            wake: Notify::new(),
        });

        let (shutdown_tx, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(worker::run_dispatch_loop(
                inner.clone(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(worker::run_heartbeat(inner.clone(), shutdown_tx.subscribe())),
            tokio::spawn(worker::run_orphan_sweep(
                inner.clone(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(worker::watch_connectivity(
                inner.clone(),
                deps.connectivity,
                shutdown_tx.subscribe(),
            )),
        ];

        info!(
            instance = %instance_id,
            recovered,
            online,
            durable = inner.store.is_durable(),
            "Sync engine started"
        );

        Ok(Self {
            inner,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.inner.store.instance_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Queue an operation; the handle completes when it resolves or fails.
    pub async fn submit(&self, descriptor: OperationDescriptor) -> EngineResult<OperationHandle> {
        if *self.shutdown_tx.borrow() {
            return Err(EngineError::ShutDown);
        }
        let id = OperationId::new();
        let handle = self.inner.sink.register(id.clone());
        if let Err(e) = self.inner.queue.enqueue_as(id.clone(), descriptor).await {
            self.inner.sink.forget(&id);
            return Err(e.into());
        }
        self.inner.wake.notify_one();
        Ok(handle)
    }

    /// Establish the session and open the queue for dispatch.
    pub async fn login(&self, user_id: &str) -> EngineResult<Session> {
        let session = self.inner.session.connect(user_id).await?;
        if session.state == SessionState::Authenticated {
            // Local state was loaded during start.
            self.inner.session.mark_ready()?;
        }
        self.inner.wake.notify_one();
        Ok(self.inner.session.snapshot())
    }

    /// Drop the session. Queued operations stay and dispatch after the next
    /// login.
    pub async fn logout(&self) -> EngineResult<()> {
        self.inner.session.logout().await?;
        Ok(())
    }

    pub fn session(&self) -> Session {
        self.inner.session.snapshot()
    }

    /// Route a reply frame from the persistent channel to its waiting
    /// dispatch. Returns false for unknown request ids.
    pub fn channel_reply(&self, reply: ChannelReply) -> bool {
        self.inner.correlator.deliver(reply)
    }

    /// The persistent channel opened or closed. Closing releases every
    /// dispatch awaiting a reply so it can be resent later.
    pub fn set_channel_open(&self, open: bool) {
        if !open {
            let released = self.inner.correlator.cancel_all();
            if released > 0 {
                info!(released, "Channel closed with replies outstanding");
            }
        }
        self.inner.wake.notify_one();
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.sink.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            instance_id: self.instance_id().clone(),
            session: self.inner.session.state(),
            online: self.inner.online.load(Ordering::SeqCst),
            channel_open: self
                .inner
                .channel
                .as_ref()
                .is_some_and(|channel| channel.is_open()),
            queue: self.inner.queue.status(),
        }
    }

    /// Stop every task. Durable records are kept and the heartbeat removed,
    /// so another instance may adopt them right away. Outstanding handles
    /// resolve to `Detached`.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let held = self.inner.queue.shutdown();
        self.inner.correlator.cancel_all();
        let detached = self.inner.sink.detach_all();
        self.inner.store.deregister().await;
        info!(
            instance = %self.instance_id(),
            held = held.len(),
            detached,
            "Sync engine stopped"
        );
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.lock().expect("lock poisoned").drain(..) {
            task.abort();
        }
    }
}
