//! Connection lifecycle.
//!
//! An [`EngineSession`] exists only while connected. Creating one performs
//! the handshake and the initial load; dropping or disconnecting it stops
//! every task before the store is cleared.

use parking_lot::RwLock;
use std::sync::Arc;
use sushi_console_types::{EngineInfo, PlayingMode, ProcessorId};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::loader::Loader;
use crate::mutations::TopologyMutations;
use crate::optimistic::{WriteCoordinator, WriteSequencer};
use crate::poll::{PollLoop, TrackedValues};
use crate::reconciler::Reconciler;
use crate::remote::{with_deadline, SharedRemote};
use crate::state::{QueryResult, ReconcilerHandle, SyncInput, SyncNotice};
use crate::store::{
    ParameterAddress, PropertyAddress, SharedStore, StoreReader, TopologyStore, ValueKey,
};
use crate::subscriptions::Subscriptions;

/// Capacity of the notice channel. Slow receivers skip old notices.
const NOTICE_CAPACITY: usize = 256;

/// A live connection to one engine.
pub struct EngineSession {
    remote: SharedRemote,
    config: Config,
    store: StoreReader,
    inbox: ReconcilerHandle,
    notices: broadcast::Sender<SyncNotice>,
    loader: Loader,
    writes: WriteCoordinator,
    mutations: TopologyMutations,
    tracked: TrackedValues,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    reconciler: Option<JoinHandle<()>>,
}

impl EngineSession {
    /// Handshake with the engine, load the topology and start the
    /// subscriptions and the poll loop.
    ///
    /// Must be called from within a tokio runtime. On failure nothing is
    /// left running and no state is kept.
    pub async fn connect(remote: SharedRemote, config: Config) -> SyncResult<Self> {
        let deadline = config.sync.request_timeout();
        info!("Connecting to engine...");
        let engine_info: EngineInfo = with_deadline(deadline, remote.get_engine_info())
            .await
            .map_err(|e| {
                error!("Engine handshake failed: {}", e);
                SyncError::Connection(e)
            })?;

        let runtime = Handle::current();
        let token = CancellationToken::new();
        let shared: SharedStore = Arc::new(RwLock::new(TopologyStore::new()));
        let store = StoreReader::new(shared.clone());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = ReconcilerHandle::new(tx);
        let sequencer = WriteSequencer::default();

        let loader = Loader::new(
            remote.clone(),
            inbox.clone(),
            sequencer.clone(),
            deadline,
            token.clone(),
            runtime.clone(),
        );
        let reconciler = Reconciler::new(shared, &config.sync, notices.clone());
        let reconciler = runtime.spawn(reconciler.run(rx, loader.clone()));

        inbox.send(SyncInput::Connected(engine_info));
        if let Err(e) = loader.reload().await {
            error!("Initial topology load failed: {}", e);
            token.cancel();
            inbox.send(SyncInput::Disconnected);
            if let Err(join) = reconciler.await {
                warn!("Reconciler task ended abnormally: {}", join);
            }
            return Err(SyncError::Connection(e));
        }
        if let Err(e) = loader.load_playing_mode().await {
            debug!("Playing mode unavailable: {}", e);
        }

        let tracked = TrackedValues::default();

        let mut tasks = Subscriptions {
            remote: remote.clone(),
            inbox: inbox.clone(),
            policy: config.reconnect.clone(),
            deadline,
            token: token.clone(),
        }
        .spawn_all(&runtime);
        tasks.push(
            runtime.spawn(
                PollLoop {
                    remote: remote.clone(),
                    inbox: inbox.clone(),
                    tracked: tracked.clone(),
                    sequencer: sequencer.clone(),
                    interval: config.sync.poll_interval(),
                    deadline,
                    token: token.clone(),
                }
                .run(),
            ),
        );

        let writes = WriteCoordinator::new(
            remote.clone(),
            inbox.clone(),
            store.clone(),
            sequencer,
            deadline,
            token.clone(),
            runtime,
        );
        let mutations =
            TopologyMutations::new(remote.clone(), inbox.clone(), store.clone(), deadline);

        inbox.flush().await;
        info!("Connected, {} tracks loaded", store.read().tracks().len());

        Ok(Self {
            remote,
            config,
            store,
            inbox,
            notices,
            loader,
            writes,
            mutations,
            tracked,
            token,
            tasks,
            reconciler: Some(reconciler),
        })
    }

    /// Read access to the mirrored topology.
    pub fn store(&self) -> &StoreReader {
        &self.store
    }

    /// Receive change notices, rejected writes and lost capabilities.
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub fn writes(&self) -> &WriteCoordinator {
        &self.writes
    }

    pub fn mutations(&self) -> &TopologyMutations {
        &self.mutations
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        !self.token.is_cancelled() && self.store.read().is_connected()
    }

    /// Wait until every input queued so far has reached the store.
    pub async fn flush(&self) {
        self.inbox.flush().await
    }

    /// Reload the whole topology. On failure the previous state is kept.
    pub async fn refresh(&self) -> SyncResult<()> {
        self.ensure_connected()?;
        self.loader
            .reload()
            .await
            .map_err(|e| SyncError::transient("refresh topology", e))
    }

    /// Load parameters and properties of a processor.
    pub async fn load_processor(&self, processor_id: ProcessorId) -> SyncResult<()> {
        self.ensure_connected()?;
        if self.store.read().processor(processor_id).is_none() {
            return Err(SyncError::MalformedUpdate(format!(
                "processor {}",
                processor_id
            )));
        }
        self.loader
            .load_processor(processor_id)
            .await
            .map_err(|e| SyncError::transient(format!("load processor {}", processor_id), e))
    }

    /// Poll a parameter while it is on screen. Calls nest; each
    /// `track_parameter` needs a matching `untrack_parameter`.
    pub fn track_parameter(&self, address: ParameterAddress) {
        self.tracked.track(ValueKey::Parameter(address));
    }

    pub fn untrack_parameter(&self, address: ParameterAddress) {
        self.tracked.untrack(&ValueKey::Parameter(address));
    }

    pub fn track_property(&self, address: PropertyAddress) {
        self.tracked.track(ValueKey::Property(address));
    }

    pub fn untrack_property(&self, address: PropertyAddress) {
        self.tracked.untrack(&ValueKey::Property(address));
    }

    pub async fn play(&self) -> SyncResult<()> {
        self.set_playing_mode(PlayingMode::Playing).await
    }

    pub async fn stop(&self) -> SyncResult<()> {
        self.set_playing_mode(PlayingMode::Stopped).await
    }

    pub async fn set_playing_mode(&self, mode: PlayingMode) -> SyncResult<()> {
        self.ensure_connected()?;
        let deadline = self.config.sync.request_timeout();
        match with_deadline(deadline, self.remote.set_playing_mode(mode)).await {
            Ok(()) => {
                info!("Transport set to {:?}", mode);
                self.inbox
                    .send(SyncInput::Query(QueryResult::PlayingMode(mode)));
                Ok(())
            }
            Err(e) => {
                let err = SyncError::rejected(format!("set playing mode {:?}", mode), e);
                warn!("{}", err);
                Err(err)
            }
        }
    }

    /// Stop subscriptions and polling, then clear the store.
    pub async fn disconnect(mut self) {
        info!("Disconnecting from engine");
        self.token.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
        self.inbox.send(SyncInput::Disconnected);
        if let Some(reconciler) = self.reconciler.take() {
            if let Err(e) = reconciler.await {
                warn!("Reconciler task ended abnormally: {}", e);
            }
        }
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if !self.token.is_cancelled() {
            debug!("Session dropped without disconnect");
            self.token.cancel();
        }
        // Already stopped when `disconnect` ran; then this is a no-op
        self.inbox.send(SyncInput::Disconnected);
    }
}
