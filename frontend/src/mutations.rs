//! Topology mutations: create/delete tracks and processors, move processors.
//!
//! A successful reply does not touch the store; the matching notification
//! does. The one exception is a move, which is applied locally first and
//! undone if the engine refuses it.

use std::sync::Arc;
use std::time::Duration;
use sushi_console_types::{
    ChannelConfig, CreateProcessorRequest, CreateTrackRequest, DeleteProcessorRequest, Insertion,
    MoveProcessorRequest, TrackId,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{RemoteResult, SyncError, SyncResult};
use crate::remote::{with_deadline, SharedRemote};
use crate::state::{ReconcilerHandle, SyncInput};
use crate::store::StoreReader;

/// Serialized access to the engine's topology mutations.
#[derive(Clone)]
pub struct TopologyMutations {
    remote: SharedRemote,
    inbox: ReconcilerHandle,
    store: StoreReader,
    deadline: Option<Duration>,
    /// At most one mutation in flight per session
    serial: Arc<Mutex<()>>,
}

impl TopologyMutations {
    pub(crate) fn new(
        remote: SharedRemote,
        inbox: ReconcilerHandle,
        store: StoreReader,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            remote,
            inbox,
            store,
            deadline,
            serial: Arc::new(Mutex::new(())),
        }
    }

    pub async fn create_track(&self, request: CreateTrackRequest) -> SyncResult<()> {
        let context = format!("create track \"{}\"", request.name);
        self.ensure_connected()?;
        require_name(&context, &request.name)?;
        if let ChannelConfig::Multibus { buses } = request.config {
            if buses == 0 {
                return Err(SyncError::rejected(context, "a multibus track needs at least one bus"));
            }
        }

        let _serial = self.serial.lock().await;
        let name = request.name.as_str();
        let result = match request.config {
            ChannelConfig::Mono | ChannelConfig::Stereo => {
                let channels = request.config.channels().unwrap_or(2);
                with_deadline(self.deadline, self.remote.create_track(name, channels)).await
            }
            ChannelConfig::Multibus { buses } => {
                with_deadline(self.deadline, self.remote.create_multibus_track(name, buses)).await
            }
            ChannelConfig::Pre => {
                with_deadline(self.deadline, self.remote.create_pre_track(name)).await
            }
            ChannelConfig::Post => {
                with_deadline(self.deadline, self.remote.create_post_track(name)).await
            }
        };
        finish(context, result)
    }

    pub async fn delete_track(&self, track_id: TrackId) -> SyncResult<()> {
        self.ensure_connected()?;
        let _serial = self.serial.lock().await;
        let result = with_deadline(self.deadline, self.remote.delete_track(track_id)).await;
        finish(format!("delete track {}", track_id), result)
    }

    pub async fn create_processor(&self, request: CreateProcessorRequest) -> SyncResult<()> {
        let context = format!(
            "create processor \"{}\" on track {}",
            request.name, request.track_id
        );
        self.ensure_connected()?;
        require_name(&context, &request.name)?;
        if request.uid.trim().is_empty() {
            return Err(SyncError::rejected(context, "plugin uid must not be empty"));
        }

        let _serial = self.serial.lock().await;
        let result =
            with_deadline(self.deadline, self.remote.create_processor_on_track(&request)).await;
        finish(context, result)
    }

    pub async fn delete_processor(&self, request: DeleteProcessorRequest) -> SyncResult<()> {
        self.ensure_connected()?;
        let _serial = self.serial.lock().await;
        let result =
            with_deadline(self.deadline, self.remote.delete_processor_from_track(&request)).await;
        finish(
            format!(
                "delete processor {} from track {}",
                request.processor_id, request.track_id
            ),
            result,
        )
    }

    /// Move a processor. The store shows the new position immediately; a
    /// refused move puts it back where it was.
    pub async fn move_processor(&self, request: MoveProcessorRequest) -> SyncResult<()> {
        let context = format!(
            "move processor {} from track {} to track {}",
            request.processor_id, request.source_track_id, request.dest_track_id
        );
        self.ensure_connected()?;
        {
            let store = self.store.read();
            let on_source = store
                .track(request.source_track_id)
                .is_some_and(|t| t.processor(request.processor_id).is_some());
            if !on_source {
                return Err(SyncError::rejected(
                    context,
                    "processor is not on the source track",
                ));
            }
            if store.track(request.dest_track_id).is_none() {
                return Err(SyncError::rejected(context, "unknown destination track"));
            }
        }
        if request.insertion == Insertion::BeforeProcessor(request.processor_id) {
            return Err(SyncError::rejected(
                context,
                "a processor cannot be placed before itself",
            ));
        }

        let _serial = self.serial.lock().await;
        self.inbox.send(SyncInput::LocalMove(request));
        match with_deadline(self.deadline, self.remote.move_processor_on_track(&request)).await {
            Ok(()) => {
                info!("{}", context);
                self.inbox
                    .send(SyncInput::MoveSettled(request.processor_id));
                Ok(())
            }
            Err(error) => {
                self.inbox.send(SyncInput::MoveFailed {
                    processor_id: request.processor_id,
                    error: error.clone(),
                });
                let err = SyncError::rejected(context, error);
                warn!("{}", err);
                Err(err)
            }
        }
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.store.read().is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }
}

fn finish(context: String, result: RemoteResult<()>) -> SyncResult<()> {
    match result {
        Ok(()) => {
            info!("{}", context);
            Ok(())
        }
        Err(error) => {
            let err = SyncError::rejected(context, error);
            warn!("{}", err);
            Err(err)
        }
    }
}

fn require_name(context: &str, name: &str) -> SyncResult<()> {
    if name.trim().is_empty() {
        return Err(SyncError::rejected(context, "name must not be empty"));
    }
    Ok(())
}
