//! Topology queries.
//!
//! Loads run as plain request/response calls and hand their results to the
//! reconciler as [`QueryResult`]s. Reloads are serialized so results reach
//! the inbox in the order the reloads were requested.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use sushi_console_types::{ParameterInfo, ProcessorId, TrackId, TrackInfo};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::convert::domain_to_normalized;
use crate::error::RemoteResult;
use crate::optimistic::WriteSequencer;
use crate::remote::{with_deadline, SharedRemote};
use crate::state::{
    ProcessorDetails, QueryResult, ReconcilerHandle, Refetch, SyncInput, TrackSnapshot,
};

#[derive(Clone)]
pub(crate) struct Loader {
    remote: SharedRemote,
    inbox: ReconcilerHandle,
    sequencer: WriteSequencer,
    deadline: Option<Duration>,
    token: CancellationToken,
    runtime: Handle,
    serial: Arc<Mutex<()>>,
}

impl Loader {
    pub(crate) fn new(
        remote: SharedRemote,
        inbox: ReconcilerHandle,
        sequencer: WriteSequencer,
        deadline: Option<Duration>,
        token: CancellationToken,
        runtime: Handle,
    ) -> Self {
        Self {
            remote,
            inbox,
            sequencer,
            deadline,
            token,
            runtime,
            serial: Arc::new(Mutex::new(())),
        }
    }

    /// Reload the full topology and queue it for the reconciler.
    pub(crate) async fn reload(&self) -> RemoteResult<()> {
        let _serial = self.serial.lock().await;
        let issued_seq = self.sequencer.current();
        let tracks = self.load_topology().await?;
        info!("Loaded {} tracks", tracks.len());
        self.inbox
            .send(SyncInput::Query(QueryResult::Topology { tracks, issued_seq }));
        Ok(())
    }

    /// Load parameters and properties of one processor.
    pub(crate) async fn load_processor(&self, processor_id: ProcessorId) -> RemoteResult<()> {
        let issued_seq = self.sequencer.current();
        let details = self.processor_details(processor_id).await?;
        debug!(
            "Loaded processor {}: {} parameters, {} properties",
            processor_id,
            details.parameters.len(),
            details.properties.len()
        );
        self.inbox.send(SyncInput::Query(QueryResult::ProcessorDetails {
            processor_id,
            details,
            issued_seq,
        }));
        Ok(())
    }

    pub(crate) async fn load_playing_mode(&self) -> RemoteResult<()> {
        let mode = with_deadline(self.deadline, self.remote.get_playing_mode()).await?;
        self.inbox
            .send(SyncInput::Query(QueryResult::PlayingMode(mode)));
        Ok(())
    }

    /// Run a follow-up query in the background. Failures are reported to
    /// the reconciler, which keeps the previous state.
    pub(crate) fn spawn_refetch(&self, refetch: Refetch) {
        let loader = self.clone();
        self.runtime.spawn(async move {
            let token = loader.token.clone();
            tokio::select! {
                _ = token.cancelled() => {}
                _ = loader.refetch(refetch) => {}
            }
        });
    }

    async fn refetch(&self, refetch: Refetch) {
        let _serial = self.serial.lock().await;
        let issued_seq = self.sequencer.current();
        let result = match refetch {
            Refetch::AllTracks => match self.load_topology().await {
                Ok(tracks) => QueryResult::Topology { tracks, issued_seq },
                Err(error) => QueryResult::Failed {
                    context: "reload tracks".to_string(),
                    error,
                },
            },
            Refetch::TrackProcessors(track_id) => {
                match with_deadline(self.deadline, self.remote.get_track_processors(track_id))
                    .await
                {
                    Ok(processors) => QueryResult::TrackProcessors {
                        track_id,
                        processors,
                    },
                    Err(error) => QueryResult::Failed {
                        context: format!("processors of track {}", track_id),
                        error,
                    },
                }
            }
        };
        self.inbox.send(SyncInput::Query(result));
    }

    /// Fetch every track with its processors and parameters. Only a failure
    /// of the track list itself is an error; nested failures leave gaps.
    pub(crate) async fn load_topology(&self) -> RemoteResult<Vec<TrackSnapshot>> {
        let tracks = with_deadline(self.deadline, self.remote.get_all_tracks()).await?;
        Ok(join_all(tracks.into_iter().map(|info| self.load_track(info))).await)
    }

    async fn load_track(&self, info: TrackInfo) -> TrackSnapshot {
        let track_id = info.id;
        let (processors, parameters) = tokio::join!(
            with_deadline(self.deadline, self.remote.get_track_processors(track_id)),
            self.track_parameters(track_id),
        );
        if let Err(e) = &processors {
            debug!("Processors of track {} unavailable: {}", track_id, e);
        }
        TrackSnapshot {
            info,
            processors: processors.ok(),
            parameters,
        }
    }

    async fn track_parameters(
        &self,
        track_id: TrackId,
    ) -> Option<Vec<(ParameterInfo, Option<f64>)>> {
        let infos = match with_deadline(self.deadline, self.remote.get_track_parameters(track_id))
            .await
        {
            Ok(infos) => infos,
            Err(e) => {
                debug!("Parameters of track {} unavailable: {}", track_id, e);
                return None;
            }
        };
        Some(self.with_values(track_id, infos).await)
    }

    async fn processor_details(&self, processor_id: ProcessorId) -> RemoteResult<ProcessorDetails> {
        let infos = with_deadline(
            self.deadline,
            self.remote.get_processor_parameters(processor_id),
        )
        .await?;
        let parameters = self.with_values(processor_id, infos).await;

        let properties = match with_deadline(
            self.deadline,
            self.remote.get_processor_properties(processor_id),
        )
        .await
        {
            Ok(infos) => {
                join_all(infos.into_iter().map(|info| async move {
                    let value = with_deadline(
                        self.deadline,
                        self.remote.get_property_value(processor_id, &info.name),
                    )
                    .await
                    .ok();
                    (info, value)
                }))
                .await
            }
            Err(e) => {
                debug!("Properties of processor {} unavailable: {}", processor_id, e);
                Vec::new()
            }
        };

        Ok(ProcessorDetails {
            parameters,
            properties,
        })
    }

    async fn with_values(
        &self,
        owner: ProcessorId,
        infos: Vec<ParameterInfo>,
    ) -> Vec<(ParameterInfo, Option<f64>)> {
        join_all(infos.into_iter().map(|info| async move {
            let value = self.parameter_value(owner, &info).await;
            (info, value)
        }))
        .await
    }

    /// Normalized value, falling back to the domain value when the engine
    /// cannot report the normalized one.
    async fn parameter_value(&self, owner: ProcessorId, info: &ParameterInfo) -> Option<f64> {
        match with_deadline(self.deadline, self.remote.get_parameter_value(owner, info.id)).await {
            Ok(value) => return Some(value),
            Err(e) => debug!(
                "Normalized value of {}/{} unavailable: {}",
                owner, info.id, e
            ),
        }
        with_deadline(
            self.deadline,
            self.remote.get_parameter_value_in_domain(owner, info.id),
        )
        .await
        .ok()
        .map(|domain| domain_to_normalized(domain, info.min_domain, info.max_domain))
    }
}
