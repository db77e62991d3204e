//! Sushi console synchronization core.
//!
//! Mirrors the topology of a remote Sushi engine (tracks, processors,
//! parameters, properties, CPU load) into a local store, merging query
//! results, pushed notifications and polled values through a single
//! reconciler. User edits are applied optimistically and reverted when the
//! engine refuses them.
//!
//! The transport is pluggable: anything implementing [`RemoteControl`] can
//! drive a session.

#![warn(clippy::all, rust_2018_idioms)]

pub mod config;
pub mod convert;
pub mod drag;
pub mod error;
pub mod logging;
pub mod mutations;
pub mod optimistic;
pub mod remote;
pub mod session;
pub mod state;
pub mod store;

mod loader;
mod poll;
mod reconciler;
mod subscriptions;

pub use config::{Config, ConfigError, LoggingConfig, ReconnectPolicy, SyncConfig};
pub use convert::{domain_to_normalized, normalized_to_domain, DomainExt};
pub use drag::{DragReorder, DropTarget, Droppable, Rect};
pub use error::{RemoteError, RemoteResult, SyncError, SyncResult};
pub use mutations::TopologyMutations;
pub use optimistic::WriteCoordinator;
pub use remote::{EventStream, RemoteControl, SharedRemote};
pub use session::EngineSession;
pub use state::SyncNotice;
pub use store::{
    CpuLoad, ParameterAddress, PropertyAddress, StoreReader, StoredValue, TopologyStore, ValueKey,
};

pub use sushi_console_types as types;
