use crate::registry::{RegistryError, SubscriptionError};
use jukebox_core::WorkerId;
use jukebox_plugin::SpawnError;
use thiserror::Error;

/// Everything that can go wrong on the bus. Only [`BusError::Registry`]
/// stops the router; the rest are confined to one worker or one event.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("worker '{worker}' closed its channel without being asked to terminate")]
    ChannelClosedUnexpectedly { worker: WorkerId },
    #[error("worker '{worker}' exited without being asked to terminate")]
    ExitedUnexpectedly { worker: WorkerId },
    #[error("worker '{worker}' speaks protocol version {actual}, expected {expected}")]
    ProtocolMismatch {
        worker: WorkerId,
        expected: u32,
        actual: String,
    },
    #[error("ignoring subscription change from '{worker}': {source}")]
    Subscription {
        worker: WorkerId,
        source: SubscriptionError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
