use thiserror::Error;

use crate::entry::{BlockHeight, HostId};

/// Failure of a single host database operation. None of these leave the
/// database modified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostDbError {
    #[error("host {0} already exists in the host database")]
    AlreadyExists(HostId),
    #[error("host {0} not found in the host database")]
    NotFound(HostId),
    #[error("no hosts available for selection")]
    NoHostsAvailable,
    #[error("host {0} announced with zero weight")]
    ZeroWeight(HostId),
    #[error("host {0} is not inactive")]
    NotInactive(HostId),
}

/// Which half of a reorganization a block belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgDirection {
    Rewind,
    Apply,
}

/// Failure while reconciling a reorganization.
///
/// `block` is the position of the failing block within its half of the
/// reorg. Blocks before it have already been reflected in the database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError<E> {
    #[error("failed to scan {direction:?} block {block} at height {height}")]
    Scan {
        height: BlockHeight,
        block: usize,
        direction: ReorgDirection,
        #[source]
        source: E,
    },
}
