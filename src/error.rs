//! Protocol errors

use thiserror::Error;

use crate::identity::{LinkAddr, NodeId};
use crate::messages::DecodeError;

/// Errors surfaced by the VRR engine and node facade.
#[derive(Debug, Error)]
pub enum VrrError {
    /// Frame failed structural validation and was dropped.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] DecodeError),

    /// No link-layer address is known for a required next hop.
    #[error("next hop {0} is not link-reachable")]
    Unreachable(NodeId),

    /// The routing table holds no path toward the destination.
    #[error("no route toward {0}")]
    NoRoute(NodeId),

    /// SETUP/TEARDOWN arrived from a link address outside the pset.
    #[error("sender {0} is not a trusted physical neighbor")]
    SenderNotTrusted(LinkAddr),

    /// No linked, active physical neighbor is available to proxy a setup.
    #[error("no active proxy available")]
    NoProxyAvailable,

    /// Vset is over capacity but no member ranks outside the closest
    /// half-capacity in both ring directions.
    #[error("vset over capacity with no evictable member")]
    VsetNoEvictable,

    /// The node is shutting down; channels are closed.
    #[error("node is shut down")]
    Shutdown,
}

/// Result alias for engine operations.
pub type VrrResult<T> = Result<T, VrrError>;
