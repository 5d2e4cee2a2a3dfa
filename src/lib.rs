mod engine;
mod error;
mod identity;
mod messages;
mod node;
mod pset;
mod routing;
mod transport;
mod vset;

pub use engine::VrrConfig;
pub use error::{VrrError, VrrResult};
pub use identity::{LinkAddr, NodeId};
pub use messages::ETHERTYPE_VRR;
pub use node::Node;
pub use pset::{LinkStatus, PsetEntry};
pub use transport::{EthFrame, InboundFrame, LinkInterface, MemLink, MemSegment, UdpLink};
