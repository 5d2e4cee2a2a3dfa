//! # High-Level Node API
//!
//! This module provides the main entry point for running a VRR node. A
//! [`Node`] wires the protocol engine to its link interfaces and background
//! tasks:
//!
//! - one receive pump per interface feeding the engine's inbound queue
//! - the dispatch loop running the receive state machine
//! - the hello worker applying deferred link-state updates
//! - the maintenance tick (hello emission, failure detection, activation)
//!
//! ## Quick Start
//!
//! ```ignore
//! let segment = MemSegment::new();
//! let iface = segment.attach("vrr0", LinkAddr::random(&mut rand::thread_rng()));
//! let node = Node::start(VrrConfig::default(), vec![iface])?;
//!
//! // Receive data addressed to this node's ring identifier.
//! let mut rx = node.messages().await.expect("first take");
//! while let Some((src, data)) = rx.recv().await {
//!     println!("{src} says {data:?}");
//! }
//! ```
//!
//! Shutdown stops the maintenance tick before anything else so no timer ever
//! fires into half-torn-down stores.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::{Engine, VrrConfig};
use crate::error::VrrResult;
use crate::identity::NodeId;
use crate::pset::PsetEntry;
use crate::transport::{InboundFrame, LinkInterface, Output};

/// A receiver that can be taken exactly once via `.take()`.
/// Used for the local-delivery receiver, which has a single consumer.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// A running VRR node.
pub struct Node {
    engine: Arc<Engine>,
    delivery: TakeOnce<(NodeId, Vec<u8>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a node on the given link interfaces.
    pub fn start(config: VrrConfig, interfaces: Vec<Arc<dyn LinkInterface>>) -> Result<Self> {
        anyhow::ensure!(
            !interfaces.is_empty(),
            "a VRR node needs at least one link interface"
        );

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundFrame>(256);
        let (delivery_tx, delivery_rx) = mpsc::channel(256);
        let (hello_tx, mut hello_rx) = mpsc::channel(64);

        let output = Output::new(interfaces.clone(), inbound_tx.clone());
        let engine = Arc::new(Engine::new(config, output, delivery_tx, hello_tx));
        info!(id = %engine.id(), "vrr node starting");

        let mut tasks = Vec::new();

        // Maintenance tick first; shutdown aborts in order, and timers must
        // stop before anything else is torn down.
        {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(engine.config().hello_interval);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    engine.tick().await;
                }
            }));
        }

        for iface in interfaces {
            let inbound_tx = inbound_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(frame) = iface.recv().await {
                    let inbound = InboundFrame {
                        payload: frame.payload,
                        src_link: frame.src,
                    };
                    if inbound_tx.send(inbound).await.is_err() {
                        break;
                    }
                }
                debug!(iface = iface.name(), "link closed");
            }));
        }

        {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                while let Some(frame) = inbound_rx.recv().await {
                    if let Err(e) = engine.handle_frame(frame).await {
                        debug!(error = %e, "frame dropped");
                    }
                }
            }));
        }

        {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                while let Some(job) = hello_rx.recv().await {
                    engine.process_hello(job).await;
                }
            }));
        }

        Ok(Self {
            engine,
            delivery: tokio::sync::Mutex::new(Some(delivery_rx)),
            tasks,
        })
    }

    /// This node's ring identifier.
    pub fn local_id(&self) -> NodeId {
        self.engine.id()
    }

    /// Whether the node participates in the ring (or activated itself after
    /// the isolation timeout).
    pub async fn is_active(&self) -> bool {
        self.engine.is_active().await
    }

    /// Snapshot of the physical neighbor set.
    pub async fn pset_members(&self) -> Vec<PsetEntry> {
        self.engine.pset_snapshot().await
    }

    /// Snapshot of the virtual neighbor set.
    pub async fn vset_members(&self) -> Vec<NodeId> {
        self.engine.vset_snapshot().await
    }

    /// Send application data to a ring identifier.
    ///
    /// Returns the number of payload bytes handed to the link layer;
    /// [`crate::VrrError::NoRoute`] when the routing table has no path and
    /// [`crate::VrrError::Unreachable`] when the next hop has no link
    /// address.
    pub async fn send_data(&self, dst: NodeId, payload: Vec<u8>) -> VrrResult<usize> {
        self.engine.send_data(dst, payload).await
    }

    /// Take the local-delivery receiver. Yields `(source id, payload)` for
    /// every DATA packet addressed to this node. Returns None after the
    /// first take.
    pub async fn messages(&self) -> Option<mpsc::Receiver<(NodeId, Vec<u8>)>> {
        self.delivery.lock().await.take()
    }

    /// Stop all background tasks, timers first.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!(id = %self.engine.id(), "vrr node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
