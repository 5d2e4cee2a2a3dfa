//! # Link Transport
//!
//! VRR rides directly on a broadcast link layer; this module is the seam
//! between the protocol engine and whatever carries the frames.
//!
//! - [`LinkInterface`]: one attachment to a broadcast segment — a name, a
//!   link address, transmit and receive.
//! - [`EthFrame`]: the 14-byte link framing (destination, source, ethertype)
//!   around an encoded VRR packet.
//! - [`Output`]: the send side. Resolved unicast frames leave through the
//!   bound interface, HELLO floods clone the frame out every interface, and
//!   a frame addressed to one of our own interfaces short-circuits straight
//!   back into the receive path without touching the wire.
//! - [`MemSegment`]/[`MemLink`]: an in-memory switch for tests and
//!   simulations.
//! - [`UdpLink`]: a broadcast segment emulated over UDP — every frame goes to
//!   all configured segment peers and receivers filter by destination
//!   address, which is how a shared medium behaves.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{VrrError, VrrResult};
use crate::identity::LinkAddr;
use crate::messages::ETHERTYPE_VRR;

/// Link framing header length: dst (6) + src (6) + ethertype (2).
pub const FRAME_HEADER_LEN: usize = 14;

/// One link-layer frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthFrame {
    pub dst: LinkAddr,
    pub src: LinkAddr,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl EthFrame {
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(self.dst.as_bytes());
        buf.extend_from_slice(self.src.as_bytes());
        buf.extend_from_slice(&self.ethertype.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        Some(Self {
            dst: LinkAddr::from_bytes(buf[0..6].try_into().ok()?),
            src: LinkAddr::from_bytes(buf[6..12].try_into().ok()?),
            ethertype: u16::from_be_bytes([buf[12], buf[13]]),
            payload: buf[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}

/// A frame handed to the engine, stripped of link framing.
#[derive(Clone, Debug)]
pub struct InboundFrame {
    pub payload: Vec<u8>,
    pub src_link: LinkAddr,
}

/// One attachment to a broadcast segment.
#[async_trait]
pub trait LinkInterface: Send + Sync {
    fn name(&self) -> &str;

    fn link_addr(&self) -> LinkAddr;

    /// Put a frame on the segment.
    async fn transmit(&self, frame: EthFrame) -> anyhow::Result<()>;

    /// Next frame addressed to us (or broadcast). None when the link closed.
    async fn recv(&self) -> Option<EthFrame>;
}

/// The send side of the engine: owns the interfaces and the loopback channel
/// back into the receive path.
pub struct Output {
    interfaces: Vec<Arc<dyn LinkInterface>>,
    loopback: mpsc::Sender<InboundFrame>,
}

impl Output {
    pub fn new(interfaces: Vec<Arc<dyn LinkInterface>>, loopback: mpsc::Sender<InboundFrame>) -> Self {
        Self {
            interfaces,
            loopback,
        }
    }

    pub fn interfaces(&self) -> &[Arc<dyn LinkInterface>] {
        &self.interfaces
    }

    /// The bound (first) interface's address; unicast leaves through it.
    pub fn primary_addr(&self) -> LinkAddr {
        self.interfaces
            .first()
            .map(|i| i.link_addr())
            .unwrap_or(LinkAddr::BROADCAST)
    }

    pub fn is_local_addr(&self, addr: LinkAddr) -> bool {
        self.interfaces.iter().any(|i| i.link_addr() == addr)
    }

    /// Send an encoded VRR packet toward a resolved link address.
    ///
    /// Local destinations loop straight back into the receive path;
    /// broadcasts are cloned out every interface; unicast goes out the bound
    /// interface. Per-interface transmit failures are logged and do not fail
    /// the whole send.
    pub async fn transmit(&self, dest: LinkAddr, payload: Vec<u8>) -> VrrResult<()> {
        if self.is_local_addr(dest) {
            // try_send, not send: the dispatch task may be the one looping a
            // frame back to itself, and it is also the channel's only
            // consumer. A full queue sheds the frame like a lossy link.
            return match self.loopback.try_send(InboundFrame {
                payload,
                src_link: dest,
            }) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("loopback queue full, dropping frame");
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(VrrError::Shutdown),
            };
        }

        if dest.is_broadcast() {
            for iface in &self.interfaces {
                let frame = EthFrame {
                    dst: LinkAddr::BROADCAST,
                    src: iface.link_addr(),
                    ethertype: ETHERTYPE_VRR,
                    payload: payload.clone(),
                };
                if let Err(e) = iface.transmit(frame).await {
                    warn!(iface = iface.name(), error = %e, "broadcast transmit failed");
                }
            }
            return Ok(());
        }

        let Some(iface) = self.interfaces.first() else {
            return Err(VrrError::Shutdown);
        };
        let frame = EthFrame {
            dst: dest,
            src: iface.link_addr(),
            ethertype: ETHERTYPE_VRR,
            payload,
        };
        if let Err(e) = iface.transmit(frame).await {
            warn!(iface = iface.name(), dest = %dest, error = %e, "unicast transmit failed");
        }
        Ok(())
    }
}

/// Shared in-memory broadcast segment.
///
/// Every attached [`MemLink`] sees every frame; receivers drop frames not
/// addressed to them, like NICs on a shared medium.
pub struct MemSegment {
    tx: broadcast::Sender<EthFrame>,
}

impl MemSegment {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self { tx })
    }

    /// Attach a new interface with the given name and address.
    pub fn attach(self: &Arc<Self>, name: impl Into<String>, addr: LinkAddr) -> Arc<MemLink> {
        Arc::new(MemLink {
            name: name.into(),
            addr,
            segment: Arc::clone(self),
            rx: Mutex::new(self.tx.subscribe()),
        })
    }
}

/// An interface attached to a [`MemSegment`].
pub struct MemLink {
    name: String,
    addr: LinkAddr,
    segment: Arc<MemSegment>,
    rx: Mutex<broadcast::Receiver<EthFrame>>,
}

#[async_trait]
impl LinkInterface for MemLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_addr(&self) -> LinkAddr {
        self.addr
    }

    async fn transmit(&self, frame: EthFrame) -> anyhow::Result<()> {
        // A send with no listeners is a segment with no other hosts.
        let _ = self.segment.tx.send(frame);
        Ok(())
    }

    async fn recv(&self) -> Option<EthFrame> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if frame.src == self.addr {
                        continue;
                    }
                    if frame.dst != self.addr && !frame.dst.is_broadcast() {
                        continue;
                    }
                    if frame.ethertype != ETHERTYPE_VRR {
                        continue;
                    }
                    return Some(frame);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(iface = %self.name, missed = n, "segment receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A broadcast segment emulated over UDP.
///
/// Frames are sent to every configured peer socket; the link address filter
/// on the receive side restores shared-medium semantics.
pub struct UdpLink {
    name: String,
    addr: LinkAddr,
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

impl UdpLink {
    /// Bind a UDP-backed interface and point it at its segment peers.
    pub async fn bind(
        name: impl Into<String>,
        local: SocketAddr,
        peers: Vec<SocketAddr>,
    ) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(local).await?;
        let addr = LinkAddr::random(&mut rand::thread_rng());
        let name = name.into();
        debug!(iface = %name, link_addr = %addr, bound = %socket.local_addr()?, "udp link up");
        Ok(Arc::new(Self {
            name,
            addr,
            socket,
            peers,
        }))
    }

    pub fn local_socket_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl LinkInterface for UdpLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_addr(&self) -> LinkAddr {
        self.addr
    }

    async fn transmit(&self, frame: EthFrame) -> anyhow::Result<()> {
        let wire = frame.to_wire();
        for peer in &self.peers {
            if let Err(e) = self.socket.send_to(&wire, peer).await {
                warn!(iface = %self.name, peer = %peer, error = %e, "udp send failed");
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Option<EthFrame> {
        let mut buf = vec![0u8; 2048];
        loop {
            let n = match self.socket.recv_from(&mut buf).await {
                Ok((n, _)) => n,
                Err(e) => {
                    warn!(iface = %self.name, error = %e, "udp recv failed");
                    return None;
                }
            };
            let Some(frame) = EthFrame::from_wire(&buf[..n]) else {
                continue;
            };
            if frame.src == self.addr {
                continue;
            }
            if frame.dst != self.addr && !frame.dst.is_broadcast() {
                continue;
            }
            if frame.ethertype != ETHERTYPE_VRR {
                continue;
            }
            return Some(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> LinkAddr {
        LinkAddr::from_bytes([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn frame_wire_roundtrip() {
        let frame = EthFrame {
            dst: addr(1),
            src: addr(2),
            ethertype: ETHERTYPE_VRR,
            payload: vec![1, 2, 3, 4],
        };
        let wire = frame.to_wire();
        assert_eq!(EthFrame::from_wire(&wire), Some(frame));
        assert_eq!(EthFrame::from_wire(&wire[..10]), None);
    }

    #[tokio::test]
    async fn segment_delivers_unicast_and_broadcast() {
        let segment = MemSegment::new();
        let a = segment.attach("a0", addr(1));
        let b = segment.attach("b0", addr(2));
        let c = segment.attach("c0", addr(3));

        a.transmit(EthFrame {
            dst: addr(2),
            src: addr(1),
            ethertype: ETHERTYPE_VRR,
            payload: vec![42],
        })
        .await
        .unwrap();

        let got = b.recv().await.expect("frame for b");
        assert_eq!(got.payload, vec![42]);

        a.transmit(EthFrame {
            dst: LinkAddr::BROADCAST,
            src: addr(1),
            ethertype: ETHERTYPE_VRR,
            payload: vec![7],
        })
        .await
        .unwrap();

        // The unicast to b must not reach c; the broadcast must.
        let got = c.recv().await.expect("broadcast for c");
        assert_eq!(got.payload, vec![7]);
    }

    #[tokio::test]
    async fn segment_filters_own_and_foreign_frames() {
        let segment = MemSegment::new();
        let a = segment.attach("a0", addr(1));
        let b = segment.attach("b0", addr(2));

        // Own frame, foreign ethertype, foreign unicast: all invisible to a.
        a.transmit(EthFrame {
            dst: LinkAddr::BROADCAST,
            src: addr(1),
            ethertype: ETHERTYPE_VRR,
            payload: vec![1],
        })
        .await
        .unwrap();
        b.transmit(EthFrame {
            dst: LinkAddr::BROADCAST,
            src: addr(2),
            ethertype: 0x0800,
            payload: vec![2],
        })
        .await
        .unwrap();
        b.transmit(EthFrame {
            dst: addr(9),
            src: addr(2),
            ethertype: ETHERTYPE_VRR,
            payload: vec![3],
        })
        .await
        .unwrap();
        b.transmit(EthFrame {
            dst: addr(1),
            src: addr(2),
            ethertype: ETHERTYPE_VRR,
            payload: vec![4],
        })
        .await
        .unwrap();

        let got = a.recv().await.expect("frame");
        assert_eq!(got.payload, vec![4]);
    }

    #[tokio::test]
    async fn output_loops_back_local_destinations() {
        let segment = MemSegment::new();
        let iface = segment.attach("lo0", addr(1));
        let (tx, mut rx) = mpsc::channel(4);
        let output = Output::new(vec![iface], tx);

        output.transmit(addr(1), vec![9, 9]).await.unwrap();
        let inbound = rx.recv().await.expect("loopback frame");
        assert_eq!(inbound.payload, vec![9, 9]);
        assert_eq!(inbound.src_link, addr(1));
    }

    #[tokio::test]
    async fn udp_links_form_a_segment() {
        let a = UdpLink::bind("u0", "127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        let a_sock = a.local_socket_addr().unwrap();
        let b = UdpLink::bind("u1", "127.0.0.1:0".parse().unwrap(), vec![a_sock])
            .await
            .unwrap();

        b.transmit(EthFrame {
            dst: LinkAddr::BROADCAST,
            src: b.link_addr(),
            ethertype: ETHERTYPE_VRR,
            payload: vec![5, 6],
        })
        .await
        .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(2), a.recv())
            .await
            .expect("timely")
            .expect("frame");
        assert_eq!(got.payload, vec![5, 6]);
    }
}
