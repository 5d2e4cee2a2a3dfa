//! # Protocol Engine
//!
//! The engine owns the three stores (pset, vset, routing table) and the local
//! node state, and implements the receive-side state machine for the six
//! packet types together with the send builders and the ring-maintenance
//! tick.
//!
//! ## Concurrency Model
//!
//! Each store sits behind its own lock; an operation takes snapshots and
//! releases the lock before any transmit, so no lock is ever held across
//! I/O. Hello processing is deliberately split off the receive path: the
//! dispatcher only parses and enqueues a [`HelloJob`], and a dedicated worker
//! applies the link-state transition, so frame arrival latency stays
//! decoupled from state-machine cost.
//!
//! Setup rounds are not atomic across participants. A failed or inconsistent
//! round leaves at worst a dangling path that the next teardown or hello
//! cycle clears; nothing here retries eagerly.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{VrrError, VrrResult};
use crate::identity::{LinkAddr, NodeId};
use crate::messages::{self, Header, Payload, WireLimits};
use crate::pset::{HelloRole, PhysicalSet, PsetEntry};
use crate::routing::RoutingTable;
use crate::transport::{InboundFrame, Output};
use crate::vset::VirtualSet;

/// Node configuration.
#[derive(Clone, Debug)]
pub struct VrrConfig {
    /// Fixed ring identifier; None picks a random one at startup.
    pub id: Option<u32>,
    /// Interval of the maintenance tick (hello emission, failure detection,
    /// activation timeout).
    pub hello_interval: Duration,
    /// Consecutive missed intervals after which a neighbor is marked Failed;
    /// it is purged after twice as many.
    pub fail_timeout_ticks: u32,
    /// Ticks without ring activity after which an inactive node activates
    /// itself to bootstrap an isolated segment.
    pub activate_timeout_ticks: u32,
    /// Virtual neighbor set capacity.
    pub vset_capacity: usize,
    /// Physical neighbor set capacity.
    pub pset_capacity: usize,
}

impl Default for VrrConfig {
    fn default() -> Self {
        Self {
            id: None,
            hello_interval: Duration::from_secs(1),
            fail_timeout_ticks: 4,
            activate_timeout_ticks: 8,
            vset_capacity: 4,
            pset_capacity: 20,
        }
    }
}

/// Local node state guarded by one lock.
#[derive(Debug)]
struct LocalState {
    active: bool,
    ticks_inactive: u32,
}

/// A parsed hello, handed from the receive path to the hello worker.
#[derive(Debug)]
pub struct HelloJob {
    src: NodeId,
    src_link: LinkAddr,
    active: bool,
    linked_active: Vec<NodeId>,
    linked_inactive: Vec<NodeId>,
    pending: Vec<NodeId>,
}

/// The protocol engine. One per node, shared behind an `Arc`.
pub struct Engine {
    id: NodeId,
    config: VrrConfig,
    limits: WireLimits,
    local: RwLock<LocalState>,
    pset: RwLock<PhysicalSet>,
    vset: RwLock<VirtualSet>,
    routes: RwLock<RoutingTable>,
    output: Output,
    delivery: mpsc::Sender<(NodeId, Vec<u8>)>,
    hello_jobs: mpsc::Sender<HelloJob>,
    rng: Mutex<StdRng>,
}

impl Engine {
    pub fn new(
        config: VrrConfig,
        output: Output,
        delivery: mpsc::Sender<(NodeId, Vec<u8>)>,
        hello_jobs: mpsc::Sender<HelloJob>,
    ) -> Self {
        let mut rng = StdRng::from_entropy();
        let id = match config.id {
            Some(raw) => NodeId::new(raw),
            None => NodeId::random(&mut rng),
        };
        let limits = WireLimits {
            max_pset_list: config.pset_capacity,
            max_vset_list: config.vset_capacity,
        };
        Self {
            id,
            local: RwLock::new(LocalState {
                active: false,
                ticks_inactive: 0,
            }),
            pset: RwLock::new(PhysicalSet::new(config.pset_capacity)),
            vset: RwLock::new(VirtualSet::new(id, config.vset_capacity)),
            routes: RwLock::new(RoutingTable::new(id)),
            output,
            delivery,
            hello_jobs,
            rng: Mutex::new(rng),
            limits,
            config,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &VrrConfig {
        &self.config
    }

    pub async fn is_active(&self) -> bool {
        self.local.read().await.active
    }

    pub async fn pset_snapshot(&self) -> Vec<PsetEntry> {
        self.pset.read().await.snapshot()
    }

    pub async fn vset_snapshot(&self) -> Vec<NodeId> {
        self.vset.read().await.snapshot()
    }

    /// Entry point for every received frame.
    ///
    /// Decode failures drop the frame before any store is touched. Hellos are
    /// enqueued for the worker; everything else is handled inline. The error
    /// reports why a frame was dropped; the caller only logs it, since no
    /// error-reply channel exists in-protocol.
    pub async fn handle_frame(&self, frame: InboundFrame) -> VrrResult<()> {
        let (header, payload) = match messages::decode(&frame.payload, self.limits) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(src_link = %frame.src_link, error = %e, "dropping malformed frame");
                return Err(e.into());
            }
        };

        // Identify the sender by link address. Frames looped back from our
        // own output carry a local interface address and count as self.
        let sender = if self.output.is_local_addr(frame.src_link) {
            Some(self.id)
        } else {
            let mut pset = self.pset.write().await;
            let sender = pset.lookup_by_link_addr(frame.src_link);
            if let Some(node) = sender {
                // Any accepted packet is proof of life.
                pset.reset_fail_count(node);
            }
            sender
        };

        match payload {
            Payload::Hello {
                active,
                linked_active,
                linked_inactive,
                pending,
            } => {
                let job = HelloJob {
                    src: header.src,
                    src_link: frame.src_link,
                    active,
                    linked_active,
                    linked_inactive,
                    pending,
                };
                // The receive path never blocks; a full queue sheds load and
                // the next hello cycle repeats the information anyway.
                if self.hello_jobs.try_send(job).is_err() {
                    debug!(src = %header.src, "hello queue full, dropping");
                }
                Ok(())
            }
            Payload::Data(data) => {
                self.handle_data(&header, data).await;
                Ok(())
            }
            Payload::SetupReq { proxy, vset } => {
                self.handle_setup_req(&header, proxy, vset).await;
                Ok(())
            }
            Payload::Setup {
                path_id,
                proxy,
                vset,
            } => {
                self.handle_setup(&header, frame.src_link, sender, path_id, proxy, vset)
                    .await
            }
            Payload::SetupFail { proxy, vset } => {
                self.handle_setup_fail(&header, proxy, vset).await;
                Ok(())
            }
            Payload::Teardown {
                endpoint,
                path_id,
                vset,
            } => {
                self.handle_teardown(frame.src_link, sender, endpoint, path_id, vset)
                    .await
            }
        }
    }

    /// Apply a hello to the pset: derive our role in the sender's view, run
    /// the transition table, and bootstrap ring membership through a neighbor
    /// that just became linked and active.
    pub async fn process_hello(&self, job: HelloJob) {
        if job.src == self.id || job.src.is_none() {
            return;
        }

        let role = if job.linked_active.contains(&self.id) || job.linked_inactive.contains(&self.id)
        {
            HelloRole::Linked
        } else if job.pending.contains(&self.id) {
            HelloRole::Pending
        } else {
            HelloRole::Missing
        };

        let outcome = {
            let mut pset = self.pset.write().await;
            pset.observe_hello(job.src, job.src_link, role, job.active)
        };

        let Some(outcome) = outcome else {
            debug!(src = %job.src, "pset full, ignoring hello");
            return;
        };

        debug!(
            src = %job.src,
            ?role,
            from = ?outcome.previous,
            to = ?outcome.status,
            "hello applied"
        );

        if outcome.became_linked_active() {
            info!(neighbor = %job.src, "link established, requesting ring entry");
            if let Err(e) = self.send_setup_req(self.id, self.id, job.src).await {
                warn!(proxy = %job.src, error = %e, "bootstrap setup_req failed");
            }
        }
    }

    async fn handle_data(&self, header: &Header, data: Vec<u8>) {
        if header.dst == self.id {
            if self.delivery.send((header.src, data)).await.is_err() {
                debug!("local delivery channel closed");
            }
            return;
        }
        let next = { self.routes.read().await.search(header.dst, None) };
        match next {
            Some(next) => {
                if let Err(e) = self
                    .send_packet(next, header.src, header.dst, Payload::Data(data))
                    .await
                {
                    debug!(dst = %header.dst, error = %e, "data forward failed");
                }
            }
            None => debug!(dst = %header.dst, "no route for data, dropping"),
        }
    }

    async fn handle_setup_req(&self, header: &Header, proxy: NodeId, vset_prime: Vec<NodeId>) {
        // Relay while somebody else is ring-closer to the target.
        let next = {
            self.routes
                .read()
                .await
                .search(header.dst, Some(header.src))
        };
        if let Some(next) = next {
            if let Err(e) = self
                .send_packet(
                    next,
                    header.src,
                    header.dst,
                    Payload::SetupReq {
                        proxy,
                        vset: vset_prime,
                    },
                )
                .await
            {
                debug!(dst = %header.dst, error = %e, "setup_req relay failed");
            }
            return;
        }

        // We are the closest node: run admission and answer through our own
        // receive path so the reply takes the regular setup route.
        let ovset = { self.vset.read().await.snapshot() };
        let admitted = self.admit(&vset_prime, Some(header.src)).await;
        let reply = if admitted {
            let path_id = self.new_path_id().await;
            Payload::Setup {
                path_id,
                proxy,
                vset: ovset,
            }
        } else {
            Payload::SetupFail { proxy, vset: ovset }
        };
        if let Err(e) = self.send_packet(self.id, self.id, header.src, reply).await {
            warn!(dst = %header.src, error = %e, "setup reply failed");
        }
    }

    async fn handle_setup(
        &self,
        header: &Header,
        src_link: LinkAddr,
        sender: Option<NodeId>,
        path_id: u32,
        proxy: NodeId,
        vset_prime: Vec<NodeId>,
    ) -> VrrResult<()> {
        let Some(sender) = sender else {
            // The path id may already reference live state somewhere; tear it
            // down rather than silently dropping.
            warn!(src_link = %src_link, path_id, "setup from untrusted sender");
            self.tear_down_path(path_id, header.src, None).await;
            return Err(VrrError::SenderNotTrusted(src_link));
        };

        let next = self.setup_next_hop(header.dst, proxy).await;

        let inserted = {
            let mut routes = self.routes.write().await;
            routes.insert(
                header.src,
                header.dst,
                sender,
                next.unwrap_or(NodeId::NONE),
                path_id,
            )
        };
        if !inserted {
            debug!(path_id, src = %header.src, "duplicate path id, tearing down");
            self.tear_down_path(path_id, header.src, Some(sender)).await;
            return Ok(());
        }

        if let Some(next) = next {
            if let Err(e) = self
                .send_packet(
                    next,
                    header.src,
                    header.dst,
                    Payload::Setup {
                        path_id,
                        proxy,
                        vset: vset_prime,
                    },
                )
                .await
            {
                debug!(next = %next, error = %e, "setup relay failed");
                self.tear_down_path(path_id, header.src, None).await;
            }
            return Ok(());
        }

        if header.dst == self.id {
            if self.admit(&vset_prime, Some(header.src)).await {
                self.mark_ring_active().await;
            } else {
                self.tear_down_path(path_id, header.src, None).await;
            }
        } else {
            // Dead end: we are neither the destination nor able to relay.
            self.tear_down_path(path_id, header.src, None).await;
        }
        Ok(())
    }

    async fn handle_setup_fail(&self, header: &Header, proxy: NodeId, vset_prime: Vec<NodeId>) {
        if let Some(next) = self.setup_next_hop(header.dst, proxy).await {
            if let Err(e) = self
                .send_packet(
                    next,
                    header.src,
                    header.dst,
                    Payload::SetupFail {
                        proxy,
                        vset: vset_prime,
                    },
                )
                .await
            {
                debug!(next = %next, error = %e, "setup_fail relay failed");
            }
            return;
        }
        if header.dst == self.id {
            // Retry admission with the refuser's vset; the refuser itself is
            // a candidate but is not force-admitted.
            let mut candidates = vset_prime;
            if !candidates.contains(&header.src) {
                candidates.push(header.src);
            }
            self.admit(&candidates, None).await;
        } else {
            debug!(dst = %header.dst, "setup_fail dead end, dropping");
        }
    }

    async fn handle_teardown(
        &self,
        src_link: LinkAddr,
        sender: Option<NodeId>,
        endpoint: NodeId,
        path_id: u32,
        vset_prime: Vec<NodeId>,
    ) -> VrrResult<()> {
        let Some(sender) = sender else {
            warn!(src_link = %src_link, path_id, "teardown from untrusted sender");
            self.tear_down_path(path_id, endpoint, None).await;
            return Err(VrrError::SenderNotTrusted(src_link));
        };

        let removed = { self.routes.write().await.remove(endpoint, path_id) };
        let Some(entry) = removed else {
            debug!(path_id, endpoint = %endpoint, "teardown for unknown path");
            return Ok(());
        };

        let next = if sender == entry.na { entry.nb } else { entry.na };
        let next_live = !next.is_none()
            && next != self.id
            && self.pset.read().await.is_linked(next);

        if next_live {
            if let Err(e) = self
                .send_teardown(next, endpoint, path_id, vset_prime)
                .await
            {
                debug!(next = %next, error = %e, "teardown relay failed");
            }
            return Ok(());
        }

        // The path ends here: the endpoint on the sender's side of the entry
        // is the ring neighbor being torn away.
        let lost = if sender == entry.na { entry.ea } else { entry.eb };
        if lost != self.id && !lost.is_none() {
            let was_member = { self.vset.write().await.remove(lost) };
            if was_member {
                info!(neighbor = %lost, "ring neighbor torn down");
            }
        }

        if !vset_prime.is_empty() {
            self.admit(&vset_prime, None).await;
        } else if lost != self.id && !lost.is_none() {
            // Nothing offered in exchange; try to re-establish the path.
            match self.pick_proxy().await {
                Ok(proxy) => {
                    if let Err(e) = self.send_setup_req(self.id, lost, proxy).await {
                        debug!(dst = %lost, error = %e, "re-setup failed");
                    }
                }
                Err(e) => debug!(dst = %lost, error = %e, "cannot re-establish path"),
            }
        }
        Ok(())
    }

    /// Ring admission: recruit admissible members of `vset_prime` through
    /// random proxies, and directly admit `src` when given. Returns whether
    /// `src` was admitted.
    pub async fn admit(&self, vset_prime: &[NodeId], src: Option<NodeId>) -> bool {
        for &candidate in vset_prime {
            if candidate == self.id || candidate.is_none() {
                continue;
            }
            let admissible = { self.vset.read().await.should_admit(candidate) };
            if !admissible {
                continue;
            }
            match self.pick_proxy().await {
                Ok(proxy) => {
                    if let Err(e) = self.send_setup_req(self.id, candidate, proxy).await {
                        debug!(candidate = %candidate, error = %e, "recruit setup_req failed");
                    }
                }
                Err(e) => debug!(candidate = %candidate, error = %e, "recruit skipped"),
            }
        }

        let Some(src) = src else { return false };
        if src == self.id || src.is_none() {
            return false;
        }

        let added = {
            let mut vset = self.vset.write().await;
            if !vset.should_admit(src) {
                return false;
            }
            vset.add(src)
        };
        match added {
            Ok(evicted) => {
                info!(neighbor = %src, "ring neighbor admitted");
                if let Some(evicted) = evicted {
                    info!(neighbor = %evicted, "ring neighbor evicted");
                    self.tear_down_paths_to(evicted).await;
                }
                self.reset_activation_timeout().await;
                true
            }
            Err(_) => {
                warn!(candidate = %src, "vset over capacity with no evictable member");
                false
            }
        }
    }

    /// Remove a path and notify its live ends.
    ///
    /// A locally-initiated teardown (`sender` = None) offers our vset so the
    /// far endpoint can re-admit; a teardown triggered by a peer carries
    /// nothing.
    pub async fn tear_down_path(&self, path_id: u32, endpoint: NodeId, sender: Option<NodeId>) {
        let removed = { self.routes.write().await.remove(endpoint, path_id) };
        let Some(entry) = removed else {
            return;
        };
        debug!(path_id, endpoint = %endpoint, "tearing down path");

        let vset_offer = if sender.is_none() {
            self.vset.read().await.snapshot()
        } else {
            Vec::new()
        };

        let mut targets = vec![entry.na, entry.nb];
        if let Some(sender) = sender {
            targets.push(sender);
        }
        targets.dedup();
        for target in targets {
            if target.is_none() || target == self.id {
                continue;
            }
            let linked = { self.pset.read().await.is_linked(target) };
            if !linked {
                continue;
            }
            if let Err(e) = self
                .send_teardown(target, endpoint, path_id, vset_offer.clone())
                .await
            {
                debug!(target = %target, error = %e, "teardown send failed");
            }
        }
    }

    /// Tear down every path terminating at `node`.
    pub async fn tear_down_paths_to(&self, node: NodeId) {
        let paths: Vec<u32> = {
            self.routes
                .read()
                .await
                .entries_at(node)
                .iter()
                .map(|e| e.path_id)
                .collect()
        };
        for path_id in paths {
            self.tear_down_path(path_id, node, None).await;
        }
    }

    /// One maintenance tick: hello emission, failure detection, activation
    /// timeout.
    pub async fn tick(&self) {
        if let Err(e) = self.send_hello().await {
            debug!(error = %e, "hello emission failed");
        }

        let (marked, reaped) = {
            let mut pset = self.pset.write().await;
            pset.tick_failures(self.config.fail_timeout_ticks)
        };
        for node in marked {
            debug!(neighbor = %node, "neighbor marked failed");
        }
        for entry in reaped {
            warn!(neighbor = %entry.node, "purging failed neighbor");
            let was_member = { self.vset.write().await.remove(entry.node) };
            if was_member {
                info!(neighbor = %entry.node, "ring neighbor lost to failure");
            }
            self.tear_down_paths_to(entry.node).await;
            let via: Vec<(NodeId, u32)> = { self.routes.read().await.paths_via(entry.node) };
            for (endpoint, path_id) in via {
                self.tear_down_path(path_id, endpoint, None).await;
            }
        }

        let mut local = self.local.write().await;
        if !local.active {
            local.ticks_inactive += 1;
            if local.ticks_inactive >= self.config.activate_timeout_ticks {
                local.active = true;
                info!(id = %self.id, "activating without ring neighbors");
            }
        }
    }

    /// Application data entry point.
    pub async fn send_data(&self, dst: NodeId, payload: Vec<u8>) -> VrrResult<usize> {
        let len = payload.len();
        if dst == self.id {
            return self
                .delivery
                .send((self.id, payload))
                .await
                .map(|_| len)
                .map_err(|_| VrrError::Shutdown);
        }
        let next = { self.routes.read().await.search(dst, None) };
        let next = next.ok_or(VrrError::NoRoute(dst))?;
        self.send_packet(next, self.id, dst, Payload::Data(payload))
            .await?;
        Ok(len)
    }

    async fn send_hello(&self) -> VrrResult<()> {
        let lists = { self.pset.read().await.hello_lists() };
        let active = { self.local.read().await.active };
        let payload = Payload::Hello {
            active,
            linked_active: lists.linked_active,
            linked_inactive: lists.linked_inactive,
            pending: lists.pending,
        };
        let buf = messages::encode(self.id, NodeId::NONE, LinkAddr::BROADCAST, &payload);
        self.output.transmit(LinkAddr::BROADCAST, buf).await
    }

    async fn send_setup_req(&self, src: NodeId, dst: NodeId, proxy: NodeId) -> VrrResult<()> {
        let vset = { self.vset.read().await.snapshot() };
        self.send_packet(proxy, src, dst, Payload::SetupReq { proxy, vset })
            .await
    }

    async fn send_teardown(
        &self,
        to: NodeId,
        endpoint: NodeId,
        path_id: u32,
        vset: Vec<NodeId>,
    ) -> VrrResult<()> {
        self.send_packet(
            to,
            self.id,
            to,
            Payload::Teardown {
                endpoint,
                path_id,
                vset,
            },
        )
        .await
    }

    /// Resolve the next hop's link address and transmit.
    async fn send_packet(
        &self,
        next_hop: NodeId,
        src: NodeId,
        dst: NodeId,
        payload: Payload,
    ) -> VrrResult<()> {
        let dest_link = if next_hop == self.id {
            self.output.primary_addr()
        } else {
            let addr = { self.pset.read().await.link_addr_of(next_hop) };
            addr.ok_or(VrrError::Unreachable(next_hop))?
        };
        let buf = messages::encode(src, dst, dest_link, &payload);
        self.output.transmit(dest_link, buf).await
    }

    /// Next hop for SETUP/SETUP_FAIL routing: straight to the destination
    /// when it is a linked physical neighbor, otherwise along the proxy
    /// route. A packet that already reached its destination never leaves
    /// again.
    async fn setup_next_hop(&self, dst: NodeId, proxy: NodeId) -> Option<NodeId> {
        if dst == self.id {
            return None;
        }
        {
            let pset = self.pset.read().await;
            if pset.is_linked(dst) {
                return Some(dst);
            }
        }
        self.routes.read().await.search(proxy, None)
    }

    /// Uniform random Linked, active neighbor to relay a setup request.
    async fn pick_proxy(&self) -> VrrResult<NodeId> {
        let pset = self.pset.read().await;
        let mut rng = self.rng.lock().await;
        pset.pick_proxy(&mut *rng).ok_or(VrrError::NoProxyAvailable)
    }

    /// Fresh nonzero path id, re-rolled while the table still references it.
    async fn new_path_id(&self) -> u32 {
        loop {
            let candidate: u32 = { self.rng.lock().await.gen() };
            if candidate == 0 {
                continue;
            }
            let in_use = { self.routes.read().await.has_path_id(candidate) };
            if !in_use {
                return candidate;
            }
        }
    }

    async fn mark_ring_active(&self) {
        let mut local = self.local.write().await;
        if !local.active {
            info!(id = %self.id, "ring membership established, node active");
        }
        local.active = true;
        local.ticks_inactive = 0;
    }

    async fn reset_activation_timeout(&self) {
        self.local.write().await.ticks_inactive = 0;
    }
}
