//! The Sender
//!
//! Per-worker owner of every connection, outbound and inbound, and of
//! the send path that feeds them. One Sender is pinned to one worker
//! and is only ever touched from that worker; cross-worker callers post
//! closures to the worker's queue.
//!
//! Responsibilities:
//!
//! - **Routing**: a message addressed to a node reuses the existing
//!   connection when it is still compatible (open, right TLS mode,
//!   right generation) and transparently reconnects otherwise. Client
//!   addresses only ever match an existing inbound session.
//! - **Backpressure**: a worker-wide outbuf budget, optionally split per
//!   peer type, rejects non-handshake sends with `NoBufs` once both the
//!   budget and the connection's own floor are exceeded.
//! - **Shaping**: every send drains its cost from the connection's flow
//!   group or gets parked (envelope or caller callback) until the
//!   worker's replenish tick frees bandwidth.
//! - **Completions**: `on_sent` callbacks never run inside the send
//!   call; they are queued and drained by a dedicated high-priority
//!   task, so a completion handler that sends again cannot reenter.
//! - **Hygiene**: a periodic cleanup pass classifies socket health,
//!   closes stalled/slow/idle connections under per-pass rate limits,
//!   and reclaims disconnected client sessions whose ids can be reused.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use seqlog_core::{
    Address, ClientId, LocationScope, Message, MessageType, NodeId, NodeIndex, NodeLocation,
    Status, TrafficClass,
};
use seqlog_membership::{NodesConfiguration, SocketAddress};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::budget::BudgetToken;
use crate::client_id::ClientIdAllocator;
use crate::connection::{Completion, Connection, Envelope, SocketHealth};
use crate::flow_group::{BwCallback, DeferredEnvelope, ShapingContainer};
use crate::info::{ConnectionInfo, ConnectionKind, ConnectionType, SocketType};
use crate::settings::NetSettings;
use crate::transport::Transport;
use crate::worker::WorkerHandle;

const CLIENT_PEER: usize = 0;
const NODE_PEER: usize = 1;

/// Builds transports for outgoing connections.
pub trait ConnectionFactory: Send {
    fn create_transport(
        &self,
        node: NodeId,
        address: &SocketAddress,
        connection_type: ConnectionType,
        socket_type: SocketType,
    ) -> Result<Box<dyn Transport>, Status>;
}

/// Receives `on_sent` completions, outside the send call stack.
pub trait MessageDispatch: Send {
    fn on_sent(&mut self, completion: Completion);
}

/// Send failure carrying the message back when the Sender did not
/// consume it.
pub struct SendError {
    pub status: Status,
    pub msg: Option<Message>,
}

impl SendError {
    fn returned(status: Status, msg: Message) -> Self {
        Self {
            status,
            msg: Some(msg),
        }
    }
}

impl std::fmt::Debug for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SendError({})", self.status.name())
    }
}

/// Counters published by the Sender; gauges refresh on each cleanup
/// pass.
#[derive(Debug, Default)]
pub struct SenderStats {
    pub num_sockets: AtomicU64,
    pub sock_active: AtomicU64,
    pub sock_stalled: AtomicU64,
    pub sock_app_limited: AtomicU64,
    pub sock_receiver_throttled: AtomicU64,
    pub sock_network_throttled: AtomicU64,
    pub sock_idle: AtomicU64,
    pub sock_health_unknown: AtomicU64,
    pub send_failed_nobufs: AtomicU64,
    pub client_connection_close_backlog: AtomicU64,
    pub server_connection_close_backlog: AtomicU64,
}

/// One connection as the debug surfaces see it; produced by
/// `Sender::fill_debug_info` and served by the admin debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDebugRow {
    /// Human-readable peer description (`N5 (10.0.0.5:4440)`).
    pub description: String,
    /// `open`, `closed`, or `closed` with live holders: `zombie`.
    pub state: String,
    pub ssl: bool,
    pub protocol: Option<u16>,
    pub bytes_pending: usize,
    /// Registered-but-unsent messages by type name.
    pub queued_by_type: BTreeMap<String, usize>,
}

#[derive(Clone, Copy)]
enum ConnKey {
    Node(NodeIndex),
    Client(ClientId),
}

impl ConnKey {
    fn peer_index(&self) -> usize {
        match self {
            ConnKey::Node(_) => NODE_PEER,
            ConnKey::Client(_) => CLIENT_PEER,
        }
    }
}

pub struct Sender {
    settings: Arc<NetSettings>,
    nodes: Arc<NodesConfiguration>,
    my_node_index: Option<NodeIndex>,
    my_location: Option<NodeLocation>,
    is_gossip_sender: bool,

    server_conns: HashMap<NodeIndex, Connection>,
    client_conns: HashMap<ClientId, Connection>,
    /// Inbound sessions that closed and await reclamation. Shared with
    /// the close callbacks installed on each inbound connection.
    disconnected_clients: Arc<Mutex<VecDeque<ClientId>>>,

    completed_messages: VecDeque<Completion>,
    delivering_completed_messages: Arc<AtomicBool>,

    bytes_pending_total: usize,
    bytes_pending_by_peer: [usize; 2],

    shaping: ShapingContainer,
    last_replenish: Instant,

    client_ids: ClientIdAllocator,
    connection_factory: Box<dyn ConnectionFactory>,
    dispatch: Box<dyn MessageDispatch>,
    handle: WorkerHandle,
    stats: Arc<SenderStats>,

    shutting_down: bool,
}

impl Sender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<NetSettings>,
        nodes: Arc<NodesConfiguration>,
        my_node_index: Option<NodeIndex>,
        my_location: Option<NodeLocation>,
        is_gossip_sender: bool,
        connection_factory: Box<dyn ConnectionFactory>,
        dispatch: Box<dyn MessageDispatch>,
        handle: WorkerHandle,
    ) -> Self {
        let shaping = ShapingContainer::new(&settings.shaping);
        Self {
            settings,
            nodes,
            my_node_index,
            my_location,
            is_gossip_sender,
            server_conns: HashMap::new(),
            client_conns: HashMap::new(),
            disconnected_clients: Arc::new(Mutex::new(VecDeque::new())),
            completed_messages: VecDeque::new(),
            delivering_completed_messages: Arc::new(AtomicBool::new(false)),
            bytes_pending_total: 0,
            bytes_pending_by_peer: [0, 0],
            shaping,
            last_replenish: Instant::now(),
            client_ids: ClientIdAllocator::new(),
            connection_factory,
            dispatch,
            handle,
            stats: Arc::new(SenderStats::default()),
            shutting_down: false,
        }
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    pub fn settings(&self) -> &NetSettings {
        &self.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn bytes_pending_total(&self) -> usize {
        self.bytes_pending_total
    }

    // ---------------------------------------------------------------
    // Inbound connections
    // ---------------------------------------------------------------

    /// Accept an inbound connection. Allocates a fresh ClientId whose
    /// handle rides inside the connection and is released on every
    /// reclamation path; registers the close hook that parks the id for
    /// the next cleanup pass.
    pub fn add_client(
        &mut self,
        transport: Box<dyn Transport>,
        peer_address: SocketAddress,
        budget_token: Option<BudgetToken>,
        connection_type: ConnectionType,
        kind: ConnectionKind,
    ) -> Result<ClientId, Status> {
        if self.shutting_down {
            // Listeners stop before Senders; getting here is a bug.
            debug_assert!(false, "add_client during shutdown");
            return Err(Status::Shutdown);
        }

        self.erase_disconnected_clients();

        let handle = self.client_ids.issue();
        let client_id = handle.id();

        // Until the handshake tells us more, assume SSL peers connect
        // from anywhere and plaintext peers from within our region.
        let flow_scope = if connection_type == ConnectionType::Ssl {
            LocationScope::Root
        } else {
            LocationScope::Region
        };

        let info = ConnectionInfo::new(Address::Client(client_id), peer_address, connection_type);
        let mut conn =
            Connection::new_incoming(info, transport, kind, flow_scope, handle, budget_token);

        let disconnected = self.disconnected_clients.clone();
        let stats = self.stats.clone();
        conn.push_on_close_callback(Box::new(move |_status, addr| {
            if let Address::Client(id) = addr {
                disconnected
                    .lock()
                    .expect("disconnected list poisoned")
                    .push_back(*id);
                stats
                    .client_connection_close_backlog
                    .fetch_add(1, Ordering::Relaxed);
            }
        }))
        .expect("fresh connection cannot be closed");

        if self.client_conns.insert(client_id, conn).is_some() {
            // The allocator guarantees uniqueness; a collision is a
            // programmer error.
            debug_assert!(false, "duplicate client id {client_id}");
            return Err(Status::AlreadyExists);
        }
        debug!(client = %client_id, "accepted client connection");
        Ok(client_id)
    }

    // ---------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------

    /// Route and send one message. The error carries the message back
    /// whenever the Sender did not take ownership, so a caller that got
    /// `CbRegistered` can retry the same message when its bandwidth
    /// callback fires.
    pub fn send_message(
        &mut self,
        msg: Message,
        addr: Address,
        on_bw_avail: Option<BwCallback>,
        on_close: Option<Box<dyn FnOnce(Status, &Address) + Send>>,
    ) -> Result<(), SendError> {
        if self.shutting_down {
            return Err(SendError::returned(Status::Shutdown, msg));
        }

        // Gossip connections carry only the gossip subset.
        if self.is_gossip_sender && !msg.msg_type().allowed_on_gossip() {
            warn!(
                msg_type = msg.msg_type().name(),
                "message not allowed on gossip sender"
            );
            return Err(SendError::returned(Status::Internal, msg));
        }

        let key = match self.resolve_connection(addr, &msg) {
            Ok(key) => key,
            Err(status) => return Err(SendError::returned(status, msg)),
        };
        let peer_idx = key.peer_index();

        if !msg.msg_type().is_handshake()
            && self.bytes_pending_limit_reached(peer_idx)
            && self
                .conn(&key)
                .map(|c| c.min_out_buf_limit_reached(&self.settings))
                .unwrap_or(false)
        {
            self.stats
                .send_failed_nobufs
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                peer = %addr,
                pending = self.bytes_pending_total,
                "outbuf limit reached"
            );
            return Err(SendError::returned(Status::NoBufs, msg));
        }

        // Register: the connection takes ownership and accounts cost.
        let conn = self.conn_mut(&key).expect("resolved above");
        let envelope = match conn.register_message(msg) {
            Ok(envelope) => envelope,
            Err((status, msg)) => return Err(SendError::returned(status, msg)),
        };
        if let Some(cb) = on_close {
            conn.push_on_close_callback(cb)
                .expect("open connection checked by register");
        }
        let cost = envelope.cost();
        let priority = envelope.priority();
        let scope = conn.flow_scope();
        self.note_bytes_queued(cost, peer_idx);

        // Error injection: silently lose the message. It stays parked
        // on the connection and no completion ever fires.
        if self.inject_drop(&envelope) {
            self.conn_mut(&key)
                .expect("resolved above")
                .leak_envelope(envelope);
            return Ok(());
        }

        let admitted =
            !self.inject_shaping() && self.shaping.group_mut(scope).try_drain(cost, priority);
        if admitted {
            // Serialization may fail late; the failure travels in the
            // completion, never as a panic.
            let completion = self
                .conn_mut(&key)
                .expect("resolved above")
                .release_message(envelope);
            self.note_bytes_drained(cost, peer_idx);
            self.queue_message_completion(completion);
            return Ok(());
        }

        // Shaped. Without a callback the flow group owns delivery and
        // the caller is done.
        if let Some(cb) = on_bw_avail {
            let msg = self
                .conn_mut(&key)
                .expect("resolved above")
                .discard_envelope(envelope);
            self.note_bytes_drained(cost, peer_idx);
            self.shaping.group_mut(scope).push_callback(cb, priority);
            return Err(SendError::returned(Status::CbRegistered, msg));
        }

        self.shaping
            .group_mut(scope)
            .push_envelope(DeferredEnvelope { addr, envelope });
        Ok(())
    }

    /// Predict whether a send at `tc` could go out now. A node without
    /// an established connection answers yes, because `send_message`
    /// will attempt to connect. When the answer is a shaping no, the
    /// callback is parked and `CbRegistered` returned.
    pub fn can_send_to(
        &mut self,
        addr: Address,
        tc: TrafficClass,
        on_bw_avail: BwCallback,
    ) -> Result<(), Status> {
        let key = match addr {
            Address::Client(id) => {
                if !self.client_conns.contains_key(&id) {
                    // With no inbound session the send must fail.
                    return Err(Status::Unreachable);
                }
                ConnKey::Client(id)
            }
            Address::Node(node) => {
                if !self.server_conns.contains_key(&node.index) {
                    return Ok(());
                }
                ConnKey::Node(node.index)
            }
        };

        let scope = match self.conn(&key) {
            Some(conn) if !conn.is_closed() => conn.flow_scope(),
            _ => return Err(Status::NotConn),
        };
        let priority = tc.priority();
        let group = self.shaping.group_mut(scope);
        if group.can_drain(priority) {
            Ok(())
        } else {
            group.push_callback(on_bw_avail, priority);
            Err(Status::CbRegistered)
        }
    }

    // ---------------------------------------------------------------
    // Connection resolution
    // ---------------------------------------------------------------

    fn conn(&self, key: &ConnKey) -> Option<&Connection> {
        match key {
            ConnKey::Node(idx) => self.server_conns.get(idx),
            ConnKey::Client(id) => self.client_conns.get(id),
        }
    }

    fn conn_mut(&mut self, key: &ConnKey) -> Option<&mut Connection> {
        match key {
            ConnKey::Node(idx) => self.server_conns.get_mut(idx),
            ConnKey::Client(id) => self.client_conns.get_mut(id),
        }
    }

    fn resolve_connection(&mut self, addr: Address, msg: &Message) -> Result<ConnKey, Status> {
        match addr {
            Address::Client(id) => {
                if self.client_conns.contains_key(&id) {
                    Ok(ConnKey::Client(id))
                } else {
                    Err(Status::Unreachable)
                }
            }
            Address::Node(node) => {
                let socket_type = if self.is_gossip_sender {
                    debug_assert!(msg.msg_type().allowed_on_gossip());
                    SocketType::Gossip
                } else {
                    SocketType::Data
                };
                let idx = self.init_server_connection(node, socket_type)?;
                let conn = self.server_conns.get_mut(&idx).expect("just initialized");
                match conn.connect() {
                    Ok(()) | Err(Status::Already) | Err(Status::IsConn) => {}
                    Err(status) => {
                        debug_assert!(matches!(
                            status,
                            Status::Unroutable
                                | Status::Disabled
                                | Status::SysLimit
                                | Status::NoMem
                                | Status::Internal
                                | Status::NotConn
                        ));
                        return Err(status);
                    }
                }
                // The connection is now either connecting or connected;
                // a second connect call observes exactly that.
                debug_assert!(matches!(
                    conn.connect(),
                    Err(Status::Already) | Err(Status::IsConn)
                ));
                Ok(ConnKey::Node(idx))
            }
        }
    }

    /// Find or (re)build the outgoing connection for `node`.
    fn init_server_connection(
        &mut self,
        node: NodeId,
        socket_type: SocketType,
    ) -> Result<NodeIndex, Status> {
        debug_assert!(!self.shutting_down);
        let idx = node.index;
        let discovery = match self.nodes.service_discovery(idx) {
            Some(discovery) => discovery.clone(),
            // If a connection exists but the node left the config, the
            // configuration-change pass will close it shortly.
            None => return Err(Status::NotInConfig),
        };

        if let Some(existing) = self.server_conns.get(&idx) {
            let should_replace = existing.is_closed()
                || (socket_type != SocketType::Gossip
                    && !existing.is_ssl()
                    && self.use_ssl_with(idx))
                || (socket_type == SocketType::Gossip
                    && existing.is_ssl() != self.settings.ssl_on_gossip_port);
            if should_replace {
                // Plaintext connection but policy now wants TLS (or the
                // gossip-port TLS mode flipped): retire it and build a
                // replacement in its place.
                let conn = self.server_conns.remove(&idx).expect("checked above");
                self.stats
                    .server_connection_close_backlog
                    .fetch_add(1, Ordering::Relaxed);
                self.retire_connection(conn, Status::SslRequired);
                self.stats
                    .server_connection_close_backlog
                    .fetch_sub(1, Ordering::Relaxed);
            } else {
                return Ok(idx);
            }
        }

        // Resolve the generation: callers may pass 0 for "current".
        let resolved = if node.generation == 0 {
            self.nodes.node_id(idx).ok_or(Status::NotInConfig)?
        } else {
            if self.nodes.node_generation(idx) != Some(node.generation) {
                return Err(Status::NotInConfig);
            }
            node
        };

        let flow_scope = if Some(idx) == self.my_node_index {
            LocationScope::Node
        } else {
            match (&self.my_location, &discovery.location) {
                (Some(mine), Some(theirs)) => mine.closest_shared_scope(theirs),
                // Cross-region links should use SSL and have locations
                // configured; assume same region otherwise.
                _ => LocationScope::Region,
            }
        };

        let mut use_ssl = self.use_ssl_with(idx);
        if socket_type == SocketType::Gossip {
            debug_assert!(self.is_gossip_sender);
            if self.settings.send_to_gossip_port {
                use_ssl = self.settings.ssl_on_gossip_port;
            }
        }

        let address = match socket_type {
            SocketType::Gossip => discovery
                .gossip_address
                .clone()
                .ok_or(Status::NotInConfig)?,
            SocketType::Data if use_ssl => discovery
                .ssl_address
                .clone()
                .unwrap_or_else(|| discovery.data_address.clone()),
            SocketType::Data => discovery.data_address.clone(),
        };

        let connection_type = if use_ssl {
            ConnectionType::Ssl
        } else {
            ConnectionType::Plain
        };
        let transport = self.connection_factory.create_transport(
            resolved,
            &address,
            connection_type,
            socket_type,
        )?;

        let mut info = ConnectionInfo::new(Address::Node(resolved), address, connection_type);
        info.peer_node_idx = Some(idx);
        let conn = Connection::new_outgoing(info, transport, socket_type, flow_scope);
        self.server_conns.insert(idx, conn);
        debug!(node = %resolved, ssl = use_ssl, "initialized server connection");
        Ok(idx)
    }

    /// Whether a link to `node` must be encrypted: it crosses the SSL
    /// boundary scope, or the cluster authenticates peers over TLS.
    fn use_ssl_with(&self, node: NodeIndex) -> bool {
        if self.settings.ssl_authentication {
            return true;
        }
        let boundary = self.settings.ssl_boundary;
        if boundary == LocationScope::Root {
            return false;
        }
        let theirs = self
            .nodes
            .service_discovery(node)
            .and_then(|sd| sd.location.clone());
        match (&self.my_location, theirs) {
            (Some(mine), Some(theirs)) => mine.crosses_boundary(&theirs, boundary),
            _ => false,
        }
    }

    fn bytes_pending_limit_reached(&self, peer_idx: usize) -> bool {
        let mut limit = self.settings.outbuf_limit_bytes();
        let per_peer = self.settings.server && self.settings.outbufs_limit_per_peer_type_enabled;
        let pending = if per_peer {
            limit /= 2;
            self.bytes_pending_by_peer[peer_idx]
        } else {
            self.bytes_pending_total
        };
        pending > limit
    }

    fn note_bytes_queued(&mut self, cost: usize, peer_idx: usize) {
        self.bytes_pending_total += cost;
        self.bytes_pending_by_peer[peer_idx] += cost;
    }

    fn note_bytes_drained(&mut self, cost: usize, peer_idx: usize) {
        debug_assert!(self.bytes_pending_total >= cost);
        self.bytes_pending_total = self.bytes_pending_total.saturating_sub(cost);
        self.bytes_pending_by_peer[peer_idx] =
            self.bytes_pending_by_peer[peer_idx].saturating_sub(cost);
    }

    fn inject_drop(&self, envelope: &Envelope) -> bool {
        let injection = &self.settings.error_injection;
        injection.status == Some(Status::Dropped)
            && !envelope.msg_type().is_handshake()
            && rand::random::<f64>() * 100.0 < injection.chance_percent
    }

    fn inject_shaping(&self) -> bool {
        let injection = &self.settings.error_injection;
        injection.status == Some(Status::CbRegistered)
            && rand::random::<f64>() * 100.0 < injection.chance_percent
    }

    // ---------------------------------------------------------------
    // Completions
    // ---------------------------------------------------------------

    /// Queue a completion and schedule the drain task once. The drain
    /// runs as a high-priority worker task; queuing from within the
    /// drain joins the already-scheduled pass instead of recursing.
    pub fn queue_message_completion(&mut self, completion: Completion) {
        self.completed_messages.push_back(completion);
        if !self.delivering_completed_messages.swap(true, Ordering::AcqRel) {
            self.handle.post_high_priority(Box::new(|sender: &mut Sender| {
                sender
                    .delivering_completed_messages
                    .store(false, Ordering::Release);
                sender.deliver_completed_messages();
            }));
        }
    }

    /// Drain the completion queue. Dropped silently while shutting
    /// down; the dispatch target is gone by then.
    pub fn deliver_completed_messages(&mut self) {
        let queue = std::mem::take(&mut self.completed_messages);
        for completion in queue {
            if !self.shutting_down {
                self.dispatch.on_sent(completion);
            }
        }
    }

    pub fn has_pending_completions(&self) -> bool {
        !self.completed_messages.is_empty()
    }

    // ---------------------------------------------------------------
    // Flow group replenishment
    // ---------------------------------------------------------------

    /// Shaping tick: convert elapsed time to tokens and release every
    /// deferred envelope that can now drain.
    pub fn run_flow_groups(&mut self) {
        let elapsed = self.last_replenish.elapsed();
        self.last_replenish = Instant::now();
        let released = self.shaping.replenish_all(elapsed.as_micros() as u64);

        for DeferredEnvelope { addr, envelope } in released {
            let key = match addr {
                Address::Node(node) => ConnKey::Node(node.index),
                Address::Client(id) => ConnKey::Client(id),
            };
            let peer_idx = key.peer_index();
            let cost = envelope.cost();
            match self.conn_mut(&key) {
                Some(conn) if !conn.is_closed() => {
                    let completion = conn.release_message(envelope);
                    self.note_bytes_drained(cost, peer_idx);
                    self.queue_message_completion(completion);
                }
                // Closed connections drop their deferred envelopes at
                // close time; a leftover here lost the race with close.
                _ => {
                    self.note_bytes_drained(cost, peer_idx);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Close and shutdown
    // ---------------------------------------------------------------

    /// Close one connection by address. The connection stays in its map
    /// (possibly as a zombie) until reclamation.
    pub fn close_connection(&mut self, addr: Address, reason: Status) -> Result<(), Status> {
        let key = match addr {
            Address::Node(node) => ConnKey::Node(node.index),
            Address::Client(id) => ConnKey::Client(id),
        };
        if self.conn(&key).is_none() {
            return Err(Status::NotFound);
        }
        self.close_in_place(&key, reason);
        Ok(())
    }

    /// Close a connection that is still inside one of the maps.
    fn close_in_place(&mut self, key: &ConnKey, reason: Status) {
        let addr = match self.conn(&key) {
            Some(conn) => conn.info().peer_name,
            None => return,
        };
        let peer_idx = key.peer_index();

        // First pull its deferred envelopes out of the flow groups and
        // turn them into completions with the close reason.
        let dropped = self.shaping.drop_for(addr);
        for envelope in dropped {
            let cost = envelope.cost();
            let conn = self.conn_mut(&key).expect("still present");
            let msg = conn.discard_envelope(envelope);
            self.note_bytes_drained(cost, peer_idx);
            self.queue_message_completion(Completion {
                msg,
                addr,
                status: reason,
                enqueue_time: Instant::now(),
            });
        }

        // Whatever is still accounted (leaked envelopes) dies silently
        // with the connection.
        let conn = self.conn_mut(&key).expect("still present");
        let remaining = conn.bytes_pending();
        conn.close(reason);
        self.note_bytes_drained(remaining, peer_idx);
    }

    /// Close a connection that was already moved out of the maps.
    fn retire_connection(&mut self, mut conn: Connection, reason: Status) {
        let addr = conn.info().peer_name;
        let peer_idx = if addr.is_node() { NODE_PEER } else { CLIENT_PEER };
        let dropped = self.shaping.drop_for(addr);
        for envelope in dropped {
            let cost = envelope.cost();
            let msg = conn.discard_envelope(envelope);
            self.note_bytes_drained(cost, peer_idx);
            self.queue_message_completion(Completion {
                msg,
                addr,
                status: reason,
                enqueue_time: Instant::now(),
            });
        }
        let remaining = conn.bytes_pending();
        conn.close(reason);
        self.note_bytes_drained(remaining, peer_idx);
    }

    pub fn close_all_sockets(&mut self) {
        let mut server_closed = 0u32;
        let server_keys: Vec<_> = self.server_conns.keys().copied().collect();
        for idx in server_keys {
            if !self.server_conns[&idx].is_closed() {
                server_closed += 1;
                self.close_in_place(&ConnKey::Node(idx), Status::Shutdown);
            }
        }
        let mut client_closed = 0u32;
        let client_keys: Vec<_> = self.client_conns.keys().copied().collect();
        for id in client_keys {
            if !self.client_conns[&id].is_closed() {
                client_closed += 1;
                self.close_in_place(&ConnKey::Client(id), Status::Shutdown);
            }
        }
        info!(
            server_closed,
            client_closed, "closed all sockets"
        );
    }

    /// Flush whatever is already handed to transports, notify clients
    /// on shutdown, and close everything.
    pub fn flush_output_and_close(&mut self, reason: Status) {
        let server_keys: Vec<_> = self.server_conns.keys().copied().collect();
        for idx in server_keys {
            if !self.server_conns[&idx].is_closed() {
                self.close_in_place(&ConnKey::Node(idx), reason);
            }
        }
        let client_keys: Vec<_> = self.client_conns.keys().copied().collect();
        for id in client_keys {
            if !self.client_conns[&id].is_closed() {
                if reason == Status::Shutdown {
                    self.client_conns
                        .get_mut(&id)
                        .expect("key collected above")
                        .send_shutdown();
                }
                self.close_in_place(&ConnKey::Client(id), reason);
            }
        }
    }

    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        self.flush_output_and_close(Status::Shutdown);
    }

    pub fn force_shutdown(&mut self) {
        if !self.shutting_down {
            warn!("force shutdown of Sender without graceful shutdown attempt");
            self.shutting_down = true;
        }
        self.close_all_sockets();
        self.server_conns.clear();
        self.client_conns.clear();
        self.completed_messages.clear();
    }

    pub fn is_shutdown_completed(&self) -> bool {
        self.server_conns.values().all(Connection::is_closed)
            && self.client_conns.values().all(Connection::is_closed)
    }

    // ---------------------------------------------------------------
    // Configuration changes
    // ---------------------------------------------------------------

    /// Install a new configuration snapshot and tear down connections
    /// whose peer moved, changed TLS address, or changed generation.
    /// Connections are moved out of the map before closing, because
    /// close callbacks may reenter the Sender and touch the map.
    pub fn note_configuration_changed(&mut self, nodes: Arc<NodesConfiguration>) {
        self.nodes = nodes;
        let outdated: Vec<NodeIndex> = self
            .server_conns
            .iter()
            .filter(|(_, conn)| conn.is_node_connection_outdated(&self.nodes))
            .map(|(idx, _)| *idx)
            .collect();
        for idx in outdated {
            let conn = self.server_conns.remove(&idx).expect("collected above");
            info!(node = idx, "closing connection: peer left the configuration");
            self.retire_connection(conn, Status::NotInConfig);
        }
    }

    pub fn nodes_configuration(&self) -> &Arc<NodesConfiguration> {
        &self.nodes
    }

    // ---------------------------------------------------------------
    // Health and reclamation
    // ---------------------------------------------------------------

    /// Periodic pass: classify every open connection, close the sick
    /// ones under per-pass rate limits, reclaim disconnected clients,
    /// and publish gauges.
    pub fn cleanup_connections(&mut self) {
        let settings = self.settings.clone();
        let mut num_sockets = 0u64;
        let mut active = 0u64;
        let mut stalled = 0u64;
        let mut idle = 0u64;
        let mut recv_slow = 0u64;
        let mut net_slow = 0u64;
        let mut unknown = 0u64;

        let mut slow_closures = 0usize;
        let mut to_close: Vec<(ConnKey, Status)> = Vec::new();
        let mut idle_closures = 0usize;
        let is_client_process = !settings.server;

        {
            let mut classify = |key: ConnKey, conn: &mut Connection| {
                if conn.is_closed() {
                    return;
                }
                num_sockets += 1;
                match conn.check_socket_health(&settings) {
                    SocketHealth::Active => active += 1,
                    SocketHealth::Idle => {
                        idle += 1;
                        // Only client processes shed idle outgoing
                        // connections; servers keep them warm.
                        if is_client_process
                            && matches!(key, ConnKey::Node(_))
                            && idle_closures < settings.rate_limit_idle_connection_closed
                        {
                            idle_closures += 1;
                            to_close.push((key, Status::Idle));
                        }
                    }
                    SocketHealth::Stalled => {
                        stalled += 1;
                        to_close.push((key, Status::Timedout));
                    }
                    SocketHealth::NetSlow => {
                        net_slow += 1;
                        if slow_closures < settings.rate_limit_socket_closed {
                            slow_closures += 1;
                            to_close.push((key, Status::Timedout));
                        }
                    }
                    SocketHealth::RecvSlow => recv_slow += 1,
                    SocketHealth::Unknown => unknown += 1,
                }
            };

            for (idx, conn) in &mut self.server_conns {
                classify(ConnKey::Node(*idx), conn);
            }
            for (id, conn) in &mut self.client_conns {
                classify(ConnKey::Client(*id), conn);
            }
        }

        let closed = to_close.len();
        for (key, reason) in to_close {
            self.close_in_place(&key, reason);
        }
        if closed > 0 {
            warn!(
                closed,
                stalled, net_slow, idle_closed = idle_closures, "cleanup closed connections"
            );
        }

        self.erase_disconnected_clients();

        let stats = &self.stats;
        stats.num_sockets.store(num_sockets, Ordering::Relaxed);
        stats.sock_active.store(active, Ordering::Relaxed);
        stats.sock_stalled.store(stalled, Ordering::Relaxed);
        stats.sock_app_limited.store(idle, Ordering::Relaxed);
        stats
            .sock_receiver_throttled
            .store(recv_slow, Ordering::Relaxed);
        stats
            .sock_network_throttled
            .store(net_slow, Ordering::Relaxed);
        stats.sock_idle.store(idle_closures as u64, Ordering::Relaxed);
        stats.sock_health_unknown.store(unknown, Ordering::Relaxed);
    }

    /// Reclaim closed inbound sessions. Zombies (still referenced via
    /// their liveness token) stay parked until the holders let go.
    pub fn erase_disconnected_clients(&mut self) {
        let pending: Vec<ClientId> = {
            let mut list = self
                .disconnected_clients
                .lock()
                .expect("disconnected list poisoned");
            list.drain(..).collect()
        };

        let mut still_zombie = Vec::new();
        for id in pending {
            match self.client_conns.get(&id) {
                Some(conn) => {
                    debug_assert!(conn.is_closed());
                    if conn.is_zombie() {
                        still_zombie.push(id);
                    } else {
                        // Dropping the connection releases the ClientId
                        // handle and the connection budget token.
                        self.client_conns.remove(&id);
                        self.stats
                            .client_connection_close_backlog
                            .fetch_sub(1, Ordering::Relaxed);
                    }
                }
                None => {
                    debug_assert!(false, "disconnected client {id} not in map");
                }
            }
        }
        if !still_zombie.is_empty() {
            let mut list = self
                .disconnected_clients
                .lock()
                .expect("disconnected list poisoned");
            for id in still_zombie {
                list.push_back(id);
            }
        }
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    pub fn is_closed(&self, addr: Address) -> bool {
        let key = match addr {
            Address::Node(node) => ConnKey::Node(node.index),
            Address::Client(id) => ConnKey::Client(id),
        };
        self.conn(&key).map(Connection::is_closed).unwrap_or(true)
    }

    pub fn connection_info(&self, addr: Address) -> Option<&ConnectionInfo> {
        let key = match addr {
            Address::Node(node) => ConnKey::Node(node.index),
            Address::Client(id) => ConnKey::Client(id),
        };
        self.conn(&key).map(Connection::info)
    }

    /// Replace a connection's descriptor, adjusting DSCP when the new
    /// principal calls for it.
    pub fn set_connection_info(&mut self, addr: Address, new_info: ConnectionInfo) -> bool {
        let dscp = self.detect_dscp(&new_info);
        let key = match addr {
            Address::Node(node) => ConnKey::Node(node.index),
            Address::Client(id) => ConnKey::Client(id),
        };
        let conn = match self.conn_mut(&key) {
            Some(conn) => conn,
            None => return false,
        };
        if let Some(dscp) = dscp {
            conn.set_dscp(dscp);
        }
        conn.set_info(new_info);
        true
    }

    /// DSCP only applies to inbound connections: per-principal override
    /// first, then the default for peer cluster nodes.
    fn detect_dscp(&self, info: &ConnectionInfo) -> Option<u8> {
        if !info.peer_name.is_client() {
            return None;
        }
        for (_, identity) in &info.principal.identities {
            if let Some(dscp) = self.settings.egress_dscp_per_principal.get(identity) {
                return Some(*dscp);
            }
        }
        if info.peer_node_idx.is_some() && self.settings.server_dscp_default != 0 {
            return Some(self.settings.server_dscp_default);
        }
        None
    }

    /// Liveness token for an inbound session, or `None` once closed.
    pub fn connection_token(&self, id: ClientId) -> Option<Arc<AtomicBool>> {
        let info = self.connection_info(Address::Client(id))?;
        if info.is_active.load(Ordering::Acquire) {
            Some(info.is_active.clone())
        } else {
            None
        }
    }

    pub fn reset_server_connect_throttle(&mut self, node: NodeIndex) {
        if let Some(conn) = self.server_conns.get_mut(&node) {
            conn.reset_connect_throttle();
        }
    }

    pub fn set_peer_shutting_down(&mut self, node: NodeIndex) {
        if let Some(conn) = self.server_conns.get_mut(&node) {
            conn.set_peer_shutting_down();
        }
    }

    /// Human-readable connection description for logs and admin output.
    pub fn describe_connection(&self, addr: Address) -> String {
        match self.connection_info(addr) {
            Some(info) => format!("{} ({})", addr, info.peer_address),
            None => format!("{} (disconnected)", addr),
        }
    }

    /// One debug row per connection, outgoing then inbound. This is the
    /// snapshot the admin debug endpoint serves.
    pub fn fill_debug_info(&self) -> Vec<ConnectionDebugRow> {
        let mut rows = Vec::new();
        for conn in self.server_conns.values() {
            rows.push(self.debug_row(conn));
        }
        for conn in self.client_conns.values() {
            rows.push(self.debug_row(conn));
        }
        rows
    }

    fn debug_row(&self, conn: &Connection) -> ConnectionDebugRow {
        let mut counts: BTreeMap<MessageType, usize> = BTreeMap::new();
        conn.dump_queued_messages(&mut counts);
        let state = if conn.is_zombie() {
            "zombie"
        } else if conn.is_closed() {
            "closed"
        } else {
            "open"
        };
        ConnectionDebugRow {
            description: self.describe_connection(conn.info().peer_name),
            state: state.to_string(),
            ssl: conn.is_ssl(),
            protocol: conn.info().protocol,
            bytes_pending: conn.bytes_pending(),
            queued_by_type: counts
                .into_iter()
                .map(|(msg_type, count)| (msg_type.name().to_string(), count))
                .collect(),
        }
    }

    /// JSON map of message type to queued count, for one address or for
    /// every connection.
    pub fn dump_queued_messages(&self, addr: Option<Address>) -> String {
        let mut counts: BTreeMap<MessageType, usize> = BTreeMap::new();
        match addr {
            Some(addr) => {
                let key = match addr {
                    Address::Node(node) => ConnKey::Node(node.index),
                    Address::Client(id) => ConnKey::Client(id),
                };
                match self.conn(&key) {
                    Some(conn) => conn.dump_queued_messages(&mut counts),
                    None => return "<connection not found>".to_string(),
                }
            }
            None => {
                for conn in self.server_conns.values() {
                    conn.dump_queued_messages(&mut counts);
                }
                for conn in self.client_conns.values() {
                    conn.dump_queued_messages(&mut counts);
                }
            }
        }
        let by_name: BTreeMap<&str, usize> =
            counts.iter().map(|(t, c)| (t.name(), *c)).collect();
        serde_json::to_string(&by_name).unwrap_or_else(|_| "{}".to_string())
    }
}
