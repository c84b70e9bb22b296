//! Connection State Machine
//!
//! One `Connection` is one framed, ordered transport to one peer. It
//! owns the outbuf accounting, the close-callback list, the handshake
//! state, and the health bookkeeping the Sender's cleanup pass reads.
//!
//! Sending is two-phase. `register_message` accepts ownership of a
//! message, accounts its serialized cost and returns an `Envelope`;
//! `release_message` performs the real serialization and hands the
//! frame to the transport. Between the two, the envelope may be parked
//! in a flow group (shaping) or discarded (ownership returned to the
//! caller). This split is what allows cost accounting and backpressure
//! decisions before any bytes are produced.
//!
//! Close is idempotent: the first `close(reason)` flips the liveness
//! token, tears down the transport and fires the on-close callbacks in
//! registration order. A closed connection whose liveness token is
//! still held elsewhere is a zombie; the owner map keeps it until the
//! last holder lets go.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use seqlog_core::wire::MAX_MESSAGE_LEN;
use seqlog_core::{Address, LocationScope, Message, MessageType, Priority, Status};
use tracing::{debug, trace};

use crate::budget::BudgetToken;
use crate::client_id::ClientIdHandle;
use crate::info::{ConnectionInfo, ConnectionKind, SocketType};
use crate::settings::NetSettings;
use crate::transport::{Transport, TransportState};

pub use seqlog_core::wire::HEADER_LEN;

/// A registered message: ownership of the message plus its recorded
/// serialized cost and priority, captured at registration time.
#[derive(Debug)]
pub struct Envelope {
    msg: Message,
    cost: usize,
    priority: Priority,
    enqueue_time: Instant,
}

impl Envelope {
    fn new(msg: Message) -> Self {
        let cost = msg.cost();
        let priority = msg.priority();
        Self {
            msg,
            cost,
            priority,
            enqueue_time: Instant::now(),
        }
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg.msg_type()
    }

    #[cfg(test)]
    pub(crate) fn for_test(msg: Message) -> Self {
        Self::new(msg)
    }
}

/// Record of one finished send attempt, delivered to `on_sent` via the
/// Sender's completion queue.
pub struct Completion {
    pub msg: Message,
    pub addr: Address,
    pub status: Status,
    pub enqueue_time: Instant,
}

/// Health classification produced by the periodic cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketHealth {
    Active,
    Idle,
    Stalled,
    NetSlow,
    RecvSlow,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    NotStarted,
    HelloSent,
    Done,
}

pub struct Connection {
    info: ConnectionInfo,
    transport: Box<dyn Transport>,
    socket_type: SocketType,
    kind: ConnectionKind,
    /// Location scope whose flow group shapes this connection.
    flow_scope: LocationScope,
    handshake: HandshakeState,
    closed: Option<Status>,
    peer_shutting_down: bool,

    /// Serialized cost of registered-but-unreleased messages.
    bytes_pending: usize,
    /// Per-type counts of registered messages, for debug dumps.
    queued_by_type: BTreeMap<MessageType, usize>,
    /// Envelopes deliberately leaked by error injection. They hold
    /// their cost until close.
    leaked: Vec<Envelope>,

    on_close: Vec<Box<dyn FnOnce(Status, &Address) + Send>>,

    last_activity: Instant,
    last_progress: Instant,

    /// Connect attempts are throttled after failures.
    connect_failures: u32,
    connect_blocked_until: Option<Instant>,

    /// Rides along for inbound connections; released on reclamation.
    client_id_handle: Option<ClientIdHandle>,
    /// Connection-count budget unit, returned when the connection is
    /// reclaimed.
    _budget_token: Option<BudgetToken>,
}

impl Connection {
    pub fn new_outgoing(
        info: ConnectionInfo,
        transport: Box<dyn Transport>,
        socket_type: SocketType,
        flow_scope: LocationScope,
    ) -> Self {
        Self::new(
            info,
            transport,
            socket_type,
            ConnectionKind::Data,
            flow_scope,
            None,
            None,
        )
    }

    pub fn new_incoming(
        info: ConnectionInfo,
        transport: Box<dyn Transport>,
        kind: ConnectionKind,
        flow_scope: LocationScope,
        client_id_handle: ClientIdHandle,
        budget_token: Option<BudgetToken>,
    ) -> Self {
        Self::new(
            info,
            transport,
            SocketType::Data,
            kind,
            flow_scope,
            Some(client_id_handle),
            budget_token,
        )
    }

    fn new(
        info: ConnectionInfo,
        transport: Box<dyn Transport>,
        socket_type: SocketType,
        kind: ConnectionKind,
        flow_scope: LocationScope,
        client_id_handle: Option<ClientIdHandle>,
        budget_token: Option<BudgetToken>,
    ) -> Self {
        let now = Instant::now();
        Self {
            info,
            transport,
            socket_type,
            kind,
            flow_scope,
            handshake: HandshakeState::NotStarted,
            closed: None,
            peer_shutting_down: false,
            bytes_pending: 0,
            queued_by_type: BTreeMap::new(),
            leaked: Vec::new(),
            on_close: Vec::new(),
            last_activity: now,
            last_progress: now,
            connect_failures: 0,
            connect_blocked_until: None,
            client_id_handle,
            _budget_token: budget_token,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn set_info(&mut self, info: ConnectionInfo) {
        self.info = info;
    }

    pub fn set_dscp(&mut self, dscp: u8) {
        self.transport.set_dscp(dscp);
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn flow_scope(&self) -> LocationScope {
        self.flow_scope
    }

    /// The session id this inbound connection is keyed by.
    pub fn client_id(&self) -> Option<seqlog_core::ClientId> {
        self.client_id_handle.as_ref().map(|h| h.id())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Closed, but the liveness token still has outside holders. The
    /// owner map must not reclaim a zombie; the holders' references
    /// would dangle logically.
    pub fn is_zombie(&self) -> bool {
        self.is_closed() && Arc::strong_count(&self.info.is_active) > 1
    }

    pub fn is_ssl(&self) -> bool {
        self.info.is_ssl()
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshake == HandshakeState::Done
    }

    pub fn note_handshake_sent(&mut self) {
        if self.handshake == HandshakeState::NotStarted {
            self.handshake = HandshakeState::HelloSent;
        }
    }

    pub fn note_handshake_done(&mut self, protocol: u16, our_name: Option<seqlog_core::ClientId>) {
        self.handshake = HandshakeState::Done;
        self.info.protocol = Some(protocol);
        self.info.our_name_at_peer = our_name;
    }

    pub fn set_peer_shutting_down(&mut self) {
        self.peer_shutting_down = true;
    }

    pub fn peer_shutting_down(&self) -> bool {
        self.peer_shutting_down
    }

    /// Begin (or re-check) connecting the underlying transport.
    pub fn connect(&mut self) -> Result<(), Status> {
        if self.is_closed() {
            return Err(Status::NotConn);
        }
        if let Some(until) = self.connect_blocked_until {
            if Instant::now() < until {
                return Err(Status::Disabled);
            }
        }
        match self.transport.state() {
            TransportState::Connecting => Err(Status::Already),
            TransportState::Connected => Err(Status::IsConn),
            _ => match self.transport.start_connect() {
                Ok(()) => {
                    self.last_activity = Instant::now();
                    Ok(())
                }
                Err(status @ (Status::Already | Status::IsConn)) => Err(status),
                Err(status) => {
                    self.connect_failures += 1;
                    // Exponential backoff, capped at a minute.
                    let delay_ms = (100u64 << self.connect_failures.min(10)).min(60_000);
                    self.connect_blocked_until =
                        Some(Instant::now() + std::time::Duration::from_millis(delay_ms));
                    Err(status)
                }
            },
        }
    }

    pub fn reset_connect_throttle(&mut self) {
        self.connect_failures = 0;
        self.connect_blocked_until = None;
    }

    /// Accept ownership of a message and account its cost. On failure
    /// ownership goes back to the caller along with the status.
    pub fn register_message(&mut self, msg: Message) -> Result<Envelope, (Status, Message)> {
        if self.is_closed() {
            return Err((Status::NotConn, msg));
        }
        let msg_type = msg.msg_type();
        if !msg_type.is_handshake() {
            if let Some(protocol) = self.info.protocol {
                // Peers below the minimum protocol cannot parse
                // anything beyond the handshake.
                if protocol < seqlog_core::wire::MIN_PROTOCOL {
                    return Err((Status::ProtoNoSupport, msg));
                }
            }
        }
        let envelope = Envelope::new(msg);
        if envelope.cost() > MAX_MESSAGE_LEN + HEADER_LEN {
            let Envelope { msg, .. } = envelope;
            return Err((Status::TooBig, msg));
        }
        self.bytes_pending += envelope.cost();
        *self.queued_by_type.entry(msg_type).or_insert(0) += 1;
        trace!(
            peer = %self.info.peer_name,
            msg_type = msg_type.name(),
            cost = envelope.cost(),
            "registered message"
        );
        Ok(envelope)
    }

    /// Serialize and hand the frame to the transport. Serialization
    /// failures surface in the returned completion, not as a panic;
    /// the envelope's cost is released either way.
    pub fn release_message(&mut self, envelope: Envelope) -> Completion {
        let Envelope {
            msg,
            cost,
            priority: _,
            enqueue_time,
        } = envelope;
        self.account_drained(cost, msg.msg_type());

        let status = match msg.encode() {
            Ok(frame) => self.send_frame(frame),
            Err(status) => Err(status),
        };
        if msg.msg_type().is_handshake() && status.is_ok() {
            self.note_handshake_sent();
        }

        Completion {
            msg,
            addr: self.info.peer_name,
            status: status.err().unwrap_or(Status::Ok),
            enqueue_time,
        }
    }

    fn send_frame(&mut self, frame: Bytes) -> Result<(), Status> {
        self.transport.send_frame(frame)?;
        let now = Instant::now();
        self.last_activity = now;
        self.last_progress = now;
        Ok(())
    }

    /// Return ownership of a registered message to the caller.
    pub fn discard_envelope(&mut self, envelope: Envelope) -> Message {
        self.account_drained(envelope.cost, envelope.msg.msg_type());
        envelope.msg
    }

    /// Park an envelope forever; models an injected message drop. The
    /// cost stays accounted until close, like a message stuck in the
    /// pending queue.
    pub fn leak_envelope(&mut self, envelope: Envelope) {
        debug!(
            peer = %self.info.peer_name,
            msg_type = envelope.msg_type().name(),
            "dropping message by error injection"
        );
        self.leaked.push(envelope);
    }

    fn account_drained(&mut self, cost: usize, msg_type: MessageType) {
        debug_assert!(self.bytes_pending >= cost);
        self.bytes_pending = self.bytes_pending.saturating_sub(cost);
        if let Some(count) = self.queued_by_type.get_mut(&msg_type) {
            *count -= 1;
            if *count == 0 {
                self.queued_by_type.remove(&msg_type);
            }
        }
    }

    pub fn push_on_close_callback(
        &mut self,
        cb: Box<dyn FnOnce(Status, &Address) + Send>,
    ) -> Result<(), Status> {
        if self.is_closed() {
            return Err(Status::NotConn);
        }
        self.on_close.push(cb);
        Ok(())
    }

    /// Idempotent close: flips the liveness token, releases the
    /// transport and fires close callbacks in registration order.
    /// Leaked envelopes die silently; their cost is released.
    pub fn close(&mut self, reason: Status) {
        if self.is_closed() {
            return;
        }
        debug!(peer = %self.info.peer_name, reason = reason.name(), "closing connection");
        self.closed = Some(reason);
        self.info.is_active.store(false, Ordering::Release);
        self.transport.close();

        for envelope in self.leaked.drain(..).collect::<Vec<_>>() {
            let Envelope { msg, cost, .. } = envelope;
            let msg_type = msg.msg_type();
            self.account_drained(cost, msg_type);
        }

        let addr = self.info.peer_name;
        for cb in self.on_close.drain(..) {
            cb(reason, &addr);
        }
    }

    pub fn close_reason(&self) -> Option<Status> {
        self.closed
    }

    /// Best effort flush-then-close; the transport finishes writing
    /// whatever was already handed over before releasing the socket.
    pub fn flush_output_and_close(&mut self, reason: Status) {
        self.close(reason);
    }

    /// Tell the peer we are going away, then close.
    pub fn send_shutdown(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Ok(envelope) = self.register_message(Message::ShutdownNotice) {
            let _ = self.release_message(envelope);
        }
    }

    pub fn bytes_pending(&self) -> usize {
        self.bytes_pending
    }

    /// The worker-wide outbuf limit only applies once a connection has
    /// at least this much of its own backlog, so one busy peer cannot
    /// starve everyone else's small sends.
    pub fn min_out_buf_limit_reached(&self, settings: &NetSettings) -> bool {
        self.bytes_pending >= settings.min_out_buf_bytes
    }

    pub fn tcp_send_buf_size(&self) -> Option<usize> {
        self.transport.send_buf_size()
    }

    pub fn tcp_send_buf_occupancy(&self) -> Option<usize> {
        self.transport.send_buf_occupancy()
    }

    /// No traffic in either direction since `watermark`.
    pub fn is_idle_after(&self, watermark: Instant) -> bool {
        self.last_activity < watermark
    }

    pub fn note_inbound_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Classify drain health for the cleanup pass.
    pub fn check_socket_health(&mut self, settings: &NetSettings) -> SocketHealth {
        if self.is_closed() {
            return SocketHealth::Unknown;
        }

        let occupancy = self.transport.send_buf_occupancy();
        let backlog = self.bytes_pending + occupancy.unwrap_or(0);
        if backlog == 0 {
            self.last_progress = Instant::now();
            let idle = Instant::now()
                .checked_sub(settings.idle_connection_keep_alive)
                .map(|watermark| self.is_idle_after(watermark))
                .unwrap_or(false);
            return if idle {
                SocketHealth::Idle
            } else {
                SocketHealth::Active
            };
        }

        // There is output waiting. Progress recency decides.
        let since_progress = self.last_progress.elapsed();
        if since_progress < settings.socket_slow_threshold {
            return SocketHealth::Active;
        }
        if since_progress >= settings.socket_stall_threshold {
            return SocketHealth::Stalled;
        }
        match (occupancy, self.transport.send_buf_size()) {
            // Send buffer full: the receiver is not reading.
            (Some(occ), Some(size)) if occ >= size => SocketHealth::RecvSlow,
            (Some(_), _) => SocketHealth::NetSlow,
            (None, _) => SocketHealth::Unknown,
        }
    }

    /// Stale against a fresh configuration: the node moved, changed its
    /// gossip or SSL address, or was replaced (generation bump).
    pub fn is_node_connection_outdated(
        &self,
        config: &seqlog_membership::NodesConfiguration,
    ) -> bool {
        let node_id = match self.info.peer_name.as_node() {
            Some(id) => id,
            None => return false,
        };
        let discovery = match config.service_discovery(node_id.index) {
            Some(sd) => sd,
            None => return true,
        };
        if config.node_generation(node_id.index) != Some(node_id.generation) {
            return true;
        }
        let current = match self.socket_type {
            SocketType::Gossip => discovery.gossip_address.as_ref(),
            SocketType::Data if self.is_ssl() => {
                Some(discovery.ssl_address.as_ref().unwrap_or(&discovery.data_address))
            }
            SocketType::Data => Some(&discovery.data_address),
        };
        match current {
            Some(addr) => *addr != self.info.peer_address,
            None => true,
        }
    }

    /// Per-type counts of registered-but-unsent messages.
    pub fn dump_queued_messages(&self, counts: &mut BTreeMap<MessageType, usize>) {
        for (msg_type, count) in &self.queued_by_type {
            *counts.entry(*msg_type).or_insert(0) += count;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close(Status::Shutdown);
        }
        // client_id_handle and budget_token release on drop.
    }
}
