//! Transport Abstraction
//!
//! A `Transport` is the byte pipe under one `Connection`: it accepts
//! complete outgoing frames and reports coarse state and send-buffer
//! occupancy for health classification. The connection state machine
//! above it is transport-agnostic, which is what lets the whole Sender
//! stack run against an in-memory pipe in tests.
//!
//! `TcpTransport` is the production implementation: a spawned writer
//! task owns the socket, frames go over an unbounded channel, and
//! queued-byte accounting is shared through atomics.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use seqlog_core::{FrameCodec, Status};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tracing::{debug, warn};

/// Coarse transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl TransportState {
    fn from_u8(v: u8) -> TransportState {
        match v {
            0 => TransportState::Idle,
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            _ => TransportState::Closed,
        }
    }
}

pub trait Transport: Send {
    /// Begin connecting. Returns `Already` while a connect is in
    /// progress and `IsConn` when already connected.
    fn start_connect(&mut self) -> Result<(), Status>;

    fn state(&self) -> TransportState;

    /// Hand one serialized frame to the transport. The transport owns
    /// delivery order; frames go out in the order they are given.
    fn send_frame(&mut self, frame: Bytes) -> Result<(), Status>;

    /// Configured send buffer size, when known.
    fn send_buf_size(&self) -> Option<usize>;

    /// Bytes accepted but not yet written to the network, when known.
    fn send_buf_occupancy(&self) -> Option<usize>;

    fn set_dscp(&mut self, _dscp: u8) {}

    fn close(&mut self);
}

/// TCP transport: a writer task owns the stream; `send_frame` enqueues.
pub struct TcpTransport {
    target: String,
    state: Arc<AtomicU8>,
    queued_bytes: Arc<AtomicUsize>,
    send_buf_size: usize,
    frame_tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl TcpTransport {
    pub fn new(target: String, send_buf_size: usize) -> Self {
        Self {
            target,
            state: Arc::new(AtomicU8::new(TransportState::Idle as u8)),
            queued_bytes: Arc::new(AtomicUsize::new(0)),
            send_buf_size,
            frame_tx: None,
        }
    }
}

impl Transport for TcpTransport {
    fn start_connect(&mut self) -> Result<(), Status> {
        match self.state() {
            TransportState::Connecting => return Err(Status::Already),
            TransportState::Connected => return Err(Status::IsConn),
            TransportState::Closed => return Err(Status::NotConn),
            TransportState::Idle => {}
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        self.frame_tx = Some(tx);
        self.state
            .store(TransportState::Connecting as u8, Ordering::Release);

        let target = self.target.clone();
        let state = self.state.clone();
        let queued = self.queued_bytes.clone();
        tokio::spawn(async move {
            let stream = match TcpStream::connect(&target).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(target = %target, error = %e, "connect failed");
                    state.store(TransportState::Closed as u8, Ordering::Release);
                    return;
                }
            };
            debug!(target = %target, "connected");
            state.store(TransportState::Connected as u8, Ordering::Release);

            let mut framed = FramedWrite::new(stream, FrameCodec::new());
            while let Some(frame) = rx.recv().await {
                let len = frame.len();
                if let Err(e) = framed.send(frame).await {
                    warn!(target = %target, error = %e, "write failed");
                    break;
                }
                queued.fetch_sub(len, Ordering::AcqRel);
            }
            state.store(TransportState::Closed as u8, Ordering::Release);
        });
        Ok(())
    }

    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn send_frame(&mut self, frame: Bytes) -> Result<(), Status> {
        match self.state() {
            TransportState::Closed => return Err(Status::NotConn),
            TransportState::Idle => return Err(Status::NotConn),
            _ => {}
        }
        let tx = self.frame_tx.as_ref().ok_or(Status::NotConn)?;
        self.queued_bytes.fetch_add(frame.len(), Ordering::AcqRel);
        tx.send(frame).map_err(|_| Status::PeerClosed)
    }

    fn send_buf_size(&self) -> Option<usize> {
        Some(self.send_buf_size)
    }

    fn send_buf_occupancy(&self) -> Option<usize> {
        Some(self.queued_bytes.load(Ordering::Acquire))
    }

    fn close(&mut self) {
        self.frame_tx = None; // writer task drains and exits
        self.state
            .store(TransportState::Closed as u8, Ordering::Release);
    }
}

/// In-memory transport used by unit and integration tests. Frames are
/// collected for inspection; state and occupancy are scriptable.
pub struct MockTransport {
    pub state: TransportState,
    pub frames: Vec<Bytes>,
    pub send_buf_size: Option<usize>,
    pub occupancy: Option<usize>,
    /// Next `send_frame` fails with this status.
    pub fail_next_send: Option<Status>,
    /// `start_connect` fails with this status.
    pub fail_connect: Option<Status>,
    /// Connect completes synchronously when true.
    pub connect_immediately: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: TransportState::Idle,
            frames: Vec::new(),
            send_buf_size: None,
            occupancy: None,
            fail_next_send: None,
            fail_connect: None,
            connect_immediately: true,
        }
    }

    pub fn connected() -> Self {
        Self {
            state: TransportState::Connected,
            ..Self::new()
        }
    }
}

impl Transport for MockTransport {
    fn start_connect(&mut self) -> Result<(), Status> {
        if let Some(status) = self.fail_connect {
            return Err(status);
        }
        match self.state {
            TransportState::Connecting => Err(Status::Already),
            TransportState::Connected => Err(Status::IsConn),
            TransportState::Closed => Err(Status::NotConn),
            TransportState::Idle => {
                self.state = if self.connect_immediately {
                    TransportState::Connected
                } else {
                    TransportState::Connecting
                };
                Ok(())
            }
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn send_frame(&mut self, frame: Bytes) -> Result<(), Status> {
        if let Some(status) = self.fail_next_send.take() {
            return Err(status);
        }
        if matches!(self.state, TransportState::Closed | TransportState::Idle) {
            return Err(Status::NotConn);
        }
        self.frames.push(frame);
        Ok(())
    }

    fn send_buf_size(&self) -> Option<usize> {
        self.send_buf_size
    }

    fn send_buf_occupancy(&self) -> Option<usize> {
        self.occupancy
    }

    fn close(&mut self) {
        self.state = TransportState::Closed;
    }
}
