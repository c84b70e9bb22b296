//! SeqLog Net - Connections, Shaping and the Sender
//!
//! The per-worker networking stack. A `Worker` owns a `Sender`; the
//! Sender owns every `Connection` (outgoing per-node and accepted
//! per-client) plus the flow groups that shape outgoing traffic. All
//! state is confined to the worker's thread; cross-worker interaction
//! happens by posting closures onto the worker queue.
//!
//! The transport under each connection is abstracted (`Transport`), so
//! the full send path - registration, backpressure, shaping, deferred
//! release, completion delivery, health-based cleanup - runs unchanged
//! against an in-memory pipe in tests and a framed TCP stream in
//! production.

pub mod budget;
pub mod client_id;
pub mod connection;
pub mod flow_group;
pub mod info;
pub mod sender;
pub mod settings;
pub mod transport;
pub mod worker;

pub use budget::{BudgetToken, ResourceBudget};
pub use client_id::{ClientIdAllocator, ClientIdHandle};
pub use connection::{Completion, Connection, Envelope, SocketHealth};
pub use flow_group::{BwCallback, FlowGroup, ShapingContainer};
pub use info::{ConnectionInfo, ConnectionKind, ConnectionType, PrincipalIdentity, SocketType};
pub use sender::{
    ConnectionDebugRow, ConnectionFactory, MessageDispatch, SendError, Sender, SenderStats,
};
pub use settings::{BucketPolicy, ErrorInjection, NetSettings, ShapingConfig};
pub use transport::{MockTransport, TcpTransport, Transport, TransportState};
pub use worker::{worker_channel, Task, Worker, WorkerHandle, WorkerQueues};
