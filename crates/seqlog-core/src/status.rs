//! Status Codes
//!
//! A single flat enumeration of every status the system reports, shared
//! by the transport, the buffered writer, the membership machinery and
//! the admin surface. Keeping one enum (instead of per-layer error
//! hierarchies) lets a status travel unchanged from the point of failure
//! to the user callback that eventually observes it.
//!
//! ## Categories
//!
//! - **Transport**: `NotConn`, `Unreachable`, `Timedout`, `PeerClosed`, ...
//! - **Backpressure**: `NoBufs`, and the `CbRegistered` sentinel which
//!   means "not sent now, a bandwidth callback will fire when it can be".
//! - **Protocol/data**: `BadMsg`, `Invalid`, `Internal`, `TooBig`.
//! - **Config/membership**: `NotInConfig`, `VersionMismatch`, `Uptodate`, ...
//! - **Application**: `Preempted`, `Redirected`, `NotReady`, ...

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat status code carried in every result and callback.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Error,
)]
pub enum Status {
    #[error("success")]
    Ok,

    // Transport
    #[error("not connected")]
    NotConn,
    #[error("peer unreachable")]
    Unreachable,
    #[error("no route to peer")]
    Unroutable,
    #[error("timed out")]
    Timedout,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("shutting down")]
    Shutdown,
    #[error("connection is idle")]
    Idle,
    #[error("ssl required for this peer")]
    SslRequired,
    #[error("no ssl configuration for this peer")]
    NoSslConfig,
    #[error("peer protocol version too old")]
    ProtoNoSupport,
    #[error("connection attempt failed")]
    ConnFailed,
    #[error("connection attempt already in progress")]
    Already,
    #[error("already connected")]
    IsConn,
    #[error("peer is disabled")]
    Disabled,
    #[error("system limit reached")]
    SysLimit,
    #[error("out of memory")]
    NoMem,

    // Backpressure
    #[error("output buffer limit reached")]
    NoBufs,
    #[error("bandwidth callback registered")]
    CbRegistered,
    #[error("message dropped")]
    Dropped,

    // Protocol / data
    #[error("malformed message")]
    BadMsg,
    #[error("invalid argument")]
    Invalid,
    #[error("internal error")]
    Internal,
    #[error("payload too big")]
    TooBig,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("not found")]
    NotFound,

    // Config / membership
    #[error("node is not in the configuration")]
    NotInConfig,
    #[error("no match in the configuration")]
    NoMatchInConfig,
    #[error("already exists")]
    AlreadyExists,
    #[error("version mismatch")]
    VersionMismatch,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("already up to date")]
    Uptodate,
    #[error("access denied")]
    Access,
    #[error("not supported")]
    NotSupported,

    // Application
    #[error("preempted by another sequencer")]
    Preempted,
    #[error("redirected to another node")]
    Redirected,
    #[error("not ready")]
    NotReady,
    #[error("version is stale")]
    Stale,
    #[error("aborted")]
    Aborted,
    #[error("try again")]
    Again,
}

impl Status {
    /// Short uppercase name, matching what shows up in logs and admin
    /// responses.
    pub fn name(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotConn => "NOTCONN",
            Status::Unreachable => "UNREACHABLE",
            Status::Unroutable => "UNROUTABLE",
            Status::Timedout => "TIMEDOUT",
            Status::PeerClosed => "PEER_CLOSED",
            Status::Shutdown => "SHUTDOWN",
            Status::Idle => "IDLE",
            Status::SslRequired => "SSLREQUIRED",
            Status::NoSslConfig => "NOSSLCONFIG",
            Status::ProtoNoSupport => "PROTONOSUPPORT",
            Status::ConnFailed => "CONNFAILED",
            Status::Already => "ALREADY",
            Status::IsConn => "ISCONN",
            Status::Disabled => "DISABLED",
            Status::SysLimit => "SYSLIMIT",
            Status::NoMem => "NOMEM",
            Status::NoBufs => "NOBUFS",
            Status::CbRegistered => "CBREGISTERED",
            Status::Dropped => "DROPPED",
            Status::BadMsg => "BADMSG",
            Status::Invalid => "INVALID",
            Status::Internal => "INTERNAL",
            Status::TooBig => "TOOBIG",
            Status::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Status::NotFound => "NOTFOUND",
            Status::NotInConfig => "NOTINCONFIG",
            Status::NoMatchInConfig => "NOMATCHINCONFIG",
            Status::AlreadyExists => "EXISTS",
            Status::VersionMismatch => "VERSION_MISMATCH",
            Status::InvalidParam => "INVALID_PARAM",
            Status::Uptodate => "UPTODATE",
            Status::Access => "ACCESS",
            Status::NotSupported => "NOTSUPPORTED",
            Status::Preempted => "PREEMPTED",
            Status::Redirected => "REDIRECTED",
            Status::NotReady => "NOTREADY",
            Status::Stale => "STALE",
            Status::Aborted => "ABORTED",
            Status::Again => "AGAIN",
        }
    }

    /// Whether a buffered-writer batch failure with this status is worth
    /// retrying. Permanent statuses fail the batch immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Status::Timedout
                | Status::NotConn
                | Status::ConnFailed
                | Status::PeerClosed
                | Status::NoBufs
                | Status::Again
                | Status::NotReady
                | Status::Preempted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Status::Timedout.is_transient());
        assert!(Status::Again.is_transient());
        assert!(!Status::Shutdown.is_transient());
        assert!(!Status::InvalidParam.is_transient());
        assert!(!Status::TooBig.is_transient());
    }

    #[test]
    fn test_names_are_stable() {
        assert_eq!(Status::VersionMismatch.name(), "VERSION_MISMATCH");
        assert_eq!(Status::NoBufs.name(), "NOBUFS");
        assert_eq!(Status::CbRegistered.name(), "CBREGISTERED");
    }

    #[test]
    fn test_serde_roundtrip() {
        let json = serde_json::to_string(&Status::NotInConfig).expect("serialize");
        let back: Status = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, Status::NotInConfig);
    }
}
