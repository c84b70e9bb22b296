//! Membership Error Types
//!
//! Every failure of an `apply_update` or store round-trip maps onto one
//! of these variants; `status()` flattens them back to the shared
//! `Status` code for wire and admin surfaces.

use seqlog_core::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("version mismatch: update base {base}, current {current}")]
    VersionMismatch { base: u64, current: u64 },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no match in config: {0}")]
    NoMatchInConfig(String),

    #[error("configuration is already up to date")]
    Uptodate,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config store error: {0}")]
    Store(Status),
}

impl MembershipError {
    pub fn status(&self) -> Status {
        match self {
            MembershipError::InvalidParam(_) => Status::InvalidParam,
            MembershipError::VersionMismatch { .. } => Status::VersionMismatch,
            MembershipError::AlreadyExists(_) => Status::AlreadyExists,
            MembershipError::NoMatchInConfig(_) => Status::NoMatchInConfig,
            MembershipError::Uptodate => Status::Uptodate,
            MembershipError::Codec(_) => Status::Invalid,
            MembershipError::Store(status) => *status,
        }
    }
}

pub type Result<T> = std::result::Result<T, MembershipError>;
