//! Error taxonomy shared by the dispatcher and its callers.
//!
//! Two families exist. [`SchedError`] is returned synchronously from submission
//! and never produces a callback. [`OpError`] is what a completion callback sees
//! once a packet reaches its terminal state; it carries the [`ErrorKind`] that
//! actually ended the operation plus the number of retries that were spent.

use thiserror::Error;

use crate::partition::LocateError;
use crate::protocol::Status;
use crate::subdoc::SubdocOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    #[error("key not found")]
    KeyNotFound,
    #[error("key exists with a different CAS")]
    KeyExists,
    #[error("item not stored")]
    NotStored,
    #[error("value too large for server")]
    TooBig,
    #[error("server rejected arguments")]
    InvalidArguments,
    #[error("existing value is not a counter")]
    DeltaBadValue,
    #[error("node does not own the partition")]
    NotMyPartition,
    #[error("temporary failure on server")]
    TemporaryFailure,
    #[error("server busy")]
    Busy,
    #[error("server out of memory")]
    ServerOutOfMemory,
    #[error("command not supported by server")]
    NotSupported,
    #[error("internal server error")]
    ServerInternal,
    #[error("unexpected server status 0x{0:04x}")]
    UnknownStatus(u16),
    #[error("no node currently owns the partition")]
    NoOwner,
    #[error("cluster map changed underneath the operation")]
    MapChanged,
    #[error("operation timed out")]
    Timeout,
    #[error("network error")]
    Network,
    #[error("connection could not be established")]
    ConnectFailed,
    #[error("malformed response from server")]
    Protocol,
    #[error("mutation lost after failover")]
    MutationLost,
    #[error("path not found in document")]
    SubdocPathNotFound,
    #[error("path already exists in document")]
    SubdocPathExists,
    #[error("path does not match the document structure")]
    SubdocPathMismatch,
    #[error("path syntax is invalid")]
    SubdocPathInvalid,
    #[error("value cannot be applied at path")]
    SubdocValueRejected,
    #[error("one or more paths of a multi-path operation failed")]
    SubdocMultiFailure,
}

impl ErrorKind {
    /// Maps a response status to the error it represents, `None` for success.
    pub fn from_status(status: Status) -> Option<Self> {
        let kind = match status {
            Status::Success => return None,
            Status::KeyNotFound => Self::KeyNotFound,
            Status::KeyExists => Self::KeyExists,
            Status::TooBig => Self::TooBig,
            Status::Invalid => Self::InvalidArguments,
            Status::NotStored => Self::NotStored,
            Status::DeltaBadValue => Self::DeltaBadValue,
            Status::NotMyPartition => Self::NotMyPartition,
            // An auth failure on an established connection means the node is gone.
            Status::AuthError | Status::AuthContinue => Self::MapChanged,
            Status::UnknownCommand | Status::NotSupported => Self::NotSupported,
            Status::OutOfMemory => Self::ServerOutOfMemory,
            Status::Internal => Self::ServerInternal,
            Status::Busy => Self::Busy,
            Status::TemporaryFailure => Self::TemporaryFailure,
            Status::SubdocPathNotFound => Self::SubdocPathNotFound,
            Status::SubdocPathExists => Self::SubdocPathExists,
            Status::SubdocPathMismatch => Self::SubdocPathMismatch,
            Status::SubdocPathInvalid => Self::SubdocPathInvalid,
            Status::SubdocValueCannotInsert | Status::SubdocDocNotJson | Status::SubdocNumRange => {
                Self::SubdocValueRejected
            }
            Status::SubdocMultiPathFailure => Self::SubdocMultiFailure,
            Status::Other(code) => Self::UnknownStatus(code),
        };
        Some(kind)
    }

    /// Definitive answers about the data itself. Never retried.
    pub fn is_application(self) -> bool {
        matches!(
            self,
            Self::KeyNotFound
                | Self::KeyExists
                | Self::NotStored
                | Self::TooBig
                | Self::InvalidArguments
                | Self::DeltaBadValue
                | Self::NotSupported
                | Self::MutationLost
                | Self::SubdocPathNotFound
                | Self::SubdocPathExists
                | Self::SubdocPathMismatch
                | Self::SubdocPathInvalid
                | Self::SubdocValueRejected
                | Self::SubdocMultiFailure
        )
    }

    /// Failures of the connection rather than of the command; the server may or
    /// may not have applied a command that was already written.
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            Self::Network | Self::ConnectFailed | Self::Protocol | Self::MapChanged
        )
    }

    /// The server answered and stated that it did not execute the command.
    pub fn is_server_backoff(self) -> bool {
        matches!(self, Self::TemporaryFailure | Self::Busy)
    }
}

/// Terminal failure delivered to a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} (after {retries} retries)")]
pub struct OpError {
    pub kind: ErrorKind,
    pub retries: u32,
}

/// Synchronous submission failures. No callback is ever invoked for these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("key of {len} bytes exceeds limit of {max}")]
    KeyTooLong { len: usize, max: usize },
    #[error("value of {len} bytes exceeds limit of {max}")]
    ValueTooLarge { len: usize, max: usize },
    #[error("path must not be empty for {op:?}")]
    EmptyPath { op: SubdocOp },
    #[error("path of {len} bytes exceeds limit of {max}")]
    PathTooLong { len: usize, max: usize },
    #[error("sub-document request carries no paths")]
    NoSubdocSpecs,
    #[error("{op:?} cannot be combined with the other paths of this request")]
    MixedSubdocSpecs { op: SubdocOp },
    #[error("no cluster topology available yet")]
    NoTopology,
    #[error("no node currently owns partition {partition}")]
    NoOwner { partition: u16 },
    #[error("server index {index} out of range for {count} nodes")]
    InvalidServer { index: usize, count: usize },
    #[error("replica {index} of partition {partition} is not available")]
    NoReplica { partition: u16, index: usize },
    #[error("operation not supported by the cluster distribution mode")]
    NotSupported,
    #[error("durability requirements exceed the cluster's {replicas} replicas")]
    DurabilityTooDemanding { replicas: usize },
    #[error("durability request carries no mutation tokens")]
    NoMutationTokens,
    #[error("a scheduling context is already open")]
    NestedContext,
    #[error("no scheduling context is open")]
    NoContext,
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl From<LocateError> for SchedError {
    fn from(err: LocateError) -> Self {
        match err {
            LocateError::NoNodes => SchedError::NoTopology,
            LocateError::NoOwner { partition } => SchedError::NoOwner { partition },
            LocateError::NoReplica { partition, index } => SchedError::NoReplica { partition, index },
            LocateError::Unsupported => SchedError::NotSupported,
        }
    }
}
