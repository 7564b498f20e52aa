use std::{fmt, io};

use crate::types::Gid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Invalid topology, assigner or registry parameters.
    Config(String),
    /// A gid that no worker owns, or that was routed to the wrong worker.
    NoRoute(Gid),
    /// A gid or local id that isn't registered with this master.
    UnknownBlock(Gid),
    /// A block finished its callback without reading everything sent to it.
    UndrainedQueue { gid: Gid, from: Gid },
    /// A block enqueued to a gid outside of its declared outgoing partners.
    UnexpectedTarget { round: usize, from: Gid, to: Gid },
    /// Dequeue from a source that has nothing (left) for this block.
    EmptyQueue { gid: Gid, from: Gid },
    /// Participants posted different numbers or kinds of collectives.
    CollectiveMismatch(String),
    CollectiveUnresolved(Gid),
    CollectiveTypeMismatch(Gid),
    /// The peer's channel was dropped mid-run.
    TransportClosed(usize),
    /// Another worker failed, so whatever this one was waiting for won't come.
    PeerFailed(usize),
    Io(io::Error),
    StorageCorrupted(u64),
    MissingRecord(u64),
    UnexpectedEnd { wanted: usize, left: usize },
    InvalidData(&'static str),
    /// Raised by user callbacks to stop the run.
    Aborted(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<unsigned_varint::decode::Error> for Error {
    fn from(_: unsigned_varint::decode::Error) -> Self {
        Self::InvalidData("malformed length prefix")
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidData("string is not valid utf-8")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::NoRoute(gid) => write!(f, "no route to block {}", gid),
            Error::UnknownBlock(gid) => write!(f, "block {} is not local", gid),
            Error::UndrainedQueue { gid, from } => write!(
                f,
                "block {} left its queue from block {} undrained",
                gid, from
            ),
            Error::UnexpectedTarget { round, from, to } => write!(
                f,
                "block {} enqueued to {} in round {}, which isn't a partner",
                from, to, round
            ),
            Error::EmptyQueue { gid, from } => {
                write!(f, "block {} has nothing queued from {}", gid, from)
            }
            Error::CollectiveMismatch(msg) => {
                write!(f, "collective mismatch: {}", msg)
            }
            Error::CollectiveUnresolved(gid) => {
                write!(f, "block {} read an unresolved collective", gid)
            }
            Error::CollectiveTypeMismatch(gid) => write!(
                f,
                "block {} read a collective as the wrong type",
                gid
            ),
            Error::TransportClosed(rank) => {
                write!(f, "transport to worker {} closed", rank)
            }
            Error::PeerFailed(rank) => write!(f, "worker {} failed", rank),
            Error::Io(e) => write!(f, "storage i/o: {}", e),
            Error::StorageCorrupted(handle) => {
                write!(f, "storage record {} failed its checksum", handle)
            }
            Error::MissingRecord(handle) => {
                write!(f, "storage record {} doesn't exist", handle)
            }
            Error::UnexpectedEnd { wanted, left } => write!(
                f,
                "buffer ended early: wanted {} bytes, {} left",
                wanted, left
            ),
            Error::InvalidData(what) => write!(f, "invalid data: {}", what),
            Error::Aborted(msg) => write!(f, "aborted: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}
