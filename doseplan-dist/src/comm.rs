//! Message-passing layer for the coordinator/worker evaluation schedule.
//!
//! Ranks exchange tag-disambiguated primitive arrays: 32-bit unsigned
//! integers, IEEE-754 doubles, or opaque bincode payloads. Rank 0 is the
//! coordinator; the schedule only ever routes coordinator ↔ worker, so
//! transports may implement a star topology.

pub mod mem;
pub mod tcp;

use thiserror::Error;

/// The coordinator rank.
pub const COORDINATOR: usize = 0;

/// Stable wire tags, one distinct value per message kind.
///
/// The first group drives setup (matrix and entry transport), the second
/// the evaluation schedule, the third carries worker contributions back to
/// the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum Tag {
    // Setup.
    NumVars,
    NumMats,
    VecFlag,
    DataId,
    VecData,
    CsrNumCols,
    CsrData,
    CsrColInds,
    CsrRowPtrs,
    EntryCounts,
    EntryMeta,
    // Schedule.
    EvalObj,
    EvalObjGrad,
    EvalCons,
    EvalJac,
    Shutdown,
    Iterate,
    // Contributions.
    ObjValue,
    ObjGrad,
    ConsIdxs,
    ConsVals,
    JacVals,
}

/// Message payload: a typed primitive array or raw bytes.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub enum Body {
    Empty,
    U32(Vec<u32>),
    F64(Vec<f64>),
    Bytes(Vec<u8>),
}

impl Body {
    pub fn into_u32s(self) -> Result<Vec<u32>, CommError> {
        match self {
            Body::U32(v) => Ok(v),
            _ => Err(CommError::BodyMismatch { expected: "u32 array" }),
        }
    }

    pub fn into_f64s(self) -> Result<Vec<f64>, CommError> {
        match self {
            Body::F64(v) => Ok(v),
            _ => Err(CommError::BodyMismatch { expected: "f64 array" }),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, CommError> {
        match self {
            Body::Bytes(v) => Ok(v),
            _ => Err(CommError::BodyMismatch { expected: "byte payload" }),
        }
    }
}

/// One point-to-point message.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct Message {
    pub tag: Tag,
    pub body: Body,
}

/// Transport and protocol failures.
///
/// All of these are unrecoverable for the job: any failed collective
/// aborts the evaluation (no retry, no partial-failure tolerance).
#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {rank} disconnected")]
    Disconnected { rank: usize },

    #[error("expected message tag {expected:?}, received {found:?}")]
    TagMismatch { expected: Tag, found: Tag },

    #[error("message body has the wrong payload type (expected {expected})")]
    BodyMismatch { expected: &'static str },

    #[error("unexpected message tag {found:?} in the evaluation loop")]
    UnexpectedTag { found: Tag },

    #[error("no transport link from rank {from} to rank {to}")]
    UnsupportedRoute { from: usize, to: usize },

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("message encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("message decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("failed to rebuild transported entry: {0}")]
    Rebuild(#[from] doseplan::ArchiveError),

    #[error("cluster handshake failed: {0}")]
    Handshake(String),
}

/// Point-to-point messaging between ranks.
///
/// Messages between a fixed (source, destination) pair are delivered in
/// send order; the schedule never requires reordering. All methods take
/// `&self` so evaluators can drive the schedule from within the solver's
/// immutable callbacks.
pub trait Communicator: Send {
    /// This process's rank (0 = coordinator).
    fn rank(&self) -> usize;

    /// Total number of ranks, coordinator included.
    fn size(&self) -> usize;

    /// Send one message to `dest`.
    fn send(&self, dest: usize, message: Message) -> Result<(), CommError>;

    /// Receive the next message from `src`, blocking.
    fn recv(&self, src: usize) -> Result<Message, CommError>;

    /// Receive from `src` and require `tag`, returning the body.
    fn recv_expect(&self, src: usize, tag: Tag) -> Result<Body, CommError> {
        let message = self.recv(src)?;
        if message.tag != tag {
            return Err(CommError::TagMismatch {
                expected: tag,
                found: message.tag,
            });
        }
        Ok(message.body)
    }

    /// Coordinator-side broadcast: one copy to every worker rank.
    fn broadcast(&self, tag: Tag, body: Body) -> Result<(), CommError> {
        debug_assert_eq!(self.rank(), COORDINATOR);
        for dest in 1..self.size() {
            self.send(
                dest,
                Message {
                    tag,
                    body: body.clone(),
                },
            )?;
        }
        Ok(())
    }
}
