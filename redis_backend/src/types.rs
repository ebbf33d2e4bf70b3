// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

use crate::iterator::IteratorId;
use crate::namespace::NsHandle;

/// The operations the broker understands. Every posted request carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Opcode {
    #[default]
    Unspec,
    Put,
    Get,
    Read,
    Move,
    Remove,
    Directory,
    NsCreate,
    NsAttach,
    NsDetach,
    NsDelete,
    NsQuery,
    Iterator,
    Cancel,
}

/// User-facing status codes. This is a closed taxonomy: transport and server failures are
/// folded into these by the completion engine, never surfaced raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    #[default]
    Success,
    /// Unspecific error.
    Generic,
    /// An invalid argument was detected.
    Invalid,
    /// Invalid or unusable namespace handle.
    Handle,
    /// Not authorized for this operation.
    NoAuth,
    /// The backend is not connected to the storage service.
    NoConnect,
    /// Backend-managed metadata is missing or corrupted.
    NoFile,
    /// The item (or namespace) already exists.
    Exists,
    /// The requested item is not available.
    Unavail,
    /// The user buffer is too small for the data.
    Ubuffer,
    /// Out of memory.
    NoMemory,
    /// General error in the backend.
    BeGeneral,
    /// Failed to post the request into the backend stack.
    BePost,
    /// The request is not complete yet.
    InProgress,
    /// The namespace still has attached clients.
    NsBusy,
    /// The namespace name is invalid or too long.
    NsInval,
    /// The operation is not permitted in this state.
    InvalidOp,
    /// Inconsistency or error while iterating.
    Iterator,
    /// The request was cancelled.
    Cancelled,
    /// The operation is not implemented by this backend.
    NoImpl,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Success => "success",
                Self::Generic => "unspecific error",
                Self::Invalid => "invalid argument",
                Self::Handle => "invalid namespace handle",
                Self::NoAuth => "not authorized",
                Self::NoConnect => "not connected to storage service",
                Self::NoFile => "backend metadata missing or corrupted",
                Self::Exists => "already exists",
                Self::Unavail => "not available",
                Self::Ubuffer => "user buffer too small",
                Self::NoMemory => "out of memory",
                Self::BeGeneral => "general backend error",
                Self::BePost => "failed to post request",
                Self::InProgress => "request in progress",
                Self::NsBusy => "namespace busy",
                Self::NsInval => "invalid namespace name",
                Self::InvalidOp => "operation not permitted",
                Self::Iterator => "iteration error",
                Self::Cancelled => "request cancelled",
                Self::NoImpl => "operation not implemented",
            }
        )
    }
}

bitflags::bitflags! {
    /// Behavior flags carried on a user request. The rest of the word is reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// Do not block waiting for the operation.
        const NOWAIT = 0x1;
        /// Tolerate a user buffer smaller than the value; deliver a truncated value.
        const PARTIAL = 0x2;
    }
}

/// Request group. Carried through to completions; the Redis backend does not partition by it.
pub type Group = u32;

/// Opaque handle returned by asynchronous posts, used to poll or cancel.
pub type Tag = u64;

/// A single scatter/gather element: one contiguous buffer span.
///
/// The same type describes both directions. Outbound elements carry the payload to write;
/// inbound elements are sized to the caller's receive capacity and are filled by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sge {
    pub base: Vec<u8>,
}

impl Sge {
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            base: data.to_vec(),
        }
    }

    /// A zero-filled receive element of the given capacity.
    pub fn with_len(len: usize) -> Self {
        Self {
            base: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }
}

/// Total number of bytes described by a scatter/gather list.
pub fn total_size(sge: &[Sge]) -> usize {
    sge.iter().map(Sge::len).sum()
}

/// Copy `data` into the scatter/gather list starting at logical offset `offset`.
///
/// Returns the number of bytes actually copied; bytes past the list's capacity are dropped,
/// which is how partial delivery is expressed.
pub fn scatter_at(sge: &mut [Sge], offset: usize, data: &[u8]) -> usize {
    let mut skip = offset;
    let mut src = data;
    let mut copied = 0;

    for element in sge {
        if src.is_empty() {
            break;
        }
        if skip >= element.len() {
            skip -= element.len();
            continue;
        }

        let room = element.len() - skip;
        let take = room.min(src.len());
        element.base[skip..skip + take].copy_from_slice(&src[..take]);
        skip = 0;
        src = &src[take..];
        copied += take;
    }

    copied
}

/// A request as handed in by the caller. The engine snapshots this on allocation; the caller's
/// copy is not referenced afterwards.
#[derive(Debug, Clone, Default)]
pub struct UserRequest {
    pub opcode: Opcode,
    pub group: Group,
    /// The namespace the operation applies to. Namespace lifecycle opcodes that have no handle
    /// yet (create/attach by name) may leave this unset and carry the name in `key`.
    pub ns: Option<NsHandle>,
    /// Destination namespace for MOVE. Unused by every other opcode.
    pub dest_ns: Option<NsHandle>,
    pub key: String,
    pub match_template: String,
    pub flags: RequestFlags,
    /// Opaque user cookie, delivered back verbatim in the completion.
    pub user: u64,
    /// Continuation handle for ITERATOR; unset on the first step.
    pub it: Option<IteratorId>,
    pub sge: Vec<Sge>,
}

/// Identity payload carried by a completion.
///
/// Namespace and iterator identities ride here as opaque, independently resolvable handles;
/// they are never folded into the numeric rc.
#[derive(Debug, Clone, Default)]
pub enum Handle {
    #[default]
    None,
    Namespace(NsHandle),
    Iterator(IteratorId),
}

/// Terminal record delivered to the caller: exactly one per accepted post.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub status: ErrorCode,
    /// Operation-specific numeric result: byte counts for read-like operations, the residual
    /// attach count for a busy namespace delete, 0 otherwise.
    pub rc: i64,
    pub user: u64,
    pub handle: Handle,
}
