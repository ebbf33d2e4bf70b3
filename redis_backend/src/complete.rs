// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

use log::*;

use crate::create::strip_ns_prefix;
use crate::iterator::IteratorList;
use crate::request::{Request, StageState};
use crate::stages;
use crate::types::{scatter_at, total_size, Completion, ErrorCode, Handle, Opcode, RequestFlags};
use resp_protocol::Value;

/// The ways the completion engine itself can fail. These never become user-visible
/// completions; they indicate misuse by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteError {
    /// An argument violation the type system cannot rule out.
    Invalid,

    /// No stage table entry covers the request, or the request is already terminal.
    Protocol,
}

impl std::error::Error for CompleteError {}

impl fmt::Display for CompleteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Invalid => "invalid completion argument",
                Self::Protocol => "no stage entry for request",
            }
        )
    }
}

enum Outcome {
    /// Non-terminal stage succeeded; move to the successor and wait for the next reply.
    Advance,

    /// The request is done, one way or the other.
    Done {
        status: ErrorCode,
        rc: i64,
        handle: Handle,
    },
}

fn done(status: ErrorCode, rc: i64) -> Outcome {
    Outcome::Done {
        status,
        rc,
        handle: Handle::None,
    }
}

fn done_with(status: ErrorCode, rc: i64, handle: Handle) -> Outcome {
    Outcome::Done { status, rc, handle }
}

fn neg(errno: i32) -> i64 {
    -(errno as i64)
}

/// The backend-wide default translation of a numeric rc into a user-visible status.
/// Per-opcode completion functions overlay this where their protocol sequence gives a code a
/// more specific meaning.
fn default_status(rc: i64) -> ErrorCode {
    match rc {
        0 => ErrorCode::Success,
        x if x == neg(libc::EPROTO) => ErrorCode::BeGeneral,
        x if x == neg(libc::EINVAL) => ErrorCode::Invalid,
        x if x == neg(libc::EBADMSG) => ErrorCode::Invalid,
        x if x == neg(libc::ENOMEM) => ErrorCode::NoMemory,
        x if x == neg(libc::ENOENT) => ErrorCode::Unavail,
        x if x == neg(libc::EEXIST) => ErrorCode::Exists,
        x if x == neg(libc::ENOSPC) => ErrorCode::Ubuffer,
        x if x == neg(libc::E2BIG) => ErrorCode::NsInval,
        x if x == neg(libc::EOVERFLOW) => ErrorCode::InvalidOp,
        x if x == neg(libc::ESTALE) => ErrorCode::NoFile,
        x if x == neg(libc::EILSEQ) => ErrorCode::Iterator,
        _ => ErrorCode::BeGeneral,
    }
}

/// Consume a parsed reply plus the transport's numeric rc for the request's current stage.
///
/// Returns `Ok(None)` when a non-terminal stage succeeded and the request advanced; the
/// worker re-enters the command builder for the next stage. Returns `Ok(Some(_))` with the
/// terminal completion otherwise; ownership of the completion transfers to the caller and the
/// request becomes terminal. A request that already terminated (including by cancellation)
/// yields `Err(Protocol)` and stays untouched.
pub fn complete_command(
    req: &mut Request,
    result: &Value,
    in_rc: i64,
    iterators: &mut IteratorList,
) -> Result<Option<Box<Completion>>, CompleteError> {
    if req.is_terminal() {
        return Err(CompleteError::Protocol);
    }

    let Some(spec) = stages::stage_spec(req.opcode(), req.stage()) else {
        // A pre-attached completion is handed back even without a stage entry: it was
        // already built and only needs delivering.
        if let Some(slot) = req.take_completion_slot() {
            req.mark_terminal();
            return Ok(Some(slot));
        }
        return Err(CompleteError::Protocol);
    };

    // the stage table's result-type expectation gates every clean reply; the per-opcode
    // functions only see results of the declared shape
    let outcome = if in_rc == 0 && !spec.expect.matches(result) {
        debug!(
            "{:?} stage {} expected {:?}, got {}",
            req.opcode(),
            req.stage(),
            spec.expect,
            result.type_name()
        );
        done(ErrorCode::Invalid, 0)
    } else {
        match req.opcode() {
            Opcode::Put => complete_put(result, in_rc),
            Opcode::Get | Opcode::Read => complete_get(req, result, in_rc),
            Opcode::Remove => complete_remove(result, in_rc),
            Opcode::Move => complete_move(req, result, in_rc),
            Opcode::Directory => complete_directory(req, result, in_rc),
            Opcode::Iterator => complete_iterator(req, result, in_rc, iterators),
            Opcode::NsCreate => complete_nscreate(req, result, in_rc),
            Opcode::NsAttach => complete_nsattach(req, result, in_rc),
            Opcode::NsDetach => complete_nsdetach(result, in_rc),
            Opcode::NsDelete => complete_nsdelete(result, in_rc),
            Opcode::NsQuery => complete_nsquery(req, result, in_rc),
            // both ruled out by the stage table lookup above
            Opcode::Unspec | Opcode::Cancel => return Err(CompleteError::Protocol),
        }
    };

    match outcome {
        Outcome::Advance => {
            // self-looping stages (DIRECTORY) keep their index; everything else moves on
            if spec.next != req.stage() {
                req.stage_transition().map_err(|e| {
                    warn!("stage transition refused after successful stage: {e}");
                    CompleteError::Protocol
                })?;
            }
            Ok(None)
        }
        Outcome::Done { status, rc, handle } => {
            let mut completion = req.take_completion_slot().unwrap_or_default();
            completion.status = status;
            completion.rc = rc;
            completion.user = req.user().user;
            completion.handle = handle;

            debug!(
                "{:?} completed at stage {}: {status}, rc {rc}",
                req.opcode(),
                req.stage()
            );

            req.mark_terminal();
            Ok(Some(completion))
        }
    }
}

/// Synchronously retire an in-flight request with a CANCELLED completion.
///
/// Returns `None` when the request already terminated. The transport remains responsible for
/// consuming (and silently discarding) any reply still owed to this request.
pub fn complete_cancel(req: &mut Request) -> Option<Box<Completion>> {
    if req.is_terminal() {
        return None;
    }

    let mut completion = req.take_completion_slot().unwrap_or_default();
    completion.status = ErrorCode::Cancelled;
    completion.rc = 0;
    completion.user = req.user().user;
    completion.handle = Handle::None;

    req.mark_terminal();
    req.mark_cancelled();

    debug!("{:?} cancelled", req.opcode());
    Some(completion)
}

fn complete_put(result: &Value, in_rc: i64) -> Outcome {
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }
    match result {
        Value::Int(n) => done(ErrorCode::Success, *n),
        other => {
            debug!("PUT expected integer reply, got {}", other.type_name());
            done(ErrorCode::Invalid, 0)
        }
    }
}

fn complete_get(req: &mut Request, result: &Value, in_rc: i64) -> Outcome {
    let capacity = total_size(&req.user().sge);
    let partial = req.flags().contains(RequestFlags::PARTIAL);

    // buffer-too-small reported by the receive path: rc carries the size actually needed so
    // the caller can retry with a bigger buffer
    if in_rc == neg(libc::ENOSPC) {
        return done(ErrorCode::Ubuffer, result.as_int().unwrap_or(0));
    }
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    match result {
        // the receive path already scattered the value and reports its full size
        Value::Int(n) => {
            if *n > capacity as i64 && !partial {
                return done(ErrorCode::Ubuffer, *n);
            }
            done(ErrorCode::Success, *n)
        }
        Value::String(data) => {
            let need = data.len() as i64;
            scatter_at(req.sge_mut(), 0, data);
            if data.len() > capacity && !partial {
                return done(ErrorCode::Ubuffer, need);
            }
            done(ErrorCode::Success, need)
        }
        Value::Nil => done(ErrorCode::Unavail, 0),
        other => {
            debug!("GET expected string reply, got {}", other.type_name());
            done(ErrorCode::Invalid, 0)
        }
    }
}

fn complete_remove(result: &Value, in_rc: i64) -> Outcome {
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }
    match result {
        Value::Int(_) => done(ErrorCode::Success, 0),
        _ => done(ErrorCode::Invalid, 0),
    }
}

fn complete_move(req: &mut Request, result: &Value, in_rc: i64) -> Outcome {
    // destination collisions and failed source deletion carry their default meanings here:
    // -EEXIST is a destination that already holds the key, -ESTALE a source that would not go
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    match req.stage() {
        0 => match result {
            Value::String(payload) => {
                if let StageState::Move { dump } = req.state_mut() {
                    *dump = Some(payload.clone());
                }
                Outcome::Advance
            }
            Value::Nil => done(ErrorCode::Unavail, 0),
            _ => done(ErrorCode::Invalid, 0),
        },
        1 => match result {
            Value::String(_) => Outcome::Advance,
            _ => done(ErrorCode::Invalid, 0),
        },
        2 => match result {
            Value::Int(_) => done(ErrorCode::Success, 0),
            _ => done(ErrorCode::Invalid, 0),
        },
        _ => done(ErrorCode::Invalid, 0),
    }
}

fn complete_directory(req: &mut Request, result: &Value, in_rc: i64) -> Outcome {
    if in_rc == neg(libc::EILSEQ) {
        return done(ErrorCode::Iterator, 0);
    }
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    match result {
        // the receive path already filled the user buffer and reports the byte count
        Value::Int(n) => done(ErrorCode::Success, *n),
        Value::Array(items) => {
            let Some((cursor, keys)) = scan_reply(items) else {
                return done(ErrorCode::Invalid, 0);
            };

            let mut chunk = Vec::new();
            for key in keys {
                let Value::String(composed) = key else {
                    return done(ErrorCode::Invalid, 0);
                };
                let Some(user_key) = strip_ns_prefix(composed) else {
                    // a key without the namespace separator means the keyspace is mixed up
                    return done(ErrorCode::Iterator, 0);
                };
                chunk.extend_from_slice(user_key);
                chunk.push(b'\n');
            }

            let filled = match req.state() {
                StageState::Directory { filled, .. } => *filled,
                _ => return done(ErrorCode::Invalid, 0),
            };
            let capacity = total_size(&req.user().sge);
            let need = filled + chunk.len();
            if need > capacity {
                return done(ErrorCode::Ubuffer, need as i64);
            }

            scatter_at(req.sge_mut(), filled, &chunk);
            if let StageState::Directory {
                cursor: state_cursor,
                filled: state_filled,
            } = req.state_mut()
            {
                *state_cursor = cursor;
                *state_filled = need;
            }

            if cursor == 0 {
                done(ErrorCode::Success, need as i64)
            } else {
                // same stage again with the new cursor
                Outcome::Advance
            }
        }
        _ => done(ErrorCode::Invalid, 0),
    }
}

fn complete_iterator(
    req: &mut Request,
    result: &Value,
    in_rc: i64,
    iterators: &mut IteratorList,
) -> Outcome {
    if in_rc == neg(libc::EILSEQ) {
        return done(ErrorCode::Iterator, 0);
    }
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    let Some(id) = req.iterator() else {
        return done(ErrorCode::Iterator, 0);
    };

    match result {
        // pre-marshalled step: the receive path delivered the key already
        Value::Int(n) => done_with(ErrorCode::Success, *n, Handle::Iterator(id)),
        Value::Array(items) => {
            let Some((cursor, keys)) = scan_reply(items) else {
                return done(ErrorCode::Invalid, 0);
            };
            let Some(iterator) = iterators.get_mut(id) else {
                return done(ErrorCode::Iterator, 0);
            };
            iterator.cursor = cursor;

            match keys.first() {
                Some(Value::String(composed)) => {
                    let Some(user_key) = strip_ns_prefix(composed) else {
                        return done(ErrorCode::Iterator, 0);
                    };
                    iterator.last_key = user_key.to_vec();
                    let delivered = user_key.len() as i64;
                    scatter_at(req.sge_mut(), 0, user_key);
                    done_with(ErrorCode::Success, delivered, Handle::Iterator(id))
                }
                Some(_) => done(ErrorCode::Invalid, 0),
                None if cursor == 0 => {
                    // scan exhausted: the iterator is finished and its handle retired
                    iterators.release(id);
                    done(ErrorCode::Success, 0)
                }
                None => {
                    // empty batch mid-scan; the caller re-issues with the advanced cursor
                    done_with(ErrorCode::Success, 0, Handle::Iterator(id))
                }
            }
        }
        _ => done(ErrorCode::Invalid, 0),
    }
}

fn complete_nscreate(req: &mut Request, result: &Value, in_rc: i64) -> Outcome {
    // a namespace that cannot be found during creation is manager corruption, not a missing
    // tuple
    if in_rc == neg(libc::ENOENT) {
        return done(ErrorCode::NoFile, 0);
    }
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    match req.stage() {
        0 => match result {
            // HSETNX answers 0 when the record already existed
            Value::Int(0) => done(ErrorCode::Exists, 0),
            Value::Int(_) => Outcome::Advance,
            _ => done(ErrorCode::Invalid, 0),
        },
        _ => match result {
            Value::Int(_) => match req.user().ns.clone() {
                Some(ns) => done_with(ErrorCode::Success, 0, Handle::Namespace(ns)),
                None => done(ErrorCode::Handle, 0),
            },
            _ => done(ErrorCode::Invalid, 0),
        },
    }
}

fn complete_nsattach(req: &mut Request, result: &Value, in_rc: i64) -> Outcome {
    // an "exists" report from the attach sequence means the namespace manager record is
    // inconsistent, not that the caller attached twice
    if in_rc == neg(libc::EEXIST) {
        return done(ErrorCode::NoFile, 0);
    }
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    match result {
        Value::Int(_) => match req.user().ns.clone() {
            Some(ns) => done_with(ErrorCode::Success, 0, Handle::Namespace(ns)),
            None => done(ErrorCode::Handle, 0),
        },
        _ => done(ErrorCode::Invalid, 0),
    }
}

fn complete_nsdetach(result: &Value, in_rc: i64) -> Outcome {
    if in_rc == neg(libc::EEXIST) {
        return done(ErrorCode::NoFile, 0);
    }
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    match result {
        Value::Int(_) => done(ErrorCode::Success, 0),
        _ => done(ErrorCode::Invalid, 0),
    }
}

fn complete_nsdelete(result: &Value, in_rc: i64) -> Outcome {
    // the one positive rc in the protocol: the namespace is still attached elsewhere, and
    // the residual attach count rides in the result
    if in_rc == libc::EBUSY as i64 {
        return done(ErrorCode::NsBusy, result.as_int().unwrap_or(0));
    }
    if in_rc == neg(libc::EEXIST) {
        return done(ErrorCode::NoFile, 0);
    }
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    match result {
        Value::Int(_) => done(ErrorCode::Success, 0),
        _ => done(ErrorCode::Invalid, 0),
    }
}

fn complete_nsquery(req: &mut Request, result: &Value, in_rc: i64) -> Outcome {
    if in_rc == neg(libc::ENOSPC) {
        return done(ErrorCode::Ubuffer, result.as_int().unwrap_or(0));
    }
    if in_rc != 0 {
        return done(default_status(in_rc), 0);
    }

    match result {
        // metadata already scattered by the receive path
        Value::Int(n) => done(ErrorCode::Success, *n),
        Value::Array(pairs) => {
            if pairs.is_empty() {
                return done(ErrorCode::Unavail, 0);
            }

            let mut meta = Vec::new();
            for pair in pairs.chunks(2) {
                let (Value::String(field), Some(Value::String(value))) =
                    (&pair[0], pair.get(1))
                else {
                    return done(ErrorCode::Invalid, 0);
                };
                meta.extend_from_slice(field);
                meta.push(b'=');
                meta.extend_from_slice(value);
                meta.push(b'\n');
            }

            let capacity = total_size(&req.user().sge);
            let need = meta.len() as i64;
            if meta.len() > capacity {
                return done(ErrorCode::Ubuffer, need);
            }
            scatter_at(req.sge_mut(), 0, &meta);
            done(ErrorCode::Success, need)
        }
        Value::Nil => done(ErrorCode::Unavail, 0),
        _ => done(ErrorCode::Invalid, 0),
    }
}

/// Pick apart a SCAN-shaped reply: `[cursor, [key, ...]]` with the cursor encoded either as
/// an integer or as a decimal string.
fn scan_reply(items: &[Value]) -> Option<(u64, &[Value])> {
    if items.len() != 2 {
        return None;
    }

    let cursor = match &items[0] {
        Value::Int(n) if *n >= 0 => *n as u64,
        Value::String(s) => std::str::from_utf8(s).ok()?.parse::<u64>().ok()?,
        _ => return None,
    };

    let Value::Array(keys) = &items[1] else {
        return None;
    };

    Some((cursor, keys))
}
