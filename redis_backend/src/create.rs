// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

use log::*;

use crate::buffer::SendBuffer;
use crate::request::{Request, StageState};
use crate::types::{Opcode, Sge};
use resp_protocol::write_command;

/// Reserved byte joining a namespace name and a user key into one globally addressable key.
/// It must not appear in either part.
pub const KEY_SEPARATOR: u8 = b':';

/// Maximum length of a composed key, in bytes.
pub const KEY_MAX: usize = 1023;

/// Keys requested from the server per DIRECTORY scan step.
const SCAN_BATCH: usize = 64;

/// The ways building a command can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// The request's opcode or state cannot be rendered (wrong opcode, missing namespace,
    /// separator byte inside a user key).
    Invalid,

    /// The send buffer has no room for the command.
    NoSpace,

    /// Key composition exceeded KEY_MAX.
    KeyTooLong,
}

impl std::error::Error for CreateError {}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Invalid => "request not renderable",
                Self::NoSpace => "send buffer exhausted",
                Self::KeyTooLong => "composed key too long",
            }
        )
    }
}

/// One serialized command fragment: an offset/length span inside the send buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSge {
    pub offset: usize,
    pub len: usize,
}

/// Compose the globally addressable key for a user key within a namespace.
pub fn create_key(ns_name: &str, key: &str) -> Result<Vec<u8>, CreateError> {
    if key.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(CreateError::Invalid);
    }

    let mut composed = Vec::with_capacity(ns_name.len() + 1 + key.len());
    composed.extend_from_slice(ns_name.as_bytes());
    composed.push(KEY_SEPARATOR);
    composed.extend_from_slice(key.as_bytes());

    if composed.len() > KEY_MAX {
        return Err(CreateError::KeyTooLong);
    }
    Ok(composed)
}

/// Split a key returned by the server back into its user-visible part.
///
/// Returns `None` when the separator is missing, which scanning code paths report as an
/// iteration inconsistency.
pub fn strip_ns_prefix(composed: &[u8]) -> Option<&[u8]> {
    let at = composed.iter().position(|b| *b == KEY_SEPARATOR)?;
    Some(&composed[at + 1..])
}

/// Render the request's current stage into the send buffer as one RESP command.
///
/// On success the written span is appended to `cmd` and the number of bytes written is
/// returned. The request itself is not mutated; recording that a send has been prepared is
/// the worker's job.
pub fn create_command(
    req: &Request,
    buf: &mut SendBuffer,
    cmd: &mut Vec<CmdSge>,
) -> Result<usize, CreateError> {
    let start = buf.position();
    let user = req.user();

    let written = match req.opcode() {
        Opcode::Put => {
            let key = data_key(req)?;
            let value = gather(&user.sge);
            emit(buf, &[b"RPUSH", &key, &value])?
        }
        Opcode::Get => {
            let key = data_key(req)?;
            emit(buf, &[b"LPOP", &key])?
        }
        Opcode::Read => {
            let key = data_key(req)?;
            emit(buf, &[b"LINDEX", &key, b"0"])?
        }
        Opcode::Remove => {
            let key = data_key(req)?;
            emit(buf, &[b"DEL", &key])?
        }
        Opcode::Move => move_command(req, buf)?,
        Opcode::Directory => {
            let StageState::Directory { cursor, .. } = req.state() else {
                return Err(CreateError::Invalid);
            };
            scan_command(req, buf, *cursor, SCAN_BATCH)?
        }
        Opcode::Iterator => {
            let StageState::Iterator { cursor, .. } = req.state() else {
                return Err(CreateError::Invalid);
            };
            scan_command(req, buf, *cursor, 1)?
        }
        Opcode::NsCreate => {
            let ns = ns_name(req)?;
            match req.stage() {
                0 => emit(buf, &[b"HSETNX", ns.as_bytes(), b"name", ns.as_bytes()])?,
                1 => emit(buf, &[b"HINCRBY", ns.as_bytes(), b"refcnt", b"1"])?,
                _ => return Err(CreateError::Invalid),
            }
        }
        Opcode::NsAttach => {
            let ns = ns_name(req)?;
            emit(buf, &[b"HINCRBY", ns.as_bytes(), b"refcnt", b"1"])?
        }
        Opcode::NsDetach => {
            let ns = ns_name(req)?;
            emit(buf, &[b"HINCRBY", ns.as_bytes(), b"refcnt", b"-1"])?
        }
        Opcode::NsDelete => {
            let ns = ns_name(req)?;
            emit(buf, &[b"DEL", ns.as_bytes()])?
        }
        Opcode::NsQuery => {
            let ns = ns_name(req)?;
            emit(buf, &[b"HGETALL", ns.as_bytes()])?
        }
        Opcode::Unspec | Opcode::Cancel => return Err(CreateError::Invalid),
    };

    trace!(
        "built {:?} stage {} command, {written} bytes",
        req.opcode(),
        req.stage()
    );

    cmd.push(CmdSge {
        offset: start,
        len: written,
    });
    Ok(written)
}

fn move_command(req: &Request, buf: &mut SendBuffer) -> Result<usize, CreateError> {
    let user = req.user();
    let src = data_key(req)?;

    match req.stage() {
        0 => emit(buf, &[b"DUMP", &src]),
        1 => {
            let Some(dst_ns) = &user.dest_ns else {
                return Err(CreateError::Invalid);
            };
            let dst = create_key(dst_ns.name(), &user.key)?;
            let StageState::Move { dump: Some(payload) } = req.state() else {
                return Err(CreateError::Invalid);
            };
            emit(buf, &[b"RESTORE", &dst, b"0", payload])
        }
        2 => emit(buf, &[b"DEL", &src]),
        _ => Err(CreateError::Invalid),
    }
}

fn scan_command(
    req: &Request,
    buf: &mut SendBuffer,
    cursor: u64,
    count: usize,
) -> Result<usize, CreateError> {
    let user = req.user();
    let template = if user.match_template.is_empty() {
        "*"
    } else {
        &user.match_template
    };
    let pattern = match &user.ns {
        Some(ns) => create_key(ns.name(), template)?,
        None => return Err(CreateError::Invalid),
    };

    let cursor = cursor.to_string();
    let count = count.to_string();
    emit(
        buf,
        &[
            b"SCAN",
            cursor.as_bytes(),
            b"MATCH",
            &pattern,
            b"COUNT",
            count.as_bytes(),
        ],
    )
}

/// The composed key for a data operation; the namespace handle is required.
fn data_key(req: &Request) -> Result<Vec<u8>, CreateError> {
    let user = req.user();
    match &user.ns {
        Some(ns) => create_key(ns.name(), &user.key),
        None => Err(CreateError::Invalid),
    }
}

/// Namespace lifecycle operations name their target either through the handle or, before a
/// handle exists, through the key field.
fn ns_name(req: &Request) -> Result<String, CreateError> {
    let user = req.user();
    if let Some(ns) = &user.ns {
        return Ok(ns.name().to_string());
    }
    if user.key.is_empty() {
        return Err(CreateError::Invalid);
    }
    Ok(user.key.clone())
}

fn gather(sge: &[Sge]) -> Vec<u8> {
    let mut value = Vec::with_capacity(crate::types::total_size(sge));
    for element in sge {
        value.extend_from_slice(&element.base);
    }
    value
}

fn emit(buf: &mut SendBuffer, args: &[&[u8]]) -> Result<usize, CreateError> {
    write_command(buf, args).map_err(|e| {
        debug!("command serialization failed: {e}");
        CreateError::NoSpace
    })
}
