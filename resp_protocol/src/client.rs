// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::*;

/// Write an already serialized command to the given `stream` and decode the single reply.
///
/// This blocks the calling thread until the server answers. Pipelining callers write several
/// commands themselves and call [`parse_reply`] once per outstanding command instead.
pub fn exchange<S: Read + Write>(stream: &mut S, cmd: &[u8]) -> Result<Value, Error> {
    stream.write_all(cmd)?;
    stream.flush()?;

    parse_reply(stream)
}

/// Serialize an argv-style command, send it, and decode the reply.
///
/// `args` must contain at least the command name; a zero-argument command is a caller bug and
/// is rejected as a decode-side protocol error before touching the stream.
pub fn call<S: Read + Write>(stream: &mut S, args: &[&[u8]]) -> Result<Value, Error> {
    if args.is_empty() {
        return Err(Error::Protocol(ProtocolError::Decode));
    }

    debug!(
        "sending {} command with {} arguments",
        String::from_utf8_lossy(args[0]),
        args.len() - 1,
    );

    let cmd = encode_command(args);
    exchange(stream, &cmd)
}
