// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod client;

use log::*;

use std::{
    fmt,
    io::{Read, Write},
};

/// Maximum nesting depth accepted while parsing a reply. Redis replies are flat or one level
/// deep in practice; anything deeper is treated as a decoding error.
const MAX_REPLY_DEPTH: usize = 8;

/// The possible errors that can arise from trying to write a RESP command or read a RESP reply.
#[derive(Debug)]
pub enum Error {
    /// Protocol errors cover everything that is wrong with the byte stream itself: unknown type
    /// tags, malformed lengths, or replies nested beyond reason.
    Protocol(ProtocolError),

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Generic decoding error: unknown type tag or missing CRLF framing.
    Decode,

    /// A length or integer field did not parse as a decimal number.
    BadInteger,

    /// Arrays nested deeper than MAX_REPLY_DEPTH.
    TooDeep,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Decode => "Error decoding reply",
                Self::BadInteger => "Malformed integer field",
                Self::TooDeep => "Reply nesting too deep",
            }
        )
    }
}

/// A fully decoded RESP value.
///
/// Simple strings and bulk strings are collapsed into one variant: the distinction only matters
/// on the wire. Both bulk-nil (`$-1`) and array-nil (`*-1`) decode to `Nil`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    Int(i64),
    String(Vec<u8>),
    Array(Vec<Value>),
    Error(String),
    #[default]
    Nil,
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Short name of the value's wire type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Error(_) => "error",
            Value::Nil => "nil",
        }
    }
}

/// Serialize an argv-style command as a RESP array of bulk strings into the given writer.
///
/// Returns the number of bytes written. A writer with bounded capacity (like a send buffer)
/// reports exhaustion as an I/O error, which the caller maps to its own error space.
pub fn write_command<W: Write>(w: &mut W, args: &[&[u8]]) -> std::io::Result<usize> {
    let mut written = 0;

    let header = format!("*{}\r\n", args.len());
    w.write_all(header.as_bytes())?;
    written += header.len();

    for arg in args {
        let len = format!("${}\r\n", arg.len());
        w.write_all(len.as_bytes())?;
        w.write_all(arg)?;
        w.write_all(b"\r\n")?;
        written += len.len() + arg.len() + 2;
    }

    Ok(written)
}

/// Allocating variant of [`write_command`].
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    // writing into a Vec cannot fail
    write_command(&mut buf, args).unwrap();
    buf
}

/// Read exactly one complete reply from the stream and decode it.
///
/// The stream is consumed through the reply's trailing CRLF; decoding never leaves a partial
/// reply behind on success. Server-side errors (`-ERR ...`) decode successfully into
/// [`Value::Error`]; classifying them is the caller's business.
pub fn parse_reply<R: Read>(stream: &mut R) -> Result<Value, Error> {
    parse_value(stream, 0)
}

fn parse_value<R: Read>(stream: &mut R, depth: usize) -> Result<Value, Error> {
    if depth > MAX_REPLY_DEPTH {
        return Err(Error::Protocol(ProtocolError::TooDeep));
    }

    let tag = read_byte(stream)?;
    let line = read_line(stream)?;

    match tag {
        b'+' => Ok(Value::String(line)),
        b'-' => Ok(Value::Error(String::from_utf8_lossy(&line).into_owned())),
        b':' => Ok(Value::Int(parse_int(&line)?)),
        b'$' => {
            let len = parse_int(&line)?;
            if len < 0 {
                return Ok(Value::Nil);
            }
            let mut data = vec![0; len as usize];
            stream.read_exact(&mut data)?;
            expect_crlf(stream)?;
            Ok(Value::String(data))
        }
        b'*' => {
            let count = parse_int(&line)?;
            if count < 0 {
                return Ok(Value::Nil);
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(parse_value(stream, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        other => {
            warn!("unknown RESP type tag: 0x{other:02x}");
            Err(Error::Protocol(ProtocolError::Decode))
        }
    }
}

fn read_byte<R: Read>(stream: &mut R) -> std::io::Result<u8> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Read up to and including the next CRLF; the CRLF itself is consumed and not returned.
fn read_line<R: Read>(stream: &mut R) -> Result<Vec<u8>, Error> {
    let mut line = Vec::new();

    loop {
        match read_byte(stream)? {
            b'\r' => {
                if read_byte(stream)? != b'\n' {
                    return Err(Error::Protocol(ProtocolError::Decode));
                }
                return Ok(line);
            }
            byte => line.push(byte),
        }
    }
}

fn expect_crlf<R: Read>(stream: &mut R) -> Result<(), Error> {
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf)?;
    if &crlf != b"\r\n" {
        return Err(Error::Protocol(ProtocolError::Decode));
    }
    Ok(())
}

fn parse_int(line: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(Error::Protocol(ProtocolError::BadInteger))
}

/// A "pipe", constructed using socketpair(2), that can be used for testing client and
/// server behavior.
pub mod pipe {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    pub struct Endpoint {
        fd: std::os::fd::OwnedFd,
    }

    pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;

        Ok((Endpoint { fd: a }, Endpoint { fd: b }))
    }

    impl std::io::Read for Endpoint {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::read(&self.fd, buf)?)
        }
    }

    impl std::io::Write for Endpoint {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::write(&self.fd, buf)?)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
