// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use redis_backend::{Broker, ErrorCode, RequestFlags};

#[derive(Debug, Parser)]
struct Cli {
    #[arg(long, default_value = "localhost")]
    hostname: String,

    #[arg(long, default_value_t = 6379)]
    port: u16,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a namespace.
    Create { namespace: String },

    /// Attach to an existing namespace.
    Attach { namespace: String },

    /// Delete a namespace (refused while other clients are attached).
    Delete { namespace: String },

    /// Show a namespace's metadata.
    Query { namespace: String },

    /// Store a value under a key.
    Put {
        namespace: String,
        key: String,
        value: String,
    },

    /// Consume a value (fetch and remove).
    Get {
        namespace: String,
        key: String,

        /// Receive buffer size in bytes.
        #[arg(long, default_value_t = 4096)]
        size: usize,

        /// Accept a truncated value if the buffer is too small.
        #[arg(long)]
        partial: bool,
    },

    /// Fetch a value without removing it.
    Read {
        namespace: String,
        key: String,

        #[arg(long, default_value_t = 4096)]
        size: usize,
    },

    /// Delete a key.
    Remove { namespace: String, key: String },

    /// List the keys of a namespace.
    Dir {
        namespace: String,

        #[arg(long, default_value = "")]
        pattern: String,
    },
}

fn main() -> io::Result<ExitCode> {
    env_logger::init();

    let args = Cli::parse();

    let broker = Broker::connect(&format!("{}:{}", args.hostname, args.port))?;

    let status = match run(&broker, args.command) {
        Ok(()) => return Ok(ExitCode::SUCCESS),
        Err(status) => status,
    };

    eprintln!("operation failed: {status}");
    Ok(ExitCode::FAILURE)
}

fn run(broker: &Broker, command: Command) -> Result<(), ErrorCode> {
    match command {
        Command::Create { namespace } => {
            broker.ns_create(&namespace)?;
            println!("created namespace {namespace}");
        }
        Command::Attach { namespace } => {
            let ns = broker.ns_attach(&namespace)?;
            println!("attached to {namespace}, {} attach(es)", ns.refcount());
        }
        Command::Delete { namespace } => {
            let ns = broker.ns_attach(&namespace)?;
            broker.ns_delete(&ns)?;
            println!("deleted namespace {namespace}");
        }
        Command::Query { namespace } => {
            let ns = broker.ns_attach(&namespace)?;
            let meta = broker.ns_query(&ns, 4096)?;
            print!("{}", String::from_utf8_lossy(&meta));
        }
        Command::Put {
            namespace,
            key,
            value,
        } => {
            let ns = broker.ns_attach(&namespace)?;
            let rc = broker.put(&ns, &key, value.as_bytes(), 0, RequestFlags::empty())?;
            println!("stored, {rc} value(s) under key");
        }
        Command::Get {
            namespace,
            key,
            size,
            partial,
        } => {
            let ns = broker.ns_attach(&namespace)?;
            let flags = if partial {
                RequestFlags::PARTIAL
            } else {
                RequestFlags::empty()
            };
            let value = broker.get(&ns, &key, "", 0, flags, size)?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Command::Read {
            namespace,
            key,
            size,
        } => {
            let ns = broker.ns_attach(&namespace)?;
            let value = broker.read(&ns, &key, "", 0, RequestFlags::empty(), size)?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Command::Remove { namespace, key } => {
            let ns = broker.ns_attach(&namespace)?;
            broker.remove(&ns, &key, 0)?;
            println!("removed {key}");
        }
        Command::Dir { namespace, pattern } => {
            let ns = broker.ns_attach(&namespace)?;
            for key in broker.directory(&ns, &pattern, 0, 64 * 1024)? {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
    }

    Ok(())
}
