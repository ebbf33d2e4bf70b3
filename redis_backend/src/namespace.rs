// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::create::KEY_SEPARATOR;
use crate::types::ErrorCode;

/// Maximum accepted length of a namespace name, in bytes.
pub const NS_NAME_MAX: usize = 1023;

/// A logical namespace: a partition of the server keyspace owning a set of keys.
///
/// The attach refcount tracks outstanding attaches on this handle across the whole process;
/// it is the only piece of engine state touched from more than one thread, which is why it is
/// atomic. Memory lifetime is managed separately by the `Arc` the handle rides in.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    refcnt: AtomicI64,
}

pub type NsHandle = Arc<Namespace>;

impl Namespace {
    /// Create a handle for the named namespace with one outstanding attach (the creator's).
    ///
    /// The name must be non-empty, free of the key separator byte, and within NS_NAME_MAX.
    pub fn create(name: &str) -> Result<NsHandle, ErrorCode> {
        if name.is_empty() || name.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(ErrorCode::Invalid);
        }
        if name.len() > NS_NAME_MAX {
            return Err(ErrorCode::NsInval);
        }

        Ok(Arc::new(Namespace {
            name: name.to_string(),
            refcnt: AtomicI64::new(1),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of outstanding attaches.
    pub fn refcount(&self) -> i64 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Record one more attach; returns the new count.
    pub fn attach(&self) -> i64 {
        self.refcnt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one attach; returns the new count. Detaching a handle with no outstanding
    /// attaches is refused.
    pub fn detach(&self) -> Result<i64, ErrorCode> {
        let prev = self.refcnt.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.refcnt.fetch_add(1, Ordering::SeqCst);
            return Err(ErrorCode::InvalidOp);
        }
        Ok(prev - 1)
    }

    /// Check that the handle is quiesced enough to destroy: only the creator's own attach may
    /// remain. Returns the residual attach count otherwise, and the handle stays valid.
    pub fn destroy(ns: &NsHandle) -> Result<(), i64> {
        let count = ns.refcount();
        if count > 1 {
            return Err(count);
        }
        Ok(())
    }
}
