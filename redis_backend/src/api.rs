// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::*;

use crate::create::KEY_MAX;
use crate::iterator::IteratorId;
use crate::namespace::{Namespace, NsHandle};
use crate::types::{
    Completion, ErrorCode, Group, Handle, Opcode, RequestFlags, Sge, Tag, UserRequest,
};
use crate::worker::{Delivery, Post, Worker};

/// Client handle for one broker connection.
///
/// Entry points may be called from any thread; they hand requests to the connection's worker
/// through a message channel and either wait for the completion (sync variants) or return a
/// tag the caller polls later (async variants).
pub struct Broker {
    posts: Sender<Post>,
    deliveries: Receiver<Delivery>,
    /// Completions drained while looking for a specific tag.
    stash: Mutex<VecDeque<Delivery>>,
    next_tag: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl Broker {
    /// Connect to a Redis-protocol server over TCP and start the transport worker.
    pub fn connect(address: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(address)?;
        Ok(Self::with_stream(stream))
    }

    /// Run the broker over an arbitrary stream; used with socketpair endpoints in tests.
    pub fn with_stream<S: Read + Write + Send + 'static>(stream: S) -> Self {
        let (posts, inbox) = unbounded();
        let (outbox, deliveries) = unbounded();

        let worker = thread::spawn(move || {
            Worker::new(stream, inbox, outbox).run();
        });

        Self {
            posts,
            deliveries,
            stash: Mutex::new(VecDeque::new()),
            next_tag: AtomicU64::new(1),
            worker: Some(worker),
        }
    }

    /// Post a request asynchronously. The returned tag identifies the eventual completion.
    pub fn post(&self, user: UserRequest) -> Result<Tag, ErrorCode> {
        if matches!(user.opcode, Opcode::Unspec | Opcode::Cancel) {
            return Err(ErrorCode::Invalid);
        }

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.posts
            .send(Post::Request {
                tag,
                user,
                reply: None,
            })
            .map_err(|_| ErrorCode::NoConnect)?;
        Ok(tag)
    }

    /// Post a chain of requests. Each element is an independent post with its own tag and its
    /// own completion; there is no all-or-nothing behavior.
    pub fn post_chain(&self, chain: Vec<UserRequest>) -> Result<Vec<Tag>, ErrorCode> {
        let mut tags = Vec::with_capacity(chain.len());
        for user in chain {
            tags.push(self.post(user)?);
        }
        Ok(tags)
    }

    /// Best-effort cancellation of an outstanding post.
    pub fn cancel(&self, tag: Tag) -> Result<(), ErrorCode> {
        self.posts
            .send(Post::Cancel { tag })
            .map_err(|_| ErrorCode::NoConnect)
    }

    /// Fetch the completion for a specific tag, if it has arrived. Other completions drained
    /// while looking are kept for their own poll.
    pub fn poll(&self, tag: Tag) -> Result<Delivery, ErrorCode> {
        let mut stash = self.stash.lock().unwrap();

        while let Ok(delivery) = self.deliveries.try_recv() {
            stash.push_back(delivery);
        }

        if let Some(at) = stash.iter().position(|d| d.tag == tag) {
            return Ok(stash.remove(at).unwrap());
        }
        Err(ErrorCode::InProgress)
    }

    /// Block until any asynchronous completion arrives.
    pub fn wait_any(&self) -> Result<Delivery, ErrorCode> {
        if let Some(delivery) = self.stash.lock().unwrap().pop_front() {
            return Ok(delivery);
        }
        self.deliveries.recv().map_err(|_| ErrorCode::NoConnect)
    }

    fn post_wait(&self, user: UserRequest) -> Result<Delivery, ErrorCode> {
        if matches!(user.opcode, Opcode::Unspec | Opcode::Cancel) {
            return Err(ErrorCode::Invalid);
        }

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.posts
            .send(Post::Request {
                tag,
                user,
                reply: Some(tx),
            })
            .map_err(|_| ErrorCode::NoConnect)?;

        rx.recv().map_err(|_| ErrorCode::NoConnect)
    }

    /// Store a value under a key. Returns the operation's numeric result (the server-side
    /// value count for the key).
    pub fn put(
        &self,
        ns: &NsHandle,
        key: &str,
        value: &[u8],
        group: Group,
        flags: RequestFlags,
    ) -> Result<i64, ErrorCode> {
        self.put_gather(ns, key, &[value], group, flags)
    }

    /// Gather-style put: the value is the concatenation of `parts`.
    pub fn put_gather(
        &self,
        ns: &NsHandle,
        key: &str,
        parts: &[&[u8]],
        group: Group,
        flags: RequestFlags,
    ) -> Result<i64, ErrorCode> {
        if key.is_empty() || parts.is_empty() {
            return Err(ErrorCode::Invalid);
        }

        let user = UserRequest {
            opcode: Opcode::Put,
            group,
            ns: Some(ns.clone()),
            key: key.to_string(),
            flags,
            sge: parts.iter().map(|p| Sge::from_slice(p)).collect(),
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        finish(delivery).map(|(completion, _)| completion.rc)
    }

    /// Consume a value: fetch and remove it. `capacity` bounds the receive buffer; a larger
    /// value fails with `Ubuffer` (carrying the needed size) unless `PARTIAL` is set.
    pub fn get(
        &self,
        ns: &NsHandle,
        key: &str,
        match_template: &str,
        group: Group,
        flags: RequestFlags,
        capacity: usize,
    ) -> Result<Vec<u8>, ErrorCode> {
        self.fetch(Opcode::Get, ns, key, match_template, group, flags, capacity)
    }

    /// Non-destructive fetch of a value.
    pub fn read(
        &self,
        ns: &NsHandle,
        key: &str,
        match_template: &str,
        group: Group,
        flags: RequestFlags,
        capacity: usize,
    ) -> Result<Vec<u8>, ErrorCode> {
        self.fetch(Opcode::Read, ns, key, match_template, group, flags, capacity)
    }

    fn fetch(
        &self,
        opcode: Opcode,
        ns: &NsHandle,
        key: &str,
        match_template: &str,
        group: Group,
        flags: RequestFlags,
        capacity: usize,
    ) -> Result<Vec<u8>, ErrorCode> {
        if key.is_empty() || capacity == 0 {
            return Err(ErrorCode::Invalid);
        }

        let user = UserRequest {
            opcode,
            group,
            ns: Some(ns.clone()),
            key: key.to_string(),
            match_template: match_template.to_string(),
            flags,
            sge: vec![Sge::with_len(capacity)],
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        let (completion, sge) = finish(delivery)?;

        let mut data = gather(sge);
        data.truncate((completion.rc as usize).min(capacity));
        Ok(data)
    }

    /// Scatter-style fetch into several separately sized buffers. Returns the value's full
    /// size together with the filled buffers.
    pub fn get_scatter(
        &self,
        ns: &NsHandle,
        key: &str,
        match_template: &str,
        group: Group,
        flags: RequestFlags,
        sizes: &[usize],
    ) -> Result<(i64, Vec<Sge>), ErrorCode> {
        if key.is_empty() || sizes.is_empty() {
            return Err(ErrorCode::Invalid);
        }

        let user = UserRequest {
            opcode: Opcode::Get,
            group,
            ns: Some(ns.clone()),
            key: key.to_string(),
            match_template: match_template.to_string(),
            flags,
            sge: sizes.iter().map(|s| Sge::with_len(*s)).collect(),
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        finish(delivery).map(|(completion, sge)| (completion.rc, sge))
    }

    /// Delete a key and its values.
    pub fn remove(&self, ns: &NsHandle, key: &str, group: Group) -> Result<(), ErrorCode> {
        if key.is_empty() {
            return Err(ErrorCode::Invalid);
        }

        let user = UserRequest {
            opcode: Opcode::Remove,
            group,
            ns: Some(ns.clone()),
            key: key.to_string(),
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        finish(delivery).map(|_| ())
    }

    /// Move a key from one namespace to another.
    pub fn mv(
        &self,
        src: &NsHandle,
        key: &str,
        dst: &NsHandle,
        group: Group,
    ) -> Result<(), ErrorCode> {
        if key.is_empty() {
            return Err(ErrorCode::Invalid);
        }

        let user = UserRequest {
            opcode: Opcode::Move,
            group,
            ns: Some(src.clone()),
            dest_ns: Some(dst.clone()),
            key: key.to_string(),
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        finish(delivery).map(|_| ())
    }

    /// Enumerate the keys of a namespace matching `pattern` (empty for all).
    pub fn directory(
        &self,
        ns: &NsHandle,
        pattern: &str,
        group: Group,
        capacity: usize,
    ) -> Result<Vec<Vec<u8>>, ErrorCode> {
        if capacity == 0 {
            return Err(ErrorCode::Invalid);
        }

        let user = UserRequest {
            opcode: Opcode::Directory,
            group,
            ns: Some(ns.clone()),
            match_template: pattern.to_string(),
            sge: vec![Sge::with_len(capacity)],
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        let (completion, sge) = finish(delivery)?;

        let mut listing = gather(sge);
        listing.truncate(completion.rc as usize);
        Ok(listing
            .split(|b| *b == b'\n')
            .filter(|k| !k.is_empty())
            .map(<[u8]>::to_vec)
            .collect())
    }

    /// Advance a namespace traversal by one key. `it` is `None` on the first step; the
    /// returned handle continues the traversal. `Ok(None)` means the traversal is finished
    /// and the handle is retired. An empty key with a live handle is a valid empty step: the
    /// caller just calls again.
    pub fn iterate(
        &self,
        ns: &NsHandle,
        match_template: &str,
        it: Option<IteratorId>,
        group: Group,
    ) -> Result<Option<(IteratorId, Vec<u8>)>, ErrorCode> {
        let user = UserRequest {
            opcode: Opcode::Iterator,
            group,
            ns: Some(ns.clone()),
            match_template: match_template.to_string(),
            it,
            sge: vec![Sge::with_len(KEY_MAX)],
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        let (completion, sge) = finish(delivery)?;

        match completion.handle {
            Handle::Iterator(id) => {
                let mut key = gather(sge);
                key.truncate(completion.rc as usize);
                Ok(Some((id, key)))
            }
            _ => Ok(None),
        }
    }

    /// Create a namespace and return its handle, already carrying the creator's attach.
    pub fn ns_create(&self, name: &str) -> Result<NsHandle, ErrorCode> {
        let ns = Namespace::create(name)?;

        let user = UserRequest {
            opcode: Opcode::NsCreate,
            ns: Some(ns.clone()),
            key: name.to_string(),
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        let (completion, _) = finish(delivery)?;

        match completion.handle {
            Handle::Namespace(handle) => Ok(handle),
            _ => Ok(ns),
        }
    }

    /// Attach to an existing namespace by name.
    pub fn ns_attach(&self, name: &str) -> Result<NsHandle, ErrorCode> {
        let ns = Namespace::create(name)?;

        let user = UserRequest {
            opcode: Opcode::NsAttach,
            ns: Some(ns.clone()),
            key: name.to_string(),
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        let (completion, _) = finish(delivery)?;

        match completion.handle {
            Handle::Namespace(handle) => Ok(handle),
            _ => Ok(ns),
        }
    }

    /// Drop one attach from a namespace.
    pub fn ns_detach(&self, ns: &NsHandle) -> Result<(), ErrorCode> {
        let user = UserRequest {
            opcode: Opcode::NsDetach,
            ns: Some(ns.clone()),
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        finish(delivery)?;

        ns.detach()?;
        Ok(())
    }

    /// Delete a namespace. Refused with `NsBusy` (rc = residual attach count) while other
    /// attaches are outstanding.
    pub fn ns_delete(&self, ns: &NsHandle) -> Result<(), ErrorCode> {
        let user = UserRequest {
            opcode: Opcode::NsDelete,
            ns: Some(ns.clone()),
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        finish(delivery).map(|_| ())
    }

    /// Fetch a namespace's metadata into a caller-sized buffer.
    pub fn ns_query(&self, ns: &NsHandle, capacity: usize) -> Result<Vec<u8>, ErrorCode> {
        if capacity == 0 {
            return Err(ErrorCode::Invalid);
        }

        let user = UserRequest {
            opcode: Opcode::NsQuery,
            ns: Some(ns.clone()),
            sge: vec![Sge::with_len(capacity)],
            ..Default::default()
        };

        let delivery = self.post_wait(user)?;
        let (completion, sge) = finish(delivery)?;

        let mut meta = gather(sge);
        meta.truncate((completion.rc as usize).min(capacity));
        Ok(meta)
    }

    /// Asynchronous put; the completion arrives via [`Broker::poll`] or [`Broker::wait_any`].
    pub fn put_async(
        &self,
        ns: &NsHandle,
        key: &str,
        value: &[u8],
        group: Group,
        flags: RequestFlags,
    ) -> Result<Tag, ErrorCode> {
        if key.is_empty() {
            return Err(ErrorCode::Invalid);
        }

        self.post(UserRequest {
            opcode: Opcode::Put,
            group,
            ns: Some(ns.clone()),
            key: key.to_string(),
            flags,
            sge: vec![Sge::from_slice(value)],
            ..Default::default()
        })
    }

    /// Asynchronous consume.
    pub fn get_async(
        &self,
        ns: &NsHandle,
        key: &str,
        match_template: &str,
        group: Group,
        flags: RequestFlags,
        capacity: usize,
    ) -> Result<Tag, ErrorCode> {
        if key.is_empty() || capacity == 0 {
            return Err(ErrorCode::Invalid);
        }

        self.post(UserRequest {
            opcode: Opcode::Get,
            group,
            ns: Some(ns.clone()),
            key: key.to_string(),
            match_template: match_template.to_string(),
            flags,
            sge: vec![Sge::with_len(capacity)],
            ..Default::default()
        })
    }

    /// Asynchronous remove.
    pub fn remove_async(&self, ns: &NsHandle, key: &str, group: Group) -> Result<Tag, ErrorCode> {
        if key.is_empty() {
            return Err(ErrorCode::Invalid);
        }

        self.post(UserRequest {
            opcode: Opcode::Remove,
            group,
            ns: Some(ns.clone()),
            key: key.to_string(),
            ..Default::default()
        })
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.posts.send(Post::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("transport worker panicked during shutdown");
            }
        }
    }
}

fn finish(delivery: Delivery) -> Result<(Box<Completion>, Vec<Sge>), ErrorCode> {
    let Delivery {
        completion, sge, ..
    } = delivery;

    if completion.status != ErrorCode::Success {
        return Err(completion.status);
    }
    Ok((completion, sge))
}

fn gather(sge: Vec<Sge>) -> Vec<u8> {
    let mut data = Vec::with_capacity(crate::types::total_size(&sge));
    for element in &sge {
        data.extend_from_slice(&element.base);
    }
    data
}
