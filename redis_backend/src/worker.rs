// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::VecDeque;
use std::io::{Read, Write};

use crossbeam_channel::{Receiver, Sender};
use log::*;

use crate::buffer::SendBuffer;
use crate::complete::{complete_cancel, complete_command};
use crate::create::{create_command, CmdSge, CreateError};
use crate::iterator::IteratorList;
use crate::namespace::Namespace;
use crate::request::{Request, StageState};
use crate::types::{Completion, ErrorCode, Handle, Opcode, Sge, Tag, UserRequest};
use resp_protocol::{parse_reply, Value};

/// Default capacity of the per-connection send buffer.
const SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Messages entering the worker through its multi-producer inbox.
pub enum Post {
    Request {
        tag: Tag,
        user: UserRequest,
        /// Rendezvous for a synchronous poster; completions for tags without one leave
        /// through the shared outbox.
        reply: Option<Sender<Delivery>>,
    },
    Cancel {
        tag: Tag,
    },
    Shutdown,
}

/// One finished request leaving the worker: the completion plus the caller's buffers, filled
/// for read-like operations.
#[derive(Debug)]
pub struct Delivery {
    pub tag: Tag,
    pub completion: Box<Completion>,
    pub sge: Vec<Sge>,
}

struct Flight {
    tag: Tag,
    req: Box<Request>,
    reply: Option<Sender<Delivery>>,
}

/// Whether the worker keeps running after an inbox message.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// The single-threaded transport worker. It owns the stream, the send buffer, the iterator
/// list and every request between post and completion; nothing here is shared.
///
/// Within the connection, replies arrive in send order, so each reply is matched to the
/// oldest unmatched in-flight request.
pub struct Worker<S> {
    stream: S,
    buf: SendBuffer,
    iterators: IteratorList,
    inbox: Receiver<Post>,
    outbox: Sender<Delivery>,
    /// Allocated but not yet sent (fresh posts and advanced multi-stage requests).
    pending: VecDeque<Flight>,
    /// Sent, awaiting the matching reply.
    inflight: VecDeque<Flight>,
}

impl<S: Read + Write> Worker<S> {
    pub fn new(stream: S, inbox: Receiver<Post>, outbox: Sender<Delivery>) -> Self {
        Self {
            stream,
            buf: SendBuffer::with_capacity(SEND_BUFFER_SIZE),
            iterators: IteratorList::new(),
            inbox,
            outbox,
            pending: VecDeque::new(),
            inflight: VecDeque::new(),
        }
    }

    /// Pump posts, sends and replies until shutdown or the posting side goes away.
    pub fn run(&mut self) {
        'main: loop {
            // block for work when fully idle, otherwise just drain what queued up
            if self.pending.is_empty() && self.inflight.is_empty() {
                match self.inbox.recv() {
                    Ok(post) => {
                        if let Flow::Stop = self.process(post) {
                            break 'main;
                        }
                    }
                    Err(_) => break 'main,
                }
            }

            while let Ok(post) = self.inbox.try_recv() {
                if let Flow::Stop = self.process(post) {
                    break 'main;
                }
            }

            self.flush_sends();

            if !self.inflight.is_empty() {
                self.consume_one();
            }
        }

        self.drain_on_shutdown();
    }

    /// Handle one inbox message.
    pub fn process(&mut self, post: Post) -> Flow {
        match post {
            Post::Request { tag, user, reply } => {
                self.accept(tag, user, reply);
                Flow::Continue
            }
            Post::Cancel { tag } => {
                self.cancel(tag);
                Flow::Continue
            }
            Post::Shutdown => Flow::Stop,
        }
    }

    fn accept(&mut self, tag: Tag, user: UserRequest, reply: Option<Sender<Delivery>>) {
        let mut req = match Request::allocate(&user) {
            Ok(req) => req,
            Err(status) => {
                debug!("rejecting post with tag {tag}: {status}");
                self.deliver_fault(tag, user.user, user.sge, status, reply);
                return;
            }
        };

        // a busy namespace never makes it onto the wire; the residual attach count rides in
        // the completion
        if user.opcode == Opcode::NsDelete {
            if let Some(ns) = &user.ns {
                if let Err(count) = Namespace::destroy(ns) {
                    let mut completion = Box::<Completion>::default();
                    completion.status = ErrorCode::NsBusy;
                    completion.rc = count;
                    completion.user = user.user;
                    completion.handle = Handle::Namespace(ns.clone());
                    self.route(
                        Delivery {
                            tag,
                            completion,
                            sge: user.sge,
                        },
                        reply,
                    );
                    return;
                }
            }
        }

        // first ITERATOR step: issue the cursor this traversal will ride on
        if user.opcode == Opcode::Iterator && req.iterator().is_none() {
            let id = self.iterators.new_iterator();
            req.set_iterator(id);
        }

        self.pending.push_back(Flight { tag, req, reply });
    }

    /// Serialize and send every pending request's current stage, in post order.
    pub fn flush_sends(&mut self) {
        while let Some(mut flight) = self.pending.pop_front() {
            self.refresh_iterator_cursor(&mut flight.req);

            self.buf.reset();
            let mut cmd: Vec<CmdSge> = Vec::new();
            if let Err(e) = create_command(&flight.req, &mut self.buf, &mut cmd) {
                warn!("building command for tag {} failed: {e}", flight.tag);
                let status = match e {
                    CreateError::KeyTooLong => ErrorCode::NsInval,
                    _ => ErrorCode::BePost,
                };
                self.fault_flight(flight, status);
                continue;
            }

            if let Err(e) = self.stream.write_all(self.buf.as_slice()) {
                warn!("send for tag {} failed: {e}", flight.tag);
                self.fault_flight(flight, ErrorCode::NoConnect);
                continue;
            }

            self.inflight.push_back(flight);
        }
    }

    /// Read one reply and feed it to the completion engine for the oldest in-flight request.
    pub fn consume_one(&mut self) {
        let Some(mut flight) = self.inflight.pop_front() else {
            return;
        };

        let (value, rc) = match parse_reply(&mut self.stream) {
            Ok(value) => {
                let rc = rc_for_reply(&value);
                (value, rc)
            }
            Err(e) => {
                warn!("reading reply for tag {} failed: {e}", flight.tag);
                (Value::Nil, -(libc::EPROTO as i64))
            }
        };

        // tombstoned request: the cancel completion already went out, the late reply is
        // dropped on the floor
        if flight.req.is_cancelled() {
            trace!("discarding reply for cancelled tag {}", flight.tag);
            return;
        }

        match complete_command(&mut flight.req, &value, rc, &mut self.iterators) {
            Ok(None) => {
                // advanced to the next stage; goes back to the send queue
                self.pending.push_back(flight);
            }
            Ok(Some(completion)) => {
                let sge = flight.req.take_sge();
                let reply = flight.reply.take();
                self.route(
                    Delivery {
                        tag: flight.tag,
                        completion,
                        sge,
                    },
                    reply,
                );
            }
            Err(e) => {
                // the engine refused the reply; nothing sensible left to deliver
                warn!("completion for tag {} refused: {e}", flight.tag);
            }
        }
    }

    fn cancel(&mut self, tag: Tag) {
        if let Some(at) = self.pending.iter().position(|f| f.tag == tag) {
            let mut flight = self.pending.remove(at).unwrap();
            if let Some(completion) = complete_cancel(&mut flight.req) {
                let sge = flight.req.take_sge();
                let reply = flight.reply.take();
                self.route(
                    Delivery {
                        tag,
                        completion,
                        sge,
                    },
                    reply,
                );
            }
            return;
        }

        if let Some(flight) = self.inflight.iter_mut().find(|f| f.tag == tag) {
            // in flight: complete now, leave the tombstone queued so the reply is drained
            if let Some(completion) = complete_cancel(&mut flight.req) {
                let sge = flight.req.take_sge();
                let reply = flight.reply.take();
                let delivery = Delivery {
                    tag,
                    completion,
                    sge,
                };
                match reply {
                    Some(tx) => {
                        let _ = tx.send(delivery);
                    }
                    None => {
                        let _ = self.outbox.send(delivery);
                    }
                }
            }
            return;
        }

        debug!("cancel for unknown tag {tag}");
    }

    /// ITERATOR commands are built from the cursor as the list knows it.
    fn refresh_iterator_cursor(&mut self, req: &mut Request) {
        if let Some(id) = req.iterator() {
            let cursor = self.iterators.get(id).map(|it| it.cursor);
            if let (Some(cursor), StageState::Iterator { cursor: snap, .. }) =
                (cursor, req.state_mut())
            {
                *snap = cursor;
            }
        }
    }

    fn fault_flight(&mut self, mut flight: Flight, status: ErrorCode) {
        let user = flight.req.user().user;
        let sge = flight.req.take_sge();
        let reply = flight.reply.take();
        self.deliver_fault(flight.tag, user, sge, status, reply);
    }

    /// Build and route an error completion without going through the completion engine.
    /// Used for failures before a reply exists (allocation, build, send).
    fn deliver_fault(
        &mut self,
        tag: Tag,
        user: u64,
        sge: Vec<Sge>,
        status: ErrorCode,
        reply: Option<Sender<Delivery>>,
    ) {
        let mut completion = Box::<Completion>::default();
        completion.status = status;
        completion.user = user;
        self.route(
            Delivery {
                tag,
                completion,
                sge,
            },
            reply,
        );
    }

    fn route(&mut self, delivery: Delivery, reply: Option<Sender<Delivery>>) {
        let result = match reply {
            Some(tx) => tx.send(delivery),
            None => self.outbox.send(delivery),
        };
        if result.is_err() {
            debug!("completion receiver went away");
        }
    }

    /// On shutdown every request that has not completed gets a CANCELLED completion, so the
    /// one-completion-per-post guarantee holds even across teardown.
    fn drain_on_shutdown(&mut self) {
        let flights: Vec<Flight> = self
            .pending
            .drain(..)
            .chain(self.inflight.drain(..))
            .collect();

        for mut flight in flights {
            if let Some(completion) = complete_cancel(&mut flight.req) {
                let sge = flight.req.take_sge();
                let reply = flight.reply.take();
                self.route(
                    Delivery {
                        tag: flight.tag,
                        completion,
                        sge,
                    },
                    reply,
                );
            }
        }
    }
}

/// Map a parsed reply onto the numeric rc the completion engine consumes. Clean replies are
/// rc 0; server-side error strings are classified into the errno-style codes the translation
/// table understands.
pub fn rc_for_reply(value: &Value) -> i64 {
    let Value::Error(message) = value else {
        return 0;
    };

    let rc = if message.starts_with("WRONGTYPE") {
        -(libc::EBADMSG as i64)
    } else if message.starts_with("BUSYKEY") {
        -(libc::EEXIST as i64)
    } else if message.contains("no such key") {
        -(libc::ENOENT as i64)
    } else if message.starts_with("OOM") {
        -(libc::ENOMEM as i64)
    } else {
        -(libc::EPROTO as i64)
    };

    debug!("server error {message:?} classified as rc {rc}");
    rc
}
