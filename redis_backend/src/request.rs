// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use crate::create::KEY_MAX;
use crate::iterator::IteratorId;
use crate::stages;
use crate::types::{Completion, ErrorCode, Opcode, RequestFlags, Sge, UserRequest};

/// Per-opcode progress state carried across stages.
#[derive(Debug, Default)]
pub enum StageState {
    #[default]
    None,

    /// DIRECTORY keeps the server scan cursor and how much of the user buffer is filled.
    Directory { cursor: u64, filled: usize },

    /// ITERATOR keeps the issued iterator handle and a snapshot of its cursor for the next
    /// command build.
    Iterator {
        it: Option<IteratorId>,
        cursor: u64,
    },

    /// MOVE stashes the dumped source value between the dump and restore stages.
    Move { dump: Option<Vec<u8>> },
}

/// Engine-internal lifecycle record for one posted request.
///
/// Owned and mutated by the transport worker only. Exactly one completion leaves a request,
/// after which it is terminal and any further completion attempt is a protocol error.
#[derive(Debug)]
pub struct Request {
    user: UserRequest,
    stage: usize,
    flags: RequestFlags,
    state: StageState,
    completion: Option<Box<Completion>>,
    cancelled: bool,
    terminal: bool,
}

impl Request {
    /// Build a request record from a user request: validates the opcode and key, snapshots
    /// the flags and the scatter/gather vector, and initializes stage 0.
    pub fn allocate(user: &UserRequest) -> Result<Box<Request>, ErrorCode> {
        match user.opcode {
            Opcode::Unspec => return Err(ErrorCode::Invalid),
            // CANCEL rides the control channel, it is not postable as a request
            Opcode::Cancel => return Err(ErrorCode::NoImpl),
            _ => {}
        }

        if user.key.len() > KEY_MAX {
            return Err(ErrorCode::NsInval);
        }

        let state = match user.opcode {
            Opcode::Directory => StageState::Directory {
                cursor: 0,
                filled: 0,
            },
            Opcode::Iterator => StageState::Iterator {
                it: user.it,
                cursor: 0,
            },
            Opcode::Move => StageState::Move { dump: None },
            _ => StageState::None,
        };

        trace!("allocating {:?} request, key {:?}", user.opcode, user.key);

        Ok(Box::new(Request {
            user: user.clone(),
            stage: 0,
            flags: user.flags,
            state,
            completion: None,
            cancelled: false,
            terminal: false,
        }))
    }

    pub fn opcode(&self) -> Opcode {
        self.user.opcode
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn user(&self) -> &UserRequest {
        &self.user
    }

    pub fn state(&self) -> &StageState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StageState {
        &mut self.state
    }

    pub fn sge_mut(&mut self) -> &mut [Sge] {
        &mut self.user.sge
    }

    /// Hand the (possibly filled) scatter/gather list back, leaving the request empty.
    pub fn take_sge(&mut self) -> Vec<Sge> {
        std::mem::take(&mut self.user.sge)
    }

    /// The iterator this request operates on, if one has been assigned.
    pub fn iterator(&self) -> Option<IteratorId> {
        match self.state {
            StageState::Iterator { it, .. } => it,
            _ => None,
        }
    }

    pub fn set_iterator(&mut self, id: IteratorId) {
        if let StageState::Iterator { it, .. } = &mut self.state {
            *it = Some(id);
        }
    }

    /// Pre-attach a completion record. The completion engine fills and returns this exact
    /// record instead of allocating a fresh one.
    pub fn attach_completion(&mut self, completion: Box<Completion>) {
        self.completion = Some(completion);
    }

    pub fn take_completion_slot(&mut self) -> Option<Box<Completion>> {
        self.completion.take()
    }

    /// Advance to the current stage's successor. Fails once the request is terminal or the
    /// current stage has no further stage to go to.
    pub fn stage_transition(&mut self) -> Result<(), ErrorCode> {
        if self.terminal {
            return Err(ErrorCode::InvalidOp);
        }

        let Some(spec) = stages::stage_spec(self.opcode(), self.stage) else {
            return Err(ErrorCode::BeGeneral);
        };
        if spec.terminal {
            return Err(ErrorCode::InvalidOp);
        }

        trace!(
            "{:?} stage transition {} -> {}",
            self.opcode(),
            self.stage,
            spec.next
        );
        self.stage = spec.next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn mark_terminal(&mut self) {
        self.terminal = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }
}
