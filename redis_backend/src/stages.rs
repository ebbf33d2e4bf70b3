// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::types::Opcode;
use resp_protocol::Value;

/// Top-level RESP type a stage expects on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Int,
    /// Simple or bulk string.
    Bulk,
    Array,
    Any,
}

impl Expect {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Expect::Int => matches!(value, Value::Int(_)),
            Expect::Bulk => matches!(value, Value::String(_)),
            Expect::Array => matches!(value, Value::Array(_)),
            Expect::Any => true,
        }
    }
}

/// One protocol round-trip within an opcode's command sequence.
///
/// `next` is the stage entered on a successful non-terminal result. A terminal stage with
/// `next` equal to its own index repeats itself: DIRECTORY keeps re-issuing its scan until
/// the server cursor says it is done.
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub expect: Expect,
    pub terminal: bool,
    pub next: usize,
}

static PUT_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Int,
    terminal: true,
    next: 0,
}];

static GET_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Any,
    terminal: true,
    next: 0,
}];

static REMOVE_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Int,
    terminal: true,
    next: 0,
}];

static DIRECTORY_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Any,
    terminal: true,
    next: 0,
}];

static ITERATOR_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Any,
    terminal: true,
    next: 0,
}];

static MOVE_STAGES: [StageSpec; 3] = [
    // dump the source value; a nil reply (missing source) is still a valid result here
    StageSpec {
        expect: Expect::Any,
        terminal: false,
        next: 1,
    },
    // restore it under the destination namespace
    StageSpec {
        expect: Expect::Bulk,
        terminal: false,
        next: 2,
    },
    // delete the source
    StageSpec {
        expect: Expect::Int,
        terminal: true,
        next: 2,
    },
];

static NSCREATE_STAGES: [StageSpec; 2] = [
    // allocate the namespace record
    StageSpec {
        expect: Expect::Int,
        terminal: false,
        next: 1,
    },
    // verify it exists by taking the creator's attach
    StageSpec {
        expect: Expect::Int,
        terminal: true,
        next: 1,
    },
];

static NSATTACH_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Int,
    terminal: true,
    next: 0,
}];

static NSDETACH_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Int,
    terminal: true,
    next: 0,
}];

static NSDELETE_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Int,
    terminal: true,
    next: 0,
}];

static NSQUERY_STAGES: [StageSpec; 1] = [StageSpec {
    expect: Expect::Any,
    terminal: true,
    next: 0,
}];

/// Stage table lookup. UNSPEC and CANCEL have no command sequence; completing against them is
/// a protocol error the caller reports.
pub fn stage_spec(opcode: Opcode, stage: usize) -> Option<&'static StageSpec> {
    stage_table(opcode)?.get(stage)
}

/// Number of stages the opcode runs through.
pub fn stage_count(opcode: Opcode) -> usize {
    stage_table(opcode).map_or(0, <[StageSpec]>::len)
}

fn stage_table(opcode: Opcode) -> Option<&'static [StageSpec]> {
    Some(match opcode {
        Opcode::Put => &PUT_STAGES,
        Opcode::Get | Opcode::Read => &GET_STAGES,
        Opcode::Remove => &REMOVE_STAGES,
        Opcode::Directory => &DIRECTORY_STAGES,
        Opcode::Iterator => &ITERATOR_STAGES,
        Opcode::Move => &MOVE_STAGES,
        Opcode::NsCreate => &NSCREATE_STAGES,
        Opcode::NsAttach => &NSATTACH_STAGES,
        Opcode::NsDetach => &NSDETACH_STAGES,
        Opcode::NsDelete => &NSDELETE_STAGES,
        Opcode::NsQuery => &NSQUERY_STAGES,
        Opcode::Unspec | Opcode::Cancel => return None,
    })
}
