// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod api;
pub mod buffer;
pub mod complete;
pub mod create;
pub mod iterator;
pub mod namespace;
pub mod request;
pub mod stages;
pub mod types;
pub mod worker;

pub use api::Broker;
pub use iterator::{IteratorId, IteratorList, ScanIterator};
pub use namespace::{Namespace, NsHandle, NS_NAME_MAX};
pub use request::Request;
pub use types::{
    Completion, ErrorCode, Group, Handle, Opcode, RequestFlags, Sge, Tag, UserRequest,
};
