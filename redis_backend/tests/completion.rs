// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Completion-engine coverage: for every opcode, the translation of backend rc values into
//! user-visible status codes, including the per-opcode special cases, plus cancellation and
//! the stage walks of the multi-stage opcodes.

use redis_backend::complete::{complete_cancel, complete_command, CompleteError};
use redis_backend::{
    Completion, ErrorCode, IteratorList, Namespace, Opcode, Request, RequestFlags, Sge,
    UserRequest,
};
use resp_protocol::Value;

const COOKIE: u64 = 0xAA;
const DATALEN: i64 = 126;

fn neg(errno: i32) -> i64 {
    -(errno as i64)
}

fn usr(opcode: Opcode, key: &str, sge: Vec<Sge>) -> UserRequest {
    UserRequest {
        opcode,
        key: key.to_string(),
        user: COOKIE,
        sge,
        ..Default::default()
    }
}

/// Allocate a fresh request for `user`, feed it one (result, rc) pair, and hand back the
/// terminal completion it must produce.
fn complete_one(user: &UserRequest, result: &Value, in_rc: i64) -> Box<Completion> {
    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(user).unwrap();

    complete_command(&mut req, result, in_rc, &mut iterators)
        .expect("completion engine refused the request")
        .expect("expected a terminal completion")
}

fn check(user: &UserRequest, result: &Value, in_rc: i64, status: ErrorCode, rc: i64) {
    let completion = complete_one(user, result, in_rc);
    assert_eq!(completion.status, status, "status for rc {in_rc}");
    assert_eq!(completion.rc, rc, "rc for rc {in_rc}");
    assert_eq!(completion.user, user.user);
}

/// The rc translations every opcode shares.
fn check_common_errors(user: &UserRequest, result: &Value) {
    // a protocol failure: general error in backend
    check(user, result, neg(libc::EPROTO), ErrorCode::BeGeneral, 0);
    // an invalid parameter occurred
    check(user, result, neg(libc::EINVAL), ErrorCode::Invalid, 0);
    // an unexpected result type got returned
    check(user, result, neg(libc::EBADMSG), ErrorCode::Invalid, 0);
    // somewhere running out of memory
    check(user, result, neg(libc::ENOMEM), ErrorCode::NoMemory, 0);
}

fn check_cancel(user: &UserRequest) {
    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(user).unwrap();

    let completion = complete_cancel(&mut req).unwrap();
    assert_eq!(completion.status, ErrorCode::Cancelled);
    assert_eq!(completion.rc, 0);
    assert_eq!(completion.user, user.user);

    // the reply that may still arrive must not produce a second completion
    let err = complete_command(&mut req, &Value::Int(0), 0, &mut iterators).unwrap_err();
    assert_eq!(err, CompleteError::Protocol);

    // and cancelling again yields nothing
    assert!(complete_cancel(&mut req).is_none());
}

#[test]
fn put() {
    let user = usr(Opcode::Put, "k", vec![Sge::from_slice(b"v")]);

    // a regular successful put: the server reports one value under the key
    check(&user, &Value::Int(1), 0, ErrorCode::Success, 1);

    check_common_errors(&user, &Value::Int(0));

    // the reply must be an integer
    check(&user, &Value::Nil, 0, ErrorCode::Invalid, 0);

    check_cancel(&user);
}

#[test]
fn get() {
    let user = usr(Opcode::Get, "k", vec![Sge::with_len(DATALEN as usize)]);

    // a regular successful get, size pre-reported by the receive path
    check(&user, &Value::Int(DATALEN), 0, ErrorCode::Success, DATALEN);

    check_common_errors(&user, &Value::Int(DATALEN));

    // access to an unavailable tuple
    check(&user, &Value::Int(DATALEN), neg(libc::ENOENT), ErrorCode::Unavail, 0);

    // user buffer too small without requesting partial data: rc carries the needed size
    check(
        &user,
        &Value::Int(DATALEN * 2),
        neg(libc::ENOSPC),
        ErrorCode::Ubuffer,
        DATALEN * 2,
    );

    // user buffer too small AND requesting partial data: truncation is accepted silently
    let mut partial = user.clone();
    partial.flags = RequestFlags::PARTIAL;
    check(&partial, &Value::Int(DATALEN * 2), 0, ErrorCode::Success, DATALEN * 2);

    check_cancel(&user);
}

#[test]
fn get_buffer_too_small_literal() {
    // user buffer of 64 bytes, value of 126 bytes
    let user = usr(Opcode::Get, "k", vec![Sge::with_len(64)]);

    check(
        &user,
        &Value::Int(126),
        neg(libc::ENOSPC),
        ErrorCode::Ubuffer,
        126,
    );

    let mut partial = user.clone();
    partial.flags = RequestFlags::PARTIAL;
    check(&partial, &Value::Int(126), 0, ErrorCode::Success, 126);
}

#[test]
fn get_delivers_value_into_user_buffer() {
    let user = usr(Opcode::Get, "k", vec![Sge::with_len(16)]);

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();
    let completion = complete_command(&mut req, &Value::String(b"hello".to_vec()), 0, &mut iterators)
        .unwrap()
        .unwrap();

    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 5);
    assert_eq!(&req.take_sge()[0].base[..5], b"hello");
}

#[test]
fn get_scatters_across_elements() {
    let user = usr(
        Opcode::Get,
        "k",
        vec![Sge::with_len(3), Sge::with_len(8)],
    );

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();
    let completion = complete_command(
        &mut req,
        &Value::String(b"abcdefgh".to_vec()),
        0,
        &mut iterators,
    )
    .unwrap()
    .unwrap();

    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 8);

    let sge = req.take_sge();
    assert_eq!(sge[0].base, b"abc");
    assert_eq!(&sge[1].base[..5], b"defgh");
}

#[test]
fn get_missing_key_is_unavailable() {
    let user = usr(Opcode::Get, "k", vec![Sge::with_len(16)]);
    check(&user, &Value::Nil, 0, ErrorCode::Unavail, 0);
}

#[test]
fn remove() {
    let user = usr(Opcode::Remove, "k", vec![]);

    // a regular successful remove
    check(&user, &Value::Int(1), 0, ErrorCode::Success, 0);

    check_common_errors(&user, &Value::Int(0));

    // removed something that doesn't exist
    check(&user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::Unavail, 0);

    check_cancel(&user);
}

#[test]
fn mv_error_translation() {
    let user = usr(Opcode::Move, "k", vec![]);

    check_common_errors(&user, &Value::Int(0));

    // access to an unavailable tuple
    check(&user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::Unavail, 0);

    // existing destination
    check(&user, &Value::Int(0), neg(libc::EEXIST), ErrorCode::Exists, 0);

    // error while attempting to delete the source
    check(&user, &Value::Int(0), neg(libc::ESTALE), ErrorCode::NoFile, 0);

    check_cancel(&user);
}

#[test]
fn mv_walks_all_three_stages() {
    let src = Namespace::create("src").unwrap();
    let dst = Namespace::create("dst").unwrap();
    let mut user = usr(Opcode::Move, "k", vec![]);
    user.ns = Some(src);
    user.dest_ns = Some(dst);

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();

    // dump the source value
    let dump = Value::String(b"\x00serialized\x01".to_vec());
    assert!(complete_command(&mut req, &dump, 0, &mut iterators)
        .unwrap()
        .is_none());
    assert_eq!(req.stage(), 1);

    // restore acknowledged on the destination
    let ok = Value::String(b"OK".to_vec());
    assert!(complete_command(&mut req, &ok, 0, &mut iterators)
        .unwrap()
        .is_none());
    assert_eq!(req.stage(), 2);

    // source deleted
    let completion = complete_command(&mut req, &Value::Int(1), 0, &mut iterators)
        .unwrap()
        .unwrap();
    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 0);
}

#[test]
fn mv_source_delete_failure_literal() {
    let mut user = usr(Opcode::Move, "k", vec![]);
    user.ns = Some(Namespace::create("src").unwrap());
    user.dest_ns = Some(Namespace::create("dst").unwrap());

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();

    // stages 0 and 1 advance on success
    let dump = Value::String(b"payload".to_vec());
    assert!(complete_command(&mut req, &dump, 0, &mut iterators)
        .unwrap()
        .is_none());
    let ok = Value::String(b"OK".to_vec());
    assert!(complete_command(&mut req, &ok, 0, &mut iterators)
        .unwrap()
        .is_none());

    // stage 2 fails to delete the source
    let completion =
        complete_command(&mut req, &Value::Nil, neg(libc::ESTALE), &mut iterators)
            .unwrap()
            .unwrap();
    assert_eq!(completion.status, ErrorCode::NoFile);
    assert_eq!(completion.rc, 0);
    assert_eq!(completion.user, COOKIE);
}

#[test]
fn directory() {
    let user = usr(Opcode::Directory, "", vec![Sge::with_len(DATALEN as usize)]);

    // a regular successful directory, byte count pre-reported by the receive path
    check(&user, &Value::Int(DATALEN), 0, ErrorCode::Success, DATALEN);

    check_common_errors(&user, &Value::Int(DATALEN));

    // trying to list a namespace that doesn't exist
    check(&user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::Unavail, 0);

    // encountered a key that has no separator
    check(&user, &Value::Int(0), neg(libc::EILSEQ), ErrorCode::Iterator, 0);

    check_cancel(&user);
}

fn scan_reply(cursor: &str, keys: &[&[u8]]) -> Value {
    Value::Array(vec![
        Value::String(cursor.as_bytes().to_vec()),
        Value::Array(keys.iter().map(|k| Value::String(k.to_vec())).collect()),
    ])
}

#[test]
fn directory_loops_until_cursor_zero() {
    let mut user = usr(Opcode::Directory, "", vec![Sge::with_len(64)]);
    user.ns = Some(Namespace::create("ns").unwrap());

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();

    // first batch: cursor still live, stage repeats
    let batch = scan_reply("17", &[b"ns:alpha", b"ns:beta"]);
    assert!(complete_command(&mut req, &batch, 0, &mut iterators)
        .unwrap()
        .is_none());
    assert_eq!(req.stage(), 0);

    // final batch: cursor 0 terminates with the accumulated listing
    let batch = scan_reply("0", &[b"ns:gamma"]);
    let completion = complete_command(&mut req, &batch, 0, &mut iterators)
        .unwrap()
        .unwrap();
    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, b"alpha\nbeta\ngamma\n".len() as i64);

    let listing = req.take_sge();
    assert_eq!(&listing[0].base[..17], b"alpha\nbeta\ngamma\n");
}

#[test]
fn directory_rejects_key_without_separator() {
    let mut user = usr(Opcode::Directory, "", vec![Sge::with_len(64)]);
    user.ns = Some(Namespace::create("ns").unwrap());

    let batch = scan_reply("0", &[b"stray-key"]);
    check(&user, &batch, 0, ErrorCode::Iterator, 0);
}

#[test]
fn directory_overflows_into_ubuffer() {
    let mut user = usr(Opcode::Directory, "", vec![Sge::with_len(4)]);
    user.ns = Some(Namespace::create("ns").unwrap());

    let batch = scan_reply("0", &[b"ns:much-too-long"]);
    check(&user, &batch, 0, ErrorCode::Ubuffer, b"much-too-long\n".len() as i64);
}

#[test]
fn nscreate() {
    let ns = Namespace::create("testkey").unwrap();
    let mut user = usr(Opcode::NsCreate, "testkey", vec![]);
    user.ns = Some(ns.clone());

    // the namespace name is too long
    check(&user, &Value::Int(0), neg(libc::E2BIG), ErrorCode::NsInval, 0);

    // the namespace already exists
    check(&user, &Value::Int(0), neg(libc::EEXIST), ErrorCode::Exists, 0);

    // corrupted namespace during creation (verify stage failed to find it)
    check(&user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::NoFile, 0);

    check_common_errors(&user, &Value::Int(0));

    check_cancel(&user);
}

#[test]
fn nscreate_success_carries_the_handle() {
    let ns = Namespace::create("testkey").unwrap();
    let mut user = usr(Opcode::NsCreate, "testkey", vec![]);
    user.ns = Some(ns.clone());

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();

    // record allocated
    assert!(complete_command(&mut req, &Value::Int(1), 0, &mut iterators)
        .unwrap()
        .is_none());
    assert_eq!(req.stage(), 1);

    // verified
    let completion = complete_command(&mut req, &Value::Int(1), 0, &mut iterators)
        .unwrap()
        .unwrap();
    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 0);

    let redis_backend::Handle::Namespace(handle) = &completion.handle else {
        panic!("expected a namespace handle in the completion");
    };
    assert!(std::sync::Arc::ptr_eq(handle, &ns));
}

#[test]
fn nscreate_existing_record_completes_exists() {
    let mut user = usr(Opcode::NsCreate, "testkey", vec![]);
    user.ns = Some(Namespace::create("testkey").unwrap());

    // HSETNX answering 0: the record was already there
    check(&user, &Value::Int(0), 0, ErrorCode::Exists, 0);
}

#[test]
fn nscreate_verify_stage_missing_literal() {
    let mut user = usr(Opcode::NsCreate, "testkey", vec![]);
    user.ns = Some(Namespace::create("testkey").unwrap());

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();

    // first stage success advances
    assert!(complete_command(&mut req, &Value::Int(1), 0, &mut iterators)
        .unwrap()
        .is_none());

    // the record is gone at the verify stage
    let completion =
        complete_command(&mut req, &Value::Nil, neg(libc::ENOENT), &mut iterators)
            .unwrap()
            .unwrap();
    assert_eq!(completion.status, ErrorCode::NoFile);
    assert_eq!(completion.rc, 0);
}

#[test]
fn nsattach() {
    let ns = Namespace::create("testkey").unwrap();
    let mut user = usr(Opcode::NsAttach, "testkey", vec![]);
    user.ns = Some(ns.clone());

    // a regular successful nsattach carries the handle, not a numeric identity
    let completion = complete_one(&user, &Value::Int(2), 0);
    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 0);
    let redis_backend::Handle::Namespace(handle) = &completion.handle else {
        panic!("expected a namespace handle in the completion");
    };
    assert!(std::sync::Arc::ptr_eq(handle, &ns));

    // the namespace name is too long
    check(&user, &Value::Int(0), neg(libc::E2BIG), ErrorCode::NsInval, 0);

    // namespace manager data corruption, not "already attached"
    check(&user, &Value::Int(0), neg(libc::EEXIST), ErrorCode::NoFile, 0);

    // namespace not available
    check(&user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::Unavail, 0);

    // too many attached clients (overflow)
    check(&user, &Value::Int(0), neg(libc::EOVERFLOW), ErrorCode::InvalidOp, 0);

    check_common_errors(&user, &Value::Int(0));

    check_cancel(&user);
}

#[test]
fn nsdetach() {
    let mut user = usr(Opcode::NsDetach, "testkey", vec![]);
    user.ns = Some(Namespace::create("testkey").unwrap());

    // a regular successful nsdetach
    check(&user, &Value::Int(0), 0, ErrorCode::Success, 0);

    // namespace manager data corruption
    check(&user, &Value::Int(0), neg(libc::EEXIST), ErrorCode::NoFile, 0);

    // namespace not available
    check(&user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::Unavail, 0);

    // too many attached clients (overflow)
    check(&user, &Value::Int(0), neg(libc::EOVERFLOW), ErrorCode::InvalidOp, 0);

    check_common_errors(&user, &Value::Int(0));

    check_cancel(&user);
}

#[test]
fn nsdelete() {
    let mut user = usr(Opcode::NsDelete, "testkey", vec![]);
    user.ns = Some(Namespace::create("testkey").unwrap());

    // delete of a busy namespace: the residual attach count rides in result and rc
    check(&user, &Value::Int(5), libc::EBUSY as i64, ErrorCode::NsBusy, 5);

    // a regular successful nsdelete
    check(&user, &Value::Int(1), 0, ErrorCode::Success, 0);

    // namespace manager data corruption
    check(&user, &Value::Int(0), neg(libc::EEXIST), ErrorCode::NoFile, 0);

    // namespace not available
    check(&user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::Unavail, 0);

    check_common_errors(&user, &Value::Int(0));

    check_cancel(&user);
}

#[test]
fn nsquery() {
    let mut user = usr(
        Opcode::NsQuery,
        "testkey",
        vec![Sge::with_len(DATALEN as usize)],
    );
    user.ns = Some(Namespace::create("testkey").unwrap());

    // a regular successful query, byte count pre-reported by the receive path
    check(&user, &Value::Int(DATALEN / 2), 0, ErrorCode::Success, DATALEN / 2);

    // metadata larger than the user buffer: rc carries the needed size
    check(
        &user,
        &Value::Int(DATALEN),
        neg(libc::ENOSPC),
        ErrorCode::Ubuffer,
        DATALEN,
    );

    // namespace not available
    check(&user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::Unavail, 0);

    check_common_errors(&user, &Value::Int(0));

    check_cancel(&user);
}

#[test]
fn nsquery_formats_metadata_pairs() {
    let mut user = usr(Opcode::NsQuery, "testkey", vec![Sge::with_len(64)]);
    user.ns = Some(Namespace::create("testkey").unwrap());

    let pairs = Value::Array(vec![
        Value::String(b"name".to_vec()),
        Value::String(b"testkey".to_vec()),
        Value::String(b"refcnt".to_vec()),
        Value::String(b"2".to_vec()),
    ]);

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();
    let completion = complete_command(&mut req, &pairs, 0, &mut iterators)
        .unwrap()
        .unwrap();

    let expected = b"name=testkey\nrefcnt=2\n";
    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, expected.len() as i64);
    assert_eq!(&req.take_sge()[0].base[..expected.len()], expected);
}

#[test]
fn nsquery_missing_namespace_is_unavailable() {
    let mut user = usr(Opcode::NsQuery, "testkey", vec![Sge::with_len(64)]);
    user.ns = Some(Namespace::create("testkey").unwrap());

    // HGETALL answers an empty reply for a record that does not exist
    check(&user, &Value::Array(vec![]), 0, ErrorCode::Unavail, 0);
}

#[test]
fn iterator() {
    let mut user = usr(
        Opcode::Iterator,
        "",
        vec![Sge::with_len(DATALEN as usize)],
    );
    user.ns = Some(Namespace::create("ns").unwrap());

    let mut iterators = IteratorList::new();
    let id = iterators.new_iterator();
    let mut it_user = user.clone();
    it_user.it = Some(id);

    // a regular successful iterator step
    let mut req = Request::allocate(&it_user).unwrap();
    let step = scan_reply("17", &[b"ns:alpha"]);
    let completion = complete_command(&mut req, &step, 0, &mut iterators)
        .unwrap()
        .unwrap();
    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 5);
    let redis_backend::Handle::Iterator(got) = completion.handle else {
        panic!("expected an iterator handle in the completion");
    };
    assert_eq!(got, id);
    assert_eq!(&req.take_sge()[0].base[..5], b"alpha");

    // the cursor and last key moved with the step
    assert_eq!(iterators.get(id).unwrap().cursor, 17);
    assert_eq!(iterators.get(id).unwrap().last_key, b"alpha");

    // errors translate like every other scanning operation
    check(&it_user, &Value::Int(0), neg(libc::ENOENT), ErrorCode::Unavail, 0);
    check(&it_user, &Value::Int(0), neg(libc::EILSEQ), ErrorCode::Iterator, 0);
    check_common_errors(&it_user, &Value::Int(0));

    check_cancel(&it_user);
}

#[test]
fn iterator_exhaustion_retires_the_handle() {
    let mut user = usr(Opcode::Iterator, "", vec![Sge::with_len(64)]);
    user.ns = Some(Namespace::create("ns").unwrap());

    let mut iterators = IteratorList::new();
    let id = iterators.new_iterator();
    user.it = Some(id);

    let mut req = Request::allocate(&user).unwrap();
    let done = scan_reply("0", &[]);
    let completion = complete_command(&mut req, &done, 0, &mut iterators)
        .unwrap()
        .unwrap();

    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 0);
    assert!(matches!(completion.handle, redis_backend::Handle::None));
    assert!(iterators.get(id).is_none());
}

#[test]
fn put_success_literal() {
    let user = UserRequest {
        opcode: Opcode::Put,
        key: "k".to_string(),
        user: 0xAA,
        sge: vec![Sge::from_slice(b"v")],
        ..Default::default()
    };

    let completion = complete_one(&user, &Value::Int(1), 0);
    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 1);
    assert_eq!(completion.user, 0xAA);
}

#[test]
fn nsdelete_busy_literal() {
    let mut user = usr(Opcode::NsDelete, "busy", vec![]);
    user.ns = Some(Namespace::create("busy").unwrap());

    let completion = complete_one(&user, &Value::Int(5), libc::EBUSY as i64);
    assert_eq!(completion.status, ErrorCode::NsBusy);
    assert_eq!(completion.rc, 5);
}

#[test]
fn preattached_completion_slot_is_reused() {
    let user = usr(Opcode::Put, "k", vec![Sge::from_slice(b"v")]);

    let mut iterators = IteratorList::new();
    let mut req = Request::allocate(&user).unwrap();

    let slot = Box::new(Completion::default());
    let slot_ptr: *const Completion = &*slot;
    req.attach_completion(slot);

    let completion = complete_command(&mut req, &Value::Int(1), 0, &mut iterators)
        .unwrap()
        .unwrap();

    // the very record that was attached comes back, filled in
    assert_eq!(slot_ptr, &*completion as *const Completion);
    assert_eq!(completion.status, ErrorCode::Success);
    assert_eq!(completion.rc, 1);
    assert_eq!(completion.user, COOKIE);
}

#[test]
fn unknown_rc_falls_back_to_backend_error() {
    let user = usr(Opcode::Put, "k", vec![Sge::from_slice(b"v")]);
    check(&user, &Value::Int(0), -9999, ErrorCode::BeGeneral, 0);
}
