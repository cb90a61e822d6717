//! Integration tests: every fault point surfaces its exact error, and the
//! next build on the same server succeeds.

#![allow(missing_docs)]
#![allow(clippy::cast_possible_truncation)]

mod common;

use std::sync::Arc;

use common::{TestServer, build_with, float_records, random_vectors};
use extidx_client::{BuildParams, BuildSession};
use extidx_core::failure_point::{
    CHECK_LITTLE_ENDIAN, CHECK_PROTOCOL_VERSION, CONNECT_ELAPSED, CONNECT_FETCH_ERROR,
    CONNECT_INITIATE, CONNECT_PENDING_ERROR, CONNECT_RESTORE_BLOCKING, CONNECT_WAIT, END_MESSAGE,
    FailurePoint, RECV_HEADER, REQUEST_SIZE_CHECK, RESPONSE_SIZE_CHECK, SERVER_BUILD,
    SET_RECV_TIMEOUT, SET_SEND_TIMEOUT, SOCKET_CREATE,
};
use extidx_core::protocol::{IndexHeader, MetricKind};
use extidx_core::{ErrorKind, FailurePoints, ProtocolResult};

// =============================================================================
// Helpers
// =============================================================================

const ROWS: usize = 50;
const DIMS: usize = 8;

fn params() -> BuildParams {
    BuildParams::new(DIMS as u32, MetricKind::L2sq).with_m(4)
}

/// Arms `point` on the client, expects `message`, then builds again.
fn assert_client_point(server: &TestServer, point: FailurePoint, message: &str) {
    let points = Arc::new(FailurePoints::new());
    points.enable(point.func, point.name, 0).unwrap();
    let vectors = random_vectors(ROWS, DIMS, 3);

    let mut stored = false;
    let mut sink = |_: &IndexHeader, _: Vec<u8>| -> ProtocolResult<()> {
        stored = true;
        Ok(())
    };
    let err = BuildSession::new(server.client_config(), Arc::clone(&points))
        .run(&params(), float_records(&vectors), &mut sink)
        .unwrap_err();
    assert_eq!(err.to_string(), message, "point {}", point.name);
    assert!(!stored, "sink called after failure at {}", point.name);

    let (outcome, body) =
        build_with(server.client_config(), points, &params(), float_records(&vectors)).unwrap();
    assert_eq!(outcome.header.num_vectors, ROWS as u64);
    assert_eq!(body.len() as u64, outcome.header.body_size);
}

// =============================================================================
// Connection setup
// =============================================================================

#[test]
fn test_socket_create() {
    let server = TestServer::start();
    assert_client_point(&server, SOCKET_CREATE, "external index: socket creation failed");
}

#[test]
fn test_connect_steps() {
    let server = TestServer::start();
    for point in [
        CONNECT_INITIATE,
        CONNECT_WAIT,
        CONNECT_ELAPSED,
        CONNECT_FETCH_ERROR,
        CONNECT_PENDING_ERROR,
        CONNECT_RESTORE_BLOCKING,
    ] {
        assert_client_point(&server, point, "external index: connect timeout");
    }
}

#[test]
fn test_socket_timeouts() {
    let server = TestServer::start();
    assert_client_point(
        &server,
        SET_SEND_TIMEOUT,
        "external index: failed to set send timeout for socket",
    );
    assert_client_point(
        &server,
        SET_RECV_TIMEOUT,
        "external index: failed to set receive timeout for socket",
    );
}

// =============================================================================
// Handshake
// =============================================================================

#[test]
fn test_little_endian_check() {
    let server = TestServer::start();
    assert_client_point(
        &server,
        CHECK_LITTLE_ENDIAN,
        "external indexing is supported only for little endian byte ordering",
    );
}

#[test]
fn test_protocol_version_check() {
    let server = TestServer::start();
    assert_client_point(
        &server,
        CHECK_PROTOCOL_VERSION,
        "external index protocol version mismatch - client version: 1, server version: 1",
    );
}

// =============================================================================
// Transfer
// =============================================================================

#[test]
fn test_short_transfers() {
    let server = TestServer::start();
    assert_client_point(&server, RESPONSE_SIZE_CHECK, "external index socket read failed");
    assert_client_point(&server, REQUEST_SIZE_CHECK, "external index socket send failed");
}

#[test]
fn test_end_message_replaced() {
    let server = TestServer::start();
    assert_client_point(
        &server,
        END_MESSAGE,
        "external index error: Invalid message header",
    );
}

#[test]
fn test_invalid_header() {
    let server = TestServer::start();
    assert_client_point(&server, RECV_HEADER, "received invalid index header");
}

#[test]
fn test_server_build_failure() {
    let server = TestServer::start();
    server
        .points
        .enable(SERVER_BUILD.func, SERVER_BUILD.name, 0)
        .unwrap();

    let vectors = random_vectors(ROWS, DIMS, 9);
    let err = server.build(&params(), float_records(&vectors)).unwrap_err();
    assert_eq!(err.to_string(), "external index error: index build failed");
    assert_eq!(err.kind(), ErrorKind::Build);

    let (outcome, _) = server.build(&params(), float_records(&vectors)).unwrap();
    assert_eq!(outcome.header.num_vectors, ROWS as u64);
}

#[test]
fn test_countdown_delays_trigger() {
    let server = TestServer::start();
    server
        .points
        .enable(SERVER_BUILD.func, SERVER_BUILD.name, 1)
        .unwrap();
    let vectors = random_vectors(ROWS, DIMS, 11);

    assert!(server.build(&params(), float_records(&vectors)).is_ok());
    assert!(server.build(&params(), float_records(&vectors)).is_err());
    assert!(server.build(&params(), float_records(&vectors)).is_ok());
}
