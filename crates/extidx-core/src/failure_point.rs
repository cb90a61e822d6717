//! Fault-injection registry for deterministic error-path testing.
//!
//! Call sites in the transport, handshake and session code ask the registry
//! whether a named point is triggered; if so they short-circuit to the same
//! error a real failure at that step would produce.
//!
//! # Usage
//!
//! ```ignore
//! let points = Arc::new(FailurePoints::new());
//! points.enable("connect_with_timeout", "crash_after_connect", 0)?;
//!
//! // Next connect attempt fails with "external index: connect timeout".
//! ```
//!
//! # Semantics
//!
//! - A point is identified by `(func, name)` and must be registered in
//!   [`KNOWN_POINTS`].
//! - `enable(.., countdown)` lets `countdown` checks pass, triggers on the
//!   next one and then disarms itself.
//! - Nothing is reset between sessions; tests call [`FailurePoints::reset`]
//!   explicitly.
//!
//! The registry is a plain value passed to constructors, so independent tests
//! never share state. Without the `failure-points` feature it is a zero-sized
//! type and every check is a constant `false`.

#[cfg(feature = "failure-points")]
use std::collections::HashMap;
use std::fmt;
#[cfg(feature = "failure-points")]
use std::sync::{Mutex, PoisonError};

use crate::error::{ProtocolError, ProtocolResult};

/// A named fault-injection point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FailurePoint {
    /// Call site (function) the point lives in.
    pub func: &'static str,
    /// Label of the failure simulated at that call site.
    pub name: &'static str,
}

impl FailurePoint {
    /// Creates a point identifier.
    #[must_use]
    pub const fn new(func: &'static str, name: &'static str) -> Self {
        Self { func, name }
    }
}

impl fmt::Display for FailurePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func={} name={}", self.func, self.name)
    }
}

/// Socket allocation.
pub const SOCKET_CREATE: FailurePoint = FailurePoint::new("connect", "crash_after_socket_create");
/// Connection initiation.
pub const CONNECT_INITIATE: FailurePoint =
    FailurePoint::new("connect_with_timeout", "crash_after_connect");
/// Readiness wait.
pub const CONNECT_WAIT: FailurePoint =
    FailurePoint::new("connect_with_timeout", "crash_after_select");
/// Readiness wait elapsed.
pub const CONNECT_ELAPSED: FailurePoint =
    FailurePoint::new("connect_with_timeout", "crash_on_timeout");
/// Error-status fetch.
pub const CONNECT_FETCH_ERROR: FailurePoint =
    FailurePoint::new("connect_with_timeout", "crash_after_getsockopts");
/// Pending socket error.
pub const CONNECT_PENDING_ERROR: FailurePoint =
    FailurePoint::new("connect_with_timeout", "crash_after_getsockopts_err");
/// Blocking-mode restore.
pub const CONNECT_RESTORE_BLOCKING: FailurePoint =
    FailurePoint::new("connect_with_timeout", "crash_after_set_blocking");
/// Send timeout option.
pub const SET_SEND_TIMEOUT: FailurePoint =
    FailurePoint::new("set_write_timeout", "crash_after_set_send_timeout");
/// Receive timeout option.
pub const SET_RECV_TIMEOUT: FailurePoint =
    FailurePoint::new("set_read_timeout", "crash_after_set_recv_timeout");
/// Local byte order check.
pub const CHECK_LITTLE_ENDIAN: FailurePoint =
    FailurePoint::new("create_session", "crash_on_check_little_endian");
/// Protocol version comparison.
pub const CHECK_PROTOCOL_VERSION: FailurePoint =
    FailurePoint::new("create_session", "crash_on_protocol_version_check");
/// Response status check after every read.
pub const RESPONSE_SIZE_CHECK: FailurePoint =
    FailurePoint::new("check_response_status", "crash_on_response_size_check");
/// Request status check after every write.
pub const REQUEST_SIZE_CHECK: FailurePoint =
    FailurePoint::new("check_request_status", "crash_on_request_size_check");
/// End-of-stream marker; replaced by a metadata tag when triggered.
pub const END_MESSAGE: FailurePoint = FailurePoint::new("receive_metadata", "crash_on_end_msg");
/// Index header validation.
pub const RECV_HEADER: FailurePoint = FailurePoint::new("receive_header", "crash_after_recv_header");
/// Server-side index build.
pub const SERVER_BUILD: FailurePoint = FailurePoint::new("build_index", "crash_on_build");

/// Every registered point.
pub const KNOWN_POINTS: &[FailurePoint] = &[
    SOCKET_CREATE,
    CONNECT_INITIATE,
    CONNECT_WAIT,
    CONNECT_ELAPSED,
    CONNECT_FETCH_ERROR,
    CONNECT_PENDING_ERROR,
    CONNECT_RESTORE_BLOCKING,
    SET_SEND_TIMEOUT,
    SET_RECV_TIMEOUT,
    CHECK_LITTLE_ENDIAN,
    CHECK_PROTOCOL_VERSION,
    RESPONSE_SIZE_CHECK,
    REQUEST_SIZE_CHECK,
    END_MESSAGE,
    RECV_HEADER,
    SERVER_BUILD,
];

fn lookup(func: &str, name: &str) -> ProtocolResult<FailurePoint> {
    KNOWN_POINTS
        .iter()
        .copied()
        .find(|p| p.func == func && p.name == name)
        .ok_or_else(|| ProtocolError::UnknownFailurePoint {
            func: func.to_string(),
            name: name.to_string(),
        })
}

/// Registry of armed failure points.
#[derive(Default)]
pub struct FailurePoints {
    // Maps armed points to the number of checks still allowed to pass
    #[cfg(feature = "failure-points")]
    armed: Mutex<HashMap<FailurePoint, u32>>,
}

impl fmt::Debug for FailurePoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailurePoints")
            .field("compiled_in", &Self::COMPILED_IN)
            .finish_non_exhaustive()
    }
}

impl FailurePoints {
    /// Whether the registry was compiled in.
    pub const COMPILED_IN: bool = cfg!(feature = "failure-points");

    /// Creates an empty registry with every point inactive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a point so that it triggers after `countdown` passing checks.
    ///
    /// Re-enabling an armed point replaces its countdown.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownFailurePoint`] if `(func, name)` is not
    /// registered.
    pub fn enable(&self, func: &str, name: &str, countdown: u32) -> ProtocolResult<()> {
        let point = lookup(func, name)?;

        #[cfg(feature = "failure-points")]
        {
            let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = armed.insert(point, countdown) {
                tracing::warn!(
                    point = %point,
                    previous_remaining = previous,
                    countdown,
                    "failure point was already enabled, countdown replaced"
                );
            }
        }

        #[cfg(not(feature = "failure-points"))]
        tracing::warn!(
            point = %point,
            countdown,
            "can't enable failure point, failure points are disabled at compile time"
        );

        Ok(())
    }

    /// Disarms a point. Returns `true` if it was armed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownFailurePoint`] if `(func, name)` is not
    /// registered.
    pub fn disable(&self, func: &str, name: &str) -> ProtocolResult<bool> {
        let point = lookup(func, name)?;

        #[cfg(feature = "failure-points")]
        {
            let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(armed.remove(&point).is_some())
        }

        #[cfg(not(feature = "failure-points"))]
        {
            let _ = point;
            Ok(false)
        }
    }

    /// Disarms every point.
    pub fn reset(&self) {
        #[cfg(feature = "failure-points")]
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns `true` if the point is armed and has not triggered yet.
    #[must_use]
    pub fn is_armed(&self, point: FailurePoint) -> bool {
        #[cfg(feature = "failure-points")]
        {
            self.armed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&point)
        }

        #[cfg(not(feature = "failure-points"))]
        {
            let _ = point;
            false
        }
    }

    /// Checks a point at its call site.
    ///
    /// Returns `true` exactly once per `enable`, after the countdown reached
    /// zero; the point is disarmed at that moment.
    #[must_use]
    #[inline]
    pub fn is_triggered(&self, point: FailurePoint) -> bool {
        #[cfg(feature = "failure-points")]
        {
            let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
            match armed.get_mut(&point) {
                Some(0) => {
                    armed.remove(&point);
                    tracing::info!("Failure point ({point}) has been triggered.");
                    true
                },
                Some(remaining) => {
                    *remaining -= 1;
                    false
                },
                None => false,
            }
        }

        #[cfg(not(feature = "failure-points"))]
        {
            let _ = point;
            false
        }
    }
}
