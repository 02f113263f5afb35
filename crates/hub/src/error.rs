// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the session hub (§7).
//!
//! Mirrors the kinds enumerated in the spec's error-handling design: most
//! variants are scoped to one App/one stream/one request and are reported
//! back to the initiator rather than propagated. `HubError` is hand rolled
//! (no `thiserror`) so call sites keep explicit control over which variants
//! cross the wire as `connection_error` codes and which only ever reach logs.

use std::fmt;

/// Taxonomy of error kinds the core can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Malformed input or invalid stream key.
    Validation(String),
    /// Invalid API key on App transport init.
    Auth,
    /// Session has already been disposed.
    InvalidState(String),
    /// Requested App descriptor does not exist.
    NotFound,
    /// App requires hardware the current device model lacks.
    HardwareIncompatible(String),
    /// Webhook call failed after retries.
    WebhookFailure(String),
    /// A suspension point exceeded its deadline.
    Timeout(String),
    /// Send failed or the socket is gone.
    TransportClosed,
    /// Subscription request rejected by the permission checker.
    Permission(String),
    /// Store/lookup failed; caller should continue with defaults.
    Store(String),
    /// Anything uncaught, downgraded at the Session boundary.
    Internal(String),
}

impl HubError {
    /// Wire code for `connection_error` messages (§6), when this error is
    /// one of the handful that cross the App/device transport boundary.
    pub fn connection_error_code(&self) -> Option<&'static str> {
        match self {
            Self::Auth => Some("INVALID_API_KEY"),
            Self::InvalidState(_) | Self::NotFound => Some("APP_NOT_STARTED"),
            Self::Internal(_) | Self::Timeout(_) | Self::WebhookFailure(_) => {
                Some("INTERNAL_ERROR")
            }
            _ => None,
        }
    }

    /// Close code to apply to the originating transport, if any (§6).
    pub fn as_close_code(&self) -> Option<u16> {
        match self {
            Self::Auth => Some(crate::messages::close_code::POLICY_VIOLATION),
            _ => None,
        }
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(m) => write!(f, "validation error: {m}"),
            Self::Auth => write!(f, "invalid api key"),
            Self::InvalidState(m) => write!(f, "invalid state: {m}"),
            Self::NotFound => write!(f, "not found"),
            Self::HardwareIncompatible(m) => write!(f, "hardware incompatible: {m}"),
            Self::WebhookFailure(m) => write!(f, "webhook failed: {m}"),
            Self::Timeout(m) => write!(f, "timeout: {m}"),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::Permission(m) => write!(f, "permission error: {m}"),
            Self::Store(m) => write!(f, "store error: {m}"),
            Self::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for HubError {}

pub type HubResult<T> = Result<T, HubError>;
