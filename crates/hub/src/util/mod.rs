// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Small shared helpers used across components.

pub mod debounce;

/// Current epoch millis, used for outbound message `timestamp` fields.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current instant as an ISO-8601/RFC 3339 string, comparable lexicographically
/// with the `dtStart`/`dtEnd` strings calendar events arrive with.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
