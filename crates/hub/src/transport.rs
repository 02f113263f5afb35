// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `TransportHandle`: the abstract message-carrying duplex endpoint contract
//! (§3, §6). Framing, TLS, and auth-header handling belong to the transport
//! endpoint itself and are out of scope for this core (§1) — what the core
//! needs is a handle it can push text/binary frames through and close, plus
//! a way to learn the socket is gone. Modeled as a trait so the core never
//! depends on a concrete socket type; the only concrete implementation
//! shipped here is `ChannelTransport`, whose paired receiver an external
//! transport driver (axum WS handler, etc.) drains and writes to the wire —
//! mirroring the teacher's `ClientSlot { tx: mpsc::UnboundedSender<Arc<str>>
//! }` fan-out in `upstream::bridge::WsBridge`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::HubError;
use crate::messages::{AppOutbound, DeviceOutbound};

/// A frame queued for delivery to the remote endpoint.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

/// The abstract duplex endpoint contract the core sends through.
///
/// All methods are synchronous: sending only needs to enqueue onto the
/// transport's own writer (a suspension point the core never waits on, per
/// §5), and failures are reported back as `HubError::TransportClosed`
/// immediately rather than via an async round-trip.
pub trait Transport: Send + Sync {
    fn send_text(&self, text: String) -> Result<(), HubError>;
    fn send_binary(&self, bytes: Bytes) -> Result<(), HubError>;
    /// Request that the remote endpoint be closed with the given code/reason.
    /// Idempotent: closing an already-closed transport is a no-op.
    fn close(&self, code: u16, reason: &str);
    fn is_open(&self) -> bool;
}

/// Send a typed `DeviceOutbound` message as a text frame.
pub fn send_device(transport: &dyn Transport, msg: &DeviceOutbound) -> Result<(), HubError> {
    let text = serde_json::to_string(msg)
        .map_err(|e| HubError::Internal(format!("encode device message: {e}")))?;
    transport.send_text(text)
}

/// Send a typed `AppOutbound` message as a text frame.
pub fn send_app(transport: &dyn Transport, msg: &AppOutbound) -> Result<(), HubError> {
    let text = serde_json::to_string(msg)
        .map_err(|e| HubError::Internal(format!("encode app message: {e}")))?;
    transport.send_text(text)
}

/// Production-shaped transport: frames are pushed onto an unbounded channel
/// whose paired receiver an external writer task drains. `mark_closed` is
/// called by that external driver when the underlying socket goes away.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    open: AtomicBool,
}

impl ChannelTransport {
    /// Create a new handle and the receiver its external writer task should drain.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, open: AtomicBool::new(true) }), rx)
    }

    /// Called by the external transport driver once the socket has closed.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Transport for ChannelTransport {
    fn send_text(&self, text: String) -> Result<(), HubError> {
        if !self.is_open() {
            return Err(HubError::TransportClosed);
        }
        self.tx.send(OutboundFrame::Text(text)).map_err(|_| HubError::TransportClosed)
    }

    fn send_binary(&self, bytes: Bytes) -> Result<(), HubError> {
        if !self.is_open() {
            return Err(HubError::TransportClosed);
        }
        self.tx.send(OutboundFrame::Binary(bytes)).map_err(|_| HubError::TransportClosed)
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(OutboundFrame::Close { code, reason: reason.to_owned() });
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Test double that records every frame synchronously instead of routing
/// through a channel + external writer, so assertions don't need to drain
/// anything.
#[derive(Default)]
pub struct RecordingTransport {
    open: AtomicBool,
    frames: Mutex<Vec<OutboundFrame>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { open: AtomicBool::new(true), frames: Mutex::new(Vec::new()) })
    }

    pub fn frames(&self) -> Vec<OutboundFrame> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                OutboundFrame::Text(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                OutboundFrame::Close { code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }

    /// Simulate the remote socket disappearing, as an external transport
    /// driver would report via `mark_closed` on a real `ChannelTransport`.
    pub fn simulate_drop(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Transport for RecordingTransport {
    fn send_text(&self, text: String) -> Result<(), HubError> {
        if !self.is_open() {
            return Err(HubError::TransportClosed);
        }
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).push(OutboundFrame::Text(text));
        Ok(())
    }

    fn send_binary(&self, bytes: Bytes) -> Result<(), HubError> {
        if !self.is_open() {
            return Err(HubError::TransportClosed);
        }
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).push(OutboundFrame::Binary(bytes));
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.frames
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(OutboundFrame::Close { code, reason: reason.to_owned() });
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
