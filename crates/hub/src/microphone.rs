// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `MicrophoneController` (§4.4): desired on/off + required-data for the
//! device microphone, pushed with a leading+trailing debounce, an off
//! holddown, a subscription-change debounce, a keep-alive resend, and an
//! unauthorized-audio guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock, Weak};
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::messages::DeviceOutbound;
use crate::session::Session;
use crate::util::debounce::CoalescingLatch;

/// The microphone state actually pushed to the device wire (§6).
#[derive(Debug, Clone, PartialEq)]
pub struct MicState {
    pub enabled: bool,
    pub required_data: Vec<&'static str>,
    pub bypass_vad: bool,
}

impl MicState {
    fn off() -> Self {
        Self { enabled: false, required_data: Vec::new(), bypass_vad: false }
    }
}

struct DebounceState {
    last_sent: Option<MicState>,
    pending: Option<MicState>,
    window_open: bool,
}

pub struct MicrophoneController {
    session: OnceLock<Weak<Session>>,
    debounce_window: Duration,
    off_holddown: Duration,
    subscription_debounce_window: Duration,
    unauthorized_audio_debounce: Duration,
    keepalive_interval: Duration,

    debounce: StdMutex<DebounceState>,
    effective_has_media: AtomicBool,
    last_has_pcm: AtomicBool,
    off_holddown_latch: Arc<CoalescingLatch<()>>,
    subscription_latch: Arc<CoalescingLatch<(bool, bool)>>,
    unauthorized_suppressed_until: StdMutex<Option<Instant>>,
    keepalive_token: StdMutex<Option<CancellationToken>>,
    disposed: AtomicBool,
}

impl MicrophoneController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        debounce_window: Duration,
        off_holddown: Duration,
        subscription_debounce_window: Duration,
        unauthorized_audio_debounce: Duration,
        keepalive_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session: OnceLock::new(),
            debounce_window,
            off_holddown,
            subscription_debounce_window,
            unauthorized_audio_debounce,
            keepalive_interval,
            debounce: StdMutex::new(DebounceState { last_sent: None, pending: None, window_open: false }),
            effective_has_media: AtomicBool::new(false),
            last_has_pcm: AtomicBool::new(false),
            off_holddown_latch: CoalescingLatch::new(),
            subscription_latch: CoalescingLatch::new(),
            unauthorized_suppressed_until: StdMutex::new(None),
            keepalive_token: StdMutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    /// `onSubscriptionChange` (§4.4): own 100 ms debounce over subscription
    /// bursts, then re-evaluate against the (already-coalesced) aggregates.
    pub fn on_subscription_change(self: &Arc<Self>, has_pcm: bool, has_media: bool) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        self.subscription_latch.clone().set((has_pcm, has_media), self.subscription_debounce_window, move |(pcm, media)| {
            let this = Arc::clone(&this);
            async move { this.evaluate(pcm, media).await }
        });
    }

    /// Bypasses the subscription-change debounce; used after the
    /// unauthorized-audio suppression window elapses to refresh state
    /// immediately against the current aggregates.
    pub async fn force_refresh(&self, has_pcm: bool, has_media: bool) {
        self.evaluate(has_pcm, has_media).await;
    }

    async fn evaluate(&self, has_pcm: bool, has_media: bool) {
        self.last_has_pcm.store(has_pcm, Ordering::SeqCst);

        if has_media {
            self.off_holddown_latch.cancel();
            self.effective_has_media.store(true, Ordering::SeqCst);
            self.push_target(true, has_pcm).await;
            return;
        }

        if !self.effective_has_media.load(Ordering::SeqCst) {
            // Already off; nothing to hold down.
            return;
        }
        if self.off_holddown_latch.is_pending() {
            return;
        }

        let Some(session) = self.session() else { return };
        let this_mic = Arc::clone(&session.microphone);
        self.off_holddown_latch.clone().set((), self.off_holddown, move |()| {
            let this_mic = Arc::clone(&this_mic);
            async move {
                this_mic.effective_has_media.store(false, Ordering::SeqCst);
                let has_pcm = this_mic.last_has_pcm.load(Ordering::SeqCst);
                this_mic.push_target(false, has_pcm).await;
            }
        });
    }

    async fn push_target(&self, enabled: bool, has_pcm: bool) {
        let target = if enabled {
            MicState { enabled: true, required_data: vec!["pcm"], bypass_vad: has_pcm }
        } else {
            MicState::off()
        };
        self.update_state(target).await;
        self.sync_keepalive(enabled).await;
    }

    /// Leading-send + trailing-coalesce debounce (§4.4): the first call in a
    /// silent window sends immediately; calls arriving inside that window
    /// overwrite the pending target, which fires once at window close if it
    /// still differs from what was last sent.
    async fn update_state(&self, target: MicState) {
        let should_send_now = {
            let mut state = self.debounce.lock().unwrap_or_else(|e| e.into_inner());
            if !state.window_open {
                state.window_open = true;
                state.last_sent = Some(target.clone());
                true
            } else {
                state.pending = Some(target);
                false
            }
        };

        if should_send_now {
            self.send(&target).await;
            self.schedule_window_close();
        }
    }

    fn schedule_window_close(&self) {
        let Some(session) = self.session() else { return };
        let mic = Arc::clone(&session.microphone);
        let delay = self.debounce_window;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mic.close_window().await;
        });
    }

    async fn close_window(&self) {
        let pending = {
            let mut state = self.debounce.lock().unwrap_or_else(|e| e.into_inner());
            state.window_open = false;
            match state.pending.take() {
                Some(p) if Some(&p) != state.last_sent.as_ref() => {
                    state.last_sent = Some(p.clone());
                    Some(p)
                }
                _ => None,
            }
        };
        if let Some(target) = pending {
            self.send(&target).await;
        }
    }

    async fn send(&self, target: &MicState) {
        let Some(session) = self.session() else { return };
        let Some(transport) = session.device_transport() else { return };
        if !transport.is_open() {
            return;
        }
        let msg = DeviceOutbound::MicrophoneStateChange {
            session_id: session.session_id().to_owned(),
            is_microphone_enabled: target.enabled,
            required_data: target.required_data.clone(),
            bypass_vad: target.bypass_vad,
            timestamp: crate::util::epoch_ms(),
        };
        let _ = crate::transport::send_device(transport.as_ref(), &msg);
        debug!(enabled = target.enabled, "microphone state pushed");
    }

    async fn sync_keepalive(&self, enabled: bool) {
        let mut guard = self.keepalive_token.lock().unwrap_or_else(|e| e.into_inner());
        if enabled {
            if guard.is_some() {
                return;
            }
            let Some(session) = self.session() else { return };
            let token = CancellationToken::new();
            *guard = Some(token.clone());
            let mic = Arc::clone(&session.microphone);
            let interval = self.keepalive_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            mic.send_keepalive().await;
                        }
                    }
                }
            });
        } else if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    async fn send_keepalive(&self) {
        let Some(session) = self.session() else { return };
        let Some(transport) = session.device_transport() else { return };
        if !transport.is_open() {
            return;
        }
        let last = self.debounce.lock().unwrap_or_else(|e| e.into_inner()).last_sent.clone();
        if let Some(target) = last {
            if target.enabled {
                self.send(&target).await;
            }
        }
    }

    /// `onAudioReceived` (§4.4): force the mic off once when audio arrives
    /// while it shouldn't be flowing, then ignore further audio events for
    /// the suppression window before refreshing aggregates and resuming
    /// detection.
    pub async fn on_audio_received(&self) {
        let now = Instant::now();
        let mut suppressed = self.unauthorized_suppressed_until.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = *suppressed {
            if now < until {
                return;
            }
            *suppressed = None;
            drop(suppressed);
            if let Some(session) = self.session() {
                session.refresh_microphone_aggregates().await;
            }
            return;
        }

        let enabled = self.debounce.lock().unwrap_or_else(|e| e.into_inner()).last_sent.as_ref().map(|s| s.enabled).unwrap_or(false);
        let has_media = self.effective_has_media.load(Ordering::SeqCst);
        if !enabled || !has_media {
            *suppressed = Some(now + self.unauthorized_audio_debounce);
            drop(suppressed);
            self.update_state(MicState::off()).await;
        }
    }

    /// Cancels every outstanding timer (§4.4 dispose).
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.off_holddown_latch.cancel();
        self.subscription_latch.cancel();
        if let Some(token) = self.keepalive_token.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.debounce.lock().unwrap_or_else(|e| e.into_inner()).last_sent.as_ref().map(|s| s.enabled).unwrap_or(false)
    }
}

#[cfg(test)]
#[path = "microphone_tests.rs"]
mod tests;
