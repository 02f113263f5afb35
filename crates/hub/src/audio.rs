// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `AudioPipe` (§4.5): PCM16 alignment and fixed-order fan-out, plus an
//! optional ordered-by-sequence reassembly path for transports that tag
//! frames with a sequence number instead of relying on arrival order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};

use bytes::{Bytes, BytesMut};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::collaborators::{TranscriptionSink, TranslationSink};
use crate::session::Session;

/// One frame of the ordered ingress path (§4.5, §6 "audio" text wrapper).
#[derive(Debug, Clone)]
pub struct SequencedAudioFrame {
    pub sequence: u64,
    pub timestamp: u64,
    pub payload: Bytes,
}

struct AlignState {
    carry: Option<u8>,
    last_audio_at: Option<Instant>,
}

struct OrderedState {
    next_sequence: Option<u64>,
    pending: BTreeMap<u64, SequencedAudioFrame>,
}

pub struct AudioPipe {
    user_id: String,
    transcription: Arc<dyn TranscriptionSink>,
    translation: Arc<dyn TranslationSink>,
    session: OnceLock<Weak<Session>>,
    align: StdMutex<AlignState>,
    ordered: StdMutex<OrderedState>,
    ordered_queue_cap: usize,
    ordered_tick: Duration,
    processing_ordered: AtomicBool,
}

impl AudioPipe {
    pub fn new(
        user_id: impl Into<String>,
        transcription: Arc<dyn TranscriptionSink>,
        translation: Arc<dyn TranslationSink>,
        ordered_queue_cap: usize,
        ordered_tick: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            transcription,
            translation,
            session: OnceLock::new(),
            align: StdMutex::new(AlignState { carry: None, last_audio_at: None }),
            ordered: StdMutex::new(OrderedState { next_sequence: None, pending: BTreeMap::new() }),
            ordered_queue_cap,
            ordered_tick,
            processing_ordered: AtomicBool::new(false),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    /// Start the periodic drain tick for the ordered path. Call once after
    /// `bind_session`; the task holds only a `Weak` back-reference so it
    /// exits on its own once the owning `AudioPipe` is dropped.
    pub fn spawn_ordered_drain(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let tick = self.ordered_tick;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let Some(pipe) = this.upgrade() else { break };
                pipe.drain_ordered().await;
            }
        });
    }

    /// `ingress` (§4.5): direct, arrival-order path. Normalizes, aligns, and
    /// fans out a single binary frame.
    pub async fn ingress(&self, bytes: Bytes) {
        self.record_activity();
        self.notify_microphone().await;
        if let Some(aligned) = self.align(&bytes) {
            self.fan_out(aligned).await;
        }
    }

    /// Ordered path (§4.5): queue a sequence-tagged frame; frames drain in
    /// order on the next tick, skipping duplicates and bounding memory at
    /// `ordered_queue_cap`.
    pub fn ingest_sequenced(&self, frame: SequencedAudioFrame) {
        let mut state = self.ordered.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(next) = state.next_sequence {
            if frame.sequence < next {
                debug!(sequence = frame.sequence, "dropping duplicate/stale sequenced audio frame");
                return;
            }
        }
        if state.pending.len() >= self.ordered_queue_cap && !state.pending.contains_key(&frame.sequence) {
            warn!(cap = self.ordered_queue_cap, "ordered audio queue at capacity, dropping oldest frame");
            if let Some((&oldest, _)) = state.pending.iter().next() {
                state.pending.remove(&oldest);
            }
        }
        state.pending.insert(frame.sequence, frame);
    }

    /// Drains strictly-in-sequence frames from the head of the pending map.
    /// A single drain runs at a time; a tick that finds one already running
    /// is a no-op (the in-flight drain will pick up anything queued since).
    async fn drain_ordered(&self) {
        if self.processing_ordered.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            let next = {
                let mut state = self.ordered.lock().unwrap_or_else(|e| e.into_inner());
                let expected = state.next_sequence;
                let ready = match expected {
                    Some(seq) => state.pending.contains_key(&seq),
                    None => !state.pending.is_empty(),
                };
                if !ready {
                    break;
                }
                let seq = match expected {
                    Some(seq) => seq,
                    None => *state.pending.keys().next().unwrap_or(&0),
                };
                let frame = state.pending.remove(&seq);
                state.next_sequence = Some(seq + 1);
                frame
            };
            let Some(frame) = next else { break };
            self.record_activity();
            self.notify_microphone().await;
            if let Some(aligned) = self.align(&frame.payload) {
                self.fan_out(aligned).await;
            }
        }

        self.processing_ordered.store(false, Ordering::SeqCst);
    }

    fn record_activity(&self) {
        self.align.lock().unwrap_or_else(|e| e.into_inner()).last_audio_at = Some(Instant::now());
    }

    async fn notify_microphone(&self) {
        if let Some(session) = self.session() {
            session.microphone.on_audio_received().await;
        }
    }

    /// PCM16 alignment (§4.5, §8): a ≤1-byte carry-over is held between
    /// calls so every buffer handed downstream has even length; no bytes
    /// are ever dropped, only delayed into the next emission.
    fn align(&self, bytes: &Bytes) -> Option<Bytes> {
        let mut state = self.align.lock().unwrap_or_else(|e| e.into_inner());
        let mut buf = BytesMut::with_capacity(bytes.len() + 1);
        if let Some(carry) = state.carry.take() {
            buf.extend_from_slice(&[carry]);
        }
        buf.extend_from_slice(bytes);

        if buf.len() % 2 != 0 {
            state.carry = buf.split_off(buf.len() - 1).first().copied();
        }

        if buf.is_empty() {
            return None;
        }
        Some(buf.freeze())
    }

    /// Fixed fan-out order (§4.5, §5): transcription, then translation,
    /// then relay to apps subscribed to PCM-needing streams.
    async fn fan_out(&self, pcm: Bytes) {
        let Some(session) = self.session() else { return };

        let transcription_streams = session.subscriptions.transcription_streams().await;
        if !transcription_streams.is_empty() {
            self.transcription.ensure_streams(&self.user_id, &transcription_streams).await;
            self.transcription.ingest(&self.user_id, &pcm).await;
        }

        let translation_streams = session.subscriptions.translation_streams().await;
        if !translation_streams.is_empty() {
            self.translation.ensure_streams(&self.user_id, &translation_streams).await;
            self.translation.ingest(&self.user_id, &pcm).await;
        }

        session.relay_audio_to_apps(pcm).await;
    }
}

#[cfg(test)]
#[path = "audio_tests.rs"]
mod tests;
