// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Coalescing latch: the debounce primitive named in §9's re-architecture
//! guidance ("Debounce via single-shot timer" → "a small coalescing latch
//! primitive with set(target, deadline) + cancel"). `set` records the latest
//! target and arranges for the callback to fire once after `delay` with the
//! most recent target, unless a later `set`/`cancel` supersedes it first.
//! Cancellation and repeated `set` calls are idempotent under races: each
//! call bumps a generation counter, and a fire only proceeds if its
//! generation is still current when the timer elapses.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct LatchState<T> {
    pending: Option<T>,
    generation: u64,
}

/// A cancellable, coalescing single-shot timer.
pub struct CoalescingLatch<T> {
    state: Mutex<LatchState<T>>,
}

impl<T> Default for CoalescingLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CoalescingLatch<T> {
    pub fn new() -> Self {
        Self { state: Mutex::new(LatchState { pending: None, generation: 0 }) }
    }

    /// Cancel any pending fire. Idempotent.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.generation += 1;
        state.pending = None;
    }

    /// True if a fire is currently scheduled (has not yet elapsed or been cancelled).
    pub fn is_pending(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.is_some()
    }
}

impl<T: Clone + Send + 'static> CoalescingLatch<T> {
    /// Record `target` as the latest desired value and, after `delay`, invoke
    /// `on_fire` with it — unless superseded by a later `set`/`cancel` call
    /// first. Takes `Arc<Self>` by value (clone the handle at the call site)
    /// since the spawned timer task needs its own owned reference.
    pub fn set<F, Fut>(self: Arc<Self>, target: T, delay: Duration, on_fire: F)
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending = Some(target);
            state.generation += 1;
            state.generation
        };

        let this = self;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = {
                let mut state = this.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.generation != generation {
                    return;
                }
                state.pending.take()
            };
            if let Some(value) = fired {
                on_fire(value).await;
            }
        });
    }
}

#[cfg(test)]
#[path = "debounce_tests.rs"]
mod tests;
