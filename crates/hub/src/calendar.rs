// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `CalendarCache` (§4.9): session-scoped event cache, prioritization, and
//! newly-subscribed replay.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use serde_json::Value;
use tracing::debug;

use crate::session::Session;

/// Cap on cached events per session (§4.9).
pub const MAX_EVENTS: usize = 100;

/// A canonical calendar event (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub event_id: String,
    pub title: String,
    pub dt_start: String,
    pub dt_end: Option<String>,
    pub timezone: Option<String>,
    pub time_stamp: Option<String>,
}

impl CalendarEvent {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "eventId": self.event_id,
            "title": self.title,
            "dtStart": self.dt_start,
            "dtEnd": self.dt_end,
            "timezone": self.timezone,
        })
    }

    /// "Present or future" grouping key for prioritization (§4.9): events
    /// whose start is lexicographically `>= now` sort first and ascending;
    /// past events sort after, descending. ISO-8601 timestamps compare
    /// correctly as strings, which is how `dt_start` arrives over the wire.
    fn is_future_or_present(&self, now_iso: &str) -> bool {
        self.dt_start.as_str() >= now_iso
    }
}

struct CacheState {
    events: Vec<CalendarEvent>,
    subscribed_apps: HashSet<String>,
}

pub struct CalendarCache {
    session: OnceLock<Weak<Session>>,
    state: RwLock<CacheState>,
}

impl CalendarCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: OnceLock::new(),
            state: RwLock::new(CacheState { events: Vec::new(), subscribed_apps: HashSet::new() }),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    /// Add (or update) an event, deduplicating by `(event_id, dt_start)`, then
    /// broadcast it to currently subscribed Apps.
    pub async fn add_event(&self, event: CalendarEvent, now_iso: &str) {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.events.retain(|e| !(e.event_id == event.event_id && e.dt_start == event.dt_start));
            state.events.push(event.clone());
            Self::prioritize(&mut state.events, now_iso);
            if state.events.len() > MAX_EVENTS {
                state.events.truncate(MAX_EVENTS);
            }
        }

        if let Some(session) = self.session() {
            session.relay_to_apps("calendar-event", event.to_json()).await;
        }
    }

    /// `updateEventsFromAPI`: bulk ingest.
    pub async fn update_events_from_api(&self, events: Vec<CalendarEvent>, now_iso: &str) {
        for event in events {
            self.add_event(event, now_iso).await;
        }
    }

    /// `updateEventFromWebsocket`: single device-originated event.
    pub async fn update_event_from_websocket(&self, event: CalendarEvent, now_iso: &str) {
        self.add_event(event, now_iso).await;
    }

    /// Sort "present or future" events first ascending by start, then past
    /// events descending by start (§4.9).
    fn prioritize(events: &mut [CalendarEvent], now_iso: &str) {
        events.sort_by(|a, b| {
            let a_future = a.is_future_or_present(now_iso);
            let b_future = b.is_future_or_present(now_iso);
            match (a_future, b_future) {
                (true, true) => a.dt_start.cmp(&b.dt_start),
                (false, false) => b.dt_start.cmp(&a.dt_start),
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
            }
        });
    }

    /// `handleSubscriptionUpdate`: replay the cache to each newly subscribed package.
    pub async fn handle_subscription_update(&self, newly_subscribed: &[String]) {
        let (events, to_send): (Vec<CalendarEvent>, Vec<String>) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let fresh: Vec<String> = newly_subscribed
                .iter()
                .filter(|p| !state.subscribed_apps.contains(*p))
                .cloned()
                .collect();
            for p in &fresh {
                state.subscribed_apps.insert(p.clone());
            }
            (state.events.clone(), fresh)
        };

        if to_send.is_empty() {
            return;
        }
        let Some(session) = self.session() else { return };
        for package in &to_send {
            for event in &events {
                session.send_data_stream_to_app(package, "calendar-event", event.to_json()).await;
            }
        }
        debug!(count = events.len(), apps = ?to_send, "replayed calendar cache");
    }

    /// `handleUnsubscribe`: forget the package so a future re-subscribe replays again.
    pub fn handle_unsubscribe(&self, package: &str) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).subscribed_apps.remove(package);
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).events.clone()
    }
}

#[cfg(test)]
#[path = "calendar_tests.rs"]
mod tests;
