//! Registry watch loop.
//!
//! Turns raw store change events into typed [`WatchEvent`]s and keeps the
//! subscription alive across stream failures:
//!
//! ```text
//!            ┌────────────┐  subscribed   ┌───────────┐
//!            │ Connecting │──────────────►│ Streaming │◄── start
//!            └────────────┘               └───────────┘──► callback(event)
//!                  ▲   │ error                  │ error / stream end
//!                  │   ▼                        ▼
//!                  │ ┌─────────┐ ◄──────────────┘
//!                  └─│ Backoff │  sleep(watch_backoff)
//!                    └─────────┘
//! ```
//!
//! Any state exits when the registry closes or the watch is stopped.
//! Ordering holds per key within one subscription only; events emitted while
//! the loop is in `Backoff` are not replayed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::KeyLayout;
use super::stats::RegistryCounters;
use crate::shutdown::wait_either;
use crate::store::{LeaseStore, StoreEvent, StoreEventKind, WatchStream};

/// Kind of registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Put,
    Delete,
}

/// A registry mutation observed through a watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub user_id: String,
    pub device_id: String,
    pub key: String,
    /// Raw stored value; empty for deletes.
    pub value: String,
}

/// Callback invoked for each event. Runs on the watch task, so it must only
/// do fast, non-blocking work such as cache mutation.
pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

enum WatchState {
    Connecting,
    Streaming(WatchStream),
    Backoff,
}

/// Everything one watch task needs.
pub(crate) struct WatchLoop {
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) prefix: String,
    /// Subscription opened by the caller before spawning the loop.
    pub(crate) initial: WatchStream,
    pub(crate) layout: KeyLayout,
    pub(crate) callback: WatchCallback,
    pub(crate) backoff: Duration,
    pub(crate) counters: Arc<Mutex<RegistryCounters>>,
    pub(crate) closed: watch::Receiver<bool>,
    pub(crate) stop: watch::Receiver<bool>,
}

impl WatchLoop {
    pub(crate) async fn run(self) {
        let WatchLoop {
            store,
            prefix,
            initial,
            layout,
            callback,
            backoff,
            counters,
            mut closed,
            mut stop,
        } = self;

        let mut state = WatchState::Streaming(initial);

        loop {
            state = match state {
                WatchState::Connecting => tokio::select! {
                    _ = wait_either(&mut closed, &mut stop) => break,
                    subscribed = store.watch(&prefix) => match subscribed {
                        Ok(stream) => {
                            counters
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .watch_reconnects += 1;
                            tracing::info!(prefix = %prefix, "Watch re-subscribed");
                            WatchState::Streaming(stream)
                        }
                        Err(e) => {
                            tracing::warn!(prefix = %prefix, error = %e, "Watch subscribe failed");
                            WatchState::Backoff
                        }
                    }
                },
                WatchState::Streaming(mut stream) => tokio::select! {
                    _ = wait_either(&mut closed, &mut stop) => break,
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            dispatch(&layout, &callback, &counters, event);
                            WatchState::Streaming(stream)
                        }
                        Some(Err(e)) => {
                            tracing::warn!(prefix = %prefix, error = %e, "Watch stream failed");
                            WatchState::Backoff
                        }
                        None => {
                            tracing::warn!(prefix = %prefix, "Watch stream closed");
                            WatchState::Backoff
                        }
                    }
                },
                WatchState::Backoff => tokio::select! {
                    _ = wait_either(&mut closed, &mut stop) => break,
                    _ = tokio::time::sleep(backoff) => WatchState::Connecting,
                },
            };
        }

        tracing::debug!(prefix = %prefix, "Watch loop stopped");
    }
}

/// Decode a store event and hand it to the callback. Keys outside the
/// `users/{user}/{device}` layout are ignored.
fn dispatch(
    layout: &KeyLayout,
    callback: &WatchCallback,
    counters: &Mutex<RegistryCounters>,
    event: StoreEvent,
) {
    let Some(decoded) = decode_event(layout, event) else {
        return;
    };
    counters
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .watch_events += 1;
    callback(decoded);
}

pub(crate) fn decode_event(layout: &KeyLayout, event: StoreEvent) -> Option<WatchEvent> {
    let Some((user_id, device_id)) = layout.parse_key(&event.key) else {
        tracing::debug!(key = %event.key, "Ignoring watch event outside the device layout");
        return None;
    };
    let (event_type, value) = match event.kind {
        StoreEventKind::Put => (WatchEventType::Put, event.value),
        StoreEventKind::Delete => (WatchEventType::Delete, String::new()),
    };
    Some(WatchEvent {
        event_type,
        user_id,
        device_id,
        key: event.key,
        value,
    })
}
