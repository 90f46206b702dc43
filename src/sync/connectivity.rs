//! Connectivity monitor
//!
//! Reflects platform reachability as an explicit, subscribable state object.
//! The monitor is the only writer; readers get immutable snapshots through a
//! `watch` channel and transition events through a `broadcast` channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::clock::Clock;

/// How long `was_offline` stays set after a reconnect
pub const DEFAULT_WAS_OFFLINE_WINDOW: Duration = Duration::from_secs(10);

/// Reconnects closer together than this collapse into one event
pub const DEFAULT_RECONNECT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Immutable view of the current connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_online: bool,
    /// Set for a bounded window after an offline -> online transition
    pub was_offline: bool,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
}

/// Reachability transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Reconnected,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub reconnect_debounce: Duration,
    pub was_offline_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reconnect_debounce: DEFAULT_RECONNECT_DEBOUNCE,
            was_offline_window: DEFAULT_WAS_OFFLINE_WINDOW,
        }
    }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    state: watch::Sender<ConnectivityState>,
    events: broadcast::Sender<ConnectivityEvent>,
    last_reconnect_event: Mutex<Option<DateTime<Utc>>>,
    /// Bumped on every transition so stale `was_offline` clears are ignored
    window_generation: AtomicU64,
}

impl ConnectivityMonitor {
    pub fn new(clock: Arc<dyn Clock>, config: MonitorConfig, initially_online: bool) -> Self {
        let now = clock.now();
        let (state, _) = watch::channel(ConnectivityState {
            is_online: initially_online,
            was_offline: false,
            last_online_at: initially_online.then_some(now),
            last_offline_at: (!initially_online).then_some(now),
        });
        let (events, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(MonitorInner {
                clock,
                config,
                state,
                events,
                last_reconnect_event: Mutex::new(None),
                window_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.state.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.borrow().is_online
    }

    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Feed a reachability observation from the platform
    ///
    /// Repeated observations of the same state are ignored. Must be called
    /// from within a tokio runtime, since reconnects schedule the
    /// `was_offline` clear.
    pub fn report(&self, online: bool) {
        if self.is_online() == online {
            return;
        }

        let now = self.inner.clock.now();
        let generation = self.inner.window_generation.fetch_add(1, Ordering::SeqCst) + 1;

        if online {
            self.inner.state.send_modify(|state| {
                state.is_online = true;
                state.was_offline = true;
                state.last_online_at = Some(now);
            });

            if self.debounce_reconnect(now) {
                tracing::info!("Connectivity regained");
                let _ = self.inner.events.send(ConnectivityEvent::Reconnected);
            } else {
                tracing::debug!("Reconnect collapsed into previous event");
            }

            self.schedule_window_clear(generation);
        } else {
            self.inner.state.send_modify(|state| {
                state.is_online = false;
                state.was_offline = false;
                state.last_offline_at = Some(now);
            });
            tracing::info!("Connectivity lost");
            let _ = self.inner.events.send(ConnectivityEvent::Disconnected);
        }
    }

    /// Whether a reconnect at `now` should fire an event
    fn debounce_reconnect(&self, now: DateTime<Utc>) -> bool {
        let mut last = self.inner.last_reconnect_event.lock();
        let window = chrono::Duration::from_std(self.inner.config.reconnect_debounce)
            .unwrap_or_else(|_| chrono::Duration::zero());

        match *last {
            Some(previous) if now - previous < window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn schedule_window_clear(&self, generation: u64) {
        let inner = Arc::downgrade(&self.inner);
        let clock = self.inner.clock.clone();
        let window = self.inner.config.was_offline_window;

        tokio::spawn(async move {
            clock.sleep(window).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.window_generation.load(Ordering::SeqCst) == generation {
                inner.state.send_modify(|state| state.was_offline = false);
            }
        });
    }
}
