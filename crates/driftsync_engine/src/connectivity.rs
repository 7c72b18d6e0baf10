//! Connectivity monitoring with flap suppression.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Network reachability as announced to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    /// The remote store is reachable.
    Online,
    /// The remote store is not reachable.
    Offline,
}

type Listener = Arc<dyn Fn(ConnectivityStatus) + Send + Sync>;

struct ListenerSet {
    listeners: Vec<(u64, Listener)>,
    next_id: u64,
}

struct MonitorState {
    announced: ConnectivityStatus,
    /// When an online report started its hold window, if one is pending.
    candidate_since: Option<Instant>,
}

/// Observes network reachability and announces debounced transitions.
///
/// Raw reachability reports feed in through [`report_online`] /
/// [`report_offline`] (from platform network events or polling). An offline
/// transition is announced immediately. An online transition is only
/// announced once it is confirmed stable: either a successful probe calls
/// [`confirm_online`], or the hold window elapses with no further drop and
/// [`poll`] promotes it. This avoids triggering wasted drain cycles on a
/// flapping link.
///
/// [`report_online`]: ConnectivityMonitor::report_online
/// [`report_offline`]: ConnectivityMonitor::report_offline
/// [`confirm_online`]: ConnectivityMonitor::confirm_online
/// [`poll`]: ConnectivityMonitor::poll
pub struct ConnectivityMonitor {
    debounce: Duration,
    state: Mutex<MonitorState>,
    listeners: Arc<Mutex<ListenerSet>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with the given initial status and hold window.
    #[must_use]
    pub fn new(initial: ConnectivityStatus, debounce: Duration) -> Self {
        Self {
            debounce,
            state: Mutex::new(MonitorState {
                announced: initial,
                candidate_since: None,
            }),
            listeners: Arc::new(Mutex::new(ListenerSet {
                listeners: Vec::new(),
                next_id: 1,
            })),
        }
    }

    /// Returns the currently announced status.
    #[must_use]
    pub fn status(&self) -> ConnectivityStatus {
        self.state.lock().announced
    }

    /// Reports that the network dropped.
    ///
    /// Announced immediately; any pending online hold window is discarded.
    pub fn report_offline(&self) {
        let announce = {
            let mut state = self.state.lock();
            state.candidate_since = None;
            if state.announced == ConnectivityStatus::Online {
                state.announced = ConnectivityStatus::Offline;
                true
            } else {
                false
            }
        };
        if announce {
            debug!("connectivity: offline");
            self.announce(ConnectivityStatus::Offline);
        }
    }

    /// Reports that the network appears reachable again.
    ///
    /// Not announced yet; the transition is held until [`Self::confirm_online`]
    /// or until [`Self::poll`] sees the hold window elapse.
    pub fn report_online(&self) {
        let mut state = self.state.lock();
        if state.announced == ConnectivityStatus::Offline && state.candidate_since.is_none() {
            state.candidate_since = Some(Instant::now());
        }
    }

    /// Confirms reachability (e.g. a successful lightweight probe) and
    /// announces the online transition immediately.
    pub fn confirm_online(&self) {
        let announce = {
            let mut state = self.state.lock();
            state.candidate_since = None;
            if state.announced == ConnectivityStatus::Offline {
                state.announced = ConnectivityStatus::Online;
                true
            } else {
                false
            }
        };
        if announce {
            debug!("connectivity: online (confirmed)");
            self.announce(ConnectivityStatus::Online);
        }
    }

    /// Promotes a held online report whose window has elapsed.
    ///
    /// Returns the announced transition, if one occurred. Intended to be
    /// called periodically by the drain loop.
    pub fn poll(&self, now: Instant) -> Option<ConnectivityStatus> {
        let announce = {
            let mut state = self.state.lock();
            match state.candidate_since {
                Some(since)
                    if state.announced == ConnectivityStatus::Offline
                        && now.duration_since(since) >= self.debounce =>
                {
                    state.candidate_since = None;
                    state.announced = ConnectivityStatus::Online;
                    true
                }
                _ => false,
            }
        };
        if announce {
            debug!("connectivity: online (held window elapsed)");
            self.announce(ConnectivityStatus::Online);
            Some(ConnectivityStatus::Online)
        } else {
            None
        }
    }

    /// Registers a transition listener.
    ///
    /// The listener fires for every announced transition until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn on_change(
        &self,
        listener: impl Fn(ConnectivityStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let mut set = self.listeners.lock();
        let id = set.next_id;
        set.next_id += 1;
        set.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Invokes listeners outside the state lock.
    fn announce(&self, status: ConnectivityStatus) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(status);
        }
    }
}

/// Handle to a registered connectivity listener.
///
/// Dropping the subscription unregisters the listener.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<ListenerSet>>,
}

impl Subscription {
    /// Unregisters the listener.
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
