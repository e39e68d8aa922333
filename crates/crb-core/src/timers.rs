//! Cancellable scheduled tasks owned by one session.
//!
//! At most one task per [`TimerKind`] is armed at a time; arming a kind again
//! cancels the previous task of that kind. Once closed, the set refuses new
//! tasks, so a detached session cannot be resurrected by a stale callback.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Initial or restoration start (jittered).
    Start,
    /// Policy-driven reconnect after a failure.
    Reconnect,
    /// Periodic liveness probe while connected.
    Heartbeat,
}

#[derive(Clone, Default)]
pub struct TimerSet {
    inner: Arc<Mutex<TimerState>>,
}

#[derive(Default)]
struct TimerState {
    next_id: u64,
    closed: bool,
    entries: HashMap<TimerKind, TimerEntry>,
}

struct TimerEntry {
    id: u64,
    token: CancellationToken,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TimerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(&self, kind: TimerKind) -> Option<(u64, CancellationToken)> {
        let mut st = self.state();
        if st.closed {
            return None;
        }
        st.next_id += 1;
        let id = st.next_id;
        let token = CancellationToken::new();
        let prev = st.entries.insert(
            kind,
            TimerEntry {
                id,
                token: token.clone(),
            },
        );
        if let Some(prev) = prev {
            prev.token.cancel();
        }
        Some((id, token))
    }

    /// Remove the entry if it is still the one armed under `id`.
    fn disarm(&self, kind: TimerKind, id: u64) -> bool {
        let mut st = self.state();
        if st.entries.get(&kind).is_some_and(|e| e.id == id) {
            st.entries.remove(&kind);
            return true;
        }
        false
    }

    /// Run `task` once after `delay` unless cancelled or replaced first.
    ///
    /// Cancellation only prevents firing: once the delay has elapsed the task
    /// runs to completion, so it may safely reschedule or cancel timers itself.
    pub fn schedule_once<Fut>(&self, kind: TimerKind, delay: Duration, task: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some((id, token)) = self.arm(kind) else {
            return false;
        };

        let timers = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = sleep(delay) => {}
            }
            if timers.disarm(kind, id) {
                task.await;
            }
        });
        true
    }

    /// Call `tick` every `period` until it returns `false` or the timer is cancelled.
    pub fn spawn_periodic<F, Fut>(&self, kind: TimerKind, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let Some((id, token)) = self.arm(kind) else {
            return false;
        };

        let timers = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = sleep(period) => {}
                }
                if token.is_cancelled() || !tick().await {
                    break;
                }
            }
            timers.disarm(kind, id);
        });
        true
    }

    pub fn cancel(&self, kind: TimerKind) {
        if let Some(entry) = self.state().entries.remove(&kind) {
            entry.token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let mut st = self.state();
        for (_, entry) in st.entries.drain() {
            entry.token.cancel();
        }
    }

    /// Cancel everything and refuse further scheduling.
    pub fn close(&self) {
        let mut st = self.state();
        st.closed = true;
        for (_, entry) in st.entries.drain() {
            entry.token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.state().entries.contains_key(&kind)
    }
}
