//! Admission throttling.
//!
//! A [`ThrottleGate`] is a capacity counter with a FIFO queue of suspended
//! acquirers. [`ServiceThrottle`] groups the gates a dispatcher enforces:
//! concurrent calls, sessions and instance contexts, plus a dynamic quota
//! whose limit is adjusted at runtime. Unbounded gates are simply absent, so
//! the unthrottled path takes no locks.
//!
//! Invariant: `0 <= acquired - released <= capacity` for every gate.
//! Releasing an idle gate is rejected and counted in `over_released`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error};

use crate::config::ThrottleSettings;
use crate::error::DispatchError;

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

struct GateState {
    capacity: usize,
    outstanding: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

/// Point-in-time counters of one gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub capacity: usize,
    pub outstanding: usize,
    pub waiting: usize,
    pub acquired: u64,
    pub released: u64,
    pub over_released: u64,
}

/// A bounded suspend/resume counter with FIFO fairness.
pub struct ThrottleGate {
    name: &'static str,
    state: Mutex<GateState>,
    acquired: AtomicU64,
    released: AtomicU64,
    over_released: AtomicU64,
}

/// Removes an abandoned waiter, handing back a slot granted in the meantime.
struct PendingAcquire<'a> {
    gate: &'a ThrottleGate,
    id: u64,
    grant: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled || self.gate.withdraw(self.id) {
            return;
        }
        // Grants are sent under the state lock, so once the waiter is gone
        // from the queue the grant is already in the channel.
        if self.grant.try_recv().is_ok() {
            let mut state = self.gate.state.lock();
            self.gate.pass_on(&mut state);
        }
    }
}

impl ThrottleGate {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            state: Mutex::new(GateState {
                capacity,
                outstanding: 0,
                waiters: VecDeque::new(),
                next_waiter: 0,
            }),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            over_released: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take a slot without waiting. Never jumps the queue.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.outstanding < state.capacity && state.waiters.is_empty() {
            state.outstanding += 1;
            self.acquired.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Take a slot, suspending in FIFO order until one frees up or the deadline passes.
    pub async fn acquire(&self, deadline: Instant) -> Result<(), DispatchError> {
        let started = Instant::now();
        let (id, grant) = {
            let mut state = self.state.lock();
            if state.outstanding < state.capacity && state.waiters.is_empty() {
                state.outstanding += 1;
                self.acquired.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant: tx });
            (id, rx)
        };
        debug!(gate = self.name, "throttle saturated; waiting");

        let mut pending = PendingAcquire {
            gate: self,
            id,
            grant,
            settled: false,
        };
        match timeout_at(deadline, &mut pending.grant).await {
            Ok(Ok(())) => {
                pending.settled = true;
                self.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(_)) | Err(_) => {
                drop(pending);
                Err(DispatchError::timeout(self.name, started.elapsed()))
            }
        }
    }

    /// Return a slot, waking the longest waiter. Returns false on over-release.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock();
        if state.outstanding == 0 {
            self.over_released.fetch_add(1, Ordering::SeqCst);
            error!(gate = self.name, "throttle released more often than acquired");
            return false;
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        self.pass_on(&mut state);
        true
    }

    /// Change the capacity; waiters are admitted if room opens up.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        while state.outstanding < state.capacity {
            let Some(waiter) = state.waiters.pop_front() else { break };
            if waiter.grant.send(()).is_ok() {
                state.outstanding += 1;
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn stats(&self) -> GateStats {
        let state = self.state.lock();
        GateStats {
            capacity: state.capacity,
            outstanding: state.outstanding,
            waiting: state.waiters.len(),
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            over_released: self.over_released.load(Ordering::SeqCst),
        }
    }

    /// Transfer a freed slot to the next live waiter, or retire it.
    fn pass_on(&self, state: &mut GateState) {
        if state.outstanding <= state.capacity {
            while let Some(waiter) = state.waiters.pop_front() {
                if waiter.grant.send(()).is_ok() {
                    return;
                }
            }
        }
        state.outstanding -= 1;
    }

    fn withdraw(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                state.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Which admission slots one call took from [`ServiceThrottle::acquire_instance_and_quota`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Admission {
    pub instance_slot: bool,
    pub quota: bool,
}

/// Per-gate snapshot; `None` for unbounded gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleStats {
    pub calls: Option<GateStats>,
    pub sessions: Option<GateStats>,
    pub instance_contexts: Option<GateStats>,
    pub dynamic_quota: Option<GateStats>,
}

/// The admission gates of one dispatcher.
pub struct ServiceThrottle {
    calls: Option<ThrottleGate>,
    sessions: Option<ThrottleGate>,
    instance_contexts: Option<ThrottleGate>,
    dynamic_quota: Option<ThrottleGate>,
}

impl ServiceThrottle {
    pub fn new(settings: &ThrottleSettings) -> Self {
        Self {
            calls: settings.max_concurrent_calls.map(|n| ThrottleGate::new("calls", n)),
            sessions: settings
                .max_concurrent_sessions
                .map(|n| ThrottleGate::new("sessions", n)),
            instance_contexts: settings
                .max_concurrent_instances
                .map(|n| ThrottleGate::new("instance contexts", n)),
            dynamic_quota: settings.dynamic_quota.map(|n| ThrottleGate::new("dynamic quota", n)),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(&ThrottleSettings::unbounded())
    }

    /// Returns whether a slot was taken (and is therefore owed back).
    pub async fn acquire_call(&self, deadline: Instant) -> Result<bool, DispatchError> {
        acquire_optional(self.calls.as_ref(), deadline).await
    }

    pub fn release_call(&self) -> bool {
        release_optional(self.calls.as_ref())
    }

    pub async fn acquire_session(&self, deadline: Instant) -> Result<bool, DispatchError> {
        acquire_optional(self.sessions.as_ref(), deadline).await
    }

    pub fn release_session(&self) -> bool {
        release_optional(self.sessions.as_ref())
    }

    /// Instance-context slot (only when `acquire_instance`) and dynamic quota as one step.
    ///
    /// If the quota wait fails, an instance slot taken for this call is
    /// returned before the error propagates.
    pub async fn acquire_instance_and_quota(
        &self,
        acquire_instance: bool,
        deadline: Instant,
    ) -> Result<Admission, DispatchError> {
        let instance_slot = if acquire_instance {
            acquire_optional(self.instance_contexts.as_ref(), deadline).await?
        } else {
            false
        };
        match acquire_optional(self.dynamic_quota.as_ref(), deadline).await {
            Ok(quota) => Ok(Admission { instance_slot, quota }),
            Err(e) => {
                if instance_slot {
                    self.release_instance_context();
                }
                Err(e)
            }
        }
    }

    pub fn release_instance_context(&self) -> bool {
        release_optional(self.instance_contexts.as_ref())
    }

    pub fn release_quota(&self) -> bool {
        release_optional(self.dynamic_quota.as_ref())
    }

    /// Raise the dynamic quota limit. No-op when no quota is configured.
    pub fn increment_quota(&self, by: usize) {
        if let Some(gate) = &self.dynamic_quota {
            gate.set_capacity(gate.capacity().saturating_add(by));
        }
    }

    /// Lower the dynamic quota limit; running calls keep their slots.
    pub fn decrement_quota(&self, by: usize) {
        if let Some(gate) = &self.dynamic_quota {
            gate.set_capacity(gate.capacity().saturating_sub(by));
        }
    }

    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            calls: self.calls.as_ref().map(ThrottleGate::stats),
            sessions: self.sessions.as_ref().map(ThrottleGate::stats),
            instance_contexts: self.instance_contexts.as_ref().map(ThrottleGate::stats),
            dynamic_quota: self.dynamic_quota.as_ref().map(ThrottleGate::stats),
        }
    }
}

async fn acquire_optional(gate: Option<&ThrottleGate>, deadline: Instant) -> Result<bool, DispatchError> {
    match gate {
        Some(gate) => gate.acquire(deadline).await.map(|()| true),
        None => Ok(false),
    }
}

fn release_optional(gate: Option<&ThrottleGate>) -> bool {
    gate.is_some_and(ThrottleGate::release)
}

/// Deadline `after` from now.
pub(crate) fn deadline_after(after: Duration) -> Instant {
    Instant::now() + after
}
