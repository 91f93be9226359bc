use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{error, trace};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

use crate::clock::ClockSource;
use crate::error::AppError;
use crate::registry::{CallbackRegistry, HandlerEntry};

/// Debounce decision for one entry.
///
/// Fires when debounce is disabled, the entry never fired, the clock went
/// backwards, or strictly more than the window has passed since the last
/// accepted firing.
pub fn debounce_allows(last_invoked_at: Option<u64>, now: u64, debounce_window_ms: u32) -> bool {
    let Some(last) = last_invoked_at else {
        return true;
    };
    debounce_window_ms == 0 || last > now || now - last > u64::from(debounce_window_ms) * 1000
}

/// Scope held while a handler runs.
///
/// Handlers run one at a time process-wide. The gate is reentrant so an edge
/// delivered synchronously from inside a handler does not deadlock, and a
/// handler that blocks waiting for an edge hands it over with [`HandlerGate::suspend`].
#[derive(Default)]
pub struct HandlerGate {
    state: Mutex<GateState>,
    released: Condvar,
}

#[derive(Default)]
struct GateState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl HandlerGate {
    pub fn enter(&self) -> GateGuard<'_> {
        self.acquire(1);
        GateGuard { gate: self }
    }

    /// Releases every level the current thread holds until the returned
    /// value is dropped. A no-op on threads not holding the gate.
    pub fn suspend(&self) -> SuspendedGate<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let depth = if state.owner == Some(me) {
            let depth = std::mem::take(&mut state.depth);
            state.owner = None;
            self.released.notify_one();
            depth
        } else {
            0
        };
        SuspendedGate { gate: self, depth }
    }

    /// Whether the current thread is inside a handler.
    pub fn is_held_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    fn acquire(&self, depth: usize) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                Some(owner) if owner == me => {
                    state.depth += depth;
                    return;
                }
                None => {
                    state.owner = Some(me);
                    state.depth = depth;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_one();
        }
    }
}

pub struct GateGuard<'a> {
    gate: &'a HandlerGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

/// Gate levels given up by [`HandlerGate::suspend`], taken back on drop.
pub struct SuspendedGate<'a> {
    gate: &'a HandlerGate,
    depth: usize,
}

impl Drop for SuspendedGate<'_> {
    fn drop(&mut self) {
        if self.depth > 0 {
            self.gate.acquire(self.depth);
        }
    }
}

pub struct Dispatcher {
    registry: Arc<CallbackRegistry>,
    clock: Arc<dyn ClockSource>,
    gate: Arc<HandlerGate>,
    detected: Mutex<FxHashSet<u32>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CallbackRegistry>,
        clock: Arc<dyn ClockSource>,
        gate: Arc<HandlerGate>,
    ) -> Self {
        Self {
            registry,
            clock,
            gate,
            detected: Mutex::new(FxHashSet::default()),
        }
    }

    /// Runs the handlers registered for `pin_id`, in registration order.
    ///
    /// Stops early once the pin's entries are removed, including by one of
    /// the handlers being run.
    pub fn on_edge(&self, pin_id: u32) {
        self.detected.lock().insert(pin_id);

        let Some(snapshot) = self.registry.snapshot_for(pin_id) else {
            trace!("edge on pin {pin_id} with no handlers");
            return;
        };
        let now = self.clock.now_micros();

        for entry in snapshot.entries() {
            if !self.registry.is_current(&snapshot) {
                trace!("handlers for pin {pin_id} removed mid-dispatch");
                break;
            }
            if !debounce_allows(entry.last_invoked_at(), now, entry.debounce_window_ms()) {
                trace!(
                    "debounced edge on pin {pin_id} for {} ({}us since last call)",
                    entry.channel_label(),
                    entry.last_invoked_at().map_or(0, |last| now.saturating_sub(last))
                );
                continue;
            }

            entry.mark_invoked(now);
            self.invoke(entry);
        }
    }

    fn invoke(&self, entry: &HandlerEntry) {
        let _gate = self.gate.enter();
        let handler = entry.handler().as_ref();

        let fault = match panic::catch_unwind(AssertUnwindSafe(|| handler(entry.channel_label()))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        error!(
            "{}",
            AppError::HandlerFault {
                channel: entry.channel_label().to_string(),
                reason: fault,
            }
        );
    }

    /// Whether an edge was seen on `pin_id` since the last call. Clears the flag.
    pub fn take_detected(&self, pin_id: u32) -> bool {
        self.detected.lock().remove(&pin_id)
    }

    pub fn clear_detected(&self, pin_id: u32) {
        self.detected.lock().remove(&pin_id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_always_fires() {
        assert!(debounce_allows(Some(1_000), 1_001, 0));
        assert!(debounce_allows(Some(1_000), 1_000, 0));
    }

    #[test]
    fn first_call_always_fires() {
        assert!(debounce_allows(None, 0, 200));
        assert!(debounce_allows(None, 5, 200));
    }

    #[test]
    fn window_is_exclusive() {
        assert!(!debounce_allows(Some(0), 100_000, 200));
        assert!(!debounce_allows(Some(0), 200_000, 200));
        assert!(debounce_allows(Some(0), 200_001, 200));
    }

    #[test]
    fn clock_regression_fires() {
        assert!(debounce_allows(Some(500_000), 100, 10_000));
    }
}

#[cfg(test)]
mod gate_tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn gate_is_reentrant_on_one_thread() {
        let gate = HandlerGate::default();
        let outer = gate.enter();
        {
            let _inner = gate.enter();
            assert!(gate.is_held_by_current());
        }
        assert!(gate.is_held_by_current());
        drop(outer);
        assert!(!gate.is_held_by_current());
    }

    #[test]
    fn suspended_gate_lets_other_threads_in() {
        let gate = Arc::new(HandlerGate::default());
        let _outer = gate.enter();
        let _inner = gate.enter();

        let (tx, rx) = mpsc::channel();
        let suspended = gate.suspend();
        assert!(!gate.is_held_by_current());

        let other = {
            let gate = gate.clone();
            thread::spawn(move || {
                let _entered = gate.enter();
                tx.send(()).unwrap();
            })
        };
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        other.join().unwrap();

        drop(suspended);
        assert!(gate.is_held_by_current());
    }

    #[test]
    fn suspend_without_holding_is_a_noop() {
        let gate = HandlerGate::default();
        drop(gate.suspend());
        assert!(!gate.is_held_by_current());
        let _entered = gate.enter();
    }
}
