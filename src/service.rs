use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;

use crate::clock::ClockSource;
use crate::config::EdgeDetect;
use crate::dispatch::{Dispatcher, HandlerGate};
use crate::error::AppError;
use crate::registry::{CallbackRegistry, EdgeCallback};
use crate::waiter::BlockingWaiter;
use crate::watch::{EdgeDispatch, EdgeWatch, WaitOutcome};

/// Owns the callback registry and everything that acts on it.
///
/// Dropping the service shuts it down.
pub struct EdgeService<W: EdgeWatch + ?Sized> {
    watch: Arc<W>,
    registry: Arc<CallbackRegistry>,
    dispatcher: Arc<Dispatcher>,
    waiter: BlockingWaiter<W>,
    // registration checks and removal run as one step against the watch state
    mutation: Mutex<()>,
}

impl<W: EdgeWatch + ?Sized> EdgeService<W> {
    pub fn new(watch: Arc<W>, clock: Arc<dyn ClockSource>) -> Self {
        let registry = Arc::new(CallbackRegistry::new());
        let gate = Arc::new(HandlerGate::default());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), clock, gate.clone()));

        Self {
            waiter: BlockingWaiter::new(watch.clone(), gate),
            watch,
            registry,
            dispatcher,
            mutation: Mutex::new(()),
        }
    }

    /// The function an edge watch calls per edge.
    pub fn dispatch_fn(&self) -> EdgeDispatch {
        let dispatcher = self.dispatcher.clone();
        Arc::new(move |pin_id| dispatcher.on_edge(pin_id))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Adds a handler to a pin that is already being watched.
    pub fn register_handler(
        &self,
        channel_label: &str,
        pin_id: u32,
        handler: EdgeCallback,
        debounce_window_ms: u32,
    ) -> Result<(), AppError> {
        let _mutation = self.mutation.lock();
        if !self.watch.is_watched(pin_id) {
            return Err(AppError::NotWatched(channel_label.to_string()));
        }
        self.registry
            .register(channel_label, pin_id, handler, debounce_window_ms)
    }

    /// Drops every handler for the pin and stops watching it.
    pub fn unregister_all(&self, pin_id: u32) {
        let _mutation = self.mutation.lock();
        self.registry.unregister_all(pin_id);
        self.watch.stop_watch(pin_id);
    }

    pub fn wait_for_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, AppError> {
        self.waiter.wait_for_edge(pin_id, edge, timeout)
    }

    pub fn event_detected(&self, pin_id: u32) -> bool {
        self.dispatcher.take_detected(pin_id)
    }

    /// Stops every watch with registered handlers and releases all handlers.
    /// Safe to call any number of times.
    pub fn shutdown(&self) {
        let _mutation = self.mutation.lock();
        let pins = self.registry.clear();
        if pins.is_empty() {
            return;
        }
        for pin_id in &pins {
            self.watch.stop_watch(*pin_id);
        }
        info!("edge service shut down, released pins {pins:?}");
    }
}

impl<W: EdgeWatch + ?Sized> Drop for EdgeService<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
