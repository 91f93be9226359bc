use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::clock::{ClockSource, SystemClock};
use crate::config::{AppConfig, EdgeDetect, GpioCapability, PinConfig};
use crate::error::AppError;
use crate::registry::{EdgeCallback, HandlerError};
use crate::service::EdgeService;
use crate::watch::{Direction, GpioBackend, Pull, WaitOutcome};

pub type GpioManager<B> = GenericGpioManager<B>;

/// Publishes edges delivered to HTTP-registered callbacks.
pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: FxHashMap<u32, RwLock<VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
}

impl EventCallbackHandler {
    pub fn new(
        event_tx: broadcast::Sender<EdgeEvent>,
        event_history: FxHashMap<u32, RwLock<VecDeque<EdgeEvent>>>,
        event_history_capacity: usize,
    ) -> Self {
        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        {
            let event = event.clone();
            if let Some(history_lock) = self.event_history.get(&event.pin_id) {
                let mut history = history_lock.write();
                while history.len() >= self.event_history_capacity.max(1) {
                    history.pop_front();
                }
                history.push_back(event);
            }
        }
        let _ = self.event_tx.send(event);
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub pin_id: u32,
    pub channel: String,
    pub timestamp_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinDescriptor {
    pub info: PinConfig,
    pub direction: Direction,
    pub watched: bool,
    pub handlers: usize,
}

pub struct GenericGpioManager<B: GpioBackend + ?Sized> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
    service: EdgeService<B>,
    clock: Arc<dyn ClockSource>,
    event_handler: EventHandler,
    set_up: Mutex<FxHashSet<u32>>,
    watched: Mutex<FxHashSet<u32>>,
}

impl<B: GpioBackend + ?Sized> GenericGpioManager<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Self {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Arc<AppConfig>, backend: Arc<B>, clock: Arc<dyn ClockSource>) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));

        let mut history = FxHashMap::default();
        for id in config.gpios.keys() {
            history.insert(*id, RwLock::new(VecDeque::new()));
        }

        let event_handler = Arc::new(EventCallbackHandler::new(
            event_tx,
            history,
            config.event_history_capacity,
        ));

        Self {
            service: EdgeService::new(backend.clone(), clock.clone()),
            config,
            backend,
            clock,
            event_handler,
            set_up: Mutex::new(FxHashSet::default()),
            watched: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn service(&self) -> &EdgeService<B> {
        &self.service
    }

    pub fn resolve(&self, channel: &str) -> Result<u32, AppError> {
        self.config.resolve_pin(channel)
    }

    fn require_input(&self, channel: &str, pin_id: u32) -> Result<(), AppError> {
        if self.backend.pin_direction(pin_id) != Direction::Input {
            return Err(AppError::NotConfiguredAsInput(channel.to_string()));
        }
        Ok(())
    }

    fn require_edge(edge: EdgeDetect) -> Result<(), AppError> {
        if edge == EdgeDetect::None {
            return Err(AppError::InvalidEdgeKind(format!("{edge:?}").to_lowercase()));
        }
        Ok(())
    }

    fn describe(&self, pin_id: u32, cfg: &PinConfig) -> PinDescriptor {
        PinDescriptor {
            info: cfg.clone(),
            direction: self.backend.pin_direction(pin_id),
            watched: self.backend.is_watched(pin_id),
            handlers: self.service.registry().handler_count(pin_id),
        }
    }

    pub fn list_pins(&self) -> HashMap<u32, PinDescriptor> {
        self.config
            .gpios
            .iter()
            .map(|(id, cfg)| (*id, self.describe(*id, cfg)))
            .collect()
    }

    pub fn get_pin_descriptor(&self, channel: &str) -> Result<PinDescriptor, AppError> {
        let pin_id = self.resolve(channel)?;
        let cfg = self.config.pin(pin_id)?;
        Ok(self.describe(pin_id, cfg))
    }

    pub fn setup(
        &self,
        channel: &str,
        direction: Direction,
        pull: Pull,
        initial: u8,
    ) -> Result<(), AppError> {
        let pin_id = self.resolve(channel)?;
        let cfg = self.config.pin(pin_id)?;

        let pull = match direction {
            Direction::Unset => {
                return Err(AppError::InvalidValue(
                    "Direction must be input or output".into(),
                ));
            }
            Direction::Output => Pull::Off,
            Direction::Input => pull,
        };
        if initial > 1 {
            return Err(AppError::InvalidValue("Value must be 0 or 1".into()));
        }

        let required = match (direction, pull) {
            (Direction::Output, _) => GpioCapability::Output,
            (_, Pull::Up) => GpioCapability::PullUp,
            (_, Pull::Down) => GpioCapability::PullDown,
            _ => GpioCapability::Input,
        };
        if !cfg.capabilities.contains(&required) {
            return Err(AppError::InvalidValue(format!(
                "Channel {channel} does not support {required:?}"
            )));
        }

        self.backend.setup(pin_id, cfg, direction, pull, initial)?;
        self.set_up.lock().insert(pin_id);
        info!("set up {channel} (pin {pin_id}) as {direction:?}, pull {pull:?}");
        Ok(())
    }

    pub fn output(&self, channel: &str, value: u8) -> Result<(), AppError> {
        if value > 1 {
            return Err(AppError::InvalidValue("Value must be 0 or 1".into()));
        }

        let pin_id = self.resolve(channel)?;
        if self.backend.pin_direction(pin_id) != Direction::Output {
            return Err(AppError::NotConfiguredAsOutput(channel.to_string()));
        }
        self.backend.write_value(pin_id, value)
    }

    pub fn input(&self, channel: &str) -> Result<u8, AppError> {
        let pin_id = self.resolve(channel)?;
        if self.backend.pin_direction(pin_id) == Direction::Unset {
            return Err(AppError::NotConfigured(channel.to_string()));
        }
        self.backend.read_value(pin_id)
    }

    pub fn gpio_function(&self, channel: &str) -> Result<Direction, AppError> {
        let pin_id = self.resolve(channel)?;
        Ok(self.backend.pin_direction(pin_id))
    }

    /// Starts edge detection on an input channel, optionally registering a
    /// first callback.
    pub fn add_event_detect(
        &self,
        channel: &str,
        edge: EdgeDetect,
        callback: Option<EdgeCallback>,
        bouncetime_ms: u32,
    ) -> Result<(), AppError> {
        let pin_id = self.resolve(channel)?;
        self.require_input(channel, pin_id)?;
        Self::require_edge(edge)?;

        self.backend
            .start_watch(pin_id, edge, self.service.dispatch_fn())
            .map_err(|e| match e {
                AppError::AlreadyWatched(_) => AppError::AlreadyWatched(channel.to_string()),
                other => other,
            })?;
        self.watched.lock().insert(pin_id);
        self.service.dispatcher().clear_detected(pin_id);

        if let Some(callback) = callback
            && let Err(e) = self
                .service
                .register_handler(channel, pin_id, callback, bouncetime_ms)
        {
            self.service.unregister_all(pin_id);
            self.watched.lock().remove(&pin_id);
            return Err(e);
        }

        info!("edge detection ({edge:?}) enabled on {channel} (pin {pin_id})");
        Ok(())
    }

    pub fn add_event_callback(
        &self,
        channel: &str,
        callback: EdgeCallback,
        bouncetime_ms: u32,
    ) -> Result<(), AppError> {
        let pin_id = self.resolve(channel)?;
        self.require_input(channel, pin_id)?;
        self.service
            .register_handler(channel, pin_id, callback, bouncetime_ms)
    }

    pub fn remove_event_detect(&self, channel: &str) -> Result<(), AppError> {
        let pin_id = self.resolve(channel)?;
        self.service.unregister_all(pin_id);
        self.watched.lock().remove(&pin_id);
        info!("edge detection disabled on {channel} (pin {pin_id})");
        Ok(())
    }

    pub fn event_detected(&self, channel: &str) -> Result<bool, AppError> {
        let pin_id = self.resolve(channel)?;
        Ok(self.service.event_detected(pin_id))
    }

    /// Blocks until an edge on the channel; `true` on an edge, `false` on timeout.
    pub fn wait_for_edge(
        &self,
        channel: &str,
        edge: EdgeDetect,
        timeout: Option<Duration>,
    ) -> Result<bool, AppError> {
        let pin_id = self.resolve(channel)?;
        self.require_input(channel, pin_id)?;
        Self::require_edge(edge)?;

        match self.service.wait_for_edge(pin_id, edge, timeout)? {
            WaitOutcome::EdgeOccurred => Ok(true),
            WaitOutcome::TimedOut => Ok(false),
            WaitOutcome::AlreadyWatched => Err(AppError::AlreadyWatched(channel.to_string())),
        }
    }

    /// Callback publishing each delivered edge to event subscribers and history.
    pub fn event_callback(&self, pin_id: u32) -> EdgeCallback {
        let handler = self.event_handler.clone();
        let clock = self.clock.clone();
        Arc::new(move |channel: &str| -> Result<(), HandlerError> {
            handler.dispatch(EdgeEvent {
                pin_id,
                channel: channel.to_string(),
                timestamp_us: clock.now_micros(),
            });
            Ok(())
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_handler.event_tx.subscribe()
    }

    pub fn get_events(&self, channel: &str, limit: Option<usize>) -> Result<Vec<EdgeEvent>, AppError> {
        let pin_id = self.resolve(channel)?;
        let map = &self.event_handler.event_history;

        Ok(map
            .get(&pin_id)
            .map(|d| {
                let events: Vec<EdgeEvent> = if let Some(lim) = limit {
                    d.read().iter().rev().take(lim).cloned().collect()
                } else {
                    d.read().iter().cloned().collect()
                };
                if limit.is_some() {
                    events.into_iter().rev().collect()
                } else {
                    events
                }
            })
            .unwrap_or_default())
    }

    pub fn get_last_event(&self, channel: &str) -> Result<Option<EdgeEvent>, AppError> {
        let pin_id = self.resolve(channel)?;
        let map = &self.event_handler.event_history;

        Ok(map.get(&pin_id).and_then(|d| d.read().back().cloned()))
    }

    /// Stops all edge detection, drops every handler and releases every pin
    /// set up through this manager. Safe to call repeatedly.
    pub fn cleanup(&self) {
        self.service.shutdown();

        let watched: Vec<u32> = self.watched.lock().drain().collect();
        for pin_id in watched {
            self.backend.stop_watch(pin_id);
        }

        let set_up: Vec<u32> = self.set_up.lock().drain().collect();
        if set_up.is_empty() {
            return;
        }
        for pin_id in &set_up {
            self.backend.release(*pin_id);
        }
        info!("cleaned up pins {set_up:?}");
    }
}

impl<B: GpioBackend + ?Sized> Drop for GenericGpioManager<B> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
