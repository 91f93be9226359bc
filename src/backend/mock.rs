use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::config::{EdgeDetect, PinConfig};
use crate::error::AppError;
use crate::watch::{Direction, EdgeDispatch, EdgeWatch, PinControl, Pull, WaitOutcome};

/// In-memory pins. Input levels are driven from outside with [`MockGpioBackend::drive`].
#[derive(Default)]
pub struct MockGpioBackend {
    pins: Mutex<FxHashMap<u32, MockPinState>>, // keyed by pin id
    edge_signal: Condvar,
    injected_failure: Mutex<Option<i32>>,
}

struct MockPinState {
    direction: Direction,
    value: u8,
    watch: MockWatch,
    edges_seen: u64,
}

enum MockWatch {
    Idle,
    Callback {
        edge: EdgeDetect,
        dispatch: EdgeDispatch,
    },
    Blocking {
        edge: EdgeDetect,
    },
}

impl MockGpioBackend {
    /// Sets the level seen on an input pin, delivering an edge if one results.
    ///
    /// Callback watches are dispatched on the calling thread.
    pub fn drive(&self, pin_id: u32, level: u8) -> Result<(), AppError> {
        if level > 1 {
            return Err(AppError::InvalidValue("Value must be 0 or 1".into()));
        }

        let dispatch = {
            let mut pins = self.pins.lock();
            let pin = pins
                .get_mut(&pin_id)
                .ok_or_else(|| AppError::NotConfigured(pin_id.to_string()))?;
            if pin.direction != Direction::Input {
                return Err(AppError::NotConfiguredAsInput(pin_id.to_string()));
            }

            let old = pin.value;
            pin.value = level;
            let Some(observed) = EdgeDetect::between(old, level) else {
                return Ok(());
            };

            match &pin.watch {
                MockWatch::Callback { edge, dispatch } if edge.matches(observed) => {
                    Some(dispatch.clone())
                }
                MockWatch::Blocking { edge } if edge.matches(observed) => {
                    pin.edges_seen += 1;
                    self.edge_signal.notify_all();
                    None
                }
                _ => None,
            }
        };

        if let Some(dispatch) = dispatch {
            dispatch(pin_id);
        }
        Ok(())
    }

    /// Drives a full low-high-low cycle.
    pub fn pulse(&self, pin_id: u32) -> Result<(), AppError> {
        self.drive(pin_id, 0)?;
        self.drive(pin_id, 1)?;
        self.drive(pin_id, 0)
    }

    /// True while a blocking wait is parked on the pin.
    pub fn is_blocking(&self, pin_id: u32) -> bool {
        self.pins
            .lock()
            .get(&pin_id)
            .is_some_and(|pin| matches!(pin.watch, MockWatch::Blocking { .. }))
    }

    /// Makes the next watch request fail with the given error code.
    pub fn inject_failure(&self, code: i32) {
        *self.injected_failure.lock() = Some(code);
    }

    fn take_failure(&self, what: &str) -> Result<(), AppError> {
        match self.injected_failure.lock().take() {
            Some(code) => Err(AppError::io(code, format!("{what}: injected failure"))),
            None => Ok(()),
        }
    }
}

impl PinControl for MockGpioBackend {
    fn setup(
        &self,
        pin_id: u32,
        _pin: &PinConfig,
        direction: Direction,
        pull: Pull,
        initial: u8,
    ) -> Result<(), AppError> {
        let mut pins = self.pins.lock();
        if let Some(pin) = pins.get(&pin_id)
            && !matches!(pin.watch, MockWatch::Idle)
        {
            return Err(AppError::AlreadyWatched(pin_id.to_string()));
        }

        let value = match (direction, pull) {
            (Direction::Output, _) => initial,
            (_, Pull::Up) => 1,
            _ => 0,
        };
        pins.insert(
            pin_id,
            MockPinState {
                direction,
                value,
                watch: MockWatch::Idle,
                edges_seen: 0,
            },
        );
        Ok(())
    }

    fn pin_direction(&self, pin_id: u32) -> Direction {
        self.pins
            .lock()
            .get(&pin_id)
            .map(|pin| pin.direction)
            .unwrap_or_default()
    }

    fn read_value(&self, pin_id: u32) -> Result<u8, AppError> {
        self.pins
            .lock()
            .get(&pin_id)
            .map(|pin| pin.value)
            .ok_or_else(|| AppError::NotConfigured(pin_id.to_string()))
    }

    fn write_value(&self, pin_id: u32, value: u8) -> Result<(), AppError> {
        let mut pins = self.pins.lock();
        let pin = pins
            .get_mut(&pin_id)
            .ok_or_else(|| AppError::NotConfigured(pin_id.to_string()))?;

        if pin.direction != Direction::Output {
            return Err(AppError::NotConfiguredAsOutput(pin_id.to_string()));
        }
        pin.value = value;
        Ok(())
    }

    fn release(&self, pin_id: u32) {
        if self.pins.lock().remove(&pin_id).is_some() {
            self.edge_signal.notify_all();
        }
    }
}

impl EdgeWatch for MockGpioBackend {
    fn start_watch(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        dispatch: EdgeDispatch,
    ) -> Result<(), AppError> {
        self.take_failure("start watch")?;

        let mut pins = self.pins.lock();
        let pin = pins
            .get_mut(&pin_id)
            .ok_or_else(|| AppError::NotConfigured(pin_id.to_string()))?;
        if pin.direction != Direction::Input {
            return Err(AppError::NotConfiguredAsInput(pin_id.to_string()));
        }
        if !matches!(pin.watch, MockWatch::Idle) {
            return Err(AppError::AlreadyWatched(pin_id.to_string()));
        }

        pin.watch = MockWatch::Callback { edge, dispatch };
        debug!("mock watching pin {pin_id} for {edge:?}");
        Ok(())
    }

    fn stop_watch(&self, pin_id: u32) {
        // dropped outside the lock, the dispatch fn may hold the last dispatcher reference
        let _released = self.pins.lock().get_mut(&pin_id).and_then(|pin| {
            match std::mem::replace(&mut pin.watch, MockWatch::Idle) {
                MockWatch::Callback { dispatch, .. } => Some(dispatch),
                blocking @ MockWatch::Blocking { .. } => {
                    pin.watch = blocking;
                    None
                }
                MockWatch::Idle => None,
            }
        });
    }

    fn is_watched(&self, pin_id: u32) -> bool {
        self.pins
            .lock()
            .get(&pin_id)
            .is_some_and(|pin| matches!(pin.watch, MockWatch::Callback { .. }))
    }

    fn block_until_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, AppError> {
        self.take_failure("wait for edge")?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pins = self.pins.lock();

        let start_seq = {
            let pin = pins
                .get_mut(&pin_id)
                .ok_or_else(|| AppError::NotConfigured(pin_id.to_string()))?;
            if pin.direction != Direction::Input {
                return Err(AppError::NotConfiguredAsInput(pin_id.to_string()));
            }
            if !matches!(pin.watch, MockWatch::Idle) {
                return Err(AppError::AlreadyWatched(pin_id.to_string()));
            }
            pin.watch = MockWatch::Blocking { edge };
            pin.edges_seen
        };

        let outcome = loop {
            match pins.get(&pin_id) {
                Some(pin) if pin.edges_seen != start_seq => break Ok(WaitOutcome::EdgeOccurred),
                Some(_) => {}
                None => {
                    break Err(AppError::io(
                        -1,
                        format!("pin {pin_id} released while waiting"),
                    ));
                }
            }

            match deadline {
                Some(deadline) => {
                    if self.edge_signal.wait_until(&mut pins, deadline).timed_out() {
                        let edge_seen = pins
                            .get(&pin_id)
                            .is_some_and(|pin| pin.edges_seen != start_seq);
                        break Ok(if edge_seen {
                            WaitOutcome::EdgeOccurred
                        } else {
                            WaitOutcome::TimedOut
                        });
                    }
                }
                None => self.edge_signal.wait(&mut pins),
            }
        };

        if let Some(pin) = pins.get_mut(&pin_id)
            && matches!(pin.watch, MockWatch::Blocking { .. })
        {
            pin.watch = MockWatch::Idle;
        }
        outcome
    }
}
