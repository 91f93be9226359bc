use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use libgpiod::{chip::Chip, line, request};
use parking_lot::{FairMutex, Mutex, RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use super::listener::{EDGE_POLL_SLICE, EdgeListener};
use crate::config::{EdgeDetect, PinConfig};
use crate::error::AppError;
use crate::watch::{Direction, EdgeDispatch, EdgeWatch, PinControl, Pull, WaitOutcome};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;

/// Maps a libgpiod failure to `AppError::Io`, carrying the errno recorded
/// with the failed operation. Failures not raised by the kernel get -1.
fn gpiod_error(what: &str, e: libgpiod::Error) -> AppError {
    let code = match &e {
        libgpiod::Error::OperationFailed(_, errno) => errno.0,
        _ => -1,
    };
    AppError::io(code, format!("{what}: {e}"))
}

pub struct LibgpiodBackend {
    pins: RwLock<FxHashMap<u32, Mutex<PinHandle>>>, // keyed by pin id
}

struct PinHandle {
    line: u32,
    direction: Direction,
    pull: Pull,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    watch: PinWatch,
}

enum PinWatch {
    Idle,
    Callback(EdgeListener<GpiodHandle>),
    Blocking,
}

impl PinHandle {
    fn reconfigure(&self, edge: Option<EdgeDetect>) -> Result<(), AppError> {
        let line_settings = LibgpiodBackend::make_line_settings(self.direction, self.pull, edge)?;
        let line_cfg = LibgpiodBackend::make_line_config(self.line, line_settings)?;

        self.gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| gpiod_error("reconfigure lines", e))?;
        Ok(())
    }
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| gpiod_error(&format!("open chip {path}"), e))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg = request::Config::new().map_err(|e| gpiod_error("request config", e))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| gpiod_error("request consumer", e))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| gpiod_error("request lines", e))
    }

    /// Waits at most `timeout` and returns how many edge events were drained.
    fn poll_edges(
        &self,
        buffer: &mut request::Buffer,
        timeout: Duration,
    ) -> Result<usize, AppError> {
        let has_event = self
            .request
            .wait_edge_events(Some(timeout))
            .map_err(|e| gpiod_error("wait edge events", e))?;
        if !has_event {
            return Ok(0);
        }

        let events = self
            .request
            .read_edge_events(buffer)
            .map_err(|e| gpiod_error("read edge events", e))?;
        Ok(events.filter(|evt| evt.is_ok()).count())
    }
}

impl LibgpiodBackend {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            pins: RwLock::new(FxHashMap::default()),
        })
    }

    fn make_line_settings(
        direction: Direction,
        pull: Pull,
        edge: Option<EdgeDetect>,
    ) -> Result<line::Settings, AppError> {
        let mut ls = line::Settings::new().map_err(|e| gpiod_error("libgpiod settings", e))?;

        match direction {
            Direction::Unset => {
                return Err(AppError::InvalidValue(
                    "cannot create settings for an unset direction".into(),
                ));
            }
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| gpiod_error("set direction", e))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| gpiod_error("set drive", e))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| gpiod_error("set direction", e))?;
                let bias = match pull {
                    Pull::Off => None,
                    Pull::Up => Some(line::Bias::PullUp),
                    Pull::Down => Some(line::Bias::PullDown),
                };
                ls.set_bias(bias).map_err(|e| gpiod_error("set bias", e))?;
            }
        }

        if let Some(edge) = edge
            && direction == Direction::Input
        {
            let edge = match edge {
                EdgeDetect::None => None,
                EdgeDetect::Rising => Some(line::Edge::Rising),
                EdgeDetect::Falling => Some(line::Edge::Falling),
                EdgeDetect::Both => Some(line::Edge::Both),
            };
            ls.set_edge_detection(edge)
                .map_err(|e| gpiod_error("set edge detection", e))?;
        }

        Ok(ls)
    }

    fn event_buffer() -> Result<request::Buffer, AppError> {
        request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| gpiod_error("event buffer", e))
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg = line::Config::new().map_err(|e| gpiod_error("line config", e))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| gpiod_error("line config add settings", e))?;
        Ok(cfg)
    }

    fn with_input_pin<T>(
        &self,
        pin_id: u32,
        f: impl FnOnce(&mut PinHandle) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let pins = self.pins.read();
        let mut handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::NotConfigured(pin_id.to_string()))?
            .lock();
        if handle.direction != Direction::Input {
            return Err(AppError::NotConfiguredAsInput(pin_id.to_string()));
        }
        f(&mut *handle)
    }
}

impl PinControl for LibgpiodBackend {
    fn setup(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        direction: Direction,
        pull: Pull,
        initial: u8,
    ) -> Result<(), AppError> {
        let pull = if direction == Direction::Output {
            Pull::Off
        } else {
            pull
        };
        let line_settings = Self::make_line_settings(direction, pull, None)?;
        let line_cfg = Self::make_line_config(pin.line, line_settings)?;

        {
            let pins = self.pins.upgradable_read();

            match pins.get(&pin_id) {
                Some(handle) => {
                    let mut handle = handle.lock();
                    if !matches!(handle.watch, PinWatch::Idle) {
                        return Err(AppError::AlreadyWatched(pin_id.to_string()));
                    }
                    handle
                        .gpiod_handle
                        .lock()
                        .request
                        .reconfigure_lines(&line_cfg)
                        .map_err(|e| gpiod_error("reconfigure lines", e))?;
                    handle.direction = direction;
                    handle.pull = pull;
                }
                None => {
                    // upgradable read is exclusive among writers, the request can be made before upgrading
                    let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&pin.chip, &line_cfg)?));
                    let handle = Mutex::new(PinHandle {
                        line: pin.line,
                        direction,
                        pull,
                        gpiod_handle,
                        watch: PinWatch::Idle,
                    });

                    let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
                    pins.insert(pin_id, handle);
                }
            }
        }

        if direction == Direction::Output {
            self.write_value(pin_id, initial)?;
        }
        Ok(())
    }

    fn pin_direction(&self, pin_id: u32) -> Direction {
        self.pins
            .read()
            .get(&pin_id)
            .map(|handle| handle.lock().direction)
            .unwrap_or_default()
    }

    fn read_value(&self, pin_id: u32) -> Result<u8, AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::NotConfigured(pin_id.to_string()))?
            .lock();

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(handle.line)
            .map_err(|e| gpiod_error("get value", e))?;
        Ok(match value {
            line::Value::InActive => 0,
            line::Value::Active => 1,
        })
    }

    fn write_value(&self, pin_id: u32, value: u8) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::NotConfigured(pin_id.to_string()))?
            .lock();

        if handle.direction != Direction::Output {
            return Err(AppError::NotConfiguredAsOutput(pin_id.to_string()));
        }

        let offset = handle.line;

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(
                offset,
                match value {
                    0 => line::Value::InActive,
                    _ => line::Value::Active,
                },
            )
            .map_err(|e| gpiod_error("set value", e))?;
        Ok(())
    }

    fn release(&self, pin_id: u32) {
        if self.pins.write().remove(&pin_id).is_some() {
            debug!("released pin {pin_id}");
        }
    }
}

impl EdgeWatch for LibgpiodBackend {
    fn start_watch(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        dispatch: EdgeDispatch,
    ) -> Result<(), AppError> {
        let mut buffer = Self::event_buffer()?;

        self.with_input_pin(pin_id, |handle| {
            if !matches!(handle.watch, PinWatch::Idle) {
                return Err(AppError::AlreadyWatched(pin_id.to_string()));
            }
            let listener = EdgeListener::spawn(
                pin_id,
                handle.gpiod_handle.clone(),
                move |gpiod: &mut GpiodHandle, slice| gpiod.poll_edges(&mut buffer, slice),
                dispatch,
            )?;
            // on failure the listener is dropped and the pin stays idle
            handle.reconfigure(Some(edge))?;
            handle.watch = PinWatch::Callback(listener);
            Ok(())
        })
    }

    fn stop_watch(&self, pin_id: u32) {
        let pins = self.pins.read();
        let Some(handle) = pins.get(&pin_id) else {
            return;
        };
        let mut handle = handle.lock();
        if !matches!(handle.watch, PinWatch::Callback(_)) {
            return;
        }

        handle.watch = PinWatch::Idle;
        if let Err(e) = handle.reconfigure(None) {
            warn!("failed to disable edge detection on pin {pin_id}: {e}");
        }
    }

    fn is_watched(&self, pin_id: u32) -> bool {
        self.pins
            .read()
            .get(&pin_id)
            .is_some_and(|handle| matches!(handle.lock().watch, PinWatch::Callback(_)))
    }

    fn block_until_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, AppError> {
        let mut buffer = Self::event_buffer()?;
        let gpiod_handle = self.with_input_pin(pin_id, |handle| {
            if !matches!(handle.watch, PinWatch::Idle) {
                return Err(AppError::AlreadyWatched(pin_id.to_string()));
            }
            handle.reconfigure(Some(edge))?;
            handle.watch = PinWatch::Blocking;
            Ok(handle.gpiod_handle.clone())
        })?;

        let deadline = timeout.map(|t| Instant::now() + t);

        // polled in slices so reads on the same line are not starved
        let outcome = loop {
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break Ok(WaitOutcome::TimedOut);
                    }
                    remaining.min(EDGE_POLL_SLICE)
                }
                None => EDGE_POLL_SLICE,
            };

            match gpiod_handle.lock().poll_edges(&mut buffer, slice) {
                Ok(0) => {}
                Ok(_) => break Ok(WaitOutcome::EdgeOccurred),
                Err(e) => break Err(e),
            }
        };

        let pins = self.pins.read();
        if let Some(handle) = pins.get(&pin_id) {
            let mut handle = handle.lock();
            if matches!(handle.watch, PinWatch::Blocking) {
                handle.watch = PinWatch::Idle;
                if let Err(e) = handle.reconfigure(None) {
                    warn!("failed to disable edge detection on pin {pin_id}: {e}");
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_kernel_failures_do_not_pick_up_a_stale_errno() {
        // leaves ENOENT as the thread's last OS error
        assert!(std::fs::File::open("/nonexistent/gpiochip").is_err());

        let err = gpiod_error("line config", libgpiod::Error::InvalidArguments);
        assert!(matches!(err, AppError::Io { code: -1, .. }));
    }
}
