use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{EdgeDetect, PinConfig};
use crate::error::AppError;

/// Called by an edge watch once per observed edge, with the pin id.
pub type EdgeDispatch = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
    #[default]
    Unset,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WaitOutcome {
    EdgeOccurred,
    TimedOut,
    AlreadyWatched,
}

/// Direction, level and lifetime of individual pins.
pub trait PinControl: Send + Sync {
    fn setup(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        direction: Direction,
        pull: Pull,
        initial: u8,
    ) -> Result<(), AppError>;
    fn pin_direction(&self, pin_id: u32) -> Direction;
    fn read_value(&self, pin_id: u32) -> Result<u8, AppError>;
    fn write_value(&self, pin_id: u32, value: u8) -> Result<(), AppError>;
    /// Returns the pin to its unconfigured state. Unknown pins are ignored.
    fn release(&self, pin_id: u32);
}

/// Edge detection on input pins.
///
/// A pin is watched by at most one consumer at a time: either a callback
/// watch started with [`EdgeWatch::start_watch`], or a single blocking wait.
pub trait EdgeWatch: Send + Sync {
    fn start_watch(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        dispatch: EdgeDispatch,
    ) -> Result<(), AppError>;
    fn stop_watch(&self, pin_id: u32);
    /// True while a callback watch is active on the pin.
    fn is_watched(&self, pin_id: u32) -> bool;
    /// Blocks until an edge or the timeout. `None` waits forever.
    ///
    /// Never returns [`WaitOutcome::AlreadyWatched`]; a pin already being
    /// watched is reported as [`AppError::AlreadyWatched`].
    fn block_until_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, AppError>;
}

pub trait GpioBackend: PinControl + EdgeWatch {}

impl<T: PinControl + EdgeWatch + ?Sized> GpioBackend for T {}
