use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::config::EdgeDetect;
use crate::dispatch::HandlerGate;
use crate::error::AppError;
use crate::watch::{EdgeWatch, WaitOutcome};

/// Single-shot wait for an edge, exclusive with callback watching.
///
/// Holds no registry or handler state while blocked. A wait issued from
/// inside a handler suspends the handler gate, so dispatch and registration
/// on other pins carry on.
pub struct BlockingWaiter<W: EdgeWatch + ?Sized> {
    watch: Arc<W>,
    gate: Arc<HandlerGate>,
}

impl<W: EdgeWatch + ?Sized> BlockingWaiter<W> {
    pub fn new(watch: Arc<W>, gate: Arc<HandlerGate>) -> Self {
        Self { watch, gate }
    }

    pub fn wait_for_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, AppError> {
        if self.watch.is_watched(pin_id) {
            return Ok(WaitOutcome::AlreadyWatched);
        }

        debug!("waiting for {edge:?} edge on pin {pin_id}, timeout {timeout:?}");
        let _suspended = self.gate.suspend();
        match self.watch.block_until_edge(pin_id, edge, timeout) {
            Ok(outcome) => Ok(outcome),
            Err(AppError::AlreadyWatched(_)) => Ok(WaitOutcome::AlreadyWatched),
            Err(e) => Err(e),
        }
    }
}
