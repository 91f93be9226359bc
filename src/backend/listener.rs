use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::yield_now;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::FairMutex;

use crate::error::AppError;
use crate::watch::EdgeDispatch;

/// Longest a listener or a blocking wait keeps a line locked per poll.
pub(crate) const EDGE_POLL_SLICE: Duration = Duration::from_millis(10);

/// Listener thread delivering edges of one line to a dispatch function.
///
/// `poll` runs with the line locked and returns how many edges it drained.
/// The cancel flag is checked under the same lock, so once a drop returns the
/// thread drains nothing more and later edges stay queued for the next
/// consumer of the line. The thread itself is not joined, the drop may run
/// inside a handler it is dispatching.
pub(crate) struct EdgeListener<S> {
    cancel: Arc<AtomicBool>,
    line: Arc<FairMutex<S>>,
}

impl<S: Send + 'static> EdgeListener<S> {
    pub(crate) fn spawn<P>(
        pin_id: u32,
        line: Arc<FairMutex<S>>,
        mut poll: P,
        dispatch: EdgeDispatch,
    ) -> Result<Self, AppError>
    where
        P: FnMut(&mut S, Duration) -> Result<usize, AppError> + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let polled_line = line.clone();

        std::thread::Builder::new()
            .name(format!("gpio-edge-{pin_id}"))
            .spawn(move || {
                loop {
                    // released before dispatch so handlers can reconfigure the line
                    let polled = {
                        let mut line = polled_line.lock();
                        if cancel_flag.load(Ordering::Acquire) {
                            break;
                        }
                        poll(&mut *line, EDGE_POLL_SLICE)
                    };
                    let count = match polled {
                        Ok(count) => count,
                        Err(e) => {
                            warn!("edge listener error for pin {pin_id}: {e}");
                            yield_now();
                            continue;
                        }
                    };

                    for _ in 0..count {
                        if cancel_flag.load(Ordering::Acquire) {
                            break;
                        }
                        dispatch(pin_id);
                    }
                }
                debug!("edge listener for pin {pin_id} stopped");
            })
            .map_err(|e| {
                AppError::io(
                    e.raw_os_error().unwrap_or(-1),
                    format!("spawn edge listener: {e}"),
                )
            })?;

        Ok(Self { cancel, line })
    }
}

impl<S> Drop for EdgeListener<S> {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        // wait out a poll in progress; the next one sees the flag
        drop(self.line.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeLine {
        pending: usize,
    }

    fn poll_fake(line: &mut FakeLine, _slice: Duration) -> Result<usize, AppError> {
        thread::sleep(Duration::from_millis(1));
        Ok(std::mem::take(&mut line.pending))
    }

    fn counting(count: &Arc<AtomicUsize>) -> EdgeDispatch {
        let count = count.clone();
        Arc::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn edges_after_drop_stay_queued_for_the_next_consumer() {
        let line = Arc::new(FairMutex::new(FakeLine::default()));
        let count = Arc::new(AtomicUsize::new(0));
        let listener = EdgeListener::spawn(7, line.clone(), poll_fake, counting(&count)).unwrap();

        line.lock().pending = 3;
        wait_until(|| count.load(Ordering::SeqCst) == 3);

        drop(listener);
        line.lock().pending = 5;
        thread::sleep(Duration::from_millis(50));

        assert_eq!(line.lock().pending, 5);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dropping_right_after_spawn_stops_the_thread() {
        let line = Arc::new(FairMutex::new(FakeLine::default()));
        let count = Arc::new(AtomicUsize::new(0));

        let listener = EdgeListener::spawn(7, line.clone(), poll_fake, counting(&count)).unwrap();
        drop(listener);

        wait_until(|| Arc::strong_count(&line) == 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_can_be_dropped_from_its_own_dispatch() {
        let line = Arc::new(FairMutex::new(FakeLine::default()));
        let slot: Arc<Mutex<Option<EdgeListener<FakeLine>>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let dispatch: EdgeDispatch = {
            let slot = slot.clone();
            let count = count.clone();
            Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                drop(slot.lock().take());
            })
        };
        *slot.lock() = Some(EdgeListener::spawn(7, line.clone(), poll_fake, dispatch).unwrap());

        line.lock().pending = 2;
        wait_until(|| Arc::strong_count(&line) == 1);

        assert!(slot.lock().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
