use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::AppError;

/// Longest channel label kept on an entry, in bytes.
pub const CHANNEL_LABEL_MAX: usize = 31;

const NEVER_INVOKED: u64 = u64::MAX;

pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// A registered edge handler. Receives the channel label it was registered with.
pub type EdgeCallback = Arc<dyn Fn(&str) -> Result<(), HandlerError> + Send + Sync>;

pub struct HandlerEntry {
    channel_label: String,
    pin_id: u32,
    handler: EdgeCallback,
    last_invoked_at: AtomicU64,
    debounce_window_ms: u32,
}

impl HandlerEntry {
    fn new(channel_label: &str, pin_id: u32, handler: EdgeCallback, debounce_window_ms: u32) -> Self {
        Self {
            channel_label: bounded_label(channel_label),
            pin_id,
            handler,
            last_invoked_at: AtomicU64::new(NEVER_INVOKED),
            debounce_window_ms,
        }
    }

    pub fn channel_label(&self) -> &str {
        &self.channel_label
    }

    pub fn pin_id(&self) -> u32 {
        self.pin_id
    }

    pub fn handler(&self) -> &EdgeCallback {
        &self.handler
    }

    /// Last accepted firing in microseconds, `None` if never fired.
    pub fn last_invoked_at(&self) -> Option<u64> {
        match self.last_invoked_at.load(Ordering::Acquire) {
            NEVER_INVOKED => None,
            at => Some(at),
        }
    }

    pub(crate) fn mark_invoked(&self, now: u64) {
        self.last_invoked_at
            .store(now.min(NEVER_INVOKED - 1), Ordering::Release);
    }

    pub fn debounce_window_ms(&self) -> u32 {
        self.debounce_window_ms
    }
}

fn bounded_label(label: &str) -> String {
    if label.len() <= CHANNEL_LABEL_MAX {
        return label.to_string();
    }
    let mut end = CHANNEL_LABEL_MAX;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    label[..end].to_string()
}

struct PinEntries {
    generation: u64,
    entries: Vec<Arc<HandlerEntry>>,
}

/// Point-in-time copy of one pin's entries.
///
/// Entries stay alive for as long as the snapshot does, even if the registry
/// drops them in the meantime.
pub struct Snapshot {
    pin_id: u32,
    generation: u64,
    entries: Vec<Arc<HandlerEntry>>,
}

impl Snapshot {
    pub fn pin_id(&self) -> u32 {
        self.pin_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn entries(&self) -> &[Arc<HandlerEntry>] {
        &self.entries
    }
}

/// Registered handlers, grouped per pin in registration order.
///
/// Every per-pin sequence gets a fresh generation when it is created. Removal
/// drops the whole sequence, so a snapshot whose generation no longer
/// matches has been invalidated.
pub struct CallbackRegistry {
    pins: Mutex<FxHashMap<u32, PinEntries>>,
    next_generation: AtomicU64,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            pins: Mutex::new(FxHashMap::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Appends a handler for `pin_id`, sharing ownership of `handler`.
    pub fn register(
        &self,
        channel_label: &str,
        pin_id: u32,
        handler: EdgeCallback,
        debounce_window_ms: u32,
    ) -> Result<(), AppError> {
        let entry = Arc::new(HandlerEntry::new(
            channel_label,
            pin_id,
            handler,
            debounce_window_ms,
        ));

        let mut pins = self.pins.lock();
        let seq = pins.entry(pin_id).or_insert_with(|| PinEntries {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            entries: Vec::new(),
        });
        seq.entries
            .try_reserve(1)
            .map_err(|e| AppError::OutOfMemory(format!("handler entry for pin {pin_id}: {e}")))?;
        seq.entries.push(entry);

        debug!(
            "registered handler #{} for pin {pin_id} ({channel_label}), debounce {debounce_window_ms}ms",
            seq.entries.len()
        );
        Ok(())
    }

    /// Removes every entry for `pin_id`, returning how many were dropped.
    pub fn unregister_all(&self, pin_id: u32) -> usize {
        // entries are released after the lock, handler drops may re-enter
        let removed = self.pins.lock().remove(&pin_id);
        let count = removed.as_ref().map(|seq| seq.entries.len()).unwrap_or(0);
        if count > 0 {
            debug!("unregistered {count} handler(s) for pin {pin_id}");
        }
        count
    }

    pub fn snapshot_for(&self, pin_id: u32) -> Option<Snapshot> {
        let pins = self.pins.lock();
        pins.get(&pin_id).map(|seq| Snapshot {
            pin_id,
            generation: seq.generation,
            entries: seq.entries.clone(),
        })
    }

    /// Whether the sequence a snapshot was taken from is still in place.
    pub fn is_current(&self, snapshot: &Snapshot) -> bool {
        self.pins
            .lock()
            .get(&snapshot.pin_id)
            .is_some_and(|seq| seq.generation == snapshot.generation)
    }

    pub fn handler_count(&self, pin_id: u32) -> usize {
        self.pins
            .lock()
            .get(&pin_id)
            .map(|seq| seq.entries.len())
            .unwrap_or(0)
    }

    pub fn pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.pins.lock().keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    /// Drops every entry and returns the pins that had any.
    pub fn clear(&self) -> Vec<u32> {
        let drained = std::mem::take(&mut *self.pins.lock());
        let mut pins: Vec<u32> = drained.keys().copied().collect();
        pins.sort_unstable();
        drop(drained);
        pins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EdgeCallback {
        Arc::new(|_: &str| -> Result<(), HandlerError> { Ok(()) })
    }

    #[test]
    fn long_labels_are_truncated_on_char_boundary() {
        let label = "é".repeat(20);
        let bounded = bounded_label(&label);
        assert!(bounded.len() <= CHANNEL_LABEL_MAX);
        assert_eq!(bounded.len(), 30);
        assert_eq!(bounded_label("P8_7"), "P8_7");
    }

    #[test]
    fn registration_shares_handler_ownership() {
        let registry = CallbackRegistry::new();
        let handler = noop();
        registry.register("P8_7", 7, handler.clone(), 0).unwrap();
        registry.register("P8_7", 7, handler.clone(), 0).unwrap();
        assert_eq!(Arc::strong_count(&handler), 3);

        assert_eq!(registry.unregister_all(7), 2);
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn removal_invalidates_snapshots_and_reregistration_does_not_revive_them() {
        let registry = CallbackRegistry::new();
        registry.register("P8_7", 7, noop(), 0).unwrap();
        let snapshot = registry.snapshot_for(7).unwrap();
        assert!(registry.is_current(&snapshot));

        registry.register("P8_7", 7, noop(), 0).unwrap();
        assert!(registry.is_current(&snapshot));

        registry.unregister_all(7);
        assert!(!registry.is_current(&snapshot));

        registry.register("P8_7", 7, noop(), 0).unwrap();
        assert!(!registry.is_current(&snapshot));
        assert_eq!(snapshot.entries().len(), 2);
    }

    #[test]
    fn clear_returns_every_registered_pin() {
        let registry = CallbackRegistry::new();
        registry.register("b", 9, noop(), 0).unwrap();
        registry.register("a", 3, noop(), 0).unwrap();
        assert_eq!(registry.clear(), vec![3, 9]);
        assert!(registry.pins().is_empty());
        assert!(registry.clear().is_empty());
    }
}
