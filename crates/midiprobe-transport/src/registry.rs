//! Process-wide record of open native connections.
//!
//! Every handle registers a closer when it opens and removes it when it
//! closes. Whatever is still registered when the process goes down through a
//! panic can be swept by [`install_panic_hook`]; a hard abort leaves cleanup
//! to the operating system, which releases the process's MIDI client.

use std::collections::HashMap;
use std::panic;
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Identifier assigned to every opened endpoint handle.
pub type HandleId = u64;

type Closer = Box<dyn FnOnce() + Send>;

struct Entry {
    label: String,
    closer: Closer,
}

struct Registry {
    next_id: HandleId,
    live: HashMap<HandleId, Entry>,
}

impl Registry {
    fn new() -> Self {
        Self {
            next_id: 1,
            live: HashMap::new(),
        }
    }
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::new()));

static PANIC_HOOK: Once = Once::new();

/// Record a live connection; `closer` releases it if the owner never does.
pub(crate) fn register(label: impl Into<String>, closer: impl FnOnce() + Send + 'static) -> HandleId {
    let mut registry = REGISTRY.lock();
    let id = registry.next_id;
    registry.next_id += 1;
    let label = label.into();
    debug!(id, %label, "registered midi handle");
    registry.live.insert(
        id,
        Entry {
            label,
            closer: Box::new(closer),
        },
    );
    id
}

/// Forget a connection its owner has closed. Returns false if it was already swept.
pub(crate) fn unregister(id: HandleId) -> bool {
    REGISTRY.lock().live.remove(&id).is_some()
}

/// Number of connections currently registered.
pub fn live_handles() -> usize {
    REGISTRY.lock().live.len()
}

pub fn is_registered(id: HandleId) -> bool {
    REGISTRY.lock().live.contains_key(&id)
}

/// Close every registered connection and return how many were swept.
pub fn close_all() -> usize {
    let swept: Vec<(HandleId, Entry)> = REGISTRY.lock().live.drain().collect();
    let count = swept.len();
    for (id, entry) in swept {
        debug!(id, label = %entry.label, "sweeping midi handle");
        (entry.closer)();
    }
    count
}

/// Sweep all registered connections before the previously installed panic hook runs.
///
/// Covers builds with `panic = "abort"`, where handle destructors never run.
/// The hook is process-wide: a panic on any thread closes every registered
/// handle, even when the panic is later caught, and the owners then see
/// [`crate::TransportError::HandleClosed`] on their next call.
/// Installing more than once is a no-op.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let swept = close_all();
            if swept > 0 {
                warn!(swept, "closed midi handles after panic");
            }
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn unregister_prevents_sweep() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let id = register("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(is_registered(id));
        assert!(unregister(id));
        assert!(!unregister(id));
        assert!(!is_registered(id));
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }
}
