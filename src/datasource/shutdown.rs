//! Process-exit shutdown coordination
//!
//! Every [`DataStore`](super::DataStore) registers itself here at
//! construction so that a process exit closes its connection cleanly instead
//! of leaving in-flight writers to fail noisily during teardown. The hook
//! body sets the store's closing flag before touching the lock, so writers
//! already queued on the lock bail out as soon as they acquire it.
//!
//! The registry holds only weak references; it never extends a store's
//! lifetime, and explicit `close()` deregisters the store so the exit hook
//! cannot attempt a second close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once, OnceLock, PoisonError, Weak};

use super::StoreInner;

/// Handle identifying one registered store, used for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HookId(u64);

static REGISTRY: OnceLock<Mutex<Vec<(HookId, Weak<StoreInner>)>>> = OnceLock::new();
static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<Vec<(HookId, Weak<StoreInner>)>> {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a store for close-on-exit and install the process hook on first
/// use.
pub(crate) fn register(store: Weak<StoreInner>) -> HookId {
    install_exit_handler();
    let id = HookId(NEXT_HOOK_ID.fetch_add(1, Ordering::SeqCst));
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push((id, store));
    id
}

/// Remove a store from the registry. Safe to call for an id that was already
/// removed.
pub(crate) fn deregister(id: HookId) {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(hook_id, _)| *hook_id != id);
}

/// Close every still-registered store. Runs in the process-exit hook; must
/// never panic or propagate errors.
fn run_exit_hooks() {
    let stores: Vec<Weak<StoreInner>> = {
        let mut registry = registry().lock().unwrap_or_else(PoisonError::into_inner);
        registry.drain(..).map(|(_, store)| store).collect()
    };
    for store in stores {
        if let Some(store) = store.upgrade() {
            store.close_from_exit_hook();
        }
    }
}

#[cfg(unix)]
fn install_exit_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        extern "C" fn exit_handler() {
            run_exit_hooks();
        }
        // SAFETY: atexit only stores the handler pointer; the handler itself
        // touches nothing but 'static registry state.
        let rc = unsafe { libc::atexit(exit_handler) };
        if rc != 0 {
            tracing::warn!("failed to install process-exit hook (atexit returned {rc})");
        }
    });
}

#[cfg(not(unix))]
fn install_exit_handler() {
    // No portable exit hook on this target; explicit close() and Drop
    // still tear the store down.
}

#[cfg(test)]
fn is_registered(id: HookId) -> bool {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .any(|(hook_id, _)| *hook_id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_deregister_bookkeeping() {
        let first = register(Weak::new());
        let second = register(Weak::new());
        assert_ne!(first, second);
        assert!(is_registered(first));
        assert!(is_registered(second));

        deregister(first);
        assert!(!is_registered(first));
        assert!(is_registered(second));

        // deregistering twice is harmless
        deregister(first);
        assert!(is_registered(second));

        deregister(second);
        assert!(!is_registered(second));
    }
}
