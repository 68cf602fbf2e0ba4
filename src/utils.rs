// Small shared helpers

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex lock, recovering from poisoning by returning the guard.
/// A poisoned lock means a holder panicked; the registries guarded here are
/// simple maps, so continuing with the inner value is preferable to
/// propagating the panic into every control-plane call.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}
