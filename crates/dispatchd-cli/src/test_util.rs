//! Shared test helpers. Mutating `std::env` is process-global, so tests
//! that do it serialize on this lock rather than stomping on each other
//! when run concurrently.

use std::sync::{Mutex, MutexGuard};

static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
