//! Debug-build hooks for driving the bind pipeline through failure paths
//! in tests.  Compiled away entirely in release builds.

use crate::config::StoreId;
use crate::error::{BindPhase, TraceResult, TraceStoreError};

#[cfg(debug_assertions)]
use parking_lot::Mutex;

/// Consulted at the start of each bind phase.  Returning an error makes
/// the phase fail as if the underlying work had.
pub type BindPhaseHook =
    Box<dyn Fn(StoreId, BindPhase) -> Option<TraceStoreError> + Send + Sync + 'static>;

#[cfg(debug_assertions)]
static BIND_PHASE_HOOK: Mutex<Option<BindPhaseHook>> = Mutex::new(None);

#[cfg(debug_assertions)]
pub(crate) fn bind_phase_override(store: StoreId, phase: BindPhase) -> TraceResult<()> {
    if let Some(hook) = &*BIND_PHASE_HOOK.lock() {
        if let Some(err) = hook(store, phase) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(debug_assertions))]
#[inline]
pub(crate) fn bind_phase_override(_store: StoreId, _phase: BindPhase) -> TraceResult<()> {
    Ok(())
}

/// Clears the installed hook when dropped.
#[cfg(debug_assertions)]
pub struct BindPhaseHookGuard {
    _private: (),
}

#[cfg(debug_assertions)]
impl Drop for BindPhaseHookGuard {
    fn drop(&mut self) {
        *BIND_PHASE_HOOK.lock() = None;
    }
}

/// Installs a process-wide bind phase hook, replacing any previous one.
/// Tests installing hooks must not run concurrently with each other.
#[cfg(debug_assertions)]
pub fn set_bind_phase_hook(hook: BindPhaseHook) -> BindPhaseHookGuard {
    *BIND_PHASE_HOOK.lock() = Some(hook);
    BindPhaseHookGuard { _private: () }
}
