//! Process-wide engine instance.
//!
//! Hooks resolve the engine through [`engine`], which never blocks: before
//! installation, and while installation is still in progress (possibly on
//! this very thread, if the host allocator calls back into a hook while the
//! engine is being built), it returns `None` and the hook passes through.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use memsan_engine::{EngineConfig, Sanitizer};
use memsan_engine::config::ConfigError;

// Engine lifecycle states.
const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

// Manual init guard instead of OnceLock: OnceLock::get_or_init waits on a
// futex when it sees init in progress, which deadlocks a reentrant call from
// the initializing thread.
static ENGINE_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static ENGINE_PTR: AtomicPtr<Sanitizer> = AtomicPtr::new(std::ptr::null_mut());

/// Why [`install`] did not install an engine.
#[derive(Debug)]
pub enum InstallError {
    /// An engine is already installed or being installed.
    AlreadyInstalled,
    Config(ConfigError),
}

/// The installed engine, if any.
pub fn engine() -> Option<&'static Sanitizer> {
    if ENGINE_STATE.load(Ordering::Acquire) != STATE_READY {
        return None;
    }
    let ptr = ENGINE_PTR.load(Ordering::Acquire);
    // SAFETY: once READY, ENGINE_PTR points at a leaked Box that is never
    // freed or replaced.
    Some(unsafe { &*ptr })
}

/// Build and publish the engine. Only the first call wins.
pub fn install(config: EngineConfig) -> Result<&'static Sanitizer, InstallError> {
    if ENGINE_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return Err(InstallError::AlreadyInstalled);
    }

    let sanitizer = match Sanitizer::new(config) {
        Ok(s) => s,
        Err(e) => {
            ENGINE_STATE.store(STATE_UNINIT, Ordering::Release);
            return Err(InstallError::Config(e));
        }
    };
    let ptr = Box::into_raw(Box::new(sanitizer));
    ENGINE_PTR.store(ptr, Ordering::Release);
    ENGINE_STATE.store(STATE_READY, Ordering::Release);
    // SAFETY: just published; leaked for the lifetime of the process.
    Ok(unsafe { &*ptr })
}
