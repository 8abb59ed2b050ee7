//! Synchronization primitives for the VM core
//!
//! Locks are spin locks; per-processor hardware state (the TLB) is
//! additionally protected by disabling interrupts around each access
//! sequence.

pub use spin::Mutex;
pub use spin::MutexGuard;
pub use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Processor interrupt control
///
/// `disable` returns whether interrupts were enabled before the call so
/// that nested critical sections restore the outermost state.
pub trait InterruptControl: Send + Sync {
    /// Disable interrupts and return previous interrupt state
    fn disable(&self) -> bool;

    /// Restore interrupt state saved by `disable`
    fn restore(&self, was_enabled: bool);
}

/// Interrupt control for hosted builds, where there is nothing to mask.
///
/// Tracks the logical enable bit so nesting can still be observed.
#[derive(Debug)]
pub struct NoopInterrupts {
    enabled: AtomicBool,
}

impl NoopInterrupts {
    /// Creates a controller with interrupts enabled
    pub const fn new() -> Self {
        Self { enabled: AtomicBool::new(true) }
    }

    /// Current logical interrupt state
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Default for NoopInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for NoopInterrupts {
    fn disable(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    fn restore(&self, was_enabled: bool) {
        if was_enabled {
            self.enabled.store(true, Ordering::Release);
        }
    }
}

/// Interrupts stay disabled for the lifetime of the guard
pub struct IrqGuard<'a> {
    control: &'a dyn InterruptControl,
    was_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    /// Disable interrupts until the guard is dropped
    pub fn new(control: &'a dyn InterruptControl) -> Self {
        let was_enabled = control.disable();
        Self { control, was_enabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.control.restore(self.was_enabled);
    }
}
