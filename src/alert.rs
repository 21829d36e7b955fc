//! Interrupt-to-main-loop signalling.
//!
//! Interrupt handlers may not touch the I2C bus or the configuration
//! store, so they only flip flags here and the main loop does the work.
//! Two events cross that boundary: a host control request arriving, and
//! the shared alert line asserting.

use core::sync::atomic::{AtomicBool, Ordering};

/// Flags set from interrupt context and consumed by the main loop.
///
/// One `Signals` lives in a `static` shared between the USB and
/// alert-pin interrupt handlers and [`Device::poll`].
///
/// [`Device::poll`]: crate::dispatcher::Device::poll
pub struct Signals {
    command: AtomicBool,
    trip: AtomicBool,
    armed: AtomicBool,
}

impl Signals {
    /// No command pending, no trip recorded, alert detection armed.
    pub const fn new() -> Self {
        Signals {
            command: AtomicBool::new(false),
            trip: AtomicBool::new(false),
            armed: AtomicBool::new(true),
        }
    }

    /// Admit a newly arrived control request, from interrupt context.
    ///
    /// Returns `false` when a request is already being processed; the
    /// caller must then hold the new request off (stall it) rather than
    /// overwrite the one in flight.
    pub fn submit(&self) -> bool {
        self.command
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether an admitted request is waiting for the main loop.
    pub fn command_pending(&self) -> bool {
        self.command.load(Ordering::SeqCst)
    }

    /// Re-open admission once the current request has fully completed.
    pub fn finish_command(&self) {
        self.command.store(false, Ordering::SeqCst);
    }

    /// Record an alert-line assertion, from interrupt context.
    ///
    /// Detection is disarmed before the trip is published so a bouncing
    /// line cannot queue a second trip while the first is handled.
    pub fn trip(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.trip.store(true, Ordering::SeqCst);
    }

    /// Consume a recorded trip, if any.
    pub fn take_trip(&self) -> bool {
        self.trip.swap(false, Ordering::SeqCst)
    }

    /// Whether the alert interrupt should currently be acted on.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Re-arm alert detection after a trip has been fully handled.
    pub fn rearm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl Default for Signals {
    fn default() -> Self {
        Signals::new()
    }
}
