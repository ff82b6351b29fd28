//! The loader facade: action admission, settings, cancellation and teardown
//!
//! [PropLoader] owns the serial port handle and the shared state that the
//! per-action worker threads run against. At most one action is in flight at
//! a time; a second action is rejected with [Error::Busy] rather than queued.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use serialport::SerialPort;
use strum::{Display, FromRepr};

use crate::encoder::MAX_BAUDRATE;
use crate::error::Error;
use crate::interface::{Interface, PortAccess, PortArbiter};
use crate::monitor::StatusMonitor;
use crate::protocol::{
    self, ENCODED_LOAD_RAM, ENCODED_PROGRAM_EEPROM_THEN_RUN, ENCODED_PROGRAM_EEPROM_THEN_SHUTDOWN,
    ENCODED_SHUTDOWN, MAX_ENCODED_IMAGE_SIZE,
};

mod profiler;
mod worker;

pub use profiler::ActionSummary;

use profiler::Profiler;
use worker::Worker;

/// A user supplied Propeller reset.
///
/// Useful where the Propeller's reset pin is wired to something other than
/// the serial port's DTR or RTS lines — a GPIO pin on a single board
/// computer, say. The callback must drop the reset line, hold it low for the
/// given duration, then raise it and return. It is invoked on the worker
/// thread; returning an error (or panicking) aborts the action.
pub type ResetCallback =
    Arc<dyn Fn(Duration) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// The control line used to trigger a Propeller reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ResetLine {
    #[default]
    #[strum(serialize = "DTR")]
    Dtr,
    #[strum(serialize = "RTS")]
    Rts,
    /// Defer the reset to a user supplied [ResetCallback].
    #[strum(serialize = "callback")]
    Callback,
}

/// The actions the loader can perform.
///
/// All but [Restart][Action::Restart] interact with the Propeller's booter
/// program; a restart just toggles the reset line and lets the chip boot
/// from its EEPROM on its own.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum Action {
    #[default]
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "shutdown")]
    Shutdown,
    #[strum(serialize = "load RAM")]
    LoadRam,
    #[strum(serialize = "program EEPROM then shutdown")]
    ProgramEepromThenShutdown,
    #[strum(serialize = "program EEPROM then run")]
    ProgramEepromThenRun,
    #[strum(serialize = "restart")]
    Restart,
}

impl Action {
    /// Whether the action sends an image to the target.
    pub fn requires_image(self) -> bool {
        matches!(
            self,
            Action::LoadRam | Action::ProgramEepromThenShutdown | Action::ProgramEepromThenRun
        )
    }

    /// The command number the booter associates with the action, if any.
    pub fn command_number(self) -> Option<u32> {
        match self {
            Action::Shutdown => Some(0),
            Action::LoadRam => Some(1),
            Action::ProgramEepromThenShutdown => Some(2),
            Action::ProgramEepromThenRun => Some(3),
            Action::None | Action::Restart => None,
        }
    }

    /// The pre-encoded command word for the action, if any.
    pub(crate) fn encoded_command(self) -> Option<&'static [u8; 11]> {
        match self {
            Action::Shutdown => Some(&ENCODED_SHUTDOWN),
            Action::LoadRam => Some(&ENCODED_LOAD_RAM),
            Action::ProgramEepromThenShutdown => Some(&ENCODED_PROGRAM_EEPROM_THEN_SHUTDOWN),
            Action::ProgramEepromThenRun => Some(&ENCODED_PROGRAM_EEPROM_THEN_RUN),
            Action::None | Action::Restart => None,
        }
    }
}

/// The phase an in-flight action has reached, as reported to
/// [StatusMonitor::loader_update].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Status {
    #[strum(serialize = "resetting")]
    Resetting,
    #[strum(serialize = "establishing communications")]
    EstablishingCommunications,
    #[strum(serialize = "sending command and image")]
    SendingCommandAndImage,
    #[strum(serialize = "waiting for checksum status")]
    WaitingForChecksumStatus,
    #[strum(serialize = "waiting for EEPROM programming status")]
    WaitingForEepromProgrammingStatus,
    #[strum(serialize = "waiting for EEPROM verification status")]
    WaitingForEepromVerificationStatus,
}

/// The settings snapshot an action runs with.
///
/// Settings may change at any time, so their values are locked in when the
/// action is admitted; setter calls during an action only affect the next
/// one.
pub(crate) struct ActionSettings {
    pub baudrate: u32,
    pub reset_line: ResetLine,
    pub reset_callback: Option<ResetCallback>,
    pub reset_duration: Duration,
    pub boot_wait_duration: Duration,
    pub monitor: Option<Arc<dyn StatusMonitor>>,
}

pub(crate) struct LoaderState {
    /// Uniquely identifies each admitted action.
    ///
    /// Waiters key on this: if an action is cancelled, another thread may
    /// start a new action before a waiter is rescheduled, so "not busy" alone
    /// cannot tell a waiter that *its* action finished.
    pub counter: u32,
}

/// State shared between the facade and the worker threads.
pub(crate) struct LoaderInner {
    // Settings backing stores. The scalar ones are atomics so getters never
    // contend with an action being admitted.
    baudrate: AtomicU32,
    reset_line: AtomicU8,
    reset_duration_ms: AtomicU64,
    boot_wait_duration_ms: AtomicU64,
    reset_callback: Mutex<Option<ResetCallback>>,
    status_monitor: Mutex<Option<Arc<dyn StatusMonitor>>>,

    /// The primary mutex coordinating actions; guards `counter` and all
    /// writes to `action` and `cancelled`.
    state: Mutex<LoaderState>,
    /// Signalled when an action finishes. The predicate is "not busy, or the
    /// counter moved past the action being waited on".
    finished: Condvar,
    /// The action in progress; [Action::None] when idle. Written under the
    /// state mutex, readable without it.
    action: AtomicU8,
    /// Set to request cooperative cancellation; meaningful only while busy.
    cancelled: AtomicBool,
    /// The most recent checkpoint description. Best effort — readers may see
    /// a value one checkpoint stale.
    last_checkpoint: Mutex<&'static str>,
    /// Serializes monitor callbacks across actions: the next action's begin
    /// callback cannot run until the previous action's finish callback has
    /// returned, even though each runs on its own worker thread.
    callback_order: Mutex<()>,

    pub(crate) port: Mutex<PortAccess>,
}

/// Locks a mutex, disregarding poisoning.
///
/// The only code that can panic while holding one of the loader's locks is a
/// status monitor callback, which the [StatusMonitor] contract forbids from
/// panicking; the guarded state is consistent regardless.
pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoaderInner {
    pub(crate) fn action(&self) -> Action {
        Action::from_repr(self.action.load(Ordering::SeqCst)).unwrap_or(Action::None)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.action() != Action::None
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_checkpoint(&self, description: &'static str) {
        *lock_ignore_poison(&self.last_checkpoint) = description;
    }

    /// Describes what the loader is currently doing.
    ///
    /// The action and checkpoint are read without the state mutex, so the
    /// pair is only guaranteed consistent when read from the worker itself.
    pub(crate) fn current_activity(&self) -> String {
        let action = self.action();
        if action == Action::None {
            "Loader is idle.".into()
        } else {
            let checkpoint = *lock_ignore_poison(&self.last_checkpoint);
            format!("Action: {action}. Last checkpoint: {checkpoint}.")
        }
    }

    /// Officially finishes the action: clears it and wakes any waiters.
    pub(crate) fn finish_action(&self) {
        let state = lock_ignore_poison(&self.state);
        self.set_checkpoint("finished");
        self.action.store(Action::None as u8, Ordering::SeqCst);
        drop(state);

        self.finished.notify_all();
    }

    pub(crate) fn callback_order(&self) -> &Mutex<()> {
        &self.callback_order
    }
}

/// Programs and controls a Parallax Propeller P8X32A over a serial link.
///
/// Every action — [restart], [shutdown], [load_ram], [program_eeprom] — runs
/// on its own worker thread and reports through the configured
/// [StatusMonitor]. The facade methods only admit or reject the action;
/// rejection (busy, invalid image, invalid setting) is synchronous and makes
/// no monitor callbacks.
///
/// Dropping the loader cancels any in-flight action, waits for its worker to
/// finish, and relinquishes the port claim.
///
/// [restart]: PropLoader::restart
/// [shutdown]: PropLoader::shutdown
/// [load_ram]: PropLoader::load_ram
/// [program_eeprom]: PropLoader::program_eeprom
pub struct PropLoader {
    inner: Arc<LoaderInner>,
}

impl PropLoader {
    /// Creates a loader bound to the serial device with the given name.
    ///
    /// The device is opened lazily, at the start of the first action.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self::from_access(PortAccess::named(device_name.into()))
    }

    /// Creates a loader that drives an already-open serial port.
    pub fn with_port(port: Box<dyn SerialPort>) -> Self {
        Self::from_access(PortAccess::open(Interface::new(port)))
    }

    fn from_access(port: PortAccess) -> Self {
        PropLoader {
            inner: Arc::new(LoaderInner {
                baudrate: AtomicU32::new(MAX_BAUDRATE),
                reset_line: AtomicU8::new(ResetLine::Dtr as u8),
                reset_duration_ms: AtomicU64::new(10),
                boot_wait_duration_ms: AtomicU64::new(100),
                reset_callback: Mutex::new(None),
                status_monitor: Mutex::new(None),
                state: Mutex::new(LoaderState { counter: 0 }),
                finished: Condvar::new(),
                action: AtomicU8::new(Action::None as u8),
                cancelled: AtomicBool::new(false),
                last_checkpoint: Mutex::new("no action performed yet"),
                callback_order: Mutex::new(()),
                port: Mutex::new(port),
            }),
        }
    }

    /// Installs the arbiter through which the loader claims and relinquishes
    /// the shared port. Without one the loader assumes sole ownership.
    pub fn set_port_arbiter(&mut self, arbiter: Box<dyn PortArbiter>) {
        lock_ignore_poison(&self.inner.port).arbiter = Some(arbiter);
    }

    // Actions

    /// Restarts the Propeller.
    ///
    /// This just toggles the reset line and finishes; the Propeller then
    /// works through its normal boot process and runs whatever is in its
    /// EEPROM.
    pub fn restart(&self) -> Result<(), Error> {
        self.start_action(Action::Restart, &[])
    }

    /// Resets the Propeller and commands it into shutdown mode.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.start_action(Action::Shutdown, &[])
    }

    /// Loads the image into the Propeller's hub RAM and runs it.
    ///
    /// The image data is encoded and copied before this returns.
    pub fn load_ram(&self, image: &[u8]) -> Result<(), Error> {
        self.start_action(Action::LoadRam, image)
    }

    /// Programs the image into the external EEPROM.
    ///
    /// `run_afterwards` selects whether the Propeller runs the image or
    /// shuts down once programming and verification complete. The image data
    /// is encoded and copied before this returns.
    pub fn program_eeprom(&self, image: &[u8], run_afterwards: bool) -> Result<(), Error> {
        if run_afterwards {
            self.start_action(Action::ProgramEepromThenRun, image)
        } else {
            self.start_action(Action::ProgramEepromThenShutdown, image)
        }
    }

    // Action control

    /// Whether an action is in progress.
    pub fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }

    /// Requests cancellation of the in-flight action and returns immediately.
    ///
    /// Cancellation is cooperative: it takes effect at the worker's next
    /// checkpoint, and the action finishes with [ErrorKind::Cancelled]
    /// shortly after. Does nothing when the loader is idle. Safe to call
    /// from a monitor callback.
    ///
    /// [ErrorKind::Cancelled]: crate::ErrorKind::Cancelled
    pub fn cancel(&self) {
        let _state = lock_ignore_poison(&self.inner.state);
        // Setting the flag while idle is meaningless but harmless; the next
        // admission clears it.
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Cancels the in-flight action and waits for the cancellation to take
    /// effect, or until `timeout` passes.
    ///
    /// A zero timeout waits indefinitely. Returns immediately when idle.
    /// Must not be called from a monitor callback.
    pub fn cancel_and_wait(&self, timeout: Duration) -> Result<(), Error> {
        // Cancelling and starting to wait happen under one continuous lock so
        // the action being waited on is the action just cancelled.
        let state = lock_ignore_poison(&self.inner.state);
        if !self.inner.is_busy() {
            return Ok(());
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.wait_until_finished_locked(state, timeout)
    }

    /// Waits for the in-flight action to finish, or until `timeout` passes.
    ///
    /// A zero timeout waits indefinitely. Returns immediately when idle.
    /// Must not be called from a monitor callback.
    pub fn wait_until_finished(&self, timeout: Duration) -> Result<(), Error> {
        let state = lock_ignore_poison(&self.inner.state);
        if !self.inner.is_busy() {
            return Ok(());
        }
        self.wait_until_finished_locked(state, timeout)
    }

    fn wait_until_finished_locked(
        &self,
        mut state: MutexGuard<'_, LoaderState>,
        timeout: Duration,
    ) -> Result<(), Error> {
        let original_counter = state.counter;
        // The wait is over when the action being waited on has finished:
        // either the loader went idle, or another action has already been
        // admitted after it (the counter moved).
        let wait_over =
            |state: &LoaderState| !self.inner.is_busy() || state.counter != original_counter;

        if timeout.is_zero() {
            while !wait_over(&state) {
                state = self
                    .inner
                    .finished
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Ok(())
        } else {
            let deadline = Instant::now() + timeout;
            loop {
                if wait_over(&state) {
                    return Ok(());
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::WaitTimeout);
                }
                (state, _) = self
                    .inner
                    .finished
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// Describes what the loader is currently doing, for diagnostics.
    pub fn current_activity(&self) -> String {
        self.inner.current_activity()
    }

    // Settings

    pub fn baudrate(&self) -> u32 {
        self.inner.baudrate.load(Ordering::SeqCst)
    }

    /// Sets the baudrate, default and maximum 115200 bps.
    ///
    /// The booter communicates using the 3-Bit-Protocol, so actual
    /// throughput is lower than the rate suggests.
    pub fn set_baudrate(&self, baudrate: u32) -> Result<(), Error> {
        if baudrate > MAX_BAUDRATE {
            return Err(Error::BaudrateTooHigh(baudrate));
        }
        self.inner.baudrate.store(baudrate, Ordering::SeqCst);
        Ok(())
    }

    pub fn reset_line(&self) -> ResetLine {
        ResetLine::from_repr(self.inner.reset_line.load(Ordering::SeqCst))
            .unwrap_or(ResetLine::Dtr)
    }

    /// Sets the control line used to reset the Propeller, default DTR.
    pub fn set_reset_line(&self, reset_line: ResetLine) {
        self.inner
            .reset_line
            .store(reset_line as u8, Ordering::SeqCst);
    }

    pub fn reset_callback(&self) -> Option<ResetCallback> {
        lock_ignore_poison(&self.inner.reset_callback).clone()
    }

    /// Sets the function used to reset the Propeller when
    /// [ResetLine::Callback] is selected.
    pub fn set_reset_callback(&self, reset_callback: Option<ResetCallback>) {
        *lock_ignore_poison(&self.inner.reset_callback) = reset_callback;
    }

    pub fn reset_duration(&self) -> Duration {
        Duration::from_millis(self.inner.reset_duration_ms.load(Ordering::SeqCst))
    }

    /// Sets how long the reset line is held low, default 10 ms, range
    /// 1 to 100 ms.
    pub fn set_reset_duration(&self, reset_duration: Duration) -> Result<(), Error> {
        let ms = reset_duration.as_millis() as u64;
        if !(1..=100).contains(&ms) {
            return Err(Error::InvalidResetDuration(ms));
        }
        self.inner.reset_duration_ms.store(ms, Ordering::SeqCst);
        Ok(())
    }

    pub fn boot_wait_duration(&self) -> Duration {
        Duration::from_millis(self.inner.boot_wait_duration_ms.load(Ordering::SeqCst))
    }

    /// Sets how long the loader waits after raising the reset line for the
    /// Propeller to start its booter, default 100 ms, range 50 to 150 ms.
    pub fn set_boot_wait_duration(&self, boot_wait_duration: Duration) -> Result<(), Error> {
        let ms = boot_wait_duration.as_millis() as u64;
        if !(50..=150).contains(&ms) {
            return Err(Error::InvalidBootWaitDuration(ms));
        }
        self.inner.boot_wait_duration_ms.store(ms, Ordering::SeqCst);
        Ok(())
    }

    pub fn status_monitor(&self) -> Option<Arc<dyn StatusMonitor>> {
        lock_ignore_poison(&self.inner.status_monitor).clone()
    }

    /// Sets the observer that follows the loader's actions, default none.
    pub fn set_status_monitor(&self, monitor: Option<Arc<dyn StatusMonitor>>) {
        *lock_ignore_poison(&self.inner.status_monitor) = monitor;
    }

    // Port-ownership hook

    /// Called by a port arbitration layer before taking the port away from
    /// this loader. The transition is refused while an action is in flight.
    pub fn will_make_inactive(&self) -> Result<(), Error> {
        let _state = lock_ignore_poison(&self.inner.state);
        if self.inner.is_busy() {
            return Err(Error::Busy(self.inner.current_activity()));
        }
        // Nothing to hold over the transition: a later action touches the
        // port only after re-claiming it in stage 1.
        Ok(())
    }

    // Admission

    fn start_action(&self, action: Action, image: &[u8]) -> Result<(), Error> {
        let mut state = lock_ignore_poison(&self.inner.state);

        if self.inner.is_busy() {
            return Err(Error::Busy(self.inner.current_activity()));
        }

        // Lock in the settings.
        let settings = ActionSettings {
            baudrate: self.inner.baudrate.load(Ordering::SeqCst),
            reset_line: self.reset_line(),
            reset_callback: lock_ignore_poison(&self.inner.reset_callback).clone(),
            reset_duration: self.reset_duration(),
            boot_wait_duration: self.boot_wait_duration(),
            monitor: lock_ignore_poison(&self.inner.status_monitor).clone(),
        };

        state.counter = state.counter.wrapping_add(1);

        let mut profiler = Profiler::new(
            action,
            settings.baudrate,
            settings.reset_duration,
            settings.boot_wait_duration,
        );

        let mut encoded_image = Vec::new();
        let mut image_size_in_longs = 0;
        if action.requires_image() {
            profiler.will_start_encoding_image(image.len());
            encoded_image.reserve(MAX_ENCODED_IMAGE_SIZE);
            image_size_in_longs = protocol::verify_and_encode_image(image, &mut encoded_image)?;
            profiler.finished_encoding_image(encoded_image.len());
        }

        // The action will proceed — no failures from this point on. Marking
        // the loader busy before the thread starts means will_make_inactive
        // refuses port handover for the whole life of the action.
        self.inner.cancelled.store(false, Ordering::SeqCst);
        self.inner.set_checkpoint("launching thread");
        self.inner.action.store(action as u8, Ordering::SeqCst);

        debug!("starting '{action}' action");

        let worker = Worker::new(
            Arc::clone(&self.inner),
            action,
            settings,
            encoded_image,
            image_size_in_longs,
        );
        thread::spawn(move || worker.run(profiler));

        Ok(())
    }
}

impl Drop for PropLoader {
    fn drop(&mut self) {
        // Waits indefinitely; the worker always reaches finish_action.
        let _ = self.cancel_and_wait(Duration::ZERO);
        if let Some(arbiter) = lock_ignore_poison(&self.inner.port).arbiter.as_mut() {
            arbiter.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_map_to_booter_command_numbers() {
        assert_eq!(Action::Shutdown.command_number(), Some(0));
        assert_eq!(Action::LoadRam.command_number(), Some(1));
        assert_eq!(Action::ProgramEepromThenShutdown.command_number(), Some(2));
        assert_eq!(Action::ProgramEepromThenRun.command_number(), Some(3));
        assert_eq!(Action::Restart.command_number(), None);
        assert_eq!(Action::None.command_number(), None);
    }

    #[test]
    fn image_requirements_follow_the_action() {
        assert!(Action::LoadRam.requires_image());
        assert!(Action::ProgramEepromThenShutdown.requires_image());
        assert!(Action::ProgramEepromThenRun.requires_image());
        assert!(!Action::Shutdown.requires_image());
        assert!(!Action::Restart.requires_image());
    }

    #[test]
    fn setting_ranges_are_validated() {
        let loader = PropLoader::new("test-device");

        assert!(loader.set_baudrate(115_200).is_ok());
        assert!(matches!(
            loader.set_baudrate(230_400),
            Err(Error::BaudrateTooHigh(230_400))
        ));

        assert!(loader.set_reset_duration(Duration::from_millis(1)).is_ok());
        assert!(loader
            .set_reset_duration(Duration::from_millis(100))
            .is_ok());
        assert!(loader.set_reset_duration(Duration::ZERO).is_err());
        assert!(loader
            .set_reset_duration(Duration::from_millis(101))
            .is_err());

        assert!(loader
            .set_boot_wait_duration(Duration::from_millis(50))
            .is_ok());
        assert!(loader
            .set_boot_wait_duration(Duration::from_millis(49))
            .is_err());
        assert!(loader
            .set_boot_wait_duration(Duration::from_millis(151))
            .is_err());
    }

    #[test]
    fn defaults_match_the_booter_expectations() {
        let loader = PropLoader::new("test-device");
        assert_eq!(loader.baudrate(), 115_200);
        assert_eq!(loader.reset_line(), ResetLine::Dtr);
        assert_eq!(loader.reset_duration(), Duration::from_millis(10));
        assert_eq!(loader.boot_wait_duration(), Duration::from_millis(100));
        assert!(loader.status_monitor().is_none());
        assert!(loader.reset_callback().is_none());
        assert!(!loader.is_busy());
        assert_eq!(loader.current_activity(), "Loader is idle.");
    }

    #[test]
    fn waiting_while_idle_returns_immediately() {
        let loader = PropLoader::new("test-device");
        loader.wait_until_finished(Duration::ZERO).unwrap();
        loader.cancel_and_wait(Duration::ZERO).unwrap();
        loader.cancel(); // harmless when idle
        assert!(loader.will_make_inactive().is_ok());
    }
}
