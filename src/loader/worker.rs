//! The per-action worker: drives one action end-to-end on its own thread
//!
//! The worker owns the settings snapshot and the encoded image for its
//! action. It runs the stages in order — preparation, reset, boot wait,
//! establish communications, send command, send image, and up to three
//! status waits — aborting at the first failure. Every stage boundary and
//! every I/O loop checks the cancellation flag.

use std::any::Any;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};

use crate::error::{ActionError, ActionResult, ErrorKind};
use crate::interface::{Interface, PortAccess};
use crate::loader::profiler::Profiler;
use crate::loader::{lock_ignore_poison, Action, ActionSettings, LoaderInner, ResetLine, Status};
use crate::encoder::ThreeBitProtocolEncoder;
use crate::protocol::{
    decode_3bp_byte, INIT_BYTES, STATUS_FAIL, STATUS_OK, STATUS_PROMPT, TARGET_AUTH_BYTES,
};

/// How often blocking work checks for cancellation. Also the serial port's
/// read and write timeout, which is what paces the receive loops.
const CANCELLATION_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const SERIAL_TIMEOUT: Duration = CANCELLATION_CHECK_INTERVAL;

/// Margin past the init-bytes drain time for the target's authentication and
/// version bytes to arrive. The target sends them interleaved with the
/// transmission prompts, so they should be ready as soon as the init bytes
/// have left the wire.
const INIT_BYTES_TIMEOUT: Duration = Duration::from_millis(1000);

/// How far before the stage-4 drain time the image-send stage may end.
///
/// Write calls return once bytes are buffered, which for a large image can be
/// long before they are transmitted. Starting the checksum wait at that point
/// would queue a pile of status prompts behind the untransmitted image, so
/// the worker sleeps until the estimated drain time; this margin is insurance
/// against the drain time being over-estimated. Timeliness matters: after the
/// target finishes its checksum it waits only about 100 ms for a prompt
/// before giving up on serial loading.
const EARLY_STAGE4_RETURN: Duration = Duration::from_millis(100);

/// Interval between status transmission prompts.
///
/// The target must receive a prompt within about 100 ms of having a status
/// byte ready or it aborts the serial load, so this cannot be large; sleep
/// and write overhead is unpredictable enough that 10-20 ms is about right.
const STATUS_PROMPT_INTERVAL: Duration = Duration::from_millis(10);

/// Observed: 84 ms from the last image bit to the checksum status at 13 MHz,
/// implying roughly 140 ms at the slowest RCFAST clock, plus allowance for
/// the drain-time estimate being off by up to [EARLY_STAGE4_RETURN].
const CHECKSUM_STATUS_TIMEOUT: Duration = Duration::from_millis(1500);

/// Observed: 3.4 s from checksum status to programming status at 13 MHz,
/// implying roughly 5.6 s at 8 MHz.
const EEPROM_PROGRAMMING_STATUS_TIMEOUT: Duration = Duration::from_millis(6000);

/// Observed: 1.2 s from programming status to verification status at 13 MHz,
/// implying roughly 2.0 s at 8 MHz.
const EEPROM_VERIFICATION_STATUS_TIMEOUT: Duration = Duration::from_millis(2500);

/// If writes are not keeping pace with the baudrate by this margin the port
/// is considered unresponsive.
const RESPONSIVENESS_MULTIPLIER: f32 = 1.5;
const MIN_RESPONSIVENESS_TIMEOUT: Duration = Duration::from_millis(1000);

/// Runs one action to completion on its own thread.
pub(crate) struct Worker {
    inner: Arc<LoaderInner>,
    action: Action,
    settings: ActionSettings,
    encoded_image: Vec<u8>,
    image_size_in_longs: usize,
    /// The estimated instant the stage-4 bytes finish leaving the wire. Set
    /// when the command word is sent, advanced as the size word and image
    /// follow it.
    stage4_drain_time: Instant,
}

impl Worker {
    pub(crate) fn new(
        inner: Arc<LoaderInner>,
        action: Action,
        settings: ActionSettings,
        encoded_image: Vec<u8>,
        image_size_in_longs: usize,
    ) -> Self {
        Worker {
            inner,
            action,
            settings,
            encoded_image,
            image_size_in_longs,
            stage4_drain_time: Instant::now(),
        }
    }

    /// The worker thread entry point.
    ///
    /// Whatever happens — success, an action error, or a panic — exactly one
    /// finish callback is delivered and the loader is returned to idle.
    pub(crate) fn run(mut self, mut profiler: Profiler) {
        let begin = panic::catch_unwind(AssertUnwindSafe(|| self.action_will_begin(&profiler)));
        if begin.is_err() {
            warn!("status monitor panicked in loader_will_begin");
            self.action_will_finish(
                &mut profiler,
                ErrorKind::UnhandledException,
                "A status monitor callback panicked.".to_string(),
            );
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.perform_action(&mut profiler)));
        let (kind, details) = match outcome {
            Ok(Ok(())) => (ErrorKind::None, String::new()),
            Ok(Err(error)) => (error.kind, error.details),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("unhandled panic on the action thread: {message}");
                (
                    ErrorKind::UnhandledException,
                    format!("{} Error: {message}", self.inner.current_activity()),
                )
            }
        };
        self.action_will_finish(&mut profiler, kind, details);
    }

    /// Notifies the monitor that the action is beginning.
    ///
    /// The callback-order mutex blocks this thread until the previous
    /// action's finish callback has returned.
    fn action_will_begin(&self, profiler: &Profiler) {
        let _order = lock_ignore_poison(self.inner.callback_order());
        if let Some(monitor) = &self.settings.monitor {
            monitor.loader_will_begin(
                self.action,
                profiler.summary.total_time,
                profiler.estimated_total_time(),
            );
        }
    }

    /// Closes the profile, returns the loader to idle, and notifies the
    /// monitor.
    fn action_will_finish(&self, profiler: &mut Profiler, kind: ErrorKind, details: String) {
        if kind == ErrorKind::None {
            profiler.end_ok();
        } else {
            profiler.end_with_error(kind);
        }

        debug!(
            "'{}' action finished: {kind}",
            profiler.summary.action
        );

        // A new action may be admitted the moment finish_action runs, so
        // everything the callback needs is captured first. Holding the
        // callback-order mutex across finish_action and the callback keeps
        // that next action's begin callback from overtaking this one.
        let monitor = self.settings.monitor.clone();
        let summary = profiler.summary.clone();

        let _order = lock_ignore_poison(self.inner.callback_order());

        self.inner.finish_action();

        if let Some(monitor) = monitor {
            monitor.loader_has_finished(kind, &details, &summary);
        }
    }

    /// The main sequencing function: runs the stages the action calls for.
    fn perform_action(&mut self, profiler: &mut Profiler) -> ActionResult<()> {
        let inner = Arc::clone(&self.inner);
        let mut access = lock_ignore_poison(&inner.port);

        // Stage 1: preparation
        let interface = self.stage1_preparation(&mut access, profiler)?;

        // Stage 2: reset and boot wait
        self.call_monitor_update(profiler, Status::Resetting);
        self.stage2a_reset(interface, profiler)?;
        if self.action == Action::Restart {
            return Ok(());
        }
        self.stage2b_wait_after_reset(interface, profiler)?;

        // Stage 3: establish communications
        self.call_monitor_update(profiler, Status::EstablishingCommunications);
        self.stage3_establish_comms(interface, profiler)?;

        // Stage 4: send command and image
        self.call_monitor_update(profiler, Status::SendingCommandAndImage);
        self.stage4a_send_command(interface, profiler)?;
        if self.action == Action::Shutdown {
            return Ok(());
        }
        self.stage4b_send_image(interface, profiler)?;

        // Stage 5: wait for checksum status
        self.call_monitor_update(profiler, Status::WaitingForChecksumStatus);
        self.stage5_wait_for_checksum_status(interface, profiler)?;
        if self.action == Action::LoadRam {
            return Ok(());
        }

        // Stage 6: wait for EEPROM programming status
        self.call_monitor_update(profiler, Status::WaitingForEepromProgrammingStatus);
        self.stage6_wait_for_eeprom_programming_status(interface, profiler)?;

        // Stage 7: wait for EEPROM verification status
        self.call_monitor_update(profiler, Status::WaitingForEepromVerificationStatus);
        self.stage7_wait_for_eeprom_verification_status(interface, profiler)
    }

    fn stage1_preparation<'a>(
        &self,
        access: &'a mut PortAccess,
        profiler: &mut Profiler,
    ) -> ActionResult<&'a mut Interface> {
        self.checkpoint("obtaining serial port access")?;

        if let Some(arbiter) = access.arbiter.as_mut() {
            arbiter
                .make_active()
                .map_err(|e| ActionError::new(ErrorKind::FailedToObtainPortAccess, e.to_string()))?;
        }

        self.checkpoint("opening port")?;

        let interface = access
            .ensure_open(self.settings.baudrate, SERIAL_TIMEOUT)
            .map_err(|e| ActionError::new(ErrorKind::FailedToOpenPort, e.to_string()))?;

        self.checkpoint("flushing output buffer")?;

        interface
            .serial_port_mut()
            .flush()
            .map_err(|e| ActionError::new(ErrorKind::FailedToFlushOutput, e.to_string()))?;

        self.checkpoint("updating port settings")?;

        self.update_port_settings(interface)?;

        profiler.end_stage1();
        Ok(interface)
    }

    fn stage2a_reset(&self, interface: &mut Interface, profiler: &mut Profiler) -> ActionResult<()> {
        self.checkpoint("resetting the Propeller")?;

        self.do_reset(interface)?;

        profiler.end_stage2a();
        Ok(())
    }

    fn stage2b_wait_after_reset(
        &self,
        interface: &mut Interface,
        profiler: &mut Profiler,
    ) -> ActionResult<()> {
        self.checkpoint("waiting for Propeller to boot up")?;

        // The maximum boot wait is around 150 ms, not worth slicing into
        // cancellation-check intervals.
        thread::sleep(self.settings.boot_wait_duration);

        self.checkpoint("flushing input buffer")?;

        // Discard anything the reset shook loose on the rx line.
        interface
            .serial_port_mut()
            .clear(ClearBuffer::Input)
            .map_err(|e| ActionError::new(ErrorKind::FailedToFlushInput, e.to_string()))?;

        profiler.end_stage2b();
        Ok(())
    }

    fn stage3_establish_comms(
        &self,
        interface: &mut Interface,
        profiler: &mut Profiler,
    ) -> ActionResult<()> {
        self.checkpoint("sending initial bytes")?;

        // Calibration, host auth, and the 258 transmission prompts that clock
        // out the target's auth and version bits.
        let drain_time = self.send_bytes(interface, &INIT_BYTES, ErrorKind::FailedToSendInitialBytes)?;

        self.checkpoint("authenticating Propeller chip")?;

        // The auth and version bytes should be available as soon as the init
        // bytes have drained, plus some margin for the driver.
        let deadline = drain_time + INIT_BYTES_TIMEOUT;

        let auth = self.receive_bytes(
            interface,
            TARGET_AUTH_BYTES.len(),
            deadline,
            ErrorKind::FailedToReceiveTargetAuthentication,
        )?;
        if auth[..] != TARGET_AUTH_BYTES {
            return Err(ActionError::new(
                ErrorKind::FailedToAuthenticateTarget,
                "unexpected bytes received from the target",
            ));
        }

        self.checkpoint("verifying Propeller chip version")?;

        let raw_version =
            self.receive_bytes(interface, 4, deadline, ErrorKind::FailedToReceiveChipVersion)?;
        let version = decode_3bp_byte(&mut raw_version.iter().copied())
            .map_err(|e| ActionError::new(ErrorKind::FailedToDecodeChipVersion, e.to_string()))?;
        if version != 1 {
            return Err(ActionError::new(
                ErrorKind::UnsupportedChipVersion,
                format!("Unrecognized chip version: {version}."),
            ));
        }

        debug!("target authenticated, chip version {version}");

        profiler.end_stage3();
        Ok(())
    }

    fn stage4a_send_command(
        &mut self,
        interface: &mut Interface,
        profiler: &mut Profiler,
    ) -> ActionResult<()> {
        self.checkpoint("sending command")?;

        let Some(encoded_command) = self.action.encoded_command() else {
            // Sequencing keeps commandless actions away from this stage.
            return Err(ActionError::new(
                ErrorKind::FailedToSendCommand,
                format!("The action '{}' is invalid at this stage.", self.action),
            ));
        };

        // Sending for stage 4 starts here; the drain time is extended as the
        // size word and image follow.
        self.stage4_drain_time =
            self.send_bytes(interface, encoded_command, ErrorKind::FailedToSendCommand)?;

        profiler.end_stage4a();
        Ok(())
    }

    fn stage4b_send_image(
        &mut self,
        interface: &mut Interface,
        profiler: &mut Profiler,
    ) -> ActionResult<()> {
        self.checkpoint("sending image size")?;

        let mut size_word = Vec::new();
        ThreeBitProtocolEncoder::new(&mut size_word).encode_long(self.image_size_in_longs as u32);
        self.send_bytes(interface, &size_word, ErrorKind::FailedToSendImageSize)?;

        self.checkpoint("sending image")?;

        self.send_bytes(interface, &self.encoded_image, ErrorKind::FailedToSendImage)?;

        // The drain time was recorded when the command was sent; account for
        // everything sent since.
        let follow_on = self.transit_duration(size_word.len() + self.encoded_image.len());
        self.stage4_drain_time += follow_on;

        // Wait until most of the image is actually on the wire, else the
        // checksum stage would buffer an excessive run of status prompts.
        let resume_at = self
            .stage4_drain_time
            .checked_sub(EARLY_STAGE4_RETURN)
            .unwrap_or(self.stage4_drain_time);
        self.wait_until(resume_at)?;

        profiler.end_stage4b();
        Ok(())
    }

    fn stage5_wait_for_checksum_status(
        &self,
        interface: &mut Interface,
        profiler: &mut Profiler,
    ) -> ActionResult<()> {
        self.checkpoint("waiting for checksum status")?;

        let failed = self.receive_status(
            interface,
            CHECKSUM_STATUS_TIMEOUT,
            ErrorKind::FailedToReceiveChecksumStatus,
        )?;

        self.checkpoint("checking checksum status")?;

        if failed {
            return Err(ActionError::new(
                ErrorKind::TargetReportsChecksumError,
                "Data may have been corrupted in transmission.",
            ));
        }

        profiler.end_stage5();
        Ok(())
    }

    fn stage6_wait_for_eeprom_programming_status(
        &self,
        interface: &mut Interface,
        profiler: &mut Profiler,
    ) -> ActionResult<()> {
        self.checkpoint("waiting for EEPROM programming status")?;

        let failed = self.receive_status(
            interface,
            EEPROM_PROGRAMMING_STATUS_TIMEOUT,
            ErrorKind::FailedToReceiveEepromProgrammingStatus,
        )?;

        self.checkpoint("checking EEPROM programming status")?;

        if failed {
            return Err(ActionError::new(
                ErrorKind::TargetReportsEepromProgrammingError,
                "EEPROM may be absent or incorrectly connected.",
            ));
        }

        profiler.end_stage6();
        Ok(())
    }

    fn stage7_wait_for_eeprom_verification_status(
        &self,
        interface: &mut Interface,
        profiler: &mut Profiler,
    ) -> ActionResult<()> {
        self.checkpoint("waiting for EEPROM verification status")?;

        let failed = self.receive_status(
            interface,
            EEPROM_VERIFICATION_STATUS_TIMEOUT,
            ErrorKind::FailedToReceiveEepromVerificationStatus,
        )?;

        self.checkpoint("checking EEPROM verification status")?;

        if failed {
            return Err(ActionError::new(
                ErrorKind::TargetReportsEepromVerificationError,
                "EEPROM may be read-only or malfunctioning.",
            ));
        }

        self.checkpoint("finishing up")?;

        profiler.end_stage7();
        Ok(())
    }

    // Helpers. These abort the action by returning an ActionError carrying
    // the failure site's error kind.

    /// Sends all of `bytes`, or fails with `potential_error`.
    ///
    /// Returns the estimated drain time — when the last byte will have left
    /// the wire assuming transmission starts immediately and runs
    /// uninterrupted.
    fn send_bytes(
        &self,
        interface: &mut Interface,
        bytes: &[u8],
        potential_error: ErrorKind,
    ) -> ActionResult<Instant> {
        if bytes.is_empty() {
            return Err(ActionError::new(
                potential_error,
                "BUG: refusing to send an empty buffer",
            ));
        }

        let transit_duration = self.transit_duration(bytes.len());

        let now = Instant::now();
        let drain_time = now + transit_duration;
        let responsiveness_deadline = now + self.responsiveness_timeout(transit_duration);

        let mut num_sent = 0;
        loop {
            self.ensure_not_cancelled()?;

            match interface.serial_port_mut().write(&bytes[num_sent..]) {
                Ok(n) => num_sent += n,
                // A write timeout just means the OS buffer is full; keep
                // pushing until the responsiveness deadline says otherwise.
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    return Err(ActionError::new(
                        potential_error,
                        format!("Writing to the port failed. Error: {e}"),
                    ));
                }
            }

            if num_sent >= bytes.len() {
                break;
            }

            if Instant::now() > responsiveness_deadline {
                return Err(ActionError::new(potential_error, "The port was unresponsive."));
            }
        }

        Ok(drain_time)
    }

    /// Receives exactly `total_to_receive` bytes before `deadline`, or fails
    /// with `potential_error`.
    ///
    /// Each read is bounded by the port's own timeout, so cancellation and
    /// the deadline are checked at least that often. The deadline may be
    /// overshot by up to one port timeout, which is harmless here.
    fn receive_bytes(
        &self,
        interface: &mut Interface,
        total_to_receive: usize,
        deadline: Instant,
        potential_error: ErrorKind,
    ) -> ActionResult<Vec<u8>> {
        if total_to_receive == 0 {
            return Err(ActionError::new(
                potential_error,
                "BUG: refusing to receive zero bytes",
            ));
        }

        let mut buffer = vec![0u8; total_to_receive];
        let mut num_received = 0;

        loop {
            self.ensure_not_cancelled()?;

            match interface.serial_port_mut().read(&mut buffer[num_received..]) {
                Ok(n) => num_received += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    return Err(ActionError::new(
                        potential_error,
                        format!("Reading from the port failed. Error: {e}"),
                    ));
                }
            }

            if num_received >= total_to_receive {
                break;
            }

            if Instant::now() > deadline {
                return Err(ActionError::new(potential_error, "Timeout occurred."));
            }
        }

        Ok(buffer)
    }

    /// Prompts the target for a status byte until one arrives or `timeout`
    /// passes.
    ///
    /// Returns whether the target reported failure (the target's status code
    /// is 0 for success, 1 for failure). Any other reply byte, or the port
    /// claiming data it cannot deliver, aborts with `potential_error`.
    fn receive_status(
        &self,
        interface: &mut Interface,
        timeout: Duration,
        potential_error: ErrorKind,
    ) -> ActionResult<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_not_cancelled()?;

            interface
                .serial_port_mut()
                .write_all(&[STATUS_PROMPT])
                .map_err(|e| {
                    ActionError::new(
                        ErrorKind::FailedToSendStatusPrompt,
                        format!("Writing to the port failed. Error: {e}"),
                    )
                })?;

            thread::sleep(STATUS_PROMPT_INTERVAL);

            let num_available = interface.serial_port_mut().bytes_to_read().map_err(|e| {
                ActionError::new(
                    potential_error,
                    format!("Querying available bytes failed. Error: {e}"),
                )
            })?;

            if num_available > 0 {
                let mut byte = [0u8; 1];
                match interface.serial_port_mut().read(&mut byte) {
                    Ok(1) => match byte[0] {
                        STATUS_FAIL => return Ok(true),
                        STATUS_OK => return Ok(false),
                        other => {
                            return Err(ActionError::new(
                                potential_error,
                                format!("Received unexpected byte: {other:#04X}."),
                            ));
                        }
                    },
                    // The port said a byte was available and then failed to
                    // deliver it; by now the target may already have given up
                    // waiting for prompts, so don't loop.
                    Ok(_) => {
                        return Err(ActionError::new(
                            potential_error,
                            "Port reported bytes available but returned none.",
                        ));
                    }
                    Err(e) => {
                        return Err(ActionError::new(
                            potential_error,
                            format!("Reading from the port failed. Error: {e}"),
                        ));
                    }
                }
            }

            if Instant::now() > deadline {
                return Err(ActionError::new(potential_error, "Timeout occurred."));
            }
        }
    }

    fn call_monitor_update(&self, profiler: &Profiler, status: Status) {
        if let Some(monitor) = &self.settings.monitor {
            monitor.loader_update(
                status,
                profiler.summary.total_time,
                profiler.estimated_total_time(),
            );
        }
    }

    /// Applies the snapshot's port settings: baud, timeouts, 8N1, no flow
    /// control.
    fn update_port_settings(&self, interface: &mut Interface) -> ActionResult<()> {
        let port = interface.serial_port_mut();

        port.set_baud_rate(self.settings.baudrate)
            .map_err(|e| ActionError::new(ErrorKind::FailedToSetBaudrate, e.to_string()))?;
        port.set_timeout(SERIAL_TIMEOUT)
            .map_err(|e| ActionError::new(ErrorKind::FailedToSetTimeout, e.to_string()))?;
        port.set_data_bits(DataBits::Eight)
            .map_err(|e| ActionError::new(ErrorKind::FailedToSetBytesize, e.to_string()))?;
        port.set_parity(Parity::None)
            .map_err(|e| ActionError::new(ErrorKind::FailedToSetParity, e.to_string()))?;
        port.set_stop_bits(StopBits::One)
            .map_err(|e| ActionError::new(ErrorKind::FailedToSetStopbits, e.to_string()))?;
        port.set_flow_control(FlowControl::None)
            .map_err(|e| ActionError::new(ErrorKind::FailedToSetFlowcontrol, e.to_string()))?;

        Ok(())
    }

    /// Performs the reset over the snapshot's reset line.
    fn do_reset(&self, interface: &mut Interface) -> ActionResult<()> {
        let map_err =
            |e: serialport::Error| ActionError::new(ErrorKind::FailedToReset, e.to_string());

        match self.settings.reset_line {
            ResetLine::Dtr => {
                interface.write_data_terminal_ready(true).map_err(map_err)?;
                thread::sleep(self.settings.reset_duration);
                interface.write_data_terminal_ready(false).map_err(map_err)?;
            }
            ResetLine::Rts => {
                interface.write_request_to_send(true).map_err(map_err)?;
                thread::sleep(self.settings.reset_duration);
                interface.write_request_to_send(false).map_err(map_err)?;
            }
            ResetLine::Callback => {
                let Some(callback) = &self.settings.reset_callback else {
                    return Err(ActionError::new(
                        ErrorKind::FailedToReset,
                        "Reset callback option selected, but no callback provided.",
                    ));
                };
                let reset_duration = self.settings.reset_duration;
                match panic::catch_unwind(AssertUnwindSafe(|| callback(reset_duration))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        return Err(ActionError::new(ErrorKind::FailedToReset, e.to_string()));
                    }
                    Err(payload) => {
                        return Err(ActionError::new(
                            ErrorKind::FailedToReset,
                            format!("Reset callback panicked: {}", panic_message(payload.as_ref())),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn ensure_not_cancelled(&self) -> ActionResult<()> {
        if self.inner.is_cancelled() {
            return Err(ActionError::new(
                ErrorKind::Cancelled,
                self.inner.current_activity(),
            ));
        }
        Ok(())
    }

    /// Records a progress checkpoint, first checking for cancellation.
    fn checkpoint(&self, description: &'static str) -> ActionResult<()> {
        self.ensure_not_cancelled()?;
        self.inner.set_checkpoint(description);
        Ok(())
    }

    /// Sleeps until `deadline`, checking for cancellation every
    /// [CANCELLATION_CHECK_INTERVAL].
    fn wait_until(&self, deadline: Instant) -> ActionResult<()> {
        let mut remaining = deadline.saturating_duration_since(Instant::now());

        while !remaining.is_zero() {
            self.ensure_not_cancelled()?;

            if remaining < CANCELLATION_CHECK_INTERVAL {
                thread::sleep(remaining);
                self.ensure_not_cancelled()?;
                return Ok(());
            }
            thread::sleep(CANCELLATION_CHECK_INTERVAL);

            remaining = deadline.saturating_duration_since(Instant::now());
        }
        Ok(())
    }

    /// The time taken to transmit `num_bytes` at the snapshot's baudrate,
    /// assuming 10 bit periods per byte.
    fn transit_duration(&self, num_bytes: usize) -> Duration {
        let baudrate = u64::from(self.settings.baudrate).max(1);
        let micros = (num_bytes as u64 * 10_000_000) / baudrate;
        Duration::from_micros(micros.max(1))
    }

    fn responsiveness_timeout(&self, transit_duration: Duration) -> Duration {
        transit_duration
            .mul_f32(RESPONSIVENESS_MULTIPLIER)
            .max(MIN_RESPONSIVENESS_TIMEOUT)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-standard panic payload".to_string()
    }
}
