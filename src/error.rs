//! Library error types

use miette::Diagnostic;
use strum::Display;
use thiserror::Error;

/// The primary reason a loader action failed — one label per failure site.
///
/// An error kind is passed to
/// [StatusMonitor::loader_has_finished][crate::StatusMonitor::loader_has_finished]
/// along with a detail string, and recorded in the
/// [ActionSummary][crate::ActionSummary].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum ErrorKind {
    #[default]
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "cancelled")]
    Cancelled,
    /// Another controller is using the port and refuses to relinquish it.
    #[strum(serialize = "failed to obtain port access")]
    FailedToObtainPortAccess,
    #[strum(serialize = "failed to open port")]
    FailedToOpenPort,
    #[strum(serialize = "failed to flush output")]
    FailedToFlushOutput,
    #[strum(serialize = "failed to set baudrate")]
    FailedToSetBaudrate,
    /// Specifically, the serial port's read and write timeouts.
    #[strum(serialize = "failed to set timeout")]
    FailedToSetTimeout,
    #[strum(serialize = "failed to set bytesize")]
    FailedToSetBytesize,
    #[strum(serialize = "failed to set parity")]
    FailedToSetParity,
    #[strum(serialize = "failed to set stopbits")]
    FailedToSetStopbits,
    #[strum(serialize = "failed to set flowcontrol")]
    FailedToSetFlowcontrol,
    #[strum(serialize = "failed to reset")]
    FailedToReset,
    #[strum(serialize = "failed to flush input")]
    FailedToFlushInput,
    #[strum(serialize = "failed to send initial bytes")]
    FailedToSendInitialBytes,
    /// The authentication data was not received.
    #[strum(serialize = "failed to receive target authentication")]
    FailedToReceiveTargetAuthentication,
    /// The authentication data was received, but it was not correct.
    #[strum(serialize = "failed to authenticate target")]
    FailedToAuthenticateTarget,
    /// The chip version was not received.
    #[strum(serialize = "failed to receive chip version")]
    FailedToReceiveChipVersion,
    /// The chip version was received, but was not valid 3-Bit-Protocol data.
    #[strum(serialize = "failed to decode chip version")]
    FailedToDecodeChipVersion,
    /// The chip version was received, but is not supported.
    #[strum(serialize = "unsupported chip version")]
    UnsupportedChipVersion,
    #[strum(serialize = "failed to send command")]
    FailedToSendCommand,
    #[strum(serialize = "failed to encode image size")]
    FailedToEncodeImageSize,
    #[strum(serialize = "failed to send image size")]
    FailedToSendImageSize,
    #[strum(serialize = "failed to send image")]
    FailedToSendImage,
    /// A transmission prompt needed to clock out a status byte could not be
    /// sent.
    #[strum(serialize = "failed to send status prompt")]
    FailedToSendStatusPrompt,
    #[strum(serialize = "failed to receive checksum status")]
    FailedToReceiveChecksumStatus,
    #[strum(serialize = "target reports checksum error")]
    TargetReportsChecksumError,
    #[strum(serialize = "failed to receive EEPROM programming status")]
    FailedToReceiveEepromProgrammingStatus,
    #[strum(serialize = "target reports EEPROM programming error")]
    TargetReportsEepromProgrammingError,
    #[strum(serialize = "failed to receive EEPROM verification status")]
    FailedToReceiveEepromVerificationStatus,
    #[strum(serialize = "target reports EEPROM verification error")]
    TargetReportsEepromVerificationError,
    /// A bug in the loader.
    #[strum(serialize = "BUG: unhandled exception")]
    UnhandledException,
}

/// An error returned synchronously by [PropLoader][crate::PropLoader] entry
/// points.
///
/// These reject an action before it begins (or a bad setting value); no
/// status monitor callbacks are made for them. Failures of an admitted
/// action are reported through the monitor's finish callback instead.
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("The loader is busy. {0}")]
    #[diagnostic(
        code(proploader::busy),
        help("Wait for the current action to finish, or cancel it")
    )]
    Busy(String),

    #[error("Invalid image: {0}")]
    #[diagnostic(code(proploader::invalid_image))]
    InvalidImage(String),

    #[error("Baudrate {0} exceeds the maximum of 115200")]
    #[diagnostic(
        code(proploader::baudrate_too_high),
        help("The booter cannot reliably receive faster than 115200 bps; use a bootstrapped loader for higher rates")
    )]
    BaudrateTooHigh(u32),

    #[error("Reset duration of {0} ms is outside the supported range of 1 to 100 ms")]
    #[diagnostic(code(proploader::invalid_reset_duration))]
    InvalidResetDuration(u64),

    #[error("Boot wait duration of {0} ms is outside the supported range of 50 to 150 ms")]
    #[diagnostic(code(proploader::invalid_boot_wait_duration))]
    InvalidBootWaitDuration(u64),

    #[error("Timeout occurred while waiting for the action to finish")]
    #[diagnostic(code(proploader::wait_timeout))]
    WaitTimeout,
}

/// Aborts an action on the worker thread.
///
/// Caught by the worker's top-level handler, which reports the kind and
/// details through the status monitor's finish callback.
#[derive(Debug)]
pub(crate) struct ActionError {
    pub kind: ErrorKind,
    pub details: String,
}

impl ActionError {
    pub fn new(kind: ErrorKind, details: impl Into<String>) -> Self {
        ActionError {
            kind,
            details: details.into(),
        }
    }
}

pub(crate) type ActionResult<T> = Result<T, ActionError>;
