//! A library for programming and controlling a Parallax Propeller P8X32A
//! microcontroller over a serial link
//!
//! The [PropLoader] struct drives the Propeller's on-chip booter program
//! through its serial boot protocol: it resets the chip, authenticates it,
//! checks the chip version, and then loads a user-supplied image into hub RAM
//! or programs it into an external EEPROM.
//!
//! Actions run on a dedicated worker thread so the calling thread is never
//! blocked on serial I/O. Progress and completion are reported through an
//! optional [StatusMonitor]:
//!
//! ```no_run
//! use proploader::PropLoader;
//!
//! let loader = PropLoader::new("/dev/ttyUSB0");
//! let image = std::fs::read("blink.binary").unwrap();
//!
//! loader.load_ram(&image).unwrap();
//! loader.wait_until_finished(std::time::Duration::ZERO).unwrap();
//! ```
//!
//! The booter communicates using the 3-Bit-Protocol, a pulse-width encoding
//! carried over standard 8N1 serial frames; see the [encoder] module. Because
//! of how the booter counts pulses the transmit rate is capped at 115200 bps
//! ([encoder::MAX_BAUDRATE]).

pub mod encoder;
pub mod error;
pub mod interface;
pub mod loader;
pub mod monitor;
pub mod protocol;

pub use crate::{
    error::{Error, ErrorKind},
    interface::{Interface, PortArbiter},
    loader::{Action, ActionSummary, PropLoader, ResetCallback, ResetLine, Status},
    monitor::StatusMonitor,
};
