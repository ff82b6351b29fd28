//! Serial port plumbing for the loader
//!
//! The [Interface] struct wraps the underlying [SerialPort] so the loader's
//! worker has one place to reach the modem control lines and byte I/O. The
//! [PortArbiter] trait is the seam to an external port-sharing layer that
//! arbitrates which of several controllers currently owns a physical port;
//! a loader with no arbiter installed assumes it is the port's only user.

use std::io::Read;
use std::time::Duration;

use serialport::SerialPort;

/// Wrapper around [SerialPort] giving the loader access to the modem control
/// lines and raw byte I/O.
pub struct Interface {
    serial_port: Box<dyn SerialPort>,
}

impl Interface {
    pub fn new(serial_port: Box<dyn SerialPort>) -> Self {
        Interface { serial_port }
    }

    pub fn write_data_terminal_ready(&mut self, level: bool) -> serialport::Result<()> {
        self.serial_port.write_data_terminal_ready(level)
    }

    pub fn write_request_to_send(&mut self, level: bool) -> serialport::Result<()> {
        self.serial_port.write_request_to_send(level)
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.serial_port.as_ref()
    }

    pub fn serial_port_mut(&mut self) -> &mut dyn SerialPort {
        self.serial_port.as_mut()
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.serial_port
    }
}

// Note: this impl is necessary because using `dyn SerialPort` as `dyn Read`
// requires trait_upcasting which isn't stable yet.
impl Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.serial_port.read(buf)
    }
}

/// The seam to an external port-ownership layer.
///
/// Several controllers may share one physical port; before touching the wire
/// a controller must be made the port's active user. The loader claims the
/// port at the start of every action and keeps the claim until it is dropped.
/// The reverse direction — the arbitration layer asking the loader to give
/// the port up — goes through
/// [PropLoader::will_make_inactive][crate::PropLoader::will_make_inactive],
/// which refuses while an action is in flight.
pub trait PortArbiter: Send {
    /// Make the calling loader the active user of the port.
    ///
    /// Returns an error if another controller holds the port and refuses to
    /// relinquish it.
    fn make_active(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Relinquish any claim the loader holds on the port.
    fn release(&mut self);
}

/// The loader's handle on its serial port: the device to open, the open
/// port once stage 1 has opened it, and the arbiter claim around both.
pub(crate) struct PortAccess {
    name: Option<String>,
    open: Option<Interface>,
    pub(crate) arbiter: Option<Box<dyn PortArbiter>>,
}

impl PortAccess {
    /// A port that will be opened by device name on first use.
    pub(crate) fn named(name: String) -> Self {
        PortAccess {
            name: Some(name),
            open: None,
            arbiter: None,
        }
    }

    /// A port that is already open.
    pub(crate) fn open(interface: Interface) -> Self {
        PortAccess {
            name: None,
            open: Some(interface),
            arbiter: None,
        }
    }

    /// Opens the port if it is not already open and returns it.
    ///
    /// `timeout` becomes the port's read/write timeout; stage 1 reapplies the
    /// full port settings afterwards in any case.
    pub(crate) fn ensure_open(
        &mut self,
        baudrate: u32,
        timeout: Duration,
    ) -> serialport::Result<&mut Interface> {
        if self.open.is_none() {
            let Some(name) = self.name.as_deref() else {
                return Err(serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    "the loader's injected port is gone and no device name is known",
                ));
            };
            let serial = serialport::new(name, baudrate).timeout(timeout).open()?;
            self.open = Some(Interface::new(serial));
        }
        match &mut self.open {
            Some(interface) => Ok(interface),
            None => Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "port failed to open",
            )),
        }
    }
}
