//! A scripted in-memory serial port for driving the loader end to end
//!
//! The mock plays the target's side of the wire: replies are queued onto the
//! read buffer when a scripted trigger fires — either the host having written
//! a given total number of bytes, or the host writing a status transmission
//! prompt. Everything the host does (bytes written, modem line transitions,
//! applied port settings) is recorded for the tests to inspect.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use proploader::protocol::STATUS_PROMPT;

/// When a scripted reply becomes available to the host.
pub enum Trigger {
    /// Fires once the host has written at least this many bytes in total.
    TotalWritten(usize),
    /// Fires when the host writes a status transmission prompt.
    Prompt,
}

pub struct ScriptStep {
    pub trigger: Trigger,
    pub reply: Vec<u8>,
}

impl ScriptStep {
    pub fn after_written(total: usize, reply: impl Into<Vec<u8>>) -> Self {
        ScriptStep {
            trigger: Trigger::TotalWritten(total),
            reply: reply.into(),
        }
    }

    pub fn on_prompt(reply: impl Into<Vec<u8>>) -> Self {
        ScriptStep {
            trigger: Trigger::Prompt,
            reply: reply.into(),
        }
    }
}

#[derive(Default)]
struct PortSettings {
    baud_rate: u32,
    data_bits: Option<DataBits>,
    flow_control: Option<FlowControl>,
    parity: Option<Parity>,
    stop_bits: Option<StopBits>,
}

struct MockState {
    script: VecDeque<ScriptStep>,
    pending_reads: VecDeque<u8>,
    written: Vec<u8>,
    write_chunks: Vec<Vec<u8>>,
    dtr_events: Vec<(Instant, bool)>,
    rts_events: Vec<(Instant, bool)>,
    settings: PortSettings,
    timeout: Duration,
}

impl MockState {
    /// Fires any script steps the given write chunk satisfies.
    fn advance_script(&mut self, chunk: &[u8]) {
        loop {
            let fires = match self.script.front() {
                Some(step) => match step.trigger {
                    Trigger::TotalWritten(total) => self.written.len() >= total,
                    Trigger::Prompt => chunk == [STATUS_PROMPT],
                },
                None => false,
            };
            if !fires {
                return;
            }
            let step = self.script.pop_front().unwrap();
            let is_prompt = matches!(step.trigger, Trigger::Prompt);
            self.pending_reads.extend(step.reply);
            if is_prompt {
                // One prompt clocks out at most one reply.
                return;
            }
        }
    }
}

/// The mock serial port handed to the loader.
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

/// The test's view into the mock after the port has moved into the loader.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new(script: Vec<ScriptStep>) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState {
            script: script.into(),
            pending_reads: VecDeque::new(),
            written: Vec::new(),
            write_chunks: Vec::new(),
            dtr_events: Vec::new(),
            rts_events: Vec::new(),
            settings: PortSettings {
                baud_rate: 115_200,
                ..PortSettings::default()
            },
            timeout: Duration::from_millis(100),
        }));
        let handle = MockHandle {
            state: Arc::clone(&state),
        };
        (MockPort { state }, handle)
    }
}

impl MockHandle {
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn written_len(&self) -> usize {
        self.state.lock().unwrap().written.len()
    }

    /// The number of status-prompt bytes the host has written.
    pub fn prompt_chunks(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .write_chunks
            .iter()
            .filter(|chunk| chunk.as_slice() == [STATUS_PROMPT])
            .count()
    }

    pub fn dtr_events(&self) -> Vec<(Instant, bool)> {
        self.state.lock().unwrap().dtr_events.clone()
    }

    pub fn rts_events(&self) -> Vec<(Instant, bool)> {
        self.state.lock().unwrap().rts_events.clone()
    }

    pub fn applied_baud_rate(&self) -> u32 {
        self.state.lock().unwrap().settings.baud_rate
    }

    pub fn applied_data_bits(&self) -> Option<DataBits> {
        self.state.lock().unwrap().settings.data_bits
    }

    pub fn applied_parity(&self) -> Option<Parity> {
        self.state.lock().unwrap().settings.parity
    }
}

impl io::Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = {
            let mut state = self.state.lock().unwrap();
            if !state.pending_reads.is_empty() {
                let count = buf.len().min(state.pending_reads.len());
                for slot in buf.iter_mut().take(count) {
                    *slot = state.pending_reads.pop_front().unwrap();
                }
                return Ok(count);
            }
            state.timeout
        };
        // Nothing buffered; emulate the driver blocking until its timeout.
        thread::sleep(timeout.min(Duration::from_millis(10)));
        Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timed out"))
    }
}

impl io::Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.written.extend_from_slice(buf);
        state.write_chunks.push(buf.to_vec());
        state.advance_script(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialPort for MockPort {
    fn name(&self) -> Option<String> {
        Some("mock".to_string())
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(self.state.lock().unwrap().settings.baud_rate)
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .settings
            .data_bits
            .unwrap_or(DataBits::Eight))
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .settings
            .flow_control
            .unwrap_or(FlowControl::None))
    }

    fn parity(&self) -> serialport::Result<Parity> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .settings
            .parity
            .unwrap_or(Parity::None))
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .settings
            .stop_bits
            .unwrap_or(StopBits::One))
    }

    fn timeout(&self) -> Duration {
        self.state.lock().unwrap().timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> serialport::Result<()> {
        self.state.lock().unwrap().settings.baud_rate = baud_rate;
        Ok(())
    }

    fn set_data_bits(&mut self, data_bits: DataBits) -> serialport::Result<()> {
        self.state.lock().unwrap().settings.data_bits = Some(data_bits);
        Ok(())
    }

    fn set_flow_control(&mut self, flow_control: FlowControl) -> serialport::Result<()> {
        self.state.lock().unwrap().settings.flow_control = Some(flow_control);
        Ok(())
    }

    fn set_parity(&mut self, parity: Parity) -> serialport::Result<()> {
        self.state.lock().unwrap().settings.parity = Some(parity);
        Ok(())
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> serialport::Result<()> {
        self.state.lock().unwrap().settings.stop_bits = Some(stop_bits);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
        self.state.lock().unwrap().timeout = timeout;
        Ok(())
    }

    fn write_request_to_send(&mut self, level: bool) -> serialport::Result<()> {
        self.state
            .lock()
            .unwrap()
            .rts_events
            .push((Instant::now(), level));
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> serialport::Result<()> {
        self.state
            .lock()
            .unwrap()
            .dtr_events
            .push((Instant::now(), level));
        Ok(())
    }

    fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn bytes_to_read(&self) -> serialport::Result<u32> {
        Ok(self.state.lock().unwrap().pending_reads.len() as u32)
    }

    fn bytes_to_write(&self) -> serialport::Result<u32> {
        Ok(0)
    }

    fn clear(&self, buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
        let mut state = self.state.lock().unwrap();
        match buffer_to_clear {
            ClearBuffer::Input => state.pending_reads.clear(),
            ClearBuffer::Output => {}
            ClearBuffer::All => state.pending_reads.clear(),
        }
        Ok(())
    }

    fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
        Ok(Box::new(MockPort {
            state: Arc::clone(&self.state),
        }))
    }

    fn set_break(&self) -> serialport::Result<()> {
        Ok(())
    }

    fn clear_break(&self) -> serialport::Result<()> {
        Ok(())
    }
}
