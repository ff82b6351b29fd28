//! 3-Bit-Protocol encoding for the Propeller booter's bit-counting receiver
//!
//! In the 3-Bit-Protocol a 1 is a short low pulse (about one bit period) and
//! a 0 is a long low pulse (about two bit periods); between pulses the line
//! idles high. The booter classifies a pulse by counting loops while the rx
//! line is low, using two calibration pulses sent at the start of
//! communications as its reference.
//!
//! [ThreeBitProtocolEncoder] packs these pulses into bytes for 8N1
//! asynchronous transmission. The UART start bit is itself low, so it supplies
//! the leading edge of a pulse for free; the encoder extends the pulse by
//! clearing data bits and guarantees the idle gap by leaving data bits high.
//! Bits of the same long are separated by at least one bit period of idle,
//! bits of different longs by at least two, since the booter does extra work
//! after assembling a long.

/// The maximum safe baudrate for transmitting encoded data to the booter.
///
/// The booter runs from the RCFAST clock (8 MHz - 20 MHz) and counts loops to
/// classify pulses, so both the pulse durations and the inter-pulse idle gaps
/// limit the usable rate. With one and two bit periods for the short and long
/// pulses, and allowing for ±10% clock jitter at 8 MHz, pulse classification
/// is reliable up to roughly 133 kbps and inter-pulse timing up to roughly
/// 150 kbps. 115200 bps is the fastest commonly supported rate below both
/// limits.
pub const MAX_BAUDRATE: u32 = 115_200;

/// Bit periods of high idle between encoded pulses of the same long.
const INTRA_LONG_IDLE_TIME: usize = 1;

/// Bit periods of high idle between encoded pulses of different longs.
///
/// Must be 2+ to support 115200 bps; the booter does extra work between
/// receiving longs.
const INTER_LONG_IDLE_TIME: usize = 2;

/// Encodes data into the 3-Bit-Protocol used by the Propeller booter.
///
/// The encoder appends to the provided buffer, which it clears on
/// construction. Output is a dense stream of bytes for 8N1 transmission.
pub struct ThreeBitProtocolEncoder<'a> {
    buffer: &'a mut Vec<u8>,
    /// Position of the next encoded pulse within `curr_byte`. Position zero
    /// refers to the start bit; positions 1-8 are data bits; 9 is the stop
    /// bit, which must stay high.
    bit_pos: usize,
    curr_byte: u8,
}

impl<'a> ThreeBitProtocolEncoder<'a> {
    /// Creates an encoder which puts its encoded data into `buffer`, clearing
    /// any previous contents.
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        buffer.clear();
        ThreeBitProtocolEncoder {
            buffer,
            bit_pos: 0,
            curr_byte: 0xff,
        }
    }

    /// Appends the encoded four byte value to the buffer.
    pub fn encode_long(&mut self, value: u32) {
        self.encode_long_open(value);
        self.push_curr_byte_if_not_empty();
    }

    /// Appends the encoded bytes to the buffer.
    ///
    /// Bytes are encoded in groups of four, little-endian — a 'long' on the
    /// Propeller. If the length is not a multiple of four the end is
    /// implicitly padded with NUL bytes.
    ///
    /// Returns the number of longs encoded.
    pub fn encode_bytes_as_longs(&mut self, bytes: &[u8]) -> usize {
        let mut num_longs = 0;

        let mut chunks = bytes.chunks_exact(4);
        for chunk in &mut chunks {
            self.encode_long_open(u32::from_le_bytes(chunk.try_into().unwrap()));
            num_longs += 1;
        }

        let remainder = chunks.remainder();
        if !remainder.is_empty() {
            let mut word = [0u8; 4];
            word[..remainder.len()].copy_from_slice(remainder);
            self.encode_long_open(u32::from_le_bytes(word));
            num_longs += 1;
        }

        self.push_curr_byte_if_not_empty();
        num_longs
    }

    /// Encodes a long without pushing `curr_byte` afterwards, leaving it open
    /// for further bits. This packs consecutive longs more densely; callers
    /// must flush before the encoded data is complete.
    fn encode_long_open(&mut self, mut value: u32) {
        for _ in 0..31 {
            self.encode_bit((value & 1) as u8, INTRA_LONG_IDLE_TIME);
            value >>= 1;
        }
        self.encode_bit((value & 1) as u8, INTER_LONG_IDLE_TIME);
    }

    /// Encodes a single bit pulse followed by at least `idle_bits` bit
    /// periods of high idle. `idle_bits` must be in [1, 8].
    fn encode_bit(&mut self, bit: u8, idle_bits: usize) {
        debug_assert!((1..=8).contains(&idle_bits));

        if self.bit_pos >= 10 {
            self.push_curr_byte_if_not_empty();
        }

        if self.bit_pos == 0 {
            // Starting at the start bit means every valid idle_bits fits.
            if bit == 0 {
                // Clear data bit 0 to extend the start bit into a long pulse.
                self.curr_byte &= 0xfe;
                self.bit_pos = 2 + idle_bits;
            } else {
                // The implicit start bit is the short pulse.
                self.bit_pos = 1 + idle_bits;
            }
            return;
        }

        let pulse_len = if bit == 0 { 2 } else { 1 };
        let new_pos = self.bit_pos + pulse_len + idle_bits;
        if new_pos > 10 {
            // Move to the next byte to guarantee the requested idle.
            self.push_curr_byte_if_not_empty();
            self.encode_bit(bit, idle_bits);
            return;
        }

        let mask: u8 = if bit == 0 { 3 } else { 1 };
        self.curr_byte &= !(mask << (self.bit_pos - 1));
        self.bit_pos = new_pos;
    }

    /// Pushes `curr_byte` onto the buffer unless it is still empty.
    ///
    /// An 'empty' byte (bit_pos = 0) is never pushed: its implicit start bit
    /// pulse would inject a spurious encoded 1.
    fn push_curr_byte_if_not_empty(&mut self) {
        if self.bit_pos == 0 {
            return;
        }
        self.buffer.push(self.curr_byte);
        self.bit_pos = 0;
        self.curr_byte = 0xff;
    }
}
