//! Wire constants and helpers for the Propeller booter's serial protocol
//!
//! The booter's boot sequence is: calibration pulses, 250 host authentication
//! bits, 250 chip authentication bits clocked back by transmission prompts,
//! 8 chip-version bits, a command long, and (for loading commands) the image
//! length in longs followed by the image itself. All host-to-target data is
//! 3-Bit-Protocol encoded; see [crate::encoder].

use thiserror::Error;

use crate::encoder::ThreeBitProtocolEncoder;
use crate::error::Error as LoaderError;

/// The Propeller's hub RAM size, and so the maximum image size in bytes.
pub const MAX_IMAGE_SIZE: usize = 32768;

/// The encoded size of [MAX_IMAGE_SIZE] bytes of zeroes — the worst case.
pub const MAX_ENCODED_IMAGE_SIZE: usize = 87382;

/// Transmission prompt sent while waiting for a status byte.
///
/// The start-bit edges of prompt bytes give the booter a clock reference for
/// its reply bits. `0xAD` plays the same role during initialization.
pub const STATUS_PROMPT: u8 = 0x29;

/// Status byte reporting success on the target side.
pub const STATUS_OK: u8 = 0xFE;

/// Status byte reporting failure on the target side.
pub const STATUS_FAIL: u8 = 0xFF;

/// Prepared data for initiating communications with the booter.
///
/// Contains the calibration pulses, the 250 encoded host authentication bits,
/// and 129 transmission prompt bytes (`0xAD`, two prompts per byte) that
/// clock out the 250 chip authentication bits and the 8 version bits.
///
/// Must not be transmitted faster than [crate::encoder::MAX_BAUDRATE].
pub const INIT_BYTES: [u8; 199] = [
    0xF9, 0x4A, 0x25, 0xD5, 0x4A, 0xD5, 0x92, 0x95, 0x4A, 0x92, 0xD5, 0x92,
    0xCA, 0xCA, 0x4A, 0x95, 0xCA, 0xD2, 0x92, 0xA5, 0xA9, 0xC9, 0x4A, 0x49,
    0x49, 0x2A, 0x25, 0x49, 0xA5, 0x4A, 0xAA, 0x2A, 0xA9, 0xCA, 0xAA, 0x55,
    0x52, 0xAA, 0xA9, 0x29, 0x92, 0x92, 0x29, 0x25, 0x2A, 0xAA, 0x92, 0x92,
    0x55, 0xCA, 0x4A, 0xCA, 0xCA, 0x92, 0xCA, 0x92, 0x95, 0x55, 0xA9, 0x92,
    0x2A, 0xD2, 0x52, 0x92, 0x52, 0xCA, 0xD2, 0xCA, 0x2A, 0xFF, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
    0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD, 0xAD,
];

/// The encoded chip authentication bits the target must return in response
/// to [INIT_BYTES]. After these 125 bytes the target sends 4 more bytes that
/// encode the 8-bit chip version; see [decode_3bp_byte].
pub const TARGET_AUTH_BYTES: [u8; 125] = [
    0xEE, 0xCE, 0xCE, 0xCF, 0xEF, 0xCF, 0xEE, 0xEF, 0xCF, 0xCF, 0xEF, 0xEF,
    0xCF, 0xCE, 0xEF, 0xCF, 0xEE, 0xEE, 0xCE, 0xEE, 0xEF, 0xCF, 0xCE, 0xEE,
    0xCE, 0xCF, 0xEE, 0xEE, 0xEF, 0xCF, 0xEE, 0xCE, 0xEE, 0xCE, 0xEE, 0xCF,
    0xEF, 0xEE, 0xEF, 0xCE, 0xEE, 0xEE, 0xCF, 0xEE, 0xCF, 0xEE, 0xEE, 0xCF,
    0xEF, 0xCE, 0xCF, 0xEE, 0xEF, 0xEE, 0xEE, 0xEE, 0xEE, 0xEF, 0xEE, 0xCF,
    0xCF, 0xEF, 0xEE, 0xCE, 0xEF, 0xEF, 0xEF, 0xEF, 0xCE, 0xEF, 0xEE, 0xEF,
    0xCF, 0xEF, 0xCF, 0xCF, 0xCE, 0xCE, 0xCE, 0xCF, 0xCF, 0xEF, 0xCE, 0xEE,
    0xCF, 0xEE, 0xEF, 0xCE, 0xCE, 0xCE, 0xEF, 0xEF, 0xCF, 0xCF, 0xEE, 0xEE,
    0xEE, 0xCE, 0xCF, 0xCE, 0xCE, 0xCF, 0xCE, 0xEE, 0xEF, 0xEE, 0xEF, 0xEF,
    0xCF, 0xEF, 0xCE, 0xCE, 0xEF, 0xCE, 0xEE, 0xCE, 0xEF, 0xCE, 0xCE, 0xEE,
    0xCF, 0xCF, 0xCE, 0xCF, 0xCF,
];

/// The encoded command to shutdown.
pub const ENCODED_SHUTDOWN: [u8; 11] = [
    0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0xF2,
];

/// The encoded command to load the image into RAM and then run it.
pub const ENCODED_LOAD_RAM: [u8; 11] = [
    0xC9, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0xF2,
];

/// The encoded command to program the EEPROM and then shutdown.
pub const ENCODED_PROGRAM_EEPROM_THEN_SHUTDOWN: [u8; 11] = [
    0xCA, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0xF2,
];

/// The encoded command to program the EEPROM and then run the image.
pub const ENCODED_PROGRAM_EEPROM_THEN_RUN: [u8; 11] = [
    0x25, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0xFE,
];

/// Failure decoding a 3-Bit-Protocol reply from the target.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("insufficient bytes")]
    Truncated,
    #[error("unexpected byte: {0:#04X}")]
    UnexpectedByte(u8),
}

/// Decodes one byte of a 3-Bit-Protocol reply.
///
/// The target answers four `0xAD` transmission prompts with four bytes, each
/// carrying two bits. Recognized values are `0xCE` (00), `0xCF` (01), `0xEE`
/// (10) and `0xEF` (11); the pairs accumulate LSB-first. This is used to
/// decode the chip version.
pub fn decode_3bp_byte(bytes: &mut impl Iterator<Item = u8>) -> Result<u8, DecodeError> {
    let mut decoded: u8 = 0;
    for _ in 0..4 {
        let byte = bytes.next().ok_or(DecodeError::Truncated)?;
        decoded >>= 2;
        decoded |= match byte {
            0xCE => 0x00,
            0xCF => 0x40,
            0xEE => 0x80,
            0xEF => 0xC0,
            other => return Err(DecodeError::UnexpectedByte(other)),
        };
    }
    Ok(decoded)
}

/// Verifies that `image` is a plausible RAM image and encodes it into
/// `encoded_image`, returning the number of longs encoded.
///
/// The image must be non-empty and no larger than hub RAM; images whose
/// length is not a multiple of four are padded with NUL bytes.
pub fn verify_and_encode_image(
    image: &[u8],
    encoded_image: &mut Vec<u8>,
) -> Result<usize, LoaderError> {
    if image.is_empty() {
        return Err(LoaderError::InvalidImage(
            "image is too small to be valid".into(),
        ));
    }
    if image.len() > MAX_IMAGE_SIZE {
        return Err(LoaderError::InvalidImage(format!(
            "image size ({}) exceeds the Propeller's hub RAM size ({MAX_IMAGE_SIZE})",
            image.len()
        )));
    }

    let mut encoder = ThreeBitProtocolEncoder::new(encoded_image);
    Ok(encoder.encode_bytes_as_longs(image))
}
