/// Fixed 20-byte checksummed frames used on the control characteristic
use std::fmt;

/// Total size of a frame on the wire
pub const FRAME_LEN: usize = 20;
/// Opcode plus zero-padded payload, i.e. everything covered by the checksum
pub const CONTENT_LEN: usize = FRAME_LEN - 1;
/// Largest payload that fits after the 2-byte opcode
pub const MAX_PAYLOAD_LEN: usize = CONTENT_LEN - 2;

/// Decoded frame body: opcode followed by the zero-padded payload
pub type FrameContent = [u8; CONTENT_LEN];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("expected a 20 byte frame, got {actual} bytes")]
    WrongLength { actual: usize },

    #[error("incorrect checksum: received {actual:#04x}, calculated {expected:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Two-byte request/response type at the start of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub [u8; 2]);

impl Opcode {
    pub const HARDWARE_VERSION: Opcode = Opcode([0xAA, 0x0D]);
    pub const FIRMWARE_VERSION: Opcode = Opcode([0xAA, 0x0E]);
    pub const SECONDARY_FIRMWARE: Opcode = Opcode([0xAA, 0x20]);

    /// Opcode of a decoded frame
    pub fn of(content: &FrameContent) -> Opcode {
        Opcode([content[0], content[1]])
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0[0], self.0[1])
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Build a frame from an opcode and up to 17 payload bytes
///
/// The payload is right-padded with zeros and the XOR of all 19 preceding
/// bytes is appended as the checksum.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Result<[u8; FRAME_LEN], FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut frame = [0u8; FRAME_LEN];
    frame[0..2].copy_from_slice(&opcode.0);
    frame[2..2 + payload.len()].copy_from_slice(payload);
    frame[CONTENT_LEN] = checksum(&frame[..CONTENT_LEN]);
    Ok(frame)
}

/// Verify a received frame and return its 19-byte content
pub fn decode(frame: &[u8]) -> Result<FrameContent, FrameError> {
    if frame.len() != FRAME_LEN {
        return Err(FrameError::WrongLength {
            actual: frame.len(),
        });
    }

    let expected = checksum(&frame[..CONTENT_LEN]);
    let actual = frame[CONTENT_LEN];
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let mut content = [0u8; CONTENT_LEN];
    content.copy_from_slice(&frame[..CONTENT_LEN]);
    Ok(content)
}

/// Payload bytes of a decoded frame (everything after the opcode)
pub fn value(content: &FrameContent) -> &[u8] {
    &content[2..]
}

/// Decode a zero-padded text field, dropping only the trailing zero bytes
pub fn strip_trailing_nulls(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn encodes_known_request() {
        let frame = encode(Opcode::HARDWARE_VERSION, &[]).unwrap();
        assert_eq!(frame.to_vec(), hex("AA0D0000000000000000000000000000000000A7"));

        let frame = encode(Opcode::SECONDARY_FIRMWARE, &[]).unwrap();
        assert_eq!(frame[19], 0x8A);
    }

    #[test]
    fn empty_opcode_gives_zero_frame() {
        assert_eq!(encode(Opcode([0, 0]), &[]).unwrap(), [0u8; FRAME_LEN]);
    }

    #[test]
    fn payload_limit() {
        assert!(encode(Opcode::FIRMWARE_VERSION, &[0x11; MAX_PAYLOAD_LEN]).is_ok());
        assert_eq!(
            encode(Opcode::FIRMWARE_VERSION, &[0x11; 18]),
            Err(FrameError::PayloadTooLarge { size: 18, max: 17 })
        );
    }

    #[test]
    fn decode_recovers_padded_content() {
        let payloads: [&[u8]; 4] = [b"", b"1", b"1.00.02", &[0xFF; 17]];
        for payload in payloads {
            let frame = encode(Opcode::FIRMWARE_VERSION, payload).unwrap();
            assert_eq!(frame[19], checksum(&frame[..19]));

            let content = decode(&frame).unwrap();
            assert_eq!(Opcode::of(&content), Opcode::FIRMWARE_VERSION);
            assert_eq!(&value(&content)[..payload.len()], payload);
            assert!(value(&content)[payload.len()..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn decode_known_response() {
        let content = decode(&hex("AA0D0000000000000000000000000000000000A7")).unwrap();
        assert_eq!(content.to_vec(), hex("AA0D0000000000000000000000000000000000"));
    }

    #[test]
    fn decode_rejects_bad_checksum() {
        assert_eq!(
            decode(&hex("AA0D0000000000000000000000000000000000A6")),
            Err(FrameError::ChecksumMismatch {
                expected: 0xA7,
                actual: 0xA6
            })
        );
        assert!(matches!(
            decode(&hex("AA0E0000000000000000000000000000000000A7")),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn any_flipped_checksum_bit_is_detected() {
        let frame = encode(Opcode::HARDWARE_VERSION, b"H5179").unwrap();
        for bit in 0..8 {
            let mut corrupt = frame;
            corrupt[19] ^= 1 << bit;
            assert!(matches!(
                decode(&corrupt),
                Err(FrameError::ChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn decode_reports_length() {
        assert_eq!(
            decode(&hex("AA0D00000000000000000000000000000000A6")),
            Err(FrameError::WrongLength { actual: 19 })
        );
        assert_eq!(decode(&[]), Err(FrameError::WrongLength { actual: 0 }));
        assert_eq!(
            decode(&[0u8; 21]),
            Err(FrameError::WrongLength { actual: 21 })
        );
    }

    #[test]
    fn strips_only_trailing_nulls() {
        assert_eq!(strip_trailing_nulls(b"\x00\x00"), "");
        assert_eq!(strip_trailing_nulls(b"12\x00\x00"), "12");
        assert_eq!(strip_trailing_nulls(b"12 \x00"), "12 ");
        assert_eq!(strip_trailing_nulls(b"\x001\x002"), "\u{0}1\u{0}2");

        let once = strip_trailing_nulls(b"1.00.01\x00\x00");
        assert_eq!(strip_trailing_nulls(once.as_bytes()), once);
    }
}
