//! Bridge frame codec.
//!
//! Host to bridge: `[flag|version][len][command][args..][crc]`.
//! Bridge to host: `[flag|version][len][response][fields..][crc][code][pad..]`,
//! where the trailing pad bytes are all `PAD_OK` or all `PAD_ERROR` and the
//! byte just before them is the error code.

use std::fmt;

use super::BridgeError;
use super::crc::crc8_p93;
use super::fields::Fields;
use super::protocol::{
    BUFFER_SIZE, Command, Errcode, FLAG_PAYLOAD, FRAME_OVERHEAD, HEADER_FLAG_MASK,
    HEADER_VERSION_MASK, PAD_ERROR, PAD_OK, PROTOCOL_VERSION, Response, TOTAL_OVERHEAD,
};

/// Split a header pair into flag bits, version and declared length.
pub fn parse_header(b: &[u8]) -> Result<(u8, u8, u8), BridgeError> {
    if b.len() < 2 {
        return Err(BridgeError::TooShort {
            len: b.len(),
            min: 2,
        });
    }
    let flag = b[0] & HEADER_FLAG_MASK;
    let version = b[0] & HEADER_VERSION_MASK;
    if version != PROTOCOL_VERSION {
        return Err(BridgeError::VersionMismatch {
            frame: hex::encode(b),
            version,
        });
    }
    Ok((flag, version, b[1]))
}

/// Trailing padding of a bridge reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    /// Index of the first pad byte; 0 if the whole buffer is padding.
    pub start: usize,
    /// Error code, present only with error padding.
    pub code: Option<Errcode>,
}

/// Locate the padding and recover the embedded error code.
///
/// With `require_ok`, error padding is reported as [`BridgeError::Remote`].
pub fn parse_padding(b: &[u8], require_ok: bool) -> Result<Padding, BridgeError> {
    if b.len() < 4 {
        return Err(BridgeError::TooShort {
            len: b.len(),
            min: 4,
        });
    }
    let pads = &b[b.len() - 4..];
    let pad = pads[0];
    if pads.iter().any(|&p| p != pad) {
        return Err(BridgeError::InvalidPadding {
            frame: hex::encode(b),
        });
    }
    let (start, code_byte) = match b.iter().rposition(|&x| x != pad) {
        Some(i) => (i + 1, b[i]),
        None => (0, 0),
    };
    match pad {
        PAD_OK => Ok(Padding { start, code: None }),
        PAD_ERROR => {
            if code_byte == 0 {
                return Err(BridgeError::InvalidPadding {
                    frame: hex::encode(b),
                });
            }
            let code = Errcode::from(code_byte);
            if require_ok {
                return Err(BridgeError::Remote {
                    code,
                    frame: hex::encode(b),
                });
            }
            Ok(Padding {
                start,
                code: Some(code),
            })
        }
        _ => Err(BridgeError::InvalidPadding {
            frame: hex::encode(b),
        }),
    }
}

#[derive(Clone)]
pub struct Frame {
    buf: [u8; BUFFER_SIZE],
    plen: u8,
    crc: u8,
    pub version: u8,
    pub flag: u8,
    pub fields: Fields,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            buf: [0u8; BUFFER_SIZE],
            plen: 0,
            crc: 0,
            version: 0,
            flag: 0,
            fields: Fields::default(),
        }
    }
}

impl Frame {
    fn build(tag: u8, data: &[u8]) -> Result<Frame, BridgeError> {
        let plen = 1 + data.len();
        if FRAME_OVERHEAD + plen > BUFFER_SIZE {
            return Err(BridgeError::LengthOverflow {
                len: plen,
                max: BUFFER_SIZE - FRAME_OVERHEAD,
            });
        }
        let mut f = Frame {
            version: PROTOCOL_VERSION,
            flag: FLAG_PAYLOAD,
            plen: plen as u8,
            ..Frame::default()
        };
        f.buf[0] = f.flag | f.version;
        f.buf[1] = f.plen;
        f.buf[2] = tag;
        f.buf[3..3 + data.len()].copy_from_slice(data);
        f.crc = crc8_p93(0, &f.buf[1..2 + plen]);
        f.buf[2 + plen] = f.crc;
        Ok(f)
    }

    /// Host command frame.
    pub fn new_command(cmd: Command, data: &[u8]) -> Result<Frame, BridgeError> {
        Frame::build(u8::from(cmd), data)
    }

    /// Bridge reply frame with raw field bytes. Used by firmware emulators.
    pub fn new_response(kind: Response, fields: &[u8]) -> Result<Frame, BridgeError> {
        Frame::build(u8::from(kind), fields)
    }

    /// Encoded frame without padding.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..FRAME_OVERHEAD + self.plen as usize]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[2..2 + self.plen as usize]
    }

    pub fn plen(&self) -> u8 {
        self.plen
    }

    pub fn crc(&self) -> u8 {
        self.crc
    }

    pub fn command(&self) -> Command {
        Command::from(self.buf[2])
    }

    /// `None` when the frame carries no payload.
    pub fn response_kind(&self) -> Option<Response> {
        if self.flag & FLAG_PAYLOAD == 0 || self.plen == 0 {
            return None;
        }
        Some(Response::from(self.buf[2]))
    }

    /// Decode a bridge reply, replacing the frame content. Fields are left
    /// empty; see [`Frame::parse_fields`].
    pub fn parse(&mut self, b: &[u8]) -> Result<(), BridgeError> {
        if b.len() < TOTAL_OVERHEAD {
            return Err(BridgeError::TooShort {
                len: b.len(),
                min: TOTAL_OVERHEAD,
            });
        }
        let padding = parse_padding(b, true)?;
        // Drop the error code byte too.
        let b = &b[..padding.start.saturating_sub(1)];
        if b.len() < FRAME_OVERHEAD {
            return Err(BridgeError::TooShort {
                len: b.len(),
                min: FRAME_OVERHEAD,
            });
        }

        let (flag, version, plen) = parse_header(b)?;
        let plen_us = plen as usize;
        if FRAME_OVERHEAD + plen_us > BUFFER_SIZE {
            return Err(BridgeError::LengthOverflow {
                len: plen_us,
                max: BUFFER_SIZE - FRAME_OVERHEAD,
            });
        }
        if plen_us > b.len() - FRAME_OVERHEAD {
            return Err(BridgeError::LengthOverflow {
                len: plen_us,
                max: b.len() - FRAME_OVERHEAD,
            });
        }
        let received = b[2 + plen_us];
        let actual = crc8_p93(0, &b[1..2 + plen_us]);
        if received != actual {
            return Err(BridgeError::CrcMismatch {
                frame: hex::encode(b),
                received,
                actual,
            });
        }
        if flag & FLAG_PAYLOAD == 0 && plen > 0 {
            return Err(BridgeError::NoPayloadFlag {
                frame: hex::encode(b),
                len: plen,
            });
        }

        let n = FRAME_OVERHEAD + plen_us;
        self.buf = [0u8; BUFFER_SIZE];
        self.buf[..n].copy_from_slice(&b[..n]);
        self.flag = flag;
        self.version = version;
        self.plen = plen;
        self.crc = actual;
        self.fields = Fields::default();
        Ok(())
    }

    /// Decode the payload fields of a reply.
    pub fn parse_fields(&mut self) -> Result<(), BridgeError> {
        self.fields = Fields::default();
        if self.plen == 0 {
            return Ok(());
        }
        match self.response_kind() {
            Some(Response::Ok | Response::Reset | Response::TwiListen | Response::Error) => {}
            kind => {
                return Err(BridgeError::UnexpectedResponse {
                    frame: hex::encode(self.bytes()),
                    kind: kind.map(u8::from),
                });
            }
        }
        self.fields = Fields::parse(&self.payload()[1..])?;
        Ok(())
    }

    /// Parse frame and fields from a reply buffer.
    pub fn from_reply(b: &[u8]) -> Result<Frame, BridgeError> {
        let mut f = Frame::default();
        f.parse(b)?;
        f.parse_fields()?;
        Ok(f)
    }

    pub fn command_string(&self) -> String {
        format!(
            "{} {} debug={}",
            self.command(),
            hex::encode(&self.payload()[1.min(self.payload().len())..]),
            hex::encode(self.bytes())
        )
    }

    pub fn response_string(&self) -> String {
        let kind = self
            .response_kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("{} {} debug={}", kind, self.fields, hex::encode(self.bytes()))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", hex::encode(self.bytes()))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.response_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{FLAG_REQUEST_BUSY, MdbResult};

    /// Append code byte and padding the way the bridge does.
    fn padded(frame: &[u8], code: u8, pad: u8, total: usize) -> Vec<u8> {
        let mut b = frame.to_vec();
        b.push(code);
        b.resize(total, pad);
        b
    }

    #[test]
    fn test_new_command_layout() {
        let f = Frame::new_command(Command::MdbTransactionSimple, &[0x30, 0x0b]).unwrap();
        let b = f.bytes();
        assert_eq!(b[0], FLAG_PAYLOAD | PROTOCOL_VERSION);
        assert_eq!(b[1], 3);
        assert_eq!(b[2], 0x08);
        assert_eq!(&b[3..5], &[0x30, 0x0b]);
        assert_eq!(b[5], crc8_p93(0, &b[1..5]));
        assert_eq!(b.len(), 6);
        assert_eq!(f.crc(), b[5]);
    }

    #[test]
    fn test_new_command_overflow() {
        assert!(matches!(
            Frame::new_command(Command::Debug, &[0u8; BUFFER_SIZE]),
            Err(BridgeError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn test_parse_reply() {
        let fields = [0x09, 0x01, 0x00, 0x0a, 0x01, 0x42];
        let wire = Frame::new_response(Response::Ok, &fields).unwrap();
        let b = padded(wire.bytes(), 0, PAD_OK, wire.bytes().len() + 12);
        let f = Frame::from_reply(&b).unwrap();
        assert_eq!(f.response_kind(), Some(Response::Ok));
        assert_eq!(f.fields.mdb_result, Some(MdbResult::Success));
        assert_eq!(f.fields.mdb_data, vec![0x42]);
        assert_eq!(f.bytes(), wire.bytes());
    }

    #[test]
    fn test_parse_reply_crc_equal_to_pad() {
        // Pad scan stops at the code byte even when the CRC equals the pad.
        let mut fields = vec![0x0a, 0x01, 0x00];
        let wire = loop {
            let f = Frame::new_response(Response::Ok, &fields).unwrap();
            if f.crc() == PAD_OK {
                break f;
            }
            fields[2] += 1;
        };
        let b = padded(wire.bytes(), 0, PAD_OK, wire.bytes().len() + 12);
        let f = Frame::from_reply(&b).unwrap();
        assert_eq!(f.fields.mdb_data, vec![fields[2]]);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(matches!(
            Frame::default().parse(&[0x84; 11]),
            Err(BridgeError::TooShort { min: 12, .. })
        ));
    }

    #[test]
    fn test_parse_crc_mismatch() {
        let wire = Frame::new_response(Response::Ok, &[0x05, 0x01]).unwrap();
        let mut b = padded(wire.bytes(), 0, PAD_OK, 20);
        b[3] ^= 0x10;
        assert!(matches!(
            Frame::default().parse(&b),
            Err(BridgeError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_version_mismatch() {
        let wire = Frame::new_response(Response::Ok, &[]).unwrap();
        let mut b = padded(wire.bytes(), 0, PAD_OK, 20);
        b[0] = FLAG_PAYLOAD | 3;
        assert!(matches!(
            Frame::default().parse(&b),
            Err(BridgeError::VersionMismatch { version: 3, .. })
        ));
    }

    #[test]
    fn test_parse_length_claim_too_large() {
        let mut b = vec![FLAG_PAYLOAD | PROTOCOL_VERSION, 9, 0x01, 0x00];
        b = padded(&b, 0, PAD_OK, 16);
        assert!(matches!(
            Frame::default().parse(&b),
            Err(BridgeError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn test_parse_length_beyond_buffer() {
        // Well formed frame whose payload does not fit the frame buffer.
        let plen = BUFFER_SIZE - FRAME_OVERHEAD + 8;
        let mut b = vec![FLAG_PAYLOAD | PROTOCOL_VERSION, plen as u8, 0x01];
        b.resize(2 + plen, 0x00);
        b.push(crc8_p93(0, &b[1..2 + plen]));
        let total = b.len() + 12;
        let b = padded(&b, 0, PAD_OK, total);
        assert!(matches!(
            Frame::default().parse(&b),
            Err(BridgeError::LengthOverflow { len, max })
                if len == plen && max == BUFFER_SIZE - FRAME_OVERHEAD
        ));
    }

    #[test]
    fn test_parse_payload_without_flag() {
        let wire = Frame::new_response(Response::Ok, &[]).unwrap();
        let mut b = padded(wire.bytes(), 0, PAD_OK, 20);
        b[0] = PROTOCOL_VERSION;
        assert!(matches!(
            Frame::default().parse(&b),
            Err(BridgeError::NoPayloadFlag { .. })
        ));
    }

    #[test]
    fn test_parse_empty_frame() {
        let mut header = vec![PROTOCOL_VERSION, 0x00];
        header.push(crc8_p93(0, &[0x00]));
        let b = padded(&header, 0, PAD_OK, 16);
        let mut f = Frame::default();
        f.parse(&b).unwrap();
        assert_eq!(f.plen(), 0);
        assert_eq!(f.response_kind(), None);
        f.parse_fields().unwrap();
    }

    #[test]
    fn test_parse_unexpected_response_kind() {
        let wire = Frame::build(0x7f, &[]).unwrap();
        let b = padded(wire.bytes(), 0, PAD_OK, 20);
        let mut f = Frame::default();
        f.parse(&b).unwrap();
        assert!(matches!(
            f.parse_fields(),
            Err(BridgeError::UnexpectedResponse { kind: Some(0x7f), .. })
        ));
    }

    #[test]
    fn test_padding_ok_and_error() {
        let ok = parse_padding(&[0x01, 0x00, PAD_OK, PAD_OK, PAD_OK, PAD_OK], true).unwrap();
        assert_eq!(ok, Padding { start: 2, code: None });

        let b = [0x01, 0x08, PAD_ERROR, PAD_ERROR, PAD_ERROR, PAD_ERROR];
        let err = parse_padding(&b, false).unwrap();
        assert_eq!(err.code, Some(Errcode::RequestOverwrite));
        assert_eq!(err.start, 2);
        assert!(matches!(
            parse_padding(&b, true),
            Err(BridgeError::Remote {
                code: Errcode::RequestOverwrite,
                ..
            })
        ));
    }

    #[test]
    fn test_padding_invalid() {
        // Error pad with zero code
        let b = [0x01, 0x00, PAD_ERROR, PAD_ERROR, PAD_ERROR, PAD_ERROR];
        assert!(matches!(
            parse_padding(&b, false),
            Err(BridgeError::InvalidPadding { .. })
        ));
        // Mixed tail
        let b = [0x01, 0x00, PAD_OK, PAD_OK, PAD_ERROR, PAD_OK];
        assert!(matches!(
            parse_padding(&b, false),
            Err(BridgeError::InvalidPadding { .. })
        ));
        // Unknown pad value
        let b = [0x01, 0x00, 0x55, 0x55, 0x55, 0x55];
        assert!(matches!(
            parse_padding(&b, false),
            Err(BridgeError::InvalidPadding { .. })
        ));
    }

    #[test]
    fn test_parse_header() {
        let (flag, version, len) = parse_header(&[FLAG_REQUEST_BUSY | PROTOCOL_VERSION, 7]).unwrap();
        assert_eq!(flag, FLAG_REQUEST_BUSY);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(len, 7);
        assert!(parse_header(&[0x05, 0]).is_err());
    }

    #[test]
    fn test_display() {
        let wire = Frame::new_response(Response::Reset, &[0x05, 0x01]).unwrap();
        let b = padded(wire.bytes(), 0, PAD_OK, 20);
        let f = Frame::from_reply(&b).unwrap();
        assert!(f.to_string().starts_with("RESET reset=+PO debug="));
    }
}
