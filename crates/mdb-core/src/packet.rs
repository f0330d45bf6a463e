//! MDB packet: a bounded byte buffer holding one command or response.
//!
//! Packets are small `Copy` values. Shared wire constants (`ACK`, `NAK`,
//! `RET`, `EMPTY`) are built at compile time and marked readonly, so any
//! attempt to write into a copy of them fails.

use std::fmt;
use std::io::{self, Read};

use byteorder::ReadBytesExt;
use thiserror::Error;

/// Maximum MDB block length.
pub const PACKET_MAX_LENGTH: usize = 40;

/// First byte of the reserved terminator sequence on the marked wire.
const WIRE_MARK: u8 = 0xff;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("mdb: operation larger than max packet size ({len} > {PACKET_MAX_LENGTH})")]
    Overflow { len: usize },

    #[error("mdb: packet is readonly")]
    Readonly,

    #[error("mdb: invalid hex {input:?}: {message}")]
    InvalidHex { input: String, message: String },

    #[error("mdb wire: unknown sequence ff {0:02x}")]
    InvalidWire(u8),

    #[error("mdb wire: {0}")]
    WireIo(String),

    #[error("Invalid checksum received={received:02x} actual={actual:02x}")]
    InvalidChecksum { received: u8, actual: u8 },
}

/// Sum of all bytes modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[derive(Clone, Copy)]
pub struct Packet {
    buf: [u8; PACKET_MAX_LENGTH],
    len: u8,
    readonly: bool,
}

impl Packet {
    pub const EMPTY: Packet = Packet::single(None);
    pub const ACK: Packet = Packet::single(Some(0x00));
    pub const NAK: Packet = Packet::single(Some(0xff));
    pub const RET: Packet = Packet::single(Some(0xaa));

    const fn single(byte: Option<u8>) -> Self {
        let mut buf = [0u8; PACKET_MAX_LENGTH];
        let len = match byte {
            Some(b) => {
                buf[0] = b;
                1
            }
            None => 0,
        };
        Self {
            buf,
            len,
            readonly: true,
        }
    }

    /// Empty writable packet, typically used as a response buffer.
    pub const fn new() -> Self {
        Self {
            buf: [0u8; PACKET_MAX_LENGTH],
            len: 0,
            readonly: false,
        }
    }

    pub fn from_bytes(bytes: &[u8], readonly: bool) -> Result<Self, PacketError> {
        let mut p = Self::new();
        p.write(bytes)?;
        p.readonly = readonly;
        Ok(p)
    }

    /// For literals known at compile time only. Panics on overflow.
    pub fn must_from_bytes(bytes: &[u8], readonly: bool) -> Self {
        match Self::from_bytes(bytes, readonly) {
            Ok(p) => p,
            Err(e) => panic!("code error Packet::must_from_bytes {bytes:02x?}: {e}"),
        }
    }

    pub fn from_hex(s: &str, readonly: bool) -> Result<Self, PacketError> {
        let bytes = hex::decode(s).map_err(|e| PacketError::InvalidHex {
            input: s.to_string(),
            message: e.to_string(),
        })?;
        Self::from_bytes(&bytes, readonly)
    }

    /// For literals known at compile time only. Panics on malformed hex.
    pub fn must_from_hex(s: &str, readonly: bool) -> Self {
        match Self::from_hex(s, readonly) {
            Ok(p) => p,
            Err(e) => panic!("code error Packet::must_from_hex {s:?}: {e}"),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub const fn capacity(&self) -> usize {
        PACKET_MAX_LENGTH
    }

    /// Replace content. An empty input is a no-op.
    /// On error the existing content is left unchanged.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, PacketError> {
        if self.readonly {
            return Err(PacketError::Readonly);
        }
        if bytes.is_empty() {
            return Ok(0);
        }
        if bytes.len() > PACKET_MAX_LENGTH {
            return Err(PacketError::Overflow { len: bytes.len() });
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len() as u8;
        Ok(bytes.len())
    }

    /// Drop content, keeping the buffer writable.
    pub fn clear(&mut self) -> Result<(), PacketError> {
        if self.readonly {
            return Err(PacketError::Readonly);
        }
        self.len = 0;
        Ok(())
    }

    /// Hex text split into groups of 4 bytes, e.g. `0a0b0c0d 0e`.
    pub fn format(&self) -> String {
        let h = hex::encode(self.as_bytes());
        h.as_bytes()
            .chunks(8)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Canonical MDB wire encoding.
    ///
    /// With `ff_dance`, every payload `ff` is doubled and the block is
    /// terminated with `ff 00`. The trailing checksum always covers the
    /// original, unstuffed payload.
    pub fn wire(&self, ff_dance: bool) -> Vec<u8> {
        let mut w = Vec::with_capacity((self.len() + 2) * 2);
        for &b in self.as_bytes() {
            if ff_dance && b == WIRE_MARK {
                w.push(WIRE_MARK);
            }
            w.push(b);
        }
        if ff_dance {
            w.extend_from_slice(&[WIRE_MARK, 0x00]);
        }
        w.push(checksum(self.as_bytes()));
        w
    }

    /// Decode one `wire(true)` block from `src`.
    ///
    /// Returns the unstuffed payload and the checksum byte as received.
    /// The checksum is not validated here; see [`Packet::validate_checksum`].
    pub fn read_wire<R: Read>(src: &mut R) -> Result<(Packet, u8), PacketError> {
        let mut p = Packet::new();
        let mut n = 0usize;
        let mut push = |p: &mut Packet, b: u8| -> Result<(), PacketError> {
            if n >= PACKET_MAX_LENGTH {
                return Err(PacketError::Overflow { len: n + 1 });
            }
            p.buf[n] = b;
            n += 1;
            p.len = n as u8;
            Ok(())
        };
        loop {
            let b = src.read_u8().map_err(wire_io)?;
            if b != WIRE_MARK {
                push(&mut p, b)?;
                continue;
            }
            match src.read_u8().map_err(wire_io)? {
                0x00 => {
                    let chk = src.read_u8().map_err(wire_io)?;
                    return Ok((p, chk));
                }
                WIRE_MARK => push(&mut p, WIRE_MARK)?,
                other => return Err(PacketError::InvalidWire(other)),
            }
        }
    }

    pub fn validate_checksum(&self, received: u8) -> Result<(), PacketError> {
        let actual = checksum(self.as_bytes());
        if actual != received {
            return Err(PacketError::InvalidChecksum { received, actual });
        }
        Ok(())
    }
}

fn wire_io(e: io::Error) -> PacketError {
    PacketError::WireIo(e.to_string())
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({}", hex::encode(self.as_bytes()))?;
        if self.readonly {
            write!(f, " ro")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip_up_to_capacity() {
        for len in 0..=PACKET_MAX_LENGTH {
            let input: Vec<u8> = (0..len as u8).map(|i| i.wrapping_mul(37)).collect();
            let p = Packet::from_bytes(&input, false).unwrap();
            assert_eq!(p.as_bytes(), &input[..]);
            assert_eq!(p.len(), len);
        }
    }

    #[test]
    fn test_overflow_leaves_content() {
        let mut p = Packet::from_hex("0a0b", false).unwrap();
        let err = p.write(&[0u8; PACKET_MAX_LENGTH + 1]).unwrap_err();
        assert_eq!(err, PacketError::Overflow { len: 41 });
        assert_eq!(p.as_bytes(), &[0x0a, 0x0b]);

        assert!(matches!(
            Packet::from_bytes(&[1u8; 41], false),
            Err(PacketError::Overflow { .. })
        ));
    }

    #[test]
    fn test_readonly_write_fails() {
        let mut p = Packet::from_hex("30", true).unwrap();
        assert_eq!(p.write(&[0x31]), Err(PacketError::Readonly));
        assert_eq!(p.clear(), Err(PacketError::Readonly));
        assert_eq!(p.as_bytes(), &[0x30]);

        let mut ack = Packet::ACK;
        assert_eq!(ack.write(&[0x01]), Err(PacketError::Readonly));
        assert_eq!(ack.as_bytes(), &[0x00]);
    }

    #[test]
    fn test_constants() {
        assert!(Packet::EMPTY.is_empty());
        assert_eq!(Packet::NAK.as_bytes(), &[0xff]);
        assert_eq!(Packet::RET.as_bytes(), &[0xaa]);
        assert!(Packet::ACK.is_readonly());
    }

    #[test]
    fn test_invalid_hex() {
        assert!(matches!(
            Packet::from_hex("0g", false),
            Err(PacketError::InvalidHex { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "code error")]
    fn test_must_from_hex_panics() {
        Packet::must_from_hex("zz", true);
    }

    #[test]
    fn test_format_groups() {
        let p = Packet::must_from_hex("0102030405060708090a", true);
        assert_eq!(p.format(), "01020304 05060708 090a");
    }

    #[test]
    fn test_wire_plain() {
        let p = Packet::must_from_hex("0b", true);
        assert_eq!(p.wire(false), vec![0x0b, 0x0b]);
    }

    #[test]
    fn test_wire_ff_dance() {
        let p = Packet::must_from_hex("01ff02", true);
        let w = p.wire(true);
        // checksum over 01 ff 02 = 0x102 -> 0x02
        assert_eq!(w, vec![0x01, 0xff, 0xff, 0x02, 0xff, 0x00, 0x02]);
        assert_eq!(*w.last().unwrap(), checksum(&[0x01, 0xff, 0x02]));
    }

    #[test]
    fn test_read_wire_unstuffs() {
        let raw = [0x01, 0xff, 0xff, 0x02, 0xff, 0x00, 0x02, 0x99];
        let mut src = &raw[..];
        let (p, chk) = Packet::read_wire(&mut src).unwrap();
        assert_eq!(p.as_bytes(), &[0x01, 0xff, 0x02]);
        assert_eq!(chk, 0x02);
        p.validate_checksum(chk).unwrap();
        // trailing byte is left for the next read
        assert_eq!(src, &[0x99]);
    }

    #[test]
    fn test_read_wire_errors() {
        let mut bad_seq = &[0x01, 0xff, 0x07][..];
        assert_eq!(
            Packet::read_wire(&mut bad_seq).unwrap_err(),
            PacketError::InvalidWire(0x07)
        );

        let mut truncated = &[0x01, 0x02][..];
        assert!(matches!(
            Packet::read_wire(&mut truncated),
            Err(PacketError::WireIo(_))
        ));

        let (p, chk) = Packet::read_wire(&mut &[0x05, 0xff, 0x00, 0x06][..]).unwrap();
        assert_eq!(
            p.validate_checksum(chk),
            Err(PacketError::InvalidChecksum {
                received: 0x06,
                actual: 0x05
            })
        );
    }
}
