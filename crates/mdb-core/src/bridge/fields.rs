//! Tagged field records inside a bridge response payload.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use super::BridgeError;
use super::protocol::{Errcode, Field, MdbResult, mcusr_string, reset_flag};

/// Decoded response fields. Singletons hold the last value seen; error
/// records accumulate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    pub error_ns: Vec<Vec<u8>>,
    pub error2s: Vec<u16>,
    pub mdb_data: Vec<u8>,
    pub twi_data: Vec<u8>,
    /// Microseconds.
    pub clock10u: u32,
    /// Microseconds.
    pub mdb_duration: u32,
    pub firmware_version: u16,
    pub mcusr: u8,
    pub mdb_result: Option<MdbResult>,
    pub mdb_error: u8,
    pub twi_addr: u8,
    tag_order: Vec<Field>,
}

fn take<'a>(b: &'a [u8], n: usize, tag: Field) -> Result<&'a [u8], BridgeError> {
    b.get(..n).ok_or(BridgeError::FieldTruncated {
        tag,
        need: n,
        have: b.len(),
    })
}

fn take_counted<'a>(b: &'a [u8], tag: Field) -> Result<(&'a [u8], usize), BridgeError> {
    let n = take(b, 1, tag)?[0] as usize;
    let data = take(&b[1..], n, tag)?;
    Ok((data, 1 + n))
}

impl Fields {
    /// Parse a sequence of tagged records. An unknown tag is an error.
    pub fn parse(b: &[u8]) -> Result<Fields, BridgeError> {
        let mut f = Fields::default();
        let mut at = 0;
        while at < b.len() {
            let tag = Field::from(b[at]);
            let first_record = match tag {
                Field::Error2 => f.error2s.is_empty(),
                Field::ErrorN => f.error_ns.is_empty(),
                _ => true,
            };
            let used = f.parse_next(tag, &b[at + 1..]).map_err(|e| match e {
                BridgeError::UnknownField { .. } => BridgeError::UnknownField {
                    tag: u8::from(tag),
                    data: hex::encode(b),
                    at,
                },
                other => other,
            })?;
            if first_record {
                f.tag_order.push(tag);
            }
            at += 1 + used;
        }
        Ok(f)
    }

    /// Consumes one record's argument bytes, returns how many.
    fn parse_next(&mut self, tag: Field, arg: &[u8]) -> Result<usize, BridgeError> {
        match tag {
            Field::Error2 => {
                self.error2s.push(BigEndian::read_u16(take(arg, 2, tag)?));
                Ok(2)
            }
            Field::ErrorN => {
                let (data, used) = take_counted(arg, tag)?;
                self.error_ns.push(data.to_vec());
                Ok(used)
            }
            Field::FirmwareVersion => {
                self.firmware_version = BigEndian::read_u16(take(arg, 2, tag)?);
                Ok(2)
            }
            Field::Mcusr => {
                self.mcusr = take(arg, 1, tag)?[0];
                Ok(1)
            }
            Field::MdbResult => {
                let b = take(arg, 2, tag)?;
                self.mdb_result = Some(MdbResult::from(b[0]));
                self.mdb_error = b[1];
                Ok(2)
            }
            Field::MdbData => {
                let (data, used) = take_counted(arg, tag)?;
                self.mdb_data = data.to_vec();
                Ok(used)
            }
            Field::MdbDuration10u => {
                self.mdb_duration = u32::from(BigEndian::read_u16(take(arg, 2, tag)?)) * 10;
                Ok(2)
            }
            Field::TwiData => {
                let (data, used) = take_counted(arg, tag)?;
                self.twi_data = data.to_vec();
                Ok(used)
            }
            Field::TwiAddr => {
                self.twi_addr = take(arg, 1, tag)?[0];
                Ok(1)
            }
            Field::Clock10u => {
                self.clock10u = u32::from(BigEndian::read_u16(take(arg, 2, tag)?)) * 10;
                Ok(2)
            }
            _ => Err(BridgeError::UnknownField {
                tag: u8::from(tag),
                data: String::new(),
                at: 0,
            }),
        }
    }

    /// Tags in first-seen order.
    pub fn tag_order(&self) -> &[Field] {
        &self.tag_order
    }

    pub fn has(&self, tag: Field) -> bool {
        self.tag_order.contains(&tag)
    }

    pub fn is_watchdog_reset(&self) -> bool {
        self.mcusr & reset_flag::WATCHDOG != 0
    }

    fn fmt_field(&self, f: &mut fmt::Formatter<'_>, tag: Field) -> fmt::Result {
        match tag {
            Field::FirmwareVersion => write!(f, "firmware={:04x}", self.firmware_version),
            Field::Error2 => {
                let es: Vec<String> = self
                    .error2s
                    .iter()
                    .map(|&e| format!("{}:{:02x}", Errcode::from((e >> 8) as u8), e & 0xff))
                    .collect();
                write!(f, "error2={}", es.join("|"))
            }
            Field::ErrorN => {
                let es: Vec<String> = self.error_ns.iter().map(hex::encode).collect();
                write!(f, "errorn={}", es.join("|"))
            }
            Field::Mcusr => write!(f, "reset={}", mcusr_string(self.mcusr)),
            Field::MdbResult => match self.mdb_result {
                Some(r) => write!(f, "mdb_result={}:{:02x}", r, self.mdb_error),
                None => write!(f, "mdb_result=?"),
            },
            Field::MdbData => write!(f, "mdb_data={}", hex::encode(&self.mdb_data)),
            Field::MdbDuration10u => write!(f, "mdb_duration={}us", self.mdb_duration),
            Field::TwiData => write!(f, "twi_data={}", hex::encode(&self.twi_data)),
            Field::TwiAddr => write!(f, "twi_addr={}", self.twi_addr),
            Field::Clock10u => write!(f, "clock10u={}us", self.clock10u),
            other => write!(f, "!ERROR:invalid-tag:{:02x}", u8::from(other)),
        }
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &tag) in self.tag_order.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            self.fmt_field(f, tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mdb_transaction_result() {
        // MDB_RESULT=SUCCESS:00, MDB_DATA=0a0b, MDB_DURATION=0x0102*10
        let b = [0x09, 0x01, 0x00, 0x0a, 0x02, 0x0a, 0x0b, 0x0b, 0x01, 0x02];
        let f = Fields::parse(&b).unwrap();
        assert_eq!(f.mdb_result, Some(MdbResult::Success));
        assert_eq!(f.mdb_error, 0);
        assert_eq!(f.mdb_data, vec![0x0a, 0x0b]);
        assert_eq!(f.mdb_duration, 2580);
        assert_eq!(
            f.tag_order(),
            &[Field::MdbResult, Field::MdbData, Field::MdbDuration10u]
        );
        assert_eq!(
            f.to_string(),
            "mdb_result=SUCCESS:00,mdb_data=0a0b,mdb_duration=2580us"
        );
    }

    #[test]
    fn test_error_records_accumulate() {
        let b = [
            0x04, 0x08, 0x01, // ERROR2 REQUEST_OVERWRITE:01
            0x02, 0x01, 0x02, // FIRMWARE_VERSION
            0x04, 0x03, 0x07, // ERROR2 INVALID_CRC:07
            0x03, 0x02, 0xaa, 0xbb, // ERRORN aabb
            0x03, 0x00, // ERRORN empty
        ];
        let f = Fields::parse(&b).unwrap();
        assert_eq!(f.error2s, vec![0x0801, 0x0307]);
        assert_eq!(f.error_ns, vec![vec![0xaa, 0xbb], vec![]]);
        assert_eq!(f.firmware_version, 0x0102);
        assert_eq!(
            f.tag_order(),
            &[Field::Error2, Field::FirmwareVersion, Field::ErrorN]
        );
        assert_eq!(
            f.to_string(),
            "error2=REQUEST_OVERWRITE:01|INVALID_CRC:07,firmware=0102,errorn=aabb|"
        );
    }

    #[test]
    fn test_twi_and_clock() {
        let b = [0x07, 0x78, 0x08, 0x02, 0x00, 0x41, 0x06, 0x00, 0x05];
        let f = Fields::parse(&b).unwrap();
        assert_eq!(f.twi_addr, 0x78);
        assert_eq!(f.twi_data, vec![0x00, 0x41]);
        assert_eq!(f.clock10u, 50);
    }

    #[test]
    fn test_unknown_tag_fails() {
        let err = Fields::parse(&[0x05, 0x01, 0x42, 0x00]).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownField { tag: 0x42, at: 2, .. }));
    }

    #[test]
    fn test_truncated_field_fails() {
        assert!(matches!(
            Fields::parse(&[0x0a, 0x05, 0x01]),
            Err(BridgeError::FieldTruncated { .. })
        ));
        assert!(matches!(
            Fields::parse(&[0x02, 0x01]),
            Err(BridgeError::FieldTruncated { .. })
        ));
    }

    #[test]
    fn test_watchdog_flag() {
        let f = Fields::parse(&[0x05, reset_flag::WATCHDOG | reset_flag::POWER_ON]).unwrap();
        assert!(f.is_watchdog_reset());
        assert_eq!(f.to_string(), "reset=+PO+WD(PROBLEM)");
        assert!(!Fields::parse(&[0x05, reset_flag::EXTERNAL]).unwrap().is_watchdog_reset());
    }

    #[test]
    fn test_empty() {
        let f = Fields::parse(&[]).unwrap();
        assert_eq!(f, Fields::default());
        assert_eq!(f.to_string(), "");
    }
}
