//! CRC-8 with polynomial 0x93, MSB first, as computed by the bridge firmware.

const POLY: u8 = 0x93;

const fn table() -> [u8; 256] {
    let mut t = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        t[i] = crc8_p93_reference(0, i as u8);
        i += 1;
    }
    t
}

static TABLE: [u8; 256] = table();

/// Bit-by-bit reference implementation.
pub const fn crc8_p93_reference(init: u8, data: u8) -> u8 {
    let mut crc = init ^ data;
    let mut bit = 0;
    while bit < 8 {
        crc = if crc & 0x80 != 0 {
            (crc << 1) ^ POLY
        } else {
            crc << 1
        };
        bit += 1;
    }
    crc
}

pub fn crc8_p93_next(crc: u8, data: u8) -> u8 {
    TABLE[(crc ^ data) as usize]
}

pub fn crc8_p93(init: u8, data: &[u8]) -> u8 {
    data.iter().fold(init, |crc, &b| crc8_p93_next(crc, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(crc8_p93(0, &[]), 0);
        assert_eq!(crc8_p93(0, &[0x00]), 0);
        assert_eq!(crc8_p93(0, &[0x01]), 0x93);
    }

    #[test]
    fn test_table_matches_reference() {
        for init in [0u8, 0x5a, 0xff] {
            for b in 0..=255u8 {
                assert_eq!(crc8_p93_next(init, b), crc8_p93_reference(init, b));
            }
        }
    }

    #[test]
    fn test_detects_single_bit_flip() {
        let data = [0x02, 0x08, 0x30, 0x0b];
        let good = crc8_p93(0, &data);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut d = data;
                d[i] ^= 1 << bit;
                assert_ne!(crc8_p93(0, &d), good);
            }
        }
    }
}
