//! Frame Information CHannel codec.
//!
//! The FICH carries 31 bits of per-frame control data. On the air it is
//! protected by a CRC-16 and Golay(24,12) block coding with each codeword
//! transmitted twice, filling the 200-bit region after the frame sync.

use crate::bits;
use crate::fec::{crc16_ccitt, golay_24_12_decode, golay_24_12_encode};
use crate::ysf::{DT_DATA_FR_MODE, FICH_LENGTH, SYNC_LENGTH};

/// Decoded FICH fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fich {
    /// Frame Information: header, communications or terminator
    pub fi: u8,
    /// Callsign type
    pub cs: u8,
    /// Call mode
    pub cm: u8,
    /// Block number within a multi-block data transfer
    pub block_number: u8,
    /// Announced total number of additional blocks
    pub block_total: u8,
    /// Frame number within the block
    pub frame_number: u8,
    /// Announced frame total (3-bit capacity selector)
    pub frame_total: u8,
    /// Deviation flag
    pub dev: u8,
    /// Message routing
    pub mr: u8,
    /// Squelch control flag
    pub sql: bool,
    /// Squelch code
    pub sq: u8,
    /// VoIP path flag
    pub voip: bool,
    /// Data type
    pub dt: u8,
}

impl Default for Fich {
    fn default() -> Self {
        Self {
            fi: 0,
            cs: 2,
            cm: 0,
            block_number: 0,
            block_total: 0,
            frame_number: 0,
            frame_total: 1,
            dev: 0,
            mr: 2,
            sql: false,
            sq: 0,
            voip: false,
            dt: DT_DATA_FR_MODE,
        }
    }
}

impl Fich {
    /// Pack the fields into the raw 4-byte control word.
    pub fn to_bytes(&self) -> [u8; 4] {
        let mut raw = [0u8; 4];
        let mut off = 0;
        for (value, width) in [
            (self.fi as u32, 2),
            (self.cs as u32, 2),
            (self.cm as u32, 2),
            (self.block_number as u32, 2),
            (self.block_total as u32, 2),
            (self.frame_number as u32, 3),
            (self.frame_total as u32, 3),
            (self.dev as u32, 1),
            (self.mr as u32, 3),
            (self.sql as u32, 1),
            (self.sq as u32, 7),
            (self.voip as u32, 1),
            (self.dt as u32, 2),
        ] {
            bits::insert(&mut raw, off, width, value);
            off += width;
        }
        raw
    }

    /// Unpack the raw 4-byte control word.
    pub fn from_bytes(raw: &[u8; 4]) -> Self {
        let mut off = 0;
        let mut field = |width: usize| {
            let v = bits::extract(raw, off, width);
            off += width;
            v
        };
        Self {
            fi: field(2) as u8,
            cs: field(2) as u8,
            cm: field(2) as u8,
            block_number: field(2) as u8,
            block_total: field(2) as u8,
            frame_number: field(3) as u8,
            frame_total: field(3) as u8,
            dev: field(1) as u8,
            mr: field(3) as u8,
            sql: field(1) != 0,
            sq: field(7) as u8,
            voip: field(1) != 0,
            dt: field(2) as u8,
        }
    }

    /// Encode into the protected FICH region of an air frame.
    pub fn encode(&self, region: &mut [u8]) {
        let raw = self.to_bytes();
        let crc = crc16_ccitt(&raw);
        let mut block = [0u8; 6];
        block[..4].copy_from_slice(&raw);
        block[4..6].copy_from_slice(&crc.to_be_bytes());

        let area = &mut region[SYNC_LENGTH..SYNC_LENGTH + FICH_LENGTH];
        area.fill(0);
        for k in 0..4 {
            let chunk = bits::extract(&block, k * 12, 12) as u16;
            let codeword = golay_24_12_encode(chunk);
            bits::insert(area, k * 48, 24, codeword);
            bits::insert(area, k * 48 + 24, 24, codeword);
        }
    }

    /// Decode the protected FICH region of an air frame.
    ///
    /// Returns `None` on Golay or CRC damage; the caller drops the frame.
    pub fn decode(region: &[u8]) -> Option<Self> {
        if region.len() < SYNC_LENGTH + FICH_LENGTH {
            return None;
        }
        let area = &region[SYNC_LENGTH..SYNC_LENGTH + FICH_LENGTH];
        let mut block = [0u8; 6];
        for k in 0..4 {
            let first = bits::extract(area, k * 48, 24);
            let second = bits::extract(area, k * 48 + 24, 24);
            let chunk = golay_24_12_decode(first).or_else(|| golay_24_12_decode(second))?;
            bits::insert(&mut block, k * 12, 12, chunk as u32);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&block[..4]);
        let crc = u16::from_be_bytes([block[4], block[5]]);
        if crc16_ccitt(&raw) != crc {
            return None;
        }
        Some(Self::from_bytes(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ysf::{FI_COMMUNICATIONS, REGION_LENGTH};

    #[test]
    fn test_raw_word_roundtrip() {
        let fich = Fich {
            fi: FI_COMMUNICATIONS,
            block_number: 1,
            block_total: 2,
            frame_number: 5,
            frame_total: 7,
            sq: 0x55,
            voip: true,
            ..Fich::default()
        };
        assert_eq!(Fich::from_bytes(&fich.to_bytes()), fich);
    }

    #[test]
    fn test_region_roundtrip() {
        let mut region = [0u8; REGION_LENGTH];
        let fich = Fich { fi: FI_COMMUNICATIONS, frame_number: 3, ..Fich::default() };
        fich.encode(&mut region);
        assert_eq!(Fich::decode(&region), Some(fich));
    }

    #[test]
    fn test_damage_rejected() {
        let mut region = [0u8; REGION_LENGTH];
        Fich::default().encode(&mut region);
        // Damage both copies of the first codeword
        region[SYNC_LENGTH] ^= 0xFF;
        region[SYNC_LENGTH + 3] ^= 0xFF;
        assert_eq!(Fich::decode(&region), None);
    }
}
