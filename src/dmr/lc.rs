//! Link Control, EMB, slot type and sync insertion for outbound bursts.
//!
//! The burst geometry: 264 bits, with the centre 48 bits (bit 108..156)
//! holding either the frame sync or the EMB + embedded-LC signalling, the
//! slot type straddling the sync at bits 98..108 and 156..166, and the
//! vocoder/payload bits around them.

use crate::bits;
use crate::dmr::{Flco, DT_TERMINATOR_WITH_LC, DT_VOICE_LC_HEADER};
use crate::fec::{crc16_ccitt, crc8, golay_24_12_encode};

/// Voice Link Control: who is calling whom, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lc {
    pub flco: Flco,
    pub src_id: u32,
    pub dst_id: u32,
}

impl Lc {
    pub fn new(flco: Flco, src_id: u32, dst_id: u32) -> Self {
        Self { flco, src_id, dst_id }
    }

    /// The 9-byte on-air LC body.
    pub fn bytes(&self) -> [u8; 9] {
        let mut out = [0u8; 9];
        out[0] = match self.flco {
            Flco::Group => 0x00,
            Flco::UserUser => 0x03,
        };
        out[3..6].copy_from_slice(&self.dst_id.to_be_bytes()[1..4]);
        out[6..9].copy_from_slice(&self.src_id.to_be_bytes()[1..4]);
        out
    }

    pub fn from_bytes(raw: &[u8; 9]) -> Self {
        let flco = if raw[0] & 0x3F == 0x03 { Flco::UserUser } else { Flco::Group };
        let dst_id = u32::from_be_bytes([0, raw[3], raw[4], raw[5]]);
        let src_id = u32::from_be_bytes([0, raw[6], raw[7], raw[8]]);
        Self { flco, src_id, dst_id }
    }
}

// Full LC placement: six bytes ahead of the slot-type/sync block, the
// remainder plus CRC behind it.
const FULL_LC_FIRST: usize = 0;
const FULL_LC_SECOND: usize = 21;

fn full_lc_mask(data_type: u8) -> u16 {
    match data_type {
        DT_VOICE_LC_HEADER => 0x9696,
        DT_TERMINATOR_WITH_LC => 0x9999,
        _ => 0x0000,
    }
}

/// Write the full LC of a header or terminator burst.
pub fn full_lc_encode(lc: &Lc, frame: &mut [u8], data_type: u8) {
    let body = lc.bytes();
    let crc = crc16_ccitt(&body) ^ full_lc_mask(data_type);
    frame[FULL_LC_FIRST..FULL_LC_FIRST + 6].copy_from_slice(&body[..6]);
    frame[FULL_LC_SECOND..FULL_LC_SECOND + 3].copy_from_slice(&body[6..9]);
    frame[FULL_LC_SECOND + 3..FULL_LC_SECOND + 5].copy_from_slice(&crc.to_be_bytes());
}

/// Recover the full LC of a header or terminator burst.
pub fn full_lc_decode(frame: &[u8], data_type: u8) -> Option<Lc> {
    let mut body = [0u8; 9];
    body[..6].copy_from_slice(&frame[FULL_LC_FIRST..FULL_LC_FIRST + 6]);
    body[6..9].copy_from_slice(&frame[FULL_LC_SECOND..FULL_LC_SECOND + 3]);
    let crc = u16::from_be_bytes([frame[FULL_LC_SECOND + 3], frame[FULL_LC_SECOND + 4]]);
    if crc16_ccitt(&body) ^ full_lc_mask(data_type) != crc {
        return None;
    }
    Some(Lc::from_bytes(&body))
}

// Sync overlays cover bytes 13..20 with the outer nibbles masked off.
const SYNC_MASK: [u8; 7] = [0xF0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0F];
const MS_DATA_SYNC: [u8; 7] = [0x0D, 0x5D, 0x7F, 0x77, 0xFD, 0x75, 0x70];
const MS_VOICE_SYNC: [u8; 7] = [0x07, 0xF7, 0xD5, 0xDD, 0x57, 0xDF, 0xD0];
const BS_DATA_SYNC: [u8; 7] = [0x0D, 0xFF, 0x57, 0xD7, 0x5D, 0xF5, 0xD0];
const BS_VOICE_SYNC: [u8; 7] = [0x07, 0x55, 0xFD, 0x7D, 0xF7, 0x5F, 0x70];

fn add_sync(frame: &mut [u8], pattern: &[u8; 7]) {
    for i in 0..7 {
        frame[13 + i] = (frame[13 + i] & SYNC_MASK[i]) | pattern[i];
    }
}

/// Insert the data sync pattern (header, terminator, CSBK bursts).
pub fn add_data_sync(frame: &mut [u8], base_station: bool) {
    add_sync(frame, if base_station { &BS_DATA_SYNC } else { &MS_DATA_SYNC });
}

/// Insert the voice sync pattern (superframe position 0).
pub fn add_voice_sync(frame: &mut [u8], base_station: bool) {
    add_sync(frame, if base_station { &BS_VOICE_SYNC } else { &MS_VOICE_SYNC });
}

/// Slot type: colour code and data type, Golay-protected, straddling the
/// sync at bits 98..108 and 156..166.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotType {
    pub color_code: u8,
    pub data_type: u8,
}

impl SlotType {
    pub fn new(color_code: u8, data_type: u8) -> Self {
        Self { color_code, data_type }
    }

    fn codeword(&self) -> u32 {
        let value = (((self.color_code & 0x0F) as u16) << 4) | (self.data_type & 0x0F) as u16;
        let parity = golay_24_12_encode(value) & 0xFFF;
        ((value as u32) << 12) | parity
    }

    pub fn encode(&self, frame: &mut [u8]) {
        let cw = self.codeword();
        bits::insert(frame, 98, 10, cw >> 10);
        bits::insert(frame, 156, 10, cw & 0x3FF);
    }

    pub fn decode(frame: &[u8]) -> Option<Self> {
        let cw = (bits::extract(frame, 98, 10) << 10) | bits::extract(frame, 156, 10);
        let value = ((cw >> 12) & 0xFF) as u16;
        if (golay_24_12_encode(value) & 0xFFF) != cw & 0xFFF {
            return None;
        }
        Some(Self { color_code: ((value >> 4) & 0x0F) as u8, data_type: (value & 0x0F) as u8 })
    }
}

const EMB_POLY: u16 = 0x2B9;

fn emb_parity(value: u16) -> u16 {
    let mut v = (value as u32) << 9;
    for i in (9..16).rev() {
        if v & (1 << i) != 0 {
            v ^= (EMB_POLY as u32) << (i - 9);
        }
    }
    (v & 0x1FF) as u16
}

/// EMB field written around the embedded LC in non-sync voice bursts.
#[derive(Debug, Clone, Copy)]
pub struct Emb {
    pub color_code: u8,
    pub lcss: u8,
}

impl Emb {
    pub fn encode(&self, frame: &mut [u8]) {
        let value = (((self.color_code & 0x0F) as u16) << 3) | (self.lcss & 0x03) as u16;
        let word = (value << 9) | emb_parity(value);
        bits::insert(frame, 108, 8, (word >> 8) as u32);
        bits::insert(frame, 148, 8, (word & 0xFF) as u32);
    }
}

/// Embedded LC generator: fragments the LC over the voice superframe.
#[derive(Debug, Default)]
pub struct EmbeddedLc {
    fragments: [[u8; 4]; 4],
}

impl EmbeddedLc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the LC to be fragmented over the next superframes.
    pub fn set_lc(&mut self, lc: &Lc) {
        let body = lc.bytes();
        let mut padded = [0u8; 16];
        padded[..9].copy_from_slice(&body);
        padded[9] = crc8(&body);
        for (i, fragment) in self.fragments.iter_mut().enumerate() {
            fragment.copy_from_slice(&padded[i * 4..i * 4 + 4]);
        }
    }

    /// Insert the embedded signalling for superframe position `n` (1..=5)
    /// and return the LCSS code written.
    pub fn get_data(&self, frame: &mut [u8], n: u8) -> u8 {
        let (fragment, lcss) = match n {
            1 => (Some(&self.fragments[0]), 1),
            2 => (Some(&self.fragments[1]), 3),
            3 => (Some(&self.fragments[2]), 3),
            4 => (Some(&self.fragments[3]), 2),
            _ => (None, 0),
        };
        let empty = [0u8; 4];
        let bytes = fragment.unwrap_or(&empty);
        bits::insert(frame, 116, 32, u32::from_be_bytes(*bytes));
        lcss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmr::FRAME_LENGTH_BYTES;

    #[test]
    fn test_lc_roundtrip() {
        let lc = Lc::new(Flco::UserUser, 2147001, 214);
        assert_eq!(Lc::from_bytes(&lc.bytes()), lc);
    }

    #[test]
    fn test_full_lc_roundtrip() {
        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        let lc = Lc::new(Flco::Group, 2147001, 21460);
        full_lc_encode(&lc, &mut frame, DT_VOICE_LC_HEADER);
        assert_eq!(full_lc_decode(&frame, DT_VOICE_LC_HEADER), Some(lc));
        // Wrong type mask fails the checksum
        assert_eq!(full_lc_decode(&frame, DT_TERMINATOR_WITH_LC), None);
    }

    #[test]
    fn test_slot_type_roundtrip() {
        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        let st = SlotType::new(3, DT_VOICE_LC_HEADER);
        st.encode(&mut frame);
        assert_eq!(SlotType::decode(&frame), Some(st));
    }

    #[test]
    fn test_slot_type_survives_sync_insertion() {
        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        SlotType::new(1, DT_TERMINATOR_WITH_LC).encode(&mut frame);
        add_data_sync(&mut frame, false);
        assert_eq!(
            SlotType::decode(&frame),
            Some(SlotType::new(1, DT_TERMINATOR_WITH_LC))
        );
    }

    #[test]
    fn test_sync_patterns_distinct() {
        let mut data = [0u8; FRAME_LENGTH_BYTES];
        let mut voice = [0u8; FRAME_LENGTH_BYTES];
        add_data_sync(&mut data, false);
        add_voice_sync(&mut voice, false);
        assert_ne!(data, voice);
        // Outer nibbles belong to the payload and stay untouched
        assert_eq!(data[13] & 0xF0, 0x00);
        assert_eq!(data[19] & 0x0F, 0x00);
    }

    #[test]
    fn test_embedded_lc_fragments() {
        let mut embedded = EmbeddedLc::new();
        embedded.set_lc(&Lc::new(Flco::Group, 1234567, 91));
        let mut frame = [0u8; FRAME_LENGTH_BYTES];
        assert_eq!(embedded.get_data(&mut frame, 1), 1);
        assert_eq!(embedded.get_data(&mut frame, 2), 3);
        assert_eq!(embedded.get_data(&mut frame, 4), 2);
        assert_eq!(embedded.get_data(&mut frame, 5), 0);
    }
}
