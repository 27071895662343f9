//! DTMF shortcut decoder.
//!
//! Handsets without WIRES-X support steer the bridge by keying DTMF
//! digits: the vocoder encodes each tone into a recognisable sub-frame
//! signature in V/D mode 2 channel 0. A digit must match on several
//! consecutive frames to register; the accumulated sequence is
//! interpreted when the transmission ends.

use crate::ysf::payload::extract_voice_channel;

/// Frames a digit must persist before it registers.
const PRESS_FRAMES: u32 = 3;
/// Unmatched frames before the key is considered released.
const RELEASE_FRAMES: u32 = 3;
/// Longest accepted digit sequence.
const MAX_DIGITS: usize = 8;

/// Stable signature bits of a DTMF-bearing sub-frame.
const SIGNATURE_MASK: [u8; 9] = [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF];

const DIGITS: [u8; 16] = *b"0123456789ABCD*#";

fn signature_for(index: u8) -> [u8; 9] {
    [
        0x4D,
        0xA0 | index,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x35,
        0x50 | index,
    ]
}

/// Command synthesized from a completed digit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfAction {
    None,
    Connect(u32),
    Disconnect,
}

/// Per-transmission DTMF state.
#[derive(Debug, Default)]
pub struct Dtmf {
    buffer: Vec<u8>,
    last: Option<u8>,
    press_count: u32,
    release_count: u32,
    pressed: bool,
}

impl Dtmf {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(subframe: &[u8; 9]) -> Option<u8> {
        let mut masked = [0u8; 9];
        for i in 0..9 {
            masked[i] = subframe[i] & SIGNATURE_MASK[i];
        }
        for (index, &digit) in DIGITS.iter().enumerate() {
            if masked == signature_for(index as u8) {
                return Some(digit);
            }
        }
        None
    }

    /// Feed one V/D mode 2 voice frame region. `end` marks the final
    /// frame of the transmission, at which point the sequence is
    /// interpreted.
    pub fn decode_vd_mode2(&mut self, region: &[u8], end: bool) -> DtmfAction {
        let subframe = extract_voice_channel(region, 0);
        match Self::lookup(&subframe) {
            Some(digit) => {
                self.release_count = 0;
                if self.last == Some(digit) {
                    self.press_count += 1;
                } else {
                    self.last = Some(digit);
                    self.press_count = 1;
                }
                if !self.pressed
                    && self.press_count >= PRESS_FRAMES
                    && self.buffer.len() < MAX_DIGITS
                {
                    self.buffer.push(digit);
                    self.pressed = true;
                }
            }
            None => {
                self.release_count += 1;
                if self.release_count >= RELEASE_FRAMES {
                    self.pressed = false;
                    self.last = None;
                    self.press_count = 0;
                }
            }
        }

        if end {
            let action = self.interpret();
            self.reset();
            action
        } else {
            DtmfAction::None
        }
    }

    fn interpret(&self) -> DtmfAction {
        match self.buffer.split_first() {
            Some((b'#', [])) => DtmfAction::Disconnect,
            Some((b'*', digits)) if !digits.is_empty() => {
                let text: String = digits.iter().map(|&b| b as char).collect();
                match text.parse::<u32>() {
                    Ok(id) if id > 0 => DtmfAction::Connect(id),
                    _ => DtmfAction::None,
                }
            }
            _ => DtmfAction::None,
        }
    }

    /// Forget any partial sequence (called on terminator frames).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last = None;
        self.press_count = 0;
        self.release_count = 0;
        self.pressed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ysf::payload::insert_voice_channel;
    use crate::ysf::REGION_LENGTH;

    fn region_with_digit(digit: u8) -> [u8; REGION_LENGTH] {
        let index = DIGITS.iter().position(|&d| d == digit).unwrap() as u8;
        let mut region = [0u8; REGION_LENGTH];
        insert_voice_channel(&mut region, 0, &signature_for(index));
        region
    }

    fn silence_region() -> [u8; REGION_LENGTH] {
        [0u8; REGION_LENGTH]
    }

    fn key(dtmf: &mut Dtmf, digit: u8) {
        let region = region_with_digit(digit);
        for _ in 0..PRESS_FRAMES {
            assert_eq!(dtmf.decode_vd_mode2(&region, false), DtmfAction::None);
        }
        let silence = silence_region();
        for _ in 0..RELEASE_FRAMES {
            dtmf.decode_vd_mode2(&silence, false);
        }
    }

    #[test]
    fn test_connect_sequence() {
        let mut dtmf = Dtmf::new();
        key(&mut dtmf, b'*');
        key(&mut dtmf, b'2');
        key(&mut dtmf, b'1');
        key(&mut dtmf, b'4');
        let action = dtmf.decode_vd_mode2(&silence_region(), true);
        assert_eq!(action, DtmfAction::Connect(214));
    }

    #[test]
    fn test_disconnect_sequence() {
        let mut dtmf = Dtmf::new();
        key(&mut dtmf, b'#');
        assert_eq!(
            dtmf.decode_vd_mode2(&silence_region(), true),
            DtmfAction::Disconnect
        );
    }

    #[test]
    fn test_held_key_registers_once() {
        let mut dtmf = Dtmf::new();
        let region = region_with_digit(b'5');
        for _ in 0..20 {
            dtmf.decode_vd_mode2(&region, false);
        }
        assert_eq!(dtmf.buffer, b"5");
    }

    #[test]
    fn test_short_blip_ignored() {
        let mut dtmf = Dtmf::new();
        let region = region_with_digit(b'7');
        dtmf.decode_vd_mode2(&region, false);
        assert_eq!(dtmf.decode_vd_mode2(&silence_region(), true), DtmfAction::None);
    }

    #[test]
    fn test_plain_voice_is_no_action() {
        let mut dtmf = Dtmf::new();
        let mut region = [0u8; REGION_LENGTH];
        insert_voice_channel(&mut region, 0, &[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x12]);
        for _ in 0..10 {
            assert_eq!(dtmf.decode_vd_mode2(&region, false), DtmfAction::None);
        }
        assert_eq!(dtmf.decode_vd_mode2(&region, true), DtmfAction::None);
    }
}
