//! Dial report decoding
//!
//! Converts raw device reports into [`SemanticEvent`]s. Two wire layouts exist:
//!
//! - **Packetized**: HID input report read through hidraw/hidapi.
//!   `[report_id, status, delta_lo, delta_hi, ...]`
//! - **Streamed**: Linux `struct input_event` records read from `/dev/input/eventN`.
//!   `[tv_sec, tv_usec, type: u16, code: u16, value: i32]`
//!
//! The layout is chosen once at startup and never inspected per report.

pub mod control;

use serde::{Deserialize, Serialize};

/// HID input report id carrying rotation and button data
pub const DIAL_REPORT_ID: u8 = 0x01;

/// Minimum length of a packetized input report
pub const PACKETIZED_MIN_LEN: usize = 4;

/// Linux input event types and codes used by the dial
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const REL_DIAL: u16 = 0x07;

/// Physical button state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonState {
    Down,
    Up,
}

/// A decoded, immutable device event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticEvent {
    ButtonEdge { state: ButtonState },
    /// Signed rotation in device steps
    Rotation { delta: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordSize {
    Bits32,
    Bits64,
}

impl WordSize {
    fn bytes(self) -> usize {
        match self {
            WordSize::Bits32 => 4,
            WordSize::Bits64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Capture format of streamed input-event records.
///
/// The kernel writes `struct input_event` in the host's native layout, so the
/// profile describes the machine we run on, not the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub word: WordSize,
    pub endian: Endian,
}

impl StreamProfile {
    /// Profile of the compilation target
    pub const fn native() -> Self {
        let word = if cfg!(target_pointer_width = "64") {
            WordSize::Bits64
        } else {
            WordSize::Bits32
        };
        let endian = if cfg!(target_endian = "little") {
            Endian::Little
        } else {
            Endian::Big
        };
        Self { word, endian }
    }

    /// Size of one input event record (16 or 24 bytes)
    pub fn record_len(&self) -> usize {
        self.word.bytes() * 2 + 8
    }

    fn read_u16(&self, bytes: [u8; 2]) -> u16 {
        match self.endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        }
    }

    fn read_i32(&self, bytes: [u8; 4]) -> i32 {
        match self.endian {
            Endian::Little => i32::from_le_bytes(bytes),
            Endian::Big => i32::from_be_bytes(bytes),
        }
    }
}

/// Decoder variant, selected once from the configured device profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLayout {
    Packetized { report_id: u8 },
    Streamed(StreamProfile),
}

impl ReportLayout {
    pub fn packetized() -> Self {
        ReportLayout::Packetized {
            report_id: DIAL_REPORT_ID,
        }
    }

    pub fn streamed() -> Self {
        ReportLayout::Streamed(StreamProfile::native())
    }

    /// Buffer size to allocate for one report
    pub fn report_len(&self) -> usize {
        match self {
            // Larger than the dial's input report so nothing is truncated
            ReportLayout::Packetized { .. } => 64,
            ReportLayout::Streamed(profile) => profile.record_len(),
        }
    }

    /// Decode one report. `None` means "nothing to act on", never an error.
    pub fn decode(&self, report: &[u8]) -> Option<SemanticEvent> {
        match self {
            ReportLayout::Packetized { report_id } => decode_packetized(*report_id, report),
            ReportLayout::Streamed(profile) => decode_streamed(profile, report),
        }
    }
}

fn decode_packetized(report_id: u8, report: &[u8]) -> Option<SemanticEvent> {
    if report.len() < PACKETIZED_MIN_LEN || report[0] != report_id {
        return None;
    }

    let delta = i16::from_le_bytes([report[2], report[3]]);
    if delta != 0 {
        return Some(SemanticEvent::Rotation {
            delta: i32::from(delta),
        });
    }

    let state = if report[1] & 0x01 != 0 {
        ButtonState::Down
    } else {
        ButtonState::Up
    };
    Some(SemanticEvent::ButtonEdge { state })
}

fn decode_streamed(profile: &StreamProfile, record: &[u8]) -> Option<SemanticEvent> {
    if record.len() < profile.record_len() {
        return None;
    }

    // Skip the two timestamp words
    let base = profile.word.bytes() * 2;
    let kind = profile.read_u16([record[base], record[base + 1]]);
    let code = profile.read_u16([record[base + 2], record[base + 3]]);
    let value = profile.read_i32([
        record[base + 4],
        record[base + 5],
        record[base + 6],
        record[base + 7],
    ]);

    match kind {
        EV_KEY => {
            // value 2 is key autorepeat, still a held button
            let state = if value != 0 {
                ButtonState::Down
            } else {
                ButtonState::Up
            };
            Some(SemanticEvent::ButtonEdge { state })
        }
        EV_REL if code == REL_DIAL && value != 0 => Some(SemanticEvent::Rotation { delta: value }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(profile: StreamProfile, kind: u16, code: u16, value: i32) -> Vec<u8> {
        let mut buf = vec![0xAAu8; profile.word.bytes() * 2];
        match profile.endian {
            Endian::Little => {
                buf.extend_from_slice(&kind.to_le_bytes());
                buf.extend_from_slice(&code.to_le_bytes());
                buf.extend_from_slice(&value.to_le_bytes());
            }
            Endian::Big => {
                buf.extend_from_slice(&kind.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(&value.to_be_bytes());
            }
        }
        buf
    }

    #[test]
    fn test_packetized_rotation() {
        let layout = ReportLayout::packetized();
        assert_eq!(
            layout.decode(&[0x01, 0x00, 0x0A, 0x00, 0x00]),
            Some(SemanticEvent::Rotation { delta: 10 })
        );
        // -3 as little-endian i16
        assert_eq!(
            layout.decode(&[0x01, 0x00, 0xFD, 0xFF]),
            Some(SemanticEvent::Rotation { delta: -3 })
        );
    }

    #[test]
    fn test_packetized_rotation_wins_over_button_bit() {
        let layout = ReportLayout::packetized();
        assert_eq!(
            layout.decode(&[0x01, 0x01, 0x02, 0x00]),
            Some(SemanticEvent::Rotation { delta: 2 })
        );
    }

    #[test]
    fn test_packetized_button_bit() {
        let layout = ReportLayout::packetized();
        assert_eq!(
            layout.decode(&[0x01, 0x01, 0x00, 0x00]),
            Some(SemanticEvent::ButtonEdge {
                state: ButtonState::Down
            })
        );
        assert_eq!(
            layout.decode(&[0x01, 0x00, 0x00, 0x00]),
            Some(SemanticEvent::ButtonEdge {
                state: ButtonState::Up
            })
        );
        // Only bit 0 matters
        assert_eq!(
            layout.decode(&[0x01, 0xFE, 0x00, 0x00]),
            Some(SemanticEvent::ButtonEdge {
                state: ButtonState::Up
            })
        );
    }

    #[test]
    fn test_packetized_skips_short_and_foreign_reports() {
        let layout = ReportLayout::packetized();
        assert_eq!(layout.decode(&[]), None);
        assert_eq!(layout.decode(&[0x01, 0x00, 0x0A]), None);
        assert_eq!(layout.decode(&[0x02, 0x00, 0x0A, 0x00]), None);
    }

    #[test]
    fn test_packetized_full_i16_range() {
        let layout = ReportLayout::packetized();
        for delta in [i16::MIN, -1, 1, 360, i16::MAX] {
            let [lo, hi] = delta.to_le_bytes();
            assert_eq!(
                layout.decode(&[0x01, 0x00, lo, hi]),
                Some(SemanticEvent::Rotation {
                    delta: i32::from(delta)
                }),
                "delta {}",
                delta
            );
        }
    }

    #[test]
    fn test_record_len_by_word_size() {
        let p64 = StreamProfile {
            word: WordSize::Bits64,
            endian: Endian::Little,
        };
        let p32 = StreamProfile {
            word: WordSize::Bits32,
            endian: Endian::Little,
        };
        assert_eq!(p64.record_len(), 24);
        assert_eq!(p32.record_len(), 16);
    }

    #[test]
    fn test_native_profile_matches_target() {
        let native = StreamProfile::native();
        assert_eq!(
            native.record_len(),
            std::mem::size_of::<usize>() * 2 + 8
        );
    }

    #[test]
    fn test_streamed_decoding_all_profiles() {
        for word in [WordSize::Bits32, WordSize::Bits64] {
            for endian in [Endian::Little, Endian::Big] {
                let profile = StreamProfile { word, endian };
                let layout = ReportLayout::Streamed(profile);

                assert_eq!(
                    layout.decode(&record(profile, EV_REL, REL_DIAL, -7)),
                    Some(SemanticEvent::Rotation { delta: -7 }),
                    "{:?}",
                    profile
                );
                assert_eq!(
                    layout.decode(&record(profile, EV_KEY, 0x100, 1)),
                    Some(SemanticEvent::ButtonEdge {
                        state: ButtonState::Down
                    })
                );
                assert_eq!(
                    layout.decode(&record(profile, EV_KEY, 0x100, 0)),
                    Some(SemanticEvent::ButtonEdge {
                        state: ButtonState::Up
                    })
                );
            }
        }
    }

    #[test]
    fn test_streamed_ignores_sync_and_other_axes() {
        let profile = StreamProfile::native();
        let layout = ReportLayout::Streamed(profile);

        // EV_SYN
        assert_eq!(layout.decode(&record(profile, 0x00, 0, 0)), None);
        // REL_WHEEL is not the dial
        assert_eq!(layout.decode(&record(profile, EV_REL, 0x08, 3)), None);
        // Zero rotation carries no information
        assert_eq!(layout.decode(&record(profile, EV_REL, REL_DIAL, 0)), None);
        // Truncated record
        let short = record(profile, EV_REL, REL_DIAL, 5);
        assert_eq!(layout.decode(&short[..short.len() - 1]), None);
    }
}
