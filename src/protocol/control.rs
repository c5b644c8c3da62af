//! Outbound device control reports (feature configuration and haptics)

/// Haptic mode byte: let the dial click on every detent
const HAPTIC_AUTO_TRIGGER: u8 = 0x03;
/// Haptic mode byte: haptics disabled
const HAPTIC_OFF: u8 = 0x02;
/// Manual trigger waveform used for a buzz
const MANUAL_TRIGGER: u8 = 0x03;

/// Feature report 0x01: resolution and haptic trigger mode.
///
/// ```text
/// [0] report id
/// [1..=2] steps per revolution (little-endian)
/// [3] repeat count
/// [4] haptic trigger mode
/// [5] waveform cutoff time
/// [6..=7] retrigger period
/// ```
pub fn resolution_feature_report(steps_per_revolution: u16, haptics: bool) -> [u8; 8] {
    let [lo, hi] = steps_per_revolution.to_le_bytes();
    let mode = if haptics { HAPTIC_AUTO_TRIGGER } else { HAPTIC_OFF };
    [super::DIAL_REPORT_ID, lo, hi, 0x00, mode, 0x00, 0x00, 0x00]
}

/// Output report firing a manual haptic pulse `repeat_count` extra times
pub fn buzz_report(repeat_count: u8) -> [u8; 5] {
    [super::DIAL_REPORT_ID, repeat_count, MANUAL_TRIGGER, 0x00, 0x00]
}

/// Uppercase, space separated hex dump for trace logging
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
