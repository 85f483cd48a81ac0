//! 7-bit MIDI value <-> normalized protocol value conversions

/// 0-127 fader position to normalized 0.0-1.0
pub fn fader_from_raw(raw: u8) -> f32 {
    f32::from(raw.min(127)) / 127.0
}

/// Normalized 0.0-1.0 fader value to 7-bit position
pub fn fader_to_raw(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 127.0).round() as u8
}

/// 0-127 pan position to -1.0..=1.0, center at 64
pub fn pan_from_raw(raw: u8) -> f32 {
    ((f32::from(raw.min(127)) - 64.0) / 63.0).clamp(-1.0, 1.0)
}

/// -1.0..=1.0 pan value to 7-bit position
pub fn pan_to_raw(pan: f32) -> u8 {
    (pan.clamp(-1.0, 1.0) * 63.0 + 64.0).round().clamp(0.0, 127.0) as u8
}

/// An absolute value on a toggle-style binding counts as a press only in
/// the upper half of the range
pub fn is_press(raw: u8) -> bool {
    raw > 63
}
