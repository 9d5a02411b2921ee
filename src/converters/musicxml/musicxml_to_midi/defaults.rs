//! Default values for MIDI export
//!
//! Provides sensible defaults for tempo, velocity, channel assignment, etc.,
//! and the mapping from MusicXML dynamics to MIDI velocities.

/// Default tempo in beats per minute
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

/// Default MIDI velocity (mezzo-forte)
pub const DEFAULT_VELOCITY: u8 = 80;

/// Default MIDI program (0 = Acoustic Grand Piano in General MIDI)
pub const DEFAULT_PROGRAM: u8 = 0;

/// Default ticks per quarter note (MIDI resolution)
/// 480 is standard and provides good resolution
pub const DEFAULT_TPQ: u16 = 480;

/// Channel reserved for percussion in General MIDI (10 in 1-indexed)
pub const DRUM_CHANNEL: u8 = 9;

/// Velocity MusicXML treats as 100% in `dynamics="..."` attributes
pub const FORTE_VELOCITY: f64 = 90.0;

/// Assign MIDI channel from part index
/// - Channels 0-15 are available
/// - Channel 9 (10 in 1-indexed) is reserved for drums
/// - Skip channel 9 for melodic instruments
pub fn assign_channel(part_index: usize) -> u8 {
    let channel = part_index % 15;
    if channel >= DRUM_CHANNEL as usize {
        (channel + 1) as u8
    } else {
        channel as u8
    }
}

/// Velocity for a `dynamics` percentage (100 = forte)
pub fn velocity_from_percent(percent: f64) -> u8 {
    (percent * FORTE_VELOCITY / 100.0).round().clamp(1.0, 127.0) as u8
}

/// What a dynamics mark does to the velocity of following notes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicMark {
    /// Sets the level for all following notes
    Level(u8),
    /// Applies to the next note only
    Accent(u8),
    /// Accent on the next note, then the given level (fp, sfp)
    AccentThen(u8, u8),
}

/// Map a MusicXML `<dynamics>` child element name to its effect
pub fn dynamic_mark(name: &str) -> Option<DynamicMark> {
    use DynamicMark::*;
    let mark = match name {
        "pppppp" => Level(4),
        "ppppp" => Level(8),
        "pppp" => Level(12),
        "ppp" => Level(16),
        "pp" => Level(33),
        "p" => Level(49),
        "mp" => Level(64),
        "mf" => Level(80),
        "f" => Level(96),
        "ff" => Level(112),
        "fff" => Level(120),
        "ffff" => Level(124),
        "fffff" => Level(126),
        "ffffff" => Level(127),
        "n" => Level(1),
        "pf" => Level(96),
        "sf" | "sfz" | "fz" | "rf" | "rfz" => Accent(112),
        "sffz" => Accent(120),
        "sfpp" => AccentThen(112, 33),
        "fp" => AccentThen(96, 49),
        "sfp" => AccentThen(112, 49),
        _ => return None,
    };
    Some(mark)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_channel() {
        assert_eq!(assign_channel(0), 0);
        assert_eq!(assign_channel(1), 1);
        assert_eq!(assign_channel(8), 8);
        assert_eq!(assign_channel(9), 10);  // Skip channel 9
        assert_eq!(assign_channel(10), 11);
        assert_eq!(assign_channel(14), 15);
        assert_eq!(assign_channel(15), 0);  // Wrap around
    }

    #[test]
    fn test_assign_channel_never_drums() {
        for i in 0..64 {
            assert_ne!(assign_channel(i), DRUM_CHANNEL);
        }
    }

    #[test]
    fn test_velocity_from_percent() {
        assert_eq!(velocity_from_percent(100.0), 90);
        assert_eq!(velocity_from_percent(50.0), 45);
        assert_eq!(velocity_from_percent(0.0), 1);
        assert_eq!(velocity_from_percent(500.0), 127);
    }

    #[test]
    fn test_dynamic_marks() {
        assert_eq!(dynamic_mark("mf"), Some(DynamicMark::Level(80)));
        assert_eq!(dynamic_mark("p"), Some(DynamicMark::Level(49)));
        assert_eq!(dynamic_mark("sfz"), Some(DynamicMark::Accent(112)));
        assert_eq!(dynamic_mark("fp"), Some(DynamicMark::AccentThen(96, 49)));
        assert_eq!(dynamic_mark("other-dynamics"), None);
    }
}
