/// Lean Internal Representation for MusicXML → MIDI conversion
///
/// This IR is designed specifically for export - not a full-featured music object model.
/// All positions are absolute MIDI ticks; the writer turns them into deltas.
use num_rational::{Ratio, Rational64};

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub tpq: u16,                 // Ticks per quarter note
    pub title: Option<String>,    // movement-title / work-title
    pub tempos: Vec<Tempo>,       // sorted by tick, one per tick
    pub timesigs: Vec<TimeSig>,   // sorted by tick, one per tick
    pub keysigs: Vec<KeySig>,     // sorted by tick, one per tick
    pub parts: Vec<Part>,         // One per MusicXML <part>, document order
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tempo {
    pub tick: u64,
    pub bpm: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSig {
    pub tick: u64,
    pub num: u8,   // Numerator (e.g., 3 in 3/4)
    pub den: u8,   // Denominator (e.g., 4 in 3/4)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySig {
    pub tick: u64,
    pub fifths: i8, // -7 (7 flats) ..= 7 (7 sharps)
    pub minor: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub id: String,
    pub name: String,
    pub channel: u8,          // MIDI channel 0-15 (9 = drums)
    pub program: Option<u8>,  // MIDI program 0-127 (GM instrument)
    pub volume: Option<u8>,   // CC7 value 0-127
    pub pan: Option<u8>,      // CC10 value 0-127 (64 = center)
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub start_tick: u64,
    pub dur_tick: u64,
    pub pitch: u8,      // MIDI note number 0-127
    pub vel: u8,        // Velocity 1-127
    pub voice: u8,      // MusicXML voice for multi-voice handling
}

impl Score {
    pub fn new(tpq: u16) -> Self {
        Score {
            tpq,
            title: None,
            tempos: Vec::new(),
            timesigs: Vec::new(),
            keysigs: Vec::new(),
            parts: Vec::new(),
        }
    }

    pub fn note_count(&self) -> usize {
        self.parts.iter().map(|p| p.notes.len()).sum()
    }

    /// Tick at which the last sounding note ends
    pub fn end_tick(&self) -> u64 {
        self.parts
            .iter()
            .flat_map(|p| p.notes.iter())
            .map(|n| n.start_tick.saturating_add(n.dur_tick))
            .max()
            .unwrap_or(0)
    }
}

/// Latest score position, in quarter notes, a part may reach
pub const MAX_QUARTERS: i64 = 1 << 32;

fn widen(r: Rational64) -> Ratio<i128> {
    Ratio::new_raw(*r.numer() as i128, *r.denom() as i128)
}

fn narrow(r: Ratio<i128>) -> Option<Rational64> {
    let numer = i64::try_from(*r.numer()).ok()?;
    let denom = i64::try_from(*r.denom()).ok()?;
    Some(Rational64::new_raw(numer, denom))
}

/// `a + b`, or None if the exact result does not fit a `Rational64`
pub fn checked_add(a: Rational64, b: Rational64) -> Option<Rational64> {
    narrow(widen(a) + widen(b))
}

/// Convert MusicXML divisions to a length in quarter notes
///
/// # Arguments
/// * `divs` - Duration in MusicXML divisions (may be fractional)
/// * `divisions` - MusicXML divisions per quarter note
pub fn divs_to_quarters(divs: Rational64, divisions: u32) -> Option<Rational64> {
    narrow(widen(divs) / Ratio::from_integer(divisions.max(1) as i128))
}

/// Convert a position in quarter notes to MIDI ticks
///
/// Rounds to the nearest tick; negative positions clamp to 0.
pub fn quarters_to_ticks(quarters: Rational64, tpq: u16) -> u64 {
    let scaled = widen(quarters) * Ratio::from_integer(tpq as i128);
    let rounded = scaled.round().to_integer();
    rounded.clamp(0, u64::MAX as i128) as u64
}

/// Parse an xs:decimal such as `2`, `2.0` or `-1.25` exactly
///
/// Digits past the ninth decimal place are ignored.
pub fn parse_decimal(text: &str) -> Option<Rational64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let fraction = &fraction[..fraction.len().min(9)];
    let mut numer: i64 = 0;
    for b in whole.bytes().chain(fraction.bytes()) {
        numer = numer.checked_mul(10)?.checked_add((b - b'0') as i64)?;
    }
    let denom = 10i64.pow(fraction.len() as u32);
    let value = Rational64::new(numer, denom);
    Some(if negative { -value } else { value })
}

/// Semitone offset of a note letter above C
pub fn step_semitone(step: &str) -> Option<i32> {
    match step {
        "C" => Some(0),
        "D" => Some(2),
        "E" => Some(4),
        "F" => Some(5),
        "G" => Some(7),
        "A" => Some(9),
        "B" => Some(11),
        _ => None,
    }
}

/// Convert MusicXML pitch representation to MIDI note number
///
/// # Arguments
/// * `step` - Note letter (C, D, E, F, G, A, B)
/// * `alter` - Semitone alteration (-2 = double flat, -1 = flat, 0 = natural, 1 = sharp, 2 = double sharp)
/// * `octave` - Octave number (C4 = middle C)
///
/// # Returns
/// MIDI note number (0-127, where 60 = C4), or None for an unknown step
pub fn pitch_to_midi(step: &str, alter: i32, octave: i32) -> Option<u8> {
    let base = step_semitone(step)? as i64;
    // MIDI note 0 = C-1, so C4 (middle C) = 60
    let semi = base + alter as i64 + (octave as i64 + 1) * 12;
    Some(semi.clamp(0, 127) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pitch_to_midi() {
        assert_eq!(pitch_to_midi("C", 0, 4), Some(60));  // Middle C
        assert_eq!(pitch_to_midi("C", 1, 4), Some(61));  // C#
        assert_eq!(pitch_to_midi("D", -1, 4), Some(61)); // Db (enharmonic with C#)
        assert_eq!(pitch_to_midi("A", 0, 4), Some(69));  // A440
        assert_eq!(pitch_to_midi("H", 0, 4), None);
    }

    #[test]
    fn test_pitch_to_midi_octave_boundaries() {
        assert_eq!(pitch_to_midi("B", 0, 3), Some(59));
        assert_eq!(pitch_to_midi("B", 1, 3), Some(60));  // B#3 == C4
        assert_eq!(pitch_to_midi("C", -1, 4), Some(59)); // Cb4 == B3
    }

    #[test]
    fn test_pitch_to_midi_clamping() {
        assert_eq!(pitch_to_midi("C", 0, -2), Some(0));
        assert_eq!(pitch_to_midi("G", 0, 9), Some(127));
        assert_eq!(pitch_to_midi("B", 2, 9), Some(127));
        assert_eq!(pitch_to_midi("C", 0, i32::MAX), Some(127));
        assert_eq!(pitch_to_midi("C", i32::MIN, 4), Some(0));
    }

    fn ticks(divs: i64, divisions: u32, tpq: u16) -> u64 {
        let quarters = divs_to_quarters(Rational64::from_integer(divs), divisions).unwrap();
        quarters_to_ticks(quarters, tpq)
    }

    #[test]
    fn test_divs_to_ticks() {
        assert_eq!(ticks(480, 480, 480), 480);
        assert_eq!(ticks(1, 1, 480), 480);
        assert_eq!(ticks(240, 480, 480), 240);
        // Triplet eighth with divisions=3
        assert_eq!(ticks(1, 3, 480), 160);
    }

    #[test]
    fn test_divs_to_ticks_with_rounding() {
        // 480 * 960 / 1000 = 460.8 -> 461
        assert_eq!(ticks(480, 1000, 960), 461);
        // 1/7 of a quarter at 480 tpq = 68.57 -> 69
        assert_eq!(ticks(1, 7, 480), 69);
    }

    #[test]
    fn test_quarters_accumulate_without_drift() {
        // Seven septuplet sixteenths sum to exactly one quarter
        let mut pos = Rational64::from_integer(0);
        for _ in 0..7 {
            let sixteenth = divs_to_quarters(Rational64::from_integer(1), 7).unwrap();
            pos = checked_add(pos, sixteenth).unwrap();
        }
        assert_eq!(quarters_to_ticks(pos, 480), 480);
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("2"), Some(Rational64::from_integer(2)));
        assert_eq!(parse_decimal("2.0"), Some(Rational64::from_integer(2)));
        assert_eq!(parse_decimal(" 1.5 "), Some(Rational64::new(3, 2)));
        assert_eq!(parse_decimal("-0.25"), Some(Rational64::new(-1, 4)));
        assert_eq!(parse_decimal(".5"), Some(Rational64::new(1, 2)));
        assert_eq!(parse_decimal("3."), Some(Rational64::from_integer(3)));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("."), None);
        assert_eq!(parse_decimal("1e3"), None);
        assert_eq!(parse_decimal("half"), None);
        assert_eq!(parse_decimal("99999999999999999999"), None);
    }

    #[test]
    fn test_timeline_arithmetic_reports_overflow() {
        let huge = Rational64::from_integer(i64::MAX);
        assert_eq!(checked_add(huge, Rational64::from_integer(1)), None);
        assert_eq!(
            checked_add(Rational64::new(1, 3), Rational64::new(1, 6)),
            Some(Rational64::new(1, 2))
        );
        // Large but representable positions saturate instead of wrapping
        assert_eq!(quarters_to_ticks(huge, 32767), u64::MAX);
    }

    #[test]
    fn test_negative_position_clamps() {
        assert_eq!(quarters_to_ticks(Rational64::new(-1, 2), 480), 0);
    }

    #[test]
    fn test_score_summary() {
        let mut score = Score::new(480);
        score.parts.push(Part {
            id: "P1".to_string(),
            name: "Piano".to_string(),
            channel: 0,
            program: Some(0),
            volume: None,
            pan: None,
            notes: vec![
                Note { start_tick: 0, dur_tick: 480, pitch: 60, vel: 80, voice: 1 },
                Note { start_tick: 480, dur_tick: 960, pitch: 62, vel: 80, voice: 1 },
            ],
        });

        assert_eq!(score.note_count(), 2);
        assert_eq!(score.end_tick(), 1440);
    }
}
