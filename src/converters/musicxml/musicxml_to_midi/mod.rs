//! MusicXML to MIDI converter module
//!
//! Two-stage pipeline:
//! 1. **Parse**: stream the MusicXML document with quick-xml into a lean
//!    [`Score`] IR (absolute ticks, one part per `<part>`)
//! 2. **Write**: serialize the IR as a Format 1 Standard MIDI File with midly
//!
//! # Basic Usage
//!
//! ```ignore
//! use musicxml_midi::converters::musicxml::musicxml_to_midi::musicxml_to_midi;
//!
//! let xml = std::fs::read("score.musicxml")?;
//! let smf = musicxml_to_midi(&xml, 480)?;
//! std::fs::write("score.mid", smf)?;
//! ```

pub mod defaults;
mod model;
mod parse;
mod write;

pub use model::*;
pub use parse::parse_musicxml;
pub use write::write_smf;

use defaults::{DEFAULT_TEMPO_BPM, DEFAULT_TPQ, DEFAULT_VELOCITY};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MxError {
    #[error("xml parse error: {0}")]
    Xml(String),
    #[error("invalid musicxml: {0}")]
    Invalid(String),
    #[error("unsupported musicxml: {0}")]
    Unsupported(String),
    #[error("midi write error: {0}")]
    Midi(String),
    #[error("mxl archive error: {0}")]
    Archive(String),
}

pub type Result<T> = std::result::Result<T, MxError>;

/// Knobs the parser needs that the document itself may not provide
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOptions {
    /// MIDI ticks per quarter note
    pub tpq: u16,
    /// Tempo inserted at tick 0 when the score declares none
    pub default_tempo_bpm: f64,
    /// Velocity of notes before any dynamics mark
    pub default_velocity: u8,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            tpq: DEFAULT_TPQ,
            default_tempo_bpm: DEFAULT_TEMPO_BPM,
            default_velocity: DEFAULT_VELOCITY,
        }
    }
}

/// Parsed score plus everything that was recognised but not rendered
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub score: Score,
    pub skipped_elements: Vec<SkippedElement>,
}

/// Information about a skipped/unsupported element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedElement {
    /// MusicXML element tag name (e.g., "grace")
    pub element_type: String,

    /// Measure number where element appears (MusicXML numbers are strings)
    pub measure_number: Option<String>,

    /// Part ID where element appears
    pub part_id: Option<String>,

    /// Human-readable explanation of why skipped
    pub reason: String,
}

/// Convert MusicXML bytes to SMF (Standard MIDI File) bytes
///
/// # Arguments
/// * `xml` - MusicXML document as bytes
/// * `tpq` - Ticks per quarter note (typically 480 or 960, 0 = default)
///
/// # Returns
/// * MIDI file bytes
pub fn musicxml_to_midi(xml: &[u8], tpq: u16) -> Result<Vec<u8>> {
    let options = ParseOptions {
        tpq: if tpq == 0 { DEFAULT_TPQ } else { tpq },
        ..ParseOptions::default()
    };
    let parsed = parse_musicxml(xml, &options)?;
    let mut out = Vec::new();
    write_smf(&parsed.score, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALE: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<score-partwise version="3.1">
  <part-list><score-part id="P1"><part-name>Piano</part-name></score-part></part-list>
  <part id="P1">
    <measure number="1">
      <attributes><divisions>1</divisions></attributes>
      <note><pitch><step>C</step><octave>4</octave></pitch><duration>1</duration></note>
      <note><pitch><step>D</step><octave>4</octave></pitch><duration>1</duration></note>
      <note><pitch><step>E</step><octave>4</octave></pitch><duration>1</duration></note>
      <note><pitch><step>F</step><octave>4</octave></pitch><duration>1</duration></note>
    </measure>
  </part>
</score-partwise>"#;

    #[test]
    fn test_musicxml_to_midi_produces_smf() {
        let smf = musicxml_to_midi(SCALE, 480).expect("conversion should succeed");
        let parsed = midly::Smf::parse(&smf).expect("output should be valid MIDI");
        assert_eq!(parsed.header.format, midly::Format::Parallel);
        assert_eq!(parsed.header.timing, midly::Timing::Metrical(480.into()));
        assert_eq!(parsed.tracks.len(), 2);
    }

    #[test]
    fn test_zero_tpq_uses_default() {
        let smf = musicxml_to_midi(SCALE, 0).expect("conversion should succeed");
        let parsed = midly::Smf::parse(&smf).expect("output should be valid MIDI");
        assert_eq!(parsed.header.timing, midly::Timing::Metrical(DEFAULT_TPQ.into()));
    }

    #[test]
    fn test_conversion_is_deterministic() {
        let a = musicxml_to_midi(SCALE, 480).expect("first conversion");
        let b = musicxml_to_midi(SCALE, 480).expect("second conversion");
        assert_eq!(a, b);
    }

    #[test]
    fn test_errors_propagate() {
        assert!(matches!(musicxml_to_midi(b"<score-partwise>", 480), Err(MxError::Xml(_))));
        assert!(matches!(musicxml_to_midi(b"not xml at all", 480), Err(MxError::Invalid(_))));
    }

    #[test]
    fn test_decimal_durations_match_integer_ones() {
        let text = std::str::from_utf8(SCALE).unwrap();
        let decimal = text.replace("<duration>1</duration>", "<duration>1.0</duration>");
        assert_eq!(
            musicxml_to_midi(decimal.as_bytes(), 480).unwrap(),
            musicxml_to_midi(SCALE, 480).unwrap()
        );
    }

    #[test]
    fn test_oversized_numbers_are_errors() {
        let text = std::str::from_utf8(SCALE).unwrap();
        let long = text.replacen("<duration>1</duration>", "<duration>100000000000000000</duration>", 1);
        assert!(matches!(musicxml_to_midi(long.as_bytes(), 480), Err(MxError::Invalid(_))));

        let high = text.replacen("<octave>4</octave>", "<octave>2147483647</octave>", 1);
        assert!(matches!(musicxml_to_midi(high.as_bytes(), 480), Err(MxError::Invalid(_))));
    }
}
