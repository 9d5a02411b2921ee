//! MusicXML format converters
//!
//! This module contains the `.mxl` container reader and the MusicXML to MIDI
//! converter.

pub mod container;
pub mod musicxml_to_midi;

// Re-export for convenience
pub use container::read_score_bytes;
pub use musicxml_to_midi::{musicxml_to_midi, parse_musicxml, write_smf, MxError, ParseOptions};
