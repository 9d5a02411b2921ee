//! MusicXML → MIDI conversion
//!
//! Reads MusicXML scores (plain `.musicxml`/`.xml` or compressed `.mxl`) and
//! writes Format 1 Standard MIDI Files. The `convert_to_midi` binary is a
//! thin wrapper over [`convert_musicxml_to_midi`].

pub mod cli;
pub mod convert;
pub mod converters;
pub mod error;
pub mod settings;

// Re-export commonly used types
pub use convert::{convert_musicxml_to_midi, prepare_output_dir, validate_source, ConversionReport, PartSummary};
pub use converters::musicxml::musicxml_to_midi::{musicxml_to_midi, MxError};
pub use error::{ConvertError, ConvertResult};
pub use settings::ConversionSettings;
