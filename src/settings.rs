//! Conversion settings
//!
//! Defaults come from the MIDI export defaults; a JSON file can override any
//! subset of fields, and the CLI overrides the file.

use crate::converters::musicxml::musicxml_to_midi::defaults::{
    DEFAULT_TEMPO_BPM, DEFAULT_TPQ, DEFAULT_VELOCITY,
};
use crate::converters::musicxml::musicxml_to_midi::ParseOptions;
use crate::error::{ConvertError, ConvertResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration options for conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversionSettings {
    /// MIDI ticks per quarter note
    pub ticks_per_quarter: u16,

    /// Tempo used when the score declares none
    pub default_tempo_bpm: f64,

    /// Note velocity before the first dynamics mark
    pub default_velocity: u8,

    /// Write the score title as the conductor track name
    pub include_title: bool,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            ticks_per_quarter: DEFAULT_TPQ,
            default_tempo_bpm: DEFAULT_TEMPO_BPM,
            default_velocity: DEFAULT_VELOCITY,
            include_title: true,
        }
    }
}

impl ConversionSettings {
    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> ConvertResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConvertError::io(path, e))?;
        let settings: ConversionSettings = serde_json::from_str(&text)
            .map_err(|e| ConvertError::Settings(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ConvertResult<()> {
        if self.ticks_per_quarter == 0 || self.ticks_per_quarter > 0x7FFF {
            return Err(ConvertError::Settings(format!(
                "ticks_per_quarter must be 1..=32767, got {}",
                self.ticks_per_quarter
            )));
        }
        if !(self.default_tempo_bpm.is_finite() && self.default_tempo_bpm > 0.0) {
            return Err(ConvertError::Settings(format!(
                "default_tempo_bpm must be positive, got {}",
                self.default_tempo_bpm
            )));
        }
        if !(1..=127).contains(&self.default_velocity) {
            return Err(ConvertError::Settings(format!(
                "default_velocity must be 1..=127, got {}",
                self.default_velocity
            )));
        }
        Ok(())
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            tpq: self.ticks_per_quarter,
            default_tempo_bpm: self.default_tempo_bpm,
            default_velocity: self.default_velocity,
        }
    }
}
