//! File-level MusicXML → MIDI conversion
//!
//! Validates the source, prepares the destination directory, then runs the
//! bytes-level pipeline: container unpacking, score parsing, SMF writing.
//! The destination file is only written once rendering has succeeded.

use crate::converters::musicxml::container::{is_compressed, read_score_bytes};
use crate::converters::musicxml::musicxml_to_midi::{parse_musicxml, write_smf, Score, SkippedElement};
use crate::error::{ConvertError, ConvertResult};
use crate::settings::ConversionSettings;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Result of a successful conversion
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// `"mxl"` for compressed input, `"musicxml"` otherwise
    pub source_format: &'static str,
    pub title: Option<String>,
    pub ticks_per_quarter: u16,
    pub parts: Vec<PartSummary>,
    pub note_count: usize,
    pub tempo_changes: usize,
    pub duration_ticks: u64,
    pub midi_bytes: usize,
    pub skipped_elements: Vec<SkippedElement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartSummary {
    pub id: String,
    pub name: String,
    pub channel: u8,
    pub program: Option<u8>,
    pub notes: usize,
}

/// Fail unless `source` exists and is a regular file
pub fn validate_source(source: &Path) -> ConvertResult<()> {
    match fs::metadata(source) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(ConvertError::NotAFile(source.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ConvertError::NotFound(source.to_path_buf())),
        Err(e) => Err(ConvertError::io(source, e)),
    }
}

/// Create every missing parent directory of `destination`
pub fn prepare_output_dir(destination: &Path) -> ConvertResult<()> {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| ConvertError::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Convert the MusicXML file at `source` into a MIDI file at `destination`
pub fn convert_musicxml_to_midi(
    source: &Path,
    destination: &Path,
    settings: &ConversionSettings,
) -> ConvertResult<ConversionReport> {
    settings.validate()?;
    validate_source(source)?;
    prepare_output_dir(destination)?;

    let raw = fs::read(source).map_err(|e| ConvertError::io(source, e))?;
    let source_format = if is_compressed(&raw) { "mxl" } else { "musicxml" };
    let xml = read_score_bytes(&raw)?;

    let parsed = parse_musicxml(&xml, &settings.parse_options())?;
    let mut score = parsed.score;
    if !settings.include_title {
        score.title = None;
    }
    for skipped in &parsed.skipped_elements {
        log::warn!(
            "skipped <{}> (part {}, measure {}): {}",
            skipped.element_type,
            skipped.part_id.as_deref().unwrap_or("-"),
            skipped.measure_number.as_deref().unwrap_or("-"),
            skipped.reason
        );
    }

    let mut midi = Vec::new();
    write_smf(&score, &mut midi)?;
    fs::write(destination, &midi).map_err(|e| ConvertError::io(destination, e))?;

    let report = build_report(source, destination, source_format, &score, midi.len(), parsed.skipped_elements);
    log::info!(
        "converted {} -> {} ({} parts, {} notes, {} bytes)",
        source.display(),
        destination.display(),
        report.parts.len(),
        report.note_count,
        report.midi_bytes
    );
    Ok(report)
}

fn build_report(
    source: &Path,
    destination: &Path,
    source_format: &'static str,
    score: &Score,
    midi_bytes: usize,
    skipped_elements: Vec<SkippedElement>,
) -> ConversionReport {
    ConversionReport {
        source: source.to_path_buf(),
        destination: destination.to_path_buf(),
        source_format,
        title: score.title.clone(),
        ticks_per_quarter: score.tpq,
        parts: score
            .parts
            .iter()
            .map(|p| PartSummary {
                id: p.id.clone(),
                name: p.name.clone(),
                channel: p.channel,
                program: p.program,
                notes: p.notes.len(),
            })
            .collect(),
        note_count: score.note_count(),
        tempo_changes: score.tempos.len(),
        duration_ticks: score.end_tick(),
        midi_bytes,
        skipped_elements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SCORE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<score-partwise version="4.0">
  <movement-title>Test</movement-title>
  <part-list><score-part id="P1"><part-name>Piano</part-name></score-part></part-list>
  <part id="P1">
    <measure number="1">
      <attributes><divisions>1</divisions></attributes>
      <note><pitch><step>C</step><octave>4</octave></pitch><duration>2</duration></note>
    </measure>
  </part>
</score-partwise>"#;

    #[test]
    fn test_validate_source() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            validate_source(&dir.path().join("missing.xml")),
            Err(ConvertError::NotFound(_))
        ));
        assert!(matches!(validate_source(dir.path()), Err(ConvertError::NotAFile(_))));
    }

    #[test]
    fn test_prepare_output_dir_is_idempotent() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a/b/c/out.mid");
        prepare_output_dir(&dest).unwrap();
        prepare_output_dir(&dest).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
        // Bare file name has no parent to create
        prepare_output_dir(Path::new("out.mid")).unwrap();
    }

    #[test]
    fn test_report_contents() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("score.musicxml");
        let dest = dir.path().join("out/score.mid");
        fs::write(&source, SCORE).unwrap();

        let report = convert_musicxml_to_midi(&source, &dest, &ConversionSettings::default()).unwrap();
        assert_eq!(report.source_format, "musicxml");
        assert_eq!(report.title.as_deref(), Some("Test"));
        assert_eq!(report.parts.len(), 1);
        assert_eq!(report.parts[0].name, "Piano");
        assert_eq!(report.note_count, 1);
        assert_eq!(report.duration_ticks, 960);
        assert_eq!(report.midi_bytes, fs::metadata(&dest).unwrap().len() as usize);
        assert!(report.skipped_elements.is_empty());
    }

    #[test]
    fn test_title_can_be_dropped() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("score.musicxml");
        let dest = dir.path().join("score.mid");
        fs::write(&source, SCORE).unwrap();

        let settings = ConversionSettings {
            include_title: false,
            ..Default::default()
        };
        let report = convert_musicxml_to_midi(&source, &dest, &settings).unwrap();
        assert_eq!(report.title, None);
    }

    #[test]
    fn test_failed_parse_writes_nothing() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("bad.musicxml");
        let dest = dir.path().join("nested/bad.mid");
        fs::write(&source, "<score-partwise><part id=\"P1\">").unwrap();

        let err = convert_musicxml_to_midi(&source, &dest, &ConversionSettings::default()).unwrap_err();
        assert!(matches!(err, ConvertError::Score(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_invalid_settings_rejected_before_io() {
        let dir = tempdir().unwrap();
        let settings = ConversionSettings {
            ticks_per_quarter: 0,
            ..Default::default()
        };
        let err = convert_musicxml_to_midi(
            &dir.path().join("missing.xml"),
            &dir.path().join("out.mid"),
            &settings,
        )
        .unwrap_err();
        assert!(matches!(err, ConvertError::Settings(_)));
    }
}
