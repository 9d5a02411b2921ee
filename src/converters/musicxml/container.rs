//! Compressed MusicXML (`.mxl`) support
//!
//! An `.mxl` file is a ZIP archive whose `META-INF/container.xml` names the
//! score entry. Uncompressed documents are passed through untouched; the file
//! extension is never trusted, only the leading bytes.

use crate::converters::musicxml::musicxml_to_midi::{MxError, Result};
use std::borrow::Cow;
use std::io::{Cursor, Read};
use zip::result::ZipError;
use zip::ZipArchive;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const CONTAINER_PATH: &str = "META-INF/container.xml";

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// True when the bytes look like a ZIP archive
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

/// Return the MusicXML document held in `bytes`
///
/// Plain documents are borrowed; `.mxl` archives are unpacked.
pub fn read_score_bytes(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    if !is_compressed(bytes) {
        return Ok(Cow::Borrowed(bytes));
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| MxError::Archive(format!("unreadable .mxl archive: {}", e)))?;

    let score_path = match read_entry(&mut archive, CONTAINER_PATH)? {
        Some(container) => rootfile_path(&container)?,
        None => {
            log::debug!("{} missing, looking for a score entry", CONTAINER_PATH);
            first_score_entry(&mut archive)?
        }
    };

    log::debug!("reading score entry {}", score_path);
    let data = read_entry(&mut archive, &score_path)?
        .ok_or_else(|| MxError::Archive(format!("score entry '{}' not found in archive", score_path)))?;
    Ok(Cow::Owned(data))
}

fn read_entry(archive: &mut Archive, name: &str) -> Result<Option<Vec<u8>>> {
    match archive.by_name(name) {
        Ok(mut file) => {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .map_err(|e| MxError::Archive(format!("failed to read '{}': {}", name, e)))?;
            Ok(Some(buf))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(MxError::Archive(format!("failed to open '{}': {}", name, e))),
    }
}

/// `full-path` of the first `<rootfile>` in `container.xml`
fn rootfile_path(container: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(container)
        .map_err(|e| MxError::Archive(format!("{} is not UTF-8: {}", CONTAINER_PATH, e)))?;

    // roxmltree rejects DTDs
    let text: Cow<str> = if text.contains("<!DOCTYPE") {
        text.lines()
            .filter(|line| !line.trim_start().starts_with("<!DOCTYPE"))
            .collect::<Vec<_>>()
            .join("\n")
            .into()
    } else {
        text.into()
    };

    let doc = roxmltree::Document::parse(&text)
        .map_err(|e| MxError::Archive(format!("invalid {}: {}", CONTAINER_PATH, e)))?;

    doc.descendants()
        .filter(|n| n.has_tag_name("rootfile"))
        .find_map(|n| n.attribute("full-path"))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| MxError::Archive(format!("{} has no rootfile", CONTAINER_PATH)))
}

/// First `.xml`/`.musicxml` entry outside `META-INF/`, in archive order
fn first_score_entry(archive: &mut Archive) -> Result<String> {
    for index in 0..archive.len() {
        let file = archive
            .by_index(index)
            .map_err(|e| MxError::Archive(format!("failed to open entry {}: {}", index, e)))?;
        let name = file.name();
        let lower = name.to_ascii_lowercase();
        if !name.starts_with("META-INF/") && (lower.ends_with(".xml") || lower.ends_with(".musicxml")) {
            return Ok(name.to_string());
        }
    }
    Err(MxError::Archive("no MusicXML entry found in archive".to_string()))
}
