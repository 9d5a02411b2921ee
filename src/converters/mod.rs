//! Format converters
//!
//! This module contains converters from music notation formats to MIDI.

pub mod musicxml;
