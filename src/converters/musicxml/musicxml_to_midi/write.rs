use crate::converters::musicxml::musicxml_to_midi::{model::*, MxError, Result};
use midly::num::{u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind};

/// MIDI controller numbers
const CC_VOLUME: u8 = 7;
const CC_PAN: u8 = 10;

/// Largest variable-length delta time (28 bits)
const MAX_DELTA: u64 = 0x0FFF_FFFF;

/// Sort rank of events that share a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Meta,
    Setup,
    NoteOff,
    NoteOn,
}

/// Event at an absolute tick, before delta conversion
struct Timed<'a> {
    tick: u64,
    rank: Rank,
    kind: TrackEventKind<'a>,
}

/// Write Score IR to Standard MIDI File (SMF) Format 1
pub fn write_smf(score: &Score, out: &mut Vec<u8>) -> Result<()> {
    if score.tpq == 0 || score.tpq > 0x7FFF {
        return Err(MxError::Midi(format!("ticks per quarter {} out of range 1..=32767", score.tpq)));
    }

    let mut tracks = Vec::with_capacity(score.parts.len() + 1);

    // Track 0: Tempo and time signature map
    tracks.push(build_conductor_track(score)?);

    // Tracks 1+: One per part
    for part in &score.parts {
        tracks.push(build_part_track(part)?);
    }

    let header = Header {
        format: Format::Parallel,
        timing: Timing::Metrical(score.tpq.into()),
    };

    let smf = Smf { header, tracks };

    smf.write(out)
        .map_err(|e| MxError::Midi(format!("Failed to write MIDI: {}", e)))?;

    Ok(())
}

fn build_conductor_track(score: &Score) -> Result<Track<'_>> {
    let mut events = Vec::new();

    if let Some(title) = &score.title {
        events.push(Timed {
            tick: 0,
            rank: Rank::Meta,
            kind: TrackEventKind::Meta(MetaMessage::TrackName(title.as_bytes())),
        });
    }

    for ts in &score.timesigs {
        if ts.num == 0 || ts.den == 0 || !ts.den.is_power_of_two() {
            return Err(MxError::Midi(format!(
                "time signature {}/{} cannot be encoded",
                ts.num, ts.den
            )));
        }
        // Denominator as power of 2 (e.g., 4 -> 2, 8 -> 3)
        let denominator_power = ts.den.trailing_zeros() as u8;
        events.push(Timed {
            tick: ts.tick,
            rank: Rank::Meta,
            kind: TrackEventKind::Meta(MetaMessage::TimeSignature(
                ts.num,
                denominator_power,
                24, // MIDI clocks per metronome click
                8,  // 32nd notes per quarter note
            )),
        });
    }

    for key in &score.keysigs {
        events.push(Timed {
            tick: key.tick,
            rank: Rank::Meta,
            kind: TrackEventKind::Meta(MetaMessage::KeySignature(key.fifths, key.minor)),
        });
    }

    for tempo in &score.tempos {
        events.push(Timed {
            tick: tempo.tick,
            rank: Rank::Meta,
            kind: TrackEventKind::Meta(MetaMessage::Tempo(tempo_to_micros(tempo.bpm)?.into())),
        });
    }

    finish_track(events)
}

fn build_part_track(part: &Part) -> Result<Track<'_>> {
    let channel: u4 = part.channel.min(15).into();
    let mut events = Vec::with_capacity(part.notes.len() * 2 + 4);

    events.push(Timed {
        tick: 0,
        rank: Rank::Meta,
        kind: TrackEventKind::Meta(MetaMessage::TrackName(part.name.as_bytes())),
    });

    // Program change (instrument)
    if let Some(program) = part.program {
        events.push(setup_event(channel, MidiMessage::ProgramChange { program: u7::from(program.min(127)) }));
    }
    if let Some(volume) = part.volume {
        events.push(setup_event(channel, controller(CC_VOLUME, volume)));
    }
    if let Some(pan) = part.pan {
        events.push(setup_event(channel, controller(CC_PAN, pan)));
    }

    for note in &part.notes {
        let key = u7::from(note.pitch.min(127));
        events.push(Timed {
            tick: note.start_tick,
            rank: Rank::NoteOn,
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOn {
                    key,
                    vel: u7::from(note.vel.clamp(1, 127)),
                },
            },
        });
        events.push(Timed {
            tick: note.start_tick.saturating_add(note.dur_tick),
            rank: Rank::NoteOff,
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOff { key, vel: 0.into() },
            },
        });
    }

    drop_early_note_offs(&mut events);
    finish_track(events)
}

/// Keep a key held while any note on it is still sounding
///
/// Overlapping notes on one key (e.g. two voices in unison) share a single
/// MIDI key, so only the note-off that ends the last of them is emitted.
fn drop_early_note_offs(events: &mut Vec<Timed<'_>>) {
    events.sort_by_key(|e| (e.tick, e.rank));
    let mut sounding = [0u32; 128];
    events.retain(|e| match e.kind {
        TrackEventKind::Midi { message: MidiMessage::NoteOn { key, .. }, .. } => {
            sounding[key.as_int() as usize] += 1;
            true
        }
        TrackEventKind::Midi { message: MidiMessage::NoteOff { key, .. }, .. } => {
            let count = &mut sounding[key.as_int() as usize];
            *count = count.saturating_sub(1);
            *count == 0
        }
        _ => true,
    });
}

fn setup_event<'a>(channel: u4, message: MidiMessage) -> Timed<'a> {
    Timed {
        tick: 0,
        rank: Rank::Setup,
        kind: TrackEventKind::Midi { channel, message },
    }
}

fn controller(number: u8, value: u8) -> MidiMessage {
    MidiMessage::Controller {
        controller: u7::from(number),
        value: u7::from(value.min(127)),
    }
}

/// Microseconds per quarter note for a tempo in bpm
fn tempo_to_micros(bpm: f64) -> Result<u32> {
    if !(bpm.is_finite() && bpm > 0.0) {
        return Err(MxError::Midi(format!("tempo {} bpm cannot be encoded", bpm)));
    }
    // 24-bit field: slowest encodable tempo is ~3.58 bpm
    let micros = (60_000_000.0 / bpm).round().clamp(1.0, 0xFF_FFFF as f64);
    Ok(micros as u32)
}

/// Sort by (tick, rank), convert to delta times and append end-of-track
fn finish_track(mut events: Vec<Timed<'_>>) -> Result<Track<'_>> {
    // Stable: events with equal (tick, rank) keep insertion order
    events.sort_by_key(|e| (e.tick, e.rank));

    let mut track = Vec::with_capacity(events.len() + 1);
    let mut prev_tick = 0u64;
    for event in events {
        track.push(TrackEvent {
            delta: delta(event.tick - prev_tick)?,
            kind: event.kind,
        });
        prev_tick = event.tick;
    }

    // End of track
    track.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    Ok(track)
}

fn delta(ticks: u64) -> Result<u28> {
    if ticks > MAX_DELTA {
        return Err(MxError::Midi(format!("delta time {} exceeds the MIDI range", ticks)));
    }
    Ok(u28::from(ticks as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piano(notes: Vec<Note>) -> Part {
        Part {
            id: "P1".to_string(),
            name: "Piano".to_string(),
            channel: 0,
            program: Some(0),
            volume: None,
            pan: None,
            notes,
        }
    }

    fn score(parts: Vec<Part>) -> Score {
        let mut score = Score::new(480);
        score.tempos = vec![Tempo { tick: 0, bpm: 120.0 }];
        score.timesigs = vec![TimeSig { tick: 0, num: 4, den: 4 }];
        score.parts = parts;
        score
    }

    fn note(start_tick: u64, dur_tick: u64, pitch: u8) -> Note {
        Note { start_tick, dur_tick, pitch, vel: 64, voice: 1 }
    }

    fn write(score: &Score) -> Vec<u8> {
        let mut out = Vec::new();
        write_smf(score, &mut out).expect("Failed to write SMF");
        out
    }

    #[test]
    fn test_write_minimal_smf() {
        let out = write(&score(vec![piano(vec![note(0, 480, 60)])]));

        // Verify header
        assert_eq!(&out[0..4], b"MThd");
        // Format 1, 2 tracks, 480 tpq
        assert_eq!(&out[8..14], &[0x00, 0x01, 0x00, 0x02, 0x01, 0xE0]);
    }

    #[test]
    fn test_write_multi_track_smf() {
        let mut violin = piano(vec![note(0, 240, 64)]);
        violin.id = "P2".to_string();
        violin.name = "Violin".to_string();
        violin.channel = 1;
        violin.program = Some(40);

        let out = write(&score(vec![piano(vec![note(0, 480, 60)]), violin]));
        let smf = Smf::parse(&out).expect("valid SMF");
        // 1 conductor + 2 parts
        assert_eq!(smf.tracks.len(), 3);
        assert!(smf.tracks[2].iter().any(|e| matches!(
            e.kind,
            TrackEventKind::Midi { channel, message: MidiMessage::ProgramChange { program } }
                if channel.as_int() == 1 && program.as_int() == 40
        )));
    }

    #[test]
    fn test_conductor_track_contents() {
        let mut s = score(vec![]);
        s.title = Some("Etude".to_string());
        s.tempos.push(Tempo { tick: 1920, bpm: 90.0 });
        s.keysigs = vec![KeySig { tick: 0, fifths: 2, minor: false }];
        s.timesigs = vec![TimeSig { tick: 0, num: 6, den: 8 }];

        let out = write(&s);
        let smf = Smf::parse(&out).expect("valid SMF");
        let kinds: Vec<_> = smf.tracks[0].iter().map(|e| (e.delta.as_int(), e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (0, TrackEventKind::Meta(MetaMessage::TrackName(b"Etude"))),
                (0, TrackEventKind::Meta(MetaMessage::TimeSignature(6, 3, 24, 8))),
                (0, TrackEventKind::Meta(MetaMessage::KeySignature(2, false))),
                (0, TrackEventKind::Meta(MetaMessage::Tempo(500_000.into()))),
                (1920, TrackEventKind::Meta(MetaMessage::Tempo(666_667.into()))),
                (0, TrackEventKind::Meta(MetaMessage::EndOfTrack)),
            ]
        );
    }

    #[test]
    fn test_repeated_key_releases_before_restrike() {
        let out = write(&score(vec![piano(vec![note(0, 480, 60), note(480, 480, 60)])]));
        let smf = Smf::parse(&out).expect("valid SMF");

        let notes: Vec<_> = smf.tracks[1]
            .iter()
            .filter_map(|e| match e.kind {
                TrackEventKind::Midi { message: MidiMessage::NoteOn { .. }, .. } => Some(("on", e.delta.as_int())),
                TrackEventKind::Midi { message: MidiMessage::NoteOff { .. }, .. } => Some(("off", e.delta.as_int())),
                _ => None,
            })
            .collect();
        assert_eq!(notes, vec![("on", 0), ("off", 480), ("on", 0), ("off", 480)]);
    }

    #[test]
    fn test_unison_voices_hold_key_until_last_release() {
        let mut upper = note(0, 960, 60);
        upper.voice = 1;
        let mut lower = note(480, 960, 60);
        lower.voice = 2;
        let out = write(&score(vec![piano(vec![upper, lower])]));
        let smf = Smf::parse(&out).expect("valid SMF");

        let mut tick = 0;
        let mut notes = Vec::new();
        for e in smf.tracks[1].iter() {
            tick += e.delta.as_int();
            match e.kind {
                TrackEventKind::Midi { message: MidiMessage::NoteOn { .. }, .. } => notes.push(("on", tick)),
                TrackEventKind::Midi { message: MidiMessage::NoteOff { .. }, .. } => notes.push(("off", tick)),
                _ => {}
            }
        }
        // The first note's release at 960 would silence the second one
        assert_eq!(notes, vec![("on", 0), ("on", 480), ("off", 1440)]);
    }

    #[test]
    fn test_write_with_chord() {
        let out = write(&score(vec![piano(vec![note(0, 480, 60), note(0, 480, 64), note(0, 480, 67)])]));
        let smf = Smf::parse(&out).expect("valid SMF");
        let ons = smf.tracks[1]
            .iter()
            .filter(|e| matches!(e.kind, TrackEventKind::Midi { message: MidiMessage::NoteOn { .. }, .. }))
            .count();
        assert_eq!(ons, 3);
    }

    #[test]
    fn test_volume_and_pan_controllers() {
        let mut part = piano(vec![]);
        part.volume = Some(100);
        part.pan = Some(20);
        let out = write(&score(vec![part]));
        let smf = Smf::parse(&out).expect("valid SMF");

        let controllers: Vec<_> = smf.tracks[1]
            .iter()
            .filter_map(|e| match e.kind {
                TrackEventKind::Midi { message: MidiMessage::Controller { controller, value }, .. } => {
                    Some((controller.as_int(), value.as_int()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(controllers, vec![(7, 100), (10, 20)]);
    }

    #[test]
    fn test_invalid_time_signature_denominator() {
        let mut s = score(vec![]);
        s.timesigs = vec![TimeSig { tick: 0, num: 4, den: 3 }];
        let mut out = Vec::new();
        assert!(matches!(write_smf(&s, &mut out), Err(MxError::Midi(_))));
    }

    #[test]
    fn test_delta_out_of_range() {
        let s = score(vec![piano(vec![note(1 << 29, 480, 60)])]);
        let mut out = Vec::new();
        assert!(matches!(write_smf(&s, &mut out), Err(MxError::Midi(_))));
    }

    #[test]
    fn test_tempo_to_micros() {
        assert_eq!(tempo_to_micros(120.0).unwrap(), 500_000);
        assert_eq!(tempo_to_micros(60.0).unwrap(), 1_000_000);
        assert!(tempo_to_micros(0.0).is_err());
        assert!(tempo_to_micros(f64::NAN).is_err());
    }
}
