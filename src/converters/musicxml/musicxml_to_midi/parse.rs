use crate::converters::musicxml::musicxml_to_midi::defaults::{
    assign_channel, dynamic_mark, velocity_from_percent, DynamicMark, DEFAULT_PROGRAM,
    DRUM_CHANNEL,
};
use crate::converters::musicxml::musicxml_to_midi::{
    model::*, MxError, ParseOptions, ParseOutput, Result, SkippedElement,
};
use num_rational::Rational64;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Parse MusicXML bytes into our lean IR
///
/// Only `score-partwise` documents are accepted. Positions are tracked as
/// exact quarter-note fractions per part and rounded to `options.tpq` ticks
/// when an event is recorded.
pub fn parse_musicxml(xml: &[u8], options: &ParseOptions) -> Result<ParseOutput> {
    let mut cur = XmlCursor::new(xml);

    let (root, root_empty) = loop {
        match cur.next()? {
            Event::Start(e) => break (e, false),
            Event::Empty(e) => break (e, true),
            Event::Eof => return Err(MxError::Invalid("document has no root element".to_string())),
            _ => {}
        }
    };

    match root.local_name().as_ref() {
        b"score-partwise" => {}
        b"score-timewise" => {
            return Err(MxError::Unsupported(
                "score-timewise documents are not supported, convert to score-partwise first"
                    .to_string(),
            ))
        }
        other => {
            return Err(MxError::Invalid(format!(
                "expected <score-partwise> root element, found <{}>",
                String::from_utf8_lossy(other)
            )))
        }
    }

    let mut builder = ScoreBuilder::new(options);
    if !root_empty {
        builder.read_score(&mut cur)?;
    }
    Ok(builder.finish())
}

// ============================================================================
// EVENT CURSOR
// ============================================================================

/// Owned-event reader over a byte slice
///
/// Every event is detached from the read buffer, so nested readers can keep
/// pulling events while holding on to a start tag.
struct XmlCursor<'a> {
    reader: Reader<&'a [u8]>,
    buf: Vec<u8>,
}

impl<'a> XmlCursor<'a> {
    fn new(xml: &'a [u8]) -> Self {
        let mut reader = Reader::from_reader(xml);
        reader.trim_text(true);
        XmlCursor {
            reader,
            buf: Vec::new(),
        }
    }

    fn next(&mut self) -> Result<Event<'static>> {
        self.buf.clear();
        match self.reader.read_event_into(&mut self.buf) {
            Ok(event) => Ok(event.into_owned()),
            Err(e) => Err(MxError::Xml(format!(
                "XML error at position {}: {}",
                self.reader.buffer_position(),
                e
            ))),
        }
    }

    /// Consume the rest of an element whose start tag was just read
    fn skip(&mut self, name: &[u8]) -> Result<()> {
        let mut depth = 0usize;
        loop {
            match self.next()? {
                Event::Start(_) => depth += 1,
                Event::End(_) => {
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                Event::Eof => return Err(unexpected_eof(name)),
                _ => {}
            }
        }
    }

    /// Read the text content of an element whose start tag was just read
    fn text(&mut self, name: &[u8]) -> Result<String> {
        let mut out = String::new();
        let mut depth = 0usize;
        loop {
            match self.next()? {
                Event::Text(t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| MxError::Xml(format!("bad text in <{}>: {}", tag(name), e)))?;
                    out.push_str(&text);
                }
                Event::CData(c) => out.push_str(&String::from_utf8_lossy(&c.into_inner())),
                Event::Start(_) => depth += 1,
                Event::End(_) => {
                    if depth == 0 {
                        return Ok(out.trim().to_string());
                    }
                    depth -= 1;
                }
                Event::Eof => return Err(unexpected_eof(name)),
                _ => {}
            }
        }
    }

    /// Read text content and parse it as a number
    fn number<T: FromStr>(&mut self, name: &[u8]) -> Result<Option<T>> {
        Ok(self.text(name)?.parse().ok())
    }

    /// Read a decimal amount of divisions exactly
    fn divisions(&mut self, name: &[u8]) -> Result<Rational64> {
        let text = self.text(name)?;
        parse_decimal(&text)
            .ok_or_else(|| MxError::Invalid(format!("invalid <{}> value '{}'", tag(name), text)))
    }
}

fn tag(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn unexpected_eof(name: &[u8]) -> MxError {
    MxError::Xml(format!("unexpected end of document inside <{}>", tag(name)))
}

fn attr(e: &BytesStart, key: &[u8]) -> Result<Option<String>> {
    match e.try_get_attribute(key) {
        Ok(Some(a)) => a
            .unescape_value()
            .map(|v| Some(v.trim().to_string()))
            .map_err(|err| MxError::Xml(format!("bad attribute {}: {}", tag(key), err))),
        Ok(None) => Ok(None),
        Err(err) => Err(MxError::Xml(format!("bad attributes on <{}>: {}", tag(e.local_name().as_ref()), err))),
    }
}

fn attr_number<T: FromStr>(e: &BytesStart, key: &[u8]) -> Result<Option<T>> {
    Ok(attr(e, key)?.and_then(|v| v.parse().ok()))
}

/// First decimal number in a string such as "c. 120" or "92-96"
fn leading_number(s: &str) -> Option<f64> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Length of a metronome beat unit in quarter notes
fn beat_unit_quarters(unit: &str) -> Option<f64> {
    let q = match unit {
        "long" => 16.0,
        "breve" => 8.0,
        "whole" => 4.0,
        "half" => 2.0,
        "quarter" => 1.0,
        "eighth" => 0.5,
        "16th" => 0.25,
        "32nd" => 0.125,
        "64th" => 0.0625,
        "128th" => 0.031_25,
        _ => return None,
    };
    Some(q)
}

/// Largest `<alter>` in semitones
const MAX_ALTER: f64 = 127.0;

/// Largest `<transpose>` shift in semitones
const MAX_TRANSPOSE: i32 = 127;

/// Read `<octave>` or `<display-octave>`, which MusicXML limits to 0..=9
fn read_octave(cur: &mut XmlCursor, name: &[u8]) -> Result<i32> {
    let text = cur.text(name)?;
    match text.parse::<i32>() {
        Ok(octave) if (0..=9).contains(&octave) => Ok(octave),
        _ => Err(MxError::Invalid(format!("invalid <{}> value '{}'", tag(name), text))),
    }
}

// ============================================================================
// PART-LIST INFORMATION
// ============================================================================

/// What `<part-list>` says about a part
#[derive(Debug, Clone, Default)]
struct PartInfo {
    id: String,
    name: Option<String>,
    channel: Option<u8>,
    program: Option<u8>,
    volume: Option<u8>,
    pan: Option<u8>,
    // instrument id -> key for unpitched percussion
    unpitched: HashMap<String, u8>,
    default_unpitched: Option<u8>,
}

impl PartInfo {
    fn new(id: &str) -> Self {
        PartInfo {
            id: id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct MidiInstrument {
    channel: Option<u8>,
    program: Option<u8>,
    unpitched: Option<u8>,
    volume: Option<u8>,
    pan: Option<u8>,
}

/// 1-based MusicXML number to a 0-based MIDI value
fn one_based(value: i32, max: i32) -> u8 {
    (value - 1).clamp(0, max) as u8
}

// ============================================================================
// PER-PART STATE
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PendingTie {
    start: u64,
    end: u64,
    vel: u8,
}

struct PartState {
    divisions: u32,
    pos: Rational64,        // cursor in quarter notes
    last_onset: Rational64, // onset of the previous non-chord note
    velocity: u8,
    accent: Option<u8>,
    chord_velocity: u8,
    transpose: i32,
    measure: Option<String>,
    // (pitch, voice) -> open tie
    pending_ties: BTreeMap<(u8, u8), PendingTie>,
    notes: Vec<Note>,
}

impl PartState {
    fn new(velocity: u8) -> Self {
        PartState {
            divisions: 1,
            pos: Rational64::from_integer(0),
            last_onset: Rational64::from_integer(0),
            velocity,
            accent: None,
            chord_velocity: velocity,
            transpose: 0,
            measure: None,
            pending_ties: BTreeMap::new(),
            notes: Vec::new(),
        }
    }

    /// Position `divs` divisions after `from`, bounded by `MAX_QUARTERS`
    fn offset(&self, from: Rational64, divs: Rational64) -> Result<Rational64> {
        divs_to_quarters(divs, self.divisions)
            .and_then(|len| checked_add(from, len))
            .filter(|pos| {
                let limit = Rational64::from_integer(MAX_QUARTERS);
                *pos <= limit && *pos >= -limit
            })
            .ok_or_else(|| {
                MxError::Invalid(format!(
                    "duration of {} divisions in measure {} runs past the end of the timeline",
                    divs,
                    self.measure.as_deref().unwrap_or("?")
                ))
            })
    }

    fn advance(&mut self, divs: Rational64) -> Result<()> {
        self.pos = self.offset(self.pos, divs)?;
        Ok(())
    }

    fn backup(&mut self, divs: Rational64) -> Result<()> {
        self.pos = self.offset(self.pos, -divs)?;
        if self.pos < Rational64::from_integer(0) {
            self.pos = Rational64::from_integer(0);
        }
        Ok(())
    }

    fn apply_mark(&mut self, mark: DynamicMark) {
        match mark {
            DynamicMark::Level(v) => {
                self.velocity = v;
                self.accent = None;
            }
            DynamicMark::Accent(v) => self.accent = Some(v),
            DynamicMark::AccentThen(accent, level) => {
                self.velocity = level;
                self.accent = Some(accent);
            }
        }
    }

    /// Record a sounding note, merging ties on the same key and voice
    fn sound(&mut self, start: u64, end: u64, pitch: u8, vel: u8, voice: u8, tie_start: bool, tie_stop: bool) {
        let key = (pitch, voice);
        match (tie_start, tie_stop) {
            (false, false) => self.push(start, end, pitch, vel, voice),
            (true, false) => {
                if let Some(open) = self.pending_ties.remove(&key) {
                    self.push(open.start, open.end, pitch, open.vel, voice);
                }
                self.pending_ties.insert(key, PendingTie { start, end, vel });
            }
            (true, true) => match self.pending_ties.get_mut(&key) {
                Some(open) => open.end = open.end.max(end),
                None => {
                    self.pending_ties.insert(key, PendingTie { start, end, vel });
                }
            },
            (false, true) => match self.pending_ties.remove(&key) {
                Some(open) => self.push(open.start, open.end.max(end), pitch, open.vel, voice),
                None => self.push(start, end, pitch, vel, voice),
            },
        }
    }

    fn push(&mut self, start: u64, end: u64, pitch: u8, vel: u8, voice: u8) {
        if end <= start {
            return;
        }
        self.notes.push(Note {
            start_tick: start,
            dur_tick: end - start,
            pitch,
            vel,
            voice,
        });
    }

    fn finish(mut self) -> Vec<Note> {
        let open: Vec<_> = std::mem::take(&mut self.pending_ties).into_iter().collect();
        for ((pitch, voice), tie) in open {
            self.push(tie.start, tie.end, pitch, tie.vel, voice);
        }
        self.notes.sort_by_key(|n| (n.start_tick, n.pitch, n.voice));
        self.notes
    }
}

/// Everything read from one `<note>` element
#[derive(Debug, Default)]
struct NoteData {
    grace: bool,
    cue: bool,
    chord: bool,
    rest: bool,
    step: Option<String>,
    alter: f64,
    octave: i32,
    unpitched: bool,
    display_step: Option<String>,
    display_octave: i32,
    instrument: Option<String>,
    duration: Option<Rational64>,
    voice: u8,
    tie_start: bool,
    tie_stop: bool,
    tied_start: bool,
    tied_stop: bool,
}

// ============================================================================
// SCORE BUILDER
// ============================================================================

struct ScoreBuilder<'o> {
    options: &'o ParseOptions,
    movement_title: Option<String>,
    work_title: Option<String>,
    part_infos: Vec<PartInfo>,
    tempos: BTreeMap<u64, f64>,
    timesigs: BTreeMap<u64, (u8, u8)>,
    keysigs: BTreeMap<u64, (i8, bool)>,
    parts: Vec<Part>,
    skipped: Vec<SkippedElement>,
}

impl<'o> ScoreBuilder<'o> {
    fn new(options: &'o ParseOptions) -> Self {
        ScoreBuilder {
            options,
            movement_title: None,
            work_title: None,
            part_infos: Vec::new(),
            tempos: BTreeMap::new(),
            timesigs: BTreeMap::new(),
            keysigs: BTreeMap::new(),
            parts: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn finish(mut self) -> ParseOutput {
        if self.tempos.is_empty() {
            self.tempos.insert(0, self.options.default_tempo_bpm);
        }
        if self.timesigs.is_empty() {
            self.timesigs.insert(0, (4, 4));
        }

        let mut score = Score::new(self.options.tpq);
        score.title = self
            .movement_title
            .filter(|t| !t.is_empty())
            .or(self.work_title.filter(|t| !t.is_empty()));
        score.tempos = self
            .tempos
            .into_iter()
            .map(|(tick, bpm)| Tempo { tick, bpm })
            .collect();
        score.timesigs = self
            .timesigs
            .into_iter()
            .map(|(tick, (num, den))| TimeSig { tick, num, den })
            .collect();
        score.keysigs = self
            .keysigs
            .into_iter()
            .map(|(tick, (fifths, minor))| KeySig { tick, fifths, minor })
            .collect();
        score.parts = self.parts;

        ParseOutput {
            score,
            skipped_elements: self.skipped,
        }
    }

    fn tick(&self, quarters: Rational64) -> u64 {
        quarters_to_ticks(quarters, self.options.tpq)
    }

    fn skip_element(&mut self, element: &str, part_id: &str, state: &PartState, reason: &str) {
        log::debug!(
            "skipping <{}> in part {} measure {}: {}",
            element,
            part_id,
            state.measure.as_deref().unwrap_or("?"),
            reason
        );
        self.skipped.push(SkippedElement {
            element_type: element.to_string(),
            measure_number: state.measure.clone(),
            part_id: Some(part_id.to_string()),
            reason: reason.to_string(),
        });
    }

    fn add_tempo(&mut self, tick: u64, bpm: f64) {
        if bpm.is_finite() && bpm > 0.0 {
            self.tempos.entry(tick).or_insert(bpm);
        } else {
            log::warn!("ignoring invalid tempo {} at tick {}", bpm, tick);
        }
    }

    fn read_score(&mut self, cur: &mut XmlCursor) -> Result<()> {
        loop {
            match cur.next()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"movement-title" => self.movement_title = Some(cur.text(b"movement-title")?),
                    b"work" => self.read_work(cur)?,
                    b"part-list" => self.read_part_list(cur)?,
                    b"part" => {
                        let id = self.part_id(&e)?;
                        self.read_part(cur, id, false)?;
                    }
                    other => cur.skip(other)?,
                },
                Event::Empty(e) => {
                    if e.local_name().as_ref() == b"part" {
                        let id = self.part_id(&e)?;
                        self.read_part(cur, id, true)?;
                    }
                }
                Event::End(_) => return Ok(()),
                Event::Eof => return Err(unexpected_eof(b"score-partwise")),
                _ => {}
            }
        }
    }

    fn part_id(&self, e: &BytesStart) -> Result<String> {
        Ok(attr(e, b"id")?.unwrap_or_else(|| format!("P{}", self.parts.len() + 1)))
    }

    fn read_work(&mut self, cur: &mut XmlCursor) -> Result<()> {
        loop {
            match cur.next()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"work-title" => self.work_title = Some(cur.text(b"work-title")?),
                    other => cur.skip(other)?,
                },
                Event::End(_) => return Ok(()),
                Event::Eof => return Err(unexpected_eof(b"work")),
                _ => {}
            }
        }
    }

    fn read_part_list(&mut self, cur: &mut XmlCursor) -> Result<()> {
        loop {
            match cur.next()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"score-part" => {
                        let id = attr(&e, b"id")?.unwrap_or_default();
                        let info = read_score_part(cur, &id)?;
                        self.part_infos.push(info);
                    }
                    other => cur.skip(other)?,
                },
                Event::Empty(e) => {
                    if e.local_name().as_ref() == b"score-part" {
                        let id = attr(&e, b"id")?.unwrap_or_default();
                        self.part_infos.push(PartInfo::new(&id));
                    }
                }
                Event::End(_) => return Ok(()),
                Event::Eof => return Err(unexpected_eof(b"part-list")),
                _ => {}
            }
        }
    }

    fn read_part(&mut self, cur: &mut XmlCursor, id: String, empty: bool) -> Result<()> {
        let info = self
            .part_infos
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .unwrap_or_else(|| PartInfo::new(&id));
        let index = self.parts.len();
        let mut state = PartState::new(self.options.default_velocity);

        if !empty {
            loop {
                match cur.next()? {
                    Event::Start(e) => match e.local_name().as_ref() {
                        b"measure" => {
                            state.measure = attr(&e, b"number")?;
                            self.read_measure(cur, &info, &mut state)?;
                        }
                        other => cur.skip(other)?,
                    },
                    Event::End(_) => break,
                    Event::Eof => return Err(unexpected_eof(b"part")),
                    _ => {}
                }
            }
        }

        let channel = info.channel.unwrap_or_else(|| assign_channel(index));
        let program = info
            .program
            .or(if channel == DRUM_CHANNEL { None } else { Some(DEFAULT_PROGRAM) });
        let notes = state.finish();

        log::debug!(
            "parsed part {} ({} notes, channel {})",
            id,
            notes.len(),
            channel
        );

        self.parts.push(Part {
            name: info.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| id.clone()),
            id,
            channel,
            program,
            volume: info.volume,
            pan: info.pan,
            notes,
        });
        Ok(())
    }

    fn read_measure(&mut self, cur: &mut XmlCursor, info: &PartInfo, state: &mut PartState) -> Result<()> {
        loop {
            match cur.next()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"attributes" => self.read_attributes(cur, info, state)?,
                    b"note" => {
                        let dynamics = attr_number::<f64>(&e, b"dynamics")?;
                        let data = read_note(cur)?;
                        self.add_note(data, dynamics, info, state)?;
                    }
                    b"backup" => {
                        let divs = read_duration(cur, b"backup")?;
                        state.backup(divs)?;
                    }
                    b"forward" => {
                        let divs = read_duration(cur, b"forward")?;
                        state.advance(divs)?;
                    }
                    b"direction" => self.read_direction(cur, state)?,
                    b"sound" => {
                        let at = state.pos;
                        self.apply_sound(&e, state, at)?;
                        cur.skip(b"sound")?;
                    }
                    b"barline" => self.read_barline(cur, info, state)?,
                    b"harmony" => {
                        self.skip_element("harmony", &info.id, state, "chord symbols are not played");
                        cur.skip(b"harmony")?;
                    }
                    other => cur.skip(other)?,
                },
                Event::Empty(e) => {
                    if e.local_name().as_ref() == b"sound" {
                        let at = state.pos;
                        self.apply_sound(&e, state, at)?;
                    }
                }
                Event::End(_) => return Ok(()),
                Event::Eof => return Err(unexpected_eof(b"measure")),
                _ => {}
            }
        }
    }

    fn read_attributes(&mut self, cur: &mut XmlCursor, info: &PartInfo, state: &mut PartState) -> Result<()> {
        loop {
            match cur.next()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"divisions" => {
                        let text = cur.text(b"divisions")?;
                        state.divisions = match text.parse::<f64>() {
                            Ok(d) if d >= 1.0 && d <= u32::MAX as f64 => d.round() as u32,
                            _ => {
                                return Err(MxError::Invalid(format!(
                                    "invalid <divisions> value '{}' in part {}",
                                    text, info.id
                                )))
                            }
                        };
                    }
                    b"key" => {
                        if let Some(key) = read_key(cur)? {
                            let tick = self.tick(state.pos);
                            self.keysigs.entry(tick).or_insert(key);
                        }
                    }
                    b"time" => match read_time(cur)? {
                        Some((num, den)) if den.is_power_of_two() => {
                            let tick = self.tick(state.pos);
                            self.timesigs.entry(tick).or_insert((num, den));
                        }
                        Some((num, den)) => {
                            let reason = format!("time signature {}/{} has no MIDI equivalent", num, den);
                            self.skip_element("time", &info.id, state, &reason);
                        }
                        None => {}
                    },
                    b"transpose" => state.transpose = read_transpose(cur)?,
                    other => cur.skip(other)?,
                },
                Event::End(_) => return Ok(()),
                Event::Eof => return Err(unexpected_eof(b"attributes")),
                _ => {}
            }
        }
    }

    fn add_note(&mut self, data: NoteData, dynamics: Option<f64>, info: &PartInfo, state: &mut PartState) -> Result<()> {
        if data.grace {
            self.skip_element("grace", &info.id, state, "grace notes carry no duration");
            return Ok(());
        }

        let divs = data.duration.unwrap_or_else(|| {
            log::warn!(
                "note without <duration> in part {} measure {}",
                info.id,
                state.measure.as_deref().unwrap_or("?")
            );
            Rational64::from_integer(0)
        });
        let onset = if data.chord { state.last_onset } else { state.pos };
        let end = state.offset(onset, divs)?;
        if !data.chord {
            state.last_onset = state.pos;
            state.pos = end;
        }

        if data.rest || data.cue {
            return Ok(());
        }

        let pitch = if data.unpitched {
            data.instrument
                .as_ref()
                .and_then(|id| info.unpitched.get(id).copied())
                .or(info.default_unpitched)
                .or_else(|| {
                    data.display_step
                        .as_deref()
                        .and_then(|step| pitch_to_midi(step, 0, data.display_octave))
                })
        } else {
            data.step.as_deref().and_then(|step| {
                pitch_to_midi(step, data.alter.round() as i32 + state.transpose, data.octave)
            })
        };
        let Some(pitch) = pitch else {
            self.skip_element("note", &info.id, state, "note has no playable pitch");
            return Ok(());
        };

        let vel = if data.chord {
            dynamics.map(velocity_from_percent).unwrap_or(state.chord_velocity)
        } else {
            let vel = dynamics
                .map(velocity_from_percent)
                .or_else(|| state.accent.take())
                .unwrap_or(state.velocity);
            state.chord_velocity = vel;
            vel
        };

        let start = self.tick(onset);
        let end = self.tick(end);
        let (tie_start, tie_stop) = if data.tie_start || data.tie_stop {
            (data.tie_start, data.tie_stop)
        } else {
            (data.tied_start, data.tied_stop)
        };
        state.sound(start, end, pitch, vel, data.voice, tie_start, tie_stop);
        Ok(())
    }

    fn read_direction(&mut self, cur: &mut XmlCursor, state: &mut PartState) -> Result<()> {
        let mut metronome: Option<f64> = None;
        let mut marks: Vec<DynamicMark> = Vec::new();
        let mut offset_divs = Rational64::from_integer(0);
        let mut sounds: Vec<BytesStart<'static>> = Vec::new();

        loop {
            match cur.next()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"direction-type" => read_direction_type(cur, &mut metronome, &mut marks)?,
                    b"offset" => offset_divs = cur.divisions(b"offset")?,
                    b"sound" => {
                        cur.skip(b"sound")?;
                        sounds.push(e.clone());
                    }
                    other => cur.skip(other)?,
                },
                Event::Empty(e) => {
                    if e.local_name().as_ref() == b"sound" {
                        sounds.push(e);
                    }
                }
                Event::End(_) => break,
                Event::Eof => return Err(unexpected_eof(b"direction")),
                _ => {}
            }
        }

        let at = state.offset(state.pos, offset_divs)?;
        for mark in marks {
            state.apply_mark(mark);
        }
        let mut sound_tempo = false;
        for sound in &sounds {
            sound_tempo |= self.apply_sound(sound, state, at)?;
        }
        if !sound_tempo {
            if let Some(bpm) = metronome {
                let tick = self.tick(at);
                self.add_tempo(tick, bpm);
            }
        }
        Ok(())
    }

    /// Apply `tempo` and `dynamics` attributes of a `<sound>` element.
    /// Returns whether a tempo was present.
    fn apply_sound(&mut self, e: &BytesStart, state: &mut PartState, at: Rational64) -> Result<bool> {
        if let Some(pct) = attr_number::<f64>(e, b"dynamics")? {
            state.velocity = velocity_from_percent(pct);
            state.accent = None;
        }
        match attr_number::<f64>(e, b"tempo")? {
            Some(bpm) => {
                let tick = self.tick(at);
                self.add_tempo(tick, bpm);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_barline(&mut self, cur: &mut XmlCursor, info: &PartInfo, state: &mut PartState) -> Result<()> {
        loop {
            match cur.next()? {
                Event::Start(e) => {
                    let name = e.local_name().as_ref().to_vec();
                    self.note_barline_child(&name, info, state);
                    cur.skip(&name)?;
                }
                Event::Empty(e) => self.note_barline_child(e.local_name().as_ref(), info, state),
                Event::End(_) => return Ok(()),
                Event::Eof => return Err(unexpected_eof(b"barline")),
                _ => {}
            }
        }
    }

    fn note_barline_child(&mut self, name: &[u8], info: &PartInfo, state: &PartState) {
        match name {
            b"repeat" => self.skip_element("repeat", &info.id, state, "repeats are played once, not unrolled"),
            b"ending" => self.skip_element("ending", &info.id, state, "volta endings are played in sequence"),
            _ => {}
        }
    }
}

// ============================================================================
// ELEMENT READERS
// ============================================================================

fn read_score_part(cur: &mut XmlCursor, id: &str) -> Result<PartInfo> {
    let mut info = PartInfo::new(id);
    let mut first_instrument = true;
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"part-name" => info.name = Some(cur.text(b"part-name")?),
                b"midi-instrument" => {
                    let instrument_id = attr(&e, b"id")?;
                    let midi = read_midi_instrument(cur)?;
                    if let (Some(key), Some(inst)) = (midi.unpitched, instrument_id) {
                        info.unpitched.insert(inst, key);
                    }
                    if first_instrument {
                        first_instrument = false;
                        info.channel = midi.channel;
                        info.program = midi.program;
                        info.volume = midi.volume;
                        info.pan = midi.pan;
                        info.default_unpitched = midi.unpitched;
                    }
                }
                other => cur.skip(other)?,
            },
            Event::End(_) => return Ok(info),
            Event::Eof => return Err(unexpected_eof(b"score-part")),
            _ => {}
        }
    }
}

fn read_midi_instrument(cur: &mut XmlCursor) -> Result<MidiInstrument> {
    let mut midi = MidiInstrument::default();
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"midi-channel" => {
                    midi.channel = cur.number::<i32>(b"midi-channel")?.map(|c| one_based(c, 15));
                }
                b"midi-program" => {
                    midi.program = cur.number::<i32>(b"midi-program")?.map(|p| one_based(p, 127));
                }
                b"midi-unpitched" => {
                    midi.unpitched = cur.number::<i32>(b"midi-unpitched")?.map(|k| one_based(k, 127));
                }
                b"volume" => {
                    midi.volume = cur
                        .number::<f64>(b"volume")?
                        .map(|v| (v * 127.0 / 100.0).round().clamp(0.0, 127.0) as u8);
                }
                b"pan" => {
                    midi.pan = cur
                        .number::<f64>(b"pan")?
                        .map(|p| ((p.clamp(-90.0, 90.0) + 90.0) * 127.0 / 180.0).round() as u8);
                }
                other => cur.skip(other)?,
            },
            Event::End(_) => return Ok(midi),
            Event::Eof => return Err(unexpected_eof(b"midi-instrument")),
            _ => {}
        }
    }
}

fn read_note(cur: &mut XmlCursor) -> Result<NoteData> {
    let mut data = NoteData {
        octave: 4,
        display_octave: 4,
        voice: 1,
        ..Default::default()
    };
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"pitch" => read_pitch(cur, &mut data)?,
                b"unpitched" => {
                    data.unpitched = true;
                    read_display_pitch(cur, &mut data)?;
                }
                b"duration" => {
                    let divs = cur.divisions(b"duration")?;
                    if divs < Rational64::from_integer(0) {
                        return Err(MxError::Invalid(format!("negative <duration> {}", divs)));
                    }
                    data.duration = Some(divs);
                }
                b"voice" => data.voice = cur.number(b"voice")?.unwrap_or(1),
                b"notations" => read_notations(cur, &mut data)?,
                b"grace" => {
                    data.grace = true;
                    cur.skip(b"grace")?;
                }
                b"rest" => {
                    data.rest = true;
                    cur.skip(b"rest")?;
                }
                b"tie" => {
                    mark_tie(&e, &mut data.tie_start, &mut data.tie_stop)?;
                    cur.skip(b"tie")?;
                }
                other => cur.skip(other)?,
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"grace" => data.grace = true,
                b"cue" => data.cue = true,
                b"chord" => data.chord = true,
                b"rest" => data.rest = true,
                b"unpitched" => data.unpitched = true,
                b"tie" => mark_tie(&e, &mut data.tie_start, &mut data.tie_stop)?,
                b"instrument" => data.instrument = attr(&e, b"id")?,
                _ => {}
            },
            Event::End(_) => return Ok(data),
            Event::Eof => return Err(unexpected_eof(b"note")),
            _ => {}
        }
    }
}

fn mark_tie(e: &BytesStart, start: &mut bool, stop: &mut bool) -> Result<()> {
    match attr(e, b"type")?.as_deref() {
        Some("start") => *start = true,
        Some("stop") => *stop = true,
        Some("continue") => {
            *start = true;
            *stop = true;
        }
        _ => {}
    }
    Ok(())
}

fn read_pitch(cur: &mut XmlCursor, data: &mut NoteData) -> Result<()> {
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"step" => data.step = Some(cur.text(b"step")?.to_uppercase()),
                b"alter" => {
                    data.alter = cur.number(b"alter")?.unwrap_or(0.0);
                    if !(data.alter.is_finite() && data.alter.abs() <= MAX_ALTER) {
                        return Err(MxError::Invalid(format!("<alter> {} out of range", data.alter)));
                    }
                }
                b"octave" => data.octave = read_octave(cur, b"octave")?,
                other => cur.skip(other)?,
            },
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(unexpected_eof(b"pitch")),
            _ => {}
        }
    }
}

fn read_display_pitch(cur: &mut XmlCursor, data: &mut NoteData) -> Result<()> {
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"display-step" => data.display_step = Some(cur.text(b"display-step")?.to_uppercase()),
                b"display-octave" => data.display_octave = read_octave(cur, b"display-octave")?,
                other => cur.skip(other)?,
            },
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(unexpected_eof(b"unpitched")),
            _ => {}
        }
    }
}

fn read_notations(cur: &mut XmlCursor, data: &mut NoteData) -> Result<()> {
    loop {
        match cur.next()? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"tied" {
                    mark_tie(&e, &mut data.tied_start, &mut data.tied_stop)?;
                }
                cur.skip(e.local_name().as_ref())?;
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"tied" {
                    mark_tie(&e, &mut data.tied_start, &mut data.tied_stop)?;
                }
            }
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(unexpected_eof(b"notations")),
            _ => {}
        }
    }
}

/// Read the `<duration>` child of `<backup>` or `<forward>`
fn read_duration(cur: &mut XmlCursor, name: &[u8]) -> Result<Rational64> {
    let mut divs = Rational64::from_integer(0);
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"duration" => {
                    divs = cur.divisions(b"duration")?;
                    if divs < Rational64::from_integer(0) {
                        return Err(MxError::Invalid(format!("negative <duration> {} in <{}>", divs, tag(name))));
                    }
                }
                other => cur.skip(other)?,
            },
            Event::End(_) => return Ok(divs),
            Event::Eof => return Err(unexpected_eof(name)),
            _ => {}
        }
    }
}

fn read_key(cur: &mut XmlCursor) -> Result<Option<(i8, bool)>> {
    let mut fifths: Option<i8> = None;
    let mut minor = false;
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"fifths" => fifths = cur.number::<i8>(b"fifths")?.map(|f| f.clamp(-7, 7)),
                b"mode" => minor = cur.text(b"mode")? == "minor",
                other => cur.skip(other)?,
            },
            Event::End(_) => return Ok(fifths.map(|f| (f, minor))),
            Event::Eof => return Err(unexpected_eof(b"key")),
            _ => {}
        }
    }
}

/// Read `<time>`; additive numerators such as `3+2` are summed
fn read_time(cur: &mut XmlCursor) -> Result<Option<(u8, u8)>> {
    let mut num = 0u32;
    let mut den: Option<u32> = None;
    let mut senza_misura = false;
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"beats" => {
                    let text = cur.text(b"beats")?;
                    let invalid = || MxError::Invalid(format!("invalid <beats> value '{}'", text));
                    for part in text.split('+') {
                        let beats = part.trim().parse::<u32>().map_err(|_| invalid())?;
                        num = num.checked_add(beats).ok_or_else(invalid)?;
                    }
                }
                b"beat-type" => {
                    if den.is_none() {
                        den = cur.number(b"beat-type")?;
                    } else {
                        cur.skip(b"beat-type")?;
                    }
                }
                b"senza-misura" => {
                    senza_misura = true;
                    cur.skip(b"senza-misura")?;
                }
                other => cur.skip(other)?,
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"senza-misura" {
                    senza_misura = true;
                }
            }
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(b"time")),
            _ => {}
        }
    }

    if senza_misura {
        return Ok(None);
    }
    match den {
        Some(den) if num > 0 && den > 0 => {
            let num = u8::try_from(num)
                .map_err(|_| MxError::Invalid(format!("time signature numerator {} is too large", num)))?;
            let den = u8::try_from(den)
                .map_err(|_| MxError::Invalid(format!("time signature denominator {} is too large", den)))?;
            Ok(Some((num, den)))
        }
        _ => Ok(None),
    }
}

fn read_transpose(cur: &mut XmlCursor) -> Result<i32> {
    let mut chromatic = 0i32;
    let mut octave_change = 0i32;
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"chromatic" => {
                    let value = cur.number::<f64>(b"chromatic")?.unwrap_or(0.0);
                    if !(value.is_finite() && value.abs() <= MAX_TRANSPOSE as f64) {
                        return Err(MxError::Invalid(format!("<chromatic> {} out of range", value)));
                    }
                    chromatic = value.round() as i32;
                }
                b"octave-change" => {
                    octave_change = cur.number(b"octave-change")?.unwrap_or(0);
                    if !(-MAX_TRANSPOSE / 12..=MAX_TRANSPOSE / 12).contains(&octave_change) {
                        return Err(MxError::Invalid(format!("<octave-change> {} out of range", octave_change)));
                    }
                }
                other => cur.skip(other)?,
            },
            Event::End(_) => return Ok(chromatic + 12 * octave_change),
            Event::Eof => return Err(unexpected_eof(b"transpose")),
            _ => {}
        }
    }
}

fn read_direction_type(cur: &mut XmlCursor, metronome: &mut Option<f64>, marks: &mut Vec<DynamicMark>) -> Result<()> {
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"metronome" => {
                    let bpm = read_metronome(cur)?;
                    if metronome.is_none() {
                        *metronome = bpm;
                    }
                }
                b"dynamics" => read_dynamics(cur, marks)?,
                other => cur.skip(other)?,
            },
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(unexpected_eof(b"direction-type")),
            _ => {}
        }
    }
}

/// Tempo in quarter notes per minute from `<metronome>`
fn read_metronome(cur: &mut XmlCursor) -> Result<Option<f64>> {
    let mut unit: Option<f64> = None;
    let mut units_seen = 0;
    let mut dots = 0;
    let mut per_minute: Option<f64> = None;
    loop {
        match cur.next()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"beat-unit" => {
                    units_seen += 1;
                    let text = cur.text(b"beat-unit")?;
                    if units_seen == 1 {
                        unit = beat_unit_quarters(&text);
                    }
                }
                b"beat-unit-dot" => {
                    if units_seen == 1 {
                        dots += 1;
                    }
                    cur.skip(b"beat-unit-dot")?;
                }
                b"per-minute" => per_minute = leading_number(&cur.text(b"per-minute")?),
                other => cur.skip(other)?,
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"beat-unit-dot" && units_seen == 1 {
                    dots += 1;
                }
            }
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(b"metronome")),
            _ => {}
        }
    }

    Ok(match (unit, per_minute) {
        (Some(unit), Some(pm)) => {
            let dotted = unit * (2.0 - 0.5f64.powi(dots));
            Some(pm * dotted)
        }
        _ => None,
    })
}

fn read_dynamics(cur: &mut XmlCursor, marks: &mut Vec<DynamicMark>) -> Result<()> {
    loop {
        match cur.next()? {
            Event::Start(e) => {
                if let Some(mark) = dynamic_mark(&tag(e.local_name().as_ref())) {
                    marks.push(mark);
                }
                cur.skip(e.local_name().as_ref())?;
            }
            Event::Empty(e) => {
                if let Some(mark) = dynamic_mark(&tag(e.local_name().as_ref())) {
                    marks.push(mark);
                }
            }
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(unexpected_eof(b"dynamics")),
            _ => {}
        }
    }
}
