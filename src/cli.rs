use crate::convert::convert_musicxml_to_midi;
use crate::settings::ConversionSettings;
use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Printed on stdout whenever the arguments cannot be parsed
pub const USAGE: &str = "Usage: convert_to_midi <musicxml_path> <midi_path>";

#[derive(Parser, Debug)]
#[command(name = "convert_to_midi")]
#[command(about = "Converts a MusicXML score (.musicxml, .xml or .mxl) to a Standard MIDI File")]
#[command(version)]
pub struct Cli {
    /// MusicXML score to read
    #[arg(value_name = "musicxml_path")]
    pub source: PathBuf,

    /// MIDI file to write; missing parent directories are created
    #[arg(value_name = "midi_path")]
    pub destination: PathBuf,

    /// MIDI resolution in ticks per quarter note [default: 480]
    #[arg(short = 't', long, value_parser = clap::value_parser!(u16).range(1..=32767))]
    pub ticks_per_quarter: Option<u16>,

    /// Tempo in BPM used when the score declares none [default: 120]
    #[arg(long)]
    pub tempo: Option<f64>,

    /// Note velocity before the first dynamics mark [default: 80]
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=127))]
    pub velocity: Option<u8>,

    /// JSON file with conversion settings; flags override it
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Print a JSON conversion report on stdout
    #[arg(long)]
    pub report: bool,

    /// Increase logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse `args`, run the conversion and return the process exit code
pub fn run<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => {
                    println!("{}", USAGE);
                    1
                }
            };
        }
    };

    init_logging(cli.verbose);

    match execute(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            1
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .try_init();
}

fn execute(cli: &Cli) -> Result<()> {
    let settings = build_settings(cli)?;
    let source = resolve_path(&cli.source)?;
    let destination = resolve_path(&cli.destination)?;

    log::debug!("settings: {:?}", settings);

    let report = convert_musicxml_to_midi(&source, &destination, &settings)
        .with_context(|| format!("failed to convert {}", source.display()))?;

    if cli.report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Defaults < settings file < flags
fn build_settings(cli: &Cli) -> Result<ConversionSettings> {
    let mut settings = match &cli.settings {
        Some(path) => ConversionSettings::from_file(path)?,
        None => ConversionSettings::default(),
    };
    if let Some(tpq) = cli.ticks_per_quarter {
        settings.ticks_per_quarter = tpq;
    }
    if let Some(tempo) = cli.tempo {
        settings.default_tempo_bpm = tempo;
    }
    if let Some(velocity) = cli.velocity {
        settings.default_velocity = velocity;
    }
    settings.validate()?;
    Ok(settings)
}

/// Expand a leading `~` and make the path absolute
fn resolve_path(path: &Path) -> Result<PathBuf> {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    };
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;
    Ok(cwd.join(expanded))
}
