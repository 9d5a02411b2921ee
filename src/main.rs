fn main() {
    std::process::exit(musicxml_midi::cli::run(std::env::args_os()));
}
