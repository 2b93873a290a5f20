//! qrlog — QR kernel log recovery
//!
//! Decodes bulk QR payload exports, or watches a scanner app's history
//! database and writes each captured session to a numbered log file.

use clap::Parser;
use qrlog::batch::{self, BulkInput};
use qrlog::capture::Capture;
use qrlog::colorize::colorize;
use qrlog::config::{self, Config};
use qrlog::frame::FrameDecoder;
use qrlog::shutdown;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const SEPARATOR: &str = "----------------------------------------";

#[derive(Parser)]
#[command(name = "qrlog", about = "Recover kernel logs from QR code payloads")]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Watch the scan history database and write sessions to log files (default)
    Monitor(MonitorArgs),
    /// Decode a JSON export, hex dump or binary frame (reads stdin without FILE)
    Decode {
        /// Input file
        file: Option<PathBuf>,
    },
}

#[derive(clap::Args, Default)]
struct MonitorArgs {
    /// Scan history database
    #[arg(long)]
    db: Option<PathBuf>,
    /// Directory for numbered log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Always rewrite a single log file instead of numbering
    #[arg(long)]
    overwrite: bool,
}

impl MonitorArgs {
    fn apply(self, config: &mut Config) {
        if let Some(db) = self.db {
            config.store.path = db;
        }
        if let Some(dir) = self.log_dir {
            config.output.log_dir = dir;
        }
        if self.overwrite {
            config.output.overwrite = true;
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("QRLOG_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Config {
    match path {
        Some(path) => Config::load_from(path),
        None => config::load_config(),
    }
}

async fn run_monitor(config: Config) -> ExitCode {
    let capture = match Capture::start(&config).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "cannot start monitoring");
            return ExitCode::FAILURE;
        }
    };

    let (trigger, shutdown) = shutdown::channel();
    shutdown::spawn_signal_listener(trigger);

    capture.run(shutdown).await;
    info!("monitoring stopped");
    ExitCode::SUCCESS
}

fn read_input(file: Option<&PathBuf>) -> std::io::Result<Vec<u8>> {
    match file {
        Some(path) => std::fs::read(path),
        None => {
            eprintln!("Enter hex data or JSON array of QR code entries (Ctrl+D to finish):");
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

async fn run_decode(config: Config, file: Option<PathBuf>) -> ExitCode {
    let data = match read_input(file.as_ref()) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to read input");
            return ExitCode::FAILURE;
        }
    };

    let input = match BulkInput::detect(data) {
        Ok(i) => i,
        Err(e) => {
            error!(error = %e, "failed to parse input");
            return ExitCode::FAILURE;
        }
    };

    let decoder = FrameDecoder::new(&config.decompressor);
    let text = match input {
        BulkInput::Entries(entries) => batch::reassemble(&decoder, entries).await,
        BulkInput::Single(raw) => match decoder.decode(raw).await {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to decode payload");
                String::new()
            }
        },
    };

    if text.is_empty() {
        warn!("nothing decoded");
        return ExitCode::SUCCESS;
    }

    println!("\nDecoded kernel messages:");
    println!("{SEPARATOR}");
    let rendered = colorize(&text);
    println!("{}", rendered.strip_suffix('\n').unwrap_or(&rendered));
    println!("{SEPARATOR}");
    print!("{}", batch::duplicate_report(&text));
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(cli.config.as_ref());

    match cli.command {
        Some(Command::Decode { file }) => run_decode(config, file).await,
        Some(Command::Monitor(args)) => {
            args.apply(&mut config);
            run_monitor(config).await
        }
        None => run_monitor(config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_no_subcommand() {
        let cli = Cli::try_parse_from(["qrlog"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_verbose_two() {
        let cli = Cli::try_parse_from(["qrlog", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn cli_decode_with_file() {
        let cli = Cli::try_parse_from(["qrlog", "decode", "dump.json"]).unwrap();
        match cli.command {
            Some(Command::Decode { file }) => assert_eq!(file, Some(PathBuf::from("dump.json"))),
            _ => panic!("expected Decode command"),
        }
    }

    #[test]
    fn cli_decode_from_stdin() {
        let cli = Cli::try_parse_from(["qrlog", "decode"]).unwrap();
        match cli.command {
            Some(Command::Decode { file }) => assert!(file.is_none()),
            _ => panic!("expected Decode command"),
        }
    }

    #[test]
    fn cli_monitor_overrides_config() {
        let cli = Cli::try_parse_from([
            "qrlog",
            "monitor",
            "--db",
            "/data/history.db",
            "--log-dir",
            "/var/log/qr",
            "--overwrite",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);

        let mut config = Config::default();
        match cli.command {
            Some(Command::Monitor(args)) => args.apply(&mut config),
            _ => panic!("expected Monitor command"),
        }
        assert_eq!(config.store.path, PathBuf::from("/data/history.db"));
        assert_eq!(config.output.log_dir, PathBuf::from("/var/log/qr"));
        assert!(config.output.overwrite);
    }

    #[test]
    fn monitor_defaults_leave_config_untouched() {
        let mut config = Config::default();
        MonitorArgs::default().apply(&mut config);
        assert_eq!(config, Config::default());
    }
}
