use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, select, tick};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

use sniffstat::scan::Scanner;
use sniffstat::sniff::CaptureAnalyzer;
use sniffstat::store::{CaptureName, SaveOutcome, StatsStore};
use sniffstat::{EngineConfig, Error};

#[derive(Parser)]
#[command(name = "sniffstat", version, about = "Classify captures and aggregate traffic statistics")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify capture files and write one statistics file per capture
    Analyze(AnalyzeArgs),
    /// Poll a statistics tree and render windowed chart feeds
    Aggregate(AggregateArgs),
}

#[derive(Args)]
struct AnalyzeArgs {
    #[arg(long, default_value = ".")]
    stats_dir: PathBuf,

    /// Directory of the capture tool's drop-rate files
    #[arg(long)]
    capture_stats_dir: Option<PathBuf>,

    /// Replace statistics files that already exist
    #[arg(long)]
    overwrite: bool,

    /// Log the busiest values of the largest categories
    #[arg(long)]
    detail: bool,

    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Args)]
struct AggregateArgs {
    input_dir: PathBuf,

    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    #[arg(long)]
    hourly: bool,
    #[arg(long)]
    daily: bool,
    #[arg(long)]
    weekly: bool,
    #[arg(long)]
    monthly: bool,

    /// Ingest files of any age
    #[arg(long)]
    scan_all_dates: bool,

    /// Poll once and exit
    #[arg(long)]
    once: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Analyze(args) => analyze(args, config),
        Command::Aggregate(args) => aggregate(args, config),
    }
}

fn analyze(args: AnalyzeArgs, mut config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    if args.capture_stats_dir.is_some() {
        config.sampling.capture_stats_dir = args.capture_stats_dir.clone();
    }
    let store = StatsStore::new(&args.stats_dir, config.sampling.clone());
    let mut analyzer = CaptureAnalyzer::new(config.classifier.clone());

    for path in &args.files {
        let name = match CaptureName::parse(path) {
            Ok(name) => name,
            Err(e) => {
                warn!(path = %path.display(), "skipping: {}", e);
                continue;
            }
        };
        if !args.overwrite && store.has_stats(&name) {
            info!(path = %path.display(), "stats already written, skipping");
            continue;
        }

        info!(path = %path.display(), "processing");
        analyzer.reset();
        match read_frames(&mut analyzer, path) {
            Ok(frames) => info!(path = %path.display(), frames, "capture read"),
            Err(Error::CaptureUnsupported) => return Err(Error::CaptureUnsupported.into()),
            Err(e) => {
                error!(path = %path.display(), "failed to read capture: {}", e);
                continue;
            }
        }
        if args.detail {
            analyzer.report_detail(10);
        }

        let totals = analyzer.finish();
        match store.save(&name, &totals, args.overwrite) {
            Ok(SaveOutcome::Skipped) => info!(path = %path.display(), "stats appeared meanwhile, kept"),
            Ok(_) => {}
            Err(e) => error!(path = %path.display(), "failed to write stats: {}", e),
        }
    }
    Ok(())
}

#[cfg(feature = "capture")]
fn read_frames(analyzer: &mut CaptureAnalyzer, path: &Path) -> sniffstat::Result<u64> {
    let (reader, frames) = sniffstat::sniff::spawn_reader(path.to_path_buf());
    let count = analyzer.process_frames(frames);
    reader
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
    Ok(count)
}

#[cfg(not(feature = "capture"))]
fn read_frames(_analyzer: &mut CaptureAnalyzer, _path: &Path) -> sniffstat::Result<u64> {
    Err(Error::CaptureUnsupported)
}

fn aggregate(args: AggregateArgs, mut config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    if args.hourly || args.daily || args.weekly || args.monthly {
        config.windows.hourly = args.hourly;
        config.windows.daily = args.daily;
        config.windows.weekly = args.weekly;
        config.windows.monthly = args.monthly;
    }
    config.scan.scan_all_dates |= args.scan_all_dates;
    fs::create_dir_all(&args.output_dir)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.try_send(());
        })?;
    }

    let mut scanners = config
        .scan
        .views
        .iter()
        .map(|view| Scanner::new(&args.input_dir, view.clone(), &config, cancel.clone()))
        .collect::<sniffstat::Result<Vec<_>>>()?;
    let ticker = tick(Duration::from_secs(config.scan.poll_interval_secs.max(1)));

    loop {
        let now = Local::now().naive_local();
        for scanner in &mut scanners {
            match scanner.poll(now, &args.output_dir) {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    info!("interrupted, exiting");
                    return Ok(());
                }
                Err(e) => error!(view = %scanner.view().subtitle, "poll failed: {}", e),
            }
        }
        if args.once {
            return Ok(());
        }
        select! {
            recv(ticker) -> _ => {}
            recv(shutdown_rx) -> _ => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
