use std::{fmt::Write, path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use wikihistory::{
    config::{Config, DEFAULT_DATA_ROOT},
    fetch::{Direction, FetchConfig, FetchMode, ProgressSink, RetryPolicy, DEFAULT_EXPORT_URL},
    report,
    storage::RecordStore,
    sync::{SyncOptions, DEFAULT_MAX_PARALLEL},
};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DirectionArg {
    /// Oldest revisions first
    Asc,
    /// Newest revisions first
    Desc,
}

#[derive(Debug, clap::Parser)]
#[command(version, about = "Download the revision history of Wikipedia pages")]
struct CommandLine {
    /// Titles of the pages, e.g. Taylor_Swift
    #[arg(required = true)]
    pages: Vec<String>,

    /// Directory to store the revision data
    #[arg(long, default_value = DEFAULT_DATA_ROOT)]
    data_root: PathBuf,

    /// Download again even if the page was downloaded before
    #[arg(long)]
    full_refresh: bool,

    /// Only count and display stored revisions without downloading
    #[arg(long, conflicts_with = "full_refresh")]
    count_only: bool,

    /// Fetch at most this many revisions (capped at 1000) instead of the full history
    #[arg(long)]
    limit: Option<u32>,

    /// Which end of the history to take with --limit
    #[arg(long, value_enum, default_value_t = DirectionArg::Desc)]
    direction: DirectionArg,

    /// Export endpoint of the wiki
    #[arg(long, default_value = DEFAULT_EXPORT_URL)]
    export_url: String,

    /// Attempts per request before giving up
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Timeout per request attempt, in seconds
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    /// Maximum number of pages downloaded at the same time
    #[arg(long, default_value_t = DEFAULT_MAX_PARALLEL)]
    parallel: usize,

    /// Log debug output
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Hide download progress bars
    #[arg(long)]
    no_progress: bool,
}

impl CommandLine {
    fn config(&self) -> Config {
        let mode = match self.limit {
            Some(limit) => FetchMode::Limited {
                limit,
                direction: match self.direction {
                    DirectionArg::Asc => Direction::Asc,
                    DirectionArg::Desc => Direction::Desc,
                },
            },
            None => FetchMode::FullHistory,
        };

        Config {
            data_root: self.data_root.clone(),
            fetch: FetchConfig {
                export_url: self.export_url.clone(),
                timeout: Duration::from_secs(self.timeout_secs),
                retry: RetryPolicy {
                    max_attempts: self.max_attempts,
                    ..RetryPolicy::default()
                },
                ..FetchConfig::default()
            },
            sync: SyncOptions {
                mode,
                full_refresh: self.full_refresh,
                max_parallel: self.parallel,
                ..SyncOptions::default()
            },
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let log_level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not install logger: {}", e);
    }
}

/// Byte progress of one download. Starts as a spinner until the response size is known.
struct CliProgress {
    bar: Option<ProgressBar>,
}

impl CliProgress {
    fn new(multi: &MultiProgress, page: &str, enabled: bool) -> Self {
        if !enabled {
            return Self { bar: None };
        }

        let bar = multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {prefix} {bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(page.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar: Some(bar) }
    }
}

impl ProgressSink for CliProgress {
    fn on_bytes(&self, received: u64, total: Option<u64>) {
        let Some(bar) = &self.bar else {
            return;
        };

        if let Some(total) = total {
            if bar.length() != Some(total) {
                bar.set_length(total);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█▓▒░ "),
                );
            }
        }
        bar.set_position(received);
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}

// downloads that fail before the end of the body never call finish
impl Drop for CliProgress {
    fn drop(&mut self) {
        if let Some(bar) = &self.bar {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {}", cause);
        source = cause.source();
    }
    message
}

fn date_range_line(store: &RecordStore, page: &str, total: usize) -> Option<String> {
    let range = store
        .earliest(page)
        .and_then(|earliest| Ok((earliest, store.latest(page)?)));
    match range {
        Ok((earliest, latest)) => Some(report::format_date_range(page, total, earliest, latest)),
        Err(e) => {
            tracing::warn!(message = "could not determine date range", page, error = %error_chain(&e));
            None
        }
    }
}

fn print_counts(store: &RecordStore, pages: &[String]) -> ExitCode {
    let mut failed = false;
    for page in pages {
        match store.count_all(page) {
            Ok(counts) => {
                println!("{}", report::format_revision_counts(page, &counts));
                if let Some(line) = date_range_line(store, page, counts.total) {
                    println!("{}", line);
                }
            }
            Err(e) => {
                failed = true;
                eprintln!("{}", error_chain(&e));
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main() -> ExitCode {
    let args = CommandLine::parse();
    init_logging(args.verbose, args.quiet);
    let config = args.config();

    if args.count_only {
        return print_counts(&config.record_store(), &args.pages);
    }

    let orchestrator = match config.orchestrator() {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("{}", error_chain(&e));
            return ExitCode::FAILURE;
        }
    };

    let multi = MultiProgress::new();
    let show_progress = !args.no_progress && !args.quiet;
    let results = orchestrator.sync_many(&args.pages, config.sync, |page| {
        CliProgress::new(&multi, page, show_progress)
    });

    let mut failed = 0;
    for (page, result) in args.pages.iter().zip(results) {
        match result {
            Ok(sync_report) => {
                println!("{}", report::format_sync_report(&sync_report));
                if let Some(line) =
                    date_range_line(orchestrator.store(), page, sync_report.after.total)
                {
                    println!("{}", line);
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}", error_chain(&e));
            }
        }
    }

    if failed > 0 {
        tracing::error!(message = "some pages failed", failed, total = args.pages.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
