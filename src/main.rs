use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spread_split::doublepage::scan::{scan_directory, ScanOptions};
use spread_split::doublepage::{CachedDetector, DetectionConfig, Detector, HeuristicDetector};

const DETECTION_CACHE_SIZE: usize = 256;
const VISION_KEY_ENV: &str = "SPREAD_SPLIT_VISION_KEY";

#[derive(Debug, Parser)]
#[command(author, version, about = "Detect and split two-page spreads in scanned books")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Detect a spread in one image file or URL
    Detect {
        input: String,
        #[command(flatten)]
        detection: DetectionArgs,
    },
    /// Detect spreads in every image under a directory
    Scan {
        directory: PathBuf,
        #[command(flatten)]
        detection: DetectionArgs,
        /// Write split-report.json into the cache directory
        #[arg(long)]
        report: bool,
        /// Append one prediction row per page to this CSV file
        #[arg(long)]
        labels: Option<PathBuf>,
        /// Number of worker threads
        #[arg(long)]
        concurrency: Option<NonZeroUsize>,
    },
    /// Split, undo or renumber pages in a SQLite page store
    #[cfg(feature = "page-sqlite")]
    Page {
        #[arg(long)]
        db: PathBuf,
        #[command(subcommand)]
        action: PageAction,
    },
}

#[cfg(feature = "page-sqlite")]
#[derive(Debug, Subcommand)]
enum PageAction {
    Split {
        page_id: String,
        #[arg(long)]
        percent: f64,
    },
    Undo {
        page_id: String,
    },
    Renumber {
        book_id: String,
    },
}

#[derive(Debug, clap::Args)]
struct DetectionArgs {
    /// Analysis width in pixels
    #[arg(long)]
    width: Option<u32>,
    /// JSON file with threshold overrides
    #[arg(long)]
    config: Option<PathBuf>,
    /// Vision endpoint consulted when the heuristic is not confident
    #[arg(long)]
    vision: Option<String>,
}

impl DetectionArgs {
    fn config(&self) -> Result<DetectionConfig> {
        let mut config = match &self.config {
            Some(path) => DetectionConfig::load_overrides(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DetectionConfig::default(),
        };
        if let Some(width) = self.width {
            config.target_width = width;
        }
        Ok(config)
    }

    fn detector(&self) -> Result<Box<dyn Detector>> {
        let heuristic = HeuristicDetector::new(self.config()?);
        let capacity = NonZeroUsize::new(DETECTION_CACHE_SIZE).context("cache size")?;

        match &self.vision {
            None => Ok(Box::new(CachedDetector::new(heuristic, capacity))),
            Some(endpoint) => vision_detector(heuristic, endpoint, capacity),
        }
    }
}

#[cfg(feature = "remote")]
fn vision_detector(
    heuristic: HeuristicDetector,
    endpoint: &str,
    capacity: NonZeroUsize,
) -> Result<Box<dyn Detector>> {
    use spread_split::doublepage::vision::VisionModelDetector;
    use spread_split::doublepage::{Confidence, HybridDetector};

    let vision = VisionModelDetector::new(endpoint, std::env::var(VISION_KEY_ENV).ok())
        .with_context(|| format!("vision endpoint {}", endpoint))?;
    let hybrid = HybridDetector::new(heuristic, vision, Confidence::High);
    Ok(Box::new(CachedDetector::new(hybrid, capacity)))
}

#[cfg(not(feature = "remote"))]
fn vision_detector(
    _heuristic: HeuristicDetector,
    _endpoint: &str,
    _capacity: NonZeroUsize,
) -> Result<Box<dyn Detector>> {
    anyhow::bail!("vision fallback needs the `remote` feature (key {})", VISION_KEY_ENV)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_detect(input: &str, detection: &DetectionArgs) -> Result<()> {
    let detector = detection.detector()?;

    let result = if input.starts_with("http://") || input.starts_with("https://") {
        detect_remote(input, detector.as_ref())?
    } else {
        let bytes = fs::read(input).with_context(|| format!("reading {}", input))?;
        detector
            .detect(&bytes)
            .with_context(|| format!("detecting {}", input))?
    };

    info!(
        input,
        spread = result.is_two_page_spread,
        confidence = result.confidence.as_str(),
        "detection finished"
    );
    print_json(&result)
}

#[cfg(feature = "remote")]
fn detect_remote(
    url: &str,
    detector: &dyn Detector,
) -> Result<spread_split::DetectionResult> {
    use spread_split::doublepage::fetch::HttpImageFetcher;
    use spread_split::doublepage::detect_from_url;

    let fetcher = HttpImageFetcher::new()?;
    detect_from_url(&fetcher, detector, url).with_context(|| format!("detecting {}", url))
}

#[cfg(not(feature = "remote"))]
fn detect_remote(
    url: &str,
    _detector: &dyn Detector,
) -> Result<spread_split::DetectionResult> {
    anyhow::bail!("fetching {} needs the `remote` feature", url)
}

#[cfg(feature = "page-sqlite")]
fn run_page(db: PathBuf, action: PageAction) -> Result<()> {
    use spread_split::pages::{BookId, CropDecision, PageId, PageSplitManager, SqlitePageStore};

    let store = SqlitePageStore::open(&db).with_context(|| format!("opening {}", db.display()))?;
    let manager = PageSplitManager::new(store);

    match action {
        PageAction::Split { page_id, percent } => {
            print_json(&manager.apply_split(&PageId::new(page_id), CropDecision::Percent(percent))?)
        }
        PageAction::Undo { page_id } => print_json(&manager.undo_split(&PageId::new(page_id))?),
        PageAction::Renumber { book_id } => {
            let renumbered = manager.renumber(&BookId::new(book_id))?;
            print_json(&serde_json::json!({ "renumberedCount": renumbered }))
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Detect { input, detection } => run_detect(&input, &detection),
        Command::Scan {
            directory,
            detection,
            report,
            labels,
            concurrency,
        } => {
            let detector = detection.detector()?;
            let options = ScanOptions {
                concurrency,
                write_report: report,
                labels,
                ..ScanOptions::new(directory)
            };
            let outcome = scan_directory(options, detector.as_ref(), None)?;
            for warning in &outcome.warnings {
                tracing::warn!("{}", warning);
            }
            print_json(&outcome)
        }
        #[cfg(feature = "page-sqlite")]
        Command::Page { db, action } => run_page(db, action),
    }
}
