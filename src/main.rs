use anyhow::{Context, Result};
use claimcull::core::duplicate::{self, DEFAULT_THRESHOLD};
use claimcull::core::analysis::QualityMetrics;
use claimcull::core::hash::FingerprintMode;
use claimcull::core::models::Fingerprint;
use claimcull::core::worker_pool::WorkerPool;
use claimcull::{PipelineConfig, TriagePhase, TriagePipeline, TriageProgress};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use image::ImageFormat;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use walkdir::WalkDir;

const BAR_TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

#[derive(Parser, Debug)]
#[command(
    name = "claimcull",
    version,
    about = "Triage insurance claim photos into a damage report"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the triage pipeline over a claim request and print the report
    Triage(TriageArgs),

    /// Print quality metrics and fingerprints for local photos
    Inspect {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Number of hashing worker threads
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Maximum number of files held in memory at once
        #[arg(long, default_value_t = 8)]
        max_open: usize,
        /// Use perceptual fingerprints instead of content digests
        #[arg(long)]
        perceptual: bool,
    },

    /// Compare two fingerprints
    Fingerprint {
        #[arg(long, value_name = "HEX")]
        a: String,
        #[arg(long, value_name = "HEX")]
        b: String,
        /// Maximum distance that still counts as a duplicate
        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: u32,
    },
}

#[derive(Args, Debug)]
struct TriageArgs {
    /// Request JSON file (reads stdin when omitted)
    #[arg(short, long, value_name = "FILE")]
    request: Option<PathBuf>,
    /// Label detection service URL
    #[arg(long, env = "CLAIMCULL_LABELS_ENDPOINT", value_name = "URL")]
    labels_endpoint: Option<String>,
    /// Config file (default: `<config_dir>/claimcull/config.json` if present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long, env = "CLAIMCULL_FETCH_CONCURRENCY")]
    fetch_concurrency: Option<usize>,
    #[arg(long, env = "CLAIMCULL_CLASSIFY_CONCURRENCY")]
    classify_concurrency: Option<usize>,
    /// Number of hashing worker threads
    #[arg(long, env = "CLAIMCULL_WORKERS")]
    workers: Option<usize>,
    /// Use perceptual fingerprints instead of content digests
    #[arg(long)]
    perceptual: bool,
    /// Show a progress bar on stderr
    #[arg(long)]
    progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Triage(args) => triage(args).await?,

        Commands::Inspect {
            path,
            workers,
            max_open,
            perceptual,
        } => {
            let mode = if perceptual {
                FingerprintMode::Perceptual
            } else {
                FingerprintMode::ContentDigest
            };
            inspect(&path, workers, max_open, mode).await?;
        }

        Commands::Fingerprint { a, b, threshold } => {
            let (a, b) = (Fingerprint(a), Fingerprint(b));
            let distance =
                duplicate::hamming_distance(&a, &b).context("Cannot compare fingerprints")?;
            println!("distance: {}", distance);
            if distance <= threshold {
                println!("✅ Would cluster (threshold {})", threshold);
            } else {
                println!("❌ Kept apart (threshold {})", threshold);
            }
        }
    }

    Ok(())
}

fn load_config(args: &TriageArgs) -> Result<PipelineConfig> {
    let mut config =
        PipelineConfig::discover(args.config.as_deref()).context("Failed to load config")?;

    if let Some(endpoint) = &args.labels_endpoint {
        config.labels_endpoint = Some(endpoint.clone());
    }
    if let Some(n) = args.fetch_concurrency {
        config.fetch_concurrency = n;
    }
    if let Some(n) = args.classify_concurrency {
        config.classify_concurrency = n;
    }
    if let Some(n) = args.workers {
        config.hash_workers = n;
    }
    if args.perceptual {
        config.fingerprint_mode = FingerprintMode::Perceptual;
    }

    config.validate().context("Invalid settings")?;
    Ok(config)
}

async fn triage(args: TriageArgs) -> Result<()> {
    let config = load_config(&args)?;

    let body = match &args.request {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read request {:?}", path))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read request from stdin")?;
            buf
        }
    };

    let mut pipeline = TriagePipeline::http(&config).context("Failed to start pipeline")?;
    let mut renderer = None;
    if args.progress {
        let (tx, rx) = mpsc::unbounded_channel();
        pipeline = pipeline.with_progress_sender(tx);
        renderer = Some(tokio::spawn(render_progress(rx)));
    }

    let result = pipeline.run_json(&body).await;
    // Dropping the pipeline closes the progress channel.
    pipeline.shutdown();
    if let Some(handle) = renderer {
        let _ = handle.await;
    }

    let report = result.context("Triage failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn render_progress(mut rx: mpsc::UnboundedReceiver<TriageProgress>) {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
        bar.set_style(style.progress_chars("=> "));
    }

    while let Some(progress) = rx.recv().await {
        bar.set_length(progress.total_images as u64);
        bar.set_position(progress.images_processed as u64);
        match progress.phase {
            TriagePhase::Processing => bar.set_message(progress.current_url),
            TriagePhase::Clustering => bar.set_message("Clustering…"),
            TriagePhase::Aggregating => bar.set_message("Aggregating…"),
            TriagePhase::Complete => bar.finish_with_message("Triage complete"),
        }
    }

    if !bar.is_finished() {
        bar.abandon();
    }
}

/// Image files under `dir` in walk order, recognised by extension.
fn find_images(dir: &Path, bar: &ProgressBar) -> Vec<PathBuf> {
    bar.set_message(format!("Scanning {}…", dir.display()));
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| ImageFormat::from_path(entry.path()).is_ok())
        .map(|entry| {
            bar.tick();
            entry.into_path()
        })
        .collect()
}

async fn inspect(
    dir: &Path,
    workers: usize,
    max_open: usize,
    mode: FingerprintMode,
) -> Result<()> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let images = find_images(dir, &bar);
    bar.set_style(ProgressStyle::with_template(BAR_TEMPLATE)?.progress_chars("=> "));
    bar.set_length(images.len() as u64);
    bar.set_message("Inspecting…");

    let pool = WorkerPool::new(workers, mode).context("Failed to start worker pool")?;
    let start = Instant::now();
    let rows = inspect_files(&pool, &images, max_open, &bar).await;
    bar.finish_and_clear();

    println!("▶ Inspected {} image(s) in {}", images.len(), dir.display());
    for (path, row) in images.iter().zip(rows) {
        match row {
            Ok((metrics, fingerprint)) => println!(
                "{}\n     brightness: {:.1}  sharpness: {:.1}  fingerprint: {}",
                path.display(),
                metrics.brightness,
                metrics.sharpness,
                fingerprint
            ),
            Err(err) => eprintln!("⚠️  Skipping {}: {:#}", path.display(), err),
        }
    }
    println!("⏱ inspecting took {:.2?}", start.elapsed());

    pool.shutdown();
    Ok(())
}

/// Analyze and fingerprint `images` through `pool`, holding at most
/// `max_open` files in memory. Rows come back in input order.
async fn inspect_files(
    pool: &WorkerPool,
    images: &[PathBuf],
    max_open: usize,
    bar: &ProgressBar,
) -> Vec<Result<(QualityMetrics, Fingerprint)>> {
    let open_files = Semaphore::new(max_open.max(1));

    join_all(images.iter().map(|path| {
        let open_files = &open_files;
        async move {
            let _permit = open_files.acquire().await?;
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {:?}", path))?;
            let metrics = pool.analyze(bytes.clone()).await?;
            let fingerprint = pool.hash(bytes).await?;
            bar.inc(1);
            anyhow::Ok((metrics, fingerprint))
        }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use claimcull::core::hash::content_fingerprint;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn create_test_image(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_find_images_walks_nested_dirs_and_skips_other_files() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("roof").join("north");
        fs::create_dir_all(&nested).unwrap();

        create_test_image(&temp_dir.path().join("front.jpg"), 40, 30);
        create_test_image(&nested.join("ridge.PNG"), 40, 30);
        fs::write(temp_dir.path().join("notes.txt"), "adjuster notes").unwrap();
        fs::write(temp_dir.path().join("claim.json"), "{}").unwrap();

        let mut images = find_images(temp_dir.path(), &ProgressBar::hidden());
        images.sort();

        assert_eq!(images.len(), 2);
        assert!(images.iter().any(|p| p.ends_with("front.jpg")));
        assert!(images.iter().any(|p| p.ends_with("roof/north/ridge.PNG")));
    }

    #[tokio::test]
    async fn test_inspect_files_with_single_open_slot() {
        let temp_dir = TempDir::new().unwrap();
        let mut images = Vec::new();
        for i in 0..6 {
            let path = temp_dir.path().join(format!("shot-{}.png", i));
            create_test_image(&path, 64 + i, 48);
            images.push(path);
        }
        images.push(temp_dir.path().join("vanished.png"));

        let pool = WorkerPool::new(2, FingerprintMode::ContentDigest).unwrap();
        let bar = ProgressBar::hidden();
        let rows = inspect_files(&pool, &images, 1, &bar).await;

        assert_eq!(rows.len(), 7);
        for (path, row) in images.iter().zip(&rows).take(6) {
            let (metrics, fingerprint) = row.as_ref().unwrap();
            assert!(metrics.brightness > 0.0);
            assert_eq!(*fingerprint, content_fingerprint(&fs::read(path).unwrap()));
        }
        assert!(rows[6].is_err());
        assert_eq!(bar.position(), 6);
        pool.shutdown();
    }
}
