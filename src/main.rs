//! Map tile pipeline - prefetch and inspect an offline tile cache.
//!
//! `fetch` loads a range of tiles through the full pipeline, `check`
//! inspects the offline files of a range without network access.

use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use map_tile_pipeline::{
    config::{CheckConfig, Cli, Command, FetchConfig},
    offline_path,
    raster::decode_first_frame,
    DownsampleProvider, HttpProvider, MapProvider, TileKey, TileManager,
};

/// Most failures listed individually in a summary.
const MAX_LISTED_FAILURES: usize = 20;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Fetch(config) => run_fetch(config).await,
        Command::Check(config) => run_check(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "map_tile_pipeline=debug"
    } else {
        "map_tile_pipeline=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Failed to serialize summary: {}", e),
    }
}

// =============================================================================
// Fetch Command
// =============================================================================

async fn run_fetch(config: FetchConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let provider = match build_provider(&config) {
        Ok(provider) => provider,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let manager = match TileManager::new(config.loader_config()) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("Failed to start tile manager: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let keys = config.range.keys(provider.id());
    info!("Configuration:");
    info!("  Provider: {} ({})", provider.id(), config.url);
    info!("  Cache root: {}", config.cache_root.display());
    info!("  Zoom: {}, {} tile(s)", config.range.zoom, keys.len());
    info!("  Workers: {}", config.workers);

    let started = Instant::now();
    let summary = fetch_all(&manager, &provider, keys, config.workers * 4).await;
    let elapsed = started.elapsed();

    manager.dispose().await;

    if config.json {
        print_json(&FetchReport {
            provider: provider.id(),
            zoom: config.range.zoom,
            requested: summary.requested,
            loaded: summary.loaded,
            from_cache: summary.from_cache,
            failed: summary.failures.len(),
            failures: summary
                .failures
                .iter()
                .map(|(key, message)| TileReport {
                    tile: key.to_string(),
                    detail: message.as_str(),
                })
                .collect(),
            elapsed_ms: elapsed.as_millis() as u64,
        });
    } else {
        println!();
        println!("Fetch Summary");
        println!("═════════════════════════════════");
        println!("  Requested:  {}", summary.requested);
        println!("  Loaded:     {}", summary.loaded);
        println!("  From cache: {}", summary.from_cache);
        println!("  Failed:     {}", summary.failures.len());
        println!("  Elapsed:    {:.2}s", elapsed.as_secs_f64());

        if !summary.failures.is_empty() {
            println!();
            for (key, message) in summary.failures.iter().take(MAX_LISTED_FAILURES) {
                println!("✗ {}: {}", key, message);
            }
            if summary.failures.len() > MAX_LISTED_FAILURES {
                println!("  ... and {} more", summary.failures.len() - MAX_LISTED_FAILURES);
            }
        }
        println!("═════════════════════════════════");
    }

    if summary.failures.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// The HTTP provider, wrapped in a downsampling provider when the requested
/// zoom is below the server's native minimum.
fn build_provider(config: &FetchConfig) -> Result<Arc<dyn MapProvider>, String> {
    let http = HttpProvider::new(config.provider.as_str(), config.url.as_str())?
        .with_dim(config.dim_settings()?);
    let http: Arc<dyn MapProvider> = Arc::new(http);

    match config.native_min_zoom {
        Some(native) if config.range.zoom < native => {
            let id = format!("{}-z{}", config.provider, native);
            Ok(DownsampleProvider::new(id, http, native))
        }
        _ => Ok(http),
    }
}

/// One tile in a JSON report, with its error or status.
#[derive(Debug, Serialize)]
struct TileReport<'a> {
    tile: String,
    detail: &'a str,
}

#[derive(Debug, Serialize)]
struct FetchReport<'a> {
    provider: &'a str,
    zoom: u8,
    requested: usize,
    loaded: usize,
    from_cache: usize,
    failed: usize,
    failures: Vec<TileReport<'a>>,
    elapsed_ms: u64,
}

#[derive(Debug, Default)]
struct FetchSummary {
    requested: usize,
    loaded: usize,
    from_cache: usize,
    failures: Vec<(TileKey, String)>,
}

/// Load every key, keeping at most `in_flight` requests outstanding.
async fn fetch_all(
    manager: &Arc<TileManager>,
    provider: &Arc<dyn MapProvider>,
    keys: Vec<TileKey>,
    in_flight: usize,
) -> FetchSummary {
    let mut summary = FetchSummary {
        requested: keys.len(),
        ..FetchSummary::default()
    };
    let mut tasks = JoinSet::new();

    for key in keys {
        while tasks.len() >= in_flight.max(1) {
            if let Some(joined) = tasks.join_next().await {
                record(&mut summary, joined);
            }
        }

        let manager = manager.clone();
        let provider = provider.clone();
        tasks.spawn(async move {
            let tile = manager.get_tile(key.clone(), &provider).await;
            let cached = tile.is_offline_image_available();
            let result = manager.load(key.clone(), &provider).await;
            (key, cached, result.map(|_| ()).map_err(|e| e.to_string()))
        });
    }

    while let Some(joined) = tasks.join_next().await {
        record(&mut summary, joined);
    }

    summary
}

type FetchResult = (TileKey, bool, Result<(), String>);

fn record(summary: &mut FetchSummary, joined: Result<FetchResult, tokio::task::JoinError>) {
    match joined {
        Ok((key, cached, Ok(()))) => {
            debug!(tile = %key, cached, "Tile ready");
            summary.loaded += 1;
            if cached {
                summary.from_cache += 1;
            }
        }
        Ok((key, _, Err(message))) => summary.failures.push((key, message)),
        Err(e) => error!("Fetch task failed: {}", e),
    }
}

// =============================================================================
// Check Command
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfflineStatus {
    Present,
    Partial,
    Missing,
    Corrupt,
}

impl OfflineStatus {
    fn as_str(self) -> &'static str {
        match self {
            OfflineStatus::Present => "present",
            OfflineStatus::Partial => "partial",
            OfflineStatus::Missing => "missing",
            OfflineStatus::Corrupt => "corrupt",
        }
    }
}

#[derive(Debug, Serialize)]
struct CheckReport<'a> {
    cache_root: String,
    provider: &'a str,
    zoom: u8,
    tiles: usize,
    present: usize,
    partial: usize,
    missing: usize,
    corrupt: usize,
    problems: Vec<TileReport<'a>>,
}

async fn run_check(config: CheckConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    if let Err(e) = config.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let keys = config.range.keys(&config.provider);
    let mut results = Vec::with_capacity(keys.len());
    for key in &keys {
        let status = check_tile(&config, key).await;
        debug!(tile = %key, status = status.as_str(), "Checked offline tile");
        results.push((key, status));
    }

    let count = |wanted: OfflineStatus| results.iter().filter(|(_, s)| *s == wanted).count();
    let present = count(OfflineStatus::Present);
    let partial = count(OfflineStatus::Partial);
    let missing = count(OfflineStatus::Missing);
    let corrupt = count(OfflineStatus::Corrupt);

    if config.json {
        print_json(&CheckReport {
            cache_root: config.cache_root.display().to_string(),
            provider: &config.provider,
            zoom: config.range.zoom,
            tiles: results.len(),
            present,
            partial,
            missing,
            corrupt,
            problems: results
                .iter()
                .filter(|(_, s)| matches!(s, OfflineStatus::Missing | OfflineStatus::Corrupt))
                .map(|(key, s)| TileReport {
                    tile: key.to_string(),
                    detail: s.as_str(),
                })
                .collect(),
        });
    } else {
        println!("Offline Cache Check");
        println!("═════════════════════════════════");
        println!();
        println!("✓ Cache root: {}", config.cache_root.display());
        println!("✓ Provider: {}", config.provider);
        println!("✓ Zoom {}: {} tile(s)", config.range.zoom, results.len());
        println!();

        let mut listed = 0;
        for (key, status) in &results {
            if matches!(status, OfflineStatus::Missing | OfflineStatus::Corrupt) {
                if listed < MAX_LISTED_FAILURES {
                    println!("✗ {}: {}", key, status.as_str());
                }
                listed += 1;
            }
        }
        if listed > MAX_LISTED_FAILURES {
            println!("  ... and {} more", listed - MAX_LISTED_FAILURES);
        }
        if listed > 0 {
            println!();
        }

        println!("  Present: {}", present);
        println!("  Partial: {}", partial);
        println!("  Missing: {}", missing);
        if config.decode {
            println!("  Corrupt: {}", corrupt);
        }

        println!();
        println!("═════════════════════════════════");
        if missing + corrupt == 0 {
            println!("✓ All tiles are cached!");
        }
    }

    if missing + corrupt == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn check_tile(config: &CheckConfig, key: &TileKey) -> OfflineStatus {
    let root = config.cache_root.as_path();

    for (partial, found) in [(false, OfflineStatus::Present), (true, OfflineStatus::Partial)] {
        let path = offline_path(root, &config.provider, key, &config.extension, partial);
        if !is_file(&path).await {
            continue;
        }
        if !config.decode {
            return found;
        }

        return match tokio::fs::read(&path).await {
            Ok(bytes) if decode_first_frame(&bytes).is_ok() => found,
            _ => OfflineStatus::Corrupt,
        };
    }

    OfflineStatus::Missing
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
