use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use geo::{Coord, Rect};
use log::{error, info};

use trackmatch::{
    by_local_date, run_pipeline, ArchiveLayout, OsrmClient, OsrmConfig, PipelineConfig,
    StrokeStyle,
};

#[derive(Parser, Debug)]
#[command(name = "trackmatch", version, about = "Map-match archived GPS samples and render them")]
struct Args {
    /// Zip archive holding the latitude, longitude and accuracy series
    #[arg(env = "TRACKMATCH_ARCHIVE")]
    archive: PathBuf,

    /// File name fragments of the latitude series, tried in order
    #[arg(long, env = "TRACKMATCH_LATITUDE_ENTRY", value_delimiter = ',')]
    latitude_entry: Option<Vec<String>>,

    /// File name fragments of the longitude series, tried in order
    #[arg(long, env = "TRACKMATCH_LONGITUDE_ENTRY", value_delimiter = ',')]
    longitude_entry: Option<Vec<String>>,

    /// File name fragments of the accuracy radius series, tried in order
    #[arg(long, env = "TRACKMATCH_RADIUS_ENTRY", value_delimiter = ',')]
    radius_entry: Option<Vec<String>>,

    /// OSRM server root
    #[arg(long, env = "TRACKMATCH_BASE_URL", default_value = "https://router.project-osrm.org/")]
    base_url: String,

    /// Routing profile
    #[arg(long, env = "TRACKMATCH_PROFILE", default_value = "foot")]
    profile: String,

    /// Drop samples with an accuracy radius above this (meters)
    #[arg(long, env = "TRACKMATCH_MAX_ACCURACY", default_value_t = 50.0)]
    max_accuracy: f64,

    /// Output directory for layers and the composite
    #[arg(long, env = "TRACKMATCH_OUT_DIR", default_value = "out")]
    out_dir: PathBuf,

    /// Fixed output box as min_lon,min_lat,max_lon,max_lat
    #[arg(long, env = "TRACKMATCH_BBOX", value_parser = parse_bbox)]
    bbox: Option<Rect<f64>>,

    #[arg(long, env = "TRACKMATCH_PIXELS_PER_METER", default_value_t = 0.1)]
    pixels_per_meter: f64,

    /// Stroke width in meters
    #[arg(long, env = "TRACKMATCH_STROKE_WIDTH", default_value_t = 15.0)]
    stroke_width: f64,

    #[arg(long, env = "TRACKMATCH_MATCH_CONCURRENCY", default_value_t = 4)]
    match_concurrency: usize,

    /// Each worker holds a full-size layer in memory
    #[arg(long, env = "TRACKMATCH_RASTER_WORKERS", default_value_t = 2)]
    raster_workers: usize,

    #[arg(long, env = "TRACKMATCH_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Retries for transient match failures
    #[arg(long, env = "TRACKMATCH_RETRIES", default_value_t = 3)]
    retries: u32,

    /// Minimum spacing between match requests (0 disables)
    #[arg(long, env = "TRACKMATCH_DISPATCH_INTERVAL_MS", default_value_t = 0)]
    dispatch_interval_ms: u64,

    /// Also write every ingested sample as GeoJSON
    #[arg(long, env = "TRACKMATCH_EXPORT_GEOJSON")]
    export_geojson: Option<PathBuf>,
}

fn parse_bbox(s: &str) -> Result<Rect<f64>, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("bad bbox value: {e}"))?;

    match values[..] {
        [min_lon, min_lat, max_lon, max_lat] => Ok(Rect::new(
            Coord { x: min_lon, y: min_lat },
            Coord { x: max_lon, y: max_lat },
        )),
        _ => Err(format!("expected 4 comma-separated values, got {}", values.len())),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let osrm = OsrmConfig {
        base_url: args.base_url,
        timeout: Duration::from_secs(args.timeout_secs),
        max_retries: args.retries,
        dispatch_interval: Duration::from_millis(args.dispatch_interval_ms),
        ..OsrmConfig::default()
    };
    let client = match OsrmClient::new(osrm) {
        Ok(client) => client,
        Err(e) => {
            error!("[Main] Cannot build OSRM client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let defaults = ArchiveLayout::default();
    let archive = ArchiveLayout {
        latitude: args.latitude_entry.unwrap_or(defaults.latitude),
        longitude: args.longitude_entry.unwrap_or(defaults.longitude),
        radius: args.radius_entry.unwrap_or(defaults.radius),
        ..ArchiveLayout::default()
    };

    let config = PipelineConfig {
        archive,
        profile: args.profile,
        max_accuracy: args.max_accuracy,
        output_dir: args.out_dir,
        bbox: args.bbox,
        pixels_per_meter: args.pixels_per_meter,
        stroke: StrokeStyle {
            width_meters: args.stroke_width,
            ..StrokeStyle::default()
        },
        match_concurrency: args.match_concurrency,
        raster_workers: args.raster_workers,
        export_geojson: args.export_geojson,
        ..PipelineConfig::default()
    };

    match run_pipeline(&args.archive, &config, &client, by_local_date).await {
        Ok(report) => {
            info!(
                "[Main] {} ingested, {} filtered; batches: {} attempted, {} matched, {} skipped, {} raster failures",
                report.ingested,
                report.filtered_out,
                report.attempted,
                report.matched,
                report.skipped,
                report.raster_failed
            );
            if !report.failed_buckets.is_empty() {
                info!("[Main] No layer for: {}", report.failed_buckets.join(", "));
            }
            if let Some(path) = report.composite {
                info!("[Main] Composite written to {}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("[Main] {}", e);
            ExitCode::FAILURE
        }
    }
}
