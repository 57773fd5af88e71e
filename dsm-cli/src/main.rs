use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{EngineArgs, LatLon};

/// Digital Surface Model CLI tool
#[derive(Parser)]
#[command(name = "dsm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root directory of the tile store
    #[arg(short, long, env = "DSM_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// GeoJSON FeatureCollection describing the point-cloud datasets
    #[arg(short, long, env = "DSM_CATALOG", global = true)]
    catalog: Option<PathBuf>,

    /// URL template of an upstream tile server, e.g. https://host/{dataset}/{z}/{x}/{y}.tif
    #[arg(long, env = "DSM_TILE_SOURCE_URL", global = true)]
    tile_source: Option<String>,

    /// Log progress to stderr (repeat for debug output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample the surface elevation at a single coordinate
    Sample {
        /// Latitude in decimal degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Longitude in decimal degrees
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Output result as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Export a Web Mercator GeoTIFF for a GeoJSON area of interest
    Export {
        /// GeoJSON file holding a Polygon or MultiPolygon
        aoi: PathBuf,

        /// Output GeoTIFF path
        #[arg(short, long, default_value = "dsm-export.tif")]
        output: PathBuf,

        /// Pixel size in metres
        #[arg(short, long)]
        resolution: Option<f64>,
    },

    /// Surface profile and line of sight between two points
    Profile {
        /// Transmitter as lat,lon
        #[arg(long, allow_hyphen_values = true)]
        tx: LatLon,

        /// Receiver as lat,lon
        #[arg(long, allow_hyphen_values = true)]
        rx: LatLon,

        /// Number of samples including both endpoints
        #[arg(short, long, default_value_t = dsm::DEFAULT_PROFILE_SAMPLES)]
        samples: usize,

        /// Antenna height above the surface at the transmitter, metres
        #[arg(long, default_value_t = 0.0)]
        tx_height: f64,

        /// Antenna height above the surface at the receiver, metres
        #[arg(long, default_value_t = 0.0)]
        rx_height: f64,

        /// Output the profile as a GeoJSON LineString
        #[arg(short, long)]
        json: bool,
    },

    /// List catalog datasets and their stored tiles
    Datasets,

    /// Pre-generate every tile of a dataset
    Tiles {
        /// Dataset id
        dataset: dsm::DatasetId,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let engine = EngineArgs {
        data_dir: cli.data_dir,
        catalog: cli.catalog,
        tile_source: cli.tile_source,
    };

    match cli.command {
        Commands::Sample { lat, lon, json } => commands::sample::run(&engine, lat, lon, json),
        Commands::Export {
            aoi,
            output,
            resolution,
        } => commands::export::run(&engine, aoi, output, resolution),
        Commands::Profile {
            tx,
            rx,
            samples,
            tx_height,
            rx_height,
            json,
        } => commands::profile::run(&engine, tx, rx, samples, tx_height, rx_height, json),
        Commands::Datasets => commands::datasets::run(&engine),
        Commands::Tiles { dataset } => commands::tiles::run(&engine, dataset),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .init();
}
