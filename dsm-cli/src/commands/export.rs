use anyhow::{Context, Result};
use dsm::ExportRequest;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use super::EngineArgs;

pub fn run(args: &EngineArgs, aoi: PathBuf, output: PathBuf, resolution: Option<f64>) -> Result<()> {
    let engine = args.build()?;

    let text = std::fs::read_to_string(&aoi)
        .with_context(|| format!("Failed to read area of interest {}", aoi.display()))?;
    let area = dsm::geojson::parse_area(&text).context("Invalid area of interest")?;

    let resolution = resolution.unwrap_or(engine.config().export_resolution);
    let request = ExportRequest::new(area).with_resolution(resolution);
    request.validate(engine.config().max_area_km2)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.set_message(format!("Exporting {:.3} km2 at {} m", request.area_km2(), resolution));
    pb.enable_steady_tick(Duration::from_millis(100));

    let export = engine.export_dsm(&request);
    pb.finish_and_clear();
    let export = export.context("Export failed")?;

    export
        .raster
        .write_to_file(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let stats = &export.stats;
    println!("Wrote {} ({}x{} px, {} m)", output.display(), stats.width, stats.height, stats.resolution);
    println!("  Tiles: {} total, {} resolved", stats.tiles_total, stats.tiles_resolved);
    if stats.tiles_no_coverage > 0 {
        println!("  Without coverage: {}", stats.tiles_no_coverage);
    }
    if stats.tiles_without_data > 0 {
        println!("  Without data: {}", stats.tiles_without_data);
    }
    if stats.tiles_failed > 0 {
        println!("  Failed: {}", stats.tiles_failed);
    }
    println!("  Datasets (newest first): {:?}", stats.datasets);
    println!("  Pixels written: {}", stats.pixels_written);
    println!("  Elapsed: {} ms", stats.elapsed_ms);

    Ok(())
}
