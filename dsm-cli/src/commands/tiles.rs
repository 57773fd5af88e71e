use anyhow::{Context, Result};
use dsm::DatasetId;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use super::EngineArgs;

pub fn run(args: &EngineArgs, dataset: DatasetId) -> Result<()> {
    let engine = args.build()?;
    let name = engine
        .catalog()
        .get(dataset)
        .with_context(|| format!("Dataset {} is not in the catalog", dataset))?
        .name
        .clone();

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.set_message(format!("Generating tiles for {} ({})", name, dataset));
    pb.enable_steady_tick(Duration::from_millis(100));

    let report = engine.generate_dataset(dataset);
    pb.finish_and_clear();
    let report = report.with_context(|| format!("Failed to generate tiles for dataset {}", dataset))?;

    println!("Dataset {} ({}) at zoom {}:", dataset, name, engine.config().export_zoom);
    println!("  Generated: {}", report.generated);
    println!("  Already present: {}", report.already_present);
    println!("  No data: {}", report.no_data);
    println!("  Skipped (outside boundary): {}", report.skipped);
    println!("  Failed: {}", report.failed);
    println!("  Elapsed: {} ms", report.elapsed_ms);

    if report.failed > 0 {
        anyhow::bail!("{} tiles failed to generate", report.failed);
    }

    Ok(())
}
