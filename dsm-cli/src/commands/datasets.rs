use anyhow::Result;

use super::EngineArgs;

pub fn run(args: &EngineArgs) -> Result<()> {
    let engine = args.build()?;
    let datasets = engine.catalog().all_including_invalid();

    if datasets.is_empty() {
        println!("No datasets in catalog. Use --catalog or set DSM_CATALOG");
        return Ok(());
    }

    println!(
        "{:>8} {:<32} {:>6} {:>12} {:>8} {:>7}",
        "ID", "NAME", "SRS", "COLLECTED", "TILES", "STATUS"
    );
    println!("{}", "-".repeat(78));

    let mut total_tiles = 0;
    for dataset in &datasets {
        let tiles = match engine.tile_store().list_tiles(dataset.id) {
            Ok(tiles) => {
                total_tiles += tiles.len();
                tiles.len().to_string()
            }
            Err(e) => {
                tracing::warn!(dataset = dataset.id, error = %e, "Failed to list tiles");
                "?".to_string()
            }
        };
        let collected = dataset
            .collection_end
            .or(dataset.collection_start)
            .map_or_else(|| "-".to_string(), |d| d.to_string());
        let status = if !dataset.valid {
            "invalid"
        } else if dataset.noisy {
            "noisy"
        } else {
            "ok"
        };

        println!(
            "{:>8} {:<32} {:>6} {:>12} {:>8} {:>7}",
            dataset.id,
            truncate(&dataset.name, 32),
            dataset.srs,
            collected,
            tiles,
            status
        );
    }

    println!();
    println!("Summary:");
    println!("  Datasets: {}", datasets.len());
    println!("  Stored tiles: {}", total_tiles);

    Ok(())
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        name.to_string()
    } else {
        let mut short: String = name.chars().take(width - 1).collect();
        short.push('~');
        short
    }
}
