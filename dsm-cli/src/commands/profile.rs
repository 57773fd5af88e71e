use anyhow::{Context, Result};

use super::{EngineArgs, LatLon};

pub fn run(
    args: &EngineArgs,
    tx: LatLon,
    rx: LatLon,
    samples: usize,
    tx_height: f64,
    rx_height: f64,
    json: bool,
) -> Result<()> {
    let engine = args.build()?;

    let profile = engine
        .surface_profile(tx.point(), rx.point(), samples)
        .context("Failed to compute profile")?;

    if json {
        let geometry = dsm::geojson::profile_to_geometry(&profile);
        println!("{}", serde_json::to_string(&geometry)?);
        return Ok(());
    }

    println!("{:>10} {:>12} {:>12} {:>10}", "DIST_M", "LAT", "LON", "ELEV_M");
    println!("{}", "-".repeat(47));
    for point in &profile.points {
        let elevation = point
            .elevation
            .map_or_else(|| "-".to_string(), |e| format!("{:.2}", e));
        println!(
            "{:>10.1} {:>12.7} {:>12.7} {:>10}",
            point.distance_m, point.lat, point.lon, elevation
        );
    }

    let los = profile.line_of_sight(tx_height, rx_height);
    println!();
    println!("Distance: {:.1} m", profile.total_distance_m());
    println!("Coverage: {:.1}%", profile.coverage() * 100.0);
    match los.first_obstruction_m {
        None => println!("Line of sight: clear"),
        Some(at) => println!(
            "Line of sight: obstructed at {:.1} m (max intrusion {:.2} m)",
            at, los.max_intrusion_m
        ),
    }

    Ok(())
}
