use anyhow::{Context, Result};
use dsm::Sample;
use serde::Serialize;

use super::EngineArgs;

#[derive(Serialize)]
struct ElevationResponse {
    lat: f64,
    lon: f64,
    elevation: Option<f32>,
}

pub fn run(args: &EngineArgs, lat: f64, lon: f64, json: bool) -> Result<()> {
    let engine = args.build()?;

    let sample = engine
        .sample_elevation(lat, lon)
        .context("Failed to sample elevation")?;

    if json {
        let response = ElevationResponse {
            lat,
            lon,
            elevation: sample.value(),
        };
        println!("{}", serde_json::to_string(&response)?);
    } else {
        match sample {
            Sample::Found(elevation) => println!("{:.2}", elevation),
            Sample::NoData => println!("no data"),
        }
    }

    Ok(())
}
