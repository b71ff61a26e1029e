//! Benchmark harness: mean haversine distance with a selectable backend
//!
//! Usage:
//!   calc <method> [points.parquet]
//!
//! Without a file a seeded 1M-row dataset is generated in memory. The result
//! and elapsed time are printed; errors exit non-zero (2 for an unknown or
//! unavailable method, 3 for dataset problems).
//!
//! Run with: cargo run --release --example calc -- vectorized data/points.parquet

use anyhow::{bail, Context};
use haversine_udf::session::Session;
use haversine_udf::storage::StorageEngine;
use haversine_udf::{telemetry, Error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::process::ExitCode;
use std::time::Instant;

const SYNTHETIC_ROWS: usize = 1_000_000;

fn synthetic_points(rows: usize) -> haversine_udf::Result<StorageEngine> {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut column = |lo: f64, hi: f64| (0..rows).map(|_| rng.gen_range(lo..hi)).collect::<Vec<f64>>();
    let x0 = column(-180.0, 180.0);
    let y0 = column(-90.0, 90.0);
    let x1 = column(-180.0, 180.0);
    let y1 = column(-90.0, 90.0);
    StorageEngine::from_columns(x0, y0, x1, y1)
}

fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let session = Session::builder().build();

    let Some(method) = args.next() else {
        let available: Vec<&str> = session.available_methods().iter().map(|m| m.as_str()).collect();
        bail!("usage: calc <method> [file]\navailable methods: {}", available.join(", "));
    };
    let path = args.next();

    // Resolve first so a typo never waits for a large file to load.
    session.registry().resolve(&method)?;

    let storage = match &path {
        Some(path) => StorageEngine::load_parquet(path).with_context(|| format!("loading {path}"))?,
        None => synthetic_points(SYNTHETIC_ROWS)?,
    };

    let started = Instant::now();
    let avg = session.calc(&method, &storage)?;
    let elapsed = started.elapsed();

    println!("method:   {method}");
    println!("rows:     {}", storage.num_rows());
    println!("avg_dist: {avg:.6} km");
    println!("elapsed:  {:.3} s", elapsed.as_secs_f64());
    Ok(())
}

fn main() -> ExitCode {
    telemetry::init_tracing();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err.downcast_ref::<Error>().map_or(1, Error::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
