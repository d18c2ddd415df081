mod features;
mod grid;
mod ingest;
mod vocab;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use crate::features::{build_tile, partition_ways, FeatureIds};
use vmt::MapWriter;

#[derive(Parser, Debug)]
#[command(name = "osm2vmt", version)]
struct Args {
    /// Input .osm.pbf file
    #[arg(long)]
    input: PathBuf,

    /// Output map file
    #[arg(long, default_value = "map.vmt")]
    output: PathBuf,

    /// Companion property-code file; `<output>.props` when omitted
    #[arg(long)]
    props: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Log a progress line every N decoded blobs
    #[arg(long, default_value_t = 64)]
    log_every: usize,
}

/// Both output artifacts are covered by the same overwrite guard.
fn refuse_existing(path: &Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        bail!("{} exists; pass --overwrite to replace it", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let props_path = args
        .props
        .clone()
        .unwrap_or_else(|| args.output.with_extension("props"));

    refuse_existing(&args.output, args.overwrite)?;
    refuse_existing(&props_path, args.overwrite)?;

    let snapshot = ingest::ingest_pbf(&args.input, args.log_every)?;
    let partition = partition_ways(&snapshot);

    let tile_count = snapshot.tiles.len() as u32;
    let mut writer = MapWriter::create(&args.output, &props_path, tile_count)
        .with_context(|| format!("creating {}", args.output.display()))?;

    let mut ids = FeatureIds::default();
    let mut feature_total = 0u64;
    for &tile_id in &snapshot.tiles {
        let block = build_tile(&snapshot, &partition, tile_id, &mut ids)?;
        feature_total += block.features.len() as u64;
        writer
            .write_tile(&block)
            .with_context(|| format!("writing tile {:#010x}", tile_id))?;
    }
    writer.finish().context("patching tile index")?;

    info!(
        "OK {} -> {} ({} tiles, {} features, props in {})",
        args.input.display(),
        args.output.display(),
        tile_count,
        feature_total,
        props_path.display()
    );

    Ok(())
}
