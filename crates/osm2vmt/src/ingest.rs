//! Concurrent ingestion of decoded OSM primitives into an immutable
//! snapshot. Raw blobs are decoded by a rayon pool with no ordering
//! guarantee; nodes land in a concurrent table with last-write-wins
//! semantics on duplicate ids, ways append to a shared list. Nothing reads
//! either collection until every blob is consumed.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::info;
use nohash_hasher::BuildNoHashHasher;
use osmpbf::{Blob, BlobDecode, BlobReader};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::grid;

#[derive(Debug, Clone)]
pub struct GeoNode {
    pub id: i64,
    pub lat_q7: i32,
    pub lon_q7: i32,
    pub tags: Vec<(String, String)>,
}

impl GeoNode {
    pub fn from_deg(id: i64, lat: f64, lon: f64, tags: Vec<(String, String)>) -> Self {
        Self {
            id,
            lat_q7: vmt::deg_to_q7(lat),
            lon_q7: vmt::deg_to_q7(lon),
            tags,
        }
    }

    #[inline]
    pub fn tile(&self) -> u32 {
        grid::tile_of(self.lat_q7, self.lon_q7)
    }
}

#[derive(Debug, Clone)]
pub struct Way {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Vec<(String, String)>,
}

type NodeTable = HashMap<i64, GeoNode, BuildNoHashHasher<i64>>;

/// Read-only result of ingestion. Ways are sorted by id and per-tile node
/// lists are sorted, so everything downstream iterates deterministically
/// no matter how the worker pool interleaved its writes.
pub struct MapSnapshot {
    pub nodes: NodeTable,
    pub ways: Vec<Way>,
    pub tiles: BTreeSet<u32>,
    pub nodes_by_tile: HashMap<u32, Vec<i64>>,
}

/// Shared accumulation targets for the worker pool.
pub struct IngestAccum {
    nodes: DashMap<i64, GeoNode, BuildNoHashHasher<i64>>,
    ways: Mutex<Vec<Way>>,
}

impl Default for IngestAccum {
    fn default() -> Self {
        Self {
            nodes: DashMap::with_hasher(BuildNoHashHasher::default()),
            ways: Mutex::new(Vec::new()),
        }
    }
}

impl IngestAccum {
    /// Insert a node; a later insert for the same id overwrites the earlier
    /// one, which makes re-ingestion of overlapping extracts idempotent.
    pub fn add_node(&self, node: GeoNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn add_way(&self, way: Way) {
        self.ways.lock().push(way);
    }

    /// Seal the accumulators into an immutable snapshot.
    pub fn finish(self) -> MapSnapshot {
        let mut nodes: NodeTable =
            HashMap::with_capacity_and_hasher(self.nodes.len(), BuildNoHashHasher::default());
        for (id, node) in self.nodes.into_iter() {
            nodes.insert(id, node);
        }

        let mut ways = self.ways.into_inner();
        ways.sort_unstable_by_key(|w| w.id);

        let mut nodes_by_tile: HashMap<u32, Vec<i64>> = HashMap::new();
        for node in nodes.values() {
            nodes_by_tile.entry(node.tile()).or_default().push(node.id);
        }
        for list in nodes_by_tile.values_mut() {
            list.sort_unstable();
        }
        let tiles: BTreeSet<u32> = nodes_by_tile.keys().copied().collect();

        MapSnapshot {
            nodes,
            ways,
            tiles,
            nodes_by_tile,
        }
    }
}

fn apply_blob(blob: &Blob, accum: &IngestAccum) -> Result<(), osmpbf::Error> {
    let block = match blob.decode()? {
        BlobDecode::OsmData(block) => block,
        BlobDecode::OsmHeader(_) | BlobDecode::Unknown(_) => return Ok(()),
    };

    for group in block.groups() {
        for node in group.nodes() {
            let tags = node
                .tags()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            accum.add_node(GeoNode::from_deg(node.id(), node.lat(), node.lon(), tags));
        }
        for node in group.dense_nodes() {
            let tags = node
                .tags()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            accum.add_node(GeoNode::from_deg(node.id(), node.lat(), node.lon(), tags));
        }
        for way in group.ways() {
            let tags = way
                .tags()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            accum.add_way(Way {
                id: way.id(),
                refs: way.refs().collect(),
                tags,
            });
        }
    }

    Ok(())
}

/// Decode a `.osm.pbf` file into a snapshot, processing blobs in parallel.
pub fn ingest_pbf(path: &Path, log_every: usize) -> Result<MapSnapshot> {
    let reader = BlobReader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let blobs: Vec<Blob> = reader
        .collect::<Result<_, osmpbf::Error>>()
        .context("reading blob stream")?;

    info!("Ingesting {} blobs from {}", blobs.len(), path.display());
    let start = Instant::now();
    let done = AtomicUsize::new(0);
    let every = log_every.max(1);

    let accum = IngestAccum::default();
    blobs
        .par_iter()
        .try_for_each(|blob| {
            apply_blob(blob, &accum)?;
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            if n % every == 0 {
                let rate = n as f64 / start.elapsed().as_secs_f64().max(1e-9);
                info!("Decoded {:>6}/{} blobs, {:6.1} blobs/s", n, blobs.len(), rate);
            }
            Ok::<(), osmpbf::Error>(())
        })
        .context("decoding blob")?;

    let snapshot = accum.finish();
    info!(
        "Snapshot: {} nodes, {} ways, {} tiles in {:.2}s",
        snapshot.nodes.len(),
        snapshot.ways.len(),
        snapshot.tiles.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(snapshot)
}
