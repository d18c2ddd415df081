//! Per-tile feature derivation: ways become polyline/polygon features
//! restricted to their in-tile vertices, leftover nodes become point
//! features. Feature ids are allocated from one monotonic accumulator
//! threaded through every tile build; coordinate and property offsets are
//! running totals scoped to the tile.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use nohash_hasher::BuildNoHashHasher;
use smallvec::SmallVec;
use vmt::{push_label, FeatureRecord, GeomKind, TileBlock, NO_LABEL};

use crate::ingest::MapSnapshot;
use crate::vocab;

type IdSet = HashSet<i64, BuildNoHashHasher<i64>>;

/// Globally monotonic feature id source. Ids are dense: one is taken only
/// when a feature is actually emitted.
#[derive(Debug, Default)]
pub struct FeatureIds {
    next: u64,
}

impl FeatureIds {
    pub fn alloc(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Way indices grouped by every tile any of their vertices falls in.
/// Computed in one pass over the snapshot so per-tile builds never rescan
/// the full way list.
pub struct TilePartition {
    pub ways_by_tile: HashMap<u32, Vec<usize>>,
}

pub fn partition_ways(snapshot: &MapSnapshot) -> TilePartition {
    let mut ways_by_tile: HashMap<u32, Vec<usize>> = HashMap::new();
    for (index, way) in snapshot.ways.iter().enumerate() {
        let mut touched: SmallVec<[u32; 8]> = SmallVec::new();
        for node_ref in &way.refs {
            if let Some(node) = snapshot.nodes.get(node_ref) {
                let tile = node.tile();
                if !touched.contains(&tile) {
                    touched.push(tile);
                }
            }
        }
        for tile in touched {
            ways_by_tile.entry(tile).or_default().push(index);
        }
    }
    TilePartition { ways_by_tile }
}

/// Build one tile block. Ways first (in snapshot order), then nodes not
/// consumed as a vertex by any surviving way feature, in ascending id order.
pub fn build_tile(
    snapshot: &MapSnapshot,
    partition: &TilePartition,
    tile_id: u32,
    ids: &mut FeatureIds,
) -> Result<TileBlock> {
    let mut block = TileBlock {
        id: tile_id,
        ..TileBlock::default()
    };
    let mut coord_cursor: u32 = 0;
    let mut pair_cursor: u32 = 0;
    let mut consumed: IdSet = HashSet::with_hasher(BuildNoHashHasher::default());

    if let Some(way_indices) = partition.ways_by_tile.get(&tile_id) {
        for &wi in way_indices {
            let way = &snapshot.ways[wi];

            let mut keys: Vec<u32> = Vec::with_capacity(way.tags.len());
            let mut values: Vec<u32> = Vec::with_capacity(way.tags.len());
            let mut name: Option<&str> = None;
            for (k, v) in &way.tags {
                keys.push(vocab::encode_key(k));
                values.push(vocab::encode_value(k, v));
                if name.is_none() && k == "name" {
                    name = Some(v.as_str());
                }
            }

            let mut coords: Vec<[i32; 2]> = Vec::new();
            let mut vertex_ids: SmallVec<[i64; 16]> = SmallVec::new();
            for node_ref in &way.refs {
                let Some(node) = snapshot.nodes.get(node_ref) else {
                    continue;
                };
                if node.tile() != tile_id {
                    continue;
                }
                coords.push([node.lat_q7, node.lon_q7]);
                vertex_ids.push(node.id);
                for (k, v) in &node.tags {
                    let code = vocab::encode_key(k);
                    // First occurrence of an encoded key wins.
                    if keys.contains(&code) {
                        continue;
                    }
                    keys.push(code);
                    values.push(vocab::encode_value(k, v));
                }
            }

            // The way does not intersect this tile; nothing is emitted and
            // its name never reaches the characters block.
            if coords.is_empty() {
                continue;
            }

            let kind = if coords.first() == coords.last() {
                GeomKind::Polygon
            } else {
                GeomKind::Polyline
            };
            emit_feature(
                &mut block,
                &mut coord_cursor,
                &mut pair_cursor,
                ids.alloc(),
                kind,
                &coords,
                &keys,
                &values,
                name,
            )?;
            consumed.extend(vertex_ids);
        }
    }

    if let Some(node_ids) = snapshot.nodes_by_tile.get(&tile_id) {
        for node_id in node_ids {
            if consumed.contains(node_id) {
                continue;
            }
            let node = &snapshot.nodes[node_id];

            let mut keys: Vec<u32> = Vec::with_capacity(node.tags.len());
            let mut values: Vec<u32> = Vec::with_capacity(node.tags.len());
            let mut name: Option<&str> = None;
            for (k, v) in &node.tags {
                keys.push(vocab::encode_key(k));
                values.push(vocab::encode_value(k, v));
                if name.is_none() && k == "name" {
                    name = Some(v.as_str());
                }
            }

            let coord = [[node.lat_q7, node.lon_q7]];
            emit_feature(
                &mut block,
                &mut coord_cursor,
                &mut pair_cursor,
                ids.alloc(),
                GeomKind::Point,
                &coord,
                &keys,
                &values,
                name,
            )?;
        }
    }

    Ok(block)
}

#[allow(clippy::too_many_arguments)]
fn emit_feature(
    block: &mut TileBlock,
    coord_cursor: &mut u32,
    pair_cursor: &mut u32,
    id: u64,
    kind: GeomKind,
    coords: &[[i32; 2]],
    keys: &[u32],
    values: &[u32],
    name: Option<&str>,
) -> Result<()> {
    if keys.len() != values.len() {
        bail!(
            "feature {}: {} keys vs {} values",
            id,
            keys.len(),
            values.len()
        );
    }

    let label_ptr = match name {
        Some(text) => push_label(&mut block.chars, text),
        None => NO_LABEL,
    };

    block.features.push(FeatureRecord {
        id,
        label_ptr,
        kind,
        coord_offset: *coord_cursor,
        coord_count: coords.len() as u32,
        prop_offset: *pair_cursor * 2,
        prop_pairs: keys.len() as u32,
    });

    block.coords_q7.extend_from_slice(coords);
    for (&k, &v) in keys.iter().zip(values) {
        block.props.push(k);
        block.props.push(v);
    }

    *coord_cursor += coords.len() as u32;
    *pair_cursor += keys.len() as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid;
    use crate::ingest::{GeoNode, IngestAccum, Way};
    use vmt::label_text;

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    fn build_all(accum: IngestAccum) -> (MapSnapshot, Vec<TileBlock>) {
        let snapshot = accum.finish();
        let partition = partition_ways(&snapshot);
        let mut ids = FeatureIds::default();
        let blocks = snapshot
            .tiles
            .iter()
            .map(|&tile| build_tile(&snapshot, &partition, tile, &mut ids).unwrap())
            .collect();
        (snapshot, blocks)
    }

    #[test]
    fn test_closed_ring_becomes_one_polygon() {
        let accum = IngestAccum::default();
        accum.add_node(GeoNode::from_deg(1, 51.5010, -0.0810, Vec::new()));
        accum.add_node(GeoNode::from_deg(2, 51.5011, -0.0810, Vec::new()));
        accum.add_node(GeoNode::from_deg(3, 51.5011, -0.0809, Vec::new()));
        accum.add_way(Way {
            id: 10,
            refs: vec![1, 2, 3, 1],
            tags: tags(&[("highway", "residential")]),
        });

        let (_, blocks) = build_all(accum);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.features.len(), 1);
        let f = block.features[0];
        assert_eq!(f.kind, GeomKind::Polygon);
        assert_eq!(f.coord_count, 4);
        assert_eq!(block.props[0], vocab::encode_key("highway"));
        assert_eq!(block.props[1], vocab::encode_value("highway", "residential"));
        assert_eq!(block.coords_q7.first(), block.coords_q7.last());
    }

    #[test]
    fn test_open_way_is_polyline() {
        let accum = IngestAccum::default();
        accum.add_node(GeoNode::from_deg(1, 51.5010, -0.0810, Vec::new()));
        accum.add_node(GeoNode::from_deg(2, 51.5011, -0.0810, Vec::new()));
        accum.add_way(Way {
            id: 10,
            refs: vec![1, 2],
            tags: tags(&[("highway", "service")]),
        });

        let (_, blocks) = build_all(accum);
        let f = blocks[0].features[0];
        assert_eq!(f.kind, GeomKind::Polyline);
        assert_ne!(blocks[0].coords_q7.first(), blocks[0].coords_q7.last());
    }

    #[test]
    fn test_vertex_consumed_by_way_is_not_a_point() {
        let accum = IngestAccum::default();
        accum.add_node(GeoNode::from_deg(1, 51.5010, -0.0810, Vec::new()));
        accum.add_node(GeoNode::from_deg(2, 51.5011, -0.0810, Vec::new()));
        // Same tile, untouched by the way.
        accum.add_node(GeoNode::from_deg(3, 51.5020, -0.0820, tags(&[("amenity", "parking")])));
        accum.add_way(Way {
            id: 10,
            refs: vec![1, 2],
            tags: tags(&[("highway", "service")]),
        });

        let (_, blocks) = build_all(accum);
        let block = &blocks[0];
        assert_eq!(block.features.len(), 2);
        let point = block.features[1];
        assert_eq!(point.kind, GeomKind::Point);
        assert_eq!(point.coord_count, 1);
        let at = point.coord_offset as usize;
        assert_eq!(block.coords_q7[at], [vmt::deg_to_q7(51.5020), vmt::deg_to_q7(-0.0820)]);
        assert_eq!(
            &block.props[point.prop_offset as usize..][..2],
            &[vocab::encode_key("amenity"), vocab::encode_value("amenity", "parking")]
        );
    }

    #[test]
    fn test_way_split_across_tiles_keeps_in_tile_vertices() {
        let accum = IngestAccum::default();
        // Two vertices in one 0.05 degree cell, one in the next column.
        accum.add_node(GeoNode::from_deg(1, 51.5010, -0.0810, Vec::new()));
        accum.add_node(GeoNode::from_deg(2, 51.5011, -0.0790, Vec::new()));
        accum.add_node(GeoNode::from_deg(3, 51.5012, -0.0490, Vec::new()));
        accum.add_way(Way {
            id: 10,
            refs: vec![1, 2, 3],
            tags: tags(&[("highway", "primary")]),
        });

        let (snapshot, blocks) = build_all(accum);
        assert_eq!(snapshot.tiles.len(), 2);
        assert_eq!(blocks.len(), 2);
        for block in &blocks {
            assert_eq!(block.features.len(), 1);
        }
        let counts: Vec<u32> = blocks.iter().map(|b| b.features[0].coord_count).collect();
        assert_eq!(counts.iter().sum::<u32>(), 3);
        assert!(counts.contains(&2) && counts.contains(&1));
        // Ids are dense and increasing across the whole run.
        assert_eq!(blocks[0].features[0].id + 1, blocks[1].features[0].id);
    }

    #[test]
    fn test_way_with_no_in_tile_vertex_is_dropped_entirely() {
        let accum = IngestAccum::default();
        accum.add_node(GeoNode::from_deg(1, 51.5010, -0.0810, Vec::new()));
        // The way references only nodes missing from the table.
        accum.add_way(Way {
            id: 10,
            refs: vec![100, 101],
            tags: tags(&[("highway", "primary"), ("name", "Ghost Road")]),
        });

        let (_, blocks) = build_all(accum);
        let block = &blocks[0];
        assert_eq!(block.features.len(), 1);
        assert_eq!(block.features[0].kind, GeomKind::Point);
        // The dropped way's reserved label never reached the block.
        assert!(block.chars.is_empty());
    }

    #[test]
    fn test_name_label_points_at_characters_record() {
        let accum = IngestAccum::default();
        accum.add_node(GeoNode::from_deg(1, 51.5010, -0.0810, Vec::new()));
        accum.add_node(GeoNode::from_deg(2, 51.5011, -0.0810, Vec::new()));
        accum.add_node(GeoNode::from_deg(
            3,
            51.5020,
            -0.0820,
            tags(&[("name", "Pump House")]),
        ));
        accum.add_way(Way {
            id: 10,
            refs: vec![1, 2],
            tags: tags(&[("highway", "primary"), ("name", "Borough Road")]),
        });

        let (_, blocks) = build_all(accum);
        let block = &blocks[0];
        let way_feature = block.features[0];
        let point_feature = block.features[1];
        assert_eq!(
            label_text(&block.chars, way_feature.label_ptr).unwrap(),
            Some("Borough Road")
        );
        assert_eq!(
            label_text(&block.chars, point_feature.label_ptr).unwrap(),
            Some("Pump House")
        );
    }

    #[test]
    fn test_vertex_tag_merge_first_occurrence_wins() {
        let accum = IngestAccum::default();
        accum.add_node(GeoNode::from_deg(
            1,
            51.5010,
            -0.0810,
            tags(&[("highway", "service"), ("surface", "asphalt")]),
        ));
        accum.add_node(GeoNode::from_deg(2, 51.5011, -0.0810, Vec::new()));
        accum.add_way(Way {
            id: 10,
            refs: vec![1, 2],
            tags: tags(&[("highway", "primary")]),
        });

        let (_, blocks) = build_all(accum);
        let block = &blocks[0];
        let f = block.features[0];
        // The way's own highway tag survives; the vertex's duplicate highway
        // key is dropped, its surface tag is merged in.
        assert_eq!(f.prop_pairs, 2);
        let slots = &block.props[f.prop_offset as usize..][..4];
        assert_eq!(slots[0], vocab::encode_key("highway"));
        assert_eq!(slots[1], vocab::encode_value("highway", "primary"));
        assert_eq!(slots[2], vocab::encode_key("surface"));
    }

    #[test]
    fn test_property_slots_stay_paired() {
        let accum = IngestAccum::default();
        accum.add_node(GeoNode::from_deg(
            1,
            51.5010,
            -0.0810,
            tags(&[("highway", "crossing"), ("unknown_key", "x"), ("name", "A")]),
        ));

        let (_, blocks) = build_all(accum);
        for block in &blocks {
            assert_eq!(block.props.len() % 2, 0);
            for f in &block.features {
                assert_eq!(f.prop_offset % 2, 0);
                assert!((f.prop_offset + 2 * f.prop_pairs) as usize <= block.props.len());
            }
        }
    }

    #[test]
    fn test_full_pipeline_rerun_is_byte_identical() {
        // Insertion order is what varies under the worker pool; feed the
        // same data in opposite orders and run the whole chain down to the
        // serialized bytes.
        fn run(reversed: bool) -> (Vec<u8>, Vec<u8>) {
            let mut items: Vec<GeoNode> = vec![
                GeoNode::from_deg(1, 51.5010, -0.0810, tags(&[("name", "Corner Post")])),
                GeoNode::from_deg(2, 51.5011, -0.0790, Vec::new()),
                GeoNode::from_deg(3, 51.5012, -0.0490, Vec::new()),
                GeoNode::from_deg(4, 48.8500, 2.3500, tags(&[("amenity", "parking")])),
            ];
            let mut ways = vec![
                Way {
                    id: 10,
                    refs: vec![1, 2, 3],
                    tags: tags(&[("highway", "primary"), ("name", "Borough Road")]),
                },
                Way {
                    id: 11,
                    refs: vec![2, 3],
                    tags: tags(&[("highway", "service")]),
                },
            ];
            if reversed {
                items.reverse();
                ways.reverse();
            }

            let accum = IngestAccum::default();
            for node in items {
                accum.add_node(node);
            }
            for way in ways {
                accum.add_way(way);
            }

            let snapshot = accum.finish();
            let partition = partition_ways(&snapshot);
            let mut writer = vmt::MapWriter::new(
                std::io::Cursor::new(Vec::new()),
                Vec::new(),
                snapshot.tiles.len() as u32,
            )
            .unwrap();
            let mut ids = FeatureIds::default();
            for &tile in &snapshot.tiles {
                let block = build_tile(&snapshot, &partition, tile, &mut ids).unwrap();
                writer.write_tile(&block).unwrap();
            }
            let (out, props) = writer.finish().unwrap();
            (out.into_inner(), props)
        }

        let (map_a, props_a) = run(false);
        let (map_b, props_b) = run(true);
        assert_eq!(map_a, map_b);
        assert_eq!(props_a, props_b);
    }

    #[test]
    fn test_tile_assignment_matches_partitioner() {
        let accum = IngestAccum::default();
        accum.add_node(GeoNode::from_deg(1, 51.5010, -0.0810, Vec::new()));
        accum.add_node(GeoNode::from_deg(2, 48.8500, 2.3500, Vec::new()));

        let (snapshot, blocks) = build_all(accum);
        for block in &blocks {
            for &[lat_q7, lon_q7] in &block.coords_q7 {
                assert_eq!(grid::tile_of(lat_q7, lon_q7), block.id);
            }
        }
        assert!(snapshot
            .tiles
            .contains(&grid::tile_of(vmt::deg_to_q7(48.85), vmt::deg_to_q7(2.35))));
    }
}
