//! Spatial partitioner: quantizes a Q7 coordinate into a fixed 0.05 degree
//! grid cell and packs both cell indices into one u32 tile id. The packing
//! is a versioned contract shared with downstream readers of the map file.

/// Grid cell edge in Q7 ticks (0.05 degrees).
pub const CELL_Q7: i64 = 500_000;

const LON_ORIGIN_Q7: i64 = 1_800_000_000;
const LAT_ORIGIN_Q7: i64 = 900_000_000;

/// Tile id for a Q7 coordinate: `(cell_x << 16) | cell_y`, where `cell_x`
/// counts 0.05 degree columns from longitude -180 and `cell_y` rows from
/// latitude -90. Total over the valid coordinate range (7201 x 3601 cells,
/// both within 16 bits), deterministic, pure.
#[inline]
pub fn tile_of(lat_q7: i32, lon_q7: i32) -> u32 {
    let cell_x = ((lon_q7 as i64 + LON_ORIGIN_Q7) / CELL_Q7) as u32;
    let cell_y = ((lat_q7 as i64 + LAT_ORIGIN_Q7) / CELL_Q7) as u32;
    (cell_x << 16) | (cell_y & 0xFFFF)
}

/// Unpack a tile id back into (cell_x, cell_y).
#[inline]
pub fn tile_cells(tile_id: u32) -> (u16, u16) {
    ((tile_id >> 16) as u16, (tile_id & 0xFFFF) as u16)
}
