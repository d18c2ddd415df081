//! VMT: tile-partitioned vector map format for mmap-friendly random access.
//!
//! - One file holds N tile blocks addressed by a patched offset index.
//! - Coordinates are Q7 fixed point (1e-7 degree ticks, i32 lat/lon).
//! - Tags are pre-encoded integer codes; the codes themselves are persisted
//!   in a companion text artifact (one decimal code per line), not inline.
//! - Feature names live in a per-tile characters block of length-prefixed
//!   UTF-8 records; a feature's label pointer is the byte offset of its
//!   record inside that block, or -1.
//!
//! File layout (little-endian, all offsets absolute byte positions):
//!   00  : u64     version = 1
//!   08  : u32     tile_count
//!   0C  : tile index, tile_count entries of
//!           u32 tile_id, u64 block_offset   (zeros until finish())
//!   ..  : tile blocks, each:
//!           u32 feature_count
//!           u32 coord_count          (lat/lon pairs)
//!           u32 prop_slot_count      (2 x key/value pairs)
//!           u32 char_count           (bytes in characters block)
//!           u64 coords_offset        (patched)
//!           u64 props_offset         (reserved, always 0: see companion)
//!           u64 chars_offset         (patched)
//!           feature records, 33 bytes each:
//!             u64 id, i64 label_ptr, u8 kind,
//!             u32 coord_offset, u32 coord_count,
//!             u32 prop_slot_offset, u32 prop_pairs
//!           coordinate block: [i32 lat_q7, i32 lon_q7] x coord_count
//!           characters block: char_count bytes of [u16 len][utf-8] records
//!
//! Offsets that cannot be known up front (index entries, per-tile coords and
//! characters offsets) are written as zero reservations and back-patched
//! with a bounded seek-write-seek-back once the true position is known.

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::path::Path;

pub const VMT_VERSION: u64 = 1;

/// Label pointer value for features without a name record.
pub const NO_LABEL: i64 = -1;

/// Byte offset of the tile index, immediately after the file header.
pub const INDEX_POS: u64 = 12;

/// Bytes per tile index entry (u32 id + u64 offset).
pub const INDEX_ENTRY_BYTES: u64 = 12;

/// Bytes per fixed-width feature record.
pub const FEATURE_RECORD_BYTES: u64 = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GeomKind {
    Point = 0,
    Polyline = 1,
    Polygon = 2,
}

impl GeomKind {
    fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(GeomKind::Point),
            1 => Ok(GeomKind::Polyline),
            2 => Ok(GeomKind::Polygon),
            x => Err(bad(&format!("unknown geometry kind {}", x))),
        }
    }
}

/// One fixed-width feature record. Coordinate and property ranges are
/// tile-relative; `prop_offset` is a slot offset (pair offset doubled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRecord {
    pub id: u64,
    pub label_ptr: i64,
    pub kind: GeomKind,
    pub coord_offset: u32,
    pub coord_count: u32,
    pub prop_offset: u32,
    pub prop_pairs: u32,
}

/// In-memory form of one tile block. `props` holds the flattened key/value
/// code slots destined for the companion artifact; `parse_map_bytes` leaves
/// it empty because the main file does not carry the codes inline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileBlock {
    pub id: u32,
    pub features: Vec<FeatureRecord>,
    /// Flattened (lat_q7, lon_q7) pairs in feature emission order.
    pub coords_q7: Vec<[i32; 2]>,
    pub props: Vec<u32>,
    pub chars: Vec<u8>,
}

/// Convert a degree coordinate to Q7 ticks (1e-7 degrees).
#[inline]
pub fn deg_to_q7(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

/// Convert Q7 ticks back to degrees.
#[inline]
pub fn q7_to_deg(q7: i32) -> f64 {
    q7 as f64 * 1e-7
}

/// Append a `[u16 len][utf-8]` name record to a characters blob and return
/// its byte offset, usable as a feature label pointer.
pub fn push_label(chars: &mut Vec<u8>, name: &str) -> i64 {
    let at = chars.len() as i64;
    // The length prefix is u16; truncate oversized names on a char boundary
    // so the stored record stays valid UTF-8.
    let mut len = name.len().min(u16::MAX as usize);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    chars.extend_from_slice(&(len as u16).to_le_bytes());
    chars.extend_from_slice(&name.as_bytes()[..len]);
    at
}

/// Resolve a label pointer against a tile's characters blob.
pub fn label_text(chars: &[u8], label_ptr: i64) -> io::Result<Option<&str>> {
    if label_ptr == NO_LABEL {
        return Ok(None);
    }
    let at = usize::try_from(label_ptr).map_err(|_| bad("negative label pointer"))?;
    let mut p = chars.get(at..).ok_or_else(|| bad("label pointer out of range"))?;
    let len = le_u16(&mut p)? as usize;
    let raw = take(&mut p, len)?;
    let text = std::str::from_utf8(raw).map_err(|_| bad("label is not valid UTF-8"))?;
    Ok(Some(text))
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated VMT"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u8(buf: &mut &[u8]) -> io::Result<u8> {
    Ok(take(buf, 1)?[0])
}

#[inline(always)]
fn le_u16(buf: &mut &[u8]) -> io::Result<u16> {
    let b = take(buf, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_u64(buf: &mut &[u8]) -> io::Result<u64> {
    let b = take(buf, 8)?;
    Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

#[inline(always)]
fn le_i64(buf: &mut &[u8]) -> io::Result<i64> {
    Ok(le_u64(buf)? as i64)
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

/// A reserved fixed-width field awaiting its real value.
#[derive(Debug, Clone, Copy)]
#[must_use = "a reservation that is never patched stays zero"]
pub struct Reservation {
    pos: u64,
}

/// Streaming writer for one VMT file plus its companion property artifact.
///
/// Tiles are written strictly one at a time; the writer owns the output
/// cursor for the whole run and restores it to the append point after every
/// patch. `finish` back-fills the tile index and flushes both sinks.
pub struct MapWriter<W: Write + Seek, P: Write> {
    out: W,
    props: P,
    tile_count: u32,
    index: Vec<(u32, u64)>,
}

impl MapWriter<BufWriter<File>, BufWriter<File>> {
    /// Create the main file and the companion property file on disk.
    pub fn create<Q: AsRef<Path>, R: AsRef<Path>>(
        map_path: Q,
        props_path: R,
        tile_count: u32,
    ) -> io::Result<Self> {
        let out = BufWriter::new(File::create(map_path)?);
        let props = BufWriter::new(File::create(props_path)?);
        Self::new(out, props, tile_count)
    }
}

impl<W: Write + Seek, P: Write> MapWriter<W, P> {
    /// Write the file header and a zeroed tile index, leaving the cursor at
    /// the first tile block position.
    pub fn new(mut out: W, props: P, tile_count: u32) -> io::Result<Self> {
        write_u64(&mut out, VMT_VERSION)?;
        write_u32(&mut out, tile_count)?;
        for _ in 0..tile_count {
            write_u32(&mut out, 0)?;
            write_u64(&mut out, 0)?;
        }
        Ok(Self {
            out,
            props,
            tile_count,
            index: Vec::with_capacity(tile_count as usize),
        })
    }

    /// Reserve an 8-byte field at the current position, initialised to zero.
    fn reserve_u64(&mut self) -> io::Result<Reservation> {
        let pos = self.out.stream_position()?;
        write_u64(&mut self.out, 0)?;
        Ok(Reservation { pos })
    }

    /// Overwrite a reservation, then restore the append cursor.
    fn patch_u64(&mut self, r: Reservation, value: u64) -> io::Result<()> {
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(r.pos))?;
        write_u64(&mut self.out, value)?;
        self.out.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Serialize one tile block and append its property codes to the
    /// companion sink. The block's start offset is recorded for the index.
    pub fn write_tile(&mut self, tile: &TileBlock) -> io::Result<()> {
        if self.index.len() == self.tile_count as usize {
            return Err(bad("more tiles than declared in the header"));
        }
        validate_tile(tile)?;

        let start = self.out.stream_position()?;
        self.index.push((tile.id, start));

        write_u32(&mut self.out, tile.features.len() as u32)?;
        write_u32(&mut self.out, tile.coords_q7.len() as u32)?;
        write_u32(&mut self.out, tile.props.len() as u32)?;
        write_u32(&mut self.out, tile.chars.len() as u32)?;

        let coords_at = self.reserve_u64()?;
        let _props_at = self.reserve_u64()?;
        let chars_at = self.reserve_u64()?;

        for f in &tile.features {
            write_u64(&mut self.out, f.id)?;
            write_u64(&mut self.out, f.label_ptr as u64)?;
            self.out.write_all(&[f.kind as u8])?;
            write_u32(&mut self.out, f.coord_offset)?;
            write_u32(&mut self.out, f.coord_count)?;
            write_u32(&mut self.out, f.prop_offset)?;
            write_u32(&mut self.out, f.prop_pairs)?;
        }

        let coords_pos = self.out.stream_position()?;
        for &[lat_q7, lon_q7] in &tile.coords_q7 {
            self.out.write_all(&lat_q7.to_le_bytes())?;
            self.out.write_all(&lon_q7.to_le_bytes())?;
        }
        self.patch_u64(coords_at, coords_pos)?;

        let chars_pos = self.out.stream_position()?;
        self.out.write_all(&tile.chars)?;
        self.patch_u64(chars_at, chars_pos)?;

        for slot in &tile.props {
            writeln!(self.props, "{}", slot)?;
        }

        Ok(())
    }

    /// Back-fill the tile index with the recorded block offsets and flush.
    pub fn finish(mut self) -> io::Result<(W, P)> {
        if self.index.len() != self.tile_count as usize {
            return Err(bad("tile count mismatch at finish"));
        }
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(INDEX_POS))?;
        for &(id, offset) in &self.index {
            write_u32(&mut self.out, id)?;
            write_u64(&mut self.out, offset)?;
        }
        self.out.seek(SeekFrom::Start(end))?;
        self.out.flush()?;
        self.props.flush()?;
        Ok((self.out, self.props))
    }
}

fn validate_tile(tile: &TileBlock) -> io::Result<()> {
    if tile.props.len() % 2 != 0 {
        return Err(bad("odd property slot count"));
    }
    for f in &tile.features {
        let coord_end = f.coord_offset as u64 + f.coord_count as u64;
        if coord_end > tile.coords_q7.len() as u64 {
            return Err(bad("feature coordinate range out of tile bounds"));
        }
        if f.prop_offset % 2 != 0 {
            return Err(bad("feature property slot offset not pair-aligned"));
        }
        let prop_end = f.prop_offset as u64 + 2 * f.prop_pairs as u64;
        if prop_end > tile.props.len() as u64 {
            return Err(bad("feature property range out of tile bounds"));
        }
        if f.label_ptr != NO_LABEL {
            label_text(&tile.chars, f.label_ptr)?;
        }
    }
    Ok(())
}

/// The parsed tile index: (tile id, absolute block offset) in file order.
pub fn parse_index(bytes: &[u8]) -> io::Result<Vec<(u32, u64)>> {
    let mut p = bytes;
    let version = le_u64(&mut p)?;
    if version != VMT_VERSION {
        return Err(bad("unsupported VMT version"));
    }
    let tile_count = le_u32(&mut p)? as usize;
    // The count is untrusted input; prove the entries exist before sizing
    // any allocation from it.
    let index_bytes = tile_count
        .checked_mul(INDEX_ENTRY_BYTES as usize)
        .ok_or_else(|| bad("tile index size overflow"))?;
    need(p, index_bytes)?;
    let mut index = Vec::with_capacity(tile_count);
    for _ in 0..tile_count {
        let id = le_u32(&mut p)?;
        let offset = le_u64(&mut p)?;
        index.push((id, offset));
    }
    Ok(index)
}

/// Parse one tile block at an absolute offset within the full file image.
/// This is the single source of truth for the block layout.
pub fn parse_tile_block(bytes: &[u8], id: u32, offset: u64) -> io::Result<TileBlock> {
    let at = usize::try_from(offset).map_err(|_| bad("tile offset overflow"))?;
    let mut p = bytes.get(at..).ok_or_else(|| bad("tile offset out of range"))?;

    let feature_count = le_u32(&mut p)? as usize;
    let coord_count = le_u32(&mut p)? as usize;
    let prop_slots = le_u32(&mut p)? as usize;
    let char_count = le_u32(&mut p)? as usize;
    if prop_slots % 2 != 0 {
        return Err(bad("odd property slot count"));
    }
    let coords_offset = le_u64(&mut p)?;
    let _props_offset = le_u64(&mut p)?;
    let chars_offset = le_u64(&mut p)?;

    // Same rule as the index: the declared feature count must be backed by
    // actual record bytes before it sizes an allocation.
    let record_bytes = feature_count
        .checked_mul(FEATURE_RECORD_BYTES as usize)
        .ok_or_else(|| bad("feature table size overflow"))?;
    need(p, record_bytes)?;
    let mut features = Vec::with_capacity(feature_count);
    for _ in 0..feature_count {
        let fid = le_u64(&mut p)?;
        let label_ptr = le_i64(&mut p)?;
        let kind = GeomKind::from_u8(le_u8(&mut p)?)?;
        let coord_offset = le_u32(&mut p)?;
        let coord_count = le_u32(&mut p)?;
        let prop_offset = le_u32(&mut p)?;
        let prop_pairs = le_u32(&mut p)?;
        features.push(FeatureRecord {
            id: fid,
            label_ptr,
            kind,
            coord_offset,
            coord_count,
            prop_offset,
            prop_pairs,
        });
    }

    let coords_at = usize::try_from(coords_offset).map_err(|_| bad("coords offset overflow"))?;
    let coords_bytes = coord_count
        .checked_mul(8)
        .ok_or_else(|| bad("coordinate block size overflow"))?;
    let raw = coords_at
        .checked_add(coords_bytes)
        .and_then(|end| bytes.get(coords_at..end))
        .ok_or_else(|| bad("coordinate block out of range"))?;

    // Feature records are 33 bytes wide, so the coordinate block carries no
    // alignment guarantee; decode each pair unaligned.
    let mut coords_q7 = Vec::with_capacity(coord_count);
    for chunk in raw.chunks_exact(8) {
        coords_q7.push(bytemuck::pod_read_unaligned::<[i32; 2]>(chunk));
    }

    let chars_at = usize::try_from(chars_offset).map_err(|_| bad("chars offset overflow"))?;
    let chars = chars_at
        .checked_add(char_count)
        .and_then(|end| bytes.get(chars_at..end))
        .ok_or_else(|| bad("characters block out of range"))?
        .to_vec();

    Ok(TileBlock {
        id,
        features,
        coords_q7,
        props: Vec::new(),
        chars,
    })
}

/// Parsed image of a whole VMT file.
#[derive(Debug, Clone)]
pub struct MapFile {
    pub tiles: Vec<TileBlock>,
}

/// Parse a full VMT file from a contiguous byte slice.
pub fn parse_map_bytes(bytes: &[u8]) -> io::Result<MapFile> {
    let index = parse_index(bytes)?;
    let mut tiles = Vec::with_capacity(index.len());
    for (id, offset) in index {
        tiles.push(parse_tile_block(bytes, id, offset)?);
    }
    Ok(MapFile { tiles })
}

/// Parse the companion property artifact back into flat code slots.
pub fn parse_props_text(text: &str) -> io::Result<Vec<u32>> {
    let mut slots = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let code: u32 = line.parse().map_err(|_| bad("non-decimal property line"))?;
        slots.push(code);
    }
    if slots.len() % 2 != 0 {
        return Err(bad("companion artifact holds an odd slot count"));
    }
    Ok(slots)
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<Q: AsRef<Path>>(path: Q) -> io::Result<MapFile> {
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    parse_map_bytes(&map)
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<Q: AsRef<Path>>(path: Q) -> io::Result<MapFile> {
    let bytes = std::fs::read(path)?;
    parse_map_bytes(&bytes)
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
