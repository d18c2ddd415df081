//! Closed tag vocabulary: string keys and values reduced to small integer
//! codes. Both tables are versioned external contracts shared with the
//! renderer; rule order in `encode_value` is first-match-wins and must not
//! be reordered.

/// Value code emitted for a `name` value no other rule claims. The actual
/// text is carried by the tile's characters block, not by this code.
pub const NAME_VALUE: u32 = 99;

/// Map a known tag key to its stable code; unknown keys map to 0.
pub fn encode_key(key: &str) -> u32 {
    match key {
        "highway" => 1,
        "building" => 2,
        "name" => 3,
        "landuse" => 4,
        "natural" => 5,
        "waterway" => 6,
        "railway" => 7,
        "leisure" => 8,
        "amenity" => 9,
        "barrier" => 10,
        "boundary" => 11,
        "place" => 12,
        "power" => 13,
        "shop" => 14,
        "surface" => 15,
        "tourism" => 16,
        "water" => 17,
        "bridge" => 18,
        "tunnel" => 19,
        "access" => 20,
        "oneway" => 21,
        "layer" => 22,
        "ref" => 23,
        _ => 0,
    }
}

/// Map a tag value to its code. An ordered chain of prefix and equality
/// checks; several rules are conditioned jointly on the key (for instance
/// `highway=residential` is a road class while `landuse=residential` is a
/// zoning class). Unmatched values map to 0; free text is not preserved.
pub fn encode_value(key: &str, value: &str) -> u32 {
    if value.starts_with("motorway") {
        1
    } else if value.starts_with("trunk") {
        2
    } else if value.starts_with("primary") {
        3
    } else if value.starts_with("secondary") {
        4
    } else if value.starts_with("tertiary") {
        5
    } else if key == "highway" && value == "residential" {
        6
    } else if value == "service" {
        7
    } else if value == "unclassified" {
        8
    } else if value.starts_with("pedestrian") {
        9
    } else if value == "footway" || value == "path" || value == "steps" {
        10
    } else if value == "cycleway" {
        11
    } else if value == "living_street" {
        12
    } else if key == "building" && value == "yes" {
        13
    } else if value == "house" || value == "apartments" {
        14
    } else if key == "building" && value == "industrial" {
        15
    } else if value == "water" {
        16
    } else if value == "riverbank" || value == "river" {
        17
    } else if value == "stream" || value == "canal" {
        18
    } else if value == "forest" || value == "wood" {
        19
    } else if value == "grass" || value == "meadow" {
        20
    } else if value == "residential" {
        21
    } else if value == "industrial" {
        22
    } else if value == "park" || value == "pitch" {
        23
    } else if value == "rail" {
        24
    } else if value == "parking" {
        25
    } else if key == "name" {
        NAME_VALUE
    } else {
        0
    }
}
