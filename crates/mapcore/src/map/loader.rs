//! Reader for the versioned binary world-file format.
//!
//! Layout (little-endian), version 1 only: a fixed header, a string
//! table (tileset/music filenames plus map script sources), per-layer
//! tile grids with authored obstruction segments, entity records
//! (persons and triggers), zone records, and optionally an embedded
//! tileset at the tail when no tileset filename is given.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::geometry::Rect;
use crate::host::{AssetError, EngineHost, TilesetCatalog};
use crate::map::{Layer, Map, MapScripts, PersonTemplate, TileCell, Trigger, Zone};
use crate::obstruction::{ObstructionIndex, Segment};
use crate::person::{Direction, PersonScripts};
use crate::script::ScriptHandle;

const MAGIC: &[u8; 4] = b".rmp";
const SUPPORTED_VERSION: u16 = 1;
const HEADER_RESERVED_BYTES: usize = 234;
const ENTITY_RESERVED_BYTES: usize = 8;
const PERSON_RESERVED_BYTES: usize = 16;
const ZONE_RESERVED_BYTES: usize = 4;

const ENTITY_PERSON: u16 = 1;
const ENTITY_TRIGGER: u16 = 2;

const LAYER_FLAG_PARALLAX: u16 = 1 << 0;
const LAYER_FLAG_HIDDEN: u16 = 1 << 1;

/// Required person script slots, in file order.
const PERSON_SCRIPT_SLOTS: usize = 5;

#[derive(Debug, Error)]
pub enum MapLoadError {
    #[error("failed to read world file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("world file {path} has invalid format: {message}")]
    InvalidFormat { path: PathBuf, message: String },
    #[error("failed to load collaborator asset for {path}: {source}")]
    Asset {
        path: PathBuf,
        #[source]
        source: AssetError,
    },
}

/// A parsed world plus the tileset catalog it references.
pub struct LoadedMap {
    pub map: Map,
    pub tileset: Box<dyn TilesetCatalog>,
}

impl std::fmt::Debug for LoadedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedMap").finish_non_exhaustive()
    }
}

pub fn load_map(path: &Path, host: &mut dyn EngineHost) -> Result<LoadedMap, MapLoadError> {
    let bytes = fs::read(path).map_err(|source| MapLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_map(&bytes, path, host)
}

fn parse_map(
    bytes: &[u8],
    path: &Path,
    host: &mut dyn EngineHost,
) -> Result<LoadedMap, MapLoadError> {
    let mut cursor = 0usize;

    let magic = read_exact(bytes, &mut cursor, 4, path)?;
    if magic != MAGIC {
        return Err(invalid_format(path, "invalid magic"));
    }
    let version = read_u16(bytes, &mut cursor, path)?;
    if version != SUPPORTED_VERSION {
        return Err(invalid_format(
            path,
            &format!("unsupported version {version}"),
        ));
    }
    let _map_type = read_u8(bytes, &mut cursor, path)?;
    let layer_count = read_i8(bytes, &mut cursor, path)?;
    let _reserved = read_u8(bytes, &mut cursor, path)?;
    let entity_count = read_i16(bytes, &mut cursor, path)?;
    let start_x = read_i16(bytes, &mut cursor, path)?;
    let start_y = read_i16(bytes, &mut cursor, path)?;
    let start_layer = read_i8(bytes, &mut cursor, path)?;
    let start_direction = read_i8(bytes, &mut cursor, path)?;
    let string_count = read_i16(bytes, &mut cursor, path)?;
    let zone_count = read_i16(bytes, &mut cursor, path)?;
    let repeating = read_u8(bytes, &mut cursor, path)? != 0;
    read_exact(bytes, &mut cursor, HEADER_RESERVED_BYTES, path)?;

    if layer_count < 1 {
        return Err(invalid_format(
            path,
            &format!("layer count {layer_count} out of range"),
        ));
    }
    if entity_count < 0 {
        return Err(invalid_format(path, "negative entity count"));
    }
    if zone_count < 0 {
        return Err(invalid_format(path, "negative zone count"));
    }
    if !(string_count == 3 || string_count == 5 || string_count >= 9) {
        return Err(invalid_format(
            path,
            &format!("string count {string_count} is not 3, 5 or >= 9"),
        ));
    }

    // String table. Everything past the four edge scripts is legacy
    // payload and gets dropped on the floor.
    let mut strings = Vec::with_capacity(string_count as usize);
    for _ in 0..string_count {
        strings.push(read_string(bytes, &mut cursor, path)?);
    }
    let tileset_filename = strings[0].clone();
    let music_filename = strings[1].clone();
    if string_count > 9 {
        debug!(
            path = %path.display(),
            dropped = string_count - 9,
            "discarding legacy world-file strings"
        );
    }

    let mut scripts = MapScripts::default();
    if string_count >= 5 {
        scripts.on_enter = compile_optional(host, &strings[3], path, "enter")?;
        scripts.on_leave = compile_optional(host, &strings[4], path, "leave")?;
    }
    if string_count >= 9 {
        scripts.on_leave_north = compile_optional(host, &strings[5], path, "leave-north")?;
        scripts.on_leave_east = compile_optional(host, &strings[6], path, "leave-east")?;
        scripts.on_leave_south = compile_optional(host, &strings[7], path, "leave-south")?;
        scripts.on_leave_west = compile_optional(host, &strings[8], path, "leave-west")?;
    }

    let mut layers = Vec::with_capacity(layer_count as usize);
    let mut raw_tiles: Vec<Vec<u16>> = Vec::with_capacity(layer_count as usize);
    for layer_index in 0..layer_count {
        let width = read_i16(bytes, &mut cursor, path)?;
        let height = read_i16(bytes, &mut cursor, path)?;
        if width < 1 || height < 1 {
            return Err(invalid_format(
                path,
                &format!("layer {layer_index} has invalid size {width}x{height}"),
            ));
        }
        let flags = read_u16(bytes, &mut cursor, path)?;
        let parallax_x = read_f32(bytes, &mut cursor, path)?;
        let parallax_y = read_f32(bytes, &mut cursor, path)?;
        let scroll_x = read_f32(bytes, &mut cursor, path)?;
        let scroll_y = read_f32(bytes, &mut cursor, path)?;
        let segment_count = read_i32(bytes, &mut cursor, path)?;
        if segment_count < 0 {
            return Err(invalid_format(
                path,
                &format!("layer {layer_index} has negative segment count"),
            ));
        }
        let reflective = read_u8(bytes, &mut cursor, path)? != 0;
        let name = read_string(bytes, &mut cursor, path)?;

        let cell_count = width as usize * height as usize;
        let mut tiles = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            tiles.push(read_u16(bytes, &mut cursor, path)?);
        }

        let mut obstructions = ObstructionIndex::new();
        for _ in 0..segment_count {
            let x1 = read_i32(bytes, &mut cursor, path)?;
            let y1 = read_i32(bytes, &mut cursor, path)?;
            let x2 = read_i32(bytes, &mut cursor, path)?;
            let y2 = read_i32(bytes, &mut cursor, path)?;
            obstructions.push(Segment::new(x1 as f64, y1 as f64, x2 as f64, y2 as f64));
        }

        let mut layer = Layer::new(name, width as u32, height as u32);
        layer.visible = flags & LAYER_FLAG_HIDDEN == 0;
        layer.parallax = flags & LAYER_FLAG_PARALLAX != 0;
        layer.parallax_x = parallax_x as f64;
        layer.parallax_y = parallax_y as f64;
        layer.scroll_x = scroll_x as f64;
        layer.scroll_y = scroll_y as f64;
        layer.reflective = reflective;
        layer.obstructions = obstructions;
        layers.push(layer);
        raw_tiles.push(tiles);
    }

    let mut templates = Vec::new();
    let mut triggers = Vec::new();
    for entity_index in 0..entity_count {
        let x = read_u16(bytes, &mut cursor, path)? as f64;
        let y = read_u16(bytes, &mut cursor, path)? as f64;
        let raw_layer = read_u16(bytes, &mut cursor, path)? as usize;
        let entity_type = read_u16(bytes, &mut cursor, path)?;
        read_exact(bytes, &mut cursor, ENTITY_RESERVED_BYTES, path)?;
        let layer = normalize_layer(raw_layer, layers.len(), path, "entity");

        match entity_type {
            ENTITY_PERSON => {
                let name = read_string(bytes, &mut cursor, path)?;
                let spriteset = read_string(bytes, &mut cursor, path)?;
                let script_count = read_i16(bytes, &mut cursor, path)?;
                if (script_count as usize) < PERSON_SCRIPT_SLOTS {
                    return Err(invalid_format(
                        path,
                        &format!("person entity {entity_index} has {script_count} scripts"),
                    ));
                }
                let mut sources = Vec::with_capacity(script_count as usize);
                for _ in 0..script_count {
                    sources.push(read_string(bytes, &mut cursor, path)?);
                }
                // Slots past the known five are legacy and discarded.
                let origin = |slot: &str| format!("person '{name}' {slot}");
                let scripts = PersonScripts {
                    on_create: compile_optional(host, &sources[0], path, &origin("create"))?,
                    on_destroy: compile_optional(host, &sources[1], path, &origin("destroy"))?,
                    on_touch: compile_optional(host, &sources[2], path, &origin("touch"))?,
                    on_talk: compile_optional(host, &sources[3], path, &origin("talk"))?,
                    on_generate_commands: compile_optional(
                        host,
                        &sources[4],
                        path,
                        &origin("generator"),
                    )?,
                };
                read_exact(bytes, &mut cursor, PERSON_RESERVED_BYTES, path)?;
                templates.push(PersonTemplate {
                    name,
                    spriteset,
                    x,
                    y,
                    layer,
                    scripts,
                });
            }
            ENTITY_TRIGGER => {
                let source = read_string(bytes, &mut cursor, path)?;
                let script =
                    compile_optional(host, &source, path, &format!("trigger[{entity_index}]"))?;
                triggers.push(Trigger {
                    x,
                    y,
                    layer,
                    script,
                });
            }
            other => {
                return Err(invalid_format(
                    path,
                    &format!("unknown entity type {other}"),
                ));
            }
        }
    }

    let mut zones = Vec::with_capacity(zone_count as usize);
    for zone_index in 0..zone_count {
        let x1 = read_u16(bytes, &mut cursor, path)? as f64;
        let y1 = read_u16(bytes, &mut cursor, path)? as f64;
        let x2 = read_u16(bytes, &mut cursor, path)? as f64;
        let y2 = read_u16(bytes, &mut cursor, path)? as f64;
        let raw_layer = read_u16(bytes, &mut cursor, path)? as usize;
        let interval = read_u16(bytes, &mut cursor, path)?;
        read_exact(bytes, &mut cursor, ZONE_RESERVED_BYTES, path)?;
        let source = read_string(bytes, &mut cursor, path)?;
        if interval == 0 {
            return Err(invalid_format(
                path,
                &format!("zone {zone_index} has a zero step interval"),
            ));
        }
        if x2 < x1 || y2 < y1 {
            return Err(invalid_format(
                path,
                &format!("zone {zone_index} has inverted bounds"),
            ));
        }
        let layer = normalize_layer(raw_layer, layers.len(), path, "zone");
        let script = compile_optional(host, &source, path, &format!("zone[{zone_index}]"))?;
        zones.push(Zone::new(
            Rect::new(x1, y1, x2 - x1, y2 - y1),
            layer,
            interval as u32,
            script,
        ));
    }

    let tileset = if tileset_filename.is_empty() {
        let embedded =
            host.load_embedded_tileset(&bytes[cursor..])
                .map_err(|source| MapLoadError::Asset {
                    path: path.to_path_buf(),
                    source,
                })?;
        cursor += embedded.bytes_consumed;
        embedded.tileset
    } else {
        host.load_tileset(&tileset_filename)
            .map_err(|source| MapLoadError::Asset {
                path: path.to_path_buf(),
                source,
            })?
    };
    if cursor != bytes.len() {
        return Err(invalid_format(path, "unexpected trailing bytes"));
    }

    // Tile indices must address the catalog; seed animation countdowns
    // from the catalog's delay chain.
    let tile_count = tileset.tile_count();
    for (layer, tiles) in layers.iter_mut().zip(raw_tiles) {
        for (cell, tile) in layer.cells.iter_mut().zip(tiles) {
            let tile = tile as usize;
            if tile >= tile_count {
                return Err(invalid_format(
                    path,
                    &format!("tile index {tile} exceeds tileset size {tile_count}"),
                ));
            }
            *cell = TileCell {
                index: tile,
                frames_left: tileset.delay(tile),
            };
        }
    }

    let start_layer = normalize_layer(
        if start_layer < 0 {
            layers.len()
        } else {
            start_layer as usize
        },
        layers.len(),
        path,
        "start",
    );
    let start_direction = Direction::from_index(start_direction).unwrap_or(Direction::South);

    let mut map = Map {
        layers,
        triggers,
        zones,
        templates,
        scripts,
        music: if music_filename.is_empty() {
            None
        } else {
            Some(music_filename)
        },
        repeating,
        start_x: start_x as f64,
        start_y: start_y as f64,
        start_layer,
        start_direction,
        tile_width: tileset.tile_width(),
        tile_height: tileset.tile_height(),
        pixel_width: 0,
        pixel_height: 0,
    };
    map.recompute_pixel_size();

    debug!(
        path = %path.display(),
        layers = map.layers.len(),
        triggers = map.triggers.len(),
        zones = map.zones.len(),
        persons = map.templates.len(),
        "world_file_loaded"
    );
    Ok(LoadedMap { map, tileset })
}

fn normalize_layer(layer: usize, layer_count: usize, path: &Path, what: &str) -> usize {
    if layer >= layer_count {
        warn!(
            path = %path.display(),
            what,
            layer,
            layer_count,
            "out-of-range layer normalized to 0"
        );
        0
    } else {
        layer
    }
}

fn compile_optional(
    host: &mut dyn EngineHost,
    source: &str,
    path: &Path,
    slot: &str,
) -> Result<Option<ScriptHandle>, MapLoadError> {
    if source.is_empty() {
        return Ok(None);
    }
    let origin = format!("{}:{slot}", path.display());
    host.compile_script(source, &origin)
        .map(Some)
        .map_err(|source| MapLoadError::Asset {
            path: path.to_path_buf(),
            source,
        })
}

fn read_exact<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
    path: &Path,
) -> Result<&'a [u8], MapLoadError> {
    let end = cursor.saturating_add(len);
    if end > bytes.len() {
        return Err(invalid_format(path, "unexpected end of file"));
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}

fn read_u8(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<u8, MapLoadError> {
    Ok(read_exact(bytes, cursor, 1, path)?[0])
}

fn read_i8(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<i8, MapLoadError> {
    Ok(read_u8(bytes, cursor, path)? as i8)
}

fn read_u16(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<u16, MapLoadError> {
    Ok(u16::from_le_bytes(
        read_exact(bytes, cursor, 2, path)?
            .try_into()
            .map_err(|_| invalid_format(path, "invalid u16 encoding"))?,
    ))
}

fn read_i16(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<i16, MapLoadError> {
    Ok(read_u16(bytes, cursor, path)? as i16)
}

fn read_i32(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<i32, MapLoadError> {
    Ok(i32::from_le_bytes(
        read_exact(bytes, cursor, 4, path)?
            .try_into()
            .map_err(|_| invalid_format(path, "invalid i32 encoding"))?,
    ))
}

fn read_f32(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<f32, MapLoadError> {
    Ok(f32::from_le_bytes(
        read_exact(bytes, cursor, 4, path)?
            .try_into()
            .map_err(|_| invalid_format(path, "invalid f32 encoding"))?,
    ))
}

fn read_string(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<String, MapLoadError> {
    let len = read_u16(bytes, cursor, path)? as usize;
    let raw = read_exact(bytes, cursor, len, path)?;
    std::str::from_utf8(raw)
        .map(|value| value.to_string())
        .map_err(|_| invalid_format(path, "invalid UTF-8 string"))
}

fn invalid_format(path: &Path, message: &str) -> MapLoadError {
    MapLoadError::InvalidFormat {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}
