//! Shared stubs and builders for tests.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::geometry::Rect;
use crate::host::{
    AssetError, EmbeddedTileset, EngineHost, Spriteset, TilesetCatalog,
};
use crate::map::loader::LoadedMap;
use crate::map::{Layer, Map, MapScripts};
use crate::person::Direction;
use crate::script::{FnScript, ScriptHandle};

/// Fixed-size sprite sheet: an 8x8 base footprint, four frames per
/// pose, no frame delays.
#[derive(Default)]
pub struct StubSpriteset;

impl Spriteset for StubSpriteset {
    fn base(&self) -> Rect {
        Rect::new(-4.0, -4.0, 8.0, 8.0)
    }

    fn default_pose(&self) -> &str {
        "south"
    }

    fn pose_frames(&self, _pose: &str) -> usize {
        4
    }

    fn frame_delay(&self, _pose: &str, _frame: usize) -> u32 {
        0
    }
}

/// Tile catalog with scriptable animation chains and per-tile solidity.
pub struct StubTileset {
    tile_width: u32,
    tile_height: u32,
    tile_count: usize,
    chains: HashMap<usize, (u32, usize)>,
    solid: Vec<usize>,
}

impl StubTileset {
    pub fn new(tile_width: u32, tile_height: u32, tile_count: usize) -> Self {
        Self {
            tile_width,
            tile_height,
            tile_count,
            chains: HashMap::new(),
            solid: Vec::new(),
        }
    }

    /// `chains` entries are `(tile, delay, next_tile)`.
    pub fn animated(
        tile_width: u32,
        tile_height: u32,
        tile_count: usize,
        chains: &[(usize, u32, usize)],
    ) -> Self {
        let mut tileset = Self::new(tile_width, tile_height, tile_count);
        for &(tile, delay, next) in chains {
            tileset.chains.insert(tile, (delay, next));
        }
        tileset
    }

    /// Mark a tile as fully obstructed.
    pub fn set_solid(&mut self, tile: usize) {
        self.solid.push(tile);
    }
}

impl TilesetCatalog for StubTileset {
    fn tile_width(&self) -> u32 {
        self.tile_width
    }

    fn tile_height(&self) -> u32 {
        self.tile_height
    }

    fn tile_count(&self) -> usize {
        self.tile_count
    }

    fn delay(&self, tile: usize) -> u32 {
        self.chains.get(&tile).map(|&(delay, _)| delay).unwrap_or(0)
    }

    fn next_tile(&self, tile: usize) -> usize {
        self.chains.get(&tile).map(|&(_, next)| next).unwrap_or(tile)
    }

    fn tile_obstructed(&self, tile: usize, rect: Rect) -> bool {
        self.solid.contains(&tile)
            && rect.intersects(&Rect::new(
                0.0,
                0.0,
                self.tile_width as f64,
                self.tile_height as f64,
            ))
    }
}

/// Host stub: serves a 16-tile catalog of 16px tiles, stub spritesets
/// for any filename, and no-op scripts; records what it was asked for.
/// The recorders are shared handles so a test can clone them before
/// the host moves into an engine.
pub struct StubHost {
    pub compiled: Rc<RefCell<Vec<String>>>,
    pub music_played: Rc<RefCell<Vec<String>>>,
    pub music_stops: Rc<Cell<usize>>,
}

impl StubHost {
    pub fn new() -> Self {
        Self {
            compiled: Rc::new(RefCell::new(Vec::new())),
            music_played: Rc::new(RefCell::new(Vec::new())),
            music_stops: Rc::new(Cell::new(0)),
        }
    }
}

impl EngineHost for StubHost {
    fn load_tileset(&mut self, _filename: &str) -> Result<Box<dyn TilesetCatalog>, AssetError> {
        Ok(Box::new(StubTileset::new(16, 16, 16)))
    }

    fn load_embedded_tileset(&mut self, bytes: &[u8]) -> Result<EmbeddedTileset, AssetError> {
        Ok(EmbeddedTileset {
            tileset: Box::new(StubTileset::new(16, 16, 16)),
            bytes_consumed: bytes.len(),
        })
    }

    fn load_spriteset(&mut self, _filename: &str) -> Result<Rc<dyn Spriteset>, AssetError> {
        Ok(Rc::new(StubSpriteset))
    }

    fn compile_script(&mut self, source: &str, _origin: &str) -> Result<ScriptHandle, AssetError> {
        self.compiled.borrow_mut().push(source.to_string());
        Ok(FnScript::handle(|_| Ok(())))
    }

    fn play_music(&mut self, filename: &str) -> Result<(), AssetError> {
        self.music_played.borrow_mut().push(filename.to_string());
        Ok(())
    }

    fn stop_music(&mut self) {
        self.music_stops.set(self.music_stops.get() + 1);
    }
}

/// Single-layer map with no triggers, zones or spawn templates.
pub fn bare_map(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Map {
    let mut map = Map {
        layers: vec![Layer::new("ground", width, height)],
        triggers: Vec::new(),
        zones: Vec::new(),
        templates: Vec::new(),
        scripts: MapScripts::default(),
        music: None,
        repeating: false,
        start_x: 0.0,
        start_y: 0.0,
        start_layer: 0,
        start_direction: Direction::South,
        tile_width,
        tile_height,
        pixel_width: 0,
        pixel_height: 0,
    };
    map.recompute_pixel_size();
    map
}

/// Pair a hand-built map with the default stub catalog.
pub fn loaded(map: Map) -> LoadedMap {
    LoadedMap {
        map,
        tileset: Box::new(StubTileset::new(16, 16, 16)),
    }
}

// ---- world-file builder -------------------------------------------

pub struct LayerSpec {
    pub name: String,
    pub width: i16,
    pub height: i16,
    pub flags: u16,
    pub parallax_x: f32,
    pub parallax_y: f32,
    pub scroll_x: f32,
    pub scroll_y: f32,
    pub reflective: bool,
    pub tiles: Vec<u16>,
    pub segments: Vec<(i32, i32, i32, i32)>,
}

impl LayerSpec {
    pub fn filled(name: &str, width: i16, height: i16, tile: u16) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            flags: 0,
            parallax_x: 1.0,
            parallax_y: 1.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
            reflective: false,
            tiles: vec![tile; width as usize * height as usize],
            segments: Vec::new(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        push_i16(out, self.width);
        push_i16(out, self.height);
        push_u16(out, self.flags);
        push_f32(out, self.parallax_x);
        push_f32(out, self.parallax_y);
        push_f32(out, self.scroll_x);
        push_f32(out, self.scroll_y);
        push_i32(out, self.segments.len() as i32);
        out.push(self.reflective as u8);
        push_string(out, &self.name);
        for &tile in &self.tiles {
            push_u16(out, tile);
        }
        for &(x1, y1, x2, y2) in &self.segments {
            push_i32(out, x1);
            push_i32(out, y1);
            push_i32(out, x2);
            push_i32(out, y2);
        }
    }
}

pub enum EntitySpec {
    Person {
        x: u16,
        y: u16,
        layer: u16,
        name: String,
        spriteset: String,
        scripts: Vec<String>,
    },
    Trigger {
        x: u16,
        y: u16,
        layer: u16,
        script: String,
    },
    Unknown {
        x: u16,
        y: u16,
        layer: u16,
        entity_type: u16,
    },
}

impl EntitySpec {
    pub fn person(
        x: u16,
        y: u16,
        layer: u16,
        name: &str,
        spriteset: &str,
        scripts: &[&str],
    ) -> Self {
        Self::Person {
            x,
            y,
            layer,
            name: name.to_string(),
            spriteset: spriteset.to_string(),
            scripts: scripts.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn trigger(x: u16, y: u16, layer: u16, script: &str) -> Self {
        Self::Trigger {
            x,
            y,
            layer,
            script: script.to_string(),
        }
    }

    pub fn unknown(x: u16, y: u16, layer: u16, entity_type: u16) -> Self {
        Self::Unknown {
            x,
            y,
            layer,
            entity_type,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let (x, y, layer, entity_type) = match self {
            Self::Person { x, y, layer, .. } => (*x, *y, *layer, 1),
            Self::Trigger { x, y, layer, .. } => (*x, *y, *layer, 2),
            Self::Unknown {
                x,
                y,
                layer,
                entity_type,
            } => (*x, *y, *layer, *entity_type),
        };
        push_u16(out, x);
        push_u16(out, y);
        push_u16(out, layer);
        push_u16(out, entity_type);
        out.extend_from_slice(&[0u8; 8]);
        match self {
            Self::Person {
                name,
                spriteset,
                scripts,
                ..
            } => {
                push_string(out, name);
                push_string(out, spriteset);
                push_i16(out, scripts.len() as i16);
                for script in scripts {
                    push_string(out, script);
                }
                out.extend_from_slice(&[0u8; 16]);
            }
            Self::Trigger { script, .. } => push_string(out, script),
            Self::Unknown { .. } => {}
        }
    }
}

pub struct ZoneSpec {
    pub x1: u16,
    pub y1: u16,
    pub x2: u16,
    pub y2: u16,
    pub layer: u16,
    pub interval: u16,
    pub script: String,
}

impl ZoneSpec {
    fn encode(&self, out: &mut Vec<u8>) {
        push_u16(out, self.x1);
        push_u16(out, self.y1);
        push_u16(out, self.x2);
        push_u16(out, self.y2);
        push_u16(out, self.layer);
        push_u16(out, self.interval);
        out.extend_from_slice(&[0u8; 4]);
        push_string(out, &self.script);
    }
}

/// In-memory world file that encodes itself in the on-disk layout.
/// Fields are public so tests can corrupt individual pieces.
pub struct WorldFile {
    pub magic: [u8; 4],
    pub version: u16,
    pub start_x: i16,
    pub start_y: i16,
    pub start_layer: i8,
    pub start_direction: i8,
    pub repeating: bool,
    pub strings: Vec<String>,
    pub layers: Vec<LayerSpec>,
    pub entities: Vec<EntitySpec>,
    pub zones: Vec<ZoneSpec>,
    pub trailing: Vec<u8>,
}

impl WorldFile {
    /// One 16x16 ground layer, an external tileset, no music and no
    /// map scripts.
    pub fn minimal() -> Self {
        Self {
            magic: *b".rmp",
            version: 1,
            start_x: 0,
            start_y: 0,
            start_layer: 0,
            start_direction: 4,
            repeating: false,
            strings: vec!["tiles.rts".to_string(), String::new(), String::new()],
            layers: vec![LayerSpec::filled("ground", 16, 16, 0)],
            entities: Vec::new(),
            zones: Vec::new(),
            trailing: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.magic);
        push_u16(&mut out, self.version);
        out.push(0); // map type
        out.push(self.layers.len() as u8);
        out.push(0); // reserved
        push_i16(&mut out, self.entities.len() as i16);
        push_i16(&mut out, self.start_x);
        push_i16(&mut out, self.start_y);
        out.push(self.start_layer as u8);
        out.push(self.start_direction as u8);
        push_i16(&mut out, self.strings.len() as i16);
        push_i16(&mut out, self.zones.len() as i16);
        out.push(self.repeating as u8);
        out.extend_from_slice(&[0u8; 234]);
        for string in &self.strings {
            push_string(&mut out, string);
        }
        for layer in &self.layers {
            layer.encode(&mut out);
        }
        for entity in &self.entities {
            entity.encode(&mut out);
        }
        for zone in &self.zones {
            zone.encode(&mut out);
        }
        out.extend_from_slice(&self.trailing);
        out
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_string(out: &mut Vec<u8>, value: &str) {
    push_u16(out, value.len() as u16);
    out.extend_from_slice(value.as_bytes());
}
