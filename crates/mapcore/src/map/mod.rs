pub mod loader;

use crate::geometry::{Rect, Vec2};
use crate::host::TilesetCatalog;
use crate::obstruction::ObstructionIndex;
use crate::person::{Direction, PersonScripts};
use crate::script::ScriptHandle;

/// Map-level script event slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapScriptEvent {
    Enter,
    Leave,
    LeaveNorth,
    LeaveEast,
    LeaveSouth,
    LeaveWest,
}

#[derive(Clone, Default)]
pub struct MapScripts {
    pub on_enter: Option<ScriptHandle>,
    pub on_leave: Option<ScriptHandle>,
    pub on_leave_north: Option<ScriptHandle>,
    pub on_leave_east: Option<ScriptHandle>,
    pub on_leave_south: Option<ScriptHandle>,
    pub on_leave_west: Option<ScriptHandle>,
}

impl MapScripts {
    pub fn get(&self, event: MapScriptEvent) -> Option<&ScriptHandle> {
        match event {
            MapScriptEvent::Enter => self.on_enter.as_ref(),
            MapScriptEvent::Leave => self.on_leave.as_ref(),
            MapScriptEvent::LeaveNorth => self.on_leave_north.as_ref(),
            MapScriptEvent::LeaveEast => self.on_leave_east.as_ref(),
            MapScriptEvent::LeaveSouth => self.on_leave_south.as_ref(),
            MapScriptEvent::LeaveWest => self.on_leave_west.as_ref(),
        }
    }

    pub fn set(&mut self, event: MapScriptEvent, script: Option<ScriptHandle>) {
        match event {
            MapScriptEvent::Enter => self.on_enter = script,
            MapScriptEvent::Leave => self.on_leave = script,
            MapScriptEvent::LeaveNorth => self.on_leave_north = script,
            MapScriptEvent::LeaveEast => self.on_leave_east = script,
            MapScriptEvent::LeaveSouth => self.on_leave_south = script,
            MapScriptEvent::LeaveWest => self.on_leave_west = script,
        }
    }
}

/// One tile cell with its live animation countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCell {
    pub index: usize,
    pub frames_left: u32,
}

/// One z-ordered tile grid within a map.
pub struct Layer {
    pub name: String,
    width: u32,
    height: u32,
    pub visible: bool,
    pub reflective: bool,
    pub parallax: bool,
    pub parallax_x: f64,
    pub parallax_y: f64,
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub(crate) cells: Vec<TileCell>,
    pub obstructions: ObstructionIndex,
    pub render_script: Option<ScriptHandle>,
}

impl Layer {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            visible: true,
            reflective: false,
            parallax: false,
            parallax_x: 1.0,
            parallax_y: 1.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
            cells: vec![
                TileCell {
                    index: 0,
                    frames_left: 0
                };
                width as usize * height as usize
            ],
            obstructions: ObstructionIndex::new(),
            render_script: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn index_of(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    pub fn tile_at(&self, x: u32, y: u32) -> Option<usize> {
        self.index_of(x, y).map(|index| self.cells[index].index)
    }

    pub fn set_tile(&mut self, x: u32, y: u32, tile: usize) -> bool {
        let Some(index) = self.index_of(x, y) else {
            return false;
        };
        self.cells[index] = TileCell {
            index: tile,
            frames_left: 0,
        };
        true
    }

    /// Resize the grid in place. Surviving cells keep their tiles; new
    /// cells are reinitialized to tile 0.
    pub fn resize(&mut self, width: u32, height: u32) {
        let mut cells = vec![
            TileCell {
                index: 0,
                frames_left: 0
            };
            width as usize * height as usize
        ];
        for y in 0..height.min(self.height) {
            for x in 0..width.min(self.width) {
                let old = y as usize * self.width as usize + x as usize;
                let new = y as usize * width as usize + x as usize;
                cells[new] = self.cells[old];
            }
        }
        self.width = width;
        self.height = height;
        self.cells = cells;
    }

    fn step_animation(&mut self, catalog: &dyn TilesetCatalog) {
        for cell in &mut self.cells {
            if catalog.delay(cell.index) == 0 {
                continue;
            }
            if cell.frames_left > 1 {
                cell.frames_left -= 1;
                continue;
            }
            cell.index = catalog.next_tile(cell.index);
            cell.frames_left = catalog.delay(cell.index);
        }
    }
}

/// Point-based, edge-activated scripted event.
pub struct Trigger {
    pub x: f64,
    pub y: f64,
    pub layer: usize,
    pub script: Option<ScriptHandle>,
}

/// Area-based, distance-interval-activated scripted event.
pub struct Zone {
    pub rect: Rect,
    pub layer: usize,
    pub interval: u32,
    pub(crate) steps_left: u32,
    pub script: Option<ScriptHandle>,
}

impl Zone {
    pub fn new(rect: Rect, layer: usize, interval: u32, script: Option<ScriptHandle>) -> Self {
        Self {
            rect,
            layer,
            interval,
            steps_left: interval,
            script,
        }
    }
}

/// Actor spawn template read from a world file; instantiated into the
/// engine roster when the map becomes active.
#[derive(Clone)]
pub struct PersonTemplate {
    pub name: String,
    pub spriteset: String,
    pub x: f64,
    pub y: f64,
    pub layer: usize,
    pub scripts: PersonScripts,
}

/// The loaded world: layers of tiles plus everything anchored to them.
pub struct Map {
    pub(crate) layers: Vec<Layer>,
    pub(crate) triggers: Vec<Trigger>,
    pub(crate) zones: Vec<Zone>,
    pub(crate) templates: Vec<PersonTemplate>,
    pub(crate) scripts: MapScripts,
    pub(crate) music: Option<String>,
    pub(crate) repeating: bool,
    pub(crate) start_x: f64,
    pub(crate) start_y: f64,
    pub(crate) start_layer: usize,
    pub(crate) start_direction: Direction,
    pub(crate) tile_width: u32,
    pub(crate) tile_height: u32,
    pub(crate) pixel_width: u32,
    pub(crate) pixel_height: u32,
}

impl Map {
    pub(crate) fn recompute_pixel_size(&mut self) {
        let mut width = 0u32;
        let mut height = 0u32;
        for layer in self.layers.iter().filter(|layer| !layer.parallax) {
            width = width.max(layer.width * self.tile_width);
            height = height.max(layer.height * self.tile_height);
        }
        self.pixel_width = width;
        self.pixel_height = height;
    }

    pub fn pixel_width(&self) -> u32 {
        self.pixel_width
    }

    pub fn pixel_height(&self) -> u32 {
        self.pixel_height
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    pub fn repeating(&self) -> bool {
        self.repeating
    }

    pub fn start_position(&self) -> (Vec2, usize) {
        (Vec2::new(self.start_x, self.start_y), self.start_layer)
    }

    pub fn start_direction(&self) -> Direction {
        self.start_direction
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Tile-sized footprint centered on a trigger's point.
    pub(crate) fn trigger_footprint(&self, trigger: &Trigger) -> Rect {
        Rect::centered_on(
            trigger.x,
            trigger.y,
            self.tile_width as f64,
            self.tile_height as f64,
        )
    }

    /// Index of the trigger whose footprint contains the given point,
    /// if any.
    pub(crate) fn trigger_at(&self, position: Vec2, layer: usize) -> Option<usize> {
        self.triggers.iter().position(|trigger| {
            trigger.layer == layer && self.trigger_footprint(trigger).contains_point(position)
        })
    }

    pub(crate) fn step_tile_animation(&mut self, catalog: &dyn TilesetCatalog) {
        for layer in &mut self.layers {
            layer.step_animation(catalog);
        }
    }

    /// Resize one layer, then clip or delete triggers and zones that no
    /// longer fall inside the map's pixel bounds.
    pub(crate) fn resize_layer(&mut self, index: usize, width: u32, height: u32) {
        if let Some(layer) = self.layers.get_mut(index) {
            layer.resize(width, height);
        }
        self.recompute_pixel_size();
        let bounds = Rect::new(0.0, 0.0, self.pixel_width as f64, self.pixel_height as f64);
        self.triggers
            .retain(|trigger| bounds.contains_point(Vec2::new(trigger.x, trigger.y)));
        self.zones.retain_mut(|zone| {
            if !zone.rect.intersects(&bounds) {
                return false;
            }
            let right = zone.rect.right().min(bounds.right());
            let bottom = zone.rect.bottom().min(bounds.bottom());
            zone.rect.x = zone.rect.x.max(0.0);
            zone.rect.y = zone.rect.y.max(0.0);
            zone.rect.width = right - zone.rect.x;
            zone.rect.height = bottom - zone.rect.y;
            true
        });
    }
}
