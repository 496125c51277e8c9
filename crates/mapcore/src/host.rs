use std::rc::Rc;

use thiserror::Error;

use crate::geometry::{Color, Rect};
use crate::script::ScriptHandle;

/// Failure reported by an external collaborator (asset loading, script
/// compilation, audio).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AssetError {
    pub message: String,
}

impl AssetError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Tile catalog contract. Maps a tile index to its animation chain and
/// per-tile obstruction geometry; shared animation state advances once
/// per frame through `update`.
pub trait TilesetCatalog {
    fn tile_width(&self) -> u32;
    fn tile_height(&self) -> u32;
    fn tile_count(&self) -> usize;

    /// Animation delay in frames for a tile; 0 means not animated.
    fn delay(&self, tile: usize) -> u32;

    /// Next tile in the animation chain.
    fn next_tile(&self, tile: usize) -> usize;

    /// Whether `rect`, expressed in tile-local pixels, intersects the
    /// tile's own obstruction geometry.
    fn tile_obstructed(&self, tile: usize, rect: Rect) -> bool;

    fn update(&mut self) {}
}

/// Sprite sheet contract for persons. Pose names select an animation
/// strip; the base rectangle is the obstruction footprint relative to
/// the sprite origin.
pub trait Spriteset {
    fn base(&self) -> Rect;
    fn default_pose(&self) -> &str;
    fn pose_frames(&self, pose: &str) -> usize;
    fn frame_delay(&self, pose: &str, frame: usize) -> u32;
}

/// Result of parsing a tileset embedded directly in a world file.
pub struct EmbeddedTileset {
    pub tileset: Box<dyn TilesetCatalog>,
    pub bytes_consumed: usize,
}

/// The engine's view of everything it does not own: asset loading,
/// script compilation, background music.
pub trait EngineHost {
    fn load_tileset(&mut self, filename: &str) -> Result<Box<dyn TilesetCatalog>, AssetError>;

    /// Parse a tileset embedded at the tail of a world file. Returns
    /// the catalog plus how many input bytes it consumed.
    fn load_embedded_tileset(&mut self, bytes: &[u8]) -> Result<EmbeddedTileset, AssetError>;

    fn load_spriteset(&mut self, filename: &str) -> Result<Rc<dyn Spriteset>, AssetError>;

    /// Compile script source text into an invokable handle. `origin` is
    /// a diagnostic label naming where the source came from.
    fn compile_script(&mut self, source: &str, origin: &str) -> Result<ScriptHandle, AssetError>;

    fn play_music(&mut self, filename: &str) -> Result<(), AssetError>;
    fn stop_music(&mut self);
}

/// One person draw request handed to the render backend.
pub struct PersonDrawCall<'a> {
    pub name: &'a str,
    pub sprite: &'a dyn Spriteset,
    pub pose: &'a str,
    pub frame: usize,
    pub x: i32,
    pub y: i32,
    pub flipped: bool,
    pub scale_x: f64,
    pub scale_y: f64,
    pub rotation: f64,
    pub mask: Color,
}

/// Rendering backend contract. The core decides what to draw and where;
/// pixel output is the backend's business.
pub trait RenderBackend {
    fn draw_tile(&mut self, tile: usize, x: i32, y: i32);
    fn draw_person(&mut self, call: &PersonDrawCall<'_>);
    fn apply_color_mask(&mut self, color: Color);
}
