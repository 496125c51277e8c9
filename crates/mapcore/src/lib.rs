//! Map simulation core for a 2D tile-based engine: world-file loading,
//! the per-frame map run loop, scripted actors with command queues and
//! follower chains, trigger/zone activation, and camera projection.
//!
//! Rendering, input devices, audio playback and script compilation live
//! behind the [`host::EngineHost`] and [`host::RenderBackend`] traits;
//! this crate owns the simulation and decides what happens when.

pub mod config;
pub mod engine;
pub mod geometry;
pub mod host;
pub mod map;
pub mod obstruction;
pub mod person;
pub mod script;

#[cfg(test)]
mod testutil;

pub use config::{ConfigError, EngineConfig, DEFAULT_FRAME_RATE, DEFAULT_TALK_DISTANCE};
pub use engine::camera::{map_to_screen, screen_to_map, Camera};
pub use engine::{EngineError, EngineState, MapEngine};
pub use geometry::{Color, Rect, Vec2};
pub use host::{
    AssetError, EmbeddedTileset, EngineHost, PersonDrawCall, RenderBackend, Spriteset,
    TilesetCatalog,
};
pub use map::loader::{load_map, LoadedMap, MapLoadError};
pub use map::{Layer, Map, MapScriptEvent, MapScripts, PersonTemplate, TileCell, Trigger, Zone};
pub use obstruction::{ObstructionIndex, Segment};
pub use person::{
    Command, CommandOp, Direction, Person, PersonId, PersonScriptEvent, PersonScripts, StepHistory,
};
pub use script::{FnScript, Script, ScriptError, ScriptHandle};
