use crate::geometry::Vec2;
use crate::map::{Layer, Map};

/// Free-floating camera position in map pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Camera {
    pub x: f64,
    pub y: f64,
}

impl Camera {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Pixel offset subtracted from layer coordinates to reach screen
/// coordinates, for one layer at one frame.
///
/// Non-repeating maps clamp the offset to the map bounds, pinning it
/// to zero on any axis where the map is smaller than the viewport
/// (top-left justified). Parallax layers scroll at a fraction of
/// camera speed plus a continuous autoscroll term, and wrap modulo
/// their own pixel span; repeating maps wrap modulo the map span.
pub(crate) fn layer_offset(
    map: &Map,
    layer: &Layer,
    camera: Camera,
    viewport: (u32, u32),
    frames_elapsed: u64,
) -> Vec2 {
    let x = axis_offset(
        camera.x,
        viewport.0 as f64,
        map.pixel_width() as f64,
        map.repeating(),
        layer.parallax,
        layer.parallax_x,
        layer.scroll_x,
        (layer.width() * map.tile_width()) as f64,
        frames_elapsed,
    );
    let y = axis_offset(
        camera.y,
        viewport.1 as f64,
        map.pixel_height() as f64,
        map.repeating(),
        layer.parallax,
        layer.parallax_y,
        layer.scroll_y,
        (layer.height() * map.tile_height()) as f64,
        frames_elapsed,
    );
    Vec2::new(x, y)
}

#[allow(clippy::too_many_arguments)]
fn axis_offset(
    camera: f64,
    viewport: f64,
    map_span: f64,
    repeating: bool,
    parallax: bool,
    parallax_factor: f64,
    autoscroll: f64,
    layer_span: f64,
    frames_elapsed: u64,
) -> f64 {
    let mut offset = camera - viewport / 2.0;
    if parallax {
        offset += camera * (parallax_factor - 1.0) + autoscroll * frames_elapsed as f64;
        if layer_span > 0.0 {
            offset = offset.rem_euclid(layer_span);
        }
        return offset;
    }
    if repeating {
        if map_span > 0.0 {
            offset = offset.rem_euclid(map_span);
        }
        return offset;
    }
    let max_offset = map_span - viewport;
    if max_offset <= 0.0 {
        0.0
    } else {
        offset.clamp(0.0, max_offset)
    }
}

/// Project a layer-space position onto the screen.
pub fn map_to_screen(
    map: &Map,
    layer: &Layer,
    camera: Camera,
    viewport: (u32, u32),
    frames_elapsed: u64,
    position: Vec2,
) -> (i32, i32) {
    let offset = layer_offset(map, layer, camera, viewport, frames_elapsed);
    (
        (position.x - offset.x).floor() as i32,
        (position.y - offset.y).floor() as i32,
    )
}

/// Inverse of `map_to_screen` for picking into a layer.
pub fn screen_to_map(
    map: &Map,
    layer: &Layer,
    camera: Camera,
    viewport: (u32, u32),
    frames_elapsed: u64,
    screen_x: i32,
    screen_y: i32,
) -> Vec2 {
    let offset = layer_offset(map, layer, camera, viewport, frames_elapsed);
    Vec2::new(screen_x as f64 + offset.x, screen_y as f64 + offset.y)
}
