use crate::geometry::{Rect, Vec2};

/// One authored obstruction line segment, in layer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Segment {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// Per-layer obstruction geometry. A rectangle is obstructed when any
/// authored segment intersects it.
#[derive(Debug, Clone, Default)]
pub struct ObstructionIndex {
    segments: Vec<Segment>,
}

impl ObstructionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn rect_obstructed(&self, rect: Rect) -> bool {
        self.segments.iter().any(|segment| {
            rect.intersects_segment(
                Vec2::new(segment.x1, segment.y1),
                Vec2::new(segment.x2, segment.y2),
            )
        })
    }
}
