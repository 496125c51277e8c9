use std::collections::VecDeque;
use std::rc::Rc;

use crate::geometry::{Color, Rect, Vec2};
use crate::host::Spriteset;
use crate::script::ScriptHandle;

/// Stable identity for a person. Ids increase monotonically and are
/// never reused, so a held id stays valid as a liveness check even
/// after the roster has been mutated by a script callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersonId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    Northeast,
    East,
    Southeast,
    South,
    Southwest,
    West,
    Northwest,
}

impl Direction {
    pub fn delta(self) -> (f64, f64) {
        match self {
            Self::North => (0.0, -1.0),
            Self::Northeast => (1.0, -1.0),
            Self::East => (1.0, 0.0),
            Self::Southeast => (1.0, 1.0),
            Self::South => (0.0, 1.0),
            Self::Southwest => (-1.0, 1.0),
            Self::West => (-1.0, 0.0),
            Self::Northwest => (-1.0, -1.0),
        }
    }

    pub fn pose_name(self) -> &'static str {
        match self {
            Self::North => "north",
            Self::Northeast => "northeast",
            Self::East => "east",
            Self::Southeast => "southeast",
            Self::South => "south",
            Self::Southwest => "southwest",
            Self::West => "west",
            Self::Northwest => "northwest",
        }
    }

    pub(crate) fn from_index(index: i8) -> Option<Self> {
        match index {
            0 => Some(Self::North),
            1 => Some(Self::Northeast),
            2 => Some(Self::East),
            3 => Some(Self::Southeast),
            4 => Some(Self::South),
            5 => Some(Self::Southwest),
            6 => Some(Self::West),
            7 => Some(Self::Northwest),
            _ => None,
        }
    }

    /// Facing that best matches a movement delta. Returns `None` for a
    /// zero delta.
    pub fn from_delta(dx: f64, dy: f64) -> Option<Self> {
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        let horizontal = if dx < 0.0 {
            Some(false)
        } else if dx > 0.0 {
            Some(true)
        } else {
            None
        };
        let vertical = if dy < 0.0 {
            Some(false)
        } else if dy > 0.0 {
            Some(true)
        } else {
            None
        };
        Some(match (horizontal, vertical) {
            (None, Some(false)) => Self::North,
            (None, Some(true)) => Self::South,
            (Some(true), None) => Self::East,
            (Some(false), None) => Self::West,
            (Some(true), Some(false)) => Self::Northeast,
            (Some(true), Some(true)) => Self::Southeast,
            (Some(false), Some(false)) => Self::Northwest,
            (Some(false), Some(true)) => Self::Southwest,
            (None, None) => unreachable!("zero delta handled above"),
        })
    }
}

#[derive(Clone)]
pub enum CommandOp {
    Wait,
    Animate,
    Face(Direction),
    Move(Direction),
    Run(ScriptHandle),
}

/// One queued command. Non-immediate commands stop the per-frame queue
/// drain after executing; immediate commands let it continue.
#[derive(Clone)]
pub struct Command {
    pub op: CommandOp,
    pub immediate: bool,
}

impl Command {
    pub fn new(op: CommandOp, immediate: bool) -> Self {
        Self { op, immediate }
    }
}

/// Bounded ring of positions a person has vacated, most recent first.
/// Sized to the largest follow distance among the person's followers.
#[derive(Debug, Clone)]
pub struct StepHistory {
    samples: VecDeque<Vec2>,
}

impl StepHistory {
    pub fn new(origin: Vec2, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut samples = VecDeque::with_capacity(capacity);
        samples.resize(capacity, origin);
        Self { samples }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Record the position being vacated by a committed move.
    pub fn record(&mut self, vacated: Vec2) {
        self.samples.pop_back();
        self.samples.push_front(vacated);
    }

    /// Sample `steps_back` entries into the past; 0 is the most
    /// recently vacated position.
    pub fn sample(&self, steps_back: usize) -> Vec2 {
        let index = steps_back.min(self.samples.len().saturating_sub(1));
        self.samples[index]
    }

    /// Enlarge the ring, back-filling new slots with the oldest known
    /// sample so a longer leash never snaps to the origin.
    pub fn grow_to(&mut self, capacity: usize) {
        let oldest = self.samples.back().copied().unwrap_or_default();
        while self.samples.len() < capacity {
            self.samples.push_back(oldest);
        }
    }
}

/// Externally supplied behavior hooks for one person.
#[derive(Clone, Default)]
pub struct PersonScripts {
    pub on_create: Option<ScriptHandle>,
    pub on_destroy: Option<ScriptHandle>,
    pub on_touch: Option<ScriptHandle>,
    pub on_talk: Option<ScriptHandle>,
    pub on_generate_commands: Option<ScriptHandle>,
}

/// Script event slots on a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonScriptEvent {
    Create,
    Destroy,
    Touch,
    Talk,
    GenerateCommands,
}

pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub layer: usize,
    pub direction: Direction,
    pub pose: String,
    pub sprite: Rc<dyn Spriteset>,
    pub frame: usize,
    pub(crate) frame_delay_left: u32,
    pub scale_x: f64,
    pub scale_y: f64,
    pub rotation: f64,
    pub mask: Color,
    pub speed_x: f64,
    pub speed_y: f64,
    pub visible: bool,
    pub ignore_persons: bool,
    pub ignore_tiles: bool,
    pub ignored_names: Vec<String>,
    pub leader: Option<PersonId>,
    pub follow_distance: usize,
    pub persistent: bool,
    pub(crate) doomed: bool,
    pub(crate) history: StepHistory,
    pub(crate) commands: VecDeque<Command>,
    pub(crate) scripts: PersonScripts,
}

impl Person {
    pub(crate) fn new(
        id: PersonId,
        name: String,
        sprite: Rc<dyn Spriteset>,
        x: f64,
        y: f64,
        layer: usize,
        persistent: bool,
    ) -> Self {
        let pose = sprite.default_pose().to_string();
        Self {
            id,
            name,
            x,
            y,
            layer,
            direction: Direction::South,
            pose,
            sprite,
            frame: 0,
            frame_delay_left: 0,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            mask: Color::WHITE,
            speed_x: 1.0,
            speed_y: 1.0,
            visible: true,
            ignore_persons: false,
            ignore_tiles: false,
            ignored_names: Vec::new(),
            leader: None,
            follow_distance: 0,
            persistent,
            doomed: false,
            history: StepHistory::new(Vec2::new(x, y), 1),
            commands: VecDeque::new(),
            scripts: PersonScripts::default(),
        }
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    /// Obstruction footprint at an arbitrary candidate position, in
    /// layer pixel coordinates.
    pub fn base_rect_at(&self, x: f64, y: f64) -> Rect {
        let base = self.sprite.base();
        Rect::centered_on(x, y, base.width, base.height)
    }

    pub fn base_rect(&self) -> Rect {
        self.base_rect_at(self.x, self.y)
    }

    pub fn face(&mut self, direction: Direction) {
        if self.direction != direction {
            self.frame = 0;
            self.frame_delay_left = 0;
        }
        self.direction = direction;
        self.pose = direction.pose_name().to_string();
    }

    /// Advance the pose animation by one tick.
    pub fn animate(&mut self) {
        if self.frame_delay_left > 0 {
            self.frame_delay_left -= 1;
            return;
        }
        let frames = self.sprite.pose_frames(&self.pose).max(1);
        self.frame = (self.frame + 1) % frames;
        self.frame_delay_left = self.sprite.frame_delay(&self.pose, self.frame);
    }

    pub fn queue_command(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn commands_left(&self) -> usize {
        self.commands.len()
    }

    pub fn script(&self, event: PersonScriptEvent) -> Option<&ScriptHandle> {
        match event {
            PersonScriptEvent::Create => self.scripts.on_create.as_ref(),
            PersonScriptEvent::Destroy => self.scripts.on_destroy.as_ref(),
            PersonScriptEvent::Touch => self.scripts.on_touch.as_ref(),
            PersonScriptEvent::Talk => self.scripts.on_talk.as_ref(),
            PersonScriptEvent::GenerateCommands => self.scripts.on_generate_commands.as_ref(),
        }
    }

    pub fn set_script(&mut self, event: PersonScriptEvent, script: Option<ScriptHandle>) {
        match event {
            PersonScriptEvent::Create => self.scripts.on_create = script,
            PersonScriptEvent::Destroy => self.scripts.on_destroy = script,
            PersonScriptEvent::Touch => self.scripts.on_touch = script,
            PersonScriptEvent::Talk => self.scripts.on_talk = script,
            PersonScriptEvent::GenerateCommands => self.scripts.on_generate_commands = script,
        }
    }

    /// Commit a move: remember the vacated position, then relocate.
    pub(crate) fn commit_move(&mut self, x: f64, y: f64) {
        self.history.record(self.position());
        self.x = x;
        self.y = y;
    }
}
