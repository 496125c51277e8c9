pub mod camera;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::engine::camera::Camera;
use crate::geometry::{Color, Vec2};
use crate::host::{AssetError, EngineHost, PersonDrawCall, RenderBackend, TilesetCatalog};
use crate::map::loader::{load_map, LoadedMap, MapLoadError};
use crate::map::{Layer, Map, MapScriptEvent, PersonTemplate};
use crate::person::{
    Command, CommandOp, Direction, Person, PersonId, PersonScriptEvent, StepHistory,
};
use crate::script::{ScriptError, ScriptHandle};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("map engine is not running")]
    NotRunning,
    #[error("map engine is already running")]
    AlreadyRunning,
    #[error("frame rate must be positive")]
    InvalidFrameRate,
    #[error("no person named '{name}'")]
    UnknownPerson { name: String },
    #[error("a person named '{name}' already exists")]
    DuplicatePersonName { name: String },
    #[error("'{follower}' cannot follow '{leader}': would create a cycle")]
    FollowCycle { follower: String, leader: String },
    #[error("follow distance {distance} is not positive")]
    InvalidFollowDistance { distance: usize },
    #[error("layer {layer} out of range ({layer_count} layers)")]
    InvalidLayer { layer: usize, layer_count: usize },
    #[error("trigger index {index} out of range")]
    UnknownTrigger { index: usize },
    #[error("zone index {index} out of range")]
    UnknownZone { index: usize },
    #[error("zone interval must be positive")]
    InvalidZoneInterval,
    #[error("player index {player} is not attached")]
    InvalidPlayer { player: usize },
    #[error(transparent)]
    Load(#[from] MapLoadError),
    #[error("collaborator failure: {0}")]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapEdge {
    North,
    East,
    South,
    West,
}

impl MapEdge {
    fn script_event(self) -> MapScriptEvent {
        match self {
            Self::North => MapScriptEvent::LeaveNorth,
            Self::East => MapScriptEvent::LeaveEast,
            Self::South => MapScriptEvent::LeaveSouth,
            Self::West => MapScriptEvent::LeaveWest,
        }
    }
}

enum Blocker {
    Person(PersonId),
    Terrain,
}

struct FadeState {
    target: Color,
    frames_left: u32,
}

struct DeferredScript {
    script: ScriptHandle,
    frames_left: u32,
}

/// Per-player input attachment state. Trigger activation is edge
/// detected against the previous frame's occupied trigger; zone
/// counters are fed by the pixel delta since the previous frame.
struct PlayerBinding {
    person: PersonId,
    last_trigger: Option<usize>,
    last_position: Option<Vec2>,
}

const DEFAULT_VIEWPORT: (u32, u32) = (320, 240);

/// The map simulation core: owns the active map, the actor roster, the
/// camera and all per-frame scheduling. There are no process-wide
/// singletons; every operation goes through one engine value.
///
/// Script callbacks receive `&mut MapEngine` and may mutate the roster
/// reentrantly, so internal traversal always snapshots ids and
/// re-validates liveness before touching a person.
pub struct MapEngine {
    host: Box<dyn EngineHost>,
    config: EngineConfig,
    state: EngineState,
    exit_requested: bool,
    map: Option<Map>,
    tileset: Option<Box<dyn TilesetCatalog>>,
    map_path: Option<PathBuf>,
    roster: Vec<Person>,
    next_person_id: u64,
    players: Vec<PlayerBinding>,
    camera: Camera,
    camera_subject: Option<PersonId>,
    viewport: (u32, u32),
    frame_rate: u32,
    frames_elapsed: u64,
    mask: [f64; 4],
    fade: Option<FadeState>,
    deferred: Vec<DeferredScript>,
    update_script: Option<ScriptHandle>,
    render_script: Option<ScriptHandle>,
    current_person: Option<PersonId>,
    edge_fired: Option<MapEdge>,
}

impl MapEngine {
    pub fn new(host: Box<dyn EngineHost>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            host,
            config,
            state: EngineState::Idle,
            exit_requested: false,
            map: None,
            tileset: None,
            map_path: None,
            roster: Vec::new(),
            next_person_id: 0,
            players: Vec::new(),
            camera: Camera::default(),
            camera_subject: None,
            viewport: DEFAULT_VIEWPORT,
            frame_rate: 0,
            frames_elapsed: 0,
            mask: [0.0; 4],
            fade: None,
            deferred: Vec::new(),
            update_script: None,
            render_script: None,
            current_person: None,
            edge_fired: None,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn map(&self) -> Option<&Map> {
        self.map.as_ref()
    }

    /// Path the active map was loaded from, when it came from disk.
    pub fn map_path(&self) -> Option<&Path> {
        self.map_path.as_deref()
    }

    pub fn frames_elapsed(&self) -> u64 {
        self.frames_elapsed
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
    }

    /// Person the currently-running script callback belongs to, if any.
    pub fn current_person(&self) -> Option<PersonId> {
        self.current_person
    }

    // ---- lifecycle ------------------------------------------------

    pub fn start_map(&mut self, path: &Path, frame_rate: u32) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        let loaded = load_map(path, self.host.as_mut())?;
        self.start_loaded(loaded, frame_rate)?;
        self.map_path = Some(path.to_path_buf());
        Ok(())
    }

    /// Enter the running state with an already-parsed world.
    pub fn start_loaded(&mut self, loaded: LoadedMap, frame_rate: u32) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        if frame_rate == 0 {
            return Err(EngineError::InvalidFrameRate);
        }
        self.frame_rate = frame_rate;
        self.frames_elapsed = 0;
        self.state = EngineState::Running;
        self.exit_requested = false;
        self.install_map(loaded)?;
        info!(frame_rate, "map_engine_started");
        Ok(())
    }

    /// Swap the active map. A load failure leaves the engine in its
    /// prior state; the caller should treat it as fatal to the session
    /// rather than retry.
    pub fn change_map(&mut self, path: &Path) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let loaded = load_map(path, self.host.as_mut())?;
        self.change_loaded(loaded)?;
        self.map_path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn change_loaded(&mut self, loaded: LoadedMap) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let leave = self
            .map
            .as_ref()
            .and_then(|map| map.scripts.on_leave.clone());
        if let Some(script) = leave {
            self.run_script(&script, None)?;
        }
        self.host.stop_music();
        self.destroy_non_persistent()?;
        self.install_map(loaded)?;
        info!("map_changed");
        Ok(())
    }

    /// Ask the engine to stop. Polled once per frame at the top of
    /// `update`; there is no mid-frame cancellation.
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    fn install_map(&mut self, loaded: LoadedMap) -> Result<(), EngineError> {
        let LoadedMap { map, tileset } = loaded;
        self.edge_fired = None;
        for binding in &mut self.players {
            binding.last_trigger = None;
            binding.last_position = None;
        }
        self.camera = Camera::new(map.start_x, map.start_y);
        let music = map.music.clone();
        let enter = map.scripts.on_enter.clone();
        let spawns: Vec<PersonTemplate> = map.templates.iter().map(PersonTemplate::clone).collect();
        self.map = Some(map);
        self.tileset = Some(tileset);
        for template in &spawns {
            self.spawn_from_template(template)?;
        }
        if let Some(filename) = music {
            self.host.play_music(&filename)?;
        }
        if let Some(script) = enter {
            self.run_script(&script, None)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        info!("map_engine_exited");
        let result = self.destroy_non_persistent();
        self.host.stop_music();
        self.map = None;
        self.tileset = None;
        self.map_path = None;
        self.deferred.clear();
        self.camera_subject = None;
        self.state = EngineState::Idle;
        self.exit_requested = false;
        result
    }

    /// Destroy every non-persistent person, running destroy hooks. All
    /// hooks run even if one fails; the first failure is reported.
    fn destroy_non_persistent(&mut self) -> Result<(), EngineError> {
        let ids: Vec<PersonId> = self
            .roster
            .iter()
            .filter(|person| !person.persistent)
            .map(|person| person.id)
            .collect();
        let mut first_error = None;
        for id in ids {
            if let Err(error) = self.destroy_person_by_id(id) {
                warn!(error = %error, "destroy_hook_failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    // ---- per-frame update -----------------------------------------

    pub fn update(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        if self.exit_requested {
            return self.shutdown();
        }

        self.step_fade();
        if let Some(tileset) = self.tileset.as_mut() {
            tileset.update();
        }
        if let (Some(map), Some(tileset)) = (self.map.as_mut(), self.tileset.as_deref()) {
            map.step_tile_animation(tileset);
        }

        // Leaders update first; followers advance recursively inside
        // their leader's update so a chain moves as one step.
        let leaderless: Vec<PersonId> = self
            .roster
            .iter()
            .filter(|person| person.leader.is_none())
            .map(|person| person.id)
            .collect();
        for id in leaderless {
            if self.is_live(id) {
                self.update_person(id)?;
            }
        }

        self.sort_roster();

        if let Some(subject) = self.camera_subject {
            match self.find_person(subject).map(Person::position) {
                Some(position) => self.camera = Camera::new(position.x, position.y),
                None => self.camera_subject = None,
            }
        }

        self.update_edges()?;
        self.update_players()?;
        self.update_deferred()?;

        if let Some(script) = self.update_script.clone() {
            self.run_script(&script, None)?;
        }

        self.frames_elapsed += 1;
        Ok(())
    }

    fn step_fade(&mut self) {
        let Some(fade) = self.fade.as_mut() else {
            return;
        };
        let target = [
            fade.target.red as f64,
            fade.target.green as f64,
            fade.target.blue as f64,
            fade.target.alpha as f64,
        ];
        let frames = fade.frames_left as f64;
        for (channel, goal) in self.mask.iter_mut().zip(target) {
            *channel += (goal - *channel) / frames;
        }
        fade.frames_left -= 1;
        if fade.frames_left == 0 {
            self.mask = target;
            self.fade = None;
        }
    }

    fn update_person(&mut self, id: PersonId) -> Result<(), EngineError> {
        let generator = match self.find_person(id) {
            Some(person) if person.commands.is_empty() => {
                person.scripts.on_generate_commands.clone()
            }
            Some(_) => None,
            None => return Ok(()),
        };
        if let Some(script) = generator {
            self.run_script(&script, Some(id))?;
        }

        loop {
            let command = match self.find_person_mut(id) {
                Some(person) => person.commands.pop_front(),
                None => None,
            };
            let Some(command) = command else {
                break;
            };
            let immediate = command.immediate;
            self.execute_command(id, command)?;
            if !immediate {
                break;
            }
        }

        self.update_followers(id)
    }

    fn execute_command(&mut self, id: PersonId, command: Command) -> Result<(), EngineError> {
        match command.op {
            CommandOp::Wait => {}
            CommandOp::Animate => {
                if let Some(person) = self.find_person_mut(id) {
                    person.animate();
                }
            }
            CommandOp::Face(direction) => {
                if let Some(person) = self.find_person_mut(id) {
                    person.face(direction);
                }
            }
            CommandOp::Move(direction) => self.attempt_move(id, direction)?,
            CommandOp::Run(script) => self.run_script(&script, Some(id))?,
        }
        Ok(())
    }

    fn attempt_move(&mut self, id: PersonId, direction: Direction) -> Result<(), EngineError> {
        let Some(person) = self.find_person(id) else {
            return Ok(());
        };
        let (dx, dy) = direction.delta();
        let next_x = person.x + dx * person.speed_x;
        let next_y = person.y + dy * person.speed_y;
        match self.obstruction_at(id, next_x, next_y) {
            None => {
                if let Some(person) = self.find_person_mut(id) {
                    person.commit_move(next_x, next_y);
                }
            }
            Some(Blocker::Person(other)) => {
                // A blocked move against a person fires their touch
                // hook instead of committing.
                let touch = self
                    .find_person(other)
                    .and_then(|person| person.scripts.on_touch.clone());
                if let Some(script) = touch {
                    self.run_script(&script, Some(other))?;
                }
            }
            Some(Blocker::Terrain) => {}
        }
        Ok(())
    }

    fn obstruction_at(&self, id: PersonId, x: f64, y: f64) -> Option<Blocker> {
        let person = self.find_person(id)?;
        let rect = person.base_rect_at(x, y);

        if !person.ignore_persons {
            for other in &self.roster {
                if other.id == id || other.doomed || other.layer != person.layer {
                    continue;
                }
                if person.ignored_names.iter().any(|name| name == &other.name) {
                    continue;
                }
                if rect.intersects(&other.base_rect()) {
                    return Some(Blocker::Person(other.id));
                }
            }
        }

        if !person.ignore_tiles {
            let (map, tileset) = (self.map.as_ref()?, self.tileset.as_deref()?);
            let layer = map.layer(person.layer)?;
            if layer.obstructions.rect_obstructed(rect) {
                return Some(Blocker::Terrain);
            }
            let tile_w = map.tile_width() as f64;
            let tile_h = map.tile_height() as f64;
            if tile_w > 0.0 && tile_h > 0.0 {
                let first_tx = (rect.x / tile_w).floor() as i64;
                let last_tx = (rect.right() / tile_w).floor() as i64;
                let first_ty = (rect.y / tile_h).floor() as i64;
                let last_ty = (rect.bottom() / tile_h).floor() as i64;
                for tile_y in first_ty..=last_ty {
                    for tile_x in first_tx..=last_tx {
                        if tile_x < 0 || tile_y < 0 {
                            continue;
                        }
                        let Some(tile) = layer.tile_at(tile_x as u32, tile_y as u32) else {
                            continue;
                        };
                        let local =
                            rect.translated(-(tile_x as f64 * tile_w), -(tile_y as f64 * tile_h));
                        if tileset.tile_obstructed(tile, local) {
                            return Some(Blocker::Terrain);
                        }
                    }
                }
            }
        }

        None
    }

    fn update_followers(&mut self, leader_id: PersonId) -> Result<(), EngineError> {
        let follower_ids: Vec<PersonId> = self
            .roster
            .iter()
            .filter(|person| person.leader == Some(leader_id) && !person.doomed)
            .map(|person| person.id)
            .collect();
        for follower_id in follower_ids {
            let target = {
                let Some(leader) = self.find_person(leader_id) else {
                    break;
                };
                let Some(follower) = self.find_person(follower_id) else {
                    continue;
                };
                leader
                    .history
                    .sample(follower.follow_distance.saturating_sub(1))
            };
            if let Some(follower) = self.find_person_mut(follower_id) {
                if follower.position() != target {
                    if let Some(direction) =
                        Direction::from_delta(target.x - follower.x, target.y - follower.y)
                    {
                        follower.face(direction);
                    }
                    // Followers land exactly on the leader's history
                    // sample; obstruction does not apply to trailing.
                    follower.commit_move(target.x, target.y);
                    follower.animate();
                }
            }
            self.update_followers(follower_id)?;
        }
        Ok(())
    }

    /// Back-to-front draw order: ascending vertical position with the
    /// rule that a leader sorts immediately before its followers, and
    /// ids break remaining ties.
    fn sort_roster(&mut self) {
        #[derive(PartialEq)]
        struct SortKey {
            root_y: f64,
            root_id: u64,
            depth: u32,
            y: f64,
            id: u64,
        }

        fn compare(a: &SortKey, b: &SortKey) -> std::cmp::Ordering {
            a.root_y
                .total_cmp(&b.root_y)
                .then(a.root_id.cmp(&b.root_id))
                .then(a.depth.cmp(&b.depth))
                .then(a.y.total_cmp(&b.y))
                .then(a.id.cmp(&b.id))
        }

        let index_by_id: HashMap<PersonId, usize> = self
            .roster
            .iter()
            .enumerate()
            .map(|(index, person)| (person.id, index))
            .collect();

        let mut keys = Vec::with_capacity(self.roster.len());
        for person in &self.roster {
            let mut depth = 0u32;
            let mut root = person.id;
            let mut cursor = person.leader;
            let mut guard = self.roster.len();
            while let Some(leader_id) = cursor {
                if guard == 0 {
                    break;
                }
                guard -= 1;
                let Some(&leader_index) = index_by_id.get(&leader_id) else {
                    break;
                };
                depth += 1;
                root = leader_id;
                cursor = self.roster[leader_index].leader;
            }
            let root_person = index_by_id
                .get(&root)
                .map(|&index| &self.roster[index])
                .unwrap_or(person);
            keys.push(SortKey {
                root_y: root_person.base_rect().bottom(),
                root_id: root.0,
                depth,
                y: person.base_rect().bottom(),
                id: person.id.0,
            });
        }

        let mut order: Vec<usize> = (0..self.roster.len()).collect();
        order.sort_by(|&a, &b| compare(&keys[a], &keys[b]));
        let mut slots: Vec<Option<Person>> =
            std::mem::take(&mut self.roster).into_iter().map(Some).collect();
        self.roster = order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect();
    }

    fn update_edges(&mut self) -> Result<(), EngineError> {
        let (edge, script) = {
            let Some(map) = self.map.as_ref() else {
                return Ok(());
            };
            if map.repeating() {
                return Ok(());
            }
            let width = map.pixel_width() as f64;
            let height = map.pixel_height() as f64;
            let edge = if self.camera.y < 0.0 {
                Some(MapEdge::North)
            } else if self.camera.x > width {
                Some(MapEdge::East)
            } else if self.camera.y > height {
                Some(MapEdge::South)
            } else if self.camera.x < 0.0 {
                Some(MapEdge::West)
            } else {
                None
            };
            let script = edge.and_then(|edge| map.scripts.get(edge.script_event()).cloned());
            (edge, script)
        };
        match edge {
            None => self.edge_fired = None,
            Some(edge) => {
                if self.edge_fired != Some(edge) {
                    self.edge_fired = Some(edge);
                    if let Some(script) = script {
                        self.run_script(&script, None)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn update_players(&mut self) -> Result<(), EngineError> {
        let player_ids: Vec<PersonId> = self.players.iter().map(|binding| binding.person).collect();
        for person_id in player_ids {
            if !self.is_live(person_id) {
                continue;
            }
            self.update_player_triggers(person_id)?;
            self.update_player_zones(person_id)?;
            let position = self.find_person(person_id).map(Person::position);
            if let Some(binding) = self
                .players
                .iter_mut()
                .find(|binding| binding.person == person_id)
            {
                binding.last_position = position;
            }
        }
        Ok(())
    }

    fn update_player_triggers(&mut self, person_id: PersonId) -> Result<(), EngineError> {
        let (current, script) = {
            let Some(map) = self.map.as_ref() else {
                return Ok(());
            };
            let Some(person) = self.find_person(person_id) else {
                return Ok(());
            };
            let current = map.trigger_at(person.position(), person.layer);
            let script = current.and_then(|index| map.triggers[index].script.clone());
            (current, script)
        };
        let previous = self
            .players
            .iter()
            .find(|binding| binding.person == person_id)
            .and_then(|binding| binding.last_trigger);
        if current == previous {
            return Ok(());
        }
        if let Some(binding) = self
            .players
            .iter_mut()
            .find(|binding| binding.person == person_id)
        {
            binding.last_trigger = current;
        }
        // Edge-activated: fires on entry only, never while standing
        // still inside the footprint.
        if current.is_some() {
            if let Some(script) = script {
                self.run_script(&script, Some(person_id))?;
            }
        }
        Ok(())
    }

    fn update_player_zones(&mut self, person_id: PersonId) -> Result<(), EngineError> {
        let (position, layer, last_position) = {
            let Some(person) = self.find_person(person_id) else {
                return Ok(());
            };
            let Some(binding) = self
                .players
                .iter()
                .find(|binding| binding.person == person_id)
            else {
                return Ok(());
            };
            (person.position(), person.layer, binding.last_position)
        };
        let Some(last) = last_position else {
            return Ok(());
        };
        // Truncating cast is deliberate: sub-pixel movement never
        // advances a zone counter.
        let pixels = (position.x - last.x).abs().max((position.y - last.y).abs()) as u64;
        if pixels == 0 {
            return Ok(());
        }

        let zone_count = self.map.as_ref().map(|map| map.zones.len()).unwrap_or(0);
        for zone_index in 0..zone_count {
            let mut fires = 0u32;
            let script;
            {
                let Some(map) = self.map.as_mut() else {
                    return Ok(());
                };
                let Some(zone) = map.zones.get_mut(zone_index) else {
                    continue;
                };
                if zone.layer != layer || !zone.rect.contains_point(position) {
                    continue;
                }
                let mut remaining = pixels;
                while remaining >= zone.steps_left as u64 {
                    remaining -= zone.steps_left as u64;
                    fires += 1;
                    zone.steps_left = zone.interval;
                }
                zone.steps_left -= remaining as u32;
                script = zone.script.clone();
            }
            if let Some(script) = script {
                for _ in 0..fires {
                    self.run_script(&script, Some(person_id))?;
                }
            }
        }
        Ok(())
    }

    fn update_deferred(&mut self) -> Result<(), EngineError> {
        let mut due = Vec::new();
        let mut keep = Vec::new();
        for entry in self.deferred.drain(..) {
            if entry.frames_left <= 1 {
                due.push(entry.script);
            } else {
                keep.push(DeferredScript {
                    script: entry.script,
                    frames_left: entry.frames_left - 1,
                });
            }
        }
        self.deferred = keep;
        for script in due {
            self.run_script(&script, None)?;
        }
        Ok(())
    }

    // ---- rendering ------------------------------------------------

    pub fn render(&mut self, backend: &mut dyn RenderBackend) -> Result<(), EngineError> {
        if self.state != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        let layer_count = self.map.as_ref().map(|map| map.layers().len()).unwrap_or(0);
        for layer_index in 0..layer_count {
            let script = {
                let Some(map) = self.map.as_ref() else {
                    break;
                };
                let Some(layer) = map.layer(layer_index) else {
                    continue;
                };
                // Hidden layers skip their render hook along with
                // their tiles.
                if !layer.visible {
                    continue;
                }
                self.draw_layer(map, layer_index, layer, backend);
                layer.render_script.clone()
            };
            if let Some(script) = script {
                self.run_script(&script, None)?;
            }
        }
        if let Some(script) = self.render_script.clone() {
            self.run_script(&script, None)?;
        }
        let mask = self.color_mask();
        if mask.alpha > 0 {
            backend.apply_color_mask(mask);
        }
        Ok(())
    }

    fn draw_layer(
        &self,
        map: &Map,
        layer_index: usize,
        layer: &Layer,
        backend: &mut dyn RenderBackend,
    ) {
        let tile_w = map.tile_width() as i64;
        let tile_h = map.tile_height() as i64;
        if tile_w == 0 || tile_h == 0 {
            return;
        }
        let offset = camera::layer_offset(map, layer, self.camera, self.viewport, self.frames_elapsed);
        let wraps = layer.parallax || map.repeating();

        let first_tx = (offset.x / tile_w as f64).floor() as i64;
        let last_tx = ((offset.x + self.viewport.0 as f64) / tile_w as f64).floor() as i64;
        let first_ty = (offset.y / tile_h as f64).floor() as i64;
        let last_ty = ((offset.y + self.viewport.1 as f64) / tile_h as f64).floor() as i64;
        for tile_y in first_ty..=last_ty {
            for tile_x in first_tx..=last_tx {
                let (map_x, map_y) = if wraps {
                    (
                        tile_x.rem_euclid(layer.width() as i64),
                        tile_y.rem_euclid(layer.height() as i64),
                    )
                } else {
                    if tile_x < 0
                        || tile_y < 0
                        || tile_x >= layer.width() as i64
                        || tile_y >= layer.height() as i64
                    {
                        continue;
                    }
                    (tile_x, tile_y)
                };
                let Some(tile) = layer.tile_at(map_x as u32, map_y as u32) else {
                    continue;
                };
                let screen_x = ((tile_x * tile_w) as f64 - offset.x).floor() as i32;
                let screen_y = ((tile_y * tile_h) as f64 - offset.y).floor() as i32;
                backend.draw_tile(tile, screen_x, screen_y);
            }
        }

        for person in &self.roster {
            if person.layer != layer_index || !person.visible || person.doomed {
                continue;
            }
            let screen_x = (person.x - offset.x).floor() as i32;
            let screen_y = (person.y - offset.y).floor() as i32;
            if layer.reflective {
                backend.draw_person(&PersonDrawCall {
                    name: &person.name,
                    sprite: person.sprite.as_ref(),
                    pose: &person.pose,
                    frame: person.frame,
                    x: screen_x,
                    y: screen_y,
                    flipped: true,
                    scale_x: person.scale_x,
                    scale_y: person.scale_y,
                    rotation: person.rotation,
                    mask: person.mask,
                });
            }
            backend.draw_person(&PersonDrawCall {
                name: &person.name,
                sprite: person.sprite.as_ref(),
                pose: &person.pose,
                frame: person.frame,
                x: screen_x,
                y: screen_y,
                flipped: false,
                scale_x: person.scale_x,
                scale_y: person.scale_y,
                rotation: person.rotation,
                mask: person.mask,
            });
        }
    }

    // ---- scripts --------------------------------------------------

    fn run_script(
        &mut self,
        script: &ScriptHandle,
        person: Option<PersonId>,
    ) -> Result<(), ScriptError> {
        let script = Rc::clone(script);
        let previous = self.current_person;
        self.current_person = person;
        let result = script.invoke(self);
        self.current_person = previous;
        if let Err(error) = &result {
            warn!(error = %error, "script_failed");
        }
        result
    }

    pub fn set_update_script(&mut self, script: Option<ScriptHandle>) {
        self.update_script = script;
    }

    pub fn set_render_script(&mut self, script: Option<ScriptHandle>) {
        self.render_script = script;
    }

    pub fn set_map_script(
        &mut self,
        event: MapScriptEvent,
        script: Option<ScriptHandle>,
    ) -> Result<(), EngineError> {
        let map = self.map.as_mut().ok_or(EngineError::NotRunning)?;
        map.scripts.set(event, script);
        Ok(())
    }

    pub fn set_trigger_script(
        &mut self,
        index: usize,
        script: Option<ScriptHandle>,
    ) -> Result<(), EngineError> {
        let map = self.map.as_mut().ok_or(EngineError::NotRunning)?;
        let trigger = map
            .triggers
            .get_mut(index)
            .ok_or(EngineError::UnknownTrigger { index })?;
        trigger.script = script;
        Ok(())
    }

    pub fn set_zone_script(
        &mut self,
        index: usize,
        script: Option<ScriptHandle>,
    ) -> Result<(), EngineError> {
        let map = self.map.as_mut().ok_or(EngineError::NotRunning)?;
        let zone = map
            .zones
            .get_mut(index)
            .ok_or(EngineError::UnknownZone { index })?;
        zone.script = script;
        Ok(())
    }

    /// Install a script that runs right after the layer's tiles and
    /// persons are drawn each frame. Hidden layers skip it.
    pub fn set_layer_render_script(
        &mut self,
        layer: usize,
        script: Option<ScriptHandle>,
    ) -> Result<(), EngineError> {
        let map = self.map.as_mut().ok_or(EngineError::NotRunning)?;
        let layer_count = map.layers().len();
        let slot = map
            .layer_mut(layer)
            .ok_or(EngineError::InvalidLayer { layer, layer_count })?;
        slot.render_script = script;
        Ok(())
    }

    pub fn set_zone_interval(&mut self, index: usize, interval: u32) -> Result<(), EngineError> {
        if interval == 0 {
            return Err(EngineError::InvalidZoneInterval);
        }
        let map = self.map.as_mut().ok_or(EngineError::NotRunning)?;
        let zone = map
            .zones
            .get_mut(index)
            .ok_or(EngineError::UnknownZone { index })?;
        zone.interval = interval;
        zone.steps_left = interval;
        Ok(())
    }

    /// Resize one layer of the active map. Triggers and zones that fall
    /// outside the new pixel bounds are deleted or clipped.
    pub fn resize_layer(
        &mut self,
        layer: usize,
        width: u32,
        height: u32,
    ) -> Result<(), EngineError> {
        let map = self.map.as_mut().ok_or(EngineError::NotRunning)?;
        let layer_count = map.layers().len();
        if layer >= layer_count {
            return Err(EngineError::InvalidLayer { layer, layer_count });
        }
        map.resize_layer(layer, width, height);
        Ok(())
    }

    /// Schedule a one-shot script to run after `frames` future frames,
    /// independent of any person.
    pub fn run_after(&mut self, script: ScriptHandle, frames: u32) {
        self.deferred.push(DeferredScript {
            script,
            frames_left: frames,
        });
    }

    // ---- camera and fade ------------------------------------------

    pub fn camera(&self) -> Camera {
        self.camera
    }

    pub fn set_camera(&mut self, x: f64, y: f64) {
        self.camera = Camera::new(x, y);
    }

    pub fn attach_camera(&mut self, name: &str) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        self.camera_subject = Some(id);
        Ok(())
    }

    pub fn detach_camera(&mut self) {
        self.camera_subject = None;
    }

    pub fn fade_to(&mut self, color: Color, frames: u32) {
        if frames == 0 {
            self.mask = [
                color.red as f64,
                color.green as f64,
                color.blue as f64,
                color.alpha as f64,
            ];
            self.fade = None;
        } else {
            self.fade = Some(FadeState {
                target: color,
                frames_left: frames,
            });
        }
    }

    pub fn color_mask(&self) -> Color {
        Color::new(
            self.mask[0].round() as u8,
            self.mask[1].round() as u8,
            self.mask[2].round() as u8,
            self.mask[3].round() as u8,
        )
    }

    // ---- configuration --------------------------------------------

    pub fn set_talk_distance(&mut self, distance: f64) -> Result<(), EngineError> {
        if !distance.is_finite() || distance <= 0.0 {
            return Err(EngineError::Config(ConfigError::InvalidTalkDistance {
                distance,
            }));
        }
        self.config.talk_distance = distance;
        Ok(())
    }

    pub fn set_talk_button(&mut self, button: u32) {
        self.config.talk_button = button;
    }

    // ---- persons --------------------------------------------------

    pub fn persons(&self) -> &[Person] {
        &self.roster
    }

    pub fn person_id(&self, name: &str) -> Option<PersonId> {
        self.roster
            .iter()
            .find(|person| person.name == name)
            .map(|person| person.id)
    }

    pub fn person(&self, id: PersonId) -> Option<&Person> {
        self.find_person(id)
    }

    pub fn person_by_name(&self, name: &str) -> Option<&Person> {
        self.roster.iter().find(|person| person.name == name)
    }

    fn require_person(&self, name: &str) -> Result<PersonId, EngineError> {
        self.person_id(name).ok_or_else(|| EngineError::UnknownPerson {
            name: name.to_string(),
        })
    }

    fn find_person(&self, id: PersonId) -> Option<&Person> {
        self.roster.iter().find(|person| person.id == id)
    }

    fn find_person_mut(&mut self, id: PersonId) -> Option<&mut Person> {
        self.roster.iter_mut().find(|person| person.id == id)
    }

    fn is_live(&self, id: PersonId) -> bool {
        self.roster
            .iter()
            .any(|person| person.id == id && !person.doomed)
    }

    fn allocate_person_id(&mut self) -> PersonId {
        let id = PersonId(self.next_person_id);
        self.next_person_id = self.next_person_id.saturating_add(1);
        id
    }

    pub fn create_person(
        &mut self,
        name: &str,
        spriteset: &str,
        persistent: bool,
    ) -> Result<PersonId, EngineError> {
        if self.person_id(name).is_some() {
            return Err(EngineError::DuplicatePersonName {
                name: name.to_string(),
            });
        }
        let sprite = self.host.load_spriteset(spriteset)?;
        let (start, layer, direction) = self
            .map
            .as_ref()
            .map(|map| {
                let (position, layer) = map.start_position();
                (position, layer, map.start_direction())
            })
            .unwrap_or((Vec2::default(), 0, Direction::South));
        let id = self.allocate_person_id();
        let mut person = Person::new(
            id,
            name.to_string(),
            sprite,
            start.x,
            start.y,
            layer,
            persistent,
        );
        person.face(direction);
        self.roster.push(person);
        debug!(person = name, "person_created");
        Ok(id)
    }

    fn spawn_from_template(&mut self, template: &PersonTemplate) -> Result<PersonId, EngineError> {
        if self.person_id(&template.name).is_some() {
            return Err(EngineError::DuplicatePersonName {
                name: template.name.clone(),
            });
        }
        let sprite = self.host.load_spriteset(&template.spriteset)?;
        let id = self.allocate_person_id();
        let mut person = Person::new(
            id,
            template.name.clone(),
            sprite,
            template.x,
            template.y,
            template.layer,
            false,
        );
        person.scripts = template.scripts.clone();
        let create = person.scripts.on_create.clone();
        self.roster.push(person);
        if let Some(script) = create {
            self.run_script(&script, Some(id))?;
        }
        Ok(id)
    }

    pub fn destroy_person(&mut self, name: &str) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        self.destroy_person_by_id(id)
    }

    /// Destroy by id. Unknown or already-doomed ids are a no-op, which
    /// makes destruction idempotent even when a destroy hook destroys
    /// its own person again.
    pub fn destroy_person_by_id(&mut self, id: PersonId) -> Result<(), EngineError> {
        let Some(index) = self.roster.iter().position(|person| person.id == id) else {
            return Ok(());
        };
        if self.roster[index].doomed {
            return Ok(());
        }
        self.roster[index].doomed = true;
        let name = self.roster[index].name.clone();
        let script = self.roster[index].scripts.on_destroy.clone();
        // The destroy hook always runs to completion, and removal
        // happens even if the hook fails.
        let result = match script {
            Some(script) => self.run_script(&script, Some(id)),
            None => Ok(()),
        };
        self.roster.retain(|person| person.id != id);
        for person in &mut self.roster {
            if person.leader == Some(id) {
                person.leader = None;
                person.follow_distance = 0;
            }
        }
        self.players.retain(|binding| binding.person != id);
        if self.camera_subject == Some(id) {
            self.camera_subject = None;
        }
        debug!(person = %name, "person_destroyed");
        result.map_err(EngineError::from)
    }

    pub fn set_person_position(
        &mut self,
        name: &str,
        x: f64,
        y: f64,
        layer: usize,
    ) -> Result<(), EngineError> {
        if let Some(map) = self.map.as_ref() {
            let layer_count = map.layers().len();
            if layer >= layer_count {
                return Err(EngineError::InvalidLayer { layer, layer_count });
            }
        }
        let id = self.require_person(name)?;
        if let Some(person) = self.find_person_mut(id) {
            person.x = x;
            person.y = y;
            person.layer = layer;
            // Teleporting rewrites history; followers must not trail
            // through the jump.
            person.history = StepHistory::new(Vec2::new(x, y), person.history.capacity());
        }
        Ok(())
    }

    pub fn set_person_speed(&mut self, name: &str, speed_x: f64, speed_y: f64) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        if let Some(person) = self.find_person_mut(id) {
            person.speed_x = speed_x;
            person.speed_y = speed_y;
        }
        Ok(())
    }

    pub fn set_person_visible(&mut self, name: &str, visible: bool) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        if let Some(person) = self.find_person_mut(id) {
            person.visible = visible;
        }
        Ok(())
    }

    pub fn set_person_ignores(
        &mut self,
        name: &str,
        ignore_persons: bool,
        ignore_tiles: bool,
    ) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        if let Some(person) = self.find_person_mut(id) {
            person.ignore_persons = ignore_persons;
            person.ignore_tiles = ignore_tiles;
        }
        Ok(())
    }

    pub fn set_person_ignore_list(
        &mut self,
        name: &str,
        ignored: Vec<String>,
    ) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        if let Some(person) = self.find_person_mut(id) {
            person.ignored_names = ignored;
        }
        Ok(())
    }

    pub fn set_person_script(
        &mut self,
        name: &str,
        event: PersonScriptEvent,
        script: Option<ScriptHandle>,
    ) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        if let Some(person) = self.find_person_mut(id) {
            person.set_script(event, script);
        }
        Ok(())
    }

    pub fn queue_person_command(&mut self, name: &str, command: Command) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        if let Some(person) = self.find_person_mut(id) {
            person.queue_command(command);
        }
        Ok(())
    }

    pub fn clear_person_commands(&mut self, name: &str) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        if let Some(person) = self.find_person_mut(id) {
            person.clear_commands();
        }
        Ok(())
    }

    /// Assign a leader, or clear one with `leader = None`. Rejected
    /// when the assignment would close a cycle; neither person changes
    /// in that case.
    pub fn follow_person(
        &mut self,
        follower: &str,
        leader: Option<&str>,
        distance: usize,
    ) -> Result<(), EngineError> {
        let follower_id = self.require_person(follower)?;
        let Some(leader_name) = leader else {
            if let Some(person) = self.find_person_mut(follower_id) {
                person.leader = None;
                person.follow_distance = 0;
            }
            return Ok(());
        };
        if distance == 0 {
            return Err(EngineError::InvalidFollowDistance { distance });
        }
        let leader_id = self.require_person(leader_name)?;

        let mut cursor = Some(leader_id);
        let mut guard = self.roster.len();
        while let Some(current) = cursor {
            if current == follower_id {
                return Err(EngineError::FollowCycle {
                    follower: follower.to_string(),
                    leader: leader_name.to_string(),
                });
            }
            if guard == 0 {
                break;
            }
            guard -= 1;
            cursor = self.find_person(current).and_then(|person| person.leader);
        }

        if let Some(leader_person) = self.find_person_mut(leader_id) {
            leader_person.history.grow_to(distance);
        }
        if let Some(person) = self.find_person_mut(follower_id) {
            person.leader = Some(leader_id);
            person.follow_distance = distance;
        }
        Ok(())
    }

    // ---- input attachment and talk --------------------------------

    /// Mark a person as player-controlled for trigger/zone detection
    /// and talk activation. Returns the player index.
    pub fn attach_input(&mut self, name: &str) -> Result<usize, EngineError> {
        let id = self.require_person(name)?;
        if let Some(index) = self
            .players
            .iter()
            .position(|binding| binding.person == id)
        {
            return Ok(index);
        }
        self.players.push(PlayerBinding {
            person: id,
            last_trigger: None,
            last_position: None,
        });
        Ok(self.players.len() - 1)
    }

    pub fn detach_input(&mut self, name: &str) -> Result<(), EngineError> {
        let id = self.require_person(name)?;
        self.players.retain(|binding| binding.person != id);
        Ok(())
    }

    /// Talk activation: probe in front of the player by the configured
    /// talk distance and run the nearest reachable person's talk hook.
    pub fn activate_talk(&mut self, player: usize) -> Result<(), EngineError> {
        let person_id = self
            .players
            .get(player)
            .map(|binding| binding.person)
            .ok_or(EngineError::InvalidPlayer { player })?;
        let (probe, layer) = {
            let Some(person) = self.find_person(person_id) else {
                return Ok(());
            };
            let (dx, dy) = person.direction.delta();
            (
                Vec2::new(
                    person.x + dx * self.config.talk_distance,
                    person.y + dy * self.config.talk_distance,
                ),
                person.layer,
            )
        };

        let mut best: Option<(f64, PersonId)> = None;
        for other in &self.roster {
            if other.id == person_id || other.doomed || other.layer != layer {
                continue;
            }
            let distance =
                ((other.x - probe.x).powi(2) + (other.y - probe.y).powi(2)).sqrt();
            if distance <= self.config.talk_distance
                && best.map_or(true, |(closest, _)| distance < closest)
            {
                best = Some((distance, other.id));
            }
        }
        if let Some((_, target)) = best {
            let script = self
                .find_person(target)
                .and_then(|person| person.scripts.on_talk.clone());
            if let Some(script) = script {
                self.run_script(&script, Some(target))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::geometry::Rect;
    use crate::map::{Trigger, Zone};
    use crate::obstruction::Segment;
    use crate::script::FnScript;
    use crate::testutil::{bare_map, loaded, StubHost, StubTileset, WorldFile};

    fn engine() -> MapEngine {
        MapEngine::new(Box::new(StubHost::new()), EngineConfig::default()).expect("engine")
    }

    /// Engine running on a bare `width x height` map of 16px tiles.
    fn running_engine(width: u32, height: u32) -> MapEngine {
        let mut engine = engine();
        engine
            .start_loaded(loaded(bare_map(width, height, 16, 16)), 60)
            .expect("start");
        engine
    }

    fn counter_script() -> (Rc<Cell<u32>>, ScriptHandle) {
        let count = Rc::new(Cell::new(0u32));
        let handle = FnScript::handle({
            let count = Rc::clone(&count);
            move |_| {
                count.set(count.get() + 1);
                Ok(())
            }
        });
        (count, handle)
    }

    fn spawn(engine: &mut MapEngine, name: &str, x: f64, y: f64) {
        engine.create_person(name, "stub.rss", false).expect("create");
        engine.set_person_position(name, x, y, 0).expect("position");
    }

    fn move_command(direction: Direction) -> Command {
        Command::new(CommandOp::Move(direction), false)
    }

    #[test]
    fn update_outside_running_state_is_rejected() {
        let mut engine = engine();
        assert!(matches!(engine.update(), Err(EngineError::NotRunning)));
    }

    #[test]
    fn starting_twice_is_rejected() {
        let mut engine = running_engine(10, 10);
        let result = engine.start_loaded(loaded(bare_map(10, 10, 16, 16)), 60);
        assert!(matches!(result, Err(EngineError::AlreadyRunning)));
    }

    #[test]
    fn changing_map_while_idle_is_rejected() {
        let mut engine = engine();
        let result = engine.change_loaded(loaded(bare_map(10, 10, 16, 16)));
        assert!(matches!(result, Err(EngineError::NotRunning)));
    }

    #[test]
    fn immediate_commands_drain_until_the_first_blocking_one() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "scout", 50.0, 50.0);
        engine
            .queue_person_command("scout", Command::new(CommandOp::Face(Direction::East), true))
            .expect("queue");
        engine
            .queue_person_command("scout", Command::new(CommandOp::Move(Direction::East), true))
            .expect("queue");
        engine
            .queue_person_command("scout", move_command(Direction::East))
            .expect("queue");
        engine
            .queue_person_command("scout", move_command(Direction::East))
            .expect("queue");

        engine.update().expect("update");

        let scout = engine.person_by_name("scout").expect("scout");
        assert_eq!(scout.x, 52.0);
        assert_eq!(scout.direction, Direction::East);
        assert_eq!(scout.commands_left(), 1);
    }

    #[test]
    fn generator_script_refills_an_empty_queue() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "walker", 50.0, 50.0);
        engine
            .set_person_script(
                "walker",
                PersonScriptEvent::GenerateCommands,
                Some(FnScript::handle(|engine| {
                    engine
                        .queue_person_command("walker", Command::new(CommandOp::Move(Direction::South), false))
                        .map_err(|error| ScriptError::new(error.to_string()))
                })),
            )
            .expect("script");

        for _ in 0..3 {
            engine.update().expect("update");
        }
        assert_eq!(engine.person_by_name("walker").expect("walker").y, 53.0);
    }

    #[test]
    fn follower_lands_on_the_leaders_past_positions() {
        let mut engine = running_engine(40, 40);
        spawn(&mut engine, "hero", 100.0, 100.0);
        spawn(&mut engine, "dog", 100.0, 100.0);
        engine.set_person_ignores("hero", true, true).expect("ignores");
        engine.follow_person("dog", Some("hero"), 2).expect("follow");

        for step in 1..=5u32 {
            engine
                .queue_person_command("hero", move_command(Direction::East))
                .expect("queue");
            engine.update().expect("update");
            let hero_x = engine.person_by_name("hero").expect("hero").x;
            let dog_x = engine.person_by_name("dog").expect("dog").x;
            assert_eq!(hero_x, 100.0 + step as f64);
            // The dog sits exactly where the hero was two steps ago.
            assert_eq!(dog_x, (100.0 + step as f64 - 2.0).max(100.0));
        }
    }

    #[test]
    fn follow_cycles_are_rejected_without_side_effects() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "a", 10.0, 10.0);
        spawn(&mut engine, "b", 20.0, 10.0);
        spawn(&mut engine, "c", 30.0, 10.0);
        engine.follow_person("b", Some("a"), 1).expect("follow");
        engine.follow_person("c", Some("b"), 1).expect("follow");

        assert!(matches!(
            engine.follow_person("a", Some("c"), 1),
            Err(EngineError::FollowCycle { .. })
        ));
        assert!(matches!(
            engine.follow_person("a", Some("a"), 1),
            Err(EngineError::FollowCycle { .. })
        ));
        assert_eq!(engine.person_by_name("a").expect("a").leader, None);
    }

    #[test]
    fn follow_distance_zero_is_rejected() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "a", 10.0, 10.0);
        spawn(&mut engine, "b", 20.0, 10.0);
        assert!(matches!(
            engine.follow_person("b", Some("a"), 0),
            Err(EngineError::InvalidFollowDistance { distance: 0 })
        ));
    }

    #[test]
    fn unfollowing_releases_the_leash() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "a", 10.0, 10.0);
        spawn(&mut engine, "b", 20.0, 10.0);
        engine.follow_person("b", Some("a"), 1).expect("follow");
        engine.follow_person("b", None, 0).expect("unfollow");
        assert_eq!(engine.person_by_name("b").expect("b").leader, None);
    }

    #[test]
    fn trigger_fires_once_per_entry_even_when_standing_still() {
        let mut engine = running_engine(20, 20);
        let (count, script) = counter_script();
        engine.map.as_mut().expect("map").triggers.push(Trigger {
            x: 40.0,
            y: 40.0,
            layer: 0,
            script: Some(script),
        });
        spawn(&mut engine, "hero", 40.0, 40.0);
        engine.attach_input("hero").expect("attach");

        for _ in 0..100 {
            engine.update().expect("update");
        }
        assert_eq!(count.get(), 1);

        // Leaving and re-entering re-arms the trigger.
        engine.set_person_position("hero", 200.0, 200.0, 0).expect("leave");
        engine.update().expect("update");
        engine.set_person_position("hero", 40.0, 40.0, 0).expect("re-enter");
        engine.update().expect("update");
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn zone_fires_every_interval_pixels_of_travel() {
        let mut engine = running_engine(20, 20);
        let (count, script) = counter_script();
        engine.map.as_mut().expect("map").zones.push(Zone::new(
            Rect::new(0.0, 0.0, 320.0, 320.0),
            0,
            8,
            Some(script),
        ));
        spawn(&mut engine, "hero", 10.0, 10.0);
        engine.attach_input("hero").expect("attach");
        engine.update().expect("baseline");

        // 7 pixels: counter not yet exhausted.
        for step in 1..=7u32 {
            engine
                .set_person_position("hero", 10.0 + step as f64, 10.0, 0)
                .expect("move");
            engine.update().expect("update");
        }
        assert_eq!(count.get(), 0);

        // The 8th pixel fires and resets the countdown.
        engine.set_person_position("hero", 18.0, 10.0, 0).expect("move");
        engine.update().expect("update");
        assert_eq!(count.get(), 1);

        // A 24-pixel jump fires three whole intervals.
        engine.set_person_position("hero", 42.0, 10.0, 0).expect("move");
        engine.update().expect("update");
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn zone_interval_setter_validates() {
        let mut engine = running_engine(20, 20);
        engine.map.as_mut().expect("map").zones.push(Zone::new(
            Rect::new(0.0, 0.0, 64.0, 64.0),
            0,
            8,
            None,
        ));
        assert!(matches!(
            engine.set_zone_interval(0, 0),
            Err(EngineError::InvalidZoneInterval)
        ));
        assert!(matches!(
            engine.set_zone_interval(3, 8),
            Err(EngineError::UnknownZone { index: 3 })
        ));
        engine.set_zone_interval(0, 16).expect("set interval");
        assert_eq!(engine.map().expect("map").zones()[0].interval, 16);
    }

    #[test]
    fn blocked_move_fires_the_obstacles_touch_script() {
        let mut engine = running_engine(20, 20);
        let (count, script) = counter_script();
        spawn(&mut engine, "walker", 50.0, 50.0);
        spawn(&mut engine, "wall", 58.0, 50.0);
        engine
            .set_person_script("wall", PersonScriptEvent::Touch, Some(script))
            .expect("script");

        engine
            .queue_person_command("walker", move_command(Direction::East))
            .expect("queue");
        engine.update().expect("update");

        assert_eq!(count.get(), 1);
        assert_eq!(engine.person_by_name("walker").expect("walker").x, 50.0);
    }

    #[test]
    fn solid_tiles_block_movement() {
        let mut engine = engine();
        let mut map = bare_map(10, 10, 16, 16);
        map.layer_mut(0).expect("layer").set_tile(4, 3, 1);
        let mut tileset = StubTileset::new(16, 16, 16);
        tileset.set_solid(1);
        engine
            .start_loaded(
                LoadedMap {
                    map,
                    tileset: Box::new(tileset),
                },
                60,
            )
            .expect("start");
        spawn(&mut engine, "walker", 59.0, 56.0);

        engine
            .queue_person_command("walker", move_command(Direction::East))
            .expect("queue");
        engine.update().expect("update");
        assert_eq!(engine.person_by_name("walker").expect("walker").x, 60.0);

        engine
            .queue_person_command("walker", move_command(Direction::East))
            .expect("queue");
        engine.update().expect("update");
        // The next step would overlap the solid tile starting at x = 64.
        assert_eq!(engine.person_by_name("walker").expect("walker").x, 60.0);
    }

    #[test]
    fn authored_segments_block_movement() {
        let mut engine = running_engine(10, 10);
        engine
            .map
            .as_mut()
            .expect("map")
            .layer_mut(0)
            .expect("layer")
            .obstructions
            .push(Segment::new(70.0, 40.0, 70.0, 70.0));
        spawn(&mut engine, "walker", 65.0, 56.0);

        engine
            .queue_person_command("walker", move_command(Direction::East))
            .expect("queue");
        engine.update().expect("update");
        assert_eq!(engine.person_by_name("walker").expect("walker").x, 65.0);
    }

    #[test]
    fn destroy_is_idempotent_inside_its_own_hook() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "npc", 50.0, 50.0);
        let count = Rc::new(Cell::new(0u32));
        let hook = FnScript::handle({
            let count = Rc::clone(&count);
            move |engine| {
                count.set(count.get() + 1);
                engine
                    .destroy_person("npc")
                    .map_err(|error| ScriptError::new(error.to_string()))
            }
        });
        engine
            .set_person_script("npc", PersonScriptEvent::Destroy, Some(hook))
            .expect("script");

        engine.destroy_person("npc").expect("destroy");
        assert_eq!(count.get(), 1);
        assert!(engine.person_by_name("npc").is_none());
        engine.destroy_person_by_id(PersonId(999)).expect("unknown id is a no-op");
    }

    #[test]
    fn destroying_a_leader_releases_its_followers() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "a", 10.0, 10.0);
        spawn(&mut engine, "b", 20.0, 10.0);
        engine.follow_person("b", Some("a"), 1).expect("follow");
        engine.destroy_person("a").expect("destroy");
        let b = engine.person_by_name("b").expect("b");
        assert_eq!(b.leader, None);
        assert_eq!(b.follow_distance, 0);
    }

    #[test]
    fn exit_destroys_non_persistent_persons_and_goes_idle() {
        let mut engine = running_engine(20, 20);
        let (count, script) = counter_script();
        spawn(&mut engine, "npc", 50.0, 50.0);
        engine
            .set_person_script("npc", PersonScriptEvent::Destroy, Some(script))
            .expect("script");
        engine.create_person("hero", "hero.rss", true).expect("hero");

        engine.request_exit();
        engine.update().expect("final frame");

        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(count.get(), 1);
        assert_eq!(engine.persons().len(), 1);
        assert_eq!(engine.persons()[0].name, "hero");
    }

    #[test]
    fn change_map_runs_leave_then_enter_and_spawns_templates() {
        let mut engine = running_engine(20, 20);
        let (leave_count, leave) = counter_script();
        let (enter_count, enter) = counter_script();
        let (create_count, create) = counter_script();
        engine.map.as_mut().expect("map").scripts.on_leave = Some(leave);
        spawn(&mut engine, "npc", 50.0, 50.0);
        engine.create_person("hero", "hero.rss", true).expect("hero");

        let mut next = bare_map(30, 30, 16, 16);
        next.scripts.on_enter = Some(enter);
        next.templates.push(PersonTemplate {
            name: "townsfolk".to_string(),
            spriteset: "folk.rss".to_string(),
            x: 64.0,
            y: 64.0,
            layer: 0,
            scripts: crate::person::PersonScripts {
                on_create: Some(create),
                ..Default::default()
            },
        });

        engine.change_loaded(loaded(next)).expect("change");

        assert_eq!(leave_count.get(), 1);
        assert_eq!(enter_count.get(), 1);
        assert_eq!(create_count.get(), 1);
        assert!(engine.person_by_name("npc").is_none());
        assert!(engine.person_by_name("hero").is_some());
        assert!(engine.person_by_name("townsfolk").is_some());
    }

    #[test]
    fn attached_camera_tracks_its_subject() {
        let mut engine = running_engine(40, 40);
        spawn(&mut engine, "hero", 123.0, 234.0);
        engine.attach_camera("hero").expect("attach");
        engine.update().expect("update");
        assert_eq!(engine.camera(), Camera::new(123.0, 234.0));
    }

    #[test]
    fn edge_scripts_fire_once_per_crossing() {
        let mut engine = running_engine(20, 20);
        let (count, script) = counter_script();
        engine.map.as_mut().expect("map").scripts.on_leave_west = Some(script);

        engine.set_camera(-5.0, 120.0);
        engine.update().expect("update");
        engine.update().expect("update");
        assert_eq!(count.get(), 1);

        engine.set_camera(10.0, 120.0);
        engine.update().expect("update");
        engine.set_camera(-5.0, 120.0);
        engine.update().expect("update");
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn deferred_scripts_fire_exactly_once_after_their_delay() {
        let mut engine = running_engine(20, 20);
        let (count, script) = counter_script();
        engine.run_after(script, 3);
        engine.update().expect("update");
        engine.update().expect("update");
        assert_eq!(count.get(), 0);
        engine.update().expect("update");
        assert_eq!(count.get(), 1);
        engine.update().expect("update");
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn fade_interpolates_the_mask_over_frames() {
        let mut engine = running_engine(20, 20);
        engine.fade_to(Color::new(0, 0, 0, 255), 2);
        engine.update().expect("update");
        assert_eq!(engine.color_mask().alpha, 128);
        engine.update().expect("update");
        assert_eq!(engine.color_mask(), Color::new(0, 0, 0, 255));

        engine.fade_to(Color::TRANSPARENT, 0);
        assert_eq!(engine.color_mask(), Color::TRANSPARENT);
    }

    #[test]
    fn update_script_runs_every_frame() {
        let mut engine = running_engine(20, 20);
        let (count, script) = counter_script();
        engine.set_update_script(Some(script));
        for _ in 0..3 {
            engine.update().expect("update");
        }
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn roster_sorts_by_depth_with_followers_after_their_leader() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "low", 50.0, 90.0);
        spawn(&mut engine, "high", 50.0, 30.0);
        spawn(&mut engine, "pet", 50.0, 10.0);
        engine.follow_person("pet", Some("low"), 1).expect("follow");

        engine.update().expect("update");

        let names: Vec<&str> = engine.persons().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["high", "low", "pet"]);
    }

    #[test]
    fn talk_activation_reaches_the_nearest_person_in_range() {
        let mut engine = running_engine(20, 20);
        let (near_count, near) = counter_script();
        let (far_count, far) = counter_script();
        spawn(&mut engine, "hero", 50.0, 50.0);
        spawn(&mut engine, "near", 56.0, 50.0);
        spawn(&mut engine, "far", 80.0, 50.0);
        engine
            .set_person_script("near", PersonScriptEvent::Talk, Some(near))
            .expect("script");
        engine
            .set_person_script("far", PersonScriptEvent::Talk, Some(far))
            .expect("script");
        engine
            .queue_person_command("hero", Command::new(CommandOp::Face(Direction::East), true))
            .expect("queue");
        engine.update().expect("update");
        let player = engine.attach_input("hero").expect("attach");

        engine.activate_talk(player).expect("talk");
        assert_eq!(near_count.get(), 1);
        assert_eq!(far_count.get(), 0);

        assert!(matches!(
            engine.activate_talk(7),
            Err(EngineError::InvalidPlayer { player: 7 })
        ));
    }

    #[test]
    fn attach_input_is_idempotent_per_person() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "hero", 50.0, 50.0);
        let first = engine.attach_input("hero").expect("attach");
        let second = engine.attach_input("hero").expect("attach again");
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_person_names_are_rejected() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "hero", 50.0, 50.0);
        assert!(matches!(
            engine.create_person("hero", "other.rss", false),
            Err(EngineError::DuplicatePersonName { .. })
        ));
    }

    #[test]
    fn positioning_on_a_missing_layer_is_rejected() {
        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "hero", 50.0, 50.0);
        assert!(matches!(
            engine.set_person_position("hero", 10.0, 10.0, 5),
            Err(EngineError::InvalidLayer {
                layer: 5,
                layer_count: 1
            })
        ));
    }

    #[test]
    fn render_draws_tiles_persons_and_the_fade_mask() {
        #[derive(Default)]
        struct RecordingBackend {
            tiles: usize,
            persons: Vec<String>,
            mask: Option<Color>,
        }

        impl RenderBackend for RecordingBackend {
            fn draw_tile(&mut self, _tile: usize, _x: i32, _y: i32) {
                self.tiles += 1;
            }

            fn draw_person(&mut self, call: &PersonDrawCall<'_>) {
                self.persons.push(call.name.to_string());
            }

            fn apply_color_mask(&mut self, color: Color) {
                self.mask = Some(color);
            }
        }

        let mut engine = running_engine(20, 20);
        spawn(&mut engine, "hero", 50.0, 50.0);
        engine.fade_to(Color::new(0, 0, 0, 100), 0);

        let mut backend = RecordingBackend::default();
        engine.render(&mut backend).expect("render");
        assert!(backend.tiles > 0);
        assert_eq!(backend.persons, ["hero"]);
        assert_eq!(backend.mask, Some(Color::new(0, 0, 0, 100)));

        // Hidden layers draw nothing.
        engine.map.as_mut().expect("map").layer_mut(0).expect("layer").visible = false;
        engine.set_person_visible("hero", false).expect("visible");
        let mut hidden = RecordingBackend::default();
        engine.render(&mut hidden).expect("render");
        assert_eq!(hidden.tiles, 0);
        assert!(hidden.persons.is_empty());
    }

    #[test]
    fn layer_render_scripts_run_after_their_tiles_are_drawn() {
        struct TileCounter {
            drawn: Rc<Cell<usize>>,
        }

        impl RenderBackend for TileCounter {
            fn draw_tile(&mut self, _tile: usize, _x: i32, _y: i32) {
                self.drawn.set(self.drawn.get() + 1);
            }

            fn draw_person(&mut self, _call: &PersonDrawCall<'_>) {}

            fn apply_color_mask(&mut self, _color: Color) {}
        }

        let mut engine = running_engine(5, 5);
        let drawn = Rc::new(Cell::new(0usize));
        let seen_by_hook = Rc::new(Cell::new(0usize));
        engine
            .set_layer_render_script(
                0,
                Some(FnScript::handle({
                    let drawn = Rc::clone(&drawn);
                    let seen = Rc::clone(&seen_by_hook);
                    move |_| {
                        seen.set(drawn.get());
                        Ok(())
                    }
                })),
            )
            .expect("script");
        assert!(matches!(
            engine.set_layer_render_script(3, None),
            Err(EngineError::InvalidLayer {
                layer: 3,
                layer_count: 1
            })
        ));

        let mut backend = TileCounter {
            drawn: Rc::clone(&drawn),
        };
        engine.render(&mut backend).expect("render");
        assert!(drawn.get() > 0);
        assert_eq!(seen_by_hook.get(), drawn.get());

        // Hiding the layer suppresses the hook along with the tiles.
        engine.map.as_mut().expect("map").layer_mut(0).expect("layer").visible = false;
        seen_by_hook.set(usize::MAX);
        engine.render(&mut backend).expect("render");
        assert_eq!(seen_by_hook.get(), usize::MAX);
    }

    #[test]
    fn reflective_layers_draw_persons_flipped_beneath_the_upright_pass() {
        #[derive(Default)]
        struct FlipRecorder {
            calls: Vec<(String, bool)>,
        }

        impl RenderBackend for FlipRecorder {
            fn draw_tile(&mut self, _tile: usize, _x: i32, _y: i32) {}

            fn draw_person(&mut self, call: &PersonDrawCall<'_>) {
                self.calls.push((call.name.to_string(), call.flipped));
            }

            fn apply_color_mask(&mut self, _color: Color) {}
        }

        let mut engine = running_engine(10, 10);
        spawn(&mut engine, "hero", 50.0, 50.0);
        engine.map.as_mut().expect("map").layer_mut(0).expect("layer").reflective = true;

        let mut backend = FlipRecorder::default();
        engine.render(&mut backend).expect("render");
        assert_eq!(
            backend.calls,
            [("hero".to_string(), true), ("hero".to_string(), false)]
        );
    }

    #[test]
    fn map_music_plays_on_start_and_stops_on_change_and_exit() {
        let host = StubHost::new();
        let played = Rc::clone(&host.music_played);
        let stops = Rc::clone(&host.music_stops);
        let mut engine =
            MapEngine::new(Box::new(host), EngineConfig::default()).expect("engine");

        let mut town = bare_map(10, 10, 16, 16);
        town.music = Some("town.ogg".to_string());
        engine.start_loaded(loaded(town), 60).expect("start");
        assert_eq!(*played.borrow(), ["town.ogg"]);
        assert_eq!(stops.get(), 0);

        let mut cave = bare_map(10, 10, 16, 16);
        cave.music = Some("cave.ogg".to_string());
        engine.change_loaded(loaded(cave)).expect("change");
        assert_eq!(*played.borrow(), ["town.ogg", "cave.ogg"]);
        assert_eq!(stops.get(), 1);

        engine.request_exit();
        engine.update().expect("update");
        assert_eq!(stops.get(), 2);
    }

    #[test]
    fn failed_start_leaves_no_map_path_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("town.rmp");
        std::fs::write(&path, WorldFile::minimal().encode()).expect("write");

        let mut engine = engine();
        assert!(matches!(
            engine.start_map(&path, 0),
            Err(EngineError::InvalidFrameRate)
        ));
        assert_eq!(engine.map_path(), None);

        engine.start_map(&path, 60).expect("start");
        assert_eq!(engine.map_path(), Some(path.as_path()));
    }
}
