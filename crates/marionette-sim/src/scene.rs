//! In-memory scene graph implementing [`Host`].

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde_json::{Value, json};

use marionette::{
    Host, HostError, HostInfo, InputEvent, MouseButton, Point, Subscription, SubscriptionId,
};

use crate::expr::{Expr, Resolve};

pub const ROOT: &str = "/root";
pub const PLAYER: &str = "/root/Main/Player";
pub const TIMER: &str = "/root/Main/Timer";
pub const COIN: &str = "/root/Main/Coin";
pub const START_BUTTON: &str = "/root/Main/UI/StartButton";
pub const SCORE_LABEL: &str = "/root/Main/UI/ScoreLabel";

const FLOOR_Y: f64 = 300.0;
const GRAVITY: f64 = 980.0;
const PICKUP_RADIUS: f64 = 32.0;

#[derive(Debug, Clone)]
struct Node {
    kind: &'static str,
    signals: &'static [&'static str],
    properties: IndexMap<String, Value>,
}

struct Listener {
    source: String,
    event: String,
    subscription: Subscription,
}

#[derive(Debug, Default)]
struct InputState {
    /// Held actions and their strength.
    actions: HashMap<String, f64>,
    /// Actions pressed since the last frame.
    just_pressed: HashSet<String>,
    pointer: Point,
    press_origin: Option<Point>,
}

/// Default key bindings.
fn key_action(key: &str) -> Option<&'static str> {
    match key.to_ascii_lowercase().as_str() {
        "arrowleft" | "left" | "a" => Some("move_left"),
        "arrowright" | "right" | "d" => Some("move_right"),
        "space" | " " | "w" | "arrowup" | "up" => Some("jump"),
        _ => None,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}

fn same_kind(current: &Value, new: &Value) -> bool {
    match (current, new) {
        (Value::Null, _) => true,
        (Value::Bool(_), Value::Bool(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Object(_), Value::Object(_)) => true,
        (Value::Array(a), Value::Array(b)) => a.len() == b.len(),
        _ => false,
    }
}

fn inside(rect_pos: Point, rect_size: Point, point: Point) -> bool {
    point[0] >= rect_pos[0]
        && point[0] <= rect_pos[0] + rect_size[0]
        && point[1] >= rect_pos[1]
        && point[1] <= rect_pos[1] + rect_size[1]
}

pub struct Scene {
    project: String,
    nodes: IndexMap<String, Node>,
    listeners: Vec<Listener>,
    input: InputState,
    frame: u64,
    display: bool,
}

impl Scene {
    pub fn new(project: impl Into<String>) -> Self {
        let mut scene = Self {
            project: project.into(),
            nodes: IndexMap::new(),
            listeners: Vec::new(),
            input: InputState::default(),
            frame: 0,
            display: false,
        };
        scene.add(ROOT, "Window", &[], []);
        scene
    }

    /// The platformer scene the sim binary runs.
    pub fn demo() -> Self {
        let mut scene = Self::new("platformer");
        scene.add("/root/Main", "Node2D", &[], []);
        scene.add(
            PLAYER,
            "CharacterBody2D",
            &["jumped", "landed"],
            [
                ("position", json!([100.0, FLOOR_Y])),
                ("velocity", json!([0.0, 0.0])),
                ("speed", json!(200.0)),
                ("jump_speed", json!(400.0)),
                ("on_floor", json!(true)),
                ("hp", json!(100)),
            ],
        );
        scene.add(
            TIMER,
            "Timer",
            &["timeout"],
            [
                ("wait_time", json!(1.0)),
                ("time_left", json!(1.0)),
                ("one_shot", json!(false)),
                ("running", json!(true)),
                ("timeouts", json!(0)),
            ],
        );
        scene.add(
            COIN,
            "Area2D",
            &["collected"],
            [("position", json!([400.0, FLOOR_Y])), ("value", json!(10))],
        );
        scene.add("/root/Main/UI", "Control", &[], []);
        scene.add(
            START_BUTTON,
            "Button",
            &["pressed"],
            [
                ("position", json!([20.0, 20.0])),
                ("size", json!([120.0, 40.0])),
                ("text", json!("Start")),
                ("disabled", json!(false)),
                ("press_count", json!(0)),
            ],
        );
        scene.add(
            SCORE_LABEL,
            "Label",
            &[],
            [("text", json!("Score: 0")), ("score", json!(0))],
        );
        scene
    }

    pub fn with_display(mut self, display: bool) -> Self {
        self.display = display;
        self
    }

    fn add<const N: usize>(
        &mut self,
        path: &str,
        kind: &'static str,
        signals: &'static [&'static str],
        properties: [(&str, Value); N],
    ) {
        self.nodes.insert(
            path.to_string(),
            Node {
                kind,
                signals,
                properties: properties
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            },
        );
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    fn children<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .keys()
            .map(String::as_str)
            .filter(move |candidate| parent_of(candidate) == Some(path))
    }

    fn node(&self, path: &str) -> Result<&Node, HostError> {
        self.nodes
            .get(path)
            .ok_or_else(|| HostError::NodeNotFound(path.to_string()))
    }

    fn num(&self, path: &str, property: &str) -> f64 {
        self.nodes
            .get(path)
            .and_then(|n| n.properties.get(property))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    fn flag(&self, path: &str, property: &str) -> bool {
        self.nodes
            .get(path)
            .and_then(|n| n.properties.get(property))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn vec2(&self, path: &str, property: &str) -> Point {
        let value = self.nodes.get(path).and_then(|n| n.properties.get(property));
        match value.and_then(Value::as_array).map(Vec::as_slice) {
            Some([x, y]) => [x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0)],
            _ => [0.0, 0.0],
        }
    }

    fn put(&mut self, path: &str, property: &str, value: Value) {
        if let Some(node) = self.nodes.get_mut(path) {
            node.properties.insert(property.to_string(), value);
        }
    }

    /// Fire `signal` on every listener attached to `path`.
    pub fn emit(&self, path: &str, signal: &str, args: Vec<Value>) {
        for listener in &self.listeners {
            if listener.source == path && listener.event == signal {
                listener.subscription.fire(args.clone());
            }
        }
    }

    /// Remove a node and its subtree. Listeners on removed nodes are told
    /// their source is gone.
    pub fn free(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in &doomed {
            self.nodes.shift_remove(p);
        }
        self.listeners.retain(|listener| {
            let gone = doomed.contains(&listener.source);
            if gone {
                listener.subscription.source_destroyed();
            }
            !gone
        });
        tracing::debug!(%path, removed = doomed.len(), "Freed node");
    }

    /// Advance the simulation by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        self.frame += 1;
        self.step_player(dt);
        self.step_timer(dt);
        self.step_pickups();
        self.input.just_pressed.clear();
    }

    fn strength(&self, action: &str) -> f64 {
        self.input.actions.get(action).copied().unwrap_or(0.0)
    }

    fn step_player(&mut self, dt: f64) {
        if !self.nodes.contains_key(PLAYER) {
            return;
        }
        let axis = self.strength("move_right") - self.strength("move_left");
        let vx = axis * self.num(PLAYER, "speed");
        let [mut x, mut y] = self.vec2(PLAYER, "position");
        let [_, mut vy] = self.vec2(PLAYER, "velocity");
        let mut on_floor = self.flag(PLAYER, "on_floor");

        x += vx * dt;
        if on_floor && self.input.just_pressed.contains("jump") {
            vy = -self.num(PLAYER, "jump_speed");
            on_floor = false;
            self.emit(PLAYER, "jumped", vec![json!(-vy)]);
        }
        if !on_floor {
            vy += GRAVITY * dt;
            y += vy * dt;
            if y >= FLOOR_Y {
                y = FLOOR_Y;
                vy = 0.0;
                on_floor = true;
                self.emit(PLAYER, "landed", vec![json!([x, y])]);
            }
        }

        self.put(PLAYER, "position", json!([x, y]));
        self.put(PLAYER, "velocity", json!([vx, vy]));
        self.put(PLAYER, "on_floor", json!(on_floor));
    }

    fn step_timer(&mut self, dt: f64) {
        if !self.flag(TIMER, "running") {
            return;
        }
        let mut time_left = self.num(TIMER, "time_left") - dt;
        if time_left <= 0.0 {
            let timeouts = self.num(TIMER, "timeouts") as u64 + 1;
            self.put(TIMER, "timeouts", json!(timeouts));
            self.emit(TIMER, "timeout", vec![]);
            if self.flag(TIMER, "one_shot") {
                time_left = 0.0;
                self.put(TIMER, "running", json!(false));
            } else {
                time_left += self.num(TIMER, "wait_time").max(dt);
            }
        }
        self.put(TIMER, "time_left", json!(time_left));
    }

    fn step_pickups(&mut self) {
        if !self.nodes.contains_key(PLAYER) || !self.nodes.contains_key(COIN) {
            return;
        }
        let [px, py] = self.vec2(PLAYER, "position");
        let [cx, cy] = self.vec2(COIN, "position");
        if (px - cx).hypot(py - cy) > PICKUP_RADIUS {
            return;
        }
        let value = self.num(COIN, "value") as i64;
        self.emit(COIN, "collected", vec![json!(value)]);
        let score = self.num(SCORE_LABEL, "score") as i64 + value;
        self.put(SCORE_LABEL, "score", json!(score));
        self.put(SCORE_LABEL, "text", json!(format!("Score: {}", score)));
        self.free(COIN);
    }

    fn tree(&self, path: &str, depth_left: Option<usize>) -> Value {
        let Some(node) = self.nodes.get(path) else {
            return Value::Null;
        };
        let mut out = json!({"name": name_of(path), "path": path, "type": node.kind});
        let children: Vec<&str> = self.children(path).collect();
        if depth_left == Some(0) {
            out["child_count"] = json!(children.len());
        } else {
            let next = depth_left.map(|d| d - 1);
            out["children"] = Value::Array(children.into_iter().map(|c| self.tree(c, next)).collect());
        }
        out
    }

    fn click(&mut self, at: Point) {
        if !self.nodes.contains_key(START_BUTTON) || self.flag(START_BUTTON, "disabled") {
            return;
        }
        let pos = self.vec2(START_BUTTON, "position");
        let size = self.vec2(START_BUTTON, "size");
        let Some(origin) = self.input.press_origin.take() else {
            return;
        };
        if inside(pos, size, origin) && inside(pos, size, at) {
            let count = self.num(START_BUTTON, "press_count") as u64 + 1;
            self.put(START_BUTTON, "press_count", json!(count));
            self.emit(START_BUTTON, "pressed", vec![]);
        }
    }

    fn press(&mut self, action: &str, pressed: bool, strength: f64) {
        if pressed {
            if !self.input.actions.contains_key(action) {
                self.input.just_pressed.insert(action.to_string());
            }
            self.input.actions.insert(action.to_string(), strength);
        } else {
            self.input.actions.remove(action);
        }
    }
}

impl Resolve for Scene {
    fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn property(&self, path: &str, property: &str) -> Result<Value, HostError> {
        self.get_property(path, property)
    }
}

impl Host for Scene {
    fn info(&self) -> HostInfo {
        HostInfo::new("marionette-sim")
            .with_engine_version(env!("CARGO_PKG_VERSION"))
            .with_project(self.project.clone())
    }

    fn has_display(&self) -> bool {
        self.display
    }

    fn frame(&self) -> u64 {
        self.frame
    }

    fn scene_tree(&self, root: Option<&str>, max_depth: Option<usize>) -> Result<Value, HostError> {
        let root = root.unwrap_or(ROOT);
        self.node(root)?;
        Ok(self.tree(root, max_depth))
    }

    fn node_exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn describe_node(&self, path: &str) -> Result<Value, HostError> {
        let node = self.node(path)?;
        let children: Vec<&str> = self.children(path).map(name_of).collect();
        Ok(json!({
            "name": name_of(path),
            "path": path,
            "type": node.kind,
            "properties": node.properties,
            "signals": node.signals,
            "children": children,
        }))
    }

    fn get_property(&self, path: &str, property: &str) -> Result<Value, HostError> {
        self.node(path)?
            .properties
            .get(property)
            .cloned()
            .ok_or_else(|| HostError::PropertyNotFound {
                path: path.to_string(),
                property: property.to_string(),
            })
    }

    fn set_property(&mut self, path: &str, property: &str, value: Value) -> Result<(), HostError> {
        let current = self.get_property(path, property)?;
        if !same_kind(&current, &value) {
            return Err(HostError::InvalidValue(format!(
                "{}:{} cannot hold {}",
                path, property, value
            )));
        }
        self.put(path, property, value);
        Ok(())
    }

    fn call_method(&mut self, path: &str, method: &str, args: &[Value]) -> Result<Value, HostError> {
        let node = self.node(path)?;
        let kind = node.kind;
        match (kind, method) {
            (_, "queue_free") => {
                if path == ROOT {
                    return Err(HostError::InvalidValue("the root cannot be freed".into()));
                }
                self.free(path);
                Ok(Value::Null)
            }
            (_, "get_children") => Ok(json!(self.children(path).map(name_of).collect::<Vec<_>>())),
            (_, "emit_signal") => {
                let Some(signal) = args.first().and_then(Value::as_str) else {
                    return Err(HostError::InvalidValue("emit_signal needs a signal name".into()));
                };
                if !node.signals.contains(&signal) {
                    return Err(HostError::EventNotFound {
                        path: path.to_string(),
                        event: signal.to_string(),
                    });
                }
                self.emit(path, signal, args[1..].to_vec());
                Ok(Value::Null)
            }
            ("Timer", "start") => {
                let wait_time = self.num(path, "wait_time");
                self.put(path, "time_left", json!(wait_time));
                self.put(path, "running", json!(true));
                Ok(Value::Null)
            }
            ("Timer", "stop") => {
                self.put(path, "running", json!(false));
                Ok(Value::Null)
            }
            ("CharacterBody2D", "reset") => {
                self.put(path, "position", json!([100.0, FLOOR_Y]));
                self.put(path, "velocity", json!([0.0, 0.0]));
                self.put(path, "on_floor", json!(true));
                self.put(path, "hp", json!(100));
                Ok(Value::Null)
            }
            _ => Err(HostError::MethodNotFound {
                path: path.to_string(),
                method: method.to_string(),
            }),
        }
    }

    fn evaluate(&mut self, expression: &str, target: Option<&str>) -> Result<Value, HostError> {
        Expr::parse(expression)
            .map_err(|e| HostError::Evaluation(e.to_string()))?
            .eval(&*self, target)
    }

    fn inject_input(&mut self, event: InputEvent) -> Result<(), HostError> {
        match event {
            InputEvent::Action {
                name,
                pressed,
                strength,
            } => self.press(&name, pressed, strength),
            InputEvent::Key { key, pressed } => {
                if let Some(action) = key_action(&key) {
                    self.press(action, pressed, 1.0);
                }
            }
            InputEvent::MouseMotion { position } => {
                if !position.iter().all(|c| c.is_finite()) {
                    return Err(HostError::InvalidValue("non-finite pointer position".into()));
                }
                self.input.pointer = position;
            }
            InputEvent::MouseButton {
                button,
                pressed,
                position,
            } => {
                if !position.iter().all(|c| c.is_finite()) {
                    return Err(HostError::InvalidValue("non-finite pointer position".into()));
                }
                self.input.pointer = position;
                if button == MouseButton::Left {
                    if pressed {
                        self.input.press_origin = Some(position);
                    } else {
                        self.click(position);
                    }
                }
            }
        }
        Ok(())
    }

    fn subscribe(&mut self, source: &str, event: &str, subscription: Subscription) -> Result<(), HostError> {
        let node = self.node(source)?;
        if !node.signals.contains(&event) {
            return Err(HostError::EventNotFound {
                path: source.to_string(),
                event: event.to_string(),
            });
        }
        self.listeners.push(Listener {
            source: source.to_string(),
            event: event.to_string(),
            subscription,
        });
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: SubscriptionId) {
        self.listeners
            .retain(|listener| listener.subscription.id() != subscription);
    }

    fn capture_frame(&mut self) -> Result<Vec<u8>, HostError> {
        if !self.display {
            return Err(HostError::Unsupported("running headless".into()));
        }
        let snapshot = json!({
            "frame": self.frame,
            "pointer": self.input.pointer,
            "tree": self.tree(ROOT, None),
        });
        serde_json::to_vec(&snapshot).map_err(|e| HostError::Unsupported(e.to_string()))
    }
}
