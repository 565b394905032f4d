//! Resumable operations behind asynchronous handlers.
//!
//! Each operation is a small state machine the agent resumes from `tick` when
//! its wake time arrives, or when a host event for its subscription shows up.
//! Nothing here sleeps: waiting is returning [`Step::Yield`] with the next
//! wake time.

use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};

use crate::bridge::protocol::RpcError;
use crate::host::{Host, HostError, HostEvent, InputEvent, MouseButton, Point, SubscriptionId};

/// Outcome of resuming an operation.
#[derive(Debug, PartialEq)]
pub enum Step {
    Yield(Instant),
    Complete(Result<Value, RpcError>),
}

#[derive(Debug)]
pub enum Operation {
    TimedWait(TimedWait),
    Interpolation(Interpolation),
    ConditionPoll(ConditionPoll),
    EventWait(EventWait),
}

impl Operation {
    pub fn resume(&mut self, host: &mut dyn Host, now: Instant, started_at: Instant) -> Step {
        match self {
            Self::TimedWait(op) => op.resume(host, now, started_at),
            Self::Interpolation(op) => op.resume(host, now, started_at),
            Self::ConditionPoll(op) => op.resume(host, now, started_at),
            Self::EventWait(op) => op.resume(host, now, started_at),
        }
    }

    /// React to a host event routed to this operation's subscription.
    pub fn on_host_event(
        &mut self,
        host: &mut dyn Host,
        event: HostEvent,
        now: Instant,
        started_at: Instant,
    ) -> Option<Step> {
        match self {
            Self::EventWait(op) => Some(op.on_host_event(host, event, now, started_at)),
            _ => None,
        }
    }

    /// Undo side effects after the connection went away. No response follows.
    pub fn abort(&mut self, host: &mut dyn Host) {
        match self {
            Self::TimedWait(op) => op.abort(host),
            Self::Interpolation(op) => op.abort(host),
            Self::ConditionPoll(_) => {}
            Self::EventWait(op) => op.abort(host),
        }
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        match self {
            Self::EventWait(op) => Some(op.subscription),
            _ => None,
        }
    }
}

fn elapsed_ms(now: Instant, started_at: Instant) -> u64 {
    now.saturating_duration_since(started_at).as_millis() as u64
}

fn release(host: &mut dyn Host, event: InputEvent) {
    if let Err(e) = host.inject_input(event) {
        tracing::warn!(error = %e, "Failed to release held input");
    }
}

/// Loose truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Wait a fixed duration, then perform one deferred action and reply.
#[derive(Debug)]
pub struct TimedWait {
    deferred: Option<InputEvent>,
    reply: Map<String, Value>,
    elapsed_field: &'static str,
}

impl TimedWait {
    /// `reply` must be an object; the measured wait is added as `elapsed_field`.
    pub fn new(deferred: Option<InputEvent>, reply: Value, elapsed_field: &'static str) -> Self {
        let reply = match reply {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            deferred,
            reply,
            elapsed_field,
        }
    }

    fn resume(&mut self, host: &mut dyn Host, now: Instant, started_at: Instant) -> Step {
        if let Some(event) = self.deferred.take()
            && let Err(e) = host.inject_input(event)
        {
            return Step::Complete(Err(e.into()));
        }
        let mut reply = std::mem::take(&mut self.reply);
        reply.insert(self.elapsed_field.to_string(), json!(elapsed_ms(now, started_at)));
        Step::Complete(Ok(Value::Object(reply)))
    }

    fn abort(&mut self, host: &mut dyn Host) {
        if let Some(event) = self.deferred.take() {
            release(host, event);
        }
    }
}

/// Linear interpolation between two endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum Lerp {
    Scalar { from: f64, to: f64 },
    Vector { from: Vec<f64>, to: Vec<f64> },
}

fn numbers(value: &Value) -> Option<Vec<f64>> {
    value.as_array()?.iter().map(Value::as_f64).collect()
}

impl Lerp {
    /// Numbers, or equal-length arrays of numbers. Anything else is not interpolable.
    pub fn between(from: &Value, to: &Value) -> Option<Self> {
        if let (Some(from), Some(to)) = (from.as_f64(), to.as_f64()) {
            return Some(Self::Scalar { from, to });
        }
        let (from, to) = (numbers(from)?, numbers(to)?);
        (from.len() == to.len() && !from.is_empty()).then_some(Self::Vector { from, to })
    }

    pub fn points(from: Point, to: Point) -> Self {
        Self::Vector {
            from: from.to_vec(),
            to: to.to_vec(),
        }
    }

    fn mix(a: f64, b: f64, t: f64) -> f64 {
        a + (b - a) * t
    }

    pub fn at(&self, t: f64) -> Value {
        match self {
            Self::Scalar { from, to } => json!(Self::mix(*from, *to, t)),
            Self::Vector { from, to } => Value::Array(
                from.iter()
                    .zip(to)
                    .map(|(a, b)| json!(Self::mix(*a, *b, t)))
                    .collect(),
            ),
        }
    }

    fn point_at(&self, t: f64) -> Point {
        match self.at(t).as_array().map(Vec::as_slice) {
            Some([x, y, ..]) => [x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0)],
            _ => [0.0, 0.0],
        }
    }
}

/// `max(1, ceil(duration / tick))`.
pub fn step_count(duration: Duration, tick: Duration) -> u32 {
    if tick.is_zero() {
        return 1;
    }
    let steps = duration.as_nanos().div_ceil(tick.as_nanos());
    steps.clamp(1, u32::MAX as u128) as u32
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpolationTarget {
    /// Drag with `button` held; released after the last step.
    Pointer { button: MouseButton },
    Property { path: String, property: String },
}

/// Apply one interpolated update per tick, then reply after the last step.
#[derive(Debug)]
pub struct Interpolation {
    target: InterpolationTarget,
    lerp: Lerp,
    /// Exact final value, so the last step lands on what the caller asked for.
    end: Value,
    steps: u32,
    step: u32,
    tick: Duration,
}

impl Interpolation {
    pub fn new(target: InterpolationTarget, lerp: Lerp, end: Value, steps: u32, tick: Duration) -> Self {
        Self {
            target,
            lerp,
            end,
            steps: steps.max(1),
            step: 0,
            tick,
        }
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    fn progress(&self) -> f64 {
        self.step as f64 / self.steps as f64
    }

    fn resume(&mut self, host: &mut dyn Host, now: Instant, started_at: Instant) -> Step {
        self.step += 1;
        let last = self.step >= self.steps;
        let value = if last {
            self.end.clone()
        } else {
            self.lerp.at(self.progress())
        };

        let applied = match &self.target {
            InterpolationTarget::Pointer { .. } => host.inject_input(InputEvent::MouseMotion {
                position: self.lerp.point_at(self.progress()),
            }),
            InterpolationTarget::Property { path, property } => {
                if !host.node_exists(path) {
                    Err(HostError::Invalidated(path.clone()))
                } else {
                    host.set_property(path, property, value.clone())
                }
            }
        };
        if let Err(e) = applied {
            self.abort(host);
            return Step::Complete(Err(e.into()));
        }

        if !last {
            return Step::Yield(now + self.tick);
        }

        let elapsed = elapsed_ms(now, started_at);
        let reply = match &self.target {
            InterpolationTarget::Pointer { button } => {
                let position = self.lerp.point_at(1.0);
                if let Err(e) = host.inject_input(InputEvent::MouseButton {
                    button: *button,
                    pressed: false,
                    position,
                }) {
                    return Step::Complete(Err(e.into()));
                }
                json!({
                    "from": self.lerp.at(0.0),
                    "to": self.lerp.at(1.0),
                    "steps": self.steps,
                    "elapsed_ms": elapsed,
                })
            }
            InterpolationTarget::Property { path, property } => json!({
                "path": path,
                "property": property,
                "value": value,
                "steps": self.steps,
                "elapsed_ms": elapsed,
            }),
        };
        Step::Complete(Ok(reply))
    }

    fn abort(&mut self, host: &mut dyn Host) {
        if let InterpolationTarget::Pointer { button } = self.target {
            release(
                host,
                InputEvent::MouseButton {
                    button,
                    pressed: false,
                    position: self.lerp.point_at(self.progress()),
                },
            );
        }
    }
}

/// Re-evaluate a predicate on an interval until it is truthy or time runs out.
#[derive(Debug)]
pub struct ConditionPoll {
    expression: String,
    target: Option<String>,
    interval: Duration,
    deadline: Instant,
}

impl ConditionPoll {
    pub fn new(expression: String, target: Option<String>, interval: Duration, deadline: Instant) -> Self {
        Self {
            expression,
            target,
            interval,
            deadline,
        }
    }

    fn resume(&mut self, host: &mut dyn Host, now: Instant, started_at: Instant) -> Step {
        if let Some(target) = &self.target
            && !host.node_exists(target)
        {
            return Step::Complete(Err(RpcError::target_invalidated(format!(
                "target {} was freed while waiting",
                target
            ))));
        }

        match host.evaluate(&self.expression, self.target.as_deref()) {
            Ok(value) if truthy(&value) => {
                return Step::Complete(Ok(json!({
                    "satisfied": true,
                    "value": value,
                    "elapsed_ms": elapsed_ms(now, started_at),
                })));
            }
            Ok(_) => {}
            Err(e @ (HostError::Invalidated(_) | HostError::NodeNotFound(_))) => {
                return Step::Complete(Err(RpcError::target_invalidated(e)));
            }
            Err(e) => return Step::Complete(Err(e.into())),
        }

        if now >= self.deadline {
            return Step::Complete(Ok(json!({
                "satisfied": false,
                "timeout": true,
                "elapsed_ms": elapsed_ms(now, started_at),
            })));
        }

        Step::Yield((now + self.interval).min(self.deadline))
    }
}

/// One-shot wait for a host event.
#[derive(Debug)]
pub struct EventWait {
    subscription: SubscriptionId,
    source: String,
    event: String,
    max_args: usize,
    deadline: Instant,
    attached: bool,
}

impl EventWait {
    pub fn new(
        subscription: SubscriptionId,
        source: impl Into<String>,
        event: impl Into<String>,
        max_args: usize,
        deadline: Instant,
    ) -> Self {
        Self {
            subscription,
            source: source.into(),
            event: event.into(),
            max_args,
            deadline,
            attached: true,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn detach(&mut self, host: &mut dyn Host) {
        if std::mem::take(&mut self.attached) {
            host.unsubscribe(self.subscription);
        }
    }

    fn invalidated(&self) -> RpcError {
        RpcError::target_invalidated(format!(
            "event source {} was freed while waiting for '{}'",
            self.source, self.event
        ))
    }

    /// Only runs at the deadline.
    fn resume(&mut self, host: &mut dyn Host, now: Instant, started_at: Instant) -> Step {
        if now < self.deadline {
            return Step::Yield(self.deadline);
        }
        self.detach(host);
        if !host.node_exists(&self.source) {
            return Step::Complete(Err(self.invalidated()));
        }
        Step::Complete(Ok(json!({
            "received": false,
            "timeout": true,
            "elapsed_ms": elapsed_ms(now, started_at),
        })))
    }

    fn on_host_event(
        &mut self,
        host: &mut dyn Host,
        event: HostEvent,
        now: Instant,
        started_at: Instant,
    ) -> Step {
        self.detach(host);
        match event {
            HostEvent::Fired { mut args, .. } => {
                args.truncate(self.max_args);
                Step::Complete(Ok(json!({
                    "received": true,
                    "args": args,
                    "elapsed_ms": elapsed_ms(now, started_at),
                })))
            }
            HostEvent::SourceDestroyed { .. } => Step::Complete(Err(self.invalidated())),
        }
    }

    fn abort(&mut self, host: &mut dyn Host) {
        self.detach(host);
    }
}
