//! Method handlers.
//!
//! A handler either answers on the spot with [`Dispatch::Reply`] or hands back
//! an [`Operation`] that the agent keeps in its pending table until it
//! completes. Handlers never block and never send anything themselves.

use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use super::Subscriptions;
use super::config::AgentConfig;
use super::ops::{
    ConditionPoll, EventWait, Interpolation, InterpolationTarget, Lerp, Operation, TimedWait,
    step_count,
};
use crate::bridge::protocol::RpcError;
use crate::capabilities::CapabilitySet;
use crate::host::{Host, InputEvent, MouseButton, Point};

/// What a handler decided.
#[derive(Debug)]
pub enum Dispatch {
    Reply(Value),
    Pending { operation: Operation, wake_at: Instant },
}

/// Per-connection state a handler may read or update.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub capabilities: Option<CapabilitySet>,
}

pub struct HandlerContext<'a> {
    pub host: &'a mut dyn Host,
    pub config: &'a AgentConfig,
    pub now: Instant,
    pub session: &'a mut Session,
    pub(super) subscriptions: &'a mut Subscriptions,
}

pub type HandlerFn = fn(&mut HandlerContext<'_>, Map<String, Value>) -> Result<Dispatch, RpcError>;

pub fn handler_for(method: &str) -> Option<HandlerFn> {
    let handler: HandlerFn = match method {
        "hello" => hello,
        "ping" => ping,
        "get_scene_tree" => get_scene_tree,
        "get_node" => get_node,
        "get_property" => get_property,
        "set_property" => set_property,
        "call_method" => call_method,
        "tween_property" => tween_property,
        "evaluate" => evaluate,
        "press_action" => press_action,
        "press_key" => press_key,
        "mouse_click" => mouse_click,
        "mouse_drag" => mouse_drag,
        "wait" => wait,
        "wait_for_condition" => wait_for_condition,
        "wait_for_event" => wait_for_event,
        "screenshot" => screenshot,
        _ => return None,
    };
    Some(handler)
}

fn params<T: DeserializeOwned>(params: Map<String, Value>) -> Result<T, RpcError> {
    serde_json::from_value(Value::Object(params)).map_err(RpcError::invalid_params)
}

fn millis(ms: Option<u64>, default: Duration) -> Duration {
    ms.map(Duration::from_millis).unwrap_or(default)
}

fn within_max_wait(config: &AgentConfig, duration: Duration) -> Result<(), RpcError> {
    if duration > config.max_wait {
        return Err(RpcError::invalid_params(format!(
            "duration_ms exceeds the maximum of {}",
            config.max_wait.as_millis()
        )));
    }
    Ok(())
}

fn require_node(host: &dyn Host, path: &str) -> Result<(), RpcError> {
    if host.node_exists(path) {
        Ok(())
    } else {
        Err(RpcError::not_found(format!("node not found: {}", path)))
    }
}

fn hello(ctx: &mut HandlerContext<'_>, _params: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let caps = match &ctx.session.capabilities {
        Some(caps) => caps.clone(),
        None => {
            let caps = CapabilitySet::negotiate(
                ctx.host.info(),
                ctx.host.has_display(),
                ctx.config.unsafe_mode,
                ctx.session.id.clone(),
            );
            tracing::info!(
                session = %caps.session,
                unsafe_mode = caps.unsafe_mode,
                capabilities = ?caps.capabilities,
                "Handshake complete"
            );
            ctx.session.capabilities = Some(caps.clone());
            caps
        }
    };
    serde_json::to_value(caps)
        .map(Dispatch::Reply)
        .map_err(RpcError::internal)
}

fn ping(ctx: &mut HandlerContext<'_>, _params: Map<String, Value>) -> Result<Dispatch, RpcError> {
    Ok(Dispatch::Reply(json!({"pong": true, "frame": ctx.host.frame()})))
}

#[derive(Deserialize)]
struct SceneTreeParams {
    root: Option<String>,
    max_depth: Option<usize>,
}

fn get_scene_tree(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: SceneTreeParams = params(p)?;
    let tree = ctx.host.scene_tree(p.root.as_deref(), p.max_depth)?;
    Ok(Dispatch::Reply(tree))
}

#[derive(Deserialize)]
struct NodeParams {
    path: String,
}

fn get_node(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: NodeParams = params(p)?;
    Ok(Dispatch::Reply(ctx.host.describe_node(&p.path)?))
}

#[derive(Deserialize)]
struct PropertyParams {
    path: String,
    property: String,
    #[serde(default)]
    value: Option<Value>,
}

fn get_property(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: PropertyParams = params(p)?;
    let value = ctx.host.get_property(&p.path, &p.property)?;
    Ok(Dispatch::Reply(
        json!({"path": p.path, "property": p.property, "value": value}),
    ))
}

fn set_property(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: PropertyParams = params(p)?;
    let Some(value) = p.value else {
        return Err(RpcError::invalid_params("missing field `value`"));
    };
    ctx.host.set_property(&p.path, &p.property, value)?;
    // Report what the host actually stored; it may coerce.
    let stored = ctx.host.get_property(&p.path, &p.property)?;
    Ok(Dispatch::Reply(
        json!({"path": p.path, "property": p.property, "value": stored}),
    ))
}

#[derive(Deserialize)]
struct CallParams {
    path: String,
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

fn call_method(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: CallParams = params(p)?;
    let result = ctx.host.call_method(&p.path, &p.method, &p.args)?;
    Ok(Dispatch::Reply(json!({"result": result})))
}

#[derive(Deserialize)]
struct EvaluateParams {
    expression: String,
    target: Option<String>,
}

fn evaluate(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: EvaluateParams = params(p)?;
    if let Some(target) = &p.target {
        require_node(ctx.host, target)?;
    }
    let value = ctx.host.evaluate(&p.expression, p.target.as_deref())?;
    Ok(Dispatch::Reply(json!({"value": value})))
}

#[derive(Deserialize)]
struct TweenParams {
    path: String,
    property: String,
    to: Value,
    duration_ms: u64,
}

fn tween_property(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: TweenParams = params(p)?;
    let duration = Duration::from_millis(p.duration_ms);
    within_max_wait(ctx.config, duration)?;
    let from = ctx.host.get_property(&p.path, &p.property)?;
    let Some(lerp) = Lerp::between(&from, &p.to) else {
        return Err(RpcError::invalid_params(format!(
            "cannot interpolate {} from {} to {}",
            p.property, from, p.to
        )));
    };
    let tick = ctx.config.interpolation_tick;
    let steps = step_count(duration, tick);
    let operation = Operation::Interpolation(Interpolation::new(
        InterpolationTarget::Property {
            path: p.path,
            property: p.property,
        },
        lerp,
        p.to,
        steps,
        tick,
    ));
    Ok(Dispatch::Pending {
        operation,
        wake_at: ctx.now + tick,
    })
}

/// Press now, release after `hold`.
fn hold_input(
    ctx: &mut HandlerContext<'_>,
    press: InputEvent,
    release: InputEvent,
    hold: Duration,
    reply: Value,
) -> Result<Dispatch, RpcError> {
    within_max_wait(ctx.config, hold)?;
    ctx.host.inject_input(press)?;
    Ok(Dispatch::Pending {
        operation: Operation::TimedWait(TimedWait::new(Some(release), reply, "held_ms")),
        wake_at: ctx.now + hold,
    })
}

#[derive(Deserialize)]
struct ActionParams {
    action: String,
    duration_ms: Option<u64>,
    strength: Option<f64>,
}

fn press_action(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: ActionParams = params(p)?;
    let strength = p.strength.unwrap_or(1.0);
    if !(0.0..=1.0).contains(&strength) {
        return Err(RpcError::invalid_params("strength must be within 0.0..=1.0"));
    }
    let hold = millis(p.duration_ms, ctx.config.default_hold);
    hold_input(
        ctx,
        InputEvent::Action {
            name: p.action.clone(),
            pressed: true,
            strength,
        },
        InputEvent::Action {
            name: p.action.clone(),
            pressed: false,
            strength: 0.0,
        },
        hold,
        json!({"action": p.action}),
    )
}

#[derive(Deserialize)]
struct KeyParams {
    key: String,
    duration_ms: Option<u64>,
}

fn press_key(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: KeyParams = params(p)?;
    if p.key.is_empty() {
        return Err(RpcError::invalid_params("key must not be empty"));
    }
    let hold = millis(p.duration_ms, ctx.config.default_hold);
    hold_input(
        ctx,
        InputEvent::Key {
            key: p.key.clone(),
            pressed: true,
        },
        InputEvent::Key {
            key: p.key.clone(),
            pressed: false,
        },
        hold,
        json!({"key": p.key}),
    )
}

#[derive(Deserialize)]
struct ClickParams {
    x: f64,
    y: f64,
    #[serde(default)]
    button: MouseButton,
    duration_ms: Option<u64>,
}

fn mouse_click(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: ClickParams = params(p)?;
    let position: Point = [p.x, p.y];
    let hold = millis(p.duration_ms, ctx.config.default_hold);
    within_max_wait(ctx.config, hold)?;
    ctx.host.inject_input(InputEvent::MouseMotion { position })?;
    hold_input(
        ctx,
        InputEvent::MouseButton {
            button: p.button,
            pressed: true,
            position,
        },
        InputEvent::MouseButton {
            button: p.button,
            pressed: false,
            position,
        },
        hold,
        json!({"position": position, "button": p.button}),
    )
}

#[derive(Deserialize)]
struct DragParams {
    from: Point,
    to: Point,
    duration_ms: Option<u64>,
    #[serde(default)]
    button: MouseButton,
}

fn mouse_drag(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: DragParams = params(p)?;
    let duration = millis(p.duration_ms, ctx.config.default_drag);
    within_max_wait(ctx.config, duration)?;
    let tick = ctx.config.interpolation_tick;

    ctx.host.inject_input(InputEvent::MouseMotion { position: p.from })?;
    ctx.host.inject_input(InputEvent::MouseButton {
        button: p.button,
        pressed: true,
        position: p.from,
    })?;

    let operation = Operation::Interpolation(Interpolation::new(
        InterpolationTarget::Pointer { button: p.button },
        Lerp::points(p.from, p.to),
        json!(p.to),
        step_count(duration, tick),
        tick,
    ));
    Ok(Dispatch::Pending {
        operation,
        wake_at: ctx.now + tick,
    })
}

#[derive(Deserialize)]
struct WaitParams {
    ms: u64,
}

fn wait(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: WaitParams = params(p)?;
    let duration = Duration::from_millis(p.ms);
    if duration > ctx.config.max_wait {
        return Err(RpcError::invalid_params(format!(
            "ms exceeds the maximum of {}",
            ctx.config.max_wait.as_millis()
        )));
    }
    Ok(Dispatch::Pending {
        operation: Operation::TimedWait(TimedWait::new(None, json!({}), "waited_ms")),
        wake_at: ctx.now + duration,
    })
}

#[derive(Deserialize)]
struct ConditionParams {
    expression: String,
    target: Option<String>,
    timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

fn wait_for_condition(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: ConditionParams = params(p)?;
    if p.expression.trim().is_empty() {
        return Err(RpcError::invalid_params("expression must not be empty"));
    }
    if let Some(target) = &p.target {
        require_node(ctx.host, target)?;
    }
    let timeout = millis(p.timeout_ms, ctx.config.default_wait_timeout).min(ctx.config.max_wait);
    let interval = millis(p.poll_interval_ms, ctx.config.default_poll_interval)
        .max(ctx.config.min_poll_interval);

    // First evaluation runs later in this same tick.
    Ok(Dispatch::Pending {
        operation: Operation::ConditionPoll(ConditionPoll::new(
            p.expression,
            p.target,
            interval,
            ctx.now + timeout,
        )),
        wake_at: ctx.now,
    })
}

#[derive(Deserialize)]
struct EventParams {
    source: String,
    event: String,
    timeout_ms: Option<u64>,
    max_args: Option<usize>,
}

fn wait_for_event(ctx: &mut HandlerContext<'_>, p: Map<String, Value>) -> Result<Dispatch, RpcError> {
    let p: EventParams = params(p)?;
    require_node(ctx.host, &p.source)?;
    let timeout = millis(p.timeout_ms, ctx.config.default_wait_timeout).min(ctx.config.max_wait);
    let max_args = p
        .max_args
        .unwrap_or(ctx.config.max_event_args)
        .min(ctx.config.max_event_args);

    let subscription = ctx.subscriptions.allocate();
    let id = subscription.id();
    ctx.host.subscribe(&p.source, &p.event, subscription)?;
    tracing::debug!(source = %p.source, event = %p.event, subscription = %id, "Subscribed");

    let deadline = ctx.now + timeout;
    Ok(Dispatch::Pending {
        operation: Operation::EventWait(EventWait::new(id, p.source, p.event, max_args, deadline)),
        wake_at: deadline,
    })
}

fn screenshot(ctx: &mut HandlerContext<'_>, _params: Map<String, Value>) -> Result<Dispatch, RpcError> {
    if !ctx.host.has_display() {
        return Err(RpcError::unsupported("screenshot requires a display surface"));
    }
    let bytes = ctx.host.capture_frame()?;
    Ok(Dispatch::Reply(json!({
        "format": "raw",
        "encoding": "base64",
        "bytes": bytes.len(),
        "data": BASE64.encode(&bytes),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{INVALID_PARAMS, NOT_FOUND, UNSUPPORTED};
    use crate::capabilities::METHODS;
    use crate::test_support::FakeHost;
    use tokio::sync::mpsc;

    struct Fixture {
        host: FakeHost,
        config: AgentConfig,
        session: Session,
        subscriptions: Subscriptions,
        now: Instant,
    }

    impl Fixture {
        fn new(host: FakeHost) -> Self {
            let (tx, _rx) = mpsc::unbounded_channel();
            Self {
                host,
                config: AgentConfig::default(),
                session: Session {
                    id: "s-1".into(),
                    capabilities: None,
                },
                subscriptions: Subscriptions::new(tx),
                now: Instant::now(),
            }
        }

        fn call(&mut self, method: &str, params: Value) -> Result<Dispatch, RpcError> {
            let Value::Object(params) = params else {
                panic!("params must be an object");
            };
            let handler = handler_for(method).unwrap();
            let mut ctx = HandlerContext {
                host: &mut self.host,
                config: &self.config,
                now: self.now,
                session: &mut self.session,
                subscriptions: &mut self.subscriptions,
            };
            handler(&mut ctx, params)
        }

        fn reply(&mut self, method: &str, params: Value) -> Value {
            match self.call(method, params) {
                Ok(Dispatch::Reply(value)) => value,
                other => panic!("expected reply, got {other:?}"),
            }
        }
    }

    #[test]
    fn every_catalog_method_has_a_handler() {
        for spec in METHODS {
            assert!(handler_for(spec.name).is_some(), "{}", spec.name);
        }
        assert!(handler_for("shutdown").is_none());
    }

    #[test]
    fn hello_is_cached_per_session() {
        let mut f = Fixture::new(FakeHost::new());
        let first = f.reply("hello", json!({}));
        f.config.unsafe_mode = true;
        let second = f.reply("hello", json!({}));
        assert_eq!(first, second);
        assert_eq!(first["protocol_version"], json!(1));
        assert_eq!(first["session"], json!("s-1"));
    }

    #[test]
    fn property_roundtrip() {
        let mut f = Fixture::new(FakeHost::new().with_node("/root/P", &[("hp", json!(10))]));
        let set = f.reply("set_property", json!({"path": "/root/P", "property": "hp", "value": 3}));
        assert_eq!(set["value"], json!(3));
        let get = f.reply("get_property", json!({"path": "/root/P", "property": "hp"}));
        insta::assert_json_snapshot!(get, @r#"
        {
          "path": "/root/P",
          "property": "hp",
          "value": 3
        }
        "#);
    }

    #[test]
    fn missing_params_are_invalid() {
        let mut f = Fixture::new(FakeHost::new());
        let err = f.call("get_property", json!({"path": "/root"})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        let err = f.call("set_property", json!({"path": "/root", "property": "x"})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        let err = f.call("wait", json!({"ms": -5})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[test]
    fn unknown_node_is_not_found() {
        let mut f = Fixture::new(FakeHost::new());
        let err = f.call("get_node", json!({"path": "/root/Nope"})).unwrap_err();
        assert_eq!(err.code, NOT_FOUND);
        let err = f
            .call("wait_for_condition", json!({"expression": "x", "target": "/root/Nope"}))
            .unwrap_err();
        assert_eq!(err.code, NOT_FOUND);
    }

    #[test]
    fn press_action_presses_now_and_defers_release() {
        let mut f = Fixture::new(FakeHost::new());
        let now = f.now;
        let Ok(Dispatch::Pending { wake_at, .. }) = f.call("press_action", json!({"action": "jump"})) else {
            panic!("expected pending");
        };
        assert_eq!(wake_at, now + Duration::from_millis(100));
        assert_eq!(
            f.host.inputs,
            vec![InputEvent::Action {
                name: "jump".into(),
                pressed: true,
                strength: 1.0
            }]
        );
    }

    #[test]
    fn press_action_rejects_bad_strength() {
        let mut f = Fixture::new(FakeHost::new());
        let err = f.call("press_action", json!({"action": "jump", "strength": 2.0})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(f.host.inputs.is_empty());
    }

    #[test]
    fn condition_poll_is_clamped_and_due_immediately() {
        let mut f = Fixture::new(FakeHost::new());
        let now = f.now;
        let Ok(Dispatch::Pending { wake_at, .. }) = f.call(
            "wait_for_condition",
            json!({"expression": "ready", "timeout_ms": 5, "poll_interval_ms": 1}),
        ) else {
            panic!("expected pending");
        };
        assert_eq!(wake_at, now);
    }

    #[test]
    fn tween_rejects_non_numeric_endpoints() {
        let mut f = Fixture::new(FakeHost::new().with_node("/root/L", &[("text", json!("hi"))]));
        let err = f
            .call(
                "tween_property",
                json!({"path": "/root/L", "property": "text", "to": "bye", "duration_ms": 100}),
            )
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[test]
    fn tween_duration_is_bounded_by_max_wait() {
        let mut f = Fixture::new(FakeHost::new().with_node("/root/P", &[("hp", json!(0))]));
        let too_long = f.config.max_wait.as_millis() as u64 + 1;
        let err = f
            .call(
                "tween_property",
                json!({"path": "/root/P", "property": "hp", "to": 10, "duration_ms": too_long}),
            )
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert_eq!(f.host.property("/root/P", "hp"), json!(0));
    }

    #[test]
    fn rejected_click_leaves_pointer_alone() {
        let mut f = Fixture::new(FakeHost::new());
        let too_long = f.config.max_wait.as_millis() as u64 + 1;
        let err = f
            .call("mouse_click", json!({"x": 5, "y": 5, "duration_ms": too_long}))
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(f.host.inputs.is_empty(), "{:?}", f.host.inputs);
    }

    #[test]
    fn wait_for_event_subscribes() {
        let mut f = Fixture::new(FakeHost::new().with_node("/root/Timer", &[]));
        let Ok(Dispatch::Pending { operation, .. }) =
            f.call("wait_for_event", json!({"source": "/root/Timer", "event": "timeout"}))
        else {
            panic!("expected pending");
        };
        assert_eq!(f.host.subscriptions.len(), 1);
        assert_eq!(operation.subscription(), Some(f.host.subscriptions[0].2.id()));
    }

    #[test]
    fn screenshot_needs_display() {
        let mut f = Fixture::new(FakeHost::new());
        assert_eq!(f.call("screenshot", json!({})).unwrap_err().code, UNSUPPORTED);

        let mut f = Fixture::new(FakeHost::new().with_display());
        let shot = f.reply("screenshot", json!({}));
        insta::assert_json_snapshot!(shot, @r#"
        {
          "bytes": 4,
          "data": "3q2+7w==",
          "encoding": "base64",
          "format": "raw"
        }
        "#);
    }
}
