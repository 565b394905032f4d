//! In-memory host for unit tests.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Value, json};

use crate::host::{Host, HostError, InputEvent, Subscription, SubscriptionId};
use crate::version::HostInfo;

#[derive(Default)]
pub(crate) struct FakeHost {
    pub nodes: BTreeMap<String, BTreeMap<String, Value>>,
    pub expressions: HashMap<String, Value>,
    pub inputs: Vec<InputEvent>,
    pub subscriptions: Vec<(String, String, Subscription)>,
    pub unsubscribed: Vec<SubscriptionId>,
    pub evaluations: usize,
    pub display: bool,
    pub frame: u64,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, path: &str, properties: &[(&str, Value)]) -> Self {
        self.nodes.insert(
            path.to_string(),
            properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        self
    }

    pub fn with_display(mut self) -> Self {
        self.display = true;
        self
    }

    pub fn set_expression(&mut self, expression: &str, value: Value) {
        self.expressions.insert(expression.to_string(), value);
    }

    pub fn property(&self, path: &str, property: &str) -> Value {
        self.nodes[path][property].clone()
    }

    /// Fire `event` on `path` for every live subscription.
    pub fn emit(&self, path: &str, event: &str, args: Vec<Value>) {
        for (source, name, sub) in &self.subscriptions {
            if source == path && name == event {
                sub.fire(args.clone());
            }
        }
    }

    pub fn destroy(&mut self, path: &str) {
        self.nodes.remove(path);
        for (source, _, sub) in &self.subscriptions {
            if source == path {
                sub.source_destroyed();
            }
        }
    }
}

impl Host for FakeHost {
    fn info(&self) -> HostInfo {
        HostInfo::new("fake")
    }

    fn has_display(&self) -> bool {
        self.display
    }

    fn frame(&self) -> u64 {
        self.frame
    }

    fn scene_tree(&self, root: Option<&str>, _max_depth: Option<usize>) -> Result<Value, HostError> {
        let root = root.unwrap_or("/root");
        let children: Vec<&String> = self.nodes.keys().filter(|p| p.starts_with(root)).collect();
        Ok(json!({"path": root, "nodes": children}))
    }

    fn node_exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn describe_node(&self, path: &str) -> Result<Value, HostError> {
        let props = self
            .nodes
            .get(path)
            .ok_or_else(|| HostError::NodeNotFound(path.to_string()))?;
        Ok(json!({"path": path, "properties": props}))
    }

    fn get_property(&self, path: &str, property: &str) -> Result<Value, HostError> {
        self.nodes
            .get(path)
            .ok_or_else(|| HostError::NodeNotFound(path.to_string()))?
            .get(property)
            .cloned()
            .ok_or_else(|| HostError::PropertyNotFound {
                path: path.to_string(),
                property: property.to_string(),
            })
    }

    fn set_property(&mut self, path: &str, property: &str, value: Value) -> Result<(), HostError> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| HostError::NodeNotFound(path.to_string()))?;
        node.insert(property.to_string(), value);
        Ok(())
    }

    fn call_method(&mut self, path: &str, method: &str, args: &[Value]) -> Result<Value, HostError> {
        if !self.node_exists(path) {
            return Err(HostError::NodeNotFound(path.to_string()));
        }
        match method {
            "echo" => Ok(Value::Array(args.to_vec())),
            _ => Err(HostError::MethodNotFound {
                path: path.to_string(),
                method: method.to_string(),
            }),
        }
    }

    fn evaluate(&mut self, expression: &str, _target: Option<&str>) -> Result<Value, HostError> {
        self.evaluations += 1;
        self.expressions
            .get(expression)
            .cloned()
            .ok_or_else(|| HostError::Evaluation(format!("cannot evaluate '{}'", expression)))
    }

    fn inject_input(&mut self, event: InputEvent) -> Result<(), HostError> {
        self.inputs.push(event);
        Ok(())
    }

    fn subscribe(&mut self, source: &str, event: &str, subscription: Subscription) -> Result<(), HostError> {
        if !self.node_exists(source) {
            return Err(HostError::NodeNotFound(source.to_string()));
        }
        self.subscriptions
            .push((source.to_string(), event.to_string(), subscription));
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: SubscriptionId) {
        self.subscriptions.retain(|(_, _, sub)| sub.id() != subscription);
        self.unsubscribed.push(subscription);
    }

    fn capture_frame(&mut self) -> Result<Vec<u8>, HostError> {
        if !self.display {
            return Err(HostError::Unsupported("no display".into()));
        }
        Ok(vec![0xde, 0xad, 0xbe, 0xef])
    }
}
