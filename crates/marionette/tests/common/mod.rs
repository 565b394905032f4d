//! Shared fixtures: a small host and an agent running on a tokio task.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use marionette::{
    Agent, AgentConfig, ClientConfig, Host, HostError, HostInfo, InputEvent, Listener,
    Subscription, SubscriptionId,
};
use serde_json::{Value, json};

/// Nodes with properties. `/root/Button` fires `pressed` as soon as anyone
/// subscribes; expressions are JSON literals.
#[derive(Default)]
pub struct TestHost {
    nodes: BTreeMap<String, BTreeMap<String, Value>>,
    subscriptions: Vec<Subscription>,
    frame: u64,
}

impl TestHost {
    pub fn new() -> Self {
        let mut host = Self::default();
        for path in ["/root", "/root/Player", "/root/Button"] {
            host.nodes.insert(path.to_string(), BTreeMap::new());
        }
        if let Some(player) = host.nodes.get_mut("/root/Player") {
            player.insert("hp".to_string(), json!(100));
        }
        host
    }
}

impl Host for TestHost {
    fn info(&self) -> HostInfo {
        HostInfo::new("test").with_project("e2e")
    }

    fn frame(&self) -> u64 {
        self.frame
    }

    fn scene_tree(&self, _root: Option<&str>, _max_depth: Option<usize>) -> Result<Value, HostError> {
        Ok(json!({"nodes": self.nodes.keys().collect::<Vec<_>>()}))
    }

    fn node_exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn describe_node(&self, path: &str) -> Result<Value, HostError> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| HostError::NodeNotFound(path.to_string()))?;
        Ok(json!({"path": path, "properties": node}))
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
        self.nodes
            .get_mut(path)
            .ok_or_else(|| HostError::NodeNotFound(path.to_string()))?
            .insert(property.to_string(), value);
        Ok(())
    }

    fn call_method(&mut self, path: &str, method: &str, _args: &[Value]) -> Result<Value, HostError> {
        Err(HostError::MethodNotFound {
            path: path.to_string(),
            method: method.to_string(),
        })
    }

    fn evaluate(&mut self, expression: &str, _target: Option<&str>) -> Result<Value, HostError> {
        serde_json::from_str(expression).map_err(|e| HostError::Evaluation(e.to_string()))
    }

    fn inject_input(&mut self, _event: InputEvent) -> Result<(), HostError> {
        Ok(())
    }

    fn subscribe(&mut self, source: &str, event: &str, subscription: Subscription) -> Result<(), HostError> {
        if source == "/root/Button" && event == "pressed" {
            subscription.fire(vec![json!("left"), json!(2)]);
        }
        self.subscriptions.push(subscription);
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: SubscriptionId) {
        self.subscriptions.retain(|s| s.id() != subscription);
    }
}

/// An agent bound to an ephemeral port, ticking every 2ms until dropped.
pub struct RunningAgent {
    pub listener: Listener,
    task: tokio::task::JoinHandle<()>,
}

impl RunningAgent {
    pub async fn start(config: AgentConfig) -> Self {
        let (mut agent, listener) = Agent::bind(config.with_port(0)).await.unwrap();
        let task = tokio::spawn(async move {
            let mut host = TestHost::new();
            let mut frames = tokio::time::interval(Duration::from_millis(2));
            loop {
                frames.tick().await;
                host.frame += 1;
                agent.tick(&mut host, Instant::now());
            }
        });
        Self { listener, task }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.listener.local_addr().port())
    }
}

impl Drop for RunningAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}
