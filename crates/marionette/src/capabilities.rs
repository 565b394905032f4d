//! Capability negotiation and the method catalog.
//!
//! The catalog is shared by both ends: the agent uses it to route and gate
//! requests, the client uses it to fail fast when a method's capability tag is
//! missing from the negotiated set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::version::HostInfo;

pub const PROTOCOL_VERSION: u32 = 1;

/// Capability tags reported in the handshake.
pub mod tags {
    pub const INPUT: &str = "input";
    pub const SCENE_TREE: &str = "scene_tree";
    pub const STATE: &str = "state";
    pub const WAIT: &str = "wait";
    /// Only when the agent runs in unsafe mode.
    pub const EVALUATE: &str = "evaluate";
    /// Only when the host has a display surface.
    pub const SCREENSHOT: &str = "screenshot";
}

/// Static description of one protocol method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    /// Tag that must be negotiated before the client may issue this method.
    pub capability: Option<&'static str>,
    /// Rejected with `UNSAFE_MODE_REQUIRED` unless the agent runs in unsafe mode.
    pub requires_unsafe: bool,
}

const fn method(
    name: &'static str,
    capability: Option<&'static str>,
    requires_unsafe: bool,
) -> MethodSpec {
    MethodSpec {
        name,
        capability,
        requires_unsafe,
    }
}

pub const METHODS: &[MethodSpec] = &[
    method("hello", None, false),
    method("ping", None, false),
    method("get_scene_tree", Some(tags::SCENE_TREE), false),
    method("get_node", Some(tags::SCENE_TREE), false),
    method("get_property", Some(tags::STATE), false),
    method("set_property", Some(tags::STATE), false),
    method("call_method", Some(tags::STATE), true),
    method("tween_property", Some(tags::STATE), false),
    method("evaluate", Some(tags::EVALUATE), true),
    method("press_action", Some(tags::INPUT), false),
    method("press_key", Some(tags::INPUT), false),
    method("mouse_click", Some(tags::INPUT), false),
    method("mouse_drag", Some(tags::INPUT), false),
    method("wait", Some(tags::WAIT), false),
    method("wait_for_condition", Some(tags::WAIT), true),
    method("wait_for_event", Some(tags::WAIT), false),
    method("screenshot", Some(tags::SCREENSHOT), false),
];

pub fn lookup(name: &str) -> Option<&'static MethodSpec> {
    METHODS.iter().find(|m| m.name == name)
}

/// Capability tag a method needs, if any. Unknown methods need none.
pub fn required_capability(name: &str) -> Option<&'static str> {
    lookup(name).and_then(|m| m.capability)
}

/// Feature set negotiated once per connection by `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub protocol_version: u32,
    pub capabilities: BTreeSet<String>,
    pub unsafe_mode: bool,
    pub host: HostInfo,
    /// Unique per connection; lets a controller tell reconnects apart.
    pub session: String,
}

impl CapabilitySet {
    pub fn negotiate(host: HostInfo, has_display: bool, unsafe_mode: bool, session: String) -> Self {
        let mut capabilities: BTreeSet<String> = [tags::INPUT, tags::SCENE_TREE, tags::STATE, tags::WAIT]
            .into_iter()
            .map(str::to_string)
            .collect();
        if has_display {
            capabilities.insert(tags::SCREENSHOT.to_string());
        }
        if unsafe_mode {
            capabilities.insert(tags::EVALUATE.to_string());
        }

        Self {
            protocol_version: PROTOCOL_VERSION,
            capabilities,
            unsafe_mode,
            host,
            session,
        }
    }

    pub fn has(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }

    /// `Err(tag)` when `method` needs a tag this set does not carry.
    pub fn check(&self, method: &str) -> Result<(), &'static str> {
        match required_capability(method) {
            Some(tag) if !self.has(tag) => Err(tag),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(has_display: bool, unsafe_mode: bool) -> CapabilitySet {
        CapabilitySet::negotiate(
            HostInfo::new("sim"),
            has_display,
            unsafe_mode,
            "session-1".to_string(),
        )
    }

    #[test]
    fn headless_safe_agent_reports_base_tags() {
        let caps = set(false, false);
        let tags: Vec<&str> = caps.capabilities.iter().map(String::as_str).collect();
        assert_eq!(tags, ["input", "scene_tree", "state", "wait"]);
        assert!(!caps.unsafe_mode);
    }

    #[test]
    fn display_and_unsafe_mode_add_tags() {
        let caps = set(true, true);
        assert!(caps.has(tags::SCREENSHOT));
        assert!(caps.has(tags::EVALUATE));
    }

    #[test]
    fn check_gates_on_missing_tag() {
        let caps = set(false, false);
        assert_eq!(caps.check("wait_for_event"), Ok(()));
        assert_eq!(caps.check("evaluate"), Err(tags::EVALUATE));
        assert_eq!(caps.check("screenshot"), Err(tags::SCREENSHOT));
        assert_eq!(caps.check("hello"), Ok(()));
        assert_eq!(caps.check("no_such_method"), Ok(()));
    }

    #[test]
    fn method_names_are_unique() {
        let names: BTreeSet<&str> = METHODS.iter().map(|m| m.name).collect();
        assert_eq!(names.len(), METHODS.len());
    }

    #[test]
    fn elevated_methods_require_unsafe() {
        for name in ["evaluate", "wait_for_condition", "call_method"] {
            assert!(lookup(name).unwrap().requires_unsafe, "{name}");
        }
    }

    #[test]
    fn capability_set_roundtrips() {
        let caps = set(true, false);
        let json = serde_json::to_string(&caps).unwrap();
        let back: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }
}
