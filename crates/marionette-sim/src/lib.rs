//! marionette-sim: a small 2D scene that embeds the marionette agent.
//!
//! The demo scene holds a player, a timer, a coin and a button. State changes
//! inside [`Scene::step`] or through the agent, and nodes can be freed while an
//! automation request is waiting on them.

pub mod expr;
pub mod logging;
pub mod scene;

pub use scene::Scene;
