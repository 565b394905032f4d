//! Readiness lines printed by an embedded agent for its launcher.
//!
//! ```text
//! MARIONETTE_READY port=9080
//! MARIONETTE_ERROR port=9080 reason=address in use
//! ```

use std::fmt;

const READY: &str = "MARIONETTE_READY";
const ERROR: &str = "MARIONETTE_ERROR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentinel {
    Ready { port: u16 },
    Error { port: u16, reason: String },
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready { port } => write!(f, "{} port={}", READY, port),
            // Reason is the tail of the line, so it must stay on one line.
            Self::Error { port, reason } => {
                write!(f, "{} port={} reason={}", ERROR, port, reason.replace(['\r', '\n'], " "))
            }
        }
    }
}

impl Sentinel {
    /// Recognise a sentinel in one line of host output. Other lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (tag, rest) = line.split_once(' ')?;
        let rest = rest.strip_prefix("port=")?;
        match tag {
            READY => Some(Self::Ready {
                port: rest.trim().parse().ok()?,
            }),
            ERROR => {
                let (port, reason) = match rest.split_once(' ') {
                    Some((port, tail)) => (port, tail.strip_prefix("reason=").unwrap_or(tail)),
                    None => (rest, ""),
                };
                Some(Self::Error {
                    port: port.parse().ok()?,
                    reason: reason.to_string(),
                })
            }
            _ => None,
        }
    }
}
