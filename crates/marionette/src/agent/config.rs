use std::time::Duration;

/// Agent settings. Fixed for the agent's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    /// Enables `evaluate`, `call_method` and `wait_for_condition`.
    pub unsafe_mode: bool,
    /// Lower bound for condition-poll intervals.
    pub min_poll_interval: Duration,
    pub default_poll_interval: Duration,
    /// Step granularity of interpolated sequences.
    pub interpolation_tick: Duration,
    pub default_hold: Duration,
    pub default_drag: Duration,
    /// Timeout for condition polls and event waits that don't name one.
    pub default_wait_timeout: Duration,
    pub max_wait: Duration,
    /// Inbound messages dispatched per tick; the rest wait for the next frame.
    pub max_messages_per_tick: usize,
    pub max_event_args: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9080,
            unsafe_mode: false,
            min_poll_interval: Duration::from_millis(16),
            default_poll_interval: Duration::from_millis(100),
            interpolation_tick: Duration::from_millis(16),
            default_hold: Duration::from_millis(100),
            default_drag: Duration::from_millis(250),
            default_wait_timeout: Duration::from_secs(5),
            max_wait: Duration::from_secs(600),
            max_messages_per_tick: 32,
            max_event_args: 16,
        }
    }
}

fn truthy_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

impl AgentConfig {
    /// Defaults overlaid with `MARIONETTE_HOST`, `MARIONETTE_PORT` and `MARIONETTE_UNSAFE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("MARIONETTE_HOST")
            && !host.is_empty()
        {
            config.host = host;
        }

        if let Ok(raw) = std::env::var("MARIONETTE_PORT") {
            match raw.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(e) => tracing::warn!(value = %raw, error = %e, "Ignoring invalid MARIONETTE_PORT"),
            }
        }

        if let Ok(raw) = std::env::var("MARIONETTE_UNSAFE") {
            config.unsafe_mode = truthy_flag(&raw);
        }

        config
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_unsafe_mode(mut self, unsafe_mode: bool) -> Self {
        self.unsafe_mode = unsafe_mode;
        self
    }

    pub fn with_interpolation_tick(mut self, tick: Duration) -> Self {
        self.interpolation_tick = tick;
        self
    }

    pub fn with_default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout = timeout;
        self
    }

    pub fn with_max_messages_per_tick(mut self, max: usize) -> Self {
        self.max_messages_per_tick = max.max(1);
        self
    }
}
