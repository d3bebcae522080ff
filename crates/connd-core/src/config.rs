//! Configuration types for connd
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};

/// Main connd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConndConfig {
    /// Kernel route feed settings
    #[serde(default)]
    pub rtnl: RtnlConfig,

    /// Helper task settings
    #[serde(default)]
    pub task: TaskConfig,

    /// RTNL delivery engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl ConndConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.rtnl.validate()?;
        self.task.validate()?;
        self.engine.validate()?;

        Ok(())
    }
}

/// Which kernel notification groups the route feed subscribes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtnlConfig {
    /// Link add/remove/change notifications
    #[serde(default = "default_true")]
    pub link_events: bool,

    /// IPv4 route notifications (default gateway tracking)
    #[serde(default = "default_true")]
    pub ipv4_routes: bool,

    /// IPv6 route notifications (default gateway tracking)
    #[serde(default = "default_true")]
    pub ipv6_routes: bool,

    /// Socket receive buffer size in bytes
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
}

impl RtnlConfig {
    /// Validate the route feed configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.link_events && !self.ipv4_routes && !self.ipv6_routes {
            return Err(crate::Error::config(
                "At least one RTNL notification group must be enabled",
            ));
        }
        if self.receive_buffer_size < MIN_RECEIVE_BUFFER_SIZE {
            return Err(crate::Error::config(format!(
                "RTNL receive buffer must be at least {} bytes, got {}",
                MIN_RECEIVE_BUFFER_SIZE, self.receive_buffer_size
            )));
        }
        Ok(())
    }
}

impl Default for RtnlConfig {
    fn default() -> Self {
        Self {
            link_events: true,
            ipv4_routes: true,
            ipv6_routes: true,
            receive_buffer_size: default_receive_buffer_size(),
        }
    }
}

/// Helper process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Prefix for task object paths (tasks become `{prefix}/{n}`)
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Bus name advertised to helpers in `CONND_BUSNAME`
    #[serde(default = "default_bus_name")]
    pub bus_name: String,

    /// Grace period between SIGTERM and SIGKILL after `stop()`
    ///
    /// Set to 0 to escalate immediately.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Start helpers with an empty environment plus their overrides
    #[serde(default = "default_true")]
    pub clear_environment: bool,
}

impl TaskConfig {
    /// Validate the task configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.path_prefix.starts_with('/') {
            return Err(crate::Error::config(format!(
                "Task path prefix must be absolute, got '{}'",
                self.path_prefix
            )));
        }
        if self.path_prefix.len() > 1 && self.path_prefix.ends_with('/') {
            return Err(crate::Error::config(format!(
                "Task path prefix must not end with '/', got '{}'",
                self.path_prefix
            )));
        }
        if self.bus_name.is_empty() {
            return Err(crate::Error::config("Task bus name cannot be empty"));
        }
        Ok(())
    }

    /// Interface name advertised to helpers in `CONND_INTERFACE`
    pub fn interface_name(&self) -> String {
        format!("{}.Task", self.bus_name)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            bus_name: default_bus_name(),
            stop_timeout_ms: default_stop_timeout_ms(),
            clear_environment: true,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the engine's monitoring event channel
    ///
    /// When full, new engine events are dropped (with a warning log).
    /// Route events themselves are never dropped.
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// How many consecutive times the daemon re-subscribes after losing the route feed
    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Engine event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            resubscribe_attempts: default_resubscribe_attempts(),
        }
    }
}

const MIN_RECEIVE_BUFFER_SIZE: usize = 4096;

fn default_true() -> bool {
    true
}

fn default_receive_buffer_size() -> usize {
    32 * 1024
}

fn default_path_prefix() -> String {
    "/task".to_string()
}

fn default_bus_name() -> String {
    "net.connd".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_resubscribe_attempts() -> u32 {
    3
}
