//! Container lifecycle states.

use porto_error::{PortoError, Result};

/// The lifecycle state of a container.
///
/// Exactly one state holds at any time; the holder is the only writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerState {
    /// Created or stopped; no kernel resources held.
    Stopped,
    /// Start in progress.
    Starting,
    /// Init process alive.
    Running,
    /// Frozen by the freezer.
    Paused,
    /// Stop in progress.
    Stopping,
    /// Init process exited on its own.
    Dead,
    /// Destroy in progress; the name is about to vanish.
    Destroying,
}

impl ContainerState {
    /// Bit of this state in a permitted-state mask.
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << self as u32
    }

    /// Whether cgroup nodes exist for a container in this state.
    #[must_use]
    pub const fn holds_resources(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Paused | Self::Stopping | Self::Dead
        )
    }

    /// Whether a `wait` on the container resolves immediately.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Dead)
    }
}

/// Builds a permitted-state mask.
#[must_use]
pub fn state_mask(states: &[ContainerState]) -> u32 {
    let mut mask = 0;
    let mut i = 0;
    while i < states.len() {
        mask |= states[i].bit();
        i += 1;
    }
    mask
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Dead => "dead",
            Self::Destroying => "destroying",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ContainerState {
    type Err = PortoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopping" => Ok(Self::Stopping),
            "dead" => Ok(Self::Dead),
            "destroying" => Ok(Self::Destroying),
            _ => Err(PortoError::invalid_value(format!(
                "invalid container state: {s}"
            ))),
        }
    }
}
