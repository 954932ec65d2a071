//! # porto-error
//!
//! The error taxonomy shared across porto crates.
//!
//! Every failure the daemon can report travels the wire as one of the
//! [`EError`] codes plus a human-readable message. Internal errors are
//! represented as [`PortoError`], which pairs a code with its message;
//! crate-specific failures are mapped into it at the point where they
//! become visible to a client.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use thiserror::Error;

/// Result type alias used across the porto crates.
pub type Result<T> = std::result::Result<T, PortoError>;

/// Wire-stable error codes.
///
/// The numeric values are part of the RPC contract and must never be
/// reordered. Codes that belong to subsystems the daemon does not ship
/// (layers, queues) stay reserved so existing clients keep decoding
/// responses correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EError {
    /// Operation completed.
    Success = 0,
    /// Unclassified internal failure.
    Unknown = 1,
    /// The request selected no known method.
    InvalidMethod = 2,
    /// A container with this name is already registered.
    ContainerAlreadyExists = 3,
    /// No container with this name is registered.
    ContainerDoesNotExist = 4,
    /// A value failed schema validation.
    InvalidValue = 5,
    /// The operation is not allowed in the container's current state.
    InvalidState = 6,
    /// The operation is recognized but not supported on this host.
    NotSupported = 7,
    /// A kernel resource could not be acquired.
    ResourceNotAvailable = 8,
    /// The caller's credentials do not permit the operation.
    Permission = 9,
    /// A volume with this path is already registered.
    VolumeAlreadyExists = 10,
    /// No volume with this path is registered.
    VolumeDoesNotExist = 11,
    /// Out of disk space.
    NoSpace = 12,
    /// The resource is busy; retrying later may succeed.
    Busy = 13,
    /// The volume is already linked to this container.
    VolumeAlreadyLinked = 14,
    /// The volume is not linked to this container.
    VolumeNotLinked = 15,
    /// Reserved: layer with this name already exists.
    LayerAlreadyExists = 16,
    /// Reserved: no layer with this name.
    LayerNotFound = 17,
    /// The requested property or data item has no value.
    NoValue = 18,
    /// Reserved: event queue overflow.
    QueueFull = 19,
    /// Reserved: the daemon is tainted.
    Taint = 20,
}

impl EError {
    /// Returns the wire code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decodes a wire code, falling back to `Unknown` for codes from a
    /// newer schema revision.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            2 => Self::InvalidMethod,
            3 => Self::ContainerAlreadyExists,
            4 => Self::ContainerDoesNotExist,
            5 => Self::InvalidValue,
            6 => Self::InvalidState,
            7 => Self::NotSupported,
            8 => Self::ResourceNotAvailable,
            9 => Self::Permission,
            10 => Self::VolumeAlreadyExists,
            11 => Self::VolumeDoesNotExist,
            12 => Self::NoSpace,
            13 => Self::Busy,
            14 => Self::VolumeAlreadyLinked,
            15 => Self::VolumeNotLinked,
            16 => Self::LayerAlreadyExists,
            17 => Self::LayerNotFound,
            18 => Self::NoValue,
            19 => Self::QueueFull,
            20 => Self::Taint,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for EError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::Unknown => "Unknown",
            Self::InvalidMethod => "InvalidMethod",
            Self::ContainerAlreadyExists => "ContainerAlreadyExists",
            Self::ContainerDoesNotExist => "ContainerDoesNotExist",
            Self::InvalidValue => "InvalidValue",
            Self::InvalidState => "InvalidState",
            Self::NotSupported => "NotSupported",
            Self::ResourceNotAvailable => "ResourceNotAvailable",
            Self::Permission => "Permission",
            Self::VolumeAlreadyExists => "VolumeAlreadyExists",
            Self::VolumeDoesNotExist => "VolumeDoesNotExist",
            Self::NoSpace => "NoSpace",
            Self::Busy => "Busy",
            Self::VolumeAlreadyLinked => "VolumeAlreadyLinked",
            Self::VolumeNotLinked => "VolumeNotLinked",
            Self::LayerAlreadyExists => "LayerAlreadyExists",
            Self::LayerNotFound => "LayerNotFound",
            Self::NoValue => "NoValue",
            Self::QueueFull => "QueueFull",
            Self::Taint => "Taint",
        };
        f.write_str(name)
    }
}

/// An error code paired with its human-readable message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct PortoError {
    /// Wire-stable code.
    pub code: EError,
    /// Diagnostic message delivered to the client verbatim.
    pub message: String,
}

impl PortoError {
    /// Creates an error with an explicit code.
    #[must_use]
    pub fn new(code: EError, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an `Unknown` error.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(EError::Unknown, message)
    }

    /// Creates an `InvalidValue` error.
    #[must_use]
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(EError::InvalidValue, message)
    }

    /// Creates an `InvalidState` error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(EError::InvalidState, message)
    }

    /// Creates a `ContainerDoesNotExist` error.
    #[must_use]
    pub fn no_container(name: impl std::fmt::Display) -> Self {
        Self::new(
            EError::ContainerDoesNotExist,
            format!("container {name} doesn't exist"),
        )
    }

    /// Creates a `ContainerAlreadyExists` error.
    #[must_use]
    pub fn container_exists(name: impl std::fmt::Display) -> Self {
        Self::new(
            EError::ContainerAlreadyExists,
            format!("container {name} already exists"),
        )
    }

    /// Creates a `Permission` error.
    #[must_use]
    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(EError::Permission, message)
    }

    /// Creates a `NotSupported` error.
    #[must_use]
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(EError::NotSupported, message)
    }

    /// Creates a `Busy` error.
    #[must_use]
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(EError::Busy, message)
    }

    /// Creates a `NoValue` error.
    #[must_use]
    pub fn no_value(message: impl Into<String>) -> Self {
        Self::new(EError::NoValue, message)
    }

    /// Creates a `VolumeDoesNotExist` error.
    #[must_use]
    pub fn no_volume(path: impl std::fmt::Display) -> Self {
        Self::new(
            EError::VolumeDoesNotExist,
            format!("volume {path} doesn't exist"),
        )
    }

    /// Returns true for `Permission`.
    #[must_use]
    pub fn is_permission(&self) -> bool {
        self.code == EError::Permission
    }

    /// Returns true for `InvalidState`.
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        self.code == EError::InvalidState
    }

    /// Returns true for `ContainerDoesNotExist`.
    #[must_use]
    pub fn is_no_container(&self) -> bool {
        self.code == EError::ContainerDoesNotExist
    }
}

impl From<std::io::Error> for PortoError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::permission(err.to_string()),
            std::io::ErrorKind::StorageFull => Self::new(EError::NoSpace, err.to_string()),
            _ => Self::unknown(err.to_string()),
        }
    }
}
