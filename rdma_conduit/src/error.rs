//! Errors returned by the control plane.
//!
//! Everything that can fail synchronously (device setup, posting a work request,
//! bounds validation, the TCP handshake) surfaces as an [`Error`]. Failures the
//! hardware reports asynchronously are not errors here; they are observed through
//! [`crate::RequestToken::was_successful`].

use crate::queue_pair::QueuePairState;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that occur while driving an RDMA device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device call failed. Carries the OS error reported by the driver.
    #[error("{operation} failed: {source}")]
    Device {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("no RDMA device available{}", .0.as_ref().map(|name| format!(" named '{}'", name)).unwrap_or_default())]
    NoDevice(Option<String>),

    /// A transfer would touch bytes outside a region.
    #[error(
        "transfer of {requested} bytes at offset {offset} exceeds {side} region of {available} bytes"
    )]
    OutOfBounds {
        side: RegionSide,
        offset: u64,
        requested: u64,
        available: u64,
    },

    /// A single work request cannot describe more than `u32::MAX` bytes.
    #[error("transfer of {0} bytes does not fit in a single work request")]
    TransferTooLarge(u64),

    #[error("{requested} scatter-gather elements requested, device supports {supported}")]
    TooManyElements { requested: usize, supported: u32 },

    /// Data transfer was attempted before the queue pair reached ready-to-send.
    #[error("queue pair {queue_pair_number} is not activated (state: {state})")]
    NotActivated {
        queue_pair_number: u32,
        state: QueuePairState,
    },

    /// `activate` was called on a queue pair that already left INIT.
    #[error("queue pair {queue_pair_number} cannot be activated from state {state}")]
    AlreadyActivated {
        queue_pair_number: u32,
        state: QueuePairState,
    },

    #[error("connection user data of {size} bytes must be smaller than {limit} bytes")]
    UserDataTooLarge { size: usize, limit: usize },

    /// The region does not own its registration and cannot be re-registered.
    #[error("only memory registered by this buffer can be resized")]
    NotRegistrationOwner,

    #[error("atomic operations require {0}")]
    InvalidAtomicTarget(&'static str),

    /// The bootstrap exchange over TCP failed.
    #[error("queue pair handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error(transparent)]
    Codec(#[from] bincode::Error),

    /// An uncategorized error from an underlying system.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which side of a transfer a bounds violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSide {
    Local,
    Remote,
}

impl std::fmt::Display for RegionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionSide::Local => write!(f, "local"),
            RegionSide::Remote => write!(f, "remote"),
        }
    }
}

impl Error {
    /// Wraps the last OS error as a failed device operation.
    #[cfg_attr(not(feature = "ibverbs"), allow(dead_code))]
    pub(crate) fn last_os_error(operation: &'static str) -> Self {
        Error::Device {
            operation,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Builds a device error with a custom message, for providers that do not set errno.
    pub(crate) fn device(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Device {
            operation,
            source: std::io::Error::new(std::io::ErrorKind::Other, message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_bounds_display() {
        let err = Error::OutOfBounds {
            side: RegionSide::Remote,
            offset: 16,
            requested: 64,
            available: 32,
        };
        assert_eq!(
            err.to_string(),
            "transfer of 64 bytes at offset 16 exceeds remote region of 32 bytes"
        );
    }

    #[test]
    fn test_no_device_display() {
        assert_eq!(
            Error::NoDevice(None).to_string(),
            "no RDMA device available"
        );
        assert_eq!(
            Error::NoDevice(Some("mlx5_0".to_string())).to_string(),
            "no RDMA device available named 'mlx5_0'"
        );
    }

    #[test]
    fn test_device_error_keeps_source() {
        let err = Error::device("ibv_reg_mr", "bad address");
        assert!(err.to_string().contains("ibv_reg_mr failed"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
