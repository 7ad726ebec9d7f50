//! Error types for allocator operations.

/// Errors that can occur during allocator operations.
///
/// Exhaustion (`OutOfSpace`) is an expected, frequent condition in a bounded
/// cache and is usually handled by evicting. `InvariantViolation` is never
/// expected and indicates corrupted bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// No free range large enough was found.
    #[error("out of space: no free range for {requested} bytes")]
    OutOfSpace {
        /// Requested size in bytes.
        requested: usize,
    },

    /// The request is larger than anything the allocator could ever hold.
    #[error("oversized request: {requested} bytes exceeds limit of {limit} bytes")]
    OversizedRequest {
        /// Requested size in bytes.
        requested: usize,
        /// Largest size the allocator accepts.
        limit: usize,
    },

    /// Zero-length payloads cannot be placed.
    #[error("empty payload")]
    EmptyPayload,

    /// An in-place update was asked to grow past the pointer's capacity.
    #[error("capacity exceeded: {requested} bytes does not fit in {capacity} bytes")]
    CapacityExceeded {
        /// Requested payload size in bytes.
        requested: usize,
        /// Capacity of the existing range in bytes.
        capacity: usize,
    },

    /// The pointer was freed (or the region cleared) after it was issued.
    #[error("stale pointer")]
    StalePointer,

    /// The pointer names a region this manager does not own.
    #[error("unknown region {0}")]
    UnknownRegion(u32),

    /// Internal bookkeeping is inconsistent.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The allocator was configured with unusable parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AllocError {
    /// Returns true for errors that mean "no room right now".
    ///
    /// These are the errors an allocation policy retries on another region.
    #[inline]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. })
    }
}

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for [`Config`](crate::Config).
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for AllocError {
    fn from(e: ConfigError) -> Self {
        AllocError::InvalidConfig(e.to_string())
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            AllocError::OutOfSpace { requested: 10 }.to_string(),
            "out of space: no free range for 10 bytes"
        );
        assert_eq!(
            AllocError::OversizedRequest {
                requested: 200,
                limit: 100
            }
            .to_string(),
            "oversized request: 200 bytes exceeds limit of 100 bytes"
        );
        assert_eq!(
            AllocError::CapacityExceeded {
                requested: 12,
                capacity: 10
            }
            .to_string(),
            "capacity exceeded: 12 bytes does not fit in 10 bytes"
        );
        assert_eq!(AllocError::StalePointer.to_string(), "stale pointer");
        assert_eq!(AllocError::UnknownRegion(7).to_string(), "unknown region 7");
    }

    #[test]
    fn test_is_exhaustion() {
        assert!(AllocError::OutOfSpace { requested: 1 }.is_exhaustion());
        assert!(!AllocError::StalePointer.is_exhaustion());
        assert!(
            !AllocError::OversizedRequest {
                requested: 2,
                limit: 1
            }
            .is_exhaustion()
        );
    }

    #[test]
    fn test_config_error_converts() {
        let err: AllocError = ConfigError::Invalid("regions must be > 0".into()).into();
        assert!(matches!(err, AllocError::InvalidConfig(msg) if msg.contains("regions")));
    }

    #[test]
    fn test_error_is_error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<AllocError>();
        assert_error::<ConfigError>();
    }
}
