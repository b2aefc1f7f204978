//! Error types for the dispatcher

use core::fmt;

/// Result type for dispatcher operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors returned to producers and administrators
///
/// Every error returned from a dispatch or queue call means the unit has
/// already been disposed of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Target queue is at its configured limit
    NoBufferSpace,

    /// Classification consumed the unit without producing a usable one
    NoResources,

    /// Protocol registration or administration failed
    Register(RegisterError),

    /// Host topology call failed
    Topology(TopologyError),

    /// `start()` was already called
    AlreadyStarted,

    /// The dispatcher has been shut down
    Shutdown,

    /// Configuration rejected by validation
    InvalidConfig(&'static str),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::NoBufferSpace => write!(f, "no buffer space available"),
            DispatchError::NoResources => write!(f, "classification exhausted resources"),
            DispatchError::Register(e) => write!(f, "registration error: {}", e),
            DispatchError::Topology(e) => write!(f, "topology error: {}", e),
            DispatchError::AlreadyStarted => write!(f, "dispatcher already started"),
            DispatchError::Shutdown => write!(f, "dispatcher shut down"),
            DispatchError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Protocol registry errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// Protocol id is outside the registry table
    InvalidProtocol(u8),

    /// Protocol id is already registered
    AlreadyRegistered(u8),

    /// Both a CPU and a flow classifier were supplied
    ConflictingClassifiers(u8),

    /// Protocol id is not registered
    NotRegistered(u8),

    /// Queue limit is zero or above the configured maximum
    InvalidLimit(usize),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::InvalidProtocol(id) => write!(f, "protocol id {} out of range", id),
            RegisterError::AlreadyRegistered(id) => write!(f, "protocol {} already registered", id),
            RegisterError::ConflictingClassifiers(id) => {
                write!(f, "protocol {} has both cpu and flow classifiers", id)
            }
            RegisterError::NotRegistered(id) => write!(f, "protocol {} not registered", id),
            RegisterError::InvalidLimit(limit) => write!(f, "queue limit {} out of range", limit),
        }
    }
}

impl From<RegisterError> for DispatchError {
    fn from(e: RegisterError) -> Self {
        DispatchError::Register(e)
    }
}

/// Host topology errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Setting thread affinity failed with the given errno
    AffinityFailed(i32),

    /// CPU is not present in the host's online set
    CpuUnavailable(usize),

    /// Failed to spawn a worker thread
    SpawnFailed,
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::AffinityFailed(errno) => {
                write!(f, "failed to set thread affinity: errno {}", errno)
            }
            TopologyError::CpuUnavailable(cpu) => write!(f, "cpu {} unavailable", cpu),
            TopologyError::SpawnFailed => write!(f, "failed to spawn worker thread"),
        }
    }
}

impl From<TopologyError> for DispatchError {
    fn from(e: TopologyError) -> Self {
        DispatchError::Topology(e)
    }
}
