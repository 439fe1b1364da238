use thiserror::Error;

/// Allocator failures.
///
/// `InvalidArgument` and `NotInitialized` are programmer errors: the call was wrong and
/// retrying it will not help. `OutOfMemory` means the backing store is exhausted and is
/// the variant callers may want to handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of memory: `{allocator}` cannot satisfy {requested} bytes")]
    OutOfMemory { allocator: String, requested: usize },

    #[error("No {0} allocator installed on this thread")]
    NotInitialized(&'static str),
}

impl AllocError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        AllocError::InvalidArgument(msg.into())
    }

    pub(crate) fn out_of_memory(allocator: &str, requested: usize) -> Self {
        AllocError::OutOfMemory {
            allocator: allocator.to_owned(),
            requested,
        }
    }
}

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Thread `{name}` panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("Cannot pin to core {core}: {reason}")]
    Affinity { core: usize, reason: String },

    #[error("Cannot query thread affinity: {0}")]
    AffinityQuery(std::io::Error),

    #[error("Thread affinity is not supported on this platform")]
    Unsupported,

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Thread pool is closed")]
    Closed,

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Thread(#[from] ThreadError),
}

/// Renders a panic payload the way `std` prints it.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
