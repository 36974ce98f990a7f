use crate::{ProcessId, Va};

/// An error that can occur while injecting a module.
#[derive(thiserror::Error, Debug)]
pub enum InjectError {
    /// An error reported by the host environment.
    #[error(transparent)]
    Host(Box<dyn std::error::Error + Send + Sync>),

    /// An error reported by the image loader.
    #[error(transparent)]
    Loader(Box<dyn std::error::Error + Send + Sync>),

    /// An error occurred while generating a trampoline.
    #[error(transparent)]
    Codegen(Box<dyn std::error::Error + Send + Sync>),

    /// An error occurred while transforming a payload.
    #[error(transparent)]
    Cipher(Box<dyn std::error::Error + Send + Sync>),

    /// A caller supplied an invalid argument.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Memory could not be allocated in the target process.
    #[error("Failed to allocate {size:#x} bytes in process {pid}")]
    Allocation {
        /// The target process.
        pid: ProcessId,

        /// The requested size.
        size: usize,
    },

    /// Memory in the target process could not be accessed.
    #[error("Memory at {address} in process {pid} is not accessible")]
    MemoryAccess {
        /// The target process.
        pid: ProcessId,

        /// The address that was accessed.
        address: Va,
    },

    /// The target process cannot be opened.
    #[error("Process {0} is not available")]
    ProcessUnavailable(ProcessId),

    /// The delivery primitive refused to queue a callback.
    #[error("The delivery primitive is not capable of queueing the callback")]
    NotCapable,

    /// An initializer in the target process reported failure.
    #[error("Initializer at {routine} failed")]
    InitializerFailed {
        /// The initializer routine.
        routine: Va,
    },

    /// The given handle does not refer to a registered item.
    #[error("Handle not found")]
    NotFound,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl InjectError {
    /// Wraps a host-specific error.
    pub fn host(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Host(Box::new(err))
    }

    /// Wraps a loader-specific error.
    pub fn loader(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Loader(Box::new(err))
    }
}
