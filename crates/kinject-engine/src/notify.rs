use kinject_core::ProcessId;

/// A process lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent<'a> {
    /// A process was created.
    Created {
        /// The new process.
        pid: ProcessId,

        /// Full path of the process image.
        image_path: &'a str,
    },

    /// A process exited.
    Exited {
        /// The exited process.
        pid: ProcessId,
    },
}

impl ProcessEvent<'_> {
    /// Returns the process the event refers to.
    pub fn pid(&self) -> ProcessId {
        match *self {
            Self::Created { pid, .. } | Self::Exited { pid } => pid,
        }
    }
}
