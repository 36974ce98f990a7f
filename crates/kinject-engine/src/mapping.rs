use std::sync::Arc;

use kinject_cipher::{Cipher, Key};
use kinject_core::{ImageSource, ProcessId, Va, path::ends_with_ignore_case};
use serde::{Deserialize, Serialize};

use crate::ModuleId;

/// Handle of a registered mapping.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MappingId(pub u64);

impl std::fmt::Display for MappingId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The image a mapping injects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionSource {
    /// An image already present in the target at the given base.
    Base(Va),

    /// An image file.
    Path(String),

    /// An in-memory image.
    Payload(Vec<u8>),
}

/// The process a mapping injects into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionTarget {
    /// A specific process.
    Pid(ProcessId),

    /// Any process whose image path ends with the name, ignoring case.
    Name(String),
}

/// Lifecycle of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// Waiting for a matching process to be created.
    Armed,

    /// Matched the given process.
    Validated(ProcessId),

    /// An initializer failed in the given process. The mapping is not
    /// retried until that process exits.
    Retired(ProcessId),

    /// The targeted process exited. Process identifiers are reused, so a
    /// process-targeted mapping never matches again.
    Expired,
}

impl MappingState {
    /// Returns the process the mapping is bound to.
    pub fn pid(self) -> Option<ProcessId> {
        match self {
            Self::Validated(pid) | Self::Retired(pid) => Some(pid),
            Self::Armed | Self::Expired => None,
        }
    }
}

/// A snapshot of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingStatus {
    /// Current state.
    pub state: MappingState,

    /// Module created for the bound process.
    pub module: Option<ModuleId>,
}

/// The stored form of an [`InjectionSource`].
#[derive(Debug)]
pub(crate) enum StoredSource {
    Base(Va),
    Path(String),
    Payload { data: Vec<u8>, key: Option<Key> },
}

impl StoredSource {
    /// Converts the source, sealing payloads when a key is given.
    pub fn new(source: InjectionSource, key: Option<Key>) -> Self {
        match source {
            InjectionSource::Base(base) => Self::Base(base),
            InjectionSource::Path(path) => Self::Path(path),
            InjectionSource::Payload(data) => match key {
                Some(key) => Self::Payload {
                    data: Cipher::new(key).encrypt(&data, None),
                    key: Some(key),
                },
                None => Self::Payload { data, key: None },
            },
        }
    }

    /// Returns the module table key of the source.
    pub fn module_name(&self, mapping: MappingId) -> String {
        match self {
            Self::Base(base) => format!("{:x}", base.0),
            Self::Path(path) => path.clone(),
            Self::Payload { .. } => format!("payload-{mapping}"),
        }
    }

    pub fn as_image_source(&self) -> ImageSource<'_> {
        match self {
            Self::Base(base) => ImageSource::Base(*base),
            Self::Path(path) => ImageSource::Path(path),
            Self::Payload { data, key } => ImageSource::Payload { data, key: *key },
        }
    }
}

/// A registered "inject source into target" rule.
#[derive(Debug)]
pub(crate) struct Mapping {
    pub source: Arc<StoredSource>,
    pub target: InjectionTarget,
    pub state: MappingState,
    pub module: Option<ModuleId>,
}

impl Mapping {
    pub fn new(source: StoredSource, target: InjectionTarget) -> Self {
        Self {
            source: Arc::new(source),
            target,
            state: MappingState::Armed,
            module: None,
        }
    }

    pub fn status(&self) -> MappingStatus {
        MappingStatus {
            state: self.state,
            module: self.module,
        }
    }

    /// Checks whether a newly created process matches, and validates the
    /// mapping if it does.
    pub fn try_validate(&mut self, pid: ProcessId, image_path: &str) -> bool {
        if self.state != MappingState::Armed {
            return false;
        }

        let matches = match &self.target {
            InjectionTarget::Pid(target) => *target == pid,
            InjectionTarget::Name(name) => ends_with_ignore_case(image_path, name),
        };

        if matches {
            self.state = MappingState::Validated(pid);
        }

        matches
    }

    /// Unbinds the mapping from an exited process.
    pub fn invalidate(&mut self, pid: ProcessId) -> bool {
        if self.state.pid() != Some(pid) {
            return false;
        }

        self.state = match self.target {
            InjectionTarget::Pid(_) => MappingState::Expired,
            InjectionTarget::Name(_) => MappingState::Armed,
        };
        self.module = None;
        true
    }
}
