use std::collections::{BTreeMap, VecDeque};

use indexmap::IndexMap;
use kinject_core::{MappedImage, Va, path::CaseInsensitive};
use serde::{Deserialize, Serialize};

use crate::{MappingId, thunk::Thunk};

/// Identifier of an injected module.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ModuleId(pub u64);

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A module injected into one process.
#[derive(Debug)]
pub(crate) struct ModuleInfo {
    pub name: String,
    pub image: MappedImage,
    pub injected: bool,
    pub thunks: VecDeque<Thunk>,
    pub mapping: MappingId,
}

impl ModuleInfo {
    pub fn status(&self) -> ModuleStatus {
        ModuleStatus {
            name: self.name.clone(),
            image_name: self.image.name.clone(),
            base: self.image.base,
            entry_point: self.image.entry_point,
            size: self.image.size,
            injected: self.injected,
            pending_thunks: self.thunks.len(),
        }
    }
}

/// A snapshot of an injected module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStatus {
    /// Key the module is stored under.
    pub name: String,

    /// Name reported by the image loader.
    pub image_name: String,

    /// Base address of the image.
    pub base: Va,

    /// Entry point of the image, or zero.
    pub entry_point: Va,

    /// Size of the mapped image.
    pub size: u64,

    /// Whether every initializer has completed.
    pub injected: bool,

    /// Number of initializers not yet completed.
    pub pending_thunks: usize,
}

/// Modules of one process, looked up by handle or by name.
#[derive(Debug, Default)]
pub(crate) struct ModuleTable {
    modules: IndexMap<ModuleId, ModuleInfo>,
    names: BTreeMap<CaseInsensitive, ModuleId>,
}

impl ModuleTable {
    pub fn insert(&mut self, id: ModuleId, module: ModuleInfo) {
        self.names.insert(CaseInsensitive::from(module.name.as_str()), id);
        self.modules.insert(id, module);
    }

    pub fn find(&self, name: &str) -> Option<ModuleId> {
        self.names.get(&CaseInsensitive::from(name)).copied()
    }

    pub fn get(&self, id: ModuleId) -> Option<&ModuleInfo> {
        self.modules.get(&id)
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut ModuleInfo> {
        self.modules.get_mut(&id)
    }

    pub fn remove(&mut self, id: ModuleId) -> Option<ModuleInfo> {
        let module = self.modules.shift_remove(&id)?;
        self.names.remove(&CaseInsensitive::from(module.name.as_str()));
        Some(module)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (ModuleId, ModuleInfo)> + '_ {
        self.names.clear();
        self.modules.drain(..)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }
}
