use kinject_core::{InjectError, ProcessHandle, ProcessHost, ProcessId};

use crate::{Dependencies, module::ModuleTable};

/// Per-process bookkeeping.
#[derive(Debug)]
pub(crate) struct ProcessInjectionState {
    pub pid: ProcessId,
    pub loaded: Dependencies,
    pub modules: ModuleTable,
}

impl ProcessInjectionState {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            loaded: Dependencies::empty(),
            modules: ModuleTable::default(),
        }
    }

    /// Checks whether every required system module has been loaded.
    pub fn ready(&self, translated: bool, legacy_translated_gating: bool) -> bool {
        self.loaded
            .contains(Dependencies::required(translated, legacy_translated_gating))
    }
}

/// An entry of the process table.
///
/// While an image notification is handled, its state is out of the table
/// and the entry records the process events that arrive in the meantime.
#[derive(Debug)]
pub(crate) enum ProcessSlot {
    Idle(ProcessInjectionState),
    Busy {
        /// The process exited. The notification tears the state down.
        exited: bool,

        /// A new process with the same id was created after the exit.
        recreated: bool,
    },
}

impl ProcessSlot {
    /// Checks whether the entry refers to a running process.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            Self::Busy {
                exited: true,
                recreated: false
            }
        )
    }
}

/// An opened process, closed when dropped.
pub(crate) struct ProcessGuard<'a, Host>
where
    Host: ProcessHost,
{
    host: &'a Host,
    handle: ProcessHandle,
}

impl<'a, Host> ProcessGuard<'a, Host>
where
    Host: ProcessHost,
{
    pub fn open(host: &'a Host, pid: ProcessId) -> Result<Self, InjectError> {
        let handle = host.open_process(pid)?;
        Ok(Self { host, handle })
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }
}

impl<Host> Drop for ProcessGuard<'_, Host>
where
    Host: ProcessHost,
{
    fn drop(&mut self) {
        self.host.close_process(self.handle);
    }
}
