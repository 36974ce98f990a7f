use std::{
    collections::{BTreeMap, VecDeque, btree_map::Entry},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::Poll,
};

use indexmap::IndexMap;
use kinject_core::{
    ApcDescriptor, Bitness, InjectError, InjectionHost, MappedImage, ProcessHandle, ProcessId,
    ThreadId,
};
use smallvec::SmallVec;

use crate::{
    Dependencies, EngineConfig, InjectionSource, InjectionTarget, KernelRoutineOutcome, MappingId,
    MappingState, MappingStatus, ModuleId, ModuleStatus, ProcessEvent,
    delivery::Delivery,
    mapping::{Mapping, StoredSource},
    module::ModuleInfo,
    process::{ProcessGuard, ProcessInjectionState, ProcessSlot},
    thunk::{Thunk, ThunkOutcome},
};

/// The process an image notification is being handled for.
#[derive(Debug, Clone, Copy)]
struct Target {
    process: ProcessHandle,
    bitness: Bitness,
    translated: bool,
    thread: ThreadId,
}

/// The injection engine.
///
/// The engine is driven entirely by host notifications. It owns no thread
/// and never blocks, except for the short alertable wait of the force
/// delivery path.
///
/// # Lifecycle
///
/// ```text
///   register_injection          process_notify(Created)
///          |                            |
///          v                            v
///       [Armed] ---- name/pid match --> [Validated(pid)]
///          ^                            |
///          |                            | image_notify (dependencies loaded)
///          |                            v
///          |                     inject module, queue thunks
///          |                            |
///          |            image_notify    | one thunk completes per call
///          |                            v
///          +---- process_notify(Exited) -- [injected] / [Retired(pid)]
/// ```
pub struct Engine<Host>
where
    Host: InjectionHost,
{
    host: Host,
    config: EngineConfig,
    delivery: Delivery,
    mappings: spin::Mutex<IndexMap<MappingId, Mapping>>,
    processes: spin::Mutex<BTreeMap<ProcessId, ProcessSlot>>,
    next_mapping: AtomicU64,
    next_module: AtomicU64,
}

impl<Host> Engine<Host>
where
    Host: InjectionHost,
{
    /// Creates the engine and registers both notification callbacks.
    ///
    /// The process notification is registered first. If the image
    /// notification cannot be registered, the process notification is
    /// unregistered again and the error is returned.
    pub fn initialize(host: Host, config: EngineConfig) -> Result<Self, InjectError> {
        host.register_process_notify()?;

        if let Err(err) = host.register_image_notify() {
            tracing::error!(%err, "failed to register image notification");
            host.unregister_process_notify();
            return Err(err);
        }

        tracing::info!(
            delivery = ?config.delivery,
            legacy_translated_gating = config.legacy_translated_gating,
            "engine initialized"
        );

        Ok(Self {
            delivery: Delivery::new(config.delivery, config.alertable_delay),
            host,
            config,
            mappings: spin::Mutex::new(IndexMap::new()),
            processes: spin::Mutex::new(BTreeMap::new()),
            next_mapping: AtomicU64::new(1),
            next_module: AtomicU64::new(1),
        })
    }

    /// Unregisters the notifications and releases every tracked process
    /// and mapping.
    pub fn destroy(self) {
        self.host.unregister_image_notify();
        self.host.unregister_process_notify();

        let processes = std::mem::take(&mut *self.processes.lock());
        for (_, slot) in processes {
            if let ProcessSlot::Idle(state) = slot {
                self.teardown_process(state);
            }
        }

        self.mappings.lock().clear();
        tracing::info!("engine destroyed");
    }

    /// Returns the host.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a rule injecting `source` into processes matching
    /// `target`.
    ///
    /// The rule takes effect for processes created after the call.
    pub fn register_injection(
        &self,
        source: InjectionSource,
        target: InjectionTarget,
    ) -> Result<MappingId, InjectError> {
        match &source {
            InjectionSource::Base(base) if base.is_null() => {
                return Err(InjectError::InvalidParameter("null image base"));
            }
            InjectionSource::Path(path) if path.is_empty() => {
                return Err(InjectError::InvalidParameter("empty image path"));
            }
            InjectionSource::Payload(data) if data.is_empty() => {
                return Err(InjectError::InvalidParameter("empty payload"));
            }
            _ => {}
        }

        match &target {
            InjectionTarget::Pid(pid) if pid.0 == 0 => {
                return Err(InjectError::InvalidParameter("null process id"));
            }
            InjectionTarget::Name(name) if name.is_empty() => {
                return Err(InjectError::InvalidParameter("empty process name"));
            }
            _ => {}
        }

        let mapping = Mapping::new(StoredSource::new(source, self.config.payload_key), target);
        let id = MappingId(self.next_mapping.fetch_add(1, Ordering::Relaxed));

        tracing::info!(mapping = %id, target = ?mapping.target, "injection registered");
        self.mappings.lock().insert(id, mapping);

        Ok(id)
    }

    /// Returns a snapshot of a mapping.
    pub fn mapping_status(&self, id: MappingId) -> Option<MappingStatus> {
        self.mappings.lock().get(&id).map(Mapping::status)
    }

    /// Returns the processes the engine tracks.
    pub fn tracked_processes(&self) -> Vec<ProcessId> {
        self.processes
            .lock()
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Returns a snapshot of the module stored under `name` in a process.
    pub fn module_status(&self, pid: ProcessId, name: &str) -> Option<ModuleStatus> {
        let processes = self.processes.lock();
        let Some(ProcessSlot::Idle(state)) = processes.get(&pid) else {
            return None;
        };
        let id = state.modules.find(name)?;
        state.modules.get(id).map(ModuleInfo::status)
    }

    /// Handles a callback descriptor that reached its delivery point.
    pub fn run_kernel_routine(&self, descriptor: ApcDescriptor) -> KernelRoutineOutcome {
        self.delivery.run_kernel_routine(&self.host, descriptor)
    }

    /// Handles a process creation or exit notification.
    #[tracing::instrument(skip_all, fields(pid = %event.pid()))]
    pub fn process_notify(&self, event: ProcessEvent<'_>) {
        match event {
            ProcessEvent::Created { pid, image_path } => self.process_created(pid, image_path),
            ProcessEvent::Exited { pid } => self.process_exited(pid),
        }
    }

    fn process_created(&self, pid: ProcessId, image_path: &str) {
        let mut validated = SmallVec::<[MappingId; 8]>::new();

        {
            let mut mappings = self.mappings.lock();

            for (id, mapping) in mappings.iter_mut() {
                if validated.len() >= self.config.max_mappings_per_process {
                    break;
                }

                if mapping.try_validate(pid, image_path) {
                    validated.push(*id);
                }
            }
        }

        if validated.is_empty() {
            return;
        }

        tracing::info!(image_path, mappings = ?validated.as_slice(), "mappings validated");

        match self.processes.lock().entry(pid) {
            Entry::Vacant(entry) => {
                entry.insert(ProcessSlot::Idle(ProcessInjectionState::new(pid)));
            }
            Entry::Occupied(mut entry) => match entry.get_mut() {
                // The previous process with this id exited while an image
                // notification held its state.
                ProcessSlot::Busy {
                    exited: true,
                    recreated,
                } => *recreated = true,
                _ => tracing::warn!("process is already tracked"),
            },
        }
    }

    fn process_exited(&self, pid: ProcessId) {
        let mut released = 0;
        for mapping in self.mappings.lock().values_mut() {
            if mapping.invalidate(pid) {
                released += 1;
            }
        }

        let slot = match self.processes.lock().entry(pid) {
            Entry::Vacant(_) => return,
            Entry::Occupied(mut entry) => {
                if let ProcessSlot::Busy { exited, recreated } = entry.get_mut() {
                    *exited = true;
                    *recreated = false;
                    tracing::debug!(released, "process exited during image notification");
                    return;
                }

                entry.remove()
            }
        };

        if let ProcessSlot::Idle(state) = slot {
            tracing::debug!(released, "process exited");
            self.teardown_process(state);
        }
    }

    /// Handles an image load notification in process `pid`.
    ///
    /// Until every required system module has been loaded, the notification
    /// only records dependencies. Afterwards each notification advances the
    /// injection of every mapping validated for the process.
    #[tracing::instrument(skip_all, fields(pid = %pid, image = image_path.unwrap_or_default()))]
    pub fn image_notify(&self, pid: ProcessId, image_path: Option<&str>) {
        // The state is out of the table while the notification is handled,
        // so no lock is held while calling into the host.
        let mut state = {
            let mut processes = self.processes.lock();
            let Some(slot) = processes.get_mut(&pid) else {
                return;
            };

            let busy = ProcessSlot::Busy {
                exited: false,
                recreated: false,
            };

            match std::mem::replace(slot, busy) {
                ProcessSlot::Idle(state) => state,
                busy => {
                    *slot = busy;
                    tracing::warn!("process is already being handled");
                    return;
                }
            }
        };

        self.handle_image(&mut state, image_path);

        let mut processes = self.processes.lock();
        let recreated = match processes.get(&pid) {
            Some(&ProcessSlot::Busy {
                exited: true,
                recreated,
            }) => recreated,
            _ => {
                processes.insert(pid, ProcessSlot::Idle(state));
                return;
            }
        };

        if recreated {
            processes.insert(pid, ProcessSlot::Idle(ProcessInjectionState::new(pid)));
        } else {
            processes.remove(&pid);
        }

        drop(processes);

        tracing::debug!("process exited during image notification");
        self.teardown_process(state);
    }

    fn handle_image(&self, state: &mut ProcessInjectionState, image_path: Option<&str>) {
        let process = match ProcessGuard::open(&self.host, state.pid) {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(%err, "failed to open process");
                return;
            }
        };

        let translated = self.host.is_translated(process.handle());

        if !state.ready(translated, self.config.legacy_translated_gating) {
            // Still initializing. Only record the system modules loaded
            // so far.
            if let Some(path) = image_path {
                let dependency = Dependencies::from_image_path(path);

                if !dependency.is_empty() {
                    state.loaded |= dependency;
                    tracing::debug!(?dependency, loaded = ?state.loaded, "dependency loaded");
                }
            }

            return;
        }

        let target = Target {
            process: process.handle(),
            bitness: if translated {
                Bitness::Narrow
            } else {
                Bitness::Wide
            },
            translated,
            thread: self.host.current_thread(),
        };

        let mappings: Vec<(MappingId, Arc<StoredSource>)> = self
            .mappings
            .lock()
            .iter()
            .filter(|(_, mapping)| mapping.state == MappingState::Validated(state.pid))
            .map(|(id, mapping)| (*id, Arc::clone(&mapping.source)))
            .collect();

        for (mapping, source) in mappings {
            let name = source.module_name(mapping);

            match state.modules.find(&name) {
                Some(module) => {
                    self.link(mapping, module);
                    self.advance(state, &target, mapping, module);
                }
                None => match self.inject(state, &target, mapping, &source, name) {
                    Ok(module) => self.link(mapping, module),
                    Err(err) => {
                        tracing::error!(%err, %mapping, "injection failed");
                    }
                },
            }
        }
    }

    /// Maps the image of a mapping and prepares a thunk for each of its
    /// initializers.
    fn inject(
        &self,
        state: &mut ProcessInjectionState,
        target: &Target,
        mapping: MappingId,
        source: &StoredSource,
        name: String,
    ) -> Result<ModuleId, InjectError> {
        let image = self
            .host
            .find_or_map_image(target.process, source.as_image_source())?;

        tracing::debug!(
            %mapping,
            name = %image.name,
            base = %image.base,
            entry_point = %image.entry_point,
            "image mapped"
        );

        let mut thunks = VecDeque::new();
        if let Err(err) = self.allocate_thunks(target, &image, &mut thunks) {
            for thunk in thunks {
                if let Err(err) = thunk.free(&self.host, target.process) {
                    tracing::warn!(%err, %mapping, "failed to release thunk");
                }
            }

            self.host.free_image_memory(&image);
            return Err(err);
        }

        let id = ModuleId(self.next_module.fetch_add(1, Ordering::Relaxed));
        let mut module = ModuleInfo {
            name,
            image,
            injected: false,
            thunks,
            mapping,
        };

        match module.thunks.front_mut() {
            Some(first) => self.queue(target, first),
            None => {
                tracing::info!(module = %id, name = %module.name, "module has no initializers");
                module.injected = true;
            }
        }

        state.modules.insert(id, module);
        Ok(id)
    }

    /// Creates thunks for the TLS initializers, in table order, followed by
    /// the entry point.
    fn allocate_thunks(
        &self,
        target: &Target,
        image: &MappedImage,
        thunks: &mut VecDeque<Thunk>,
    ) -> Result<(), InjectError> {
        self.host
            .for_each_tls_initializer(target.process, image, &mut |routine| {
                let thunk = Thunk::allocate(
                    &self.host,
                    target.process,
                    target.bitness,
                    routine,
                    image.base,
                )?;

                thunks.push_back(thunk);
                Ok(())
            })?;

        if !image.entry_point.is_null() {
            let thunk = Thunk::allocate(
                &self.host,
                target.process,
                target.bitness,
                image.entry_point,
                image.base,
            )?;

            thunks.push_back(thunk);
        }

        Ok(())
    }

    /// Drives the thunk queue of a module, tearing the module down if an
    /// initializer fails.
    fn advance(
        &self,
        state: &mut ProcessInjectionState,
        target: &Target,
        mapping: MappingId,
        id: ModuleId,
    ) {
        let Some(module) = state.modules.get_mut(id) else {
            return;
        };

        if module.injected {
            return;
        }

        let Err(err) = self.finalize(target, id, module) else {
            return;
        };

        tracing::error!(%err, module = %id, "injection aborted");

        if let Some(module) = state.modules.remove(id) {
            self.teardown_module(target.process, id, module);
        }

        self.retire(mapping, state.pid);
    }

    /// Completes at most one thunk and queues at most one.
    fn finalize(
        &self,
        target: &Target,
        id: ModuleId,
        module: &mut ModuleInfo,
    ) -> Result<Poll<()>, InjectError> {
        loop {
            let Some(thunk) = module.thunks.front_mut() else {
                module.injected = true;
                return Ok(Poll::Ready(()));
            };

            if !thunk.is_queued() {
                self.queue(target, thunk);
                return Ok(Poll::Pending);
            }

            let routine = thunk.routine();

            match thunk.try_poll(&self.host, target.process) {
                Poll::Pending => return Ok(Poll::Pending),
                Poll::Ready(Err(err)) => return Err(err),
                Poll::Ready(Ok(ThunkOutcome::Failed)) => {
                    return Err(InjectError::InitializerFailed { routine });
                }
                Poll::Ready(Ok(ThunkOutcome::Succeeded(result))) => {
                    tracing::debug!(module = %id, %routine, result, "initializer completed");

                    if let Some(thunk) = module.thunks.pop_front() {
                        if let Err(err) = thunk.free(&self.host, target.process) {
                            tracing::warn!(%err, module = %id, %routine, "failed to release thunk");
                        }
                    }

                    if module.thunks.is_empty() {
                        tracing::info!(module = %id, name = %module.name, "module injected");
                        module.injected = true;
                        return Ok(Poll::Ready(()));
                    }
                }
            }
        }
    }

    /// Hands a thunk to the delivery primitive.
    ///
    /// A refused thunk stays unqueued and is submitted again on the next
    /// notification.
    fn queue(&self, target: &Target, thunk: &mut Thunk) {
        let Some(data) = thunk.data() else {
            return;
        };

        match self.delivery.submit(
            &self.host,
            target.thread,
            thunk.code(),
            data,
            target.translated,
        ) {
            Ok(ticket) => thunk.mark_queued(ticket),
            Err(err) => {
                tracing::warn!(%err, code = %thunk.code(), "failed to queue thunk");
            }
        }
    }

    fn link(&self, mapping: MappingId, module: ModuleId) {
        if let Some(mapping) = self.mappings.lock().get_mut(&mapping) {
            mapping.module = Some(module);
        }
    }

    fn retire(&self, mapping: MappingId, pid: ProcessId) {
        if let Some(mapping) = self.mappings.lock().get_mut(&mapping) {
            mapping.state = MappingState::Retired(pid);
            mapping.module = None;
        }
    }

    /// Releases everything tracked for a process.
    ///
    /// When the process can no longer be opened, its pages cannot be freed
    /// and only the bookkeeping is dropped.
    fn teardown_process(&self, mut state: ProcessInjectionState) {
        let pid = state.pid;

        let process = match ProcessGuard::open(&self.host, pid) {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(%pid, %err, modules = state.modules.len(), "dropping process state");
                return;
            }
        };

        for (id, module) in state.modules.drain() {
            self.teardown_module(process.handle(), id, module);
        }

        tracing::debug!(%pid, "process state released");
    }

    fn teardown_module(&self, process: ProcessHandle, id: ModuleId, module: ModuleInfo) {
        let pending = module.thunks.len();

        for thunk in module.thunks {
            if let Err(err) = thunk.free(&self.host, process) {
                tracing::warn!(%err, module = %id, "failed to release thunk");
            }
        }

        self.host.free_image_memory(&module.image);
        tracing::debug!(
            module = %id,
            mapping = %module.mapping,
            name = %module.name,
            pending,
            "module released"
        );
    }
}
