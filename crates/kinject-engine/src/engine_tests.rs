use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::{Rc, Weak},
    time::Duration,
};

use kinject_cipher::{Cipher, Key};
use kinject_core::{
    ApcDescriptor, ApcKind, ApcPrimitive, ImageLoader, ImageSource, InjectError, MappedImage,
    NotifyRegistration, ProcessHandle, ProcessHost, ProcessId, Protection, ThreadId, Va,
    VirtualMemory,
};

use crate::{
    DeliveryMode, Engine, EngineConfig, InjectionSource, InjectionTarget, KernelRoutineOutcome,
    MappingState, ProcessEvent, THUNK_WAITING,
};

///////////////////////////////////////////////////////////////////////////////
// Mock Host
///////////////////////////////////////////////////////////////////////////////

const PAGE_SIZE: u64 = 0x1000;
const THREAD: ThreadId = ThreadId(7);
const DISPATCHER: Va = Va(0x7700_1000);

#[derive(Default)]
struct MockState {
    next_page: u64,
    pages: HashMap<u64, Vec<u8>>,
    protections: HashMap<u64, Protection>,
    allocated: Vec<Va>,
    freed: Vec<Va>,
    fail_free: HashSet<u64>,
    allocation_attempts: usize,
    fail_allocation_at: Option<usize>,

    opened: usize,
    closed: usize,
    unavailable: HashSet<ProcessId>,
    translated: HashSet<ProcessId>,
    /// Delivered once, from inside the next `open_process`.
    events_on_open: Option<(Weak<Engine<MockHost>>, Vec<ProcessEvent<'static>>)>,

    images: HashMap<String, (MappedImage, Vec<Va>)>,
    payloads: Vec<(Vec<u8>, Option<Key>)>,
    freed_images: Vec<Va>,
    fail_loader: bool,

    inserted: Vec<ApcDescriptor>,
    refused: usize,
    refuse_insert: bool,
    terminating: HashSet<ThreadId>,
    delays: Vec<Duration>,

    process_notify: bool,
    image_notify: bool,
    fail_image_register: bool,
}

#[derive(Clone)]
struct MockHost {
    state: Rc<RefCell<MockState>>,
}

impl MockHost {
    fn new() -> Self {
        let state = MockState {
            next_page: 0x0010_0000,
            ..Default::default()
        };

        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Makes `key` resolvable by the loader.
    fn add_image(&self, key: &str, image: MappedImage, tls: Vec<Va>) {
        self.state
            .borrow_mut()
            .images
            .insert(key.to_owned(), (image, tls));
    }

    /// Simulates the trampoline storing the initializer result.
    fn complete(&self, data: Va, result: u32) {
        let mut state = self.state.borrow_mut();
        let page = state
            .pages
            .get_mut(&data.0)
            .unwrap_or_else(|| panic!("no page at {data}"));
        page[..4].copy_from_slice(&result.to_le_bytes());
    }

    fn page(&self, address: Va) -> Vec<u8> {
        self.state.borrow().pages[&address.0].clone()
    }

    fn inserted(&self) -> Vec<ApcDescriptor> {
        self.state.borrow().inserted.clone()
    }

    fn live_pages(&self) -> usize {
        self.state.borrow().pages.len()
    }
}

impl ProcessHost for MockHost {
    fn open_process(&self, pid: ProcessId) -> Result<ProcessHandle, InjectError> {
        let hook = self.state.borrow_mut().events_on_open.take();
        if let Some((engine, events)) = hook {
            if let Some(engine) = engine.upgrade() {
                for event in events {
                    engine.process_notify(event);
                }
            }
        }

        let mut state = self.state.borrow_mut();

        if state.unavailable.contains(&pid) {
            return Err(InjectError::ProcessUnavailable(pid));
        }

        state.opened += 1;
        Ok(ProcessHandle {
            raw: 0x8000_0000 | u64::from(pid.0),
            pid,
        })
    }

    fn close_process(&self, _process: ProcessHandle) {
        self.state.borrow_mut().closed += 1;
    }

    fn is_translated(&self, process: ProcessHandle) -> bool {
        self.state.borrow().translated.contains(&process.pid)
    }

    fn current_thread(&self) -> ThreadId {
        THREAD
    }
}

impl NotifyRegistration for MockHost {
    fn register_process_notify(&self) -> Result<(), InjectError> {
        self.state.borrow_mut().process_notify = true;
        Ok(())
    }

    fn unregister_process_notify(&self) {
        self.state.borrow_mut().process_notify = false;
    }

    fn register_image_notify(&self) -> Result<(), InjectError> {
        let mut state = self.state.borrow_mut();

        if state.fail_image_register {
            return Err(InjectError::Other("image notification unavailable"));
        }

        state.image_notify = true;
        Ok(())
    }

    fn unregister_image_notify(&self) {
        self.state.borrow_mut().image_notify = false;
    }
}

impl VirtualMemory for MockHost {
    fn allocate(
        &self,
        process: ProcessHandle,
        size: usize,
        protection: Protection,
    ) -> Result<Va, InjectError> {
        let mut state = self.state.borrow_mut();

        let attempt = state.allocation_attempts;
        state.allocation_attempts += 1;

        if state.fail_allocation_at == Some(attempt) {
            return Err(InjectError::Allocation {
                pid: process.pid,
                size,
            });
        }

        let base = state.next_page;
        state.next_page += PAGE_SIZE;
        state.pages.insert(base, vec![0; size]);
        state.protections.insert(base, protection);
        state.allocated.push(Va(base));

        Ok(Va(base))
    }

    fn protect(
        &self,
        process: ProcessHandle,
        address: Va,
        _size: usize,
        protection: Protection,
    ) -> Result<Protection, InjectError> {
        self.state
            .borrow_mut()
            .protections
            .insert(address.0, protection)
            .ok_or(InjectError::MemoryAccess {
                pid: process.pid,
                address,
            })
    }

    fn free(&self, process: ProcessHandle, address: Va) -> Result<(), InjectError> {
        let mut state = self.state.borrow_mut();

        if state.fail_free.contains(&address.0) || state.pages.remove(&address.0).is_none() {
            return Err(InjectError::MemoryAccess {
                pid: process.pid,
                address,
            });
        }

        state.protections.remove(&address.0);
        state.freed.push(address);
        Ok(())
    }

    fn read(
        &self,
        process: ProcessHandle,
        address: Va,
        buffer: &mut [u8],
    ) -> Result<(), InjectError> {
        let state = self.state.borrow();
        let base = address.0 & !(PAGE_SIZE - 1);
        let offset = (address.0 - base) as usize;

        let page = state.pages.get(&base).ok_or(InjectError::MemoryAccess {
            pid: process.pid,
            address,
        })?;

        buffer.copy_from_slice(&page[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write(&self, process: ProcessHandle, address: Va, data: &[u8]) -> Result<(), InjectError> {
        let mut state = self.state.borrow_mut();
        let base = address.0 & !(PAGE_SIZE - 1);
        let offset = (address.0 - base) as usize;

        let page = state
            .pages
            .get_mut(&base)
            .ok_or(InjectError::MemoryAccess {
                pid: process.pid,
                address,
            })?;

        page[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl ImageLoader for MockHost {
    fn find_or_map_image(
        &self,
        _process: ProcessHandle,
        source: ImageSource<'_>,
    ) -> Result<MappedImage, InjectError> {
        let mut state = self.state.borrow_mut();

        if state.fail_loader {
            return Err(InjectError::Other("image not found"));
        }

        let key = match source {
            ImageSource::Base(base) => format!("{:x}", base.0),
            ImageSource::Path(path) => path.to_owned(),
            ImageSource::Payload { data, key } => {
                state.payloads.push((data.to_vec(), key));
                String::from("payload")
            }
        };

        state
            .images
            .get(&key)
            .map(|(image, _)| image.clone())
            .ok_or(InjectError::Other("image not found"))
    }

    fn for_each_tls_initializer(
        &self,
        _process: ProcessHandle,
        image: &MappedImage,
        visit: &mut dyn FnMut(Va) -> Result<(), InjectError>,
    ) -> Result<(), InjectError> {
        let tls = self
            .state
            .borrow()
            .images
            .values()
            .find(|(candidate, _)| candidate.base == image.base)
            .map(|(_, tls)| tls.clone())
            .unwrap_or_default();

        for routine in tls {
            visit(routine)?;
        }

        Ok(())
    }

    fn free_image_memory(&self, image: &MappedImage) {
        self.state.borrow_mut().freed_images.push(image.base);
    }
}

impl ApcPrimitive for MockHost {
    fn insert(&self, descriptor: ApcDescriptor) -> Result<(), ApcDescriptor> {
        let mut state = self.state.borrow_mut();

        if state.refuse_insert {
            state.refused += 1;
            return Err(descriptor);
        }

        state.inserted.push(descriptor);
        Ok(())
    }

    fn is_thread_terminating(&self, thread: ThreadId) -> bool {
        self.state.borrow().terminating.contains(&thread)
    }

    fn wrap_translated(&self, routine: &mut Va, context: &mut Va) {
        *context = *routine;
        *routine = DISPATCHER;
    }

    fn alertable_delay(&self, delay: Duration) {
        self.state.borrow_mut().delays.push(delay);
    }
}

///////////////////////////////////////////////////////////////////////////////
// Helpers
///////////////////////////////////////////////////////////////////////////////

const PID: ProcessId = ProcessId(100);
const APP: &str = r"\Device\HarddiskVolume3\Program Files\App\App.exe";
const PAYLOAD: &str = r"C:\payload.dll";

const IMAGE_BASE: Va = Va(0x1800_0000);
const ENTRY_POINT: Va = Va(0x1800_1000);
const TLS: [Va; 2] = [Va(0x1800_2000), Va(0x1800_2100)];

const NATIVE: [&str; 3] = [
    r"\Device\HarddiskVolume3\Windows\System32\ntdll.dll",
    r"\Device\HarddiskVolume3\Windows\System32\kernel32.dll",
    r"\Device\HarddiskVolume3\Windows\System32\user32.dll",
];

const TRANSLATED: [&str; 5] = [
    r"\Device\HarddiskVolume3\Windows\System32\ntdll.dll",
    r"\Device\HarddiskVolume3\Windows\System32\wow64.dll",
    r"\Device\HarddiskVolume3\Windows\System32\wow64win.dll",
    r"\Device\HarddiskVolume3\Windows\System32\wow64cpu.dll",
    r"\Device\HarddiskVolume3\Windows\SysWOW64\ntdll.dll",
];

const KEY: Key = [0xA56B_ABCD, 0x0000_0000, 0xFFFF_FFFF, 0x1234_5678];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn payload_image(name: &str, base: Va, entry_point: Va) -> MappedImage {
    MappedImage {
        base,
        entry_point,
        size: 0x5000,
        name: name.into(),
    }
}

fn setup(config: EngineConfig) -> Result<(Engine<MockHost>, MockHost), InjectError> {
    init_tracing();

    let host = MockHost::new();
    host.add_image(
        PAYLOAD,
        payload_image("payload.dll", IMAGE_BASE, ENTRY_POINT),
        TLS.to_vec(),
    );

    let engine = Engine::initialize(host.clone(), config)?;
    Ok((engine, host))
}

fn queue_config() -> EngineConfig {
    EngineConfig::default().with_delivery(DeliveryMode::Queue)
}

fn load(engine: &Engine<MockHost>, pid: ProcessId, paths: &[&str]) {
    for path in paths {
        engine.image_notify(pid, Some(path));
    }
}

/// Registers the payload for `App.exe`, starts the process and loads its
/// dependencies.
fn start(engine: &Engine<MockHost>) -> Result<(), InjectError> {
    engine.register_injection(
        InjectionSource::Path(PAYLOAD.into()),
        InjectionTarget::Name("app.exe".into()),
    )?;

    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });

    load(engine, PID, &NATIVE);
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

///////////////////////////////////////////////////////////////////////////////
// Lifecycle
///////////////////////////////////////////////////////////////////////////////

#[test]
fn initialize_registers_both_notifications() -> Result<(), InjectError> {
    let (engine, host) = setup(EngineConfig::default())?;

    {
        let state = host.state.borrow();
        assert!(state.process_notify);
        assert!(state.image_notify);
    }

    engine.destroy();

    let state = host.state.borrow();
    assert!(!state.process_notify);
    assert!(!state.image_notify);

    Ok(())
}

#[test]
fn initialize_rolls_back_process_notification() {
    let host = MockHost::new();
    host.state.borrow_mut().fail_image_register = true;

    let result = Engine::initialize(host.clone(), EngineConfig::default());
    assert!(matches!(result, Err(InjectError::Other(_))));

    let state = host.state.borrow();
    assert!(!state.process_notify);
    assert!(!state.image_notify);
}

#[test]
fn destroy_releases_target_pages() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;
    engine.image_notify(PID, None);

    assert_eq!(host.live_pages(), 6);

    engine.destroy();

    let state = host.state.borrow();
    assert!(state.pages.is_empty());
    assert_eq!(state.freed_images, [IMAGE_BASE]);
    assert_eq!(state.opened, state.closed);

    Ok(())
}

#[test]
fn register_rejects_invalid_arguments() -> Result<(), InjectError> {
    let (engine, _host) = setup(EngineConfig::default())?;
    let name = || InjectionTarget::Name("app.exe".into());

    let invalid = [
        (InjectionSource::Base(Va(0)), name()),
        (InjectionSource::Path(String::new()), name()),
        (InjectionSource::Payload(Vec::new()), name()),
        (
            InjectionSource::Path(PAYLOAD.into()),
            InjectionTarget::Pid(ProcessId(0)),
        ),
        (
            InjectionSource::Path(PAYLOAD.into()),
            InjectionTarget::Name(String::new()),
        ),
    ];

    for (source, target) in invalid {
        assert!(matches!(
            engine.register_injection(source, target),
            Err(InjectError::InvalidParameter(_))
        ));
    }

    let id = engine.register_injection(InjectionSource::Path(PAYLOAD.into()), name())?;
    let status = engine.mapping_status(id).ok_or(InjectError::NotFound)?;
    assert_eq!(status.state, MappingState::Armed);
    assert_eq!(status.module, None);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Gating
///////////////////////////////////////////////////////////////////////////////

#[test]
fn injection_waits_for_dependencies() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;

    engine.register_injection(
        InjectionSource::Path(PAYLOAD.into()),
        InjectionTarget::Name("app.exe".into()),
    )?;
    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });
    assert_eq!(engine.tracked_processes(), [PID]);

    // Unrelated images and a partial set of dependencies do nothing.
    engine.image_notify(PID, Some(r"\Windows\System32\advapi32.dll"));
    load(&engine, PID, &NATIVE[..2]);
    engine.image_notify(PID, None);
    assert!(host.state.borrow().allocated.is_empty());

    // The notification completing the set only records it.
    load(&engine, PID, &NATIVE[2..]);
    assert!(host.state.borrow().allocated.is_empty());
    assert!(engine.module_status(PID, PAYLOAD).is_none());

    engine.image_notify(PID, None);
    assert_eq!(host.state.borrow().allocated.len(), 6);

    let status = engine
        .module_status(PID, PAYLOAD)
        .ok_or(InjectError::NotFound)?;
    assert_eq!(status.base, IMAGE_BASE);
    assert_eq!(status.pending_thunks, 3);
    assert!(!status.injected);

    Ok(())
}

#[test]
fn untracked_processes_are_ignored() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;

    engine.image_notify(ProcessId(555), Some(NATIVE[0]));
    engine.process_notify(ProcessEvent::Created {
        pid: ProcessId(556),
        image_path: r"\Windows\explorer.exe",
    });

    assert_eq!(engine.tracked_processes(), [PID]);
    assert!(host.state.borrow().allocated.is_empty());

    Ok(())
}

#[test]
fn legacy_gating_requires_user_libraries() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config().with_legacy_translated_gating(true))?;
    host.state.borrow_mut().translated.insert(PID);

    engine.register_injection(
        InjectionSource::Path(PAYLOAD.into()),
        InjectionTarget::Pid(PID),
    )?;
    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });

    load(&engine, PID, &TRANSLATED);
    engine.image_notify(PID, None);
    assert!(host.state.borrow().allocated.is_empty());

    load(
        &engine,
        PID,
        &[
            r"\Windows\System32\kernel32.dll",
            r"\Windows\SysWOW64\kernel32.dll",
            r"\Windows\System32\user32.dll",
            r"\Windows\SysWOW64\user32.dll",
        ],
    );
    engine.image_notify(PID, None);
    assert_eq!(host.state.borrow().allocated.len(), 6);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Thunks
///////////////////////////////////////////////////////////////////////////////

#[test]
fn thunks_drain_in_order() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;
    engine.image_notify(PID, None);

    let first = host.inserted();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].kind, ApcKind::User);
    assert_eq!(first[0].thread, THREAD);
    assert!(!first[0].translated);

    let mut expected_pending = 3;

    for (index, routine) in [TLS[0], TLS[1], ENTRY_POINT].into_iter().enumerate() {
        let descriptor = host.inserted()[index].clone();

        // Wide trampoline: `mov rbx, rcx`, the routine as imm64, plain ret.
        let code = host.page(descriptor.routine);
        assert!(contains(&code, &[0x48, 0x89, 0xCB]));
        assert!(contains(&code, &routine.0.to_le_bytes()));
        assert!(contains(&code, &IMAGE_BASE.0.to_le_bytes()));
        assert!(contains(&code, &descriptor.context.0.to_le_bytes()));

        {
            let state = host.state.borrow();
            assert_eq!(state.protections[&descriptor.routine.0], Protection::RX);
            assert_eq!(state.protections[&descriptor.context.0], Protection::RW);
        }

        let data = host.page(descriptor.context);
        assert_eq!(data[..4], THUNK_WAITING.to_le_bytes());

        host.complete(descriptor.context, 1);
        engine.image_notify(PID, None);
        expected_pending -= 1;

        let status = engine
            .module_status(PID, PAYLOAD)
            .ok_or(InjectError::NotFound)?;
        assert_eq!(status.pending_thunks, expected_pending);
        assert_eq!(status.injected, expected_pending == 0);

        let state = host.state.borrow();
        assert!(state.freed.contains(&descriptor.routine));
        assert!(state.freed.contains(&descriptor.context));
        assert_eq!(state.inserted.len(), (index + 2).min(3));
    }

    // Further notifications leave an injected module alone.
    engine.image_notify(PID, None);
    let state = host.state.borrow();
    assert_eq!(state.inserted.len(), 3);
    assert!(state.pages.is_empty());
    assert_eq!(state.opened, state.closed);

    Ok(())
}

#[test]
fn waiting_thunk_is_not_requeued() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;

    engine.image_notify(PID, None);
    engine.image_notify(PID, None);
    engine.image_notify(PID, Some(r"\Windows\System32\gdi32.dll"));

    assert_eq!(host.inserted().len(), 1);

    let status = engine
        .module_status(PID, PAYLOAD)
        .ok_or(InjectError::NotFound)?;
    assert_eq!(status.pending_thunks, 3);
    assert!(!status.injected);

    Ok(())
}

#[test]
fn failed_initializer_aborts_module() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;
    engine.image_notify(PID, None);

    let first = host.inserted()[0].clone();
    host.complete(first.context, 1);
    engine.image_notify(PID, None);

    let second = host.inserted()[1].clone();
    host.complete(second.context, 0);
    engine.image_notify(PID, None);

    // The entry point thunk is never queued.
    assert!(engine.module_status(PID, PAYLOAD).is_none());

    {
        let state = host.state.borrow();
        assert_eq!(state.inserted.len(), 2);
        assert!(state.pages.is_empty());
        assert_eq!(state.freed.len(), 6);
        assert_eq!(state.freed_images, [IMAGE_BASE]);
    }

    // Nothing is injected again while the process lives.
    engine.image_notify(PID, None);
    assert_eq!(host.state.borrow().allocated.len(), 6);
    assert_eq!(engine.tracked_processes(), [PID]);

    Ok(())
}

#[test]
fn failed_module_retires_mapping_until_exit() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;

    let mapping = engine.register_injection(
        InjectionSource::Path(PAYLOAD.into()),
        InjectionTarget::Name("app.exe".into()),
    )?;
    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });
    load(&engine, PID, &NATIVE);
    engine.image_notify(PID, None);

    let status = engine.mapping_status(mapping).ok_or(InjectError::NotFound)?;
    assert_eq!(status.state, MappingState::Validated(PID));
    assert!(status.module.is_some());

    let first = host.inserted()[0].clone();
    host.complete(first.context, 0);
    engine.image_notify(PID, None);

    let status = engine.mapping_status(mapping).ok_or(InjectError::NotFound)?;
    assert_eq!(status.state, MappingState::Retired(PID));
    assert_eq!(status.module, None);

    engine.process_notify(ProcessEvent::Exited { pid: PID });

    let status = engine.mapping_status(mapping).ok_or(InjectError::NotFound)?;
    assert_eq!(status.state, MappingState::Armed);

    Ok(())
}

#[test]
fn refused_delivery_is_retried() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;

    host.state.borrow_mut().refuse_insert = true;
    engine.image_notify(PID, None);

    {
        let state = host.state.borrow();
        assert_eq!(state.refused, 1);
        assert!(state.inserted.is_empty());
        assert_eq!(state.allocated.len(), 6);
    }

    host.state.borrow_mut().refuse_insert = false;
    engine.image_notify(PID, None);

    let state = host.state.borrow();
    assert_eq!(state.inserted.len(), 1);
    assert_eq!(state.allocated.len(), 6);

    Ok(())
}

#[test]
fn unreadable_data_page_aborts_module() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;
    engine.image_notify(PID, None);

    let first = host.inserted()[0].clone();
    host.state.borrow_mut().pages.remove(&first.context.0);

    engine.image_notify(PID, None);
    assert!(engine.module_status(PID, PAYLOAD).is_none());
    assert_eq!(host.live_pages(), 0);

    Ok(())
}

#[test]
fn image_without_initializers_is_injected_immediately() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    host.add_image(
        r"C:\resources.dll",
        payload_image("resources.dll", Va(0x2000_0000), Va(0)),
        Vec::new(),
    );

    engine.register_injection(
        InjectionSource::Path(r"C:\resources.dll".into()),
        InjectionTarget::Pid(PID),
    )?;
    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });
    load(&engine, PID, &NATIVE);
    engine.image_notify(PID, None);

    let status = engine
        .module_status(PID, r"c:\RESOURCES.dll")
        .ok_or(InjectError::NotFound)?;
    assert!(status.injected);
    assert_eq!(status.pending_thunks, 0);
    assert!(host.state.borrow().allocated.is_empty());
    assert!(host.inserted().is_empty());

    Ok(())
}

#[test]
fn base_source_uses_hex_module_name() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    host.add_image(
        "7ff612340000",
        payload_image("mapped.dll", Va(0x7FF6_1234_0000), Va(0x7FF6_1234_1000)),
        Vec::new(),
    );

    engine.register_injection(
        InjectionSource::Base(Va(0x7FF6_1234_0000)),
        InjectionTarget::Pid(PID),
    )?;
    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });
    load(&engine, PID, &NATIVE);
    engine.image_notify(PID, None);

    let status = engine
        .module_status(PID, "7ff612340000")
        .ok_or(InjectError::NotFound)?;
    assert_eq!(status.image_name, "mapped.dll");
    assert_eq!(status.pending_thunks, 1);

    Ok(())
}

#[test]
fn loader_failure_is_retried() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;

    host.state.borrow_mut().fail_loader = true;
    engine.image_notify(PID, None);
    assert!(engine.module_status(PID, PAYLOAD).is_none());

    host.state.borrow_mut().fail_loader = false;
    engine.image_notify(PID, None);
    assert!(engine.module_status(PID, PAYLOAD).is_some());

    Ok(())
}

#[test]
fn allocation_failure_releases_partial_thunks() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;

    // The data page of the second thunk cannot be allocated.
    host.state.borrow_mut().fail_allocation_at = Some(3);
    engine.image_notify(PID, None);

    assert!(engine.module_status(PID, PAYLOAD).is_none());

    let state = host.state.borrow();
    assert_eq!(state.allocated.len(), 3);
    assert_eq!(state.freed.len(), 3);
    assert!(state.pages.is_empty());
    assert_eq!(state.freed_images, [IMAGE_BASE]);
    assert!(state.inserted.is_empty());

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Mappings
///////////////////////////////////////////////////////////////////////////////

#[test]
fn name_mapping_rearms_after_exit() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;

    let mapping = engine.register_injection(
        InjectionSource::Path(PAYLOAD.into()),
        InjectionTarget::Name("app.exe".into()),
    )?;

    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });
    load(&engine, PID, &NATIVE);
    engine.image_notify(PID, None);

    engine.process_notify(ProcessEvent::Exited { pid: PID });

    let status = engine.mapping_status(mapping).ok_or(InjectError::NotFound)?;
    assert_eq!(status.state, MappingState::Armed);
    assert_eq!(status.module, None);
    assert!(engine.tracked_processes().is_empty());

    {
        let state = host.state.borrow();
        assert!(state.pages.is_empty());
        assert_eq!(state.freed_images, [IMAGE_BASE]);
        assert_eq!(state.opened, state.closed);
    }

    let next = ProcessId(200);
    engine.process_notify(ProcessEvent::Created {
        pid: next,
        image_path: r"\Device\HarddiskVolume3\Other\APP.EXE",
    });

    let status = engine.mapping_status(mapping).ok_or(InjectError::NotFound)?;
    assert_eq!(status.state, MappingState::Validated(next));
    assert_eq!(engine.tracked_processes(), [next]);

    Ok(())
}

#[test]
fn pid_mapping_expires_after_exit() -> Result<(), InjectError> {
    let (engine, _host) = setup(queue_config())?;

    let mapping = engine.register_injection(
        InjectionSource::Path(PAYLOAD.into()),
        InjectionTarget::Pid(ProcessId(300)),
    )?;

    engine.process_notify(ProcessEvent::Created {
        pid: ProcessId(299),
        image_path: APP,
    });
    assert!(engine.tracked_processes().is_empty());

    engine.process_notify(ProcessEvent::Created {
        pid: ProcessId(300),
        image_path: APP,
    });
    assert_eq!(
        engine.mapping_status(mapping).map(|status| status.state),
        Some(MappingState::Validated(ProcessId(300)))
    );

    engine.process_notify(ProcessEvent::Exited {
        pid: ProcessId(300),
    });
    engine.process_notify(ProcessEvent::Created {
        pid: ProcessId(300),
        image_path: APP,
    });

    assert_eq!(
        engine.mapping_status(mapping).map(|status| status.state),
        Some(MappingState::Expired)
    );
    assert!(engine.tracked_processes().is_empty());

    Ok(())
}

#[test]
fn mapping_limit_per_process() -> Result<(), InjectError> {
    let (engine, _host) = setup(queue_config().with_max_mappings_per_process(1))?;

    let first = engine.register_injection(
        InjectionSource::Path(PAYLOAD.into()),
        InjectionTarget::Name("app.exe".into()),
    )?;
    let second = engine.register_injection(
        InjectionSource::Path(r"C:\second.dll".into()),
        InjectionTarget::Name("app.exe".into()),
    )?;

    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });

    assert_eq!(
        engine.mapping_status(first).map(|status| status.state),
        Some(MappingState::Validated(PID))
    );
    assert_eq!(
        engine.mapping_status(second).map(|status| status.state),
        Some(MappingState::Armed)
    );

    Ok(())
}

#[test]
fn exit_of_unavailable_process_drops_state() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;
    engine.image_notify(PID, None);

    host.state.borrow_mut().unavailable.insert(PID);
    engine.process_notify(ProcessEvent::Exited { pid: PID });

    assert!(engine.tracked_processes().is_empty());

    let state = host.state.borrow();
    assert!(state.freed.is_empty());
    assert_eq!(state.pages.len(), 6);
    assert_eq!(state.opened, state.closed);

    Ok(())
}

#[test]
fn exit_during_image_notification_releases_state() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    let engine = Rc::new(engine);
    start(&engine)?;
    engine.image_notify(PID, None);
    assert_eq!(host.live_pages(), 6);

    host.state.borrow_mut().events_on_open = Some((
        Rc::downgrade(&engine),
        vec![ProcessEvent::Exited { pid: PID }],
    ));
    engine.image_notify(PID, None);

    assert!(engine.tracked_processes().is_empty());
    assert!(engine.module_status(PID, PAYLOAD).is_none());

    let state = host.state.borrow();
    assert!(state.events_on_open.is_none());
    assert!(state.pages.is_empty());
    assert_eq!(state.freed_images, [IMAGE_BASE]);
    assert_eq!(state.opened, state.closed);

    Ok(())
}

#[test]
fn process_recreated_during_image_notification_starts_fresh() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    let engine = Rc::new(engine);
    start(&engine)?;
    engine.image_notify(PID, None);

    host.state.borrow_mut().events_on_open = Some((
        Rc::downgrade(&engine),
        vec![
            ProcessEvent::Exited { pid: PID },
            ProcessEvent::Created {
                pid: PID,
                image_path: APP,
            },
        ],
    ));
    engine.image_notify(PID, None);

    // The old state is released, the new process starts untouched.
    assert_eq!(engine.tracked_processes(), [PID]);
    assert!(engine.module_status(PID, PAYLOAD).is_none());
    assert_eq!(host.live_pages(), 0);
    assert_eq!(host.state.borrow().freed_images, [IMAGE_BASE]);

    load(&engine, PID, &NATIVE);
    engine.image_notify(PID, None);

    assert_eq!(host.live_pages(), 6);
    assert!(engine.module_status(PID, PAYLOAD).is_some());

    Ok(())
}

#[test]
fn failed_page_release_does_not_stop_teardown() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    start(&engine)?;
    engine.image_notify(PID, None);

    let stuck = host.state.borrow().allocated[0];
    host.state.borrow_mut().fail_free.insert(stuck.0);

    engine.process_notify(ProcessEvent::Exited { pid: PID });

    assert!(engine.tracked_processes().is_empty());

    let state = host.state.borrow();
    assert_eq!(state.freed.len(), 5);
    assert!(!state.freed.contains(&stuck));
    assert_eq!(state.pages.len(), 1);
    assert_eq!(state.freed_images, [IMAGE_BASE]);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Delivery
///////////////////////////////////////////////////////////////////////////////

#[test]
fn force_delivery_chains_user_callback() -> Result<(), InjectError> {
    let (engine, host) = setup(EngineConfig::default())?;
    start(&engine)?;
    engine.image_notify(PID, None);

    let carrier = host.inserted()[0].clone();
    assert_eq!(carrier.kind, ApcKind::Force);

    assert_eq!(
        engine.run_kernel_routine(carrier.clone()),
        KernelRoutineOutcome::Forwarded
    );

    let user = host.inserted()[1].clone();
    assert_eq!(user.kind, ApcKind::User);
    assert_eq!(user.ticket, carrier.ticket);
    assert_eq!(user.routine, carrier.routine);
    assert_eq!(user.context, carrier.context);
    assert_eq!(host.state.borrow().delays, [Duration::from_millis(1)]);

    assert_eq!(
        engine.run_kernel_routine(user.clone()),
        KernelRoutineOutcome::Deliver {
            routine: carrier.routine,
            context: carrier.context,
        }
    );

    host.state.borrow_mut().terminating.insert(THREAD);
    assert_eq!(
        engine.run_kernel_routine(user),
        KernelRoutineOutcome::Suppressed
    );

    Ok(())
}

#[test]
fn force_delivery_waits_even_when_refused() -> Result<(), InjectError> {
    let config = EngineConfig::default().with_alertable_delay(Duration::from_micros(250));
    let (engine, host) = setup(config)?;
    start(&engine)?;
    engine.image_notify(PID, None);

    let carrier = host.inserted()[0].clone();
    host.state.borrow_mut().refuse_insert = true;

    assert_eq!(
        engine.run_kernel_routine(carrier),
        KernelRoutineOutcome::Forwarded
    );

    let state = host.state.borrow();
    assert_eq!(state.inserted.len(), 1);
    assert_eq!(state.delays, [Duration::from_micros(250)]);

    Ok(())
}

#[test]
fn translated_target_uses_narrow_thunks() -> Result<(), InjectError> {
    let (engine, host) = setup(queue_config())?;
    host.state.borrow_mut().translated.insert(PID);

    engine.register_injection(
        InjectionSource::Path(PAYLOAD.into()),
        InjectionTarget::Name("app.exe".into()),
    )?;
    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });

    // Native dependencies alone are not enough.
    load(&engine, PID, &NATIVE);
    engine.image_notify(PID, None);
    assert!(host.inserted().is_empty());

    load(&engine, PID, &TRANSLATED);
    engine.image_notify(PID, None);

    let descriptor = host.inserted()[0].clone();
    assert!(descriptor.translated);

    // Narrow trampoline: frame, context from the stack, `ret 12`.
    let code = host.page(descriptor.routine);
    assert_eq!(code[..3], [0x55, 0x8B, 0xEC]);
    assert!(contains(&code, &[0x8B, 0x5D, 0x08]));
    assert!(contains(&code, &[0xC2, 0x0C, 0x00]));
    assert!(contains(&code, &(TLS[0].0 as u32).to_le_bytes()));

    assert_eq!(
        engine.run_kernel_routine(descriptor.clone()),
        KernelRoutineOutcome::Deliver {
            routine: DISPATCHER,
            context: descriptor.routine,
        }
    );

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Payloads
///////////////////////////////////////////////////////////////////////////////

fn inject_payload(config: EngineConfig, plain: &[u8]) -> Result<MockHost, InjectError> {
    let (engine, host) = setup(config)?;
    host.add_image(
        "payload",
        payload_image("memory.dll", Va(0x3000_0000), Va(0x3000_1000)),
        Vec::new(),
    );

    let mapping = engine.register_injection(
        InjectionSource::Payload(plain.to_vec()),
        InjectionTarget::Name("app.exe".into()),
    )?;
    engine.process_notify(ProcessEvent::Created {
        pid: PID,
        image_path: APP,
    });
    load(&engine, PID, &NATIVE);
    engine.image_notify(PID, None);

    let name = format!("payload-{mapping}");
    let status = engine
        .module_status(PID, &name)
        .ok_or(InjectError::NotFound)?;
    assert_eq!(status.image_name, "memory.dll");

    Ok(host)
}

#[test]
fn payload_is_sealed_with_configured_key() -> Result<(), InjectError> {
    let plain = b"MZ\x90\x00\x03\x00\x00\x00 in-memory image".to_vec();
    let host = inject_payload(queue_config().with_payload_key(KEY), &plain)?;

    let state = host.state.borrow();
    let (sealed, key) = &state.payloads[0];

    assert_eq!(*key, Some(KEY));
    assert_ne!(sealed, &plain);
    assert_eq!(Cipher::new(KEY).decrypt(sealed, None)?, plain);

    Ok(())
}

#[test]
fn payload_without_key_is_passed_verbatim() -> Result<(), InjectError> {
    let plain = b"MZ\x90\x00 plain image".to_vec();
    let host = inject_payload(queue_config(), &plain)?;

    let state = host.state.borrow();
    assert_eq!(state.payloads[0], (plain, None));

    Ok(())
}
